use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::StorageError;
use crate::model::{RemoteChange, RemoteChanges, RemoteEntry};
use crate::progress::{Phase, SharedListener, checkpoint};
use crate::storage::DocumentRef;

/// Breadth-first walk below `root`; parents always precede their children.
pub async fn scan_tree(
    root: DocumentRef,
    listener: &SharedListener,
) -> Result<Vec<RemoteEntry>, StorageError> {
    let mut pending = VecDeque::from([root]);
    let mut entries = Vec::new();
    while let Some(folder) = pending.pop_front() {
        checkpoint(listener.as_ref()).await?;
        for child in folder.child_documents(listener).await? {
            entries.push(child.entry().clone());
            if child.entry().is_folder {
                pending.push_back(child);
            }
        }
        listener.on_progress(Phase::Listing, entries.len() as u64);
    }
    Ok(entries)
}

/// Turns a full scan into a change set for providers without a delta feed.
///
/// Only entries modified after `since` are reported, together with the
/// folders above them so parents still precede children. `scanned_ids`
/// lists everything the scan saw, which is how deletions are detected.
/// The cursor is the newest modification time seen and never drops below
/// `since`.
pub fn snapshot_changes(entries: Vec<RemoteEntry>, since: Option<&str>) -> RemoteChanges {
    let since = since.and_then(|cursor| cursor.parse::<i64>().ok());
    let newest = entries.iter().filter_map(|entry| entry.modified).max();
    let cursor = match (since, newest) {
        (Some(since), Some(newest)) => since.max(newest),
        (since, newest) => since.or(newest).unwrap_or(0),
    };
    let scanned_ids: HashSet<String> = entries.iter().map(|entry| entry.id.clone()).collect();

    let changes = match since {
        None => entries.into_iter().map(RemoteChange::Modification).collect(),
        Some(since) => {
            let parents: HashMap<&str, &str> = entries
                .iter()
                .filter_map(|entry| Some((entry.id.as_str(), entry.parent_id.as_deref()?)))
                .collect();
            let mut wanted: HashSet<String> = HashSet::new();
            for entry in entries.iter().filter(|e| e.modified.is_some_and(|m| m > since)) {
                let mut id = entry.id.as_str();
                while wanted.insert(id.to_string()) {
                    match parents.get(id) {
                        Some(parent) if scanned_ids.contains(*parent) => id = *parent,
                        _ => break,
                    }
                }
            }
            entries
                .into_iter()
                .filter(|entry| wanted.contains(&entry.id))
                .map(RemoteChange::Modification)
                .collect()
        }
    };
    RemoteChanges {
        changes,
        cursor: Some(cursor.to_string()),
        scanned_ids: Some(scanned_ids),
    }
}
