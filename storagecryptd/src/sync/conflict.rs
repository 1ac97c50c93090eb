use storagecrypt_core::RemoteEntry;

use crate::model::EncryptedDocument;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictDecision {
    UploadLocal,
    KeepRemote,
}

/// Whether `remote` carries content the document has not seen yet.
///
/// Versions are compared when both sides have one, modification times
/// otherwise. An entry the document never recorded always counts.
pub fn remote_advanced(document: &EncryptedDocument, remote: &RemoteEntry) -> bool {
    if document.back_entry_id.as_deref() != Some(remote.id.as_str()) {
        return true;
    }
    match (document.back_entry_version, remote.version) {
        (Some(stored), Some(version)) => version > stored,
        _ => match (document.remote_modification_time, remote.modified) {
            (Some(stored), Some(modified)) => modified > stored,
            (None, Some(_)) => true,
            _ => false,
        },
    }
}

/// Last writer wins between a pending local upload and the remote entry.
/// Ties go to the local copy; contents are never merged.
pub fn resolve_upload(document: &EncryptedDocument, remote: &RemoteEntry) -> ConflictDecision {
    if document.back_entry_id.is_none() || !remote_advanced(document, remote) {
        return ConflictDecision::UploadLocal;
    }
    match (remote.modified, document.local_modification_time) {
        (Some(remote_time), Some(local_time)) if remote_time > local_time => {
            ConflictDecision::KeepRemote
        }
        (Some(_), None) => ConflictDecision::KeepRemote,
        _ => ConflictDecision::UploadLocal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SyncState;
    use storagecrypt_core::StorageType;

    fn document(version: Option<i64>, remote_time: Option<i64>, local_time: Option<i64>) -> EncryptedDocument {
        EncryptedDocument {
            id: 1,
            display_name: "a.txt".into(),
            mime_type: "text/plain".into(),
            is_folder: false,
            parent_id: Some(0),
            local_file_name: Some("doc-1".into()),
            size: Some(1),
            key_alias: None,
            local_modification_time: local_time,
            remote_modification_time: remote_time,
            back_storage_type: StorageType::Drive,
            back_storage_account: Some(1),
            back_entry_id: Some("r1".into()),
            back_entry_version: version,
            back_entry_folder_id: None,
            back_entry_folder_last_subfolder_id: None,
            upload_state: SyncState::Planned,
            download_state: SyncState::Done,
            deletion_state: SyncState::Done,
            num_sync_failures: 0,
            last_sync_failure_time: None,
            last_sync_failure_reason: None,
        }
    }

    fn remote(version: Option<i64>, modified: Option<i64>) -> RemoteEntry {
        RemoteEntry {
            id: "r1".into(),
            name: "a.txt".into(),
            mime_type: "text/plain".into(),
            is_folder: false,
            parent_id: None,
            size: Some(1),
            version,
            modified,
            hash: None,
        }
    }

    #[test]
    fn version_decides_when_both_sides_have_one() {
        let doc = document(Some(3), Some(900), None);
        assert!(!remote_advanced(&doc, &remote(Some(3), Some(1_000))));
        assert!(remote_advanced(&doc, &remote(Some(4), Some(100))));
    }

    #[test]
    fn modification_time_is_the_fallback() {
        let doc = document(None, Some(900), None);
        assert!(remote_advanced(&doc, &remote(None, Some(901))));
        assert!(!remote_advanced(&doc, &remote(None, Some(900))));
    }

    #[test]
    fn different_entry_id_is_always_new() {
        let doc = document(Some(9), Some(900), None);
        let mut other = remote(Some(1), Some(1));
        other.id = "r2".into();
        assert!(remote_advanced(&doc, &other));
    }

    #[test]
    fn newer_remote_edit_beats_pending_upload() {
        let doc = document(Some(1), Some(100), Some(500));
        assert_eq!(
            resolve_upload(&doc, &remote(Some(2), Some(600))),
            ConflictDecision::KeepRemote
        );
        assert_eq!(
            resolve_upload(&doc, &remote(Some(2), Some(400))),
            ConflictDecision::UploadLocal
        );
    }

    #[test]
    fn unchanged_remote_is_overwritten() {
        let doc = document(Some(1), Some(100), Some(50));
        assert_eq!(
            resolve_upload(&doc, &remote(Some(1), Some(100))),
            ConflictDecision::UploadLocal
        );
    }
}
