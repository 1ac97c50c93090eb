use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use storagecrypt_core::{DEFAULT_FILE_MIME_TYPE, FOLDER_MIME_TYPE, now_millis};

use super::documents::DocumentSyncEngine;
use crate::crypto::ensure_keys;
use crate::error::SyncError;
use crate::model::{DocumentInput, EncryptedDocument, SyncAction, SyncState};
use crate::paths::{BlobStore, remove_if_exists};

impl DocumentSyncEngine {
    /// Copies local files and folders under `parent_id` as plaintext
    /// replicas. Under a synchronized parent their upload is planned.
    /// Returns the ids of every created row, parents first.
    pub async fn import_documents(
        &self,
        parent_id: i64,
        roots: &[PathBuf],
    ) -> Result<Vec<i64>, SyncError> {
        let parent = self.index.require_document(parent_id).await?;
        if !parent.is_folder {
            return Err(SyncError::NotAFolder(parent_id));
        }
        if parent.is_synchronized() {
            ensure_keys(self.keys.as_ref(), &self.key_alias)?;
        }
        self.blobs.ensure_dirs().await?;

        let mut created = Vec::new();
        if let Err(err) = self.import_tree(parent_id, roots, &mut created).await {
            self.discard(&created).await;
            return Err(err);
        }

        if !parent.is_synchronized() {
            tracing::info!(parent_id, imported = created.len(), "local files imported");
            return Ok(created);
        }
        for id in &created {
            self.index
                .update_sync_state(*id, SyncAction::Upload, SyncState::Planned)
                .await?;
        }
        let queued = self.queue.enqueue_all(created.iter().copied());
        tracing::info!(parent_id, imported = created.len(), queued, "local files imported");
        Ok(created)
    }

    async fn import_tree(
        &self,
        parent_id: i64,
        roots: &[PathBuf],
        created: &mut Vec<i64>,
    ) -> Result<(), SyncError> {
        let mut stack: Vec<(i64, PathBuf)> = roots
            .iter()
            .rev()
            .map(|path| (parent_id, path.clone()))
            .collect();
        while let Some((parent_id, path)) = stack.pop() {
            let parent = self.index.require_document(parent_id).await?;
            let metadata = tokio::fs::metadata(&path).await?;
            let document = self
                .import_entry(&parent, &path, metadata.is_dir())
                .await?;
            created.push(document.id);
            if metadata.is_dir() {
                let mut children = Vec::new();
                let mut entries = tokio::fs::read_dir(&path).await?;
                while let Some(entry) = entries.next_entry().await? {
                    children.push(entry.path());
                }
                children.sort();
                stack.extend(children.into_iter().rev().map(|child| (document.id, child)));
            } else {
                let modified = metadata
                    .modified()
                    .ok()
                    .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
                    .and_then(|elapsed| i64::try_from(elapsed.as_millis()).ok())
                    .unwrap_or_else(now_millis);
                self.copy_in(&document, &path, modified).await?;
            }
        }
        Ok(())
    }

    /// Drops rows and blobs of an import that did not complete.
    async fn discard(&self, created: &[i64]) {
        for id in created.iter().rev() {
            if let Ok(path) = self.blobs.blob_path(&BlobStore::blob_name_for(*id)) {
                if let Err(err) = remove_if_exists(&path).await {
                    tracing::warn!(document_id = *id, "failed to remove imported blob: {err}");
                }
            }
            if let Err(err) = self.index.delete_document(*id).await {
                tracing::warn!(document_id = *id, "failed to drop imported row: {err}");
            }
        }
    }

    async fn import_entry(
        &self,
        parent: &EncryptedDocument,
        path: &Path,
        is_folder: bool,
    ) -> Result<EncryptedDocument, SyncError> {
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| SyncError::UnsupportedPath(path.to_path_buf()))?;
        let mime_type = if is_folder {
            FOLDER_MIME_TYPE
        } else {
            DEFAULT_FILE_MIME_TYPE
        };
        let mut input = DocumentInput::new(
            name,
            mime_type,
            is_folder,
            parent.back_storage_type,
            parent.back_storage_account,
        )
        .with_parent(parent.id);
        if parent.is_synchronized() {
            input.key_alias = Some(self.key_alias.clone());
            input.upload_state = SyncState::Queued;
        }
        Ok(self.index.insert_document(&input).await?)
    }

    async fn copy_in(
        &self,
        document: &EncryptedDocument,
        source: &Path,
        modified: i64,
    ) -> Result<(), SyncError> {
        let blob = BlobStore::blob_name_for(document.id);
        let target = self.blobs.blob_path(&blob)?;
        let size = tokio::fs::copy(source, &target).await?;
        self.index
            .update_local_file(
                document.id,
                Some(&blob),
                Some(i64::try_from(size).unwrap_or(i64::MAX)),
                Some(modified),
            )
            .await?;
        Ok(())
    }
}
