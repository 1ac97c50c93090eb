use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use storagecrypt_core::{
    Reason, RemoteEntry, SharedListener, StorageError, SyncControl, ignore_not_found, now_millis,
};

use super::classify::{Disposition, classify, counts_as_failure};
use super::conflict::{ConflictDecision, resolve_upload};
use super::events::{EventBus, SyncEvent};
use super::queue::WorkQueue;
use super::report::{Outcome, SyncReport};
use crate::accounts::AccountManager;
use crate::backoff::Backoff;
use crate::crypto::{self, KeyStore, SecretKeys};
use crate::error::SyncError;
use crate::index::{IndexError, IndexStore};
use crate::model::{EncryptedDocument, SyncAction, SyncState};
use crate::paths::{BlobStore, remove_if_exists};

const UPLOAD_SUFFIX: &str = "up";
const DOWNLOAD_SUFFIX: &str = "down";

/// Result of one action that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Done,
    /// The row is gone.
    Removed,
    /// Waits for the parent folder to get a remote id.
    Deferred,
}

enum UploadOutcome {
    Uploaded(RemoteEntry),
    RemoteNewer(RemoteEntry),
    ParentMissing,
}

/// Drains documents with planned actions through a pool of workers.
///
/// A document is handled by one worker at a time and runs its actions one
/// after the other in priority order, so two actions of the same document
/// are never Running together.
pub struct DocumentSyncEngine {
    pub(super) index: IndexStore,
    pub(super) accounts: Arc<AccountManager>,
    pub(super) keys: Arc<dyn KeyStore>,
    pub(super) blobs: BlobStore,
    pub(super) key_alias: String,
    events: EventBus,
    pub(super) queue: Arc<WorkQueue<i64>>,
    control: SyncControl,
    running: Mutex<HashMap<i64, SyncControl>>,
    retry: Backoff,
    max_failures: i64,
    report: Mutex<SyncReport>,
    last_report: Mutex<Option<SyncReport>>,
}

impl DocumentSyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: IndexStore,
        accounts: Arc<AccountManager>,
        keys: Arc<dyn KeyStore>,
        blobs: BlobStore,
        key_alias: impl Into<String>,
        events: EventBus,
        control: SyncControl,
        max_failures: i64,
    ) -> Self {
        Self {
            index,
            accounts,
            keys,
            blobs,
            key_alias: key_alias.into(),
            events,
            queue: Arc::new(WorkQueue::new()),
            control,
            running: Mutex::new(HashMap::new()),
            retry: Backoff::new(Duration::from_secs(2), Duration::from_secs(300), true),
            max_failures,
            report: Mutex::new(SyncReport::default()),
            last_report: Mutex::new(None),
        }
    }

    pub fn with_retry_backoff(mut self, retry: Backoff) -> Self {
        self.retry = retry;
        self
    }

    pub fn enqueue(&self, document_id: i64) -> bool {
        self.queue.enqueue(document_id)
    }

    pub fn enqueue_documents<I: IntoIterator<Item = i64>>(&self, ids: I) -> usize {
        self.queue.enqueue_all(ids)
    }

    /// Queues every document of the account that has pending work.
    pub async fn enqueue_account(&self, account_id: i64) -> Result<usize, SyncError> {
        let pending = self.index.list_pending(Some(account_id)).await?;
        Ok(self.queue.enqueue_all(pending.into_iter().map(|d| d.id)))
    }

    pub async fn enqueue_all(&self) -> Result<usize, SyncError> {
        let pending = self.index.list_pending(None).await?;
        Ok(self.queue.enqueue_all(pending.into_iter().map(|d| d.id)))
    }

    /// Puts actions left Running by an interrupted pass back to Planned and
    /// queues everything pending.
    pub async fn recover(&self) -> Result<usize, SyncError> {
        let reset = self.index.reset_running_states().await?;
        if !reset.is_empty() {
            tracing::info!(count = reset.len(), "replanned interrupted actions");
        }
        self.enqueue_all().await
    }

    /// Aborts the action running for the document, if any. The worker moves
    /// it back to Planned and queues the document again.
    pub fn restart_current_sync(&self, document_id: i64) -> bool {
        let running = self.running_lock();
        match running.get(&document_id) {
            Some(control) => {
                control.cancel();
                tracing::debug!(document_id, "restarting running action");
                true
            }
            None => false,
        }
    }

    /// Plans removal of the document here and on its provider.
    pub async fn request_deletion(&self, document_id: i64) -> Result<(), SyncError> {
        let document = self.index.require_document(document_id).await?;
        if !document.deletion_state.is_pending() {
            self.index
                .update_sync_state(document_id, SyncAction::Deletion, SyncState::Planned)
                .await?;
        }
        self.restart_current_sync(document_id);
        self.enqueue(document_id);
        Ok(())
    }

    pub async fn plan_upload(&self, document_id: i64) -> Result<bool, SyncError> {
        self.plan_action(document_id, SyncAction::Upload).await
    }

    pub async fn plan_download(&self, document_id: i64) -> Result<bool, SyncError> {
        self.plan_action(document_id, SyncAction::Download).await
    }

    /// Returns `false` when the action was already planned or running.
    async fn plan_action(&self, document_id: i64, action: SyncAction) -> Result<bool, SyncError> {
        let document = self.index.require_document(document_id).await?;
        if document.state(action).is_pending() {
            self.enqueue(document_id);
            return Ok(false);
        }
        self.index
            .update_sync_state(document_id, action, SyncState::Planned)
            .await?;
        self.enqueue(document_id);
        Ok(true)
    }

    /// Moves every Failed action of the document back to Planned.
    pub async fn replan_failed(&self, document_id: i64) -> Result<usize, SyncError> {
        let document = self.index.require_document(document_id).await?;
        let mut replanned = 0;
        for action in SyncAction::PRIORITY {
            if document.state(action) == SyncState::Failed {
                self.index
                    .update_sync_state(document_id, action, SyncState::Planned)
                    .await?;
                replanned += 1;
            }
        }
        if replanned > 0 {
            self.index.reset_sync_failures(document_id).await?;
            self.enqueue(document_id);
        }
        Ok(replanned)
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_idle()
    }

    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await;
    }

    pub fn last_report(&self) -> Option<SyncReport> {
        self.last_report
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub async fn run_worker(self: Arc<Self>) {
        while let Some(document_id) = self.queue.next(&self.control).await {
            let result = self.process(document_id).await;
            self.queue.finish(&document_id);
            if let Err(err) = result {
                if err.is_connection_closed() {
                    let dropped = self.queue.clear();
                    tracing::warn!(dropped, "index closed, abandoning sync pass");
                } else {
                    tracing::error!(document_id, "sync bookkeeping failed: {err}");
                }
            }
            if self.queue.is_idle() {
                self.finish_run();
            }
        }
    }

    /// Publishes the report collected since the last run, if any.
    pub fn finish_run(&self) -> Option<SyncReport> {
        let report = {
            let mut current = self.report.lock().unwrap_or_else(|e| e.into_inner());
            if current.is_empty() {
                return None;
            }
            let report = std::mem::take(&mut *current);
            *self.last_report.lock().unwrap_or_else(|e| e.into_inner()) = Some(report.clone());
            report
        };
        tracing::info!("sync run finished: {}", report.summary());
        self.events.publish(SyncEvent::RunFinished(report.clone()));
        Some(report)
    }

    /// Runs the next planned action of one document.
    pub async fn process(&self, document_id: i64) -> Result<(), SyncError> {
        let Some(document) = self.index.get_document(document_id).await? else {
            return Ok(());
        };
        let Some(action) = document.next_action() else {
            return Ok(());
        };
        let control = self.control.child();
        self.running_lock().insert(document_id, control.clone());
        let started = self
            .index
            .update_sync_state(document_id, action, SyncState::Running)
            .await;
        if let Err(err) = started {
            self.running_lock().remove(&document_id);
            return Err(err.into());
        }
        self.events.publish(SyncEvent::ActionStarted {
            action,
            document_id,
        });
        tracing::debug!(document_id, action = action.as_str(), "action started");

        let result = match action {
            SyncAction::Upload => self.upload(&document, &control).await,
            SyncAction::Download => self.download(&document, &control).await,
            SyncAction::Deletion => self.delete(&document, &control).await,
        };
        self.running_lock().remove(&document_id);

        match self.settle(&document, action, result).await {
            Err(SyncError::Index(IndexError::DocumentNotFound(_))) => Ok(()),
            other => other,
        }
    }

    async fn settle(
        &self,
        document: &EncryptedDocument,
        action: SyncAction,
        result: Result<Step, SyncError>,
    ) -> Result<(), SyncError> {
        let id = document.id;
        let err = match result {
            Ok(Step::Removed) => {
                self.record(document, action, Outcome::Success);
                self.events.publish(SyncEvent::DocumentRemoved { document_id: id });
                return Ok(());
            }
            Ok(Step::Done) => {
                self.index
                    .update_sync_state(id, action, SyncState::Done)
                    .await?;
                self.index.reset_sync_failures(id).await?;
                self.record(document, action, Outcome::Success);
                tracing::debug!(document_id = id, action = action.as_str(), "action done");
                return self.after_change(id, action).await;
            }
            Ok(Step::Deferred) => {
                self.index
                    .update_sync_state(id, action, SyncState::Planned)
                    .await?;
                self.record(
                    document,
                    action,
                    Outcome::Replanned {
                        reason: "parent_pending".into(),
                    },
                );
                return Ok(());
            }
            Err(err) => err,
        };

        let disposition = classify(&err, document.num_sync_failures + 1, self.max_failures, &self.retry);
        if disposition == Disposition::Abort {
            return Err(err);
        }
        let reason = err.reason();
        if counts_as_failure(disposition) {
            self.index
                .record_sync_failure(id, now_millis(), reason.as_str())
                .await?;
        }

        match disposition {
            Disposition::Abort => Err(err),
            Disposition::Canceled => {
                self.index
                    .update_sync_state(id, action, SyncState::Planned)
                    .await?;
                self.record(document, action, Outcome::Canceled);
                if !self.control.is_canceled() {
                    self.enqueue(id);
                }
                Ok(())
            }
            Disposition::Vanished => self.remote_vanished(document, action, err).await,
            Disposition::Retry(delay) => {
                self.index
                    .update_sync_state(id, action, SyncState::Planned)
                    .await?;
                tracing::info!(
                    document_id = id,
                    action = action.as_str(),
                    reason = reason.as_str(),
                    delay_ms = delay.as_millis() as u64,
                    "action replanned: {err}"
                );
                self.record(document, action, SyncReport::replanned(reason));
                self.queue.enqueue_after(id, delay, &self.control);
                Ok(())
            }
            Disposition::Fail => {
                self.index
                    .update_sync_state(id, action, SyncState::Failed)
                    .await?;
                tracing::warn!(
                    document_id = id,
                    action = action.as_str(),
                    reason = reason.as_str(),
                    "action failed: {err}"
                );
                self.record(document, action, SyncReport::failed(reason, err.to_string()));
                self.after_change(id, action).await
            }
        }
    }

    /// The remote entry is gone. A local replica is authoritative and gets
    /// uploaded again; without one the row has nothing left to sync.
    async fn remote_vanished(
        &self,
        document: &EncryptedDocument,
        action: SyncAction,
        err: SyncError,
    ) -> Result<(), SyncError> {
        let id = document.id;
        if action == SyncAction::Download && !self.has_local_content(document).await {
            self.index.delete_document(id).await?;
            tracing::info!(document_id = id, "remote entry vanished, row removed");
            self.record(document, action, Outcome::Success);
            self.events.publish(SyncEvent::DocumentRemoved { document_id: id });
            return Ok(());
        }
        if action == SyncAction::Download {
            self.index
                .update_sync_state(id, action, SyncState::Done)
                .await?;
            if !document.upload_state.is_pending() {
                self.index
                    .update_sync_state(id, SyncAction::Upload, SyncState::Planned)
                    .await?;
            }
            tracing::info!(document_id = id, "remote entry vanished, uploading local copy");
            self.record(document, action, SyncReport::replanned(Reason::NotFound));
            return self.after_change(id, action).await;
        }

        self.index
            .record_sync_failure(id, now_millis(), Reason::NotFound.as_str())
            .await?;
        self.index
            .update_sync_state(id, action, SyncState::Failed)
            .await?;
        tracing::warn!(document_id = id, action = action.as_str(), "action failed: {err}");
        self.record(document, action, SyncReport::failed(Reason::NotFound, err.to_string()));
        self.after_change(id, action).await
    }

    async fn after_change(&self, id: i64, action: SyncAction) -> Result<(), SyncError> {
        let updated = self.index.require_document(id).await?;
        if updated.has_pending_action() {
            self.enqueue(id);
        }
        if action == SyncAction::Upload && updated.is_folder && updated.back_entry_id.is_some() {
            let waiting = self.index.list_children(id).await?;
            self.enqueue_documents(
                waiting
                    .into_iter()
                    .filter(|child| child.upload_state == SyncState::Planned)
                    .map(|child| child.id),
            );
        }
        self.events.publish(SyncEvent::DocumentChanged(updated));
        Ok(())
    }

    fn record(&self, document: &EncryptedDocument, action: SyncAction, outcome: Outcome) {
        self.report
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(document.id, &document.display_name, action, outcome);
    }

    fn running_lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, SyncControl>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn has_local_content(&self, document: &EncryptedDocument) -> bool {
        let Some(name) = document.local_file_name.as_deref() else {
            return false;
        };
        match self.blobs.blob_path(name) {
            Ok(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    fn keys_for(&self, document: &EncryptedDocument) -> Result<SecretKeys, SyncError> {
        let alias = document.key_alias.as_deref().unwrap_or(&self.key_alias);
        Ok(self.keys.get_keys(alias)?)
    }

    // Actions

    async fn upload(
        &self,
        document: &EncryptedDocument,
        control: &SyncControl,
    ) -> Result<Step, SyncError> {
        if !document.is_synchronized() {
            return Ok(Step::Done);
        }
        if document.is_root() {
            if document.back_entry_id.is_none() {
                self.resolve_root(document).await?;
            }
            return Ok(Step::Done);
        }
        let account_id = document
            .back_storage_account
            .ok_or(SyncError::NotSynchronized(document.id))?;
        let Some(parent_remote_id) = self.parent_remote_id(document).await? else {
            return Ok(Step::Deferred);
        };

        if document.is_folder {
            if document.back_entry_id.is_some() {
                return Ok(Step::Done);
            }
            let created = self
                .accounts
                .call(account_id, |storage, account| {
                    let parent_remote_id = parent_remote_id.clone();
                    let name = document.display_name.clone();
                    async move {
                        let parent = match storage.folder(&account, &parent_remote_id).await {
                            Ok(parent) => parent,
                            Err(err) if err.is(Reason::NotFound) => return Ok(None),
                            Err(err) => return Err(err),
                        };
                        let folder = parent.create_child_folder(&name).await?;
                        Ok::<_, StorageError>(Some(folder.entry().clone()))
                    }
                })
                .await?;
            let Some(created) = created else {
                return self.parent_vanished(document).await;
            };
            self.index
                .update_back_entry(document.id, &created.id, created.version, created.modified)
                .await?;
            tracing::info!(document_id = document.id, remote_id = %created.id, "folder created");
            return Ok(Step::Done);
        }

        let local_name = document
            .local_file_name
            .as_deref()
            .ok_or(SyncError::MissingLocalFile(document.id))?;
        let source = self.blobs.blob_path(local_name)?;
        if !tokio::fs::try_exists(&source).await? {
            return Err(SyncError::MissingLocalFile(document.id));
        }
        let keys = self.keys_for(document)?;
        self.blobs.ensure_dirs().await?;
        let staged = self.blobs.staging_path(document.id, UPLOAD_SUFFIX);
        let listener: SharedListener = Arc::new(control.clone());

        let result = async {
            crypto::encrypt_file(&keys, &source, &staged, control).await?;
            self.accounts
                .call(account_id, |storage, account| {
                    let staged = staged.clone();
                    let listener = Arc::clone(&listener);
                    let parent_remote_id = parent_remote_id.clone();
                    async move {
                        if let Some(existing) = document.back_entry_id.as_deref() {
                            match storage.file(&account, existing).await {
                                Ok(mut remote) => {
                                    if resolve_upload(document, remote.entry())
                                        == ConflictDecision::KeepRemote
                                    {
                                        return Ok(UploadOutcome::RemoteNewer(
                                            remote.entry().clone(),
                                        ));
                                    }
                                    let entry = remote.upload_file(&staged, &listener).await?;
                                    return Ok(UploadOutcome::Uploaded(entry));
                                }
                                Err(err) if err.is(Reason::NotFound) => {}
                                Err(err) => return Err(err),
                            }
                        }
                        let parent = match storage.folder(&account, &parent_remote_id).await {
                            Ok(parent) => parent,
                            Err(err) if err.is(Reason::NotFound) => {
                                return Ok(UploadOutcome::ParentMissing);
                            }
                            Err(err) => return Err(err),
                        };
                        let child = parent
                            .upload_new_child_file(
                                &document.display_name,
                                &document.mime_type,
                                &staged,
                                &listener,
                            )
                            .await?;
                        Ok::<_, StorageError>(UploadOutcome::Uploaded(child.entry().clone()))
                    }
                })
                .await
        }
        .await;
        if let Err(err) = remove_if_exists(&staged).await {
            tracing::warn!(document_id = document.id, "failed to remove staged upload: {err}");
        }

        match result? {
            UploadOutcome::ParentMissing => return self.parent_vanished(document).await,
            UploadOutcome::Uploaded(entry) => {
                let advanced = self
                    .index
                    .update_back_entry(document.id, &entry.id, entry.version, entry.modified)
                    .await?;
                if !advanced {
                    tracing::debug!(document_id = document.id, "provider returned a stale version");
                }
                if document.key_alias.is_none() {
                    self.index.update_key_alias(document.id, &self.key_alias).await?;
                }
                tracing::info!(document_id = document.id, remote_id = %entry.id, "uploaded");
            }
            UploadOutcome::RemoteNewer(entry) => {
                self.index
                    .update_back_entry(document.id, &entry.id, entry.version, entry.modified)
                    .await?;
                self.index
                    .update_sync_state(document.id, SyncAction::Download, SyncState::Planned)
                    .await?;
                tracing::info!(
                    document_id = document.id,
                    "remote copy is newer than the local edit, downloading it instead"
                );
            }
        }
        Ok(Step::Done)
    }

    /// Remote id of the parent folder. `None` when the parent still has to
    /// be uploaded; its upload is planned and will queue this document.
    async fn parent_remote_id(&self, document: &EncryptedDocument) -> Result<Option<String>, SyncError> {
        let Some(parent_id) = document.parent_id else {
            return Ok(None);
        };
        let parent = self.index.require_document(parent_id).await?;
        if let Some(remote_id) = parent.back_entry_id {
            return Ok(Some(remote_id));
        }
        if parent.is_root() {
            return self.resolve_root(&parent).await.map(Some);
        }
        if !parent.upload_state.is_pending() {
            self.index
                .update_sync_state(parent.id, SyncAction::Upload, SyncState::Planned)
                .await?;
        }
        self.enqueue(parent.id);
        tracing::debug!(document_id = document.id, parent_id, "waiting for parent folder");
        Ok(None)
    }

    /// The parent folder disappeared remotely. The local tree is
    /// authoritative: the parent is uploaded again and this document waits
    /// for it.
    async fn parent_vanished(&self, document: &EncryptedDocument) -> Result<Step, SyncError> {
        let Some(parent_id) = document.parent_id else {
            return Ok(Step::Deferred);
        };
        let parent = self.index.require_document(parent_id).await?;
        self.index.clear_back_entry(parent.id).await?;
        if parent.is_root() {
            if let Some(account_id) = parent.back_storage_account {
                self.index.update_root_folder_id(account_id, None).await?;
            }
        }
        if !parent.upload_state.is_pending() {
            self.index
                .update_sync_state(parent.id, SyncAction::Upload, SyncState::Planned)
                .await?;
        }
        self.enqueue(parent.id);
        tracing::info!(
            document_id = document.id,
            parent_id,
            "remote parent folder vanished, uploading it again"
        );
        Ok(Step::Deferred)
    }

    async fn resolve_root(&self, root: &EncryptedDocument) -> Result<String, SyncError> {
        let account_id = root
            .back_storage_account
            .ok_or(SyncError::NotSynchronized(root.id))?;
        let entry = self
            .accounts
            .call(account_id, |storage, account| async move {
                Ok::<_, StorageError>(storage.root_folder(&account).await?.entry().clone())
            })
            .await?;
        self.index
            .update_back_entry(root.id, &entry.id, entry.version, entry.modified)
            .await?;
        self.index
            .update_root_folder_id(account_id, Some(&entry.id))
            .await?;
        Ok(entry.id)
    }

    async fn download(
        &self,
        document: &EncryptedDocument,
        control: &SyncControl,
    ) -> Result<Step, SyncError> {
        if document.is_folder || !document.is_synchronized() {
            return Ok(Step::Done);
        }
        let account_id = document
            .back_storage_account
            .ok_or(SyncError::NotSynchronized(document.id))?;
        let remote_id = document
            .back_entry_id
            .clone()
            .ok_or_else(|| StorageError::not_found(format!("remote entry of document {}", document.id)))?;
        let keys = self.keys_for(document)?;
        self.blobs.ensure_dirs().await?;
        let local_name = document
            .local_file_name
            .clone()
            .unwrap_or_else(|| BlobStore::blob_name_for(document.id));
        let target = self.blobs.blob_path(&local_name)?;
        let partial = self.blobs.partial_blob_path(&local_name)?;
        let staged = self.blobs.staging_path(document.id, DOWNLOAD_SUFFIX);
        let listener: SharedListener = Arc::new(control.clone());

        let result = async {
            let entry = self
                .accounts
                .call(account_id, |storage, account| {
                    let remote_id = remote_id.clone();
                    let staged = staged.clone();
                    let listener = Arc::clone(&listener);
                    async move {
                        let remote = storage.file(&account, &remote_id).await?;
                        remote.download_file(&staged, &listener).await?;
                        Ok::<_, StorageError>(remote.entry().clone())
                    }
                })
                .await?;
            crypto::decrypt_file(&keys, &staged, &partial, control).await?;
            tokio::fs::rename(&partial, &target).await?;
            Ok::<_, SyncError>(entry)
        }
        .await;
        if let Err(err) = remove_if_exists(&staged).await {
            tracing::warn!(document_id = document.id, "failed to remove staged download: {err}");
        }
        let entry = match result {
            Ok(entry) => entry,
            Err(err) => {
                let _ = remove_if_exists(&partial).await;
                return Err(err);
            }
        };

        let size = tokio::fs::metadata(&target).await?.len() as i64;
        self.index
            .update_local_file(
                document.id,
                Some(&local_name),
                Some(size),
                Some(entry.modified.unwrap_or_else(now_millis)),
            )
            .await?;
        self.index
            .update_back_entry(document.id, &entry.id, entry.version, entry.modified)
            .await?;
        tracing::info!(document_id = document.id, size, "downloaded");
        Ok(Step::Done)
    }

    async fn delete(
        &self,
        document: &EncryptedDocument,
        control: &SyncControl,
    ) -> Result<Step, SyncError> {
        let descendants = self.index.list_descendants(document.id).await?;
        for descendant in &descendants {
            self.restart_current_sync(descendant.id);
        }

        if document.is_root() {
            match document.back_storage_account {
                Some(account_id) if document.is_synchronized() => {
                    self.accounts.remove_account(account_id).await?;
                }
                _ => self.index.delete_document(document.id).await?,
            }
        } else {
            if let (Some(account_id), Some(remote_id)) =
                (document.back_storage_account, document.back_entry_id.as_deref())
                && document.is_synchronized()
            {
                let is_folder = document.is_folder;
                let removal = self.accounts.call(account_id, |storage, account| async move {
                    let result = if is_folder {
                        storage.delete_folder(&account, remote_id).await
                    } else {
                        storage.delete_file(&account, remote_id).await
                    };
                    ignore_not_found(result)
                });
                // Providers may poll a server-side operation for a long time.
                tokio::select! {
                    result = removal => result?,
                    _ = control.canceled() => return Err(StorageError::canceled().into()),
                }
            }
            self.index.delete_document(document.id).await?;
        }

        let blobs: Vec<PathBuf> = descendants
            .iter()
            .chain(std::iter::once(document))
            .filter_map(|doc| doc.local_file_name.as_deref())
            .filter_map(|name| self.blobs.blob_path(name).ok())
            .collect();
        for blob in blobs {
            if let Err(err) = remove_if_exists(&blob).await {
                tracing::warn!(document_id = document.id, "failed to remove blob {}: {err}", blob.display());
            }
        }
        tracing::info!(document_id = document.id, removed = descendants.len() + 1, "deleted");
        Ok(Step::Removed)
    }
}

#[cfg(test)]
#[path = "documents_tests.rs"]
mod tests;
