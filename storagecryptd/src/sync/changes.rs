use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use storagecrypt_core::{
    Account, ChangesSyncState, RemoteChange, RemoteEntry, SharedListener, StorageError,
    SyncControl, cursor_advances,
};

use super::classify::{Disposition, classify};
use super::conflict::remote_advanced;
use super::documents::DocumentSyncEngine;
use super::events::{EventBus, SyncEvent};
use super::queue::WorkQueue;
use crate::accounts::AccountManager;
use crate::backoff::Backoff;
use crate::error::SyncError;
use crate::index::IndexStore;
use crate::model::{DocumentInput, EncryptedDocument, SyncAction, SyncState};

/// Pulls remote changes per account and turns them into planned actions.
pub struct ChangesSyncEngine {
    index: IndexStore,
    accounts: Arc<AccountManager>,
    documents: Arc<DocumentSyncEngine>,
    events: EventBus,
    queue: Arc<WorkQueue<i64>>,
    control: SyncControl,
    retry: Backoff,
    max_failures: i64,
    failures: std::sync::Mutex<std::collections::HashMap<i64, i64>>,
}

impl ChangesSyncEngine {
    pub fn new(
        index: IndexStore,
        accounts: Arc<AccountManager>,
        documents: Arc<DocumentSyncEngine>,
        events: EventBus,
        control: SyncControl,
        max_failures: i64,
    ) -> Self {
        Self {
            index,
            accounts,
            documents,
            events,
            queue: Arc::new(WorkQueue::new()),
            control,
            retry: Backoff::new(Duration::from_secs(5), Duration::from_secs(600), true),
            max_failures,
            failures: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn with_retry_backoff(mut self, retry: Backoff) -> Self {
        self.retry = retry;
        self
    }

    /// Plans a changes pass for the account.
    pub async fn enqueue(&self, account_id: i64) -> Result<bool, SyncError> {
        let account = self.accounts.account(account_id).await?;
        if account.changes_sync_state != ChangesSyncState::Running {
            self.index
                .update_changes_sync_state(account_id, ChangesSyncState::Planned)
                .await?;
        }
        Ok(self.queue.enqueue(account_id))
    }

    /// Plans a pass for every account that does not need to sign in again.
    pub async fn enqueue_all(&self) -> Result<usize, SyncError> {
        let mut queued = 0;
        for account in self.index.list_accounts().await? {
            if account.needs_reauth {
                tracing::debug!(account_id = account.id, "skipping account that needs sign-in");
                continue;
            }
            if self.enqueue(account.id).await? {
                queued += 1;
            }
        }
        Ok(queued)
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_idle()
    }

    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await;
    }

    pub async fn run_worker(self: Arc<Self>) {
        while let Some(account_id) = self.queue.next(&self.control).await {
            let result = self.process(account_id).await;
            self.queue.finish(&account_id);
            if let Err(err) = result {
                if err.is_connection_closed() {
                    let dropped = self.queue.clear();
                    tracing::warn!(dropped, "index closed, abandoning changes pass");
                } else {
                    tracing::error!(account_id, "changes bookkeeping failed: {err}");
                }
            }
        }
    }

    /// Queues every account on a fixed period until canceled.
    pub async fn run_scheduler(self: Arc<Self>, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.enqueue_all().await {
                        tracing::warn!("failed to schedule changes: {err}");
                    }
                }
                _ = self.control.canceled() => break,
            }
        }
    }

    /// Runs one pass for the account and settles its changes state.
    pub async fn process(&self, account_id: i64) -> Result<(), SyncError> {
        match self.accounts.account(account_id).await {
            Ok(_) => {}
            Err(err) if err.reason() == storagecrypt_core::Reason::AccountNotFound => return Ok(()),
            Err(err) => return Err(err),
        }
        self.index
            .update_changes_sync_state(account_id, ChangesSyncState::Running)
            .await?;

        let err = match self.sync_changes(account_id).await {
            Ok(planned) => {
                self.index
                    .update_changes_sync_state(account_id, ChangesSyncState::Done)
                    .await?;
                self.failures_lock().remove(&account_id);
                if let Err(err) = self.accounts.refresh_quota(account_id).await {
                    tracing::warn!(account_id, "quota refresh failed: {err}");
                }
                self.events.publish(SyncEvent::ChangesApplied {
                    account_id,
                    planned,
                });
                self.documents.enqueue_account(account_id).await?;
                return Ok(());
            }
            Err(err) => err,
        };

        let failures = {
            let mut failures = self.failures_lock();
            let count = failures.entry(account_id).or_insert(0);
            *count += 1;
            *count
        };
        match classify(&err, failures, self.max_failures, &self.retry) {
            Disposition::Abort => Err(err),
            Disposition::Canceled => {
                self.index
                    .update_changes_sync_state(account_id, ChangesSyncState::Planned)
                    .await?;
                Ok(())
            }
            Disposition::Retry(delay) => {
                tracing::info!(
                    account_id,
                    delay_ms = delay.as_millis() as u64,
                    reason = err.reason().as_str(),
                    "changes pass replanned: {err}"
                );
                self.index
                    .update_changes_sync_state(account_id, ChangesSyncState::Planned)
                    .await?;
                self.queue.enqueue_after(account_id, delay, &self.control);
                Ok(())
            }
            Disposition::Vanished | Disposition::Fail => {
                tracing::warn!(
                    account_id,
                    reason = err.reason().as_str(),
                    "changes pass failed: {err}"
                );
                self.index
                    .update_changes_sync_state(account_id, ChangesSyncState::Failed)
                    .await?;
                Ok(())
            }
        }
    }

    /// Fetches changes since the stored cursor and plans the matching
    /// actions. Returns how many actions were planned.
    pub async fn sync_changes(&self, account_id: i64) -> Result<usize, SyncError> {
        let account = self.accounts.account(account_id).await?;
        let root = self.account_root(&account).await?;
        let cursor = account.last_remote_change_id.clone();
        let listener: SharedListener = Arc::new(self.control.child());
        let changes = self
            .accounts
            .call(account_id, |storage, account| {
                let cursor = cursor.clone();
                let listener = Arc::clone(&listener);
                async move {
                    storage
                        .changes(&account, cursor.as_deref(), &listener)
                        .await
                }
            })
            .await?;

        let mut modifications = Vec::new();
        let mut deletions = Vec::new();
        for change in changes.changes {
            match change {
                RemoteChange::Modification(entry) => modifications.push(entry),
                RemoteChange::Deletion { id } => deletions.push(id),
            }
        }
        tracing::debug!(
            account_id,
            modifications = modifications.len(),
            deletions = deletions.len(),
            full_scan = changes.scanned_ids.is_some(),
            "remote changes received"
        );

        let mut planned = self.apply_modifications(&account, &root, modifications).await?;
        for remote_id in deletions {
            planned += self.apply_deletion(account_id, &remote_id).await?;
        }
        if let Some(scanned) = &changes.scanned_ids {
            planned += self.apply_scan_absences(account_id, scanned).await?;
        }

        if let Some(next) = changes.cursor.as_deref() {
            if cursor_advances(cursor.as_deref(), next) {
                self.index
                    .update_last_remote_change_id(account_id, Some(next))
                    .await?;
            } else if cursor.as_deref() != Some(next) {
                tracing::warn!(account_id, cursor = next, "ignoring cursor that moves backwards");
            }
        }
        tracing::info!(account_id, planned, "changes applied");
        Ok(planned)
    }

    /// The account root, with its remote id resolved.
    async fn account_root(&self, account: &Account) -> Result<EncryptedDocument, SyncError> {
        let root = self
            .index
            .ensure_root(
                account.storage_type,
                Some(account.id),
                &account.account_name,
                account.root_folder_id.as_deref(),
            )
            .await?;
        if root.back_entry_id.is_some() {
            return Ok(root);
        }
        let entry = self
            .accounts
            .call(account.id, |storage, account| async move {
                Ok::<_, StorageError>(storage.root_folder(&account).await?.entry().clone())
            })
            .await?;
        self.index
            .update_back_entry(root.id, &entry.id, entry.version, entry.modified)
            .await?;
        self.index
            .update_root_folder_id(account.id, Some(&entry.id))
            .await?;
        Ok(self.index.require_document(root.id).await?)
    }

    /// Applies modifications parents first. Entries whose parent never shows
    /// up are attached to the account root.
    async fn apply_modifications(
        &self,
        account: &Account,
        root: &EncryptedDocument,
        entries: Vec<RemoteEntry>,
    ) -> Result<usize, SyncError> {
        let root_remote_id = root.back_entry_id.as_deref();
        let mut pending: Vec<RemoteEntry> = entries
            .into_iter()
            .filter(|entry| Some(entry.id.as_str()) != root_remote_id)
            .collect();
        let mut planned = 0;
        loop {
            let mut deferred = Vec::new();
            let before = pending.len();
            for entry in pending {
                match self.local_parent(account.id, root, &entry).await? {
                    Some(parent_id) => {
                        planned += self.apply_modification(account, parent_id, &entry).await?;
                    }
                    None => deferred.push(entry),
                }
            }
            if deferred.is_empty() {
                break;
            }
            if deferred.len() == before {
                for entry in &deferred {
                    tracing::debug!(account_id = account.id, remote_id = %entry.id, "parent unknown, attaching to root");
                    planned += self.apply_modification(account, root.id, entry).await?;
                }
                break;
            }
            pending = deferred;
        }
        Ok(planned)
    }

    async fn local_parent(
        &self,
        account_id: i64,
        root: &EncryptedDocument,
        entry: &RemoteEntry,
    ) -> Result<Option<i64>, SyncError> {
        let Some(parent_remote_id) = entry.parent_id.as_deref() else {
            return Ok(Some(root.id));
        };
        if root.back_entry_id.as_deref() == Some(parent_remote_id) {
            return Ok(Some(root.id));
        }
        let parent = self
            .index
            .get_document_by_back_entry(account_id, parent_remote_id)
            .await?;
        Ok(parent.filter(|p| p.is_folder).map(|p| p.id))
    }

    async fn apply_modification(
        &self,
        account: &Account,
        parent_id: i64,
        entry: &RemoteEntry,
    ) -> Result<usize, SyncError> {
        let Some(existing) = self
            .index
            .get_document_by_back_entry(account.id, &entry.id)
            .await?
        else {
            let mut input = DocumentInput::new(
                &entry.name,
                &entry.mime_type,
                entry.is_folder,
                account.storage_type,
                Some(account.id),
            )
            .with_parent(parent_id);
            input.back_entry_id = Some(entry.id.clone());
            input.back_entry_version = entry.version;
            input.remote_modification_time = entry.modified;
            if !entry.is_folder {
                input.download_state = SyncState::Planned;
            }
            let document = self.index.insert_document(&input).await?;
            tracing::debug!(document_id = document.id, remote_id = %entry.id, "new remote entry");
            self.events.publish(SyncEvent::DocumentChanged(document));
            return Ok(usize::from(!entry.is_folder));
        };

        if existing.deletion_state.is_pending() {
            return Ok(0);
        }
        if existing.display_name != entry.name
            || existing.mime_type != entry.mime_type
            || existing.parent_id != Some(parent_id)
        {
            self.index
                .update_metadata(existing.id, &entry.name, &entry.mime_type, Some(parent_id))
                .await?;
        }
        if !remote_advanced(&existing, entry) {
            return Ok(0);
        }
        if existing.is_folder {
            self.index
                .update_back_entry(existing.id, &entry.id, entry.version, entry.modified)
                .await?;
            return Ok(0);
        }
        // A pending upload compares modification times itself before it
        // overwrites anything.
        if existing.upload_state.is_pending() || existing.download_state.is_pending() {
            return Ok(0);
        }
        self.index
            .update_back_entry(existing.id, &entry.id, entry.version, entry.modified)
            .await?;
        self.index
            .update_sync_state(existing.id, SyncAction::Download, SyncState::Planned)
            .await?;
        tracing::debug!(document_id = existing.id, remote_id = %entry.id, "remote entry changed");
        Ok(1)
    }

    async fn apply_deletion(&self, account_id: i64, remote_id: &str) -> Result<usize, SyncError> {
        let Some(document) = self
            .index
            .get_document_by_back_entry(account_id, remote_id)
            .await?
        else {
            return Ok(0);
        };
        self.plan_removal(document).await
    }

    /// After a full scan, every known entry the scan did not see is gone.
    async fn apply_scan_absences(
        &self,
        account_id: i64,
        scanned: &HashSet<String>,
    ) -> Result<usize, SyncError> {
        let mut planned = 0;
        for document in self.index.list_account_documents(account_id).await? {
            let Some(remote_id) = document.back_entry_id.as_deref() else {
                continue;
            };
            if document.is_root() || scanned.contains(remote_id) {
                continue;
            }
            planned += self.plan_removal(document).await?;
        }
        Ok(planned)
    }

    async fn plan_removal(&self, document: EncryptedDocument) -> Result<usize, SyncError> {
        if document.is_root() || document.deletion_state.is_pending() {
            return Ok(0);
        }
        // The local edit still has to reach the provider; its upload will
        // recreate the entry.
        if document.upload_state.is_pending() {
            return Ok(0);
        }
        // Folders without a remote object of their own vanish until their
        // first child is uploaded.
        if document.is_folder && self.holds_unsent_content(document.id).await? {
            tracing::debug!(document_id = document.id, "remote folder gone, keeping unsent children");
            return Ok(0);
        }
        let has_local_copy = document.is_folder || document.local_file_name.is_some();
        if !has_local_copy {
            self.documents.restart_current_sync(document.id);
            self.index.delete_document(document.id).await?;
            self.events.publish(SyncEvent::DocumentRemoved {
                document_id: document.id,
            });
            tracing::debug!(document_id = document.id, "remote entry removed, row dropped");
            return Ok(0);
        }
        self.documents.request_deletion(document.id).await?;
        tracing::debug!(document_id = document.id, "remote entry removed, deletion planned");
        Ok(1)
    }

    async fn holds_unsent_content(&self, folder_id: i64) -> Result<bool, SyncError> {
        let descendants = self.index.list_descendants(folder_id).await?;
        Ok(descendants
            .iter()
            .any(|child| child.back_entry_id.is_none() || child.upload_state != SyncState::Done))
    }

    fn failures_lock(&self) -> std::sync::MutexGuard<'_, std::collections::HashMap<i64, i64>> {
        self.failures.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
#[path = "changes_tests.rs"]
mod tests;
