use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use storagecrypt_core::{Account, StorageType, SyncControl, Url};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::accounts::{AccountManager, StorageRegistry};
use crate::config::DaemonConfig;
use crate::crypto::KeyStore;
use crate::error::SyncError;
use crate::index::IndexStore;
use crate::paths::BlobStore;
use crate::sync::{ChangesSyncEngine, DocumentSyncEngine, EventBus, SyncEvent, SyncReport};

/// Owns both engines and their workers.
///
/// Nothing runs until [`start`](Self::start); [`stop`](Self::stop) cancels
/// the current pass and waits for every worker to exit. Actions that were
/// Running stay so in the index and are replanned by the next `start`.
pub struct StorageCryptService {
    config: DaemonConfig,
    index: IndexStore,
    accounts: Arc<AccountManager>,
    blobs: BlobStore,
    events: EventBus,
    control: SyncControl,
    documents: Arc<DocumentSyncEngine>,
    changes: Arc<ChangesSyncEngine>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl StorageCryptService {
    pub fn new(
        config: DaemonConfig,
        index: IndexStore,
        storages: StorageRegistry,
        keys: Arc<dyn KeyStore>,
    ) -> Self {
        let accounts = Arc::new(AccountManager::new(
            index.clone(),
            storages,
            config.rate_limit,
        ));
        let blobs = BlobStore::new(&config.data_dir);
        let events = EventBus::new();
        let control = SyncControl::new();
        let documents = Arc::new(DocumentSyncEngine::new(
            index.clone(),
            Arc::clone(&accounts),
            keys,
            blobs.clone(),
            config.key_alias.clone(),
            events.clone(),
            control.clone(),
            config.max_sync_failures,
        ));
        let changes = Arc::new(ChangesSyncEngine::new(
            index.clone(),
            Arc::clone(&accounts),
            Arc::clone(&documents),
            events.clone(),
            control.clone(),
            config.max_sync_failures,
        ));
        Self {
            config,
            index,
            accounts,
            blobs,
            events,
            control,
            documents,
            changes,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn accounts(&self) -> &AccountManager {
        &self.accounts
    }

    pub fn index(&self) -> &IndexStore {
        &self.index
    }

    /// Recovers interrupted actions and spawns the worker pool, the changes
    /// worker and the periodic scheduler.
    pub async fn start(&self) -> Result<(), SyncError> {
        if self.control.is_canceled() {
            return Err(SyncError::Stopped);
        }
        self.blobs.ensure_dirs().await?;
        let queued = self.documents.recover().await?;

        let mut workers = self.workers_lock();
        if !workers.is_empty() {
            return Ok(());
        }
        let count = self.config.workers.max(1);
        for _ in 0..count {
            workers.push(tokio::spawn(Arc::clone(&self.documents).run_worker()));
        }
        workers.push(tokio::spawn(Arc::clone(&self.changes).run_worker()));
        workers.push(tokio::spawn(
            Arc::clone(&self.changes).run_scheduler(self.config.changes_poll_interval),
        ));
        tracing::info!(
            workers = count,
            queued,
            poll_secs = self.config.changes_poll_interval.as_secs(),
            "sync service started"
        );
        Ok(())
    }

    /// Cancels the running pass and joins every worker.
    pub async fn stop(&self) {
        self.control.cancel();
        let workers = std::mem::take(&mut *self.workers_lock());
        for worker in workers {
            if let Err(err) = worker.await {
                tracing::warn!("sync worker ended abnormally: {err}");
            }
        }
        tracing::info!("sync service stopped");
    }

    pub fn sync_document(&self, document_id: i64) -> Result<bool, SyncError> {
        self.ensure_running()?;
        Ok(self.documents.enqueue(document_id))
    }

    pub fn sync_documents(&self, document_ids: &[i64]) -> Result<usize, SyncError> {
        self.ensure_running()?;
        Ok(self.documents.enqueue_documents(document_ids.iter().copied()))
    }

    /// Pulls remote changes for the account, then runs its pending actions.
    pub async fn sync_account(&self, account_id: i64) -> Result<(), SyncError> {
        self.ensure_running()?;
        self.changes.enqueue(account_id).await?;
        self.documents.enqueue_account(account_id).await?;
        Ok(())
    }

    pub async fn sync_all(&self) -> Result<(), SyncError> {
        self.ensure_running()?;
        self.changes.enqueue_all().await?;
        self.documents.enqueue_all().await?;
        Ok(())
    }

    pub fn restart_current_sync(&self, document_id: i64) -> bool {
        self.documents.restart_current_sync(document_id)
    }

    pub async fn request_deletion(&self, document_id: i64) -> Result<(), SyncError> {
        self.ensure_running()?;
        self.documents.request_deletion(document_id).await
    }

    pub async fn replan_failed(&self, document_id: i64) -> Result<usize, SyncError> {
        self.ensure_running()?;
        self.documents.replan_failed(document_id).await
    }

    pub async fn import_documents(
        &self,
        parent_id: i64,
        roots: &[PathBuf],
    ) -> Result<Vec<i64>, SyncError> {
        self.ensure_running()?;
        self.documents.import_documents(parent_id, roots).await
    }

    pub fn authorize_url(
        &self,
        storage_type: StorageType,
        state: Option<&str>,
    ) -> Result<Url, SyncError> {
        self.accounts.authorize_url(storage_type, state)
    }

    /// Connects the account and plans its first changes pass.
    pub async fn connect_account(
        &self,
        storage_type: StorageType,
        code: &str,
    ) -> Result<Account, SyncError> {
        let account = self.accounts.connect_account(storage_type, code).await?;
        self.changes.enqueue(account.id).await?;
        Ok(account)
    }

    pub async fn remove_account(&self, account_id: i64) -> Result<(), SyncError> {
        self.accounts.remove_account(account_id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn last_report(&self) -> Option<SyncReport> {
        self.documents.last_report()
    }

    /// Waits until both engines are idle and returns the latest run report.
    pub async fn drain(&self) -> Option<SyncReport> {
        loop {
            tokio::select! {
                _ = self.changes.wait_idle() => {}
                _ = self.control.canceled() => break,
            }
            tokio::select! {
                _ = self.documents.wait_idle() => {}
                _ = self.control.canceled() => break,
            }
            // A changes pass can queue documents after the first wait returns.
            if self.changes.is_idle() && self.documents.is_idle() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.documents.finish_run().or_else(|| self.documents.last_report())
    }

    fn ensure_running(&self) -> Result<(), SyncError> {
        if self.control.is_canceled() {
            Err(SyncError::Stopped)
        } else {
            Ok(())
        }
    }

    fn workers_lock(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }
}
