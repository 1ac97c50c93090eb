//! In-memory provider used by the engine tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use storagecrypt_core::{
    Account, ConnectedAccount, DocumentRef, FOLDER_MIME_TYPE, Quota, Reason, RemoteChange,
    RemoteChanges, RemoteDocument, RemoteEntry, RemoteStorage, SharedListener, StorageError,
    StorageType, TokenGrant, checkpoint,
};
use storagecrypt_core::Url;
use tokio::sync::Notify;

pub const ROOT_ID: &str = "root";

struct Stored {
    entry: RemoteEntry,
    data: Vec<u8>,
}

#[derive(Default)]
struct FakeState {
    entries: HashMap<String, Stored>,
    tombstones: Vec<(i64, String)>,
    clock: i64,
    next_id: u64,
    valid_token: String,
    refreshes: usize,
    failures: HashMap<&'static str, VecDeque<StorageError>>,
    calls: Vec<String>,
    gate: Option<Arc<Notify>>,
    hold_deletions: bool,
}

impl FakeState {
    fn tick(&mut self) -> i64 {
        self.clock += 1_000;
        self.clock
    }

    fn take_failure(&mut self, op: &'static str) -> Result<(), StorageError> {
        self.calls.push(op.to_string());
        match self.failures.get_mut(op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn authorize(&self, account: &Account) -> Result<(), StorageError> {
        if account.access_token.as_deref() == Some(self.valid_token.as_str()) {
            Ok(())
        } else {
            Err(StorageError::new(Reason::Unauthorized, "token expired"))
        }
    }

    fn entry(&self, id: &str) -> Result<RemoteEntry, StorageError> {
        self.entries
            .get(id)
            .map(|stored| stored.entry.clone())
            .ok_or_else(|| StorageError::not_found(id))
    }
}

/// Shared handle; clones see the same remote tree.
#[derive(Clone)]
pub struct FakeStorage {
    storage_type: StorageType,
    state: Arc<Mutex<FakeState>>,
}

impl FakeStorage {
    pub fn new(storage_type: StorageType) -> Self {
        let mut state = FakeState {
            valid_token: "tok".into(),
            ..FakeState::default()
        };
        state.entries.insert(
            ROOT_ID.into(),
            Stored {
                entry: RemoteEntry::folder(ROOT_ID, "StorageCrypt", None),
                data: Vec::new(),
            },
        );
        Self {
            storage_type,
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn account(&self, name: &str) -> Account {
        let mut account = Account::new(self.storage_type, name).with_access_token("tok");
        account.refresh_token = Some("refresh".into());
        account.root_folder_id = Some(ROOT_ID.into());
        account
    }

    /// Adds or replaces a remote entry as another client would.
    pub fn put_remote(&self, id: &str, parent: &str, name: &str, data: Option<&[u8]>) -> RemoteEntry {
        let mut state = self.state.lock().unwrap();
        let modified = state.tick();
        let version = state
            .entries
            .get(id)
            .and_then(|stored| stored.entry.version)
            .unwrap_or(0)
            + 1;
        let entry = RemoteEntry {
            id: id.into(),
            name: name.into(),
            mime_type: if data.is_some() { "text/plain".into() } else { FOLDER_MIME_TYPE.into() },
            is_folder: data.is_none(),
            parent_id: Some(parent.into()),
            size: data.map(|d| d.len() as i64),
            version: Some(version),
            modified: Some(modified),
            hash: None,
        };
        state.entries.insert(
            id.into(),
            Stored {
                entry: entry.clone(),
                data: data.map(<[u8]>::to_vec).unwrap_or_default(),
            },
        );
        entry
    }

    pub fn remove_remote(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        let at = state.tick();
        state.entries.remove(id);
        state.tombstones.push((at, id.to_string()));
    }

    pub fn remote(&self, id: &str) -> Option<RemoteEntry> {
        self.state.lock().unwrap().entries.get(id).map(|s| s.entry.clone())
    }

    pub fn remote_data(&self, id: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().entries.get(id).map(|s| s.data.clone())
    }

    pub fn remote_ids(&self) -> HashSet<String> {
        self.state.lock().unwrap().entries.keys().cloned().collect()
    }

    pub fn fail_next(&self, op: &'static str, err: StorageError) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry(op)
            .or_default()
            .push_back(err);
    }

    pub fn expire_tokens(&self, valid: &str) {
        self.state.lock().unwrap().valid_token = valid.into();
    }

    pub fn refreshes(&self) -> usize {
        self.state.lock().unwrap().refreshes
    }

    pub fn calls(&self, op: &str) -> usize {
        self.state.lock().unwrap().calls.iter().filter(|c| *c == op).count()
    }

    /// Holds every transfer until `release` is called or the listener cancels.
    pub fn hold_transfers(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.state.lock().unwrap().gate = Some(Arc::clone(&gate));
        gate
    }

    /// Remote deletions never finish, like a provider operation that is
    /// still in progress.
    pub fn hold_deletions(&self) {
        self.state.lock().unwrap().hold_deletions = true;
    }

    async fn wait_deletion(&self) {
        let held = self.state.lock().unwrap().hold_deletions;
        if held {
            std::future::pending::<()>().await;
        }
    }

    pub fn release_transfers(&self) {
        if let Some(gate) = self.state.lock().unwrap().gate.take() {
            gate.notify_waiters();
        }
    }

    fn handle(&self, token: &str, entry: RemoteEntry) -> DocumentRef {
        Box::new(FakeDocument {
            storage: self.clone(),
            token: token.to_string(),
            entry,
        })
    }

    fn begin(&self, account: &Account, op: &'static str) -> Result<(), StorageError> {
        let mut state = self.state.lock().unwrap();
        state.authorize(account)?;
        state.take_failure(op)
    }

    async fn wait_gate(&self, listener: &SharedListener) -> Result<(), StorageError> {
        let gate = self.state.lock().unwrap().gate.clone();
        let Some(gate) = gate else {
            return checkpoint(listener.as_ref()).await;
        };
        loop {
            checkpoint(listener.as_ref()).await?;
            let notified = gate.notified();
            if tokio::time::timeout(Duration::from_millis(10), notified).await.is_ok() {
                return Ok(());
            }
            if self.state.lock().unwrap().gate.is_none() {
                return Ok(());
            }
        }
    }
}

#[async_trait]
impl RemoteStorage for FakeStorage {
    fn storage_type(&self) -> StorageType {
        self.storage_type
    }

    async fn root_folder(&self, account: &Account) -> Result<DocumentRef, StorageError> {
        self.begin(account, "root_folder")?;
        let entry = self.state.lock().unwrap().entry(ROOT_ID)?;
        Ok(self.handle(account.access_token()?, entry))
    }

    async fn document(&self, account: &Account, id: &str) -> Result<DocumentRef, StorageError> {
        self.begin(account, "document")?;
        let entry = self.state.lock().unwrap().entry(id)?;
        Ok(self.handle(account.access_token()?, entry))
    }

    fn oauth_authorize_url(&self, state: Option<&str>) -> Result<Url, StorageError> {
        let mut url = Url::parse("https://auth.example/authorize")?;
        if let Some(state) = state {
            url.query_pairs_mut().append_pair("state", state);
        }
        Ok(url)
    }

    async fn connect_with_access_code(&self, code: &str) -> Result<ConnectedAccount, StorageError> {
        self.state.lock().unwrap().take_failure("connect")?;
        Ok(ConnectedAccount {
            account_name: format!("user-{code}"),
            grant: TokenGrant {
                access_token: "tok".into(),
                refresh_token: Some("refresh".into()),
                expires_at: Some(i64::MAX),
            },
            root_folder_id: Some(ROOT_ID.into()),
        })
    }

    async fn refresh_token(&self, account: &Account) -> Result<TokenGrant, StorageError> {
        let mut state = self.state.lock().unwrap();
        state.take_failure("refresh")?;
        if account.refresh_token.is_none() {
            return Err(StorageError::new(Reason::Unauthorized, "no refresh token"));
        }
        state.refreshes += 1;
        let token = format!("tok-{}", state.refreshes);
        state.valid_token = token.clone();
        Ok(TokenGrant {
            access_token: token,
            refresh_token: account.refresh_token.clone(),
            expires_at: Some(i64::MAX),
        })
    }

    async fn revoke_token(&self, _account: &Account) -> Result<(), StorageError> {
        self.state.lock().unwrap().take_failure("revoke")
    }

    async fn refresh_quota(&self, account: &Account) -> Result<Quota, StorageError> {
        self.begin(account, "quota")?;
        let used = self
            .state
            .lock()
            .unwrap()
            .entries
            .values()
            .map(|s| s.data.len() as i64)
            .sum();
        Ok(Quota {
            amount: Some(1 << 30),
            used: Some(used),
        })
    }

    async fn changes(
        &self,
        account: &Account,
        last_change_id: Option<&str>,
        listener: &SharedListener,
    ) -> Result<RemoteChanges, StorageError> {
        self.begin(account, "changes")?;
        checkpoint(listener.as_ref()).await?;
        let state = self.state.lock().unwrap();
        let since = last_change_id.and_then(|c| c.parse::<i64>().ok());
        let mut entries: Vec<RemoteEntry> = state
            .entries
            .values()
            .map(|s| s.entry.clone())
            .filter(|e| e.id != ROOT_ID)
            .filter(|e| since.is_none_or(|since| e.modified.unwrap_or(0) > since))
            .collect();
        entries.sort_by_key(|e| e.modified);
        let mut changes: Vec<RemoteChange> =
            entries.into_iter().map(RemoteChange::Modification).collect();
        let scanned_ids = match since {
            None => Some(state.entries.keys().cloned().collect()),
            Some(since) => {
                changes.extend(
                    state
                        .tombstones
                        .iter()
                        .filter(|(at, _)| *at > since)
                        .map(|(_, id)| RemoteChange::Deletion { id: id.clone() }),
                );
                None
            }
        };
        Ok(RemoteChanges {
            changes,
            cursor: Some(state.clock.to_string()),
            scanned_ids,
        })
    }

    async fn delete_file(&self, account: &Account, id: &str) -> Result<(), StorageError> {
        self.begin(account, "delete")?;
        self.wait_deletion().await;
        self.state.lock().unwrap().entries.remove(id);
        Ok(())
    }

    async fn delete_folder(&self, account: &Account, id: &str) -> Result<(), StorageError> {
        self.begin(account, "delete")?;
        self.wait_deletion().await;
        let mut state = self.state.lock().unwrap();
        let mut doomed = vec![id.to_string()];
        let mut i = 0;
        while i < doomed.len() {
            let parent = doomed[i].clone();
            doomed.extend(
                state
                    .entries
                    .values()
                    .filter(|s| s.entry.parent_id.as_deref() == Some(parent.as_str()))
                    .map(|s| s.entry.id.clone()),
            );
            i += 1;
        }
        for id in doomed {
            state.entries.remove(&id);
        }
        Ok(())
    }
}

struct FakeDocument {
    storage: FakeStorage,
    token: String,
    entry: RemoteEntry,
}

impl FakeDocument {
    fn insert_child(&self, name: &str, mime_type: &str, is_folder: bool) -> RemoteEntry {
        let mut state = self.storage.state.lock().unwrap();
        state.next_id += 1;
        let modified = state.tick();
        let entry = RemoteEntry {
            id: format!("f{}", state.next_id),
            name: name.into(),
            mime_type: mime_type.into(),
            is_folder,
            parent_id: Some(self.entry.id.clone()),
            size: if is_folder { None } else { Some(0) },
            version: Some(1),
            modified: Some(modified),
            hash: None,
        };
        state.entries.insert(
            entry.id.clone(),
            Stored {
                entry: entry.clone(),
                data: Vec::new(),
            },
        );
        entry
    }

    fn check(&self, op: &'static str) -> Result<(), StorageError> {
        let mut state = self.storage.state.lock().unwrap();
        if state.valid_token != self.token {
            return Err(StorageError::new(Reason::Unauthorized, "token expired"));
        }
        state.take_failure(op)
    }

    fn store(&mut self, data: Vec<u8>) -> Result<RemoteEntry, StorageError> {
        let mut state = self.storage.state.lock().unwrap();
        let modified = state.tick();
        let stored = state
            .entries
            .get_mut(&self.entry.id)
            .ok_or_else(|| StorageError::not_found(&self.entry.id))?;
        stored.entry.version = Some(stored.entry.version.unwrap_or(0) + 1);
        stored.entry.modified = Some(modified);
        stored.entry.size = Some(data.len() as i64);
        stored.data = data;
        self.entry = stored.entry.clone();
        Ok(self.entry.clone())
    }
}

#[async_trait]
impl RemoteDocument for FakeDocument {
    fn entry(&self) -> &RemoteEntry {
        &self.entry
    }

    async fn child_documents(
        &self,
        listener: &SharedListener,
    ) -> Result<Vec<DocumentRef>, StorageError> {
        self.check("list")?;
        checkpoint(listener.as_ref()).await?;
        let entries: Vec<RemoteEntry> = self
            .storage
            .state
            .lock()
            .unwrap()
            .entries
            .values()
            .filter(|s| s.entry.parent_id.as_deref() == Some(self.entry.id.as_str()))
            .map(|s| s.entry.clone())
            .collect();
        Ok(entries
            .into_iter()
            .map(|entry| self.storage.handle(&self.token, entry))
            .collect())
    }

    async fn create_child_folder(&self, name: &str) -> Result<DocumentRef, StorageError> {
        self.check("create_folder")?;
        let entry = self.insert_child(name, FOLDER_MIME_TYPE, true);
        Ok(self.storage.handle(&self.token, entry))
    }

    async fn create_child_file(
        &self,
        name: &str,
        mime_type: &str,
    ) -> Result<DocumentRef, StorageError> {
        self.check("create_file")?;
        let entry = self.insert_child(name, mime_type, false);
        Ok(self.storage.handle(&self.token, entry))
    }

    async fn upload_file(
        &mut self,
        source: &Path,
        listener: &SharedListener,
    ) -> Result<RemoteEntry, StorageError> {
        self.check("upload")?;
        self.storage.wait_gate(listener).await?;
        let data = tokio::fs::read(source).await?;
        self.store(data)
    }

    async fn upload_data(
        &mut self,
        data: Vec<u8>,
        listener: &SharedListener,
    ) -> Result<RemoteEntry, StorageError> {
        self.check("upload")?;
        self.storage.wait_gate(listener).await?;
        self.store(data)
    }

    async fn download_file(
        &self,
        target: &Path,
        listener: &SharedListener,
    ) -> Result<(), StorageError> {
        let data = self.download_data(listener).await?;
        tokio::fs::write(target, data).await?;
        Ok(())
    }

    async fn download_data(&self, listener: &SharedListener) -> Result<Vec<u8>, StorageError> {
        self.check("download")?;
        self.storage.wait_gate(listener).await?;
        let state = self.storage.state.lock().unwrap();
        state
            .entries
            .get(&self.entry.id)
            .map(|s| s.data.clone())
            .ok_or_else(|| StorageError::not_found(&self.entry.id))
    }
}
