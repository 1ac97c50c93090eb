use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use storagecrypt_core::{
    Account, DiskStorage, DriveStorage, Reason, RemoteStorage, StorageError, StorageType,
    SwiftStorage, Url, now_millis, now_unix,
};

use crate::backoff::RateLimitPolicy;
use crate::config::ProviderKeys;
use crate::error::SyncError;
use crate::index::IndexStore;

const REFRESH_SKEW_SECS: i64 = 60;

/// Provider instances by storage type.
#[derive(Default, Clone)]
pub struct StorageRegistry {
    storages: HashMap<StorageType, Arc<dyn RemoteStorage>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers every provider whose app keys are configured.
    pub fn from_keys(keys: &ProviderKeys) -> Result<Self, StorageError> {
        let mut registry = Self::new();
        if let Some(credentials) = &keys.drive {
            registry.register(Arc::new(DriveStorage::new(credentials.clone())?));
        }
        if let Some(credentials) = &keys.disk {
            registry.register(Arc::new(DiskStorage::new(credentials.clone())?));
        }
        if let Some((config, credentials)) = &keys.swift {
            registry.register(Arc::new(SwiftStorage::new(
                config.clone(),
                credentials.clone(),
            )?));
        }
        Ok(registry)
    }

    pub fn register(&mut self, storage: Arc<dyn RemoteStorage>) {
        self.storages.insert(storage.storage_type(), storage);
    }

    pub fn get(&self, storage_type: StorageType) -> Result<Arc<dyn RemoteStorage>, StorageError> {
        self.storages.get(&storage_type).cloned().ok_or_else(|| {
            StorageError::new(
                Reason::AppKeysNotFound,
                format!("no app keys configured for {}", storage_type.as_str()),
            )
        })
    }

    pub fn types(&self) -> Vec<StorageType> {
        let mut types: Vec<_> = self.storages.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }
}

/// Hands out accounts with usable tokens and enforces per-account
/// rate-limit backoff.
pub struct AccountManager {
    index: IndexStore,
    storages: StorageRegistry,
    policy: RateLimitPolicy,
    refresh_locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
    backoff_locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl AccountManager {
    pub fn new(index: IndexStore, storages: StorageRegistry, policy: RateLimitPolicy) -> Self {
        Self {
            index,
            storages,
            policy,
            refresh_locks: Mutex::new(HashMap::new()),
            backoff_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn storages(&self) -> &StorageRegistry {
        &self.storages
    }

    pub async fn account(&self, id: i64) -> Result<Account, SyncError> {
        self.index
            .get_account(id)
            .await?
            .ok_or_else(|| SyncError::account_not_found(id))
    }

    /// The account with a token that is not about to expire.
    pub async fn refreshed_account(&self, id: i64) -> Result<Account, SyncError> {
        let account = self.account(id).await?;
        if !account.token_expires_within(now_unix(), REFRESH_SKEW_SECS) {
            return Ok(account);
        }
        let lock = self.refresh_lock(id);
        let _guard = lock.lock().await;
        // Another caller may have refreshed while we waited.
        let account = self.account(id).await?;
        if !account.token_expires_within(now_unix(), REFRESH_SKEW_SECS) {
            return Ok(account);
        }
        self.refresh_locked(account).await
    }

    /// Refreshes after the provider rejected `stale_token`, unless a
    /// concurrent caller already replaced it.
    pub async fn force_refresh(
        &self,
        id: i64,
        stale_token: Option<&str>,
    ) -> Result<Account, SyncError> {
        let lock = self.refresh_lock(id);
        let _guard = lock.lock().await;
        let account = self.account(id).await?;
        if account.access_token.as_deref() != stale_token {
            return Ok(account);
        }
        self.refresh_locked(account).await
    }

    async fn refresh_locked(&self, account: Account) -> Result<Account, SyncError> {
        let storage = self.storages.get(account.storage_type)?;
        let grant = match storage.refresh_token(&account).await {
            Ok(grant) => grant,
            Err(err) if err.is(Reason::Unauthorized) => {
                return Err(self.mark_revoked(account.id, err.message()).await);
            }
            Err(err) => return Err(err.into()),
        };
        self.index.update_tokens(account.id, &grant).await?;
        tracing::info!(account_id = account.id, "access token refreshed");
        self.account(account.id).await
    }

    fn refresh_lock(&self, id: i64) -> Arc<tokio::sync::Mutex<()>> {
        account_lock(&self.refresh_locks, id)
    }

    async fn mark_revoked(&self, id: i64, message: &str) -> SyncError {
        tracing::warn!(account_id = id, "authorization revoked: {message}");
        if let Err(err) = self.index.set_needs_reauth(id, true).await {
            return err.into();
        }
        StorageError::new(Reason::AuthRevoked, format!("account {id} needs to sign in again"))
            .into()
    }

    /// Fails fast with `TooManyRequests` while the account is throttled.
    pub fn check_backoff_at(&self, account: &Account, now_ms: i64) -> Result<(), StorageError> {
        match RateLimitPolicy::remaining(
            account.last_too_many_requests_error_time,
            account.next_retry_delay,
            now_ms,
        ) {
            Some(remaining) => Err(StorageError::new(
                Reason::TooManyRequests,
                format!("account {} is throttled for {remaining} ms", account.id),
            )
            .with_retry_after(Some(Duration::from_millis(remaining as u64)))),
            None => Ok(()),
        }
    }

    /// Grows the backoff after a throttled response and returns the new delay.
    ///
    /// The delay grows from the stored value, not from `account`, so
    /// concurrent throttled calls each double it.
    pub async fn record_too_many_requests_at(
        &self,
        account: &Account,
        retry_after: Option<Duration>,
        now_ms: i64,
    ) -> Result<i64, SyncError> {
        let lock = account_lock(&self.backoff_locks, account.id);
        let _guard = lock.lock().await;
        let current = self.account(account.id).await?;
        let delay = self.policy.next_delay(current.next_retry_delay, retry_after);
        self.index
            .update_backoff(account.id, Some(now_ms), delay)
            .await?;
        tracing::warn!(account_id = account.id, delay_ms = delay, "provider is throttling requests");
        Ok(delay)
    }

    async fn record_success(&self, account: &Account) -> Result<(), SyncError> {
        if account.next_retry_delay != 0 || account.last_too_many_requests_error_time.is_some() {
            self.index.update_backoff(account.id, None, 0).await?;
        }
        Ok(())
    }

    /// Runs `op` against the account's provider.
    ///
    /// An `Unauthorized` answer triggers one forced refresh and a single
    /// retry; a second one marks the account as needing re-authentication
    /// and fails with `AuthRevoked`.
    pub async fn call<T, F, Fut>(&self, id: i64, op: F) -> Result<T, SyncError>
    where
        F: Fn(Arc<dyn RemoteStorage>, Account) -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        // Neither a throttled nor a revoked account may reach the provider,
        // token refresh included.
        let stored = self.account(id).await?;
        if stored.needs_reauth {
            return Err(StorageError::new(
                Reason::AuthRevoked,
                format!("account {id} needs to sign in again"),
            )
            .into());
        }
        self.check_backoff_at(&stored, now_millis())?;
        let account = self.refreshed_account(id).await?;
        let storage = self.storages.get(account.storage_type)?;

        let err = match op(Arc::clone(&storage), account.clone()).await {
            Ok(value) => {
                self.record_success(&account).await?;
                return Ok(value);
            }
            Err(err) if err.is(Reason::Unauthorized) => err,
            Err(err) => return Err(self.note_failure(&account, err).await),
        };

        tracing::debug!(account_id = id, "request unauthorized, refreshing: {err}");
        let account = self.force_refresh(id, account.access_token.as_deref()).await?;
        match op(storage, account.clone()).await {
            Ok(value) => {
                self.record_success(&account).await?;
                Ok(value)
            }
            Err(err) if err.is(Reason::Unauthorized) => {
                Err(self.mark_revoked(id, err.message()).await)
            }
            Err(err) => Err(self.note_failure(&account, err).await),
        }
    }

    async fn note_failure(&self, account: &Account, err: StorageError) -> SyncError {
        if err.is(Reason::TooManyRequests) {
            if let Err(index_err) = self
                .record_too_many_requests_at(account, err.retry_after(), now_millis())
                .await
            {
                return index_err;
            }
        }
        err.into()
    }

    pub fn authorize_url(
        &self,
        storage_type: StorageType,
        state: Option<&str>,
    ) -> Result<Url, SyncError> {
        Ok(self.storages.get(storage_type)?.oauth_authorize_url(state)?)
    }

    /// Exchanges an authorization code and stores the account with its root
    /// document. Reconnecting an existing account replaces its tokens.
    pub async fn connect_account(
        &self,
        storage_type: StorageType,
        code: &str,
    ) -> Result<Account, SyncError> {
        let storage = self.storages.get(storage_type)?;
        let connected = storage.connect_with_access_code(code).await?;
        let account = match self
            .index
            .find_account(storage_type, &connected.account_name)
            .await?
        {
            Some(existing) => {
                self.index.update_tokens(existing.id, &connected.grant).await?;
                self.index
                    .update_root_folder_id(existing.id, connected.root_folder_id.as_deref())
                    .await?;
                self.account(existing.id).await?
            }
            None => {
                let mut account = Account::new(storage_type, &connected.account_name);
                account.access_token = Some(connected.grant.access_token.clone());
                account.refresh_token = connected.grant.refresh_token.clone();
                account.token_expiration_time = connected.grant.expires_at;
                account.root_folder_id = connected.root_folder_id.clone();
                self.index.insert_account(&account).await?
            }
        };
        self.index
            .ensure_root(
                storage_type,
                Some(account.id),
                &account.account_name,
                account.root_folder_id.as_deref(),
            )
            .await?;
        tracing::info!(account_id = account.id, storage = storage_type.as_str(), "account connected");
        Ok(account)
    }

    /// Revokes the token (best effort) and drops the account with all of
    /// its documents.
    pub async fn remove_account(&self, id: i64) -> Result<(), SyncError> {
        let account = self.account(id).await?;
        match self.storages.get(account.storage_type) {
            Ok(storage) => {
                if let Err(err) = storage.revoke_token(&account).await {
                    tracing::warn!(account_id = id, "token revocation failed: {err}");
                }
            }
            Err(err) => tracing::warn!(account_id = id, "cannot revoke token: {err}"),
        }
        self.index.delete_account(id).await?;
        tracing::info!(account_id = id, "account removed");
        Ok(())
    }

    pub async fn refresh_quota(&self, id: i64) -> Result<(), SyncError> {
        let quota = self
            .call(id, |storage, account| async move {
                storage.refresh_quota(&account).await
            })
            .await?;
        self.index.update_quota(id, quota).await?;
        Ok(())
    }
}

fn account_lock(
    locks: &Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
    id: i64,
) -> Arc<tokio::sync::Mutex<()>> {
    let mut locks = locks.lock().unwrap_or_else(|e| e.into_inner());
    Arc::clone(locks.entry(id).or_default())
}
