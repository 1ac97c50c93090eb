use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool, migrate::Migrator};
use storagecrypt_core::{Account, ChangesSyncState, Quota, StorageType, TokenGrant};
use thiserror::Error;

use crate::model::{DocumentInput, EncryptedDocument, SyncAction, SyncState};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const DOCUMENT_COLUMNS: &str = "id, display_name, mime_type, is_folder, parent_id, local_file_name, size, key_alias, \
     local_modification_time, remote_modification_time, back_storage_type, back_storage_account, \
     back_entry_id, back_entry_version, back_entry_folder_id, back_entry_folder_last_subfolder_id, \
     upload_state, download_state, deletion_state, num_sync_failures, last_sync_failure_time, \
     last_sync_failure_reason";

const ACCOUNT_COLUMNS: &str = "id, storage_type, account_name, access_token, refresh_token, token_expiration_time, \
     root_folder_id, last_remote_change_id, quota_amount, quota_used, changes_sync_state, \
     last_too_many_requests_error_time, next_retry_delay, needs_reauth";

#[derive(Debug, Error)]
pub enum IndexError {
    /// The pool was closed; callers abort the current pass.
    #[error("index connection is closed")]
    ConnectionClosed,
    #[error("database error: {0}")]
    Sqlx(sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid {column} value: {value}")]
    InvalidValue { column: &'static str, value: String },
    #[error("document {0} not found")]
    DocumentNotFound(i64),
    #[error("account {0} not found")]
    AccountNotFound(i64),
    #[error("document {id}: {action} cannot move from {from} to {to}")]
    IllegalTransition {
        id: i64,
        action: &'static str,
        from: &'static str,
        to: &'static str,
    },
}

impl From<sqlx::Error> for IndexError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolClosed => IndexError::ConnectionClosed,
            other => IndexError::Sqlx(other),
        }
    }
}

impl IndexError {
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, IndexError::ConnectionClosed)
    }
}

/// Row store for accounts and documents.
#[derive(Clone)]
pub struct IndexStore {
    pool: SqlitePool,
}

impl IndexStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(db_path: &Path) -> Result<Self, IndexError> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Private in-memory database; one connection so every query sees it.
    pub async fn in_memory() -> Result<Self, IndexError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(SqliteConnectOptions::new().in_memory(true).foreign_keys(true))
            .await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn init(&self) -> Result<(), IndexError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    // Accounts

    pub async fn insert_account(&self, account: &Account) -> Result<Account, IndexError> {
        let result = sqlx::query(
            "INSERT INTO accounts (
                storage_type, account_name, access_token, refresh_token, token_expiration_time,
                root_folder_id, last_remote_change_id, quota_amount, quota_used,
                changes_sync_state, last_too_many_requests_error_time, next_retry_delay, needs_reauth
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )
        .bind(account.storage_type.as_str())
        .bind(&account.account_name)
        .bind(&account.access_token)
        .bind(&account.refresh_token)
        .bind(account.token_expiration_time)
        .bind(&account.root_folder_id)
        .bind(&account.last_remote_change_id)
        .bind(account.quota_amount)
        .bind(account.quota_used)
        .bind(account.changes_sync_state.as_str())
        .bind(account.last_too_many_requests_error_time)
        .bind(account.next_retry_delay)
        .bind(account.needs_reauth)
        .execute(&self.pool)
        .await?;
        let id = result.last_insert_rowid();
        self.get_account(id)
            .await?
            .ok_or(IndexError::AccountNotFound(id))
    }

    pub async fn get_account(&self, id: i64) -> Result<Option<Account>, IndexError> {
        let row = sqlx::query(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(account_from_row).transpose()
    }

    pub async fn find_account(
        &self,
        storage_type: StorageType,
        account_name: &str,
    ) -> Result<Option<Account>, IndexError> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE storage_type = ?1 AND account_name = ?2"
        ))
        .bind(storage_type.as_str())
        .bind(account_name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(account_from_row).transpose()
    }

    pub async fn list_accounts(&self) -> Result<Vec<Account>, IndexError> {
        let rows = sqlx::query(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY id ASC"))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(account_from_row).collect()
    }

    pub async fn update_tokens(&self, id: i64, grant: &TokenGrant) -> Result<(), IndexError> {
        let result = sqlx::query(
            "UPDATE accounts
             SET access_token = ?1, refresh_token = ?2, token_expiration_time = ?3, needs_reauth = 0
             WHERE id = ?4",
        )
        .bind(&grant.access_token)
        .bind(&grant.refresh_token)
        .bind(grant.expires_at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        expect_account(result.rows_affected(), id)
    }

    pub async fn update_quota(&self, id: i64, quota: Quota) -> Result<(), IndexError> {
        let result = sqlx::query("UPDATE accounts SET quota_amount = ?1, quota_used = ?2 WHERE id = ?3")
            .bind(quota.amount)
            .bind(quota.used)
            .bind(id)
            .execute(&self.pool)
            .await?;
        expect_account(result.rows_affected(), id)
    }

    pub async fn update_last_remote_change_id(
        &self,
        id: i64,
        cursor: Option<&str>,
    ) -> Result<(), IndexError> {
        let result = sqlx::query("UPDATE accounts SET last_remote_change_id = ?1 WHERE id = ?2")
            .bind(cursor)
            .bind(id)
            .execute(&self.pool)
            .await?;
        expect_account(result.rows_affected(), id)
    }

    pub async fn update_changes_sync_state(
        &self,
        id: i64,
        state: ChangesSyncState,
    ) -> Result<(), IndexError> {
        let result = sqlx::query("UPDATE accounts SET changes_sync_state = ?1 WHERE id = ?2")
            .bind(state.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        expect_account(result.rows_affected(), id)
    }

    pub async fn update_backoff(
        &self,
        id: i64,
        last_too_many_requests_error_time: Option<i64>,
        next_retry_delay: i64,
    ) -> Result<(), IndexError> {
        let result = sqlx::query(
            "UPDATE accounts SET last_too_many_requests_error_time = ?1, next_retry_delay = ?2 WHERE id = ?3",
        )
        .bind(last_too_many_requests_error_time)
        .bind(next_retry_delay)
        .bind(id)
        .execute(&self.pool)
        .await?;
        expect_account(result.rows_affected(), id)
    }

    pub async fn update_root_folder_id(
        &self,
        id: i64,
        root_folder_id: Option<&str>,
    ) -> Result<(), IndexError> {
        let result = sqlx::query("UPDATE accounts SET root_folder_id = ?1 WHERE id = ?2")
            .bind(root_folder_id)
            .bind(id)
            .execute(&self.pool)
            .await?;
        expect_account(result.rows_affected(), id)
    }

    pub async fn set_needs_reauth(&self, id: i64, needs_reauth: bool) -> Result<(), IndexError> {
        let result = sqlx::query("UPDATE accounts SET needs_reauth = ?1 WHERE id = ?2")
            .bind(needs_reauth)
            .bind(id)
            .execute(&self.pool)
            .await?;
        expect_account(result.rows_affected(), id)
    }

    /// Cascades to every document of the account.
    pub async fn delete_account(&self, id: i64) -> Result<(), IndexError> {
        sqlx::query("DELETE FROM accounts WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // Documents

    pub async fn insert_document(
        &self,
        input: &DocumentInput,
    ) -> Result<EncryptedDocument, IndexError> {
        let result = sqlx::query(
            "INSERT INTO documents (
                display_name, mime_type, is_folder, parent_id, local_file_name, size, key_alias,
                local_modification_time, remote_modification_time, back_storage_type,
                back_storage_account, back_entry_id, back_entry_version,
                upload_state, download_state, deletion_state
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
        )
        .bind(&input.display_name)
        .bind(&input.mime_type)
        .bind(input.is_folder)
        .bind(input.parent_id)
        .bind(&input.local_file_name)
        .bind(input.size)
        .bind(&input.key_alias)
        .bind(input.local_modification_time)
        .bind(input.remote_modification_time)
        .bind(input.back_storage_type.as_str())
        .bind(input.back_storage_account)
        .bind(&input.back_entry_id)
        .bind(input.back_entry_version)
        .bind(input.upload_state.as_str())
        .bind(input.download_state.as_str())
        .bind(input.deletion_state.as_str())
        .execute(&self.pool)
        .await?;
        self.require_document(result.last_insert_rowid()).await
    }

    pub async fn get_document(&self, id: i64) -> Result<Option<EncryptedDocument>, IndexError> {
        let row = sqlx::query(&format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    pub async fn require_document(&self, id: i64) -> Result<EncryptedDocument, IndexError> {
        self.get_document(id)
            .await?
            .ok_or(IndexError::DocumentNotFound(id))
    }

    pub async fn get_document_by_back_entry(
        &self,
        account_id: i64,
        back_entry_id: &str,
    ) -> Result<Option<EncryptedDocument>, IndexError> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE back_storage_account = ?1 AND back_entry_id = ?2"
        ))
        .bind(account_id)
        .bind(back_entry_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    pub async fn list_children(&self, parent_id: i64) -> Result<Vec<EncryptedDocument>, IndexError> {
        let rows = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE parent_id = ?1 ORDER BY display_name ASC"
        ))
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(document_from_row).collect()
    }

    /// Every document below `id`, parents before children.
    pub async fn list_descendants(&self, id: i64) -> Result<Vec<EncryptedDocument>, IndexError> {
        let rows = sqlx::query(&format!(
            "WITH RECURSIVE tree(tree_id, depth) AS (
                SELECT id, 1 FROM documents WHERE parent_id = ?1
                UNION ALL
                SELECT d.id, tree.depth + 1 FROM documents d JOIN tree ON d.parent_id = tree.tree_id
             )
             SELECT {DOCUMENT_COLUMNS} FROM documents JOIN tree ON documents.id = tree.tree_id
             ORDER BY tree.depth ASC, documents.id ASC"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(document_from_row).collect()
    }

    pub async fn list_account_documents(
        &self,
        account_id: i64,
    ) -> Result<Vec<EncryptedDocument>, IndexError> {
        let rows = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE back_storage_account = ?1 ORDER BY id ASC"
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(document_from_row).collect()
    }

    pub async fn root_document(
        &self,
        storage_type: StorageType,
        account_id: Option<i64>,
    ) -> Result<Option<EncryptedDocument>, IndexError> {
        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents
             WHERE parent_id IS NULL AND back_storage_type = ?1
                AND IFNULL(back_storage_account, -1) = IFNULL(?2, -1)"
        ))
        .bind(storage_type.as_str())
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    /// Returns the root of `(storage_type, account)`, creating it on first use.
    pub async fn ensure_root(
        &self,
        storage_type: StorageType,
        account_id: Option<i64>,
        display_name: &str,
        back_entry_id: Option<&str>,
    ) -> Result<EncryptedDocument, IndexError> {
        if let Some(root) = self.root_document(storage_type, account_id).await? {
            return Ok(root);
        }
        let mut input = DocumentInput::new(
            display_name,
            storagecrypt_core::FOLDER_MIME_TYPE,
            true,
            storage_type,
            account_id,
        );
        input.back_entry_id = back_entry_id.map(str::to_string);
        self.insert_document(&input).await
    }

    /// Cascades to every descendant.
    pub async fn delete_document(&self, id: i64) -> Result<(), IndexError> {
        sqlx::query("DELETE FROM documents WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Documents with a planned or running action, optionally for one account.
    pub async fn list_pending(
        &self,
        account_id: Option<i64>,
    ) -> Result<Vec<EncryptedDocument>, IndexError> {
        let rows = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents
             WHERE (upload_state IN ('planned', 'running')
                 OR download_state IN ('planned', 'running')
                 OR deletion_state IN ('planned', 'running'))
                AND (?1 IS NULL OR back_storage_account = ?1)
             ORDER BY id ASC"
        ))
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(document_from_row).collect()
    }

    /// Moves every Running action back to Planned and returns the touched ids.
    pub async fn reset_running_states(&self) -> Result<Vec<i64>, IndexError> {
        let ids: Vec<i64> = sqlx::query(
            "SELECT id FROM documents
             WHERE upload_state = 'running' OR download_state = 'running' OR deletion_state = 'running'",
        )
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| row.try_get::<i64, _>("id"))
        .collect::<Result<_, _>>()?;
        sqlx::query(
            "UPDATE documents SET
                upload_state = CASE upload_state WHEN 'running' THEN 'planned' ELSE upload_state END,
                download_state = CASE download_state WHEN 'running' THEN 'planned' ELSE download_state END,
                deletion_state = CASE deletion_state WHEN 'running' THEN 'planned' ELSE deletion_state END
             WHERE upload_state = 'running' OR download_state = 'running' OR deletion_state = 'running'",
        )
        .execute(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Applies a state change only along an allowed edge.
    pub async fn update_sync_state(
        &self,
        id: i64,
        action: SyncAction,
        state: SyncState,
    ) -> Result<(), IndexError> {
        let column = action.column();
        let allowed: Vec<&str> = ALL_STATES
            .iter()
            .filter(|from| from.can_transition(state))
            .map(|from| from.as_str())
            .collect();
        let placeholders = (0..allowed.len())
            .map(|i| format!("?{}", i + 3))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE documents SET {column} = ?1 WHERE id = ?2 AND {column} IN ({placeholders})"
        );
        let mut query = sqlx::query(&sql).bind(state.as_str()).bind(id);
        for from in &allowed {
            query = query.bind(*from);
        }
        let result = query.execute(&self.pool).await?;
        if result.rows_affected() > 0 {
            return Ok(());
        }
        let current = self.require_document(id).await?.state(action);
        Err(IndexError::IllegalTransition {
            id,
            action: action.as_str(),
            from: current.as_str(),
            to: state.as_str(),
        })
    }

    /// Records the remote identity of a document. For the same remote entry
    /// the update is refused (returns `false`) unless `version` is strictly
    /// newer than the stored one, so a stale response never overwrites
    /// fresher metadata. A different entry id replaces the old one.
    pub async fn update_back_entry(
        &self,
        id: i64,
        back_entry_id: &str,
        version: Option<i64>,
        remote_modification_time: Option<i64>,
    ) -> Result<bool, IndexError> {
        let result = sqlx::query(
            "UPDATE documents
             SET back_entry_id = ?1, back_entry_version = ?2,
                 remote_modification_time = COALESCE(?3, remote_modification_time)
             WHERE id = ?4
                AND (back_entry_id IS NULL OR back_entry_id != ?1 OR back_entry_version IS NULL
                    OR (?2 IS NOT NULL AND ?2 > back_entry_version))",
        )
        .bind(back_entry_id)
        .bind(version)
        .bind(remote_modification_time)
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            self.require_document(id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    /// Forgets the remote identity of a document whose entry is gone, so
    /// the next upload creates a fresh one.
    pub async fn clear_back_entry(&self, id: i64) -> Result<(), IndexError> {
        let result = sqlx::query(
            "UPDATE documents
             SET back_entry_id = NULL, back_entry_version = NULL, remote_modification_time = NULL,
                 back_entry_folder_id = NULL, back_entry_folder_last_subfolder_id = NULL
             WHERE id = ?1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        expect_document(result.rows_affected(), id)
    }

    pub async fn update_local_file(
        &self,
        id: i64,
        local_file_name: Option<&str>,
        size: Option<i64>,
        local_modification_time: Option<i64>,
    ) -> Result<(), IndexError> {
        let result = sqlx::query(
            "UPDATE documents SET local_file_name = ?1, size = ?2, local_modification_time = ?3 WHERE id = ?4",
        )
        .bind(local_file_name)
        .bind(size)
        .bind(local_modification_time)
        .bind(id)
        .execute(&self.pool)
        .await?;
        expect_document(result.rows_affected(), id)
    }

    pub async fn update_metadata(
        &self,
        id: i64,
        display_name: &str,
        mime_type: &str,
        parent_id: Option<i64>,
    ) -> Result<(), IndexError> {
        let result = sqlx::query(
            "UPDATE documents SET display_name = ?1, mime_type = ?2, parent_id = ?3 WHERE id = ?4",
        )
        .bind(display_name)
        .bind(mime_type)
        .bind(parent_id)
        .bind(id)
        .execute(&self.pool)
        .await?;
        expect_document(result.rows_affected(), id)
    }

    pub async fn update_key_alias(&self, id: i64, key_alias: &str) -> Result<(), IndexError> {
        let result = sqlx::query("UPDATE documents SET key_alias = ?1 WHERE id = ?2")
            .bind(key_alias)
            .bind(id)
            .execute(&self.pool)
            .await?;
        expect_document(result.rows_affected(), id)
    }

    /// Bumps the failure counter and returns its new value.
    pub async fn record_sync_failure(
        &self,
        id: i64,
        at_millis: i64,
        reason: &str,
    ) -> Result<i64, IndexError> {
        let row = sqlx::query(
            "UPDATE documents
             SET num_sync_failures = num_sync_failures + 1,
                 last_sync_failure_time = ?1,
                 last_sync_failure_reason = ?2
             WHERE id = ?3
             RETURNING num_sync_failures",
        )
        .bind(at_millis)
        .bind(reason)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(IndexError::DocumentNotFound(id))?;
        Ok(row.try_get("num_sync_failures")?)
    }

    pub async fn reset_sync_failures(&self, id: i64) -> Result<(), IndexError> {
        sqlx::query(
            "UPDATE documents
             SET num_sync_failures = 0, last_sync_failure_time = NULL, last_sync_failure_reason = NULL
             WHERE id = ?1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

const ALL_STATES: [SyncState; 5] = [
    SyncState::Queued,
    SyncState::Planned,
    SyncState::Running,
    SyncState::Done,
    SyncState::Failed,
];

fn expect_account(rows_affected: u64, id: i64) -> Result<(), IndexError> {
    if rows_affected == 0 {
        return Err(IndexError::AccountNotFound(id));
    }
    Ok(())
}

fn expect_document(rows_affected: u64, id: i64) -> Result<(), IndexError> {
    if rows_affected == 0 {
        return Err(IndexError::DocumentNotFound(id));
    }
    Ok(())
}

fn parse_storage_type(value: String) -> Result<StorageType, IndexError> {
    StorageType::parse(&value).ok_or(IndexError::InvalidValue {
        column: "storage_type",
        value,
    })
}

fn parse_sync_state(column: &'static str, value: String) -> Result<SyncState, IndexError> {
    SyncState::parse(&value).ok_or(IndexError::InvalidValue { column, value })
}

fn account_from_row(row: &SqliteRow) -> Result<Account, IndexError> {
    let changes_state: String = row.try_get("changes_sync_state")?;
    Ok(Account {
        id: row.try_get("id")?,
        storage_type: parse_storage_type(row.try_get("storage_type")?)?,
        account_name: row.try_get("account_name")?,
        access_token: row.try_get("access_token")?,
        refresh_token: row.try_get("refresh_token")?,
        token_expiration_time: row.try_get("token_expiration_time")?,
        root_folder_id: row.try_get("root_folder_id")?,
        last_remote_change_id: row.try_get("last_remote_change_id")?,
        quota_amount: row.try_get("quota_amount")?,
        quota_used: row.try_get("quota_used")?,
        changes_sync_state: ChangesSyncState::parse(&changes_state).ok_or(
            IndexError::InvalidValue {
                column: "changes_sync_state",
                value: changes_state.clone(),
            },
        )?,
        last_too_many_requests_error_time: row.try_get("last_too_many_requests_error_time")?,
        next_retry_delay: row.try_get("next_retry_delay")?,
        needs_reauth: row.try_get("needs_reauth")?,
    })
}

fn document_from_row(row: &SqliteRow) -> Result<EncryptedDocument, IndexError> {
    Ok(EncryptedDocument {
        id: row.try_get("id")?,
        display_name: row.try_get("display_name")?,
        mime_type: row.try_get("mime_type")?,
        is_folder: row.try_get("is_folder")?,
        parent_id: row.try_get("parent_id")?,
        local_file_name: row.try_get("local_file_name")?,
        size: row.try_get("size")?,
        key_alias: row.try_get("key_alias")?,
        local_modification_time: row.try_get("local_modification_time")?,
        remote_modification_time: row.try_get("remote_modification_time")?,
        back_storage_type: parse_storage_type(row.try_get("back_storage_type")?)?,
        back_storage_account: row.try_get("back_storage_account")?,
        back_entry_id: row.try_get("back_entry_id")?,
        back_entry_version: row.try_get("back_entry_version")?,
        back_entry_folder_id: row.try_get("back_entry_folder_id")?,
        back_entry_folder_last_subfolder_id: row.try_get("back_entry_folder_last_subfolder_id")?,
        upload_state: parse_sync_state("upload_state", row.try_get("upload_state")?)?,
        download_state: parse_sync_state("download_state", row.try_get("download_state")?)?,
        deletion_state: parse_sync_state("deletion_state", row.try_get("deletion_state")?)?,
        num_sync_failures: row.try_get("num_sync_failures")?,
        last_sync_failure_time: row.try_get("last_sync_failure_time")?,
        last_sync_failure_reason: row.try_get("last_sync_failure_reason")?,
    })
}

#[cfg(test)]
#[path = "index_tests.rs"]
mod tests;
