use std::cmp::Ordering;
use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Reason, StorageError};

pub const FOLDER_MIME_TYPE: &str = "application/vnd.storagecrypt.folder";
pub const DEFAULT_FILE_MIME_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Unsynchronized,
    Drive,
    Disk,
    Swift,
}

impl StorageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageType::Unsynchronized => "unsynchronized",
            StorageType::Drive => "drive",
            StorageType::Disk => "disk",
            StorageType::Swift => "swift",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unsynchronized" => Some(StorageType::Unsynchronized),
            "drive" => Some(StorageType::Drive),
            "disk" => Some(StorageType::Disk),
            "swift" => Some(StorageType::Swift),
            _ => None,
        }
    }

    pub fn is_synchronized(&self) -> bool {
        !matches!(self, StorageType::Unsynchronized)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangesSyncState {
    Done,
    Planned,
    Running,
    Failed,
}

impl ChangesSyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangesSyncState::Done => "done",
            ChangesSyncState::Planned => "planned",
            ChangesSyncState::Running => "running",
            ChangesSyncState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "done" => Some(ChangesSyncState::Done),
            "planned" => Some(ChangesSyncState::Planned),
            "running" => Some(ChangesSyncState::Running),
            "failed" => Some(ChangesSyncState::Failed),
            _ => None,
        }
    }
}

/// Snapshot of a connected cloud account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: i64,
    pub storage_type: StorageType,
    pub account_name: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    /// Unix seconds.
    pub token_expiration_time: Option<i64>,
    pub root_folder_id: Option<String>,
    pub last_remote_change_id: Option<String>,
    pub quota_amount: Option<i64>,
    pub quota_used: Option<i64>,
    pub changes_sync_state: ChangesSyncState,
    /// Unix milliseconds.
    pub last_too_many_requests_error_time: Option<i64>,
    /// Milliseconds; zero when the account is not throttled.
    pub next_retry_delay: i64,
    pub needs_reauth: bool,
}

impl Account {
    /// Unsaved account without credentials.
    pub fn new(storage_type: StorageType, account_name: impl Into<String>) -> Self {
        Self {
            id: 0,
            storage_type,
            account_name: account_name.into(),
            access_token: None,
            refresh_token: None,
            token_expiration_time: None,
            root_folder_id: None,
            last_remote_change_id: None,
            quota_amount: None,
            quota_used: None,
            changes_sync_state: ChangesSyncState::Done,
            last_too_many_requests_error_time: None,
            next_retry_delay: 0,
            needs_reauth: false,
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn access_token(&self) -> Result<&str, StorageError> {
        self.access_token
            .as_deref()
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                StorageError::new(
                    Reason::AccessTokenIsNull,
                    format!("account {} has no access token", self.account_name),
                )
            })
    }

    pub fn token_expires_within(&self, now_secs: i64, skew_secs: i64) -> bool {
        match self.token_expiration_time {
            Some(expires_at) => expires_at <= now_secs.saturating_add(skew_secs),
            None => false,
        }
    }
}

/// Metadata of one remote entry as reported by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub is_folder: bool,
    pub parent_id: Option<String>,
    pub size: Option<i64>,
    pub version: Option<i64>,
    /// Unix milliseconds.
    pub modified: Option<i64>,
    pub hash: Option<String>,
}

impl RemoteEntry {
    pub fn folder(id: impl Into<String>, name: impl Into<String>, parent_id: Option<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            mime_type: FOLDER_MIME_TYPE.to_string(),
            is_folder: true,
            parent_id,
            size: None,
            version: None,
            modified: None,
            hash: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteChange {
    Deletion { id: String },
    Modification(RemoteEntry),
}

impl RemoteChange {
    pub fn id(&self) -> &str {
        match self {
            RemoteChange::Deletion { id } => id,
            RemoteChange::Modification(entry) => &entry.id,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteChanges {
    pub changes: Vec<RemoteChange>,
    pub cursor: Option<String>,
    /// Every entry id seen when the changes came from a full scan. Entries
    /// missing from this set were removed remotely.
    pub scanned_ids: Option<HashSet<String>>,
}

impl RemoteChanges {
    pub fn modifications(&self) -> impl Iterator<Item = &RemoteEntry> {
        self.changes.iter().filter_map(|change| match change {
            RemoteChange::Modification(entry) => Some(entry),
            RemoteChange::Deletion { .. } => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix seconds.
    pub expires_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub amount: Option<i64>,
    pub used: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedAccount {
    pub account_name: String,
    pub grant: TokenGrant,
    pub root_folder_id: Option<String>,
}

/// Whether `next` moves the change cursor forward from `current`.
///
/// Numeric cursors compare as integers, anything else lexically.
pub fn cursor_advances(current: Option<&str>, next: &str) -> bool {
    let Some(current) = current else {
        return true;
    };
    let ordering = match (current.parse::<i64>(), next.parse::<i64>()) {
        (Ok(current), Ok(next)) => next.cmp(&current),
        _ => next.cmp(current),
    };
    ordering == Ordering::Greater
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub fn now_unix() -> i64 {
    now_millis() / 1000
}
