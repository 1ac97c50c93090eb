use serde::Serialize;
use storagecrypt_core::StorageType;

/// One of the three independent operations tracked per document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Upload,
    Download,
    Deletion,
}

impl SyncAction {
    /// Most urgent first.
    pub const PRIORITY: [SyncAction; 3] =
        [SyncAction::Deletion, SyncAction::Upload, SyncAction::Download];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::Upload => "upload",
            SyncAction::Download => "download",
            SyncAction::Deletion => "deletion",
        }
    }

    pub(crate) fn column(&self) -> &'static str {
        match self {
            SyncAction::Upload => "upload_state",
            SyncAction::Download => "download_state",
            SyncAction::Deletion => "deletion_state",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Queued,
    Planned,
    Running,
    Done,
    Failed,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Queued => "queued",
            SyncState::Planned => "planned",
            SyncState::Running => "running",
            SyncState::Done => "done",
            SyncState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(SyncState::Queued),
            "planned" => Some(SyncState::Planned),
            "running" => Some(SyncState::Running),
            "done" => Some(SyncState::Done),
            "failed" => Some(SyncState::Failed),
            _ => None,
        }
    }

    /// Running is entered only from Queued or Planned and left only for
    /// Done or Failed; Planned stays reachable from anywhere so an in-flight
    /// action can be restarted.
    pub fn can_transition(self, next: SyncState) -> bool {
        match next {
            SyncState::Running => matches!(self, SyncState::Queued | SyncState::Planned),
            SyncState::Done | SyncState::Failed => self == SyncState::Running,
            SyncState::Planned => true,
            SyncState::Queued => matches!(self, SyncState::Done | SyncState::Failed),
        }
    }

    pub fn is_pending(self) -> bool {
        matches!(self, SyncState::Planned | SyncState::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EncryptedDocument {
    pub id: i64,
    pub display_name: String,
    pub mime_type: String,
    pub is_folder: bool,
    /// `None` for a root.
    pub parent_id: Option<i64>,
    pub local_file_name: Option<String>,
    pub size: Option<i64>,
    pub key_alias: Option<String>,
    /// Unix milliseconds.
    pub local_modification_time: Option<i64>,
    /// Unix milliseconds.
    pub remote_modification_time: Option<i64>,
    pub back_storage_type: StorageType,
    pub back_storage_account: Option<i64>,
    pub back_entry_id: Option<String>,
    pub back_entry_version: Option<i64>,
    pub back_entry_folder_id: Option<String>,
    pub back_entry_folder_last_subfolder_id: Option<String>,
    pub upload_state: SyncState,
    pub download_state: SyncState,
    pub deletion_state: SyncState,
    pub num_sync_failures: i64,
    pub last_sync_failure_time: Option<i64>,
    pub last_sync_failure_reason: Option<String>,
}

impl EncryptedDocument {
    pub fn state(&self, action: SyncAction) -> SyncState {
        match action {
            SyncAction::Upload => self.upload_state,
            SyncAction::Download => self.download_state,
            SyncAction::Deletion => self.deletion_state,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn has_pending_action(&self) -> bool {
        SyncAction::PRIORITY
            .iter()
            .any(|action| self.state(*action).is_pending())
    }

    /// The action a worker should run next, if any is planned.
    pub fn next_action(&self) -> Option<SyncAction> {
        SyncAction::PRIORITY
            .into_iter()
            .find(|action| self.state(*action) == SyncState::Planned)
    }

    pub fn is_synchronized(&self) -> bool {
        self.back_storage_type.is_synchronized()
    }
}

/// Fields supplied when a row is created.
#[derive(Debug, Clone)]
pub struct DocumentInput {
    pub display_name: String,
    pub mime_type: String,
    pub is_folder: bool,
    pub parent_id: Option<i64>,
    pub local_file_name: Option<String>,
    pub size: Option<i64>,
    pub key_alias: Option<String>,
    pub local_modification_time: Option<i64>,
    pub remote_modification_time: Option<i64>,
    pub back_storage_type: StorageType,
    pub back_storage_account: Option<i64>,
    pub back_entry_id: Option<String>,
    pub back_entry_version: Option<i64>,
    pub upload_state: SyncState,
    pub download_state: SyncState,
    pub deletion_state: SyncState,
}

impl DocumentInput {
    /// A folder or file row with every action Done.
    pub fn new(
        display_name: impl Into<String>,
        mime_type: impl Into<String>,
        is_folder: bool,
        back_storage_type: StorageType,
        back_storage_account: Option<i64>,
    ) -> Self {
        Self {
            display_name: display_name.into(),
            mime_type: mime_type.into(),
            is_folder,
            parent_id: None,
            local_file_name: None,
            size: None,
            key_alias: None,
            local_modification_time: None,
            remote_modification_time: None,
            back_storage_type,
            back_storage_account,
            back_entry_id: None,
            back_entry_version: None,
            upload_state: SyncState::Done,
            download_state: SyncState::Done,
            deletion_state: SyncState::Done,
        }
    }

    pub fn with_parent(mut self, parent_id: i64) -> Self {
        self.parent_id = Some(parent_id);
        self
    }
}
