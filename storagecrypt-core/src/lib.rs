pub mod error;
pub mod http;
pub mod model;
pub mod oauth;
pub mod progress;
pub mod providers;
pub mod scan;
pub mod storage;
pub mod transfer;

pub use error::{Reason, StorageError, classify_status};
pub use model::{
    Account, ChangesSyncState, ConnectedAccount, DEFAULT_FILE_MIME_TYPE, FOLDER_MIME_TYPE, Quota,
    RemoteChange, RemoteChanges, RemoteEntry, StorageType, TokenGrant, cursor_advances, now_millis,
    now_unix,
};
pub use oauth::{AppCredentials, OAuthClient, OAuthEndpoints, OAuthToken};
pub use progress::{
    NoProgress, Phase, ProgressListener, SharedListener, SyncControl, checkpoint, no_progress,
};
pub use providers::{DiskStorage, DriveStorage, SwiftConfig, SwiftStorage};
pub use storage::{DocumentRef, RemoteDocument, RemoteStorage, ignore_not_found};
pub use url::Url;
