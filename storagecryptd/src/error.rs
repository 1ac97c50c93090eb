use std::path::PathBuf;
use std::time::Duration;

use storagecrypt_core::{Reason, StorageError};
use thiserror::Error;

use crate::crypto::CryptoError;
use crate::index::IndexError;
use crate::paths::PathError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("document {0} has no local content")]
    MissingLocalFile(i64),
    #[error("document {0} is not synchronized with any account")]
    NotSynchronized(i64),
    #[error("document {0} is not a folder")]
    NotAFolder(i64),
    #[error("cannot import {0}")]
    UnsupportedPath(PathBuf),
    #[error("sync service is stopped")]
    Stopped,
}

impl SyncError {
    /// Taxonomy value the engines branch on.
    pub fn reason(&self) -> Reason {
        match self {
            SyncError::Storage(err) => err.reason(),
            SyncError::Crypto(CryptoError::Canceled) => Reason::UserCanceled,
            SyncError::Crypto(CryptoError::KeysNotFound(_)) => Reason::AppKeysNotFound,
            SyncError::Crypto(CryptoError::Io(_)) | SyncError::Io(_) => Reason::Io,
            SyncError::Crypto(CryptoError::InvalidHeader)
            | SyncError::Crypto(CryptoError::Tampered)
            | SyncError::Crypto(CryptoError::Truncated) => Reason::InvalidResponse,
            SyncError::Stopped => Reason::UserCanceled,
            _ => Reason::Other,
        }
    }

    /// Persistence is gone; the current pass must stop without touching state.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, SyncError::Index(err) if err.is_connection_closed())
    }

    /// Delay requested by the provider, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::Storage(err) => err.retry_after(),
            _ => None,
        }
    }

    pub fn account_not_found(id: i64) -> Self {
        SyncError::Storage(StorageError::new(
            Reason::AccountNotFound,
            format!("account {id}"),
        ))
    }
}
