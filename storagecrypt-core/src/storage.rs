use std::path::Path;

use async_trait::async_trait;
use url::Url;

use crate::error::{Reason, StorageError};
use crate::model::{
    Account, ConnectedAccount, Quota, RemoteChanges, RemoteEntry, StorageType, TokenGrant,
};
use crate::progress::{SharedListener, no_progress};

pub type DocumentRef = Box<dyn RemoteDocument>;

/// One provider, shared by every account of its type.
///
/// Implementations are pure I/O and protocol translation: every failure is
/// normalized into a [`Reason`] and no sync policy lives here.
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    fn storage_type(&self) -> StorageType;

    /// The app folder of the account.
    async fn root_folder(&self, account: &Account) -> Result<DocumentRef, StorageError>;

    async fn folder(&self, account: &Account, id: &str) -> Result<DocumentRef, StorageError> {
        let document = self.document(account, id).await?;
        if !document.entry().is_folder {
            return Err(StorageError::not_found(format!("folder {id}")));
        }
        Ok(document)
    }

    async fn file(&self, account: &Account, id: &str) -> Result<DocumentRef, StorageError> {
        let document = self.document(account, id).await?;
        if document.entry().is_folder {
            return Err(StorageError::not_found(format!("file {id}")));
        }
        Ok(document)
    }

    async fn document(&self, account: &Account, id: &str) -> Result<DocumentRef, StorageError>;

    fn oauth_authorize_url(&self, state: Option<&str>) -> Result<Url, StorageError>;

    async fn connect_with_access_code(&self, code: &str) -> Result<ConnectedAccount, StorageError>;

    async fn refresh_token(&self, account: &Account) -> Result<TokenGrant, StorageError>;

    async fn revoke_token(&self, account: &Account) -> Result<(), StorageError>;

    async fn refresh_quota(&self, account: &Account) -> Result<Quota, StorageError>;

    /// Changes since `last_change_id`, or a full snapshot plus the initial
    /// cursor when no cursor is known yet.
    async fn changes(
        &self,
        account: &Account,
        last_change_id: Option<&str>,
        listener: &SharedListener,
    ) -> Result<RemoteChanges, StorageError>;

    /// Deleting an entry that is already gone succeeds.
    async fn delete_file(&self, account: &Account, id: &str) -> Result<(), StorageError>;

    async fn delete_folder(&self, account: &Account, id: &str) -> Result<(), StorageError>;
}

/// Handle on one remote entry, bound to the account that fetched it.
#[async_trait]
pub trait RemoteDocument: Send + Sync {
    fn entry(&self) -> &RemoteEntry;

    async fn child_document(&self, name: &str) -> Result<DocumentRef, StorageError> {
        let listener = no_progress();
        self.child_documents(&listener)
            .await?
            .into_iter()
            .find(|child| child.entry().name == name)
            .ok_or_else(|| StorageError::not_found(format!("child {name}")))
    }

    async fn child_file(&self, name: &str) -> Result<DocumentRef, StorageError> {
        let child = self.child_document(name).await?;
        if child.entry().is_folder {
            return Err(StorageError::not_found(format!("file {name}")));
        }
        Ok(child)
    }

    async fn child_folder(&self, name: &str) -> Result<DocumentRef, StorageError> {
        let child = self.child_document(name).await?;
        if !child.entry().is_folder {
            return Err(StorageError::not_found(format!("folder {name}")));
        }
        Ok(child)
    }

    /// Full listing; pagination is handled inside.
    async fn child_documents(
        &self,
        listener: &SharedListener,
    ) -> Result<Vec<DocumentRef>, StorageError>;

    async fn create_child_folder(&self, name: &str) -> Result<DocumentRef, StorageError>;

    async fn create_child_file(&self, name: &str, mime_type: &str)
    -> Result<DocumentRef, StorageError>;

    async fn upload_new_child_file(
        &self,
        name: &str,
        mime_type: &str,
        source: &Path,
        listener: &SharedListener,
    ) -> Result<DocumentRef, StorageError> {
        let mut child = self.create_child_file(name, mime_type).await?;
        child.upload_file(source, listener).await?;
        Ok(child)
    }

    async fn upload_new_child_data(
        &self,
        name: &str,
        mime_type: &str,
        data: Vec<u8>,
        listener: &SharedListener,
    ) -> Result<DocumentRef, StorageError> {
        let mut child = self.create_child_file(name, mime_type).await?;
        child.upload_data(data, listener).await?;
        Ok(child)
    }

    /// Overwrites this entry and refreshes the cached snapshot.
    async fn upload_file(
        &mut self,
        source: &Path,
        listener: &SharedListener,
    ) -> Result<RemoteEntry, StorageError>;

    async fn upload_data(
        &mut self,
        data: Vec<u8>,
        listener: &SharedListener,
    ) -> Result<RemoteEntry, StorageError>;

    async fn download_file(&self, target: &Path, listener: &SharedListener)
    -> Result<(), StorageError>;

    async fn download_data(&self, listener: &SharedListener) -> Result<Vec<u8>, StorageError>;
}

/// Treats an already-absent entry as deleted.
pub fn ignore_not_found(result: Result<(), StorageError>) -> Result<(), StorageError> {
    match result {
        Err(err) if err.is(Reason::NotFound) => Ok(()),
        other => other,
    }
}
