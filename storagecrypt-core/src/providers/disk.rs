use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use url::Url;

use super::{DEFAULT_PAGE_SIZE, child_path, rfc3339_millis};
use crate::error::{Reason, StorageError};
use crate::http::{self, AuthScheme};
use crate::model::{
    Account, ConnectedAccount, DEFAULT_FILE_MIME_TYPE, FOLDER_MIME_TYPE, Quota, RemoteChanges,
    RemoteEntry, StorageType, TokenGrant,
};
use crate::oauth::{AppCredentials, OAuthClient};
use crate::progress::{Phase, SharedListener, checkpoint};
use crate::scan::{scan_tree, snapshot_changes};
use crate::storage::{DocumentRef, RemoteDocument, RemoteStorage, ignore_not_found};
use crate::transfer::{self, TransferLimits};

const DEFAULT_API_BASE: &str = "https://cloud-api.yandex.net";
const DEFAULT_OAUTH_BASE: &str = "https://oauth.yandex.com";
const APP_ROOT: &str = "app:/";
const OPERATION_POLL_INTERVAL: Duration = Duration::from_millis(500);
const OPERATION_MAX_POLLS: u32 = 240;

/// Path-addressed provider without a change feed; every pass rescans.
pub struct DiskStorage {
    api: Arc<DiskApi>,
    oauth: OAuthClient,
}

struct DiskApi {
    http: Client,
    base_url: Url,
    page_size: u32,
    poll_interval: Duration,
    limits: TransferLimits,
}

impl DiskStorage {
    pub fn new(credentials: AppCredentials) -> Result<Self, StorageError> {
        Self::build(
            DEFAULT_API_BASE,
            OAuthClient::with_base_url(DEFAULT_OAUTH_BASE, credentials)?,
        )
    }

    pub fn with_base_url(base_url: &str, credentials: AppCredentials) -> Result<Self, StorageError> {
        Self::build(base_url, OAuthClient::with_base_url(base_url, credentials)?)
    }

    fn build(base_url: &str, oauth: OAuthClient) -> Result<Self, StorageError> {
        Ok(Self {
            api: Arc::new(DiskApi {
                http: Client::new(),
                base_url: Url::parse(base_url)?,
                page_size: DEFAULT_PAGE_SIZE,
                poll_interval: OPERATION_POLL_INTERVAL,
                limits: TransferLimits::new(),
            }),
            oauth,
        })
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        if let Some(api) = Arc::get_mut(&mut self.api) {
            api.page_size = page_size.max(1);
        }
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        if let Some(api) = Arc::get_mut(&mut self.api) {
            api.poll_interval = interval;
        }
        self
    }

    fn document_for(&self, token: &str, entry: RemoteEntry) -> DocumentRef {
        Box::new(DiskDocument {
            api: Arc::clone(&self.api),
            token: token.to_string(),
            entry,
        })
    }

    async fn app_root(&self, token: &str) -> Result<RemoteEntry, StorageError> {
        match self.api.resource(token, APP_ROOT).await {
            Ok(resource) => Ok(resource.into_entry(None)),
            Err(err) if err.is(Reason::NotFound) => {
                self.api.create_folder(token, APP_ROOT).await?;
                Ok(self.api.resource(token, APP_ROOT).await?.into_entry(None))
            }
            Err(err) => Err(err),
        }
    }

    async fn delete(&self, account: &Account, path: &str) -> Result<(), StorageError> {
        let token = account.access_token()?;
        ignore_not_found(self.api.delete(token, path).await)
    }
}

#[async_trait]
impl RemoteStorage for DiskStorage {
    fn storage_type(&self) -> StorageType {
        StorageType::Disk
    }

    async fn root_folder(&self, account: &Account) -> Result<DocumentRef, StorageError> {
        let token = account.access_token()?;
        let entry = self.app_root(token).await?;
        Ok(self.document_for(token, entry))
    }

    async fn document(&self, account: &Account, id: &str) -> Result<DocumentRef, StorageError> {
        let token = account.access_token()?;
        let resource = self.api.resource(token, id).await?;
        let parent = parent_path(id);
        Ok(self.document_for(token, resource.into_entry(parent)))
    }

    fn oauth_authorize_url(&self, state: Option<&str>) -> Result<Url, StorageError> {
        Ok(self.oauth.authorize_url(state))
    }

    async fn connect_with_access_code(&self, code: &str) -> Result<ConnectedAccount, StorageError> {
        let grant = self.oauth.exchange_code(code).await?.into_grant(None);
        let info = self.api.disk_info(&grant.access_token).await?;
        let account_name = info
            .user
            .and_then(|user| user.login.or(user.display_name))
            .ok_or_else(|| StorageError::invalid_response("disk info has no user"))?;
        let root = self.app_root(&grant.access_token).await?;
        Ok(ConnectedAccount {
            account_name,
            grant,
            root_folder_id: Some(root.id),
        })
    }

    async fn refresh_token(&self, account: &Account) -> Result<TokenGrant, StorageError> {
        let refresh = account.refresh_token.as_deref().ok_or_else(|| {
            StorageError::new(Reason::Unauthorized, "account has no refresh token")
        })?;
        Ok(self.oauth.refresh_token(refresh).await?.into_grant(Some(refresh)))
    }

    async fn revoke_token(&self, account: &Account) -> Result<(), StorageError> {
        match account.access_token.as_deref() {
            Some(token) => self.oauth.revoke_token(token).await,
            None => Ok(()),
        }
    }

    async fn refresh_quota(&self, account: &Account) -> Result<Quota, StorageError> {
        let info = self.api.disk_info(account.access_token()?).await?;
        Ok(Quota {
            amount: Some(info.total_space as i64),
            used: Some(info.used_space as i64),
        })
    }

    async fn changes(
        &self,
        account: &Account,
        last_change_id: Option<&str>,
        listener: &SharedListener,
    ) -> Result<RemoteChanges, StorageError> {
        let root = self.root_folder(account).await?;
        let entries = scan_tree(root, listener).await?;
        Ok(snapshot_changes(entries, last_change_id))
    }

    async fn delete_file(&self, account: &Account, id: &str) -> Result<(), StorageError> {
        self.delete(account, id).await
    }

    async fn delete_folder(&self, account: &Account, id: &str) -> Result<(), StorageError> {
        self.delete(account, id).await
    }
}

impl DiskApi {
    fn authorized(&self, request: RequestBuilder, token: &str) -> RequestBuilder {
        AuthScheme::OAuth.apply(request, token)
    }

    fn endpoint(&self, path: &str) -> Result<Url, StorageError> {
        Ok(self.base_url.join(path)?)
    }

    async fn disk_info(&self, token: &str) -> Result<DiskInfo, StorageError> {
        let request = self.authorized(self.http.get(self.endpoint("/v1/disk")?), token);
        http::send_json(request).await
    }

    async fn resource(&self, token: &str, path: &str) -> Result<Resource, StorageError> {
        let mut url = self.endpoint("/v1/disk/resources")?;
        url.query_pairs_mut()
            .append_pair("path", path)
            .append_pair("limit", "0");
        http::send_json(self.authorized(self.http.get(url), token)).await
    }

    async fn list_page(
        &self,
        token: &str,
        path: &str,
        offset: u32,
    ) -> Result<ResourceList, StorageError> {
        let mut url = self.endpoint("/v1/disk/resources")?;
        url.query_pairs_mut()
            .append_pair("path", path)
            .append_pair("limit", &self.page_size.to_string())
            .append_pair("offset", &offset.to_string());
        let payload: Resource = http::send_json(self.authorized(self.http.get(url), token)).await?;
        payload
            .embedded
            .ok_or_else(|| StorageError::invalid_response("listing without embedded items"))
    }

    async fn list_all(
        &self,
        token: &str,
        path: &str,
        listener: &SharedListener,
    ) -> Result<Vec<Resource>, StorageError> {
        let mut offset = 0u32;
        let mut items = Vec::new();
        loop {
            checkpoint(listener.as_ref()).await?;
            let page = self.list_page(token, path, offset).await?;
            let received = page.items.len() as u32;
            offset = offset.saturating_add(received);
            items.extend(page.items);
            listener.on_progress(Phase::Listing, items.len() as u64);
            if received == 0 || offset >= page.total {
                break;
            }
        }
        Ok(items)
    }

    async fn create_folder(&self, token: &str, path: &str) -> Result<(), StorageError> {
        let mut url = self.endpoint("/v1/disk/resources")?;
        url.query_pairs_mut().append_pair("path", path);
        match http::send(self.authorized(self.http.put(url), token)).await {
            Ok(_) => Ok(()),
            Err(err) if err.is(Reason::Conflict) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn delete(&self, token: &str, path: &str) -> Result<(), StorageError> {
        let mut url = self.endpoint("/v1/disk/resources")?;
        url.query_pairs_mut()
            .append_pair("path", path)
            .append_pair("permanently", "true");
        let response = http::send(self.authorized(self.http.delete(url), token)).await?;
        if response.status() == StatusCode::ACCEPTED {
            let link: Link = response.json().await?;
            self.wait_for_operation(token, &link.href).await?;
        }
        Ok(())
    }

    async fn wait_for_operation(&self, token: &str, href: &str) -> Result<(), StorageError> {
        let url = Url::parse(href)?;
        for _ in 0..OPERATION_MAX_POLLS {
            let info: OperationInfo =
                http::send_json(self.authorized(self.http.get(url.clone()), token)).await?;
            match info.status {
                OperationStatus::Success => return Ok(()),
                OperationStatus::Failure => {
                    return Err(StorageError::new(Reason::Other, format!("operation {href} failed")));
                }
                OperationStatus::InProgress => tokio::time::sleep(self.poll_interval).await,
            }
        }
        Err(StorageError::new(
            Reason::Network,
            format!("operation {href} did not finish in time"),
        ))
    }

    async fn link(&self, token: &str, endpoint: &str, path: &str) -> Result<Link, StorageError> {
        let mut url = self.endpoint(endpoint)?;
        url.query_pairs_mut().append_pair("path", path);
        if endpoint.ends_with("/upload") {
            url.query_pairs_mut().append_pair("overwrite", "true");
        }
        http::send_json(self.authorized(self.http.get(url), token)).await
    }

    async fn upload(
        &self,
        token: &str,
        path: &str,
        body: reqwest::Body,
        len: u64,
        listener: &SharedListener,
    ) -> Result<Resource, StorageError> {
        let _permit = self.limits.upload_permit().await?;
        let link = self.link(token, "/v1/disk/resources/upload", path).await?;
        let request = self
            .http
            .put(Url::parse(&link.href)?)
            .header("Content-Length", len)
            .body(body);
        http::send(request)
            .await
            .map_err(|err| transfer::canceled_or(err, listener))?;
        self.resource(token, path).await
    }

    async fn download(&self, token: &str, path: &str) -> Result<reqwest::Response, StorageError> {
        let link = self.link(token, "/v1/disk/resources/download", path).await?;
        http::send(self.http.get(Url::parse(&link.href)?)).await
    }
}

struct DiskDocument {
    api: Arc<DiskApi>,
    token: String,
    entry: RemoteEntry,
}

impl DiskDocument {
    fn child(&self, entry: RemoteEntry) -> DocumentRef {
        Box::new(DiskDocument {
            api: Arc::clone(&self.api),
            token: self.token.clone(),
            entry,
        })
    }
}

#[async_trait]
impl RemoteDocument for DiskDocument {
    fn entry(&self) -> &RemoteEntry {
        &self.entry
    }

    async fn child_documents(
        &self,
        listener: &SharedListener,
    ) -> Result<Vec<DocumentRef>, StorageError> {
        let items = self.api.list_all(&self.token, &self.entry.id, listener).await?;
        Ok(items
            .into_iter()
            .map(|item| self.child(item.into_entry(Some(self.entry.id.clone()))))
            .collect())
    }

    async fn child_document(&self, name: &str) -> Result<DocumentRef, StorageError> {
        let path = child_path(&self.entry.id, name);
        let resource = self.api.resource(&self.token, &path).await?;
        Ok(self.child(resource.into_entry(Some(self.entry.id.clone()))))
    }

    async fn create_child_folder(&self, name: &str) -> Result<DocumentRef, StorageError> {
        let path = child_path(&self.entry.id, name);
        self.api.create_folder(&self.token, &path).await?;
        let resource = self.api.resource(&self.token, &path).await?;
        Ok(self.child(resource.into_entry(Some(self.entry.id.clone()))))
    }

    /// Paths need no allocation; the entry appears on first upload.
    async fn create_child_file(
        &self,
        name: &str,
        mime_type: &str,
    ) -> Result<DocumentRef, StorageError> {
        Ok(self.child(RemoteEntry {
            id: child_path(&self.entry.id, name),
            name: name.to_string(),
            mime_type: mime_type.to_string(),
            is_folder: false,
            parent_id: Some(self.entry.id.clone()),
            size: None,
            version: None,
            modified: None,
            hash: None,
        }))
    }

    async fn upload_file(
        &mut self,
        source: &Path,
        listener: &SharedListener,
    ) -> Result<RemoteEntry, StorageError> {
        let (body, len) = transfer::file_body(source, listener).await?;
        let resource = self
            .api
            .upload(&self.token, &self.entry.id, body, len, listener)
            .await?;
        self.entry = resource.into_entry(self.entry.parent_id.clone());
        Ok(self.entry.clone())
    }

    async fn upload_data(
        &mut self,
        data: Vec<u8>,
        listener: &SharedListener,
    ) -> Result<RemoteEntry, StorageError> {
        let (body, len) = transfer::data_body(data, listener);
        let resource = self
            .api
            .upload(&self.token, &self.entry.id, body, len, listener)
            .await?;
        self.entry = resource.into_entry(self.entry.parent_id.clone());
        Ok(self.entry.clone())
    }

    async fn download_file(
        &self,
        target: &Path,
        listener: &SharedListener,
    ) -> Result<(), StorageError> {
        let _permit = self.api.limits.download_permit().await?;
        let response = self.api.download(&self.token, &self.entry.id).await?;
        transfer::download_to_path(response, target, self.entry.hash.as_deref(), listener).await
    }

    async fn download_data(&self, listener: &SharedListener) -> Result<Vec<u8>, StorageError> {
        let _permit = self.api.limits.download_permit().await?;
        let response = self.api.download(&self.token, &self.entry.id).await?;
        transfer::download_to_vec(response, listener).await
    }
}

fn parent_path(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    let parent = &trimmed[..=idx];
    if parent.ends_with(":/") {
        Some(parent.to_string())
    } else {
        Some(parent.trim_end_matches('/').to_string())
    }
}

#[derive(Debug, Deserialize)]
struct DiskInfo {
    total_space: u64,
    used_space: u64,
    #[serde(default)]
    user: Option<DiskUser>,
}

#[derive(Debug, Deserialize)]
struct DiskUser {
    #[serde(default)]
    login: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Resource {
    path: String,
    name: String,
    #[serde(rename = "type")]
    resource_type: ResourceType,
    #[serde(default)]
    size: Option<i64>,
    #[serde(default)]
    modified: Option<String>,
    #[serde(default)]
    revision: Option<i64>,
    #[serde(default)]
    md5: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(rename = "_embedded", default)]
    embedded: Option<ResourceList>,
}

impl Resource {
    fn into_entry(self, parent_id: Option<String>) -> RemoteEntry {
        let is_folder = self.resource_type == ResourceType::Dir;
        let modified = self.modified.as_deref().and_then(rfc3339_millis);
        RemoteEntry {
            id: self.path,
            name: self.name,
            mime_type: if is_folder {
                FOLDER_MIME_TYPE.to_string()
            } else {
                self.mime_type
                    .unwrap_or_else(|| DEFAULT_FILE_MIME_TYPE.to_string())
            },
            is_folder,
            parent_id,
            size: self.size,
            version: self.revision.or(modified),
            modified,
            hash: self.md5,
        }
    }
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum ResourceType {
    File,
    Dir,
}

#[derive(Debug, Deserialize)]
struct ResourceList {
    #[serde(default)]
    items: Vec<Resource>,
    total: u32,
}

#[derive(Debug, Deserialize)]
struct Link {
    href: String,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
enum OperationStatus {
    Success,
    Failure,
    InProgress,
}

#[derive(Debug, Deserialize)]
struct OperationInfo {
    status: OperationStatus,
}
