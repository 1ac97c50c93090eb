use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use time::PrimitiveDateTime;
use time::format_description;
use url::Url;

use super::{APP_FOLDER_NAME, DEFAULT_PAGE_SIZE, child_path};
use crate::error::{Reason, StorageError};
use crate::http::{self, AuthScheme};
use crate::model::{
    Account, ConnectedAccount, DEFAULT_FILE_MIME_TYPE, Quota, RemoteChanges,
    RemoteEntry, StorageType, TokenGrant,
};
use crate::oauth::{AppCredentials, OAuthClient, OAuthEndpoints};
use crate::progress::{Phase, SharedListener, checkpoint};
use crate::scan::snapshot_changes;
use crate::storage::{DocumentRef, RemoteDocument, RemoteStorage, ignore_not_found};
use crate::transfer::{self, TransferLimits};

/// Content type of the zero-byte objects some clients use to mark folders.
pub const DIRECTORY_MARKER_TYPE: &str = "application/directory";

#[derive(Debug, Clone)]
pub struct SwiftConfig {
    /// Storage URL of the account, e.g. `https://swift.example/v1/AUTH_x`.
    pub endpoint: String,
    pub container: String,
    pub oauth_base: String,
}

/// Object store provider. Folders are path prefixes and exist only while
/// they hold at least one real object.
pub struct SwiftStorage {
    api: Arc<SwiftApi>,
    oauth: OAuthClient,
}

struct SwiftApi {
    http: Client,
    account_url: Url,
    container_url: Url,
    container: String,
    page_size: u32,
    limits: TransferLimits,
}

impl SwiftStorage {
    pub fn new(config: SwiftConfig, credentials: AppCredentials) -> Result<Self, StorageError> {
        let oauth = OAuthClient::new(OAuthEndpoints::under(&config.oauth_base)?, credentials);
        let endpoint = config.endpoint.trim_end_matches('/');
        let account_url = Url::parse(endpoint)?;
        let container_url = Url::parse(&format!("{endpoint}/{}/", config.container))?;
        Ok(Self {
            api: Arc::new(SwiftApi {
                http: Client::new(),
                account_url,
                container_url,
                container: config.container,
                page_size: DEFAULT_PAGE_SIZE,
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

    fn document_for(&self, token: &str, entry: RemoteEntry) -> DocumentRef {
        Box::new(SwiftDocument {
            api: Arc::clone(&self.api),
            token: token.to_string(),
            entry,
        })
    }

    fn root_entry(&self) -> RemoteEntry {
        RemoteEntry::folder(APP_FOLDER_NAME, APP_FOLDER_NAME, None)
    }
}

#[async_trait]
impl RemoteStorage for SwiftStorage {
    fn storage_type(&self) -> StorageType {
        StorageType::Swift
    }

    async fn root_folder(&self, account: &Account) -> Result<DocumentRef, StorageError> {
        Ok(self.document_for(account.access_token()?, self.root_entry()))
    }

    async fn document(&self, account: &Account, id: &str) -> Result<DocumentRef, StorageError> {
        let token = account.access_token()?;
        if id == APP_FOLDER_NAME {
            return Ok(self.document_for(token, self.root_entry()));
        }
        match self.api.head_object(token, id).await {
            Ok(entry) => return Ok(self.document_for(token, entry)),
            Err(err) if err.is(Reason::NotFound) => {}
            Err(err) => return Err(err),
        }
        let descendants = self.api.list_prefix(token, &format!("{id}/"), None).await?;
        if descendants.iter().any(|object| !object.is_marker()) {
            let (parent, name) = split_path(id);
            return Ok(self.document_for(token, RemoteEntry::folder(id, name, parent)));
        }
        Err(StorageError::not_found(format!("swift object {id}")))
    }

    fn oauth_authorize_url(&self, state: Option<&str>) -> Result<Url, StorageError> {
        Ok(self.oauth.authorize_url(state))
    }

    async fn connect_with_access_code(&self, code: &str) -> Result<ConnectedAccount, StorageError> {
        let grant = self.oauth.exchange_code(code).await?.into_grant(None);
        self.api.ensure_container(&grant.access_token).await?;
        let host = self.api.account_url.host_str().unwrap_or("swift");
        Ok(ConnectedAccount {
            account_name: format!("{}@{host}", self.api.container),
            grant,
            root_folder_id: Some(APP_FOLDER_NAME.to_string()),
        })
    }

    async fn refresh_token(&self, account: &Account) -> Result<TokenGrant, StorageError> {
        let refresh = account.refresh_token.as_deref().ok_or_else(|| {
            StorageError::new(Reason::Unauthorized, "account has no refresh token")
        })?;
        Ok(self.oauth.refresh_token(refresh).await?.into_grant(Some(refresh)))
    }

    async fn revoke_token(&self, account: &Account) -> Result<(), StorageError> {
        match account.refresh_token.as_deref() {
            Some(token) => self.oauth.revoke_token(token).await,
            None => Ok(()),
        }
    }

    async fn refresh_quota(&self, account: &Account) -> Result<Quota, StorageError> {
        let request = self.api.authorized(
            self.api.http.head(self.api.account_url.clone()),
            account.access_token()?,
        );
        let response = http::send(request).await?;
        let headers = response.headers();
        Ok(Quota {
            amount: http::header_i64(headers, "x-account-meta-quota-bytes"),
            used: http::header_i64(headers, "x-account-bytes-used"),
        })
    }

    /// One listing of the whole app prefix, folded into a tree snapshot.
    async fn changes(
        &self,
        account: &Account,
        last_change_id: Option<&str>,
        listener: &SharedListener,
    ) -> Result<RemoteChanges, StorageError> {
        let token = account.access_token()?;
        let prefix = format!("{APP_FOLDER_NAME}/");
        let objects = self.api.list_prefix(token, &prefix, Some(listener)).await?;
        Ok(snapshot_changes(
            tree_entries(APP_FOLDER_NAME, objects),
            last_change_id,
        ))
    }

    async fn delete_file(&self, account: &Account, id: &str) -> Result<(), StorageError> {
        ignore_not_found(self.api.delete_object(account.access_token()?, id).await)
    }

    /// Removes every object under the prefix, markers included.
    async fn delete_folder(&self, account: &Account, id: &str) -> Result<(), StorageError> {
        let token = account.access_token()?;
        let prefix = format!("{id}/");
        for object in self.api.list_prefix(token, &prefix, None).await? {
            ignore_not_found(self.api.delete_object(token, &object.name).await)?;
        }
        ignore_not_found(self.api.delete_object(token, id).await)
    }
}

impl SwiftApi {
    fn authorized(&self, request: RequestBuilder, token: &str) -> RequestBuilder {
        AuthScheme::AuthToken.apply(request, token)
    }

    fn object_url(&self, name: &str) -> Result<Url, StorageError> {
        let mut url = self.container_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| StorageError::invalid_response("container url cannot be a base"))?;
            segments.pop_if_empty();
            segments.extend(name.split('/'));
        }
        Ok(url)
    }

    async fn ensure_container(&self, token: &str) -> Result<(), StorageError> {
        let request = self.authorized(self.http.put(self.container_url.clone()), token);
        http::send(request).await?;
        Ok(())
    }

    async fn list_page(
        &self,
        token: &str,
        prefix: &str,
        marker: Option<&str>,
    ) -> Result<Vec<SwiftObject>, StorageError> {
        let mut url = self.container_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("format", "json");
            query.append_pair("prefix", prefix);
            query.append_pair("limit", &self.page_size.to_string());
            if let Some(marker) = marker {
                query.append_pair("marker", marker);
            }
        }
        let response = http::send(self.authorized(self.http.get(url), token)).await?;
        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        Ok(response.json().await?)
    }

    /// Every object under `prefix`, following the marker until a short page.
    async fn list_prefix(
        &self,
        token: &str,
        prefix: &str,
        listener: Option<&SharedListener>,
    ) -> Result<Vec<SwiftObject>, StorageError> {
        let mut marker: Option<String> = None;
        let mut objects = Vec::new();
        loop {
            if let Some(listener) = listener {
                checkpoint(listener.as_ref()).await?;
            }
            let page = self.list_page(token, prefix, marker.as_deref()).await?;
            let full = page.len() as u32 >= self.page_size;
            marker = page.last().map(|object| object.name.clone());
            objects.extend(page);
            if let Some(listener) = listener {
                listener.on_progress(Phase::Listing, objects.len() as u64);
            }
            if !full || marker.is_none() {
                break;
            }
        }
        Ok(objects)
    }

    async fn head_object(&self, token: &str, name: &str) -> Result<RemoteEntry, StorageError> {
        let request = self.authorized(self.http.head(self.object_url(name)?), token);
        let response = http::send(request).await?;
        let content_type = http::header_str(response.headers(), "content-type")
            .unwrap_or(DEFAULT_FILE_MIME_TYPE);
        if content_type.starts_with(DIRECTORY_MARKER_TYPE) {
            return Err(StorageError::not_found(format!("{name} is a folder marker")));
        }
        Ok(entry_from_headers(name, &response))
    }

    async fn put_object(
        &self,
        token: &str,
        name: &str,
        mime_type: &str,
        body: reqwest::Body,
        len: u64,
        listener: &SharedListener,
    ) -> Result<RemoteEntry, StorageError> {
        let _permit = self.limits.upload_permit().await?;
        let request = self
            .authorized(self.http.put(self.object_url(name)?), token)
            .header("Content-Type", mime_type)
            .header("Content-Length", len)
            .body(body);
        http::send(request)
            .await
            .map_err(|err| transfer::canceled_or(err, listener))?;
        self.head_object(token, name).await
    }

    async fn get_object(&self, token: &str, name: &str) -> Result<Response, StorageError> {
        let request = self.authorized(self.http.get(self.object_url(name)?), token);
        http::send(request).await
    }

    async fn delete_object(&self, token: &str, name: &str) -> Result<(), StorageError> {
        let request = self.authorized(self.http.delete(self.object_url(name)?), token);
        http::send(request).await?;
        Ok(())
    }
}

struct SwiftDocument {
    api: Arc<SwiftApi>,
    token: String,
    entry: RemoteEntry,
}

impl SwiftDocument {
    fn child(&self, entry: RemoteEntry) -> DocumentRef {
        Box::new(SwiftDocument {
            api: Arc::clone(&self.api),
            token: self.token.clone(),
            entry,
        })
    }
}

#[async_trait]
impl RemoteDocument for SwiftDocument {
    fn entry(&self) -> &RemoteEntry {
        &self.entry
    }

    async fn child_documents(
        &self,
        listener: &SharedListener,
    ) -> Result<Vec<DocumentRef>, StorageError> {
        let prefix = format!("{}/", self.entry.id);
        let objects = self
            .api
            .list_prefix(&self.token, &prefix, Some(listener))
            .await?;
        Ok(immediate_children(&self.entry.id, objects)
            .into_iter()
            .map(|entry| self.child(entry))
            .collect())
    }

    /// Folders materialize with their first object.
    async fn create_child_folder(&self, name: &str) -> Result<DocumentRef, StorageError> {
        Ok(self.child(RemoteEntry::folder(
            child_path(&self.entry.id, name),
            name,
            Some(self.entry.id.clone()),
        )))
    }

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
        let entry = self
            .api
            .put_object(&self.token, &self.entry.id, &self.entry.mime_type, body, len, listener)
            .await?;
        self.entry = entry;
        Ok(self.entry.clone())
    }

    async fn upload_data(
        &mut self,
        data: Vec<u8>,
        listener: &SharedListener,
    ) -> Result<RemoteEntry, StorageError> {
        let (body, len) = transfer::data_body(data, listener);
        let entry = self
            .api
            .put_object(&self.token, &self.entry.id, &self.entry.mime_type, body, len, listener)
            .await?;
        self.entry = entry;
        Ok(self.entry.clone())
    }

    async fn download_file(
        &self,
        target: &Path,
        listener: &SharedListener,
    ) -> Result<(), StorageError> {
        let _permit = self.api.limits.download_permit().await?;
        let response = self.api.get_object(&self.token, &self.entry.id).await?;
        let etag = verifiable_etag(&response);
        transfer::download_to_path(response, target, etag.as_deref(), listener).await
    }

    async fn download_data(&self, listener: &SharedListener) -> Result<Vec<u8>, StorageError> {
        let _permit = self.api.limits.download_permit().await?;
        let response = self.api.get_object(&self.token, &self.entry.id).await?;
        transfer::download_to_vec(response, listener).await
    }
}

#[derive(Debug, Clone, Deserialize)]
struct SwiftObject {
    name: String,
    #[serde(default)]
    bytes: i64,
    #[serde(default)]
    hash: Option<String>,
    #[serde(default)]
    last_modified: Option<String>,
    #[serde(default)]
    content_type: Option<String>,
}

impl SwiftObject {
    fn is_marker(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|ty| ty.starts_with(DIRECTORY_MARKER_TYPE))
            || self.name.ends_with('/')
    }

    fn into_entry(self, parent_id: String) -> RemoteEntry {
        let micros = self.last_modified.as_deref().and_then(listing_micros);
        let name = self
            .name
            .rsplit('/')
            .next()
            .unwrap_or(self.name.as_str())
            .to_string();
        RemoteEntry {
            id: self.name,
            name,
            mime_type: self
                .content_type
                .unwrap_or_else(|| DEFAULT_FILE_MIME_TYPE.to_string()),
            is_folder: false,
            parent_id: Some(parent_id),
            size: Some(self.bytes),
            version: micros,
            modified: micros.map(|us| us / 1_000),
            hash: self.hash,
        }
    }
}

/// Files and virtual folders directly below `folder_id`.
fn immediate_children(folder_id: &str, objects: Vec<SwiftObject>) -> Vec<RemoteEntry> {
    let prefix = format!("{folder_id}/");
    let mut folders: BTreeMap<String, ()> = BTreeMap::new();
    let mut files = Vec::new();
    for object in objects {
        if object.is_marker() {
            continue;
        }
        let Some(rest) = object.name.strip_prefix(&prefix) else {
            continue;
        };
        match rest.split_once('/') {
            Some((folder, _)) if !folder.is_empty() => {
                folders.insert(folder.to_string(), ());
            }
            Some(_) => {}
            None => files.push(object.into_entry(folder_id.to_string())),
        }
    }
    let mut entries: Vec<RemoteEntry> = folders
        .into_keys()
        .map(|name| {
            RemoteEntry::folder(child_path(folder_id, &name), name, Some(folder_id.to_string()))
        })
        .collect();
    entries.extend(files);
    entries
}

/// Every file and every folder implied by a file path below `root_id`,
/// parents first. Marker-only folders are left out, which is what makes an
/// emptied folder read as deleted.
fn tree_entries(root_id: &str, objects: Vec<SwiftObject>) -> Vec<RemoteEntry> {
    let prefix = format!("{root_id}/");
    let mut folders: BTreeMap<String, RemoteEntry> = BTreeMap::new();
    let mut files = Vec::new();
    for object in objects {
        if object.is_marker() {
            continue;
        }
        let Some(rest) = object.name.strip_prefix(&prefix) else {
            continue;
        };
        let segments: Vec<&str> = rest.split('/').collect();
        let mut parent = root_id.to_string();
        for segment in &segments[..segments.len().saturating_sub(1)] {
            if segment.is_empty() {
                continue;
            }
            let id = child_path(&parent, segment);
            folders
                .entry(id.clone())
                .or_insert_with(|| RemoteEntry::folder(id.clone(), *segment, Some(parent.clone())));
            parent = id;
        }
        files.push(object.into_entry(parent));
    }
    // Shorter paths sort before their children.
    let mut entries: Vec<RemoteEntry> = folders.into_values().collect();
    entries.sort_by_key(|entry| entry.id.matches('/').count());
    entries.extend(files);
    entries
}

fn entry_from_headers(name: &str, response: &Response) -> RemoteEntry {
    let headers = response.headers();
    let micros = http::header_str(headers, "x-timestamp")
        .and_then(|value| value.parse::<f64>().ok())
        .map(|secs| (secs * 1_000_000.0) as i64);
    let modified = micros
        .map(|us| us / 1_000)
        .or_else(|| http::last_modified_millis(headers));
    let (parent, file_name) = split_path(name);
    RemoteEntry {
        id: name.to_string(),
        name: file_name,
        mime_type: http::header_str(headers, "content-type")
            .unwrap_or(DEFAULT_FILE_MIME_TYPE)
            .to_string(),
        is_folder: false,
        parent_id: parent,
        size: http::header_i64(headers, "content-length"),
        version: micros.or(modified),
        modified,
        hash: http::header_str(headers, "etag").map(|etag| etag.trim_matches('"').to_string()),
    }
}

/// Large-object manifests carry an ETag of the segment list, not the body.
fn verifiable_etag(response: &Response) -> Option<String> {
    let headers = response.headers();
    if headers.contains_key("x-object-manifest") || headers.contains_key("x-static-large-object")
    {
        return None;
    }
    http::header_str(headers, "etag").map(|etag| etag.trim_matches('"').to_string())
}

fn split_path(id: &str) -> (Option<String>, String) {
    match id.rsplit_once('/') {
        Some((parent, name)) => (Some(parent.to_string()), name.to_string()),
        None => (None, id.to_string()),
    }
}

/// Listing timestamps look like `2024-01-01T00:00:00.123456`, always UTC.
fn listing_micros(value: &str) -> Option<i64> {
    let (whole, fraction) = match value.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (value, ""),
    };
    let format = format_description::parse("[year]-[month]-[day]T[hour]:[minute]:[second]").ok()?;
    let at = PrimitiveDateTime::parse(whole, &format).ok()?.assume_utc();
    let digits: String = fraction.chars().take(6).collect();
    let micros = if digits.is_empty() {
        0
    } else {
        format!("{digits:0<6}").parse::<i64>().ok()?
    };
    Some(at.unix_timestamp() * 1_000_000 + micros)
}
