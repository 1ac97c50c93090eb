use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::json;
use url::Url;

use super::{APP_FOLDER_NAME, DEFAULT_PAGE_SIZE, rfc3339_millis};
use crate::error::{Reason, StorageError};
use crate::http::{self, AuthScheme};
use crate::model::{
    Account, ConnectedAccount, FOLDER_MIME_TYPE, Quota, RemoteChange, RemoteChanges, RemoteEntry,
    StorageType, TokenGrant,
};
use crate::oauth::{AppCredentials, OAuthClient, OAuthEndpoints};
use crate::progress::{Phase, SharedListener, checkpoint};
use crate::scan::{scan_tree, snapshot_changes};
use crate::storage::{DocumentRef, RemoteDocument, RemoteStorage, ignore_not_found};
use crate::transfer::{self, TransferLimits};

const DEFAULT_API_BASE: &str = "https://www.googleapis.com";
const DEFAULT_OAUTH_BASE: &str = "https://oauth2.googleapis.com";
const DRIVE_FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const FILE_FIELDS: &str = "id,name,mimeType,parents,size,version,modifiedTime,md5Checksum,trashed";
const MAX_ANCESTOR_DEPTH: usize = 64;

/// Id-addressed provider with a real change feed.
pub struct DriveStorage {
    api: Arc<DriveApi>,
    oauth: OAuthClient,
}

struct DriveApi {
    http: Client,
    api_base: Url,
    upload_base: Url,
    page_size: u32,
    limits: TransferLimits,
}

impl DriveStorage {
    pub fn new(credentials: AppCredentials) -> Result<Self, StorageError> {
        let endpoints = OAuthEndpoints {
            authorize: Url::parse("https://accounts.google.com/o/oauth2/v2/auth")?,
            token: Url::parse(DEFAULT_OAUTH_BASE)?.join("/token")?,
            revoke: Some(Url::parse(DEFAULT_OAUTH_BASE)?.join("/revoke")?),
        };
        Self::build(DEFAULT_API_BASE, OAuthClient::new(endpoints, credentials))
    }

    /// Everything, OAuth included, served under `base_url`.
    pub fn with_base_url(base_url: &str, credentials: AppCredentials) -> Result<Self, StorageError> {
        Self::build(base_url, OAuthClient::with_base_url(base_url, credentials)?)
    }

    fn build(base_url: &str, oauth: OAuthClient) -> Result<Self, StorageError> {
        let base = Url::parse(base_url)?;
        Ok(Self {
            api: Arc::new(DriveApi {
                http: Client::new(),
                api_base: base.join("/drive/v3/")?,
                upload_base: base.join("/upload/drive/v3/")?,
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

    async fn app_folder_id(&self, token: &str) -> Result<String, StorageError> {
        let query = format!(
            "name = '{}' and mimeType = '{DRIVE_FOLDER_MIME}' and 'root' in parents and trashed = false",
            escape_query(APP_FOLDER_NAME)
        );
        let listing: FileList = self
            .api
            .get_json(token, "files", &[("q", query.as_str()), ("fields", "files(id)")])
            .await?;
        if let Some(existing) = listing.files.into_iter().next() {
            return Ok(existing.id);
        }
        let created = self
            .api
            .create(token, APP_FOLDER_NAME, DRIVE_FOLDER_MIME, "root")
            .await?;
        tracing::info!(folder_id = %created.id, "created drive app folder");
        Ok(created.id)
    }

    async fn root_id(&self, account: &Account) -> Result<String, StorageError> {
        match &account.root_folder_id {
            Some(id) => Ok(id.clone()),
            None => self.app_folder_id(account.access_token()?).await,
        }
    }

    async fn start_page_token(&self, token: &str) -> Result<String, StorageError> {
        let start: StartPageToken = self
            .api
            .get_json(token, "changes/startPageToken", &[])
            .await?;
        Ok(start.start_page_token)
    }

    /// Account-wide feed since `cursor`, narrowed to the app folder tree.
    async fn delta(
        &self,
        token: &str,
        root_id: &str,
        cursor: &str,
        listener: &SharedListener,
    ) -> Result<RemoteChanges, StorageError> {
        let fields = format!(
            "nextPageToken,newStartPageToken,changes(fileId,removed,file({FILE_FIELDS}))"
        );
        let page_size = self.api.page_size.to_string();
        let mut page_token = cursor.to_string();
        let mut raw = Vec::new();
        let next_cursor = loop {
            checkpoint(listener.as_ref()).await?;
            let page: ChangeList = self
                .api
                .get_json(
                    token,
                    "changes",
                    &[
                        ("pageToken", page_token.as_str()),
                        ("pageSize", page_size.as_str()),
                        ("fields", fields.as_str()),
                    ],
                )
                .await?;
            raw.extend(page.changes);
            listener.on_progress(Phase::Changes, raw.len() as u64);
            match (page.next_page_token, page.new_start_page_token) {
                (Some(next), _) => page_token = next,
                (None, Some(new_start)) => break new_start,
                (None, None) => {
                    return Err(StorageError::invalid_response(
                        "change page carries neither next nor new start token",
                    ));
                }
            }
        };

        let fetched: HashMap<String, Vec<String>> = raw
            .iter()
            .filter_map(|change| change.file.as_ref())
            .map(|file| (file.id.clone(), file.parents.clone()))
            .collect();
        let mut lookups: HashMap<String, Option<Vec<String>>> = HashMap::new();
        let mut changes = Vec::new();
        for change in raw {
            match change.file {
                Some(file) if !change.removed && !file.trashed => {
                    if file.id == root_id {
                        continue;
                    }
                    // Moving a file out of the app folder reads as a deletion;
                    // ids never seen locally are ignored downstream.
                    if self
                        .api
                        .in_tree(token, root_id, &file.parents, &fetched, &mut lookups)
                        .await?
                    {
                        changes.push(RemoteChange::Modification(file.into_entry()));
                    } else {
                        changes.push(RemoteChange::Deletion { id: file.id });
                    }
                }
                file => {
                    let id = file.map(|f| f.id).or(change.file_id);
                    if let Some(id) = id {
                        changes.push(RemoteChange::Deletion { id });
                    }
                }
            }
        }
        Ok(RemoteChanges {
            changes,
            cursor: Some(next_cursor),
            scanned_ids: None,
        })
    }

    fn document_for(&self, token: &str, file: DriveFile) -> DocumentRef {
        Box::new(DriveDocument {
            api: Arc::clone(&self.api),
            token: token.to_string(),
            entry: file.into_entry(),
        })
    }
}

#[async_trait]
impl RemoteStorage for DriveStorage {
    fn storage_type(&self) -> StorageType {
        StorageType::Drive
    }

    async fn root_folder(&self, account: &Account) -> Result<DocumentRef, StorageError> {
        let token = account.access_token()?;
        let root_id = self.root_id(account).await?;
        let file = self.api.file(token, &root_id).await?;
        Ok(self.document_for(token, file))
    }

    async fn document(&self, account: &Account, id: &str) -> Result<DocumentRef, StorageError> {
        let token = account.access_token()?;
        let file = self.api.file(token, id).await?;
        if file.trashed {
            return Err(StorageError::not_found(format!("drive file {id} is trashed")));
        }
        Ok(self.document_for(token, file))
    }

    fn oauth_authorize_url(&self, state: Option<&str>) -> Result<Url, StorageError> {
        let mut url = self.oauth.authorize_url(state);
        url.query_pairs_mut()
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent");
        Ok(url)
    }

    async fn connect_with_access_code(&self, code: &str) -> Result<ConnectedAccount, StorageError> {
        let grant = self.oauth.exchange_code(code).await?.into_grant(None);
        let about: About = self
            .api
            .get_json(&grant.access_token, "about", &[("fields", "user(emailAddress,displayName)")])
            .await?;
        let account_name = about
            .user
            .and_then(|user| user.email_address.or(user.display_name))
            .ok_or_else(|| StorageError::invalid_response("about response has no user"))?;
        let root_folder_id = self.app_folder_id(&grant.access_token).await?;
        Ok(ConnectedAccount {
            account_name,
            grant,
            root_folder_id: Some(root_folder_id),
        })
    }

    async fn refresh_token(&self, account: &Account) -> Result<TokenGrant, StorageError> {
        let refresh = account.refresh_token.as_deref().ok_or_else(|| {
            StorageError::new(Reason::Unauthorized, "account has no refresh token")
        })?;
        Ok(self.oauth.refresh_token(refresh).await?.into_grant(Some(refresh)))
    }

    async fn revoke_token(&self, account: &Account) -> Result<(), StorageError> {
        let token = account
            .refresh_token
            .as_deref()
            .or(account.access_token.as_deref());
        match token {
            Some(token) => self.oauth.revoke_token(token).await,
            None => Ok(()),
        }
    }

    async fn refresh_quota(&self, account: &Account) -> Result<Quota, StorageError> {
        let about: About = self
            .api
            .get_json(account.access_token()?, "about", &[("fields", "storageQuota(limit,usage)")])
            .await?;
        let quota = about.storage_quota.unwrap_or_default();
        Ok(Quota {
            amount: quota.limit.as_deref().and_then(|v| v.parse().ok()),
            used: quota.usage.as_deref().and_then(|v| v.parse().ok()),
        })
    }

    async fn changes(
        &self,
        account: &Account,
        last_change_id: Option<&str>,
        listener: &SharedListener,
    ) -> Result<RemoteChanges, StorageError> {
        let token = account.access_token()?;
        let root_id = self.root_id(account).await?;
        match last_change_id {
            Some(cursor) => self.delta(token, &root_id, cursor, listener).await,
            None => {
                // The start token is taken before scanning so nothing that
                // changes during the scan is skipped later.
                let start = self.start_page_token(token).await?;
                let root = self.document_for(token, self.api.file(token, &root_id).await?);
                let mut snapshot = snapshot_changes(scan_tree(root, listener).await?, None);
                snapshot.cursor = Some(start);
                Ok(snapshot)
            }
        }
    }

    async fn delete_file(&self, account: &Account, id: &str) -> Result<(), StorageError> {
        ignore_not_found(self.api.delete(account.access_token()?, id).await)
    }

    async fn delete_folder(&self, account: &Account, id: &str) -> Result<(), StorageError> {
        ignore_not_found(self.api.delete(account.access_token()?, id).await)
    }
}

impl DriveApi {
    fn authorized(&self, request: RequestBuilder, token: &str) -> RequestBuilder {
        AuthScheme::Bearer.apply(request, token)
    }

    fn url(&self, path: &str, query: &[(&str, &str)]) -> Result<Url, StorageError> {
        let mut url = self.api_base.join(path)?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        token: &str,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, StorageError> {
        let request = self.authorized(self.http.get(self.url(path, query)?), token);
        http::send_json_refined(request, refine_rate_limit).await
    }

    async fn file(&self, token: &str, id: &str) -> Result<DriveFile, StorageError> {
        self.get_json(token, &format!("files/{id}"), &[("fields", FILE_FIELDS)])
            .await
    }

    async fn list_children(
        &self,
        token: &str,
        parent_id: &str,
        listener: &SharedListener,
    ) -> Result<Vec<DriveFile>, StorageError> {
        let query = format!("'{}' in parents and trashed = false", escape_query(parent_id));
        let fields = format!("nextPageToken,files({FILE_FIELDS})");
        let page_size = self.page_size.to_string();
        let mut page_token: Option<String> = None;
        let mut files = Vec::new();
        loop {
            checkpoint(listener.as_ref()).await?;
            let mut params = vec![
                ("q", query.as_str()),
                ("fields", fields.as_str()),
                ("pageSize", page_size.as_str()),
            ];
            if let Some(token) = page_token.as_deref() {
                params.push(("pageToken", token));
            }
            let page: FileList = self.get_json(token, "files", &params).await?;
            files.extend(page.files);
            listener.on_progress(Phase::Listing, files.len() as u64);
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        Ok(files)
    }

    async fn create(
        &self,
        token: &str,
        name: &str,
        mime_type: &str,
        parent_id: &str,
    ) -> Result<DriveFile, StorageError> {
        let url = self.url("files", &[("fields", FILE_FIELDS)])?;
        let body = json!({ "name": name, "mimeType": mime_type, "parents": [parent_id] });
        let request = self.authorized(self.http.post(url), token).json(&body);
        http::send_json_refined(request, refine_rate_limit).await
    }

    async fn delete(&self, token: &str, id: &str) -> Result<(), StorageError> {
        let request = self.authorized(self.http.delete(self.url(&format!("files/{id}"), &[])?), token);
        http::send_refined(request, Some(refine_rate_limit)).await?;
        Ok(())
    }

    async fn upload(
        &self,
        token: &str,
        id: &str,
        body: reqwest::Body,
        len: u64,
        mime_type: &str,
        listener: &SharedListener,
    ) -> Result<DriveFile, StorageError> {
        let _permit = self.limits.upload_permit().await?;
        let mut url = self.upload_base.join(&format!("files/{id}"))?;
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("fields", FILE_FIELDS);
        let request = self
            .authorized(self.http.patch(url), token)
            .header("Content-Type", mime_type)
            .header("Content-Length", len)
            .body(body);
        http::send_json_refined(request, refine_rate_limit)
            .await
            .map_err(|err| transfer::canceled_or(err, listener))
    }

    async fn media(&self, token: &str, id: &str) -> Result<reqwest::Response, StorageError> {
        let url = self.url(&format!("files/{id}"), &[("alt", "media")])?;
        http::send_refined(self.authorized(self.http.get(url), token), Some(refine_rate_limit)).await
    }

    /// Walks the parent chain until the app folder or a dead end, preferring
    /// parents already present in the change batch over single lookups.
    async fn in_tree(
        &self,
        token: &str,
        root_id: &str,
        parents: &[String],
        fetched: &HashMap<String, Vec<String>>,
        lookups: &mut HashMap<String, Option<Vec<String>>>,
    ) -> Result<bool, StorageError> {
        let mut current = parents.first().cloned();
        for _ in 0..MAX_ANCESTOR_DEPTH {
            let Some(id) = current else {
                return Ok(false);
            };
            if id == root_id {
                return Ok(true);
            }
            let next = if let Some(parents) = fetched.get(&id) {
                parents.first().cloned()
            } else {
                if !lookups.contains_key(&id) {
                    let found = match self
                        .get_json::<ParentsOnly>(token, &format!("files/{id}"), &[("fields", "id,parents")])
                        .await
                    {
                        Ok(file) => Some(file.parents),
                        Err(err) if err.is(Reason::NotFound) => None,
                        Err(err) => return Err(err),
                    };
                    lookups.insert(id.clone(), found);
                }
                lookups
                    .get(&id)
                    .and_then(|parents| parents.as_ref())
                    .and_then(|parents| parents.first().cloned())
            };
            current = next;
        }
        Ok(false)
    }
}

struct DriveDocument {
    api: Arc<DriveApi>,
    token: String,
    entry: RemoteEntry,
}

impl DriveDocument {
    fn child(&self, file: DriveFile) -> DocumentRef {
        Box::new(DriveDocument {
            api: Arc::clone(&self.api),
            token: self.token.clone(),
            entry: file.into_entry(),
        })
    }
}

#[async_trait]
impl RemoteDocument for DriveDocument {
    fn entry(&self) -> &RemoteEntry {
        &self.entry
    }

    async fn child_documents(
        &self,
        listener: &SharedListener,
    ) -> Result<Vec<DocumentRef>, StorageError> {
        let files = self
            .api
            .list_children(&self.token, &self.entry.id, listener)
            .await?;
        Ok(files.into_iter().map(|file| self.child(file)).collect())
    }

    async fn create_child_folder(&self, name: &str) -> Result<DocumentRef, StorageError> {
        let file = self
            .api
            .create(&self.token, name, DRIVE_FOLDER_MIME, &self.entry.id)
            .await?;
        Ok(self.child(file))
    }

    async fn create_child_file(
        &self,
        name: &str,
        mime_type: &str,
    ) -> Result<DocumentRef, StorageError> {
        let file = self
            .api
            .create(&self.token, name, mime_type, &self.entry.id)
            .await?;
        Ok(self.child(file))
    }

    async fn upload_file(
        &mut self,
        source: &Path,
        listener: &SharedListener,
    ) -> Result<RemoteEntry, StorageError> {
        let (body, len) = transfer::file_body(source, listener).await?;
        let file = self
            .api
            .upload(&self.token, &self.entry.id, body, len, &self.entry.mime_type, listener)
            .await?;
        self.entry = file.into_entry();
        Ok(self.entry.clone())
    }

    async fn upload_data(
        &mut self,
        data: Vec<u8>,
        listener: &SharedListener,
    ) -> Result<RemoteEntry, StorageError> {
        let (body, len) = transfer::data_body(data, listener);
        let file = self
            .api
            .upload(&self.token, &self.entry.id, body, len, &self.entry.mime_type, listener)
            .await?;
        self.entry = file.into_entry();
        Ok(self.entry.clone())
    }

    async fn download_file(
        &self,
        target: &Path,
        listener: &SharedListener,
    ) -> Result<(), StorageError> {
        let _permit = self.api.limits.download_permit().await?;
        let response = self.api.media(&self.token, &self.entry.id).await?;
        transfer::download_to_path(response, target, self.entry.hash.as_deref(), listener).await
    }

    async fn download_data(&self, listener: &SharedListener) -> Result<Vec<u8>, StorageError> {
        let _permit = self.api.limits.download_permit().await?;
        let response = self.api.media(&self.token, &self.entry.id).await?;
        transfer::download_to_vec(response, listener).await
    }
}

fn refine_rate_limit(status: StatusCode, body: &str) -> Option<Reason> {
    let limited = status == StatusCode::FORBIDDEN
        && (body.contains("rateLimitExceeded") || body.contains("RateLimitExceeded"));
    limited.then_some(Reason::TooManyRequests)
}

fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    parents: Vec<String>,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    modified_time: Option<String>,
    #[serde(default)]
    md5_checksum: Option<String>,
    #[serde(default)]
    trashed: bool,
}

impl DriveFile {
    fn into_entry(self) -> RemoteEntry {
        let is_folder = self.mime_type.as_deref() == Some(DRIVE_FOLDER_MIME);
        RemoteEntry {
            mime_type: if is_folder {
                FOLDER_MIME_TYPE.to_string()
            } else {
                self.mime_type
                    .unwrap_or_else(|| crate::model::DEFAULT_FILE_MIME_TYPE.to_string())
            },
            is_folder,
            parent_id: self.parents.into_iter().next(),
            size: self.size.as_deref().and_then(|v| v.parse().ok()),
            version: self.version.as_deref().and_then(|v| v.parse().ok()),
            modified: self.modified_time.as_deref().and_then(rfc3339_millis),
            hash: self.md5_checksum,
            id: self.id,
            name: self.name,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParentsOnly {
    #[serde(default)]
    parents: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartPageToken {
    start_page_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeList {
    #[serde(default)]
    changes: Vec<DriveChange>,
    #[serde(default)]
    next_page_token: Option<String>,
    #[serde(default)]
    new_start_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveChange {
    #[serde(default)]
    file_id: Option<String>,
    #[serde(default)]
    removed: bool,
    #[serde(default)]
    file: Option<DriveFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct About {
    #[serde(default)]
    user: Option<AboutUser>,
    #[serde(default)]
    storage_quota: Option<StorageQuota>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AboutUser {
    #[serde(default)]
    email_address: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StorageQuota {
    #[serde(default)]
    limit: Option<String>,
    #[serde(default)]
    usage: Option<String>,
}
