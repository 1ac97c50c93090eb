use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Reason, StorageError};
use crate::http;
use crate::model::{TokenGrant, now_unix};

/// OAuth application registered with one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub scope: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OAuthEndpoints {
    pub authorize: Url,
    pub token: Url,
    pub revoke: Option<Url>,
}

impl OAuthEndpoints {
    /// `/authorize`, `/token` and `/revoke` under one base.
    pub fn under(base_url: &str) -> Result<Self, StorageError> {
        let base = Url::parse(base_url)?;
        Ok(Self {
            authorize: base.join("/authorize")?,
            token: base.join("/token")?,
            revoke: Some(base.join("/revoke")?),
        })
    }
}

#[derive(Clone)]
pub struct OAuthClient {
    http: Client,
    endpoints: OAuthEndpoints,
    credentials: AppCredentials,
}

impl OAuthClient {
    pub fn new(endpoints: OAuthEndpoints, credentials: AppCredentials) -> Self {
        Self {
            http: Client::new(),
            endpoints,
            credentials,
        }
    }

    pub fn with_base_url(base_url: &str, credentials: AppCredentials) -> Result<Self, StorageError> {
        Ok(Self::new(OAuthEndpoints::under(base_url)?, credentials))
    }

    pub fn credentials(&self) -> &AppCredentials {
        &self.credentials
    }

    pub fn authorize_url(&self, state: Option<&str>) -> Url {
        let mut url = self.endpoints.authorize.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("response_type", "code");
            query.append_pair("client_id", &self.credentials.client_id);
            query.append_pair("redirect_uri", &self.credentials.redirect_uri);
            if let Some(scope) = &self.credentials.scope {
                query.append_pair("scope", scope);
            }
            if let Some(state) = state {
                query.append_pair("state", state);
            }
        }
        url
    }

    pub async fn exchange_code(&self, code: &str) -> Result<OAuthToken, StorageError> {
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("redirect_uri", self.credentials.redirect_uri.as_str()),
        ];
        self.post_token(&form).await
    }

    pub async fn refresh_token(&self, refresh_token: &str) -> Result<OAuthToken, StorageError> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
        ];
        self.post_token(&form).await
    }

    /// No-op when the provider has no revocation endpoint.
    pub async fn revoke_token(&self, token: &str) -> Result<(), StorageError> {
        let Some(url) = self.endpoints.revoke.clone() else {
            return Ok(());
        };
        let form = [
            ("token", token),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
        ];
        let request = self.http.post(url).form(&form);
        http::send_refined(request, Some(refine_grant_error)).await?;
        Ok(())
    }

    async fn post_token(&self, form: &[(&str, &str)]) -> Result<OAuthToken, StorageError> {
        let request = self.http.post(self.endpoints.token.clone()).form(form);
        http::send_json_refined(request, refine_grant_error).await
    }
}

/// A rejected grant means the user has to authorize again.
fn refine_grant_error(status: StatusCode, body: &str) -> Option<Reason> {
    (status == StatusCode::BAD_REQUEST && body.contains("invalid_grant"))
        .then_some(Reason::Unauthorized)
}

#[derive(Debug, Deserialize, Serialize)]
pub struct OAuthToken {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl OAuthToken {
    /// Keeps `previous_refresh` when the provider did not rotate it.
    pub fn into_grant(self, previous_refresh: Option<&str>) -> TokenGrant {
        let expires_at = self
            .expires_in
            .map(|secs| now_unix().saturating_add(secs as i64));
        TokenGrant {
            access_token: self.access_token,
            refresh_token: self
                .refresh_token
                .or_else(|| previous_refresh.map(str::to_string)),
            expires_at,
        }
    }
}
