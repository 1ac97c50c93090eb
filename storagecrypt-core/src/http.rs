use std::time::{Duration, SystemTime};

use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;

use crate::error::{Reason, StorageError};

/// How a provider expects the access token on each request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Bearer,
    OAuth,
    AuthToken,
}

impl AuthScheme {
    pub fn apply(self, request: RequestBuilder, token: &str) -> RequestBuilder {
        match self {
            AuthScheme::Bearer => request.header("Authorization", format!("Bearer {token}")),
            AuthScheme::OAuth => request.header("Authorization", format!("OAuth {token}")),
            AuthScheme::AuthToken => request.header("X-Auth-Token", token),
        }
    }
}

/// Provider hook to reclassify a failed response, e.g. rate limits reported
/// with a non-429 status.
pub type Refine = fn(StatusCode, &str) -> Option<Reason>;

pub async fn send(request: RequestBuilder) -> Result<Response, StorageError> {
    send_refined(request, None).await
}

pub async fn send_refined(
    request: RequestBuilder,
    refine: Option<Refine>,
) -> Result<Response, StorageError> {
    let response = request.send().await?;
    check(response, refine).await
}

pub async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, StorageError> {
    let response = send(request).await?;
    Ok(response.json::<T>().await?)
}

pub async fn send_json_refined<T: DeserializeOwned>(
    request: RequestBuilder,
    refine: Refine,
) -> Result<T, StorageError> {
    let response = send_refined(request, Some(refine)).await?;
    Ok(response.json::<T>().await?)
}

pub async fn check(response: Response, refine: Option<Refine>) -> Result<Response, StorageError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let retry_after = retry_after(response.headers());
    let body = response.text().await.unwrap_or_default();
    let mut err = StorageError::from_status(status, body.clone(), retry_after);
    if let Some(reason) = refine.and_then(|refine| refine(status, &body)) {
        err = err.with_reason(reason);
    }
    tracing::debug!(%status, reason = %err.reason(), "provider request failed");
    Err(err)
}

/// Parses `Retry-After` given either in seconds or as an HTTP date.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(at.duration_since(SystemTime::now()).unwrap_or(Duration::ZERO))
}

pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

pub fn header_i64(headers: &HeaderMap, name: &str) -> Option<i64> {
    header_str(headers, name).and_then(|value| value.trim().parse().ok())
}

/// `Last-Modified` as unix milliseconds.
pub fn last_modified_millis(headers: &HeaderMap) -> Option<i64> {
    let value = header_str(headers, "last-modified")?;
    let at = httpdate::parse_http_date(value).ok()?;
    at.duration_since(std::time::UNIX_EPOCH)
        .ok()
        .map(|d| d.as_millis() as i64)
}
