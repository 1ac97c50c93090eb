use std::fmt;
use std::time::Duration;

use reqwest::StatusCode;
use thiserror::Error;

/// Failure taxonomy shared by every provider adapter.
///
/// Adapters translate transport and HTTP failures into one of these reasons
/// before returning, so the sync engines never look at provider codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reason {
    Network,
    TooManyRequests,
    Unauthorized,
    AuthRevoked,
    NotFound,
    Conflict,
    PreconditionFailed,
    UserCanceled,
    AppKeysNotFound,
    AccountNotFound,
    AccessTokenIsNull,
    InvalidResponse,
    Io,
    Other,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Network => "network_error",
            Reason::TooManyRequests => "too_many_requests",
            Reason::Unauthorized => "unauthorized",
            Reason::AuthRevoked => "auth_revoked",
            Reason::NotFound => "not_found",
            Reason::Conflict => "conflict",
            Reason::PreconditionFailed => "precondition_failed",
            Reason::UserCanceled => "user_canceled",
            Reason::AppKeysNotFound => "app_keys_not_found",
            Reason::AccountNotFound => "account_not_found",
            Reason::AccessTokenIsNull => "access_token_is_null",
            Reason::InvalidResponse => "invalid_response",
            Reason::Io => "io_error",
            Reason::Other => "other",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Reason::Network | Reason::TooManyRequests)
    }

    /// Configuration problems are surfaced and never retried automatically.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Reason::AppKeysNotFound | Reason::AccountNotFound | Reason::AccessTokenIsNull
        )
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("{reason}: {message}")]
pub struct StorageError {
    reason: Reason,
    message: String,
    retry_after: Option<Duration>,
}

impl StorageError {
    pub fn new(reason: Reason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn canceled() -> Self {
        Self::new(Reason::UserCanceled, "operation canceled")
    }

    pub fn not_found(what: impl fmt::Display) -> Self {
        Self::new(Reason::NotFound, format!("{what} not found"))
    }

    pub fn invalid_response(message: impl Into<String>) -> Self {
        Self::new(Reason::InvalidResponse, message)
    }

    /// Builds an error from a non-success HTTP response.
    pub fn from_status(status: StatusCode, body: String, retry_after: Option<Duration>) -> Self {
        Self {
            reason: classify_status(status),
            message: format!("api returned {status}: {body}"),
            retry_after,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn with_reason(mut self, reason: Reason) -> Self {
        self.reason = reason;
        self
    }

    pub fn reason(&self) -> Reason {
        self.reason
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    pub fn is(&self, reason: Reason) -> bool {
        self.reason == reason
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        let reason = if let Some(status) = err.status() {
            classify_status(status)
        } else if err.is_decode() {
            Reason::InvalidResponse
        } else if err.is_builder() {
            Reason::Other
        } else {
            Reason::Network
        };
        Self::new(reason, format!("request failed: {err}"))
    }
}

impl From<url::ParseError> for StorageError {
    fn from(err: url::ParseError) -> Self {
        Self::new(Reason::Other, format!("invalid url: {err}"))
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::new(Reason::Io, format!("I/O error: {err}"))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_response(format!("malformed payload: {err}"))
    }
}

pub fn classify_status(status: StatusCode) -> Reason {
    match status {
        StatusCode::UNAUTHORIZED => Reason::Unauthorized,
        StatusCode::NOT_FOUND | StatusCode::GONE => Reason::NotFound,
        StatusCode::CONFLICT => Reason::Conflict,
        StatusCode::PRECONDITION_FAILED => Reason::PreconditionFailed,
        StatusCode::TOO_MANY_REQUESTS => Reason::TooManyRequests,
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_EARLY => Reason::Network,
        status if status.is_server_error() => Reason::Network,
        _ => Reason::Other,
    }
}
