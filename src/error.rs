/// Error types for token refresh and lease coordination
use serde_json::Value;
use thiserror::Error;

/// The part of a failed call that refresh decisions look at
///
/// `body` holds the parsed response body. Bodies that are not JSON are kept
/// as a JSON string, empty bodies become `Value::Null`.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureResponse {
    pub status: u16,
    pub body: Value,
}

impl FailureResponse {
    pub fn new(status: u16, body: Value) -> Self {
        Self { status, body }
    }

    /// Build a failure response from a raw body
    pub fn from_text(status: u16, text: &str) -> Self {
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
        };

        Self { status, body }
    }
}

/// A failure returned by an operation forwarded through a proxy
///
/// Only failures carrying a response take part in refresh decisions.
/// Anything else (transport errors, local errors) propagates untouched.
pub trait Failure: std::error::Error {
    fn response(&self) -> Option<&FailureResponse>;
}

/// A non-success HTTP response
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Request failed with status {}", .response.status)]
pub struct ResponseError {
    response: FailureResponse,
}

impl ResponseError {
    pub fn new(status: u16, body: Value) -> Self {
        Self {
            response: FailureResponse::new(status, body),
        }
    }

    pub fn status(&self) -> u16 {
        self.response.status
    }

    pub fn body(&self) -> &Value {
        &self.response.body
    }

    /// Pass a successful response through, turn any other status into a `ResponseError`
    pub fn check(
        response: reqwest::blocking::Response,
    ) -> std::result::Result<reqwest::blocking::Response, ResponseError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().unwrap_or_default();
        Err(Self {
            response: FailureResponse::from_text(status.as_u16(), &text),
        })
    }
}

impl Failure for ResponseError {
    fn response(&self) -> Option<&FailureResponse> {
        Some(&self.response)
    }
}

/// Failure of an authorized HTTP request sent through `Credential::send`
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error(transparent)]
    Status(#[from] ResponseError),
}

impl Failure for RequestError {
    fn response(&self) -> Option<&FailureResponse> {
        match self {
            RequestError::Transport(_) => None,
            RequestError::Status(e) => e.response(),
        }
    }
}

/// Failure of the refresh operation itself
#[derive(Error, Debug)]
pub enum RefreshError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON parsing failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("OAuth error: {error}, description: {description:?}")]
    OAuthErrorResponse {
        error: String,
        description: Option<String>,
    },

    #[error("Token endpoint rejected the refresh: {0}")]
    Endpoint(ResponseError),

    #[error("No refresh token available")]
    NoRefreshToken,

    #[error("Invalid response from server: {0}")]
    InvalidResponse(String),
}

pub type Result<T> = std::result::Result<T, RefreshError>;

/// Failure to obtain or use a lease
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Lock {key} still held after {attempts} attempts")]
    Contention { key: String, attempts: u32 },

    #[error("Lock store error: {0}")]
    StoreError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl LockError {
    /// Whether the lease was simply busy, meaning the caller should try again later
    pub fn is_contention(&self) -> bool {
        matches!(self, LockError::Contention { .. })
    }
}

/// Why a refresh cycle could not produce a credential
#[derive(Error, Debug)]
pub enum RenewError {
    #[error(transparent)]
    Refresh(#[from] RefreshError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Record reload failed: {0}")]
    Record(String),
}

impl RenewError {
    /// Attach the failure that triggered the cycle, if any
    pub(crate) fn with_trigger<E>(self, trigger: Option<E>) -> ProxyError<E> {
        match self {
            RenewError::Refresh(source) => ProxyError::Refresh { source, trigger },
            RenewError::Lock(e) => ProxyError::Lock(e),
            RenewError::Record(msg) => ProxyError::Record(msg),
        }
    }
}

/// Error returned from an operation forwarded through a proxy
///
/// `E` is the failure type of the forwarded operation.
#[derive(Error, Debug)]
pub enum ProxyError<E> {
    /// The operation's own failure, unchanged
    #[error(transparent)]
    Operation(E),

    /// The refresh operation failed; `trigger` is the failure that started the cycle
    #[error("Token refresh failed: {source}")]
    Refresh {
        source: RefreshError,
        trigger: Option<E>,
    },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Record reload failed: {0}")]
    Record(String),
}

impl<E> ProxyError<E> {
    /// The operation failure carried by this error, either propagated or as a refresh trigger
    pub fn operation(&self) -> Option<&E> {
        match self {
            ProxyError::Operation(e) => Some(e),
            ProxyError::Refresh { trigger, .. } => trigger.as_ref(),
            _ => None,
        }
    }

    pub fn into_operation(self) -> Option<E> {
        match self {
            ProxyError::Operation(e) => Some(e),
            ProxyError::Refresh { trigger, .. } => trigger,
            _ => None,
        }
    }

    pub fn is_contention(&self) -> bool {
        matches!(self, ProxyError::Lock(e) if e.is_contention())
    }
}

/// Failure to load `Settings`
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON parsing failed: {0}")]
    JsonError(#[from] serde_json::Error),
}
