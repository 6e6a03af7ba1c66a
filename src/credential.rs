/// Credential value and expiry checks
use crate::error::{RequestError, ResponseError};
use reqwest::blocking::{RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Margin before the literal expiry at which a credential counts as expiring
pub const EXPIRY_GRACE: Duration = Duration::from_secs(30);

/// Current unix time in seconds
pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Access credential
///
/// Immutable once built: a refresh produces a new `Credential`.
/// `expires_at` is a unix timestamp in seconds; `None` means the credential
/// never expires on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub token: String,
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl Credential {
    pub fn new(
        token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: Option<u64>,
    ) -> Self {
        Self {
            token: token.into(),
            refresh_token: refresh_token.into(),
            expires_at,
        }
    }

    /// Check if the credential is past its expiry
    pub fn is_expired(&self) -> bool {
        self.expires_within(Duration::ZERO, now_secs())
    }

    /// Check if the credential expires within the grace period
    pub fn is_expiring(&self) -> bool {
        self.expires_within(EXPIRY_GRACE, now_secs())
    }

    /// Whether `expires_at` falls at or before `now + margin`
    pub fn expires_within(&self, margin: Duration, now: u64) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now.saturating_add(margin.as_secs()),
            None => false,
        }
    }

    /// Attach this credential as a bearer token
    pub fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request.bearer_auth(&self.token)
    }

    /// Send an authorized request, turning non-success statuses into errors
    ///
    /// Meant to be used inside `TokenProxy::forward`:
    ///
    /// ```no_run
    /// # use tokenwrap::prelude::*;
    /// # fn run(proxy: &mut TokenProxy<DirectRefresh<HttpRefresher>>) {
    /// let http = reqwest::blocking::Client::new();
    /// let response = proxy
    ///     .forward(|credential| credential.send(http.get("https://api.example.com/me")))
    ///     .unwrap();
    /// println!("{}", response.status());
    /// # }
    /// ```
    pub fn send(&self, request: RequestBuilder) -> Result<Response, RequestError> {
        let response = self.authorize(request).send()?;
        Ok(ResponseError::check(response)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_expiration() {
        let now = now_secs();

        let expired = Credential::new("access", "refresh", Some(now - 100));
        assert!(expired.is_expired());
        assert!(expired.is_expiring());

        let valid = Credential::new("access", "refresh", Some(now + 3600));
        assert!(!valid.is_expired());
        assert!(!valid.is_expiring());
    }

    #[test]
    fn test_grace_period_boundary() {
        let now = 1_700_000_000;

        let inside = Credential::new("a", "r", Some(now + 30));
        assert!(inside.expires_within(EXPIRY_GRACE, now));

        let outside = Credential::new("a", "r", Some(now + 31));
        assert!(!outside.expires_within(EXPIRY_GRACE, now));
    }

    #[test]
    fn test_missing_expiry_never_expires() {
        let credential = Credential::new("a", "r", None);
        assert!(!credential.is_expired());
        assert!(!credential.expires_within(Duration::from_secs(u64::MAX), u64::MAX));
    }

    #[test]
    fn test_credential_serialization_skips_missing_expiry() {
        let credential = Credential::new("a", "r", None);
        let json = serde_json::to_string(&credential).unwrap();
        assert_eq!(json, r#"{"token":"a","refresh_token":"r"}"#);

        let parsed: Credential = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, credential);
    }

    #[test]
    fn test_authorize_sets_bearer_header() {
        let credential = Credential::new("abc", "def", None);
        let request = credential
            .authorize(reqwest::blocking::Client::new().get("http://localhost/me"))
            .build()
            .unwrap();

        assert_eq!(
            request.headers()[reqwest::header::AUTHORIZATION],
            "Bearer abc"
        );
    }
}
