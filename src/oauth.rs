/// Refresh operation: exchanging a refresh token for a new credential
use crate::credential::{now_secs, Credential};
use crate::error::{RefreshError, ResponseError, Result};
use reqwest::header::ACCEPT;
use serde::Deserialize;
use tracing::debug;

/// Produces a new credential from a stale one
///
/// Implemented for closures, which is handy for tests and for hosts that
/// already own an OAuth client:
///
/// ```
/// use tokenwrap::prelude::*;
///
/// let refresher = |old: &Credential| -> tokenwrap::error::Result<Credential> {
///     Ok(Credential::new("fresh", old.refresh_token.clone(), None))
/// };
/// let stale = Credential::new("stale", "r", Some(0));
/// assert_eq!(refresher.refresh(&stale).unwrap().token, "fresh");
/// ```
pub trait Refresher: Send + Sync {
    fn refresh(&self, credential: &Credential) -> Result<Credential>;
}

impl<F> Refresher for F
where
    F: Fn(&Credential) -> Result<Credential> + Send + Sync,
{
    fn refresh(&self, credential: &Credential) -> Result<Credential> {
        self(credential)
    }
}

/// OAuth 2.0 client settings for the refresh grant
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub token_endpoint: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Refresher performing a `grant_type=refresh_token` exchange over HTTP
pub struct HttpRefresher {
    config: OAuthConfig,
    http: reqwest::blocking::Client,
}

impl HttpRefresher {
    pub fn new(config: OAuthConfig) -> Self {
        Self::with_client(config, reqwest::blocking::Client::new())
    }

    /// Use a preconfigured HTTP client (timeouts, proxies, TLS)
    pub fn with_client(config: OAuthConfig, http: reqwest::blocking::Client) -> Self {
        Self { config, http }
    }

    pub fn config(&self) -> &OAuthConfig {
        &self.config
    }
}

impl Refresher for HttpRefresher {
    fn refresh(&self, credential: &Credential) -> Result<Credential> {
        if credential.refresh_token.is_empty() {
            return Err(RefreshError::NoRefreshToken);
        }

        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", credential.refresh_token.as_str()),
            ("client_id", self.config.client_id.as_str()),
        ];
        if let Some(secret) = &self.config.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        debug!(endpoint = %self.config.token_endpoint, "requesting token refresh");
        let response = self
            .http
            .post(&self.config.token_endpoint)
            .header(ACCEPT, "application/json")
            .form(&form)
            .send()?;
        let response = ResponseError::check(response).map_err(endpoint_error)?;

        parse_token_response(&response.text()?, credential, now_secs())
    }
}

/// Prefer the OAuth error body when the endpoint sent one
fn endpoint_error(err: ResponseError) -> RefreshError {
    match serde_json::from_value::<ErrorResponse>(err.body().clone()) {
        Ok(body) => RefreshError::OAuthErrorResponse {
            error: body.error,
            description: body.error_description,
        },
        Err(_) => RefreshError::Endpoint(err),
    }
}

/// Build the replacement credential from a token endpoint response
///
/// A response without a refresh token keeps the previous one.
fn parse_token_response(body: &str, previous: &Credential, now: u64) -> Result<Credential> {
    let response: TokenResponse = serde_json::from_str(body)?;
    if response.access_token.is_empty() {
        return Err(RefreshError::InvalidResponse(
            "empty access_token".to_string(),
        ));
    }

    let refresh_token = response
        .refresh_token
        .filter(|token| !token.is_empty())
        .unwrap_or_else(|| previous.refresh_token.clone());

    Ok(Credential {
        token: response.access_token,
        refresh_token,
        expires_at: response.expires_in.map(|secs| now.saturating_add(secs)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    /// Serve a single canned response and hand back the request body
    fn serve_once(status_line: &str, body: &str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/oauth/token", listener.local_addr().unwrap());
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status_line,
            body.len(),
            body
        );

        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());

            let mut content_length = 0;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                let line = line.trim_end();
                if line.is_empty() {
                    break;
                }
                if let Some((name, value)) = line.split_once(':') {
                    if name.eq_ignore_ascii_case("content-length") {
                        content_length = value.trim().parse().unwrap();
                    }
                }
            }

            let mut request_body = vec![0; content_length];
            reader.read_exact(&mut request_body).unwrap();

            let mut stream = stream;
            stream.write_all(response.as_bytes()).unwrap();
            stream.flush().unwrap();

            String::from_utf8(request_body).unwrap()
        });

        (url, handle)
    }

    fn refresher(token_endpoint: String) -> HttpRefresher {
        HttpRefresher::new(OAuthConfig {
            client_id: "AAA".to_string(),
            client_secret: Some("BBB".to_string()),
            token_endpoint,
        })
    }

    #[test]
    fn test_parse_token_response() {
        let previous = Credential::new("old", "DEF", Some(10));
        let body = r#"{"access_token":"57ed30","expires_in":7200,"refresh_token":"026b34","token_type":"bearer"}"#;

        let credential = parse_token_response(body, &previous, 1_000).unwrap();
        assert_eq!(credential.token, "57ed30");
        assert_eq!(credential.refresh_token, "026b34");
        assert_eq!(credential.expires_at, Some(8_200));
    }

    #[test]
    fn test_parse_token_response_keeps_previous_refresh_token() {
        let previous = Credential::new("old", "DEF", Some(10));
        let credential = parse_token_response(r#"{"access_token":"new"}"#, &previous, 1_000).unwrap();

        assert_eq!(credential.refresh_token, "DEF");
        assert_eq!(credential.expires_at, None);
    }

    #[test]
    fn test_parse_token_response_rejects_empty_token() {
        let previous = Credential::new("old", "DEF", None);
        let err = parse_token_response(r#"{"access_token":""}"#, &previous, 0).unwrap_err();
        assert!(matches!(err, RefreshError::InvalidResponse(_)));
    }

    #[test]
    fn test_refresh_without_refresh_token() {
        let refresher = refresher("http://127.0.0.1:9/oauth/token".to_string());
        let err = refresher
            .refresh(&Credential::new("old", "", None))
            .unwrap_err();
        assert!(matches!(err, RefreshError::NoRefreshToken));
    }

    #[test]
    fn test_http_refresh_sends_refresh_grant() {
        let (url, server) = serve_once(
            "200 OK",
            r#"{"access_token":"57ed30","expires_in":7200,"refresh_token":"026b34","scope":"public","token_type":"bearer"}"#,
        );

        let credential = refresher(url)
            .refresh(&Credential::new("ABC", "DEF", Some(0)))
            .unwrap();
        let request_body = server.join().unwrap();

        assert_eq!(credential.token, "57ed30");
        assert_eq!(credential.refresh_token, "026b34");
        assert!(!credential.is_expiring());
        assert!(request_body.contains("grant_type=refresh_token"));
        assert!(request_body.contains("refresh_token=DEF"));
        assert!(request_body.contains("client_id=AAA"));
        assert!(request_body.contains("client_secret=BBB"));
    }

    #[test]
    fn test_http_refresh_reports_oauth_error() {
        let (url, server) = serve_once(
            "400 Bad Request",
            r#"{"error":"invalid_grant","error_description":"revoked"}"#,
        );

        let err = refresher(url)
            .refresh(&Credential::new("ABC", "DEF", None))
            .unwrap_err();
        server.join().unwrap();

        match err {
            RefreshError::OAuthErrorResponse { error, description } => {
                assert_eq!(error, "invalid_grant");
                assert_eq!(description.as_deref(), Some("revoked"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_http_refresh_reports_plain_endpoint_failure() {
        let (url, server) = serve_once("503 Service Unavailable", "down for maintenance");

        let err = refresher(url)
            .refresh(&Credential::new("ABC", "DEF", None))
            .unwrap_err();
        server.join().unwrap();

        match err {
            RefreshError::Endpoint(response) => assert_eq!(response.status(), 503),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
