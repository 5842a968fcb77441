//! Session credential retrieval

use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

use crate::error::FetchError;

/// Path of the credential endpoint relative to the backend base URL
pub const CREDENTIALS_PATH: &str = "/api/livekit";

/// Where and how to join the realtime room.
///
/// The token is single-use and is never printed by `Debug`.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct Credentials {
    pub url: String,
    pub room: String,
    pub token: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("url", &self.url)
            .field("room", &self.room)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Source of fresh session credentials
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self) -> Result<Credentials, FetchError>;
}

/// Fetches credentials from the backend over HTTP with Basic auth
pub struct HttpCredentialFetcher {
    client: reqwest::Client,
    endpoint: String,
    password: String,
    timeout: Option<Duration>,
}

impl HttpCredentialFetcher {
    /// Create a fetcher for `{base_url}/api/livekit`
    pub fn new(base_url: &str, password: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), CREDENTIALS_PATH),
            password: password.into(),
            timeout: None,
        }
    }

    /// Limit how long a single request may take
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl CredentialSource for HttpCredentialFetcher {
    async fn fetch(&self) -> Result<Credentials, FetchError> {
        tracing::debug!("Fetching session credentials from {}", self.endpoint);

        let mut request = self
            .client
            .get(&self.endpoint)
            .basic_auth("", Some(&self.password));
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().await.map_err(FetchError::Request)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Status { status, body });
        }

        let credentials: Credentials = response.json().await.map_err(FetchError::Body)?;
        tracing::debug!("Received credentials for room {}", credentials.room);
        Ok(credentials)
    }
}

/// Always yields the same credentials
#[derive(Debug, Clone)]
pub struct StaticCredentials(pub Credentials);

#[async_trait]
impl CredentialSource for StaticCredentials {
    async fn fetch(&self) -> Result<Credentials, FetchError> {
        Ok(self.0.clone())
    }
}
