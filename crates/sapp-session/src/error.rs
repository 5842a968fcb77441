//! Error types for sapp-session

use thiserror::Error;

/// Result type alias using sapp-session Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned to callers of the session API
#[derive(Error, Debug)]
pub enum Error {
    /// The engine loop has exited and no longer accepts commands
    #[error("Session engine has stopped")]
    EngineStopped,
}

/// Failure to obtain session credentials
#[derive(Error, Debug)]
pub enum FetchError {
    /// DNS, connect, TLS or timeout failure
    #[error("Credential request failed: {0}")]
    Request(#[source] reqwest::Error),

    /// Backend answered with a non-2xx status
    #[error("Credential endpoint returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    /// Response body was not the expected JSON
    #[error("Malformed credential response: {0}")]
    Body(#[source] reqwest::Error),
}

impl FetchError {
    /// Whether the request never reached the backend
    pub fn is_connect(&self) -> bool {
        matches!(self, FetchError::Request(e) if e.is_connect())
    }

    /// Whether the request timed out
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Request(e) if e.is_timeout())
    }
}

/// Failure of the realtime channel
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The channel could not be opened
    #[error("Transport connect failed: {0}")]
    Connect(String),

    /// The channel failed after it was opened
    #[error("Transport failure: {0}")]
    Failed(String),
}

/// Fatal errors surfaced in session state
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl SessionError {
    /// Check if this error came from credential retrieval
    pub fn is_fetch(&self) -> bool {
        matches!(self, SessionError::Fetch(_))
    }

    /// Check if this error came from the realtime channel
    pub fn is_transport(&self) -> bool {
        matches!(self, SessionError::Transport(_))
    }

    /// A short suggestion for the user, when the failure has a likely cause
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            SessionError::Fetch(e) if e.is_timeout() => Some(
                "Connecting after a long period of inactivity may take a few minutes.",
            ),
            SessionError::Fetch(e) if e.is_connect() => {
                Some("Please make sure you are connected to the internet.")
            }
            _ => None,
        }
    }
}
