//! Error types for sapp-protocol

use thiserror::Error;

/// Result type alias using the protocol decode error
pub type Result<T> = std::result::Result<T, DecodeError>;

/// Reasons a raw frame could not be turned into a [`crate::ProtocolMessage`]
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Frame is not a JSON object
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A tag field is absent or not a string
    #[error("Missing tag field: {0}")]
    MissingField(&'static str),

    /// The `label` tag names no known message family
    #[error("Unknown label: {0}")]
    UnknownLabel(String),

    /// The `type` tag names no known conversation event
    #[error("Unknown type: {0}")]
    UnknownType(String),

    /// The tags matched but the payload lacks a required field
    #[error("Invalid payload for {kind}: {source}")]
    InvalidPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl DecodeError {
    /// The unrecognized tag value, if this error was caused by one
    pub fn offending_tag(&self) -> Option<&str> {
        match self {
            DecodeError::UnknownLabel(tag) | DecodeError::UnknownType(tag) => Some(tag),
            _ => None,
        }
    }
}
