//! sapp-protocol: typed messages for the realtime data channel
//!
//! The backend pushes JSON text frames tagged with a `label` and, for
//! conversation frames, a `type`. This crate turns those frames into a closed
//! set of Rust types.

pub mod decode;
pub mod error;
pub mod message;

pub use decode::decode;
pub use error::{DecodeError, Result};
pub use message::{ConversationEvent, HardwareAction, ProtocolMessage};
