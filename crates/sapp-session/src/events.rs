//! Session event types

use serde::Serialize;

use crate::dispatch::RobotCommand;
use crate::engine::SessionPhase;
use crate::transcript::TranscriptEntry;

/// Notifications emitted by the session engine.
///
/// Current values are always available from the snapshot channel; these
/// events describe the individual changes for consumers that want them.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The lifecycle moved to a new phase
    PhaseChanged { phase: SessionPhase },

    /// A completed utterance moved into history
    EntryArchived { entry: TranscriptEntry },

    /// A hardware action was performed
    ActionDispatched { command: RobotCommand },

    /// A hardware action name was not recognised
    ActionIgnored { action: String },

    /// An inbound frame could not be decoded and was dropped
    FrameRejected { reason: String },

    /// Credential retrieval or the transport failed
    Failed {
        message: String,
        /// Likely cause to show the user, when known
        hint: Option<String>,
    },
}

impl SessionEvent {
    /// Check if this event reports a fatal session failure
    pub fn is_failure(&self) -> bool {
        matches!(self, SessionEvent::Failed { .. })
    }
}
