//! sapp-session: transcript session engine
//!
//! Owns the mute/connect/disconnect lifecycle of a realtime voice session,
//! folds decoded conversation frames into transcript state and forwards
//! hardware actions to the robot.

pub mod credentials;
pub mod debounce;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod handle;
pub mod transcript;
pub mod transport;

pub use credentials::{CredentialSource, Credentials, HttpCredentialFetcher, StaticCredentials};
pub use dispatch::{ActionDispatcher, RobotCommand, RobotControl};
pub use engine::{EngineConfig, SessionEngine, SessionPhase, SessionSnapshot, SessionState};
pub use error::{Error, FetchError, Result, SessionError, TransportError};
pub use events::SessionEvent;
pub use handle::SessionHandle;
pub use transcript::{Role, TranscriptEntry, TranscriptFold, TranscriptState};
pub use transport::{RealtimeTransport, TransportConnection, TransportEvent, TransportEvents};
