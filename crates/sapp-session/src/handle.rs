//! A cloneable handle for driving the session engine from external code.

use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::engine::{Command, SessionSnapshot};
use crate::error::{Error, Result};
use crate::events::SessionEvent;

/// A cloneable handle for driving a [`SessionEngine`](crate::SessionEngine).
///
/// Commands are queued and applied in order by the engine loop; they return
/// as soon as the command is queued.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
    events: broadcast::Sender<SessionEvent>,
    shutdown: CancellationToken,
}

impl SessionHandle {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<Command>,
        snapshot: watch::Receiver<SessionSnapshot>,
        events: broadcast::Sender<SessionEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            commands,
            snapshot,
            events,
            shutdown,
        }
    }

    /// Turn the microphone off and tear down any session.
    pub fn mute(&self) -> Result<()> {
        self.send(Command::Mute)
    }

    /// Turn the microphone on, fetching credentials and connecting.
    pub fn unmute(&self) -> Result<()> {
        self.send(Command::Unmute)
    }

    pub fn toggle_mute(&self) -> Result<()> {
        self.send(Command::ToggleMute)
    }

    /// Reconnect after a failure. Ignored unless the session is in error.
    pub fn retry(&self) -> Result<()> {
        self.send(Command::Retry)
    }

    /// Stop the engine loop, closing any open connection.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Whether the engine loop has been asked to stop or has stopped.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// The most recently published snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// A receiver notified every time a new snapshot is published.
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Subscribe to engine events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Wait until a snapshot satisfies `predicate`, checking the current one first.
    pub async fn wait_for<F>(&self, mut predicate: F) -> Result<SessionSnapshot>
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(|snapshot| predicate(snapshot))
            .await
            .map_err(|_| Error::EngineStopped)?;
        Ok(snapshot.clone())
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::EngineStopped)
    }
}
