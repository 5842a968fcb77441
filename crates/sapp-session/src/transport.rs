//! Realtime transport abstraction
//!
//! The media transport (audio tracks, codecs, room signalling) lives outside
//! this crate. The engine only needs to open a connection with fetched
//! credentials, receive its lifecycle callbacks and data frames, and close it.

use tokio::sync::mpsc;

use crate::credentials::Credentials;
use crate::error::TransportError;

/// Callbacks delivered by an open transport connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The remote side accepted the connection
    Connected,
    /// The remote side closed the connection
    Disconnected,
    /// An inbound data-channel message (UTF-8 JSON text)
    Data(Vec<u8>),
    /// The connection failed
    Error(TransportError),
}

/// Sender handed to a transport for reporting [`TransportEvent`]s.
///
/// Every event is tagged with the connection it belongs to, so events from a
/// connection the engine has already closed are recognised and dropped.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    connection: u64,
    tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
}

impl TransportEvents {
    pub fn new(connection: u64, tx: mpsc::UnboundedSender<(u64, TransportEvent)>) -> Self {
        Self { connection, tx }
    }

    /// Connection number these events are tagged with
    pub fn connection(&self) -> u64 {
        self.connection
    }

    /// Report an event. Returns false once the receiving engine is gone.
    pub fn send(&self, event: TransportEvent) -> bool {
        self.tx.send((self.connection, event)).is_ok()
    }

    pub fn connected(&self) -> bool {
        self.send(TransportEvent::Connected)
    }

    pub fn disconnected(&self) -> bool {
        self.send(TransportEvent::Disconnected)
    }

    pub fn data(&self, payload: impl Into<Vec<u8>>) -> bool {
        self.send(TransportEvent::Data(payload.into()))
    }

    pub fn error(&self, error: TransportError) -> bool {
        self.send(TransportEvent::Error(error))
    }
}

/// Factory for realtime connections
pub trait RealtimeTransport: Send + Sync {
    /// Start connecting with the given credentials.
    ///
    /// Returns once the connection attempt is underway; progress is reported
    /// through `events`. An immediate failure is returned as an error.
    fn open(
        &self,
        credentials: &Credentials,
        events: TransportEvents,
    ) -> Result<Box<dyn TransportConnection>, TransportError>;
}

/// An open realtime connection
pub trait TransportConnection: Send {
    /// Close the connection and stop delivering events
    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_are_tagged_with_connection() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = TransportEvents::new(7, tx);

        assert!(events.connected());
        assert!(events.data("{}"));
        assert!(events.error(TransportError::Failed("gone".into())));

        assert_eq!(rx.try_recv().unwrap(), (7, TransportEvent::Connected));
        assert_eq!(
            rx.try_recv().unwrap(),
            (7, TransportEvent::Data(b"{}".to_vec()))
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            (7, TransportEvent::Error(TransportError::Failed("gone".into())))
        );
    }

    #[test]
    fn test_send_after_receiver_dropped() {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = TransportEvents::new(1, tx);
        drop(rx);
        assert!(!events.disconnected());
    }
}
