//! Session lifecycle and the engine loop
//!
//! User intent, credential fetch completions, debounce expiries and
//! transport callbacks all arrive on channels and are applied one at a time
//! by [`SessionEngine::run`], which is the only writer of session and
//! transcript state. Consumers read immutable [`SessionSnapshot`]s.

use sapp_protocol::{ConversationEvent, HardwareAction, ProtocolMessage};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use crate::{
    credentials::{CredentialSource, Credentials},
    debounce::{DEFAULT_DEBOUNCE, Debouncer},
    dispatch::{ActionDispatcher, RobotControl},
    error::{FetchError, SessionError},
    events::SessionEvent,
    handle::SessionHandle,
    transcript::{DEFAULT_HISTORY_LIMIT, PendingReplace, TranscriptFold, TranscriptState},
    transport::{RealtimeTransport, TransportConnection, TransportEvent, TransportEvents},
};

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Delay before a user transcription delta replaces the current text
    pub debounce: Duration,
    /// Maximum number of completed entries kept in history
    pub history_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// Where the session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Muted,
    Connecting,
    Connected,
    Error,
}

/// Observable session state
#[derive(Debug, Clone)]
pub struct SessionState {
    pub phase: SessionPhase,
    /// Credentials of the open connection
    pub credentials: Option<Credentials>,
    /// Whether the transport has reported the remote side as connected
    pub link_up: bool,
    /// The failure that put the session into [`SessionPhase::Error`]
    pub last_error: Option<Arc<SessionError>>,
}

impl SessionState {
    /// Microphone is off unless connecting or connected
    pub fn is_muted(&self) -> bool {
        matches!(self.phase, SessionPhase::Muted | SessionPhase::Error)
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: SessionPhase::Muted,
            credentials: None,
            link_up: false,
            last_error: None,
        }
    }
}

/// Everything a renderer needs, captured at one point in time
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub session: SessionState,
    pub transcript: TranscriptState,
}

/// Internal commands applied by the engine loop
#[derive(Debug)]
pub(crate) enum Command {
    Mute,
    Unmute,
    ToggleMute,
    Retry,
    FetchCompleted {
        attempt: u64,
        result: Result<Credentials, FetchError>,
    },
    DebounceElapsed(PendingReplace),
}

enum Input {
    Command(Command),
    Transport(u64, TransportEvent),
    Stop,
}

/// Single writer of session and transcript state
pub struct SessionEngine {
    config: EngineConfig,
    session_id: Uuid,
    credentials: Arc<dyn CredentialSource>,
    transport: Arc<dyn RealtimeTransport>,
    dispatcher: ActionDispatcher,

    state: SessionState,
    transcript: TranscriptFold,
    debouncer: Debouncer,
    dirty: bool,

    /// Current credential fetch attempt
    attempt: u64,
    fetch_cancel: Option<CancellationToken>,

    /// Number of the most recently opened connection
    connection_seq: u64,
    connection: Option<Box<dyn TransportConnection>>,

    commands: mpsc::WeakUnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    transport_tx: mpsc::UnboundedSender<(u64, TransportEvent)>,
    transport_rx: mpsc::UnboundedReceiver<(u64, TransportEvent)>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    event_tx: broadcast::Sender<SessionEvent>,
    shutdown: CancellationToken,
}

impl SessionEngine {
    /// Create an engine and the handle used to drive it.
    ///
    /// The engine does nothing until [`SessionEngine::run`] is polled. It
    /// stops when the handle requests shutdown or every handle is dropped.
    pub fn new(
        config: EngineConfig,
        credentials: Arc<dyn CredentialSource>,
        transport: Arc<dyn RealtimeTransport>,
        robot: Arc<dyn RobotControl>,
    ) -> (Self, SessionHandle) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
        let (event_tx, _) = broadcast::channel(256);
        let shutdown = CancellationToken::new();

        let handle = SessionHandle::new(
            commands_tx.clone(),
            snapshot_rx,
            event_tx.clone(),
            shutdown.clone(),
        );

        let engine = Self {
            transcript: TranscriptFold::new(config.history_limit),
            debouncer: Debouncer::new(config.debounce),
            config,
            session_id: Uuid::new_v4(),
            credentials,
            transport,
            dispatcher: ActionDispatcher::new(robot),
            state: SessionState::default(),
            dirty: false,
            attempt: 0,
            fetch_cancel: None,
            connection_seq: 0,
            connection: None,
            commands: commands_tx.downgrade(),
            commands_rx,
            transport_tx,
            transport_rx,
            snapshot_tx,
            event_tx,
            shutdown,
        };

        (engine, handle)
    }

    /// Get the engine config
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Identifier attached to this engine's log span
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Spawn the engine loop onto the current tokio runtime
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run the engine loop until shutdown
    pub async fn run(mut self) {
        let span = tracing::info_span!("session", session_id = %self.session_id);
        async move {
            tracing::info!("Session engine started");
            loop {
                let input = tokio::select! {
                    biased;

                    _ = self.shutdown.cancelled() => Input::Stop,

                    command = self.commands_rx.recv() => match command {
                        Some(command) => Input::Command(command),
                        None => Input::Stop,
                    },

                    Some((connection, event)) = self.transport_rx.recv() => {
                        Input::Transport(connection, event)
                    }
                };

                match input {
                    Input::Command(command) => self.handle_command(command),
                    Input::Transport(connection, event) => self.handle_transport(connection, event),
                    Input::Stop => break,
                }
                self.publish();
            }

            self.teardown();
            self.set_phase(SessionPhase::Muted);
            self.publish();
            self.shutdown.cancel();
            tracing::info!("Session engine stopped");
        }
        .instrument(span)
        .await
    }

    pub(crate) fn handle_command(&mut self, command: Command) {
        match command {
            Command::Mute => self.mute(),
            Command::Unmute => self.unmute(),
            Command::ToggleMute => {
                if self.state.is_muted() {
                    self.unmute();
                } else {
                    self.mute();
                }
            }
            Command::Retry => self.retry(),
            Command::FetchCompleted { attempt, result } => self.on_fetch_completed(attempt, result),
            Command::DebounceElapsed(replace) => self.on_debounce_elapsed(replace),
        }
    }

    fn mute(&mut self) {
        match self.state.phase {
            SessionPhase::Muted => tracing::debug!("Already muted"),
            SessionPhase::Error => {
                self.state.last_error = None;
                self.set_phase(SessionPhase::Muted);
            }
            SessionPhase::Connecting | SessionPhase::Connected => {
                tracing::info!("Muting, tearing down session");
                self.teardown();
                self.set_phase(SessionPhase::Muted);
            }
        }
    }

    fn unmute(&mut self) {
        match self.state.phase {
            SessionPhase::Muted | SessionPhase::Error => self.begin_connect(),
            SessionPhase::Connecting | SessionPhase::Connected => {
                tracing::debug!("Already unmuted")
            }
        }
    }

    fn retry(&mut self) {
        if self.state.phase == SessionPhase::Error {
            self.begin_connect();
        } else {
            tracing::debug!("Ignoring retry in phase {:?}", self.state.phase);
        }
    }

    fn begin_connect(&mut self) {
        self.attempt += 1;
        let attempt = self.attempt;
        self.state.last_error = None;
        self.set_phase(SessionPhase::Connecting);

        let Some(commands) = self.commands.upgrade() else {
            return;
        };
        let cancel = self.shutdown.child_token();
        self.fetch_cancel = Some(cancel.clone());
        let source = Arc::clone(&self.credentials);

        tracing::info!("Fetching credentials (attempt {})", attempt);
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Credential fetch {} cancelled", attempt);
                    }
                    result = source.fetch() => {
                        let _ = commands.send(Command::FetchCompleted { attempt, result });
                    }
                }
            }
            .in_current_span(),
        );
    }

    fn on_fetch_completed(&mut self, attempt: u64, result: Result<Credentials, FetchError>) {
        if attempt != self.attempt || self.state.phase != SessionPhase::Connecting {
            tracing::warn!(
                "Discarding credential fetch {} (current attempt {}, phase {:?})",
                attempt,
                self.attempt,
                self.state.phase
            );
            return;
        }
        self.fetch_cancel = None;

        match result {
            Ok(credentials) => self.open_transport(credentials),
            Err(e) => {
                tracing::error!("Credential fetch failed: {}", e);
                self.fail(e.into());
            }
        }
    }

    fn open_transport(&mut self, credentials: Credentials) {
        self.debouncer.cancel();
        self.transcript.reset();
        self.dirty = true;

        self.connection_seq += 1;
        let events = TransportEvents::new(self.connection_seq, self.transport_tx.clone());

        match self.transport.open(&credentials, events) {
            Ok(connection) => {
                tracing::info!(
                    "Opened connection {} to room {}",
                    self.connection_seq,
                    credentials.room
                );
                self.connection = Some(connection);
                self.state.credentials = Some(credentials);
                self.state.link_up = false;
                self.set_phase(SessionPhase::Connected);
            }
            Err(e) => {
                tracing::error!("Transport failed to open: {}", e);
                self.fail(e.into());
            }
        }
    }

    fn handle_transport(&mut self, connection: u64, event: TransportEvent) {
        if self.connection.is_none() || connection != self.connection_seq {
            tracing::debug!("Dropping event from closed connection {}", connection);
            return;
        }

        match event {
            TransportEvent::Connected => {
                tracing::info!("Transport connected");
                self.state.link_up = true;
                self.dirty = true;
            }
            TransportEvent::Disconnected => {
                tracing::info!("Transport closed by remote");
                self.teardown();
                self.set_phase(SessionPhase::Muted);
            }
            TransportEvent::Error(e) => {
                tracing::error!("Transport error: {}", e);
                self.fail(e.into());
            }
            TransportEvent::Data(payload) => self.on_frame(payload),
        }
    }

    fn on_frame(&mut self, payload: Vec<u8>) {
        let raw = match String::from_utf8(payload) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("Dropping non UTF-8 frame: {}", e);
                self.emit(SessionEvent::FrameRejected {
                    reason: e.to_string(),
                });
                return;
            }
        };
        tracing::trace!("Frame: {}", raw);

        match sapp_protocol::decode(&raw) {
            Ok(message) => {
                tracing::debug!("Received {}", message.wire_kind());
                match message {
                    ProtocolMessage::Conversation(event) => self.on_conversation(event),
                    ProtocolMessage::Action(action) => self.on_action(action),
                }
            }
            Err(e) => {
                tracing::warn!("Dropping frame: {}", e);
                self.emit(SessionEvent::FrameRejected {
                    reason: e.to_string(),
                });
            }
        }
    }

    fn on_conversation(&mut self, event: ConversationEvent) {
        let outcome = self.transcript.apply(&event);

        if let Some(entry) = outcome.archived {
            self.emit(SessionEvent::EntryArchived { entry });
        }
        if outcome.changed {
            self.dirty = true;
        }
        if let Some(replace) = outcome.pending {
            self.schedule_replace(replace);
        }
    }

    fn schedule_replace(&mut self, replace: PendingReplace) {
        let Some(commands) = self.commands.upgrade() else {
            return;
        };
        tracing::trace!(
            "Replacing entry {} in {:?}",
            replace.entry_id,
            self.debouncer.delay()
        );
        self.debouncer.schedule(move || {
            let _ = commands.send(Command::DebounceElapsed(replace));
        });
    }

    fn on_debounce_elapsed(&mut self, replace: PendingReplace) {
        let entry_id = replace.entry_id;
        if self.transcript.apply_replace(replace) {
            self.dirty = true;
        } else {
            tracing::debug!("Skipping superseded transcription for entry {}", entry_id);
        }
    }

    fn on_action(&mut self, action: HardwareAction) {
        match self.dispatcher.dispatch(&action) {
            Some(command) => self.emit(SessionEvent::ActionDispatched { command }),
            None => self.emit(SessionEvent::ActionIgnored {
                action: action.action,
            }),
        }
    }

    fn fail(&mut self, error: SessionError) {
        self.teardown();
        self.emit(SessionEvent::Failed {
            message: error.to_string(),
            hint: error.hint().map(String::from),
        });
        self.state.last_error = Some(Arc::new(error));
        self.set_phase(SessionPhase::Error);
    }

    /// Cancel pending work, close the transport and forget the session
    fn teardown(&mut self) {
        if let Some(cancel) = self.fetch_cancel.take() {
            cancel.cancel();
        }
        self.debouncer.cancel();
        if let Some(mut connection) = self.connection.take() {
            tracing::info!("Closing connection {}", self.connection_seq);
            connection.close();
        }
        self.state.credentials = None;
        self.state.link_up = false;
        self.transcript.reset();
        self.dirty = true;
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        if self.state.phase != phase {
            tracing::info!("Session {:?} -> {:?}", self.state.phase, phase);
            self.state.phase = phase;
            self.emit(SessionEvent::PhaseChanged { phase });
        }
        self.dirty = true;
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session: self.state.clone(),
            transcript: self.transcript.state().clone(),
        }
    }

    fn publish(&mut self) {
        if self.dirty {
            self.snapshot_tx.send_replace(self.snapshot());
            self.dirty = false;
        }
    }
}

impl Drop for SessionEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, TransportError};
    use crate::transcript::Role;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    const AGENT_STARTED: &str = r#"{"label":"conversation-label","type":"bot-llm-started"}"#;
    const USER_STARTED: &str = r#"{"label":"conversation-label","type":"user-started-speaking"}"#;

    fn transcription(text: &str) -> String {
        serde_json::json!({
            "label": "conversation-label",
            "type": "user-transcription",
            "data": { "text": text, "final": false }
        })
        .to_string()
    }

    fn tts(text: &str) -> String {
        serde_json::json!({
            "label": "conversation-label",
            "type": "bot-tts-text",
            "data": { "text": text }
        })
        .to_string()
    }

    fn test_credentials() -> Credentials {
        Credentials {
            url: "wss://rtc.example.com".into(),
            room: "room-1".into(),
            token: "tok".into(),
        }
    }

    #[derive(Default)]
    struct MockSource {
        calls: AtomicU32,
        /// Number of upcoming fetches that fail
        failures: AtomicU32,
        /// When set, each fetch waits for a permit
        gate: Option<Notify>,
    }

    impl MockSource {
        fn gated() -> Self {
            Self {
                gate: Some(Notify::new()),
                ..Default::default()
            }
        }

        fn failing(times: u32) -> Self {
            Self {
                failures: AtomicU32::new(times),
                ..Default::default()
            }
        }

        fn release(&self) {
            if let Some(gate) = &self.gate {
                gate.notify_one();
            }
        }
    }

    #[async_trait]
    impl CredentialSource for MockSource {
        async fn fetch(&self) -> Result<Credentials, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let failing = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(FetchError::Status {
                    status: reqwest::StatusCode::SERVICE_UNAVAILABLE,
                    body: "warming up".into(),
                });
            }
            Ok(test_credentials())
        }
    }

    #[derive(Default)]
    struct RecordingTransport {
        opened: Mutex<Vec<TransportEvents>>,
        closes: Arc<AtomicU32>,
        fail_open: bool,
    }

    impl RecordingTransport {
        fn opened(&self) -> usize {
            self.opened.lock().len()
        }

        fn events(&self, index: usize) -> TransportEvents {
            self.opened.lock()[index].clone()
        }

        fn closes(&self) -> u32 {
            self.closes.load(Ordering::SeqCst)
        }
    }

    struct RecordingConnection {
        closes: Arc<AtomicU32>,
    }

    impl TransportConnection for RecordingConnection {
        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl RealtimeTransport for RecordingTransport {
        fn open(
            &self,
            _credentials: &Credentials,
            events: TransportEvents,
        ) -> Result<Box<dyn TransportConnection>, TransportError> {
            if self.fail_open {
                return Err(TransportError::Connect("room unavailable".into()));
            }
            self.opened.lock().push(events);
            Ok(Box::new(RecordingConnection {
                closes: self.closes.clone(),
            }))
        }
    }

    #[derive(Default)]
    struct CountingRobot {
        follows: AtomicU32,
        stops: AtomicU32,
    }

    impl RobotControl for CountingRobot {
        fn follow_operator(&self) {
            self.follows.fetch_add(1, Ordering::SeqCst);
        }
        fn stop_movement(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        source: Arc<MockSource>,
        transport: Arc<RecordingTransport>,
        robot: Arc<CountingRobot>,
        handle: SessionHandle,
        task: tokio::task::JoinHandle<()>,
    }

    fn start(source: MockSource, transport: RecordingTransport) -> Harness {
        let source = Arc::new(source);
        let transport = Arc::new(transport);
        let robot = Arc::new(CountingRobot::default());
        let (engine, handle) = SessionEngine::new(
            EngineConfig::default(),
            source.clone(),
            transport.clone(),
            robot.clone(),
        );
        Harness {
            source,
            transport,
            robot,
            handle,
            task: engine.spawn(),
        }
    }

    async fn wait_until<F>(handle: &SessionHandle, predicate: F) -> SessionSnapshot
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), handle.wait_for(predicate))
            .await
            .expect("timed out waiting for snapshot")
            .expect("engine stopped")
    }

    async fn wait_phase(handle: &SessionHandle, phase: SessionPhase) -> SessionSnapshot {
        wait_until(handle, |s| s.session.phase == phase).await
    }

    async fn connected(source: MockSource, transport: RecordingTransport) -> Harness {
        let h = start(source, transport);
        h.handle.unmute().unwrap();
        wait_phase(&h.handle, SessionPhase::Connected).await;
        h
    }

    #[tokio::test]
    async fn test_starts_muted() {
        let h = start(MockSource::default(), RecordingTransport::default());

        let snapshot = h.handle.snapshot();
        assert_eq!(snapshot.session.phase, SessionPhase::Muted);
        assert!(snapshot.session.is_muted());
        assert!(snapshot.session.credentials.is_none());
        assert_eq!(snapshot.transcript, TranscriptState::default());
        assert_eq!(h.source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unmute_fetches_and_connects() {
        let h = start(MockSource::default(), RecordingTransport::default());
        let mut events = h.handle.subscribe();

        h.handle.unmute().unwrap();
        let snapshot = wait_phase(&h.handle, SessionPhase::Connected).await;

        assert_eq!(snapshot.session.credentials, Some(test_credentials()));
        assert!(!snapshot.session.link_up);
        assert!(!snapshot.session.is_muted());
        assert_eq!(h.transport.opened(), 1);

        let mut phases = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let SessionEvent::PhaseChanged { phase } = event {
                phases.push(phase);
            }
        }
        assert_eq!(
            phases,
            vec![SessionPhase::Connecting, SessionPhase::Connected]
        );

        h.transport.events(0).connected();
        wait_until(&h.handle, |s| s.session.link_up).await;
    }

    #[tokio::test]
    async fn test_mute_while_muted_is_noop() {
        let h = start(MockSource::default(), RecordingTransport::default());
        let mut events = h.handle.subscribe();

        h.handle.mute().unwrap();
        h.handle.unmute().unwrap();
        wait_phase(&h.handle, SessionPhase::Connected).await;

        match events.recv().await.unwrap() {
            SessionEvent::PhaseChanged { phase } => assert_eq!(phase, SessionPhase::Connecting),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(h.source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.transport.opened(), 1);
        assert_eq!(h.transport.closes(), 0);
    }

    #[tokio::test]
    async fn test_second_mute_does_not_touch_transport() {
        let h = connected(MockSource::default(), RecordingTransport::default()).await;

        h.handle.mute().unwrap();
        wait_phase(&h.handle, SessionPhase::Muted).await;
        assert_eq!(h.transport.closes(), 1);

        let mut events = h.handle.subscribe();
        h.handle.mute().unwrap();
        h.handle.unmute().unwrap();
        wait_phase(&h.handle, SessionPhase::Connected).await;

        match events.recv().await.unwrap() {
            SessionEvent::PhaseChanged { phase } => assert_eq!(phase, SessionPhase::Connecting),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(h.transport.closes(), 1);
        assert_eq!(h.transport.opened(), 2);
    }

    #[tokio::test]
    async fn test_second_unmute_does_not_reconnect() {
        let h = start(MockSource::gated(), RecordingTransport::default());

        h.handle.unmute().unwrap();
        wait_phase(&h.handle, SessionPhase::Connecting).await;
        h.handle.unmute().unwrap();

        h.source.release();
        wait_phase(&h.handle, SessionPhase::Connected).await;
        h.handle.unmute().unwrap();
        h.handle.mute().unwrap();
        wait_phase(&h.handle, SessionPhase::Muted).await;

        assert_eq!(h.source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.transport.opened(), 1);
        assert_eq!(h.transport.closes(), 1);
    }

    #[tokio::test]
    async fn test_fetch_completing_after_mute_is_discarded() {
        let h = start(MockSource::gated(), RecordingTransport::default());

        h.handle.unmute().unwrap();
        wait_phase(&h.handle, SessionPhase::Connecting).await;
        h.handle.mute().unwrap();
        wait_phase(&h.handle, SessionPhase::Muted).await;

        // The first fetch was cancelled; this permit goes to the second one.
        h.source.release();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.transport.opened(), 0);
        assert_eq!(h.handle.snapshot().session.phase, SessionPhase::Muted);

        h.handle.unmute().unwrap();
        wait_phase(&h.handle, SessionPhase::Connected).await;
        assert_eq!(h.transport.opened(), 1);
        assert_eq!(h.source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_outdated_fetch_result_is_ignored() {
        let source = Arc::new(MockSource::gated());
        let transport = Arc::new(RecordingTransport::default());
        let (mut engine, _handle) = SessionEngine::new(
            EngineConfig::default(),
            source,
            transport.clone(),
            Arc::new(CountingRobot::default()),
        );

        engine.handle_command(Command::Unmute);
        assert_eq!(engine.state.phase, SessionPhase::Connecting);

        engine.handle_command(Command::FetchCompleted {
            attempt: engine.attempt + 1,
            result: Ok(test_credentials()),
        });
        assert_eq!(engine.state.phase, SessionPhase::Connecting);
        assert_eq!(transport.opened(), 0);

        engine.handle_command(Command::FetchCompleted {
            attempt: engine.attempt,
            result: Ok(test_credentials()),
        });
        assert_eq!(engine.state.phase, SessionPhase::Connected);
        assert_eq!(transport.opened(), 1);

        // A duplicate completion for the same attempt arrives too late
        engine.handle_command(Command::FetchCompleted {
            attempt: engine.attempt,
            result: Ok(test_credentials()),
        });
        assert_eq!(transport.opened(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_transcription_is_debounced() {
        let h = connected(MockSource::default(), RecordingTransport::default()).await;
        let events = h.transport.events(0);

        let started = tokio::time::Instant::now();
        events.connected();
        events.data(USER_STARTED);
        events.data(transcription("hel"));
        events.data(transcription("hello there"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let snapshot = h.handle.snapshot();
        assert_eq!(snapshot.transcript.current.role, Role::User);
        assert_eq!(snapshot.transcript.current.text, "");

        let snapshot = wait_until(&h.handle, |s| !s.transcript.current.text.is_empty()).await;
        assert!(started.elapsed() >= DEFAULT_DEBOUNCE);
        assert_eq!(snapshot.transcript.current.text, "hello there");
        assert!(snapshot.transcript.history.is_empty());

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.handle.snapshot().transcript.current.text, "hello there");
    }

    #[tokio::test(start_paused = true)]
    async fn test_final_transcription_is_debounced_and_replaces() {
        let h = connected(MockSource::default(), RecordingTransport::default()).await;
        let events = h.transport.events(0);

        let started = tokio::time::Instant::now();
        events.data(USER_STARTED);
        let frame = serde_json::json!({
            "label": "conversation-label",
            "type": "user-transcription",
            "data": { "text": "hello", "final": true }
        });
        events.data(frame.to_string());

        tokio::time::sleep(DEFAULT_DEBOUNCE - Duration::from_millis(10)).await;
        let snapshot = h.handle.snapshot();
        assert_eq!(snapshot.transcript.current.role, Role::User);
        assert_eq!(snapshot.transcript.current.text, "");

        let snapshot = wait_until(&h.handle, |s| !s.transcript.current.text.is_empty()).await;
        assert!(started.elapsed() >= DEFAULT_DEBOUNCE);
        assert_eq!(snapshot.transcript.current.role, Role::User);
        assert_eq!(snapshot.transcript.current.text, "hello");
        assert!(snapshot.transcript.history.is_empty());
    }

    #[tokio::test]
    async fn test_agent_speech_and_turn_archive() {
        let h = connected(MockSource::default(), RecordingTransport::default()).await;
        let mut session_events = h.handle.subscribe();
        let events = h.transport.events(0);

        events.data(AGENT_STARTED);
        events.data(tts("Hello"));
        events.data(tts("world"));
        let snapshot = wait_until(&h.handle, |s| s.transcript.current.text == "Hello world").await;
        let agent_id = snapshot.transcript.current.id;
        assert!(agent_id > 0);

        events.data(USER_STARTED);
        let snapshot = wait_until(&h.handle, |s| s.transcript.current.role == Role::User).await;
        assert_eq!(snapshot.transcript.history.len(), 1);
        assert_eq!(snapshot.transcript.history[0].id, agent_id);
        assert_eq!(snapshot.transcript.history[0].text, "Hello world");
        assert!(snapshot.transcript.current.id > agent_id);

        loop {
            if let SessionEvent::EntryArchived { entry } = session_events.recv().await.unwrap() {
                assert_eq!(entry.text, "Hello world");
                break;
            }
        }
    }

    #[tokio::test]
    async fn test_follow_me_moves_robot() {
        let h = connected(MockSource::default(), RecordingTransport::default()).await;
        let mut session_events = h.handle.subscribe();

        h.transport
            .events(0)
            .data(r#"{"label":"action-label","action":"follow_me"}"#);

        match session_events.recv().await.unwrap() {
            SessionEvent::ActionDispatched { command } => {
                assert_eq!(command, crate::RobotCommand::FollowMe)
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(h.robot.follows.load(Ordering::SeqCst), 1);
        assert_eq!(h.robot.stops.load(Ordering::SeqCst), 0);
        assert_eq!(h.handle.snapshot().transcript, TranscriptState::default());
    }

    #[tokio::test]
    async fn test_unknown_action_is_reported_not_performed() {
        let h = connected(MockSource::default(), RecordingTransport::default()).await;
        let mut session_events = h.handle.subscribe();

        h.transport
            .events(0)
            .data(r#"{"label":"action-label","action":"dance"}"#);

        match session_events.recv().await.unwrap() {
            SessionEvent::ActionIgnored { action } => assert_eq!(action, "dance"),
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(h.robot.follows.load(Ordering::SeqCst), 0);
        assert_eq!(h.robot.stops.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transport_error_tears_down() {
        let h = connected(MockSource::default(), RecordingTransport::default()).await;
        let mut session_events = h.handle.subscribe();
        let events = h.transport.events(0);
        events.connected();
        events.data(AGENT_STARTED);
        events.data(tts("partial"));
        wait_until(&h.handle, |s| s.transcript.current.text == "partial").await;

        events.error(TransportError::Failed("ice failed".into()));
        let snapshot = wait_phase(&h.handle, SessionPhase::Error).await;

        assert!(snapshot.session.is_muted());
        assert!(snapshot.session.credentials.is_none());
        assert!(!snapshot.session.link_up);
        assert!(snapshot.session.last_error.as_ref().unwrap().is_transport());
        assert_eq!(snapshot.transcript, TranscriptState::default());
        assert_eq!(h.transport.closes(), 1);

        let failure = loop {
            let event = session_events.recv().await.unwrap();
            if event.is_failure() {
                break event;
            }
        };
        match failure {
            SessionEvent::Failed { message, hint } => {
                assert!(message.contains("ice failed"));
                assert_eq!(hint, None);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_failure_then_retry() {
        let h = start(MockSource::failing(1), RecordingTransport::default());

        h.handle.unmute().unwrap();
        let snapshot = wait_phase(&h.handle, SessionPhase::Error).await;
        let error = snapshot.session.last_error.unwrap();
        assert!(error.is_fetch());
        assert_eq!(h.transport.opened(), 0);

        h.handle.retry().unwrap();
        let snapshot = wait_phase(&h.handle, SessionPhase::Connected).await;
        assert!(snapshot.session.last_error.is_none());
        assert_eq!(h.source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.transport.opened(), 1);
    }

    #[tokio::test]
    async fn test_retry_ignored_unless_failed() {
        let h = start(MockSource::default(), RecordingTransport::default());

        h.handle.retry().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.handle.snapshot().session.phase, SessionPhase::Muted);
        assert_eq!(h.source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_mute_clears_error() {
        let h = start(MockSource::default(), RecordingTransport {
            fail_open: true,
            ..Default::default()
        });

        h.handle.unmute().unwrap();
        let snapshot = wait_phase(&h.handle, SessionPhase::Error).await;
        assert!(snapshot.session.last_error.unwrap().is_transport());

        h.handle.mute().unwrap();
        let snapshot = wait_phase(&h.handle, SessionPhase::Muted).await;
        assert!(snapshot.session.last_error.is_none());
    }

    #[tokio::test]
    async fn test_undecodable_frames_are_dropped() {
        let h = connected(MockSource::default(), RecordingTransport::default()).await;
        let mut session_events = h.handle.subscribe();
        let events = h.transport.events(0);

        events.data("not json");
        events.data(vec![0xff, 0xfe]);
        events.data(r#"{"label":"conversation-label","type":"bot-ready"}"#);
        events.data(AGENT_STARTED);

        let snapshot = wait_until(&h.handle, |s| s.transcript.current.id > 0).await;
        assert_eq!(snapshot.session.phase, SessionPhase::Connected);
        assert_eq!(snapshot.transcript.current.role, Role::Agent);

        for _ in 0..3 {
            match session_events.recv().await.unwrap() {
                SessionEvent::FrameRejected { .. } => {}
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_events_from_closed_connection_are_ignored() {
        let h = connected(MockSource::default(), RecordingTransport::default()).await;
        let stale = h.transport.events(0);

        h.handle.mute().unwrap();
        wait_phase(&h.handle, SessionPhase::Muted).await;
        h.handle.unmute().unwrap();
        wait_phase(&h.handle, SessionPhase::Connected).await;
        assert_eq!(h.transport.opened(), 2);
        let current = h.transport.events(1);
        assert_ne!(stale.connection(), current.connection());

        stale.data(AGENT_STARTED);
        stale.error(TransportError::Failed("old socket".into()));
        stale.disconnected();
        current.data(USER_STARTED);

        let snapshot = wait_until(&h.handle, |s| s.transcript.current.id > 0).await;
        assert_eq!(snapshot.session.phase, SessionPhase::Connected);
        assert_eq!(snapshot.transcript.current.role, Role::User);
        assert_eq!(h.transport.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mute_cancels_pending_transcription() {
        let h = connected(MockSource::default(), RecordingTransport::default()).await;
        let events = h.transport.events(0);

        events.data(USER_STARTED);
        events.data(transcription("turn the lights"));
        wait_until(&h.handle, |s| s.transcript.current.role == Role::User).await;

        h.handle.mute().unwrap();
        wait_phase(&h.handle, SessionPhase::Muted).await;

        tokio::time::sleep(Duration::from_secs(1)).await;
        let snapshot = h.handle.snapshot();
        assert_eq!(snapshot.transcript, TranscriptState::default());
    }

    #[tokio::test]
    async fn test_remote_disconnect_mutes() {
        let h = connected(MockSource::default(), RecordingTransport::default()).await;
        let events = h.transport.events(0);
        events.connected();
        wait_until(&h.handle, |s| s.session.link_up).await;

        events.disconnected();
        let snapshot = wait_phase(&h.handle, SessionPhase::Muted).await;

        assert!(snapshot.session.last_error.is_none());
        assert!(snapshot.session.credentials.is_none());
        assert_eq!(h.transport.closes(), 1);
    }

    #[tokio::test]
    async fn test_toggle_mute() {
        let h = start(MockSource::default(), RecordingTransport::default());

        h.handle.toggle_mute().unwrap();
        wait_phase(&h.handle, SessionPhase::Connected).await;

        h.handle.toggle_mute().unwrap();
        wait_phase(&h.handle, SessionPhase::Muted).await;
        assert_eq!(h.transport.closes(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_connection() {
        let h = connected(MockSource::default(), RecordingTransport::default()).await;

        h.handle.shutdown();
        h.task.await.unwrap();

        assert!(h.handle.is_shutdown());
        assert_eq!(h.transport.closes(), 1);
        assert_eq!(h.handle.snapshot().session.phase, SessionPhase::Muted);
        assert!(matches!(h.handle.unmute(), Err(Error::EngineStopped)));
    }

    #[tokio::test]
    async fn test_engine_stops_when_handles_dropped() {
        let h = start(MockSource::default(), RecordingTransport::default());
        let Harness { handle, task, .. } = h;

        drop(handle);
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("engine did not stop")
            .unwrap();
    }
}
