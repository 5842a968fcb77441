//! Protocol message types

/// Label of frames carrying a [`ConversationEvent`]
pub const CONVERSATION_LABEL: &str = "conversation-label";

/// Label of frames carrying a [`HardwareAction`]
pub const ACTION_LABEL: &str = "action-label";

/// A decoded data-channel frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolMessage {
    /// What the agent or the user is saying
    Conversation(ConversationEvent),
    /// A motion request for the host device
    Action(HardwareAction),
}

impl ProtocolMessage {
    /// The wire tag this message was decoded from
    pub fn wire_kind(&self) -> &'static str {
        match self {
            ProtocolMessage::Conversation(event) => event.wire_type(),
            ProtocolMessage::Action(_) => ACTION_LABEL,
        }
    }
}

/// Events describing the flow of a conversation turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversationEvent {
    /// The agent began producing a response
    AgentTurnStarted,
    /// The agent finished producing a response
    AgentTurnStopped,
    /// Raw language-model text
    AgentTextDelta { text: String },
    /// Text as it is being spoken by the agent
    AgentSpeechDelta { text: String },
    /// Aggregated agent output
    AgentOutput {
        text: String,
        spoken: bool,
        aggregated_by: String,
    },
    /// The user began speaking
    UserTurnStarted,
    /// The user stopped speaking
    UserTurnStopped,
    /// Transcription of the user's speech so far
    UserTranscriptionDelta { text: String, is_final: bool },
}

impl ConversationEvent {
    /// The `type` tag used on the wire for this event
    pub fn wire_type(&self) -> &'static str {
        match self {
            ConversationEvent::AgentTurnStarted => "bot-llm-started",
            ConversationEvent::AgentTurnStopped => "bot-llm-stopped",
            ConversationEvent::AgentTextDelta { .. } => "bot-llm-text",
            ConversationEvent::AgentSpeechDelta { .. } => "bot-tts-text",
            ConversationEvent::AgentOutput { .. } => "bot-output",
            ConversationEvent::UserTurnStarted => "user-started-speaking",
            ConversationEvent::UserTurnStopped => "user-stopped-speaking",
            ConversationEvent::UserTranscriptionDelta { .. } => "user-transcription",
        }
    }
}

/// A named motion request for the host device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareAction {
    pub action: String,
}

impl HardwareAction {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
        }
    }
}
