//! Frame decoding
//!
//! Dispatch is two-level: `label` selects the message family, then `type`
//! selects the conversation event. Unknown tags are errors rather than a
//! default variant, so every consumer sees exactly the set of messages this
//! crate knows how to build.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{DecodeError, Result};
use crate::message::{
    ACTION_LABEL, CONVERSATION_LABEL, ConversationEvent, HardwareAction, ProtocolMessage,
};

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct TextData {
    text: String,
}

#[derive(Deserialize)]
struct OutputData {
    text: String,
    spoken: bool,
    aggregated_by: String,
}

#[derive(Deserialize)]
struct TranscriptionData {
    text: String,
    #[serde(rename = "final")]
    is_final: bool,
}

#[derive(Deserialize)]
struct ActionFrame {
    action: String,
}

/// Decode one raw text frame.
///
/// Unknown extra fields are ignored; a missing required field for the matched
/// variant is an [`DecodeError::InvalidPayload`].
pub fn decode(raw: &str) -> Result<ProtocolMessage> {
    let frame: Map<String, Value> = serde_json::from_str(raw)?;
    let label = tag(&frame, "label")?.to_owned();

    match label.as_str() {
        ACTION_LABEL => {
            let ActionFrame { action } = payload(frame, ACTION_LABEL)?;
            Ok(ProtocolMessage::Action(HardwareAction { action }))
        }
        CONVERSATION_LABEL => decode_conversation(frame).map(ProtocolMessage::Conversation),
        _ => Err(DecodeError::UnknownLabel(label)),
    }
}

fn decode_conversation(frame: Map<String, Value>) -> Result<ConversationEvent> {
    let kind = tag(&frame, "type")?.to_owned();

    let event = match kind.as_str() {
        "bot-llm-started" => ConversationEvent::AgentTurnStarted,
        "bot-llm-stopped" => ConversationEvent::AgentTurnStopped,
        "bot-llm-text" => {
            let Envelope {
                data: TextData { text },
            } = payload(frame, "bot-llm-text")?;
            ConversationEvent::AgentTextDelta { text }
        }
        "bot-tts-text" => {
            let Envelope {
                data: TextData { text },
            } = payload(frame, "bot-tts-text")?;
            ConversationEvent::AgentSpeechDelta { text }
        }
        "bot-output" => {
            let Envelope {
                data:
                    OutputData {
                        text,
                        spoken,
                        aggregated_by,
                    },
            } = payload(frame, "bot-output")?;
            ConversationEvent::AgentOutput {
                text,
                spoken,
                aggregated_by,
            }
        }
        "user-started-speaking" => ConversationEvent::UserTurnStarted,
        "user-stopped-speaking" => ConversationEvent::UserTurnStopped,
        "user-transcription" => {
            let Envelope {
                data: TranscriptionData { text, is_final },
            } = payload(frame, "user-transcription")?;
            ConversationEvent::UserTranscriptionDelta { text, is_final }
        }
        _ => return Err(DecodeError::UnknownType(kind)),
    };

    Ok(event)
}

fn tag<'a>(frame: &'a Map<String, Value>, field: &'static str) -> Result<&'a str> {
    frame
        .get(field)
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingField(field))
}

fn payload<T: DeserializeOwned>(frame: Map<String, Value>, kind: &'static str) -> Result<T> {
    serde_json::from_value(Value::Object(frame))
        .map_err(|source| DecodeError::InvalidPayload { kind, source })
}
