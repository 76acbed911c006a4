//! WebSocket message types for the streaming speech endpoint.
//!
//! - **Outgoing messages**: small JSON control objects discriminated by `type`
//!   - [`ClientMessage::Speak`]: text to synthesize
//!   - [`ClientMessage::Flush`]: synthesize everything buffered so far
//!   - [`ClientMessage::Clear`]: drop buffered text and pending audio
//!   - [`ClientMessage::Close`]: graceful end of the stream
//!
//! - **Incoming messages**: either raw binary audio frames or JSON text frames.
//!   JSON carrying an `audio` field is base64 audio; JSON with a known `type` is
//!   a [`ServerEvent`]; anything else is ignored.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::errors::{SpeechError, SpeechResult};

// =============================================================================
// Outgoing Messages (Client to Server)
// =============================================================================

/// Control message sent to the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    Speak { text: String },
    Flush,
    Clear,
    Close,
}

impl ClientMessage {
    pub fn speak(text: impl Into<String>) -> Self {
        ClientMessage::Speak { text: text.into() }
    }

    pub fn to_json(&self) -> SpeechResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// =============================================================================
// Incoming Messages (Server to Client)
// =============================================================================

/// Control events the provider may send alongside audio.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    Metadata {
        #[serde(default)]
        request_id: Option<String>,
        #[serde(default)]
        model_name: Option<String>,
    },
    Flushed {
        #[serde(default)]
        sequence_id: Option<u64>,
    },
    Cleared {
        #[serde(default)]
        sequence_id: Option<u64>,
    },
    Warning {
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        code: Option<String>,
    },
    Error {
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        code: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

/// Decoded inbound text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Audio bytes extracted from a JSON payload
    Audio(Bytes),
    /// Recognised control event
    Control(ServerEvent),
    /// Valid JSON that carries nothing we act on
    Ignored,
}

#[derive(Deserialize)]
struct AudioEnvelope {
    audio: String,
}

/// Decode a JSON text frame.
///
/// # Errors
/// Returns [`SpeechError::DecodeError`] for malformed JSON or undecodable base64;
/// callers drop such frames.
pub fn decode_text(text: &str) -> SpeechResult<Inbound> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| SpeechError::DecodeError(format!("invalid JSON frame: {e}")))?;

    if value.get("audio").is_some_and(serde_json::Value::is_string) {
        let envelope: AudioEnvelope = serde_json::from_value(value)
            .map_err(|e| SpeechError::DecodeError(e.to_string()))?;
        let audio = STANDARD
            .decode(envelope.audio.as_bytes())
            .map_err(|e| SpeechError::DecodeError(format!("invalid base64 audio: {e}")))?;
        return Ok(Inbound::Audio(Bytes::from(audio)));
    }

    match serde_json::from_value::<ServerEvent>(value) {
        Ok(ServerEvent::Unknown) | Err(_) => Ok(Inbound::Ignored),
        Ok(event) => Ok(Inbound::Control(event)),
    }
}
