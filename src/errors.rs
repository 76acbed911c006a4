//! Error types shared across the speech playback stack.
//!
//! Most of these never reach the caller: background tasks log and swallow their
//! own failures, and the only caller-visible signal is the completion callback.
//! They are still typed so that the seams (connection, fallback synthesis, output
//! devices, routing) can be tested and composed.

use thiserror::Error;

/// Errors that can occur while streaming, fetching or playing speech.
#[derive(Debug, Error)]
pub enum SpeechError {
    /// Connection to the streaming endpoint failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Outbound message could not be serialized
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Inbound payload could not be decoded
    #[error("Decode error: {0}")]
    DecodeError(String),

    /// Fallback synthesis request failed
    #[error("Fallback request failed: {0}")]
    FallbackFailed(String),

    /// Output device error
    #[error("Audio output error: {0}")]
    AudioOutput(String),

    /// Output routing error
    #[error("Audio route error: {0}")]
    Route(String),

    /// The coordinator task is gone
    #[error("Speech manager has shut down")]
    ManagerClosed,
}

/// Result type for speech operations.
pub type SpeechResult<T> = Result<T, SpeechError>;

impl From<reqwest::Error> for SpeechError {
    fn from(err: reqwest::Error) -> Self {
        SpeechError::FallbackFailed(err.to_string())
    }
}

impl From<serde_json::Error> for SpeechError {
    fn from(err: serde_json::Error) -> Self {
        SpeechError::SerializationError(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SpeechError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        SpeechError::WebSocketError(err.to_string())
    }
}
