pub mod config;
pub mod core;
pub mod errors;
pub mod text;

// Re-export commonly used items for convenience
pub use config::{PlaybackTimings, SpeechConfig};
pub use crate::core::*;
pub use errors::{SpeechError, SpeechResult};
pub use text::ClauseChunker;
