pub mod audio;
pub mod connection;
pub mod fallback;
pub mod manager;
pub mod playback;
pub mod route;
pub mod session;

// Re-export commonly used types for convenience
pub use audio::{AudioFormat, AudioOutput, AudioSink, NullOutput, OutputHandle, WavFileOutput};

#[cfg(feature = "device-output")]
pub use audio::DeviceOutput;

pub use connection::ConnectionState;
pub use fallback::{FallbackSynthesizer, HttpFallback};
pub use manager::{StreamingSpeaker, StreamingSpeakerBuilder};
pub use route::{AudioRouter, OutputRoute, RouteState, SystemRouter};
pub use session::{CompletionCallback, FinishReason, SessionId, SessionReport};
