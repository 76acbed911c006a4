//! Audio buffering and output.
//!
//! - `accumulator`: per-session byte buffer with the played watermark
//! - `sink`: output seam plus the null and WAV file backends
//! - `device`: system audio device backend (`device-output` feature)
//! - `wav`: RIFF payload extraction for fallback responses

pub mod accumulator;
#[cfg(feature = "device-output")]
pub mod device;
pub mod sink;
pub mod wav;

pub use accumulator::{AudioAccumulator, BufferStatus};
#[cfg(feature = "device-output")]
pub use device::DeviceOutput;
pub use sink::{
    AudioFormat, AudioOutput, AudioSink, NullOutput, OutputHandle, WavFileOutput, write_all,
};
