//! Output device seam.
//!
//! An [`AudioOutput`] opens one [`AudioSink`] per session. Sinks are written from
//! the blocking thread pool, so `write` may block for as long as the device needs
//! to accept the data. A write returning `Ok(0)` means the device stalled.

use std::fmt;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tracing::{debug, info};

use crate::core::session::SessionId;
use crate::errors::{SpeechError, SpeechResult};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Linear PCM format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl AudioFormat {
    /// 16-bit little-endian signed PCM.
    pub fn linear16(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample: 16,
        }
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * (self.bits_per_sample as usize / 8)
    }

    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate as usize * self.bytes_per_frame()
    }

    /// Playback duration of `bytes` of audio in this format.
    pub fn duration_of(&self, bytes: usize) -> Duration {
        let per_second = self.bytes_per_second();
        if per_second == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(bytes as f64 / per_second as f64)
    }
}

/// Identity of an open output, shared with external consumers such as an
/// amplitude analyzer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputHandle {
    pub id: u64,
    pub session: SessionId,
    pub format: AudioFormat,
    pub label: String,
}

impl OutputHandle {
    pub fn new(session: SessionId, format: AudioFormat, label: impl Into<String>) -> Self {
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            session,
            format,
            label: label.into(),
        }
    }
}

impl fmt::Display for OutputHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.label, self.id)
    }
}

/// Factory for per-session sinks.
pub trait AudioOutput: Send + Sync {
    fn open(&self, session: SessionId, format: AudioFormat) -> SpeechResult<Box<dyn AudioSink>>;
}

/// An open output stream.
pub trait AudioSink: Send {
    fn handle(&self) -> &OutputHandle;

    /// Write PCM bytes, returning how many were accepted. `Ok(0)` is a stall.
    fn write(&mut self, pcm: &[u8]) -> SpeechResult<usize>;

    /// Release the device after letting queued audio play.
    fn close(&mut self) -> SpeechResult<()>;

    /// Release the device immediately, discarding queued audio.
    fn abort(&mut self) {
        let _ = self.close();
    }
}

/// Write `pcm` in chunks of at most `chunk` bytes until consumed or the sink
/// stalls. Returns the number of bytes written.
pub fn write_all(sink: &mut dyn AudioSink, pcm: &[u8], chunk: usize) -> SpeechResult<usize> {
    let chunk = chunk.max(1);
    let mut offset = 0;
    while offset < pcm.len() {
        let end = (offset + chunk).min(pcm.len());
        let written = sink.write(&pcm[offset..end])?;
        if written == 0 {
            debug!(output = %sink.handle(), offset, "Output stalled");
            break;
        }
        offset += written;
    }
    Ok(offset)
}

// =============================================================================
// NullOutput
// =============================================================================

/// Discards audio. Counts bytes for inspection.
#[derive(Debug, Default, Clone)]
pub struct NullOutput {
    written: Arc<AtomicUsize>,
}

impl NullOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes written through every sink this output opened.
    pub fn bytes_written(&self) -> usize {
        self.written.load(Ordering::Acquire)
    }
}

impl AudioOutput for NullOutput {
    fn open(&self, session: SessionId, format: AudioFormat) -> SpeechResult<Box<dyn AudioSink>> {
        Ok(Box::new(NullSink {
            handle: OutputHandle::new(session, format, "null"),
            written: Arc::clone(&self.written),
        }))
    }
}

struct NullSink {
    handle: OutputHandle,
    written: Arc<AtomicUsize>,
}

impl AudioSink for NullSink {
    fn handle(&self) -> &OutputHandle {
        &self.handle
    }

    fn write(&mut self, pcm: &[u8]) -> SpeechResult<usize> {
        self.written.fetch_add(pcm.len(), Ordering::AcqRel);
        Ok(pcm.len())
    }

    fn close(&mut self) -> SpeechResult<()> {
        Ok(())
    }
}

// =============================================================================
// WavFileOutput
// =============================================================================

/// Writes each session to its own WAV file in a directory.
#[derive(Debug, Clone)]
pub struct WavFileOutput {
    dir: PathBuf,
}

impl WavFileOutput {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path the given session is written to.
    pub fn path_for(&self, session: SessionId) -> PathBuf {
        session_path(&self.dir, session)
    }
}

fn session_path(dir: &Path, session: SessionId) -> PathBuf {
    dir.join(format!("session-{session:04}.wav"))
}

impl AudioOutput for WavFileOutput {
    fn open(&self, session: SessionId, format: AudioFormat) -> SpeechResult<Box<dyn AudioSink>> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| SpeechError::AudioOutput(format!("{}: {e}", self.dir.display())))?;

        let path = self.path_for(session);
        let spec = hound::WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample: format.bits_per_sample,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(&path, spec)
            .map_err(|e| SpeechError::AudioOutput(format!("{}: {e}", path.display())))?;

        debug!(session, path = %path.display(), "Opened WAV output");
        Ok(Box::new(WavFileSink {
            handle: OutputHandle::new(session, format, "wav"),
            path,
            writer: Some(writer),
            carry: None,
        }))
    }
}

struct WavFileSink {
    handle: OutputHandle,
    path: PathBuf,
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    /// Odd trailing byte from the previous write
    carry: Option<u8>,
}

impl AudioSink for WavFileSink {
    fn handle(&self) -> &OutputHandle {
        &self.handle
    }

    fn write(&mut self, pcm: &[u8]) -> SpeechResult<usize> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(SpeechError::AudioOutput("WAV output already closed".to_string()));
        };

        let mut data = pcm;
        if let Some(low) = self.carry.take() {
            match data.split_first() {
                Some((high, rest)) => {
                    writer
                        .write_sample(i16::from_le_bytes([low, *high]))
                        .map_err(|e| SpeechError::AudioOutput(e.to_string()))?;
                    data = rest;
                }
                None => {
                    self.carry = Some(low);
                    return Ok(0);
                }
            }
        }

        let mut samples = data.chunks_exact(2);
        for pair in &mut samples {
            writer
                .write_sample(i16::from_le_bytes([pair[0], pair[1]]))
                .map_err(|e| SpeechError::AudioOutput(e.to_string()))?;
        }
        self.carry = samples.remainder().first().copied();

        Ok(pcm.len())
    }

    fn close(&mut self) -> SpeechResult<()> {
        if let Some(writer) = self.writer.take() {
            writer
                .finalize()
                .map_err(|e| SpeechError::AudioOutput(e.to_string()))?;
            info!(path = %self.path.display(), "Wrote session audio");
        }
        Ok(())
    }
}

impl Drop for WavFileSink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
