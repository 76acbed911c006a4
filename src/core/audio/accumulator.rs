//! Audio accumulator.
//!
//! Byte buffer for the active session. The network path appends decoded frames,
//! the fallback path replaces the contents wholesale, and the playback loop takes
//! the unplayed tail. All three go through one short-held lock.

use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::core::session::SessionId;

/// Point-in-time view of the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferStatus {
    pub session: SessionId,
    /// Bytes buffered for the session
    pub len: usize,
    /// Played watermark
    pub played: usize,
    /// Whether any audio has arrived this session
    pub received: bool,
    /// When the most recent audio arrived
    pub last_audio_at: Option<Instant>,
    /// Set once fallback audio replaced the contents
    pub sealed: bool,
}

impl BufferStatus {
    pub fn unplayed(&self) -> usize {
        self.len.saturating_sub(self.played)
    }

    pub fn fully_played(&self) -> bool {
        self.played >= self.len
    }
}

#[derive(Debug, Default)]
struct Inner {
    session: SessionId,
    bytes: Vec<u8>,
    played: usize,
    accepting: bool,
    sealed: bool,
    received: bool,
    last_audio_at: Option<Instant>,
}

/// Thread-safe session audio buffer.
#[derive(Debug, Default)]
pub struct AudioAccumulator {
    inner: Mutex<Inner>,
}

impl AudioAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty the buffer for a new session and start accepting frames.
    pub fn reset(&self, session: SessionId) {
        let mut inner = self.inner.lock();
        *inner = Inner {
            session,
            accepting: true,
            ..Inner::default()
        };
        debug!(session, "Audio buffer reset");
    }

    /// Gate for streamed frames. Cleared at stop so late frames are dropped.
    pub fn set_accepting(&self, accepting: bool) {
        self.inner.lock().accepting = accepting;
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.lock().accepting
    }

    /// Append a streamed frame. Returns `false` if the frame was dropped.
    pub fn append(&self, session: SessionId, frame: &[u8]) -> bool {
        if frame.is_empty() {
            return false;
        }
        let mut inner = self.inner.lock();
        if !inner.accepting || inner.sealed || inner.session != session {
            trace!(
                session,
                len = frame.len(),
                "Dropping frame, buffer not accepting"
            );
            return false;
        }
        inner.bytes.extend_from_slice(frame);
        inner.received = true;
        inner.last_audio_at = Some(Instant::now());
        true
    }

    /// Refuse further streamed frames for a session that has produced no audio,
    /// so a fallback fetch owns the buffer. Returns `false` if audio already
    /// arrived or the session is stale.
    pub fn seal_for_fallback(&self, session: SessionId) -> bool {
        let mut inner = self.inner.lock();
        if inner.session != session || inner.received {
            return false;
        }
        inner.sealed = true;
        debug!(session, "Audio buffer sealed for fallback");
        true
    }

    /// Replace the contents with fallback audio. Later streamed frames for the
    /// session are refused.
    pub fn replace(&self, session: SessionId, audio: &[u8]) -> bool {
        let mut inner = self.inner.lock();
        if inner.session != session {
            return false;
        }
        inner.bytes.clear();
        inner.bytes.extend_from_slice(audio);
        inner.played = 0;
        inner.sealed = true;
        inner.received = !audio.is_empty();
        inner.last_audio_at = Some(Instant::now());
        debug!(session, len = audio.len(), "Audio buffer replaced");
        true
    }

    pub fn status(&self) -> BufferStatus {
        let inner = self.inner.lock();
        BufferStatus {
            session: inner.session,
            len: inner.bytes.len(),
            played: inner.played,
            received: inner.received,
            last_audio_at: inner.last_audio_at,
            sealed: inner.sealed,
        }
    }

    /// Copy out the unplayed tail and advance the watermark to the end.
    pub fn take_unplayed(&self, session: SessionId) -> Option<Bytes> {
        let mut inner = self.inner.lock();
        if inner.session != session || inner.played >= inner.bytes.len() {
            return None;
        }
        let tail = Bytes::copy_from_slice(&inner.bytes[inner.played..]);
        inner.played = inner.bytes.len();
        Some(tail)
    }
}
