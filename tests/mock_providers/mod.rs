//! In-process provider mocks for integration tests.
//!
//! - `websocket_mock`: streaming speak endpoint with scripted audio behaviour
//! - `RecordingOutput`: audio output that records what each session wrote
//!
//! The fallback HTTP endpoint is mocked with `wiremock` directly in the tests.

// Each test binary uses a different subset of these helpers
#![allow(dead_code)]

pub mod websocket_mock;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use speakstream::{
    AudioFormat, AudioOutput, AudioSink, OutputHandle, PlaybackTimings, SessionId, SessionReport,
    SpeechConfig, SpeechError, SpeechResult,
};
use tokio::sync::mpsc;

/// Timings scaled down so sessions resolve in well under a second.
pub fn fast_timings() -> PlaybackTimings {
    PlaybackTimings {
        tick_interval: Duration::from_millis(10),
        quiet_period: Duration::from_millis(40),
        fallback_grace: Duration::from_millis(200),
        finished_idle_timeout: Duration::from_millis(250),
        streaming_idle_timeout: Duration::from_millis(2000),
        drain_delay: Duration::from_millis(50),
        write_chunk_bytes: 320,
    }
}

/// Config pointing at the given mock endpoints.
pub fn test_config(stream_url: &str, fallback_url: &str) -> SpeechConfig {
    let mut config = SpeechConfig::new("test-key");
    config.stream_url = stream_url.to_string();
    config.fallback_url = fallback_url.to_string();
    config.connect_timeout = Duration::from_secs(2);
    config.fallback_timeout = Duration::from_secs(2);
    config.preconnect = false;
    config.timings = fast_timings();
    config
}

/// Completion reports in arrival order.
pub struct Reports {
    rx: mpsc::UnboundedReceiver<SessionReport>,
}

impl Reports {
    pub fn channel() -> (mpsc::UnboundedSender<SessionReport>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self { rx })
    }

    /// Next report, failing the test after five seconds.
    pub async fn next(&mut self) -> SessionReport {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("timed out waiting for completion")
            .expect("report channel closed")
    }

    /// Assert nothing else arrives within `wait`.
    pub async fn assert_quiet(&mut self, wait: Duration) {
        if let Ok(Some(report)) = tokio::time::timeout(wait, self.rx.recv()).await {
            panic!("unexpected extra completion: {report:?}");
        }
    }
}

// =============================================================================
// RecordingOutput
// =============================================================================

#[derive(Debug, Default)]
pub struct Recorded {
    pub opened: Vec<SessionId>,
    pub written: HashMap<SessionId, Vec<u8>>,
    pub closed: Vec<SessionId>,
    pub aborted: Vec<SessionId>,
}

/// Output that keeps every byte it is given, keyed by session.
#[derive(Clone, Default)]
pub struct RecordingOutput {
    recorded: Arc<Mutex<Recorded>>,
    fail_writes: bool,
}

impl RecordingOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output whose sinks fail every write.
    pub fn failing() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    pub fn written(&self, session: SessionId) -> Vec<u8> {
        self.recorded
            .lock()
            .written
            .get(&session)
            .cloned()
            .unwrap_or_default()
    }

    pub fn opened(&self) -> Vec<SessionId> {
        self.recorded.lock().opened.clone()
    }

    pub fn closed(&self) -> Vec<SessionId> {
        self.recorded.lock().closed.clone()
    }

    pub fn aborted(&self) -> Vec<SessionId> {
        self.recorded.lock().aborted.clone()
    }
}

impl AudioOutput for RecordingOutput {
    fn open(&self, session: SessionId, format: AudioFormat) -> SpeechResult<Box<dyn AudioSink>> {
        self.recorded.lock().opened.push(session);
        Ok(Box::new(RecordingSink {
            handle: OutputHandle::new(session, format, "recording"),
            recorded: Arc::clone(&self.recorded),
            fail_writes: self.fail_writes,
        }))
    }
}

struct RecordingSink {
    handle: OutputHandle,
    recorded: Arc<Mutex<Recorded>>,
    fail_writes: bool,
}

impl AudioSink for RecordingSink {
    fn handle(&self) -> &OutputHandle {
        &self.handle
    }

    fn write(&mut self, pcm: &[u8]) -> SpeechResult<usize> {
        if self.fail_writes {
            return Err(SpeechError::AudioOutput("device unplugged".to_string()));
        }
        self.recorded
            .lock()
            .written
            .entry(self.handle.session)
            .or_default()
            .extend_from_slice(pcm);
        Ok(pcm.len())
    }

    fn close(&mut self) -> SpeechResult<()> {
        self.recorded.lock().closed.push(self.handle.session);
        Ok(())
    }

    fn abort(&mut self) {
        self.recorded.lock().aborted.push(self.handle.session);
    }
}
