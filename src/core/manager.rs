//! Caller-facing speech manager.
//!
//! [`StreamingSpeaker`] is a cheap handle over a single coordinator task. Every
//! public method posts a command and returns immediately; the coordinator owns
//! the session sequencer, the active session and the streaming connection, and
//! applies every state transition in one place.
//!
//! # Architecture
//!
//! ```text
//! StreamingSpeaker ──Command──────────▶ ┌─────────────┐ ──▶ StreamConnection ──▶ provider
//!                                       │ Coordinator │
//! connection I/O ──ConnectionEvent────▶ │  (one task) │ ──▶ AudioAccumulator
//!                                       │             │
//! playback loops ──PlaybackExit───────▶ └─────────────┘ ──spawns──▶ PlaybackLoop
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use speakstream::{NullOutput, SpeechConfig, StreamingSpeaker};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let speaker = StreamingSpeaker::builder(SpeechConfig::from_env()?)
//!     .output(Arc::new(NullOutput::new()))
//!     .on_finished(|report| async move {
//!         println!("session {} finished: {}", report.session, report.reason);
//!     })
//!     .build()?;
//!
//! speaker.start_stream()?;
//! speaker.enqueue("Hello there.")?;
//! speaker.end_stream()?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwapOption;
use tokio::sync::{mpsc, watch};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::SpeechConfig;
use crate::core::audio::{AudioAccumulator, AudioOutput, NullOutput, OutputHandle};
use crate::core::connection::{ConnectionEvent, ConnectionState, ServerEvent, StreamConnection};
use crate::core::fallback::{FallbackFetcher, FallbackSynthesizer, HttpFallback};
use crate::core::playback::{PlaybackContext, PlaybackExit, PlaybackLoop, SessionSignals};
use crate::core::route::{AudioRouteController, AudioRouter, SystemRouter};
use crate::core::session::{
    CompletionCallback, CompletionLatch, FinishReason, SessionId, SessionReport,
    SessionSequencer, SessionTicket,
};
use crate::errors::{SpeechError, SpeechResult};

#[derive(Debug)]
enum Command {
    StartStream,
    Enqueue(String),
    EndStream,
    Stop,
    Connect,
    Disconnect,
    Shutdown,
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`StreamingSpeaker`].
pub struct StreamingSpeakerBuilder {
    config: SpeechConfig,
    output: Option<Arc<dyn AudioOutput>>,
    router: Option<Arc<dyn AudioRouter>>,
    fallback: Option<Arc<dyn FallbackSynthesizer>>,
    fallback_enabled: bool,
    on_finished: Option<CompletionCallback>,
}

impl StreamingSpeakerBuilder {
    /// Output backend. Defaults to [`NullOutput`].
    pub fn output(mut self, output: Arc<dyn AudioOutput>) -> Self {
        self.output = Some(output);
        self
    }

    /// Route control. Defaults to [`SystemRouter`].
    pub fn router(mut self, router: Arc<dyn AudioRouter>) -> Self {
        self.router = Some(router);
        self
    }

    /// Fallback synthesizer. Defaults to [`HttpFallback`] on the configured endpoint.
    pub fn fallback(mut self, fallback: Arc<dyn FallbackSynthesizer>) -> Self {
        self.fallback = Some(fallback);
        self.fallback_enabled = true;
        self
    }

    pub fn without_fallback(mut self) -> Self {
        self.fallback = None;
        self.fallback_enabled = false;
        self
    }

    /// Completion callback, run once per session on its own task.
    pub fn on_finished<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn(SessionReport) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: CompletionCallback = Arc::new(move |report| {
            Box::pin(callback(report)) as Pin<Box<dyn Future<Output = ()> + Send>>
        });
        self.on_finished = Some(callback);
        self
    }

    /// Completion callback in its boxed form.
    pub fn on_finished_boxed(mut self, callback: CompletionCallback) -> Self {
        self.on_finished = Some(callback);
        self
    }

    /// Validate the configuration and start the coordinator.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> SpeechResult<StreamingSpeaker> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let fallback: Option<Arc<dyn FallbackSynthesizer>> = match self.fallback {
            Some(fallback) => Some(fallback),
            None if self.fallback_enabled => Some(Arc::new(HttpFallback::new(&config)?)
                as Arc<dyn FallbackSynthesizer>),
            None => None,
        };

        let tracker = TaskTracker::new();
        let accumulator = Arc::new(AudioAccumulator::new());
        let output_handle = Arc::new(ArcSwapOption::empty());
        let active_session = Arc::new(AtomicU64::new(0));

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();

        let connection = StreamConnection::new(Arc::clone(&config), event_tx, tracker.clone());
        let connection_state = connection.subscribe();

        let ctx = PlaybackContext {
            timings: config.timings,
            format: config.audio_format(),
            accumulator: Arc::clone(&accumulator),
            output: self
                .output
                .unwrap_or_else(|| Arc::new(NullOutput::new()) as Arc<dyn AudioOutput>),
            routes: Arc::new(AudioRouteController::new(self.router.unwrap_or_else(|| {
                Arc::new(SystemRouter::default()) as Arc<dyn AudioRouter>
            }))),
            output_handle: Arc::clone(&output_handle),
            fallback: fallback.map(|f| FallbackFetcher::new(f, accumulator)),
            exits: exit_tx,
            tracker: tracker.clone(),
        };

        let coordinator = Coordinator {
            config: Arc::clone(&config),
            connection,
            sequencer: SessionSequencer::new(),
            active: None,
            ctx,
            on_finished: self.on_finished,
            active_session: Arc::clone(&active_session),
            tracker: tracker.clone(),
        };
        tracker.spawn(coordinator.run(command_rx, event_rx, exit_rx));

        info!(
            model = %config.model,
            sample_rate = config.sample_rate,
            "Streaming speaker started"
        );

        Ok(StreamingSpeaker {
            commands: command_tx,
            output_handle,
            connection_state,
            active_session,
            tracker,
        })
    }
}

// =============================================================================
// StreamingSpeaker
// =============================================================================

/// Handle to the speech coordinator. Methods never block.
pub struct StreamingSpeaker {
    commands: mpsc::UnboundedSender<Command>,
    output_handle: Arc<ArcSwapOption<OutputHandle>>,
    connection_state: watch::Receiver<ConnectionState>,
    active_session: Arc<AtomicU64>,
    tracker: TaskTracker,
}

impl StreamingSpeaker {
    pub fn builder(config: SpeechConfig) -> StreamingSpeakerBuilder {
        StreamingSpeakerBuilder {
            config,
            output: None,
            router: None,
            fallback: None,
            fallback_enabled: true,
            on_finished: None,
        }
    }

    /// Start a new session, superseding any active one.
    pub fn start_stream(&self) -> SpeechResult<()> {
        self.send(Command::StartStream)
    }

    /// Send text for synthesis in the active session. Blank text is ignored.
    pub fn enqueue(&self, text: impl Into<String>) -> SpeechResult<()> {
        let text = text.into();
        if text.trim().is_empty() {
            debug!("Ignoring blank text");
            return Ok(());
        }
        self.send(Command::Enqueue(text))
    }

    /// No more text is coming for the active session.
    pub fn end_stream(&self) -> SpeechResult<()> {
        self.send(Command::EndStream)
    }

    /// Cancel the active session and clear provider-side buffers.
    pub fn stop(&self) -> SpeechResult<()> {
        self.send(Command::Stop)
    }

    /// Open the streaming connection. No-op while connected or connecting.
    pub fn connect(&self) -> SpeechResult<()> {
        self.send(Command::Connect)
    }

    /// Close the streaming connection, ending any active session.
    pub fn disconnect(&self) -> SpeechResult<()> {
        self.send(Command::Disconnect)
    }

    /// Output currently playing, for amplitude analysis.
    pub fn output_handle(&self) -> Option<Arc<OutputHandle>> {
        self.output_handle.load_full()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.connection_state.borrow()
    }

    /// Watch connection state changes.
    pub fn subscribe_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.connection_state.clone()
    }

    /// Active session id, if one is running.
    pub fn current_session(&self) -> Option<SessionId> {
        match self.active_session.load(Ordering::Acquire) {
            0 => None,
            id => Some(id),
        }
    }

    /// Stop, disconnect and wait for every background task, including pending
    /// completion callbacks.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown);
        self.tracker.close();
        self.tracker.wait().await;
    }

    fn send(&self, command: Command) -> SpeechResult<()> {
        self.commands
            .send(command)
            .map_err(|_| SpeechError::ManagerClosed)
    }
}

// =============================================================================
// Coordinator
// =============================================================================

struct ActiveSession {
    ticket: SessionTicket,
    latch: Arc<CompletionLatch>,
    signals: watch::Sender<SessionSignals>,
}

impl ActiveSession {
    fn id(&self) -> SessionId {
        self.ticket.id()
    }
}

struct Coordinator {
    config: Arc<SpeechConfig>,
    connection: StreamConnection,
    sequencer: SessionSequencer,
    active: Option<ActiveSession>,
    ctx: PlaybackContext,
    on_finished: Option<CompletionCallback>,
    active_session: Arc<AtomicU64>,
    tracker: TaskTracker,
}

impl Coordinator {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
        mut exits: mpsc::UnboundedReceiver<PlaybackExit>,
    ) {
        if self.config.preconnect {
            self.connection.connect();
        }

        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                Some(event) = events.recv() => self.handle_event(event),
                Some(exit) = exits.recv() => self.handle_exit(exit),
            }
        }

        if let Some(active) = self.active.take() {
            self.sequencer.invalidate();
            self.retire(active, FinishReason::Stopped);
        }
        self.connection.shutdown();
        info!("Streaming speaker shut down");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartStream => self.start_session(),
            Command::Enqueue(text) => self.enqueue(text),
            Command::EndStream => match &self.active {
                Some(active) => {
                    debug!(session = active.id(), "Text stream finished");
                    active.signals.send_modify(|s| s.text_finished = true);
                }
                None => debug!("end_stream without an active session"),
            },
            Command::Stop => {
                self.sequencer.invalidate();
                match self.active.take() {
                    Some(active) => self.retire(active, FinishReason::Stopped),
                    None => {
                        self.ctx.accumulator.set_accepting(false);
                        self.connection.clear();
                    }
                }
            }
            Command::Connect => self.connection.connect(),
            Command::Disconnect => {
                self.sequencer.invalidate();
                if let Some(active) = self.active.take() {
                    self.retire(active, FinishReason::Disconnected);
                }
                self.connection.disconnect();
            }
            Command::Shutdown => {}
        }
    }

    fn start_session(&mut self) {
        let previous = self.active.take();
        let ticket = self.sequencer.advance();
        let session = ticket.id();

        match previous {
            Some(previous) => self.retire(previous, FinishReason::Superseded),
            None => self.connection.clear_pending(),
        }

        self.ctx.accumulator.reset(session);
        let latch = Arc::new(CompletionLatch::new(
            session,
            self.on_finished.clone(),
            self.tracker.clone(),
        ));
        let (signals_tx, signals_rx) = watch::channel(SessionSignals::default());

        let playback = PlaybackLoop::new(
            self.ctx.clone(),
            ticket.clone(),
            signals_rx,
            Arc::clone(&latch),
        );
        self.tracker.spawn(playback.run());

        self.active_session.store(session, Ordering::Release);
        self.active = Some(ActiveSession {
            ticket,
            latch,
            signals: signals_tx,
        });
        info!(session, "Speech session started");

        if self.connection.state() == ConnectionState::Disconnected {
            self.connection.connect();
        }
    }

    fn enqueue(&mut self, text: String) {
        let Some(active) = &self.active else {
            debug!("Ignoring text without an active session");
            return;
        };
        if active.signals.borrow().text_finished {
            debug!(session = active.id(), "Ignoring text after end_stream");
            return;
        }

        debug!(session = active.id(), chars = text.len(), "Enqueue text");
        active.signals.send_modify(|s| s.record_text(&text));
        self.connection.speak(text);
    }

    /// Finish a session from outside its playback loop. The caller must already
    /// have advanced or invalidated the sequencer.
    fn retire(&mut self, active: ActiveSession, reason: FinishReason) {
        let session = active.id();
        active.latch.fire(reason);
        self.ctx.accumulator.set_accepting(false);
        self.connection.clear();
        let _ = self.active_session.compare_exchange(
            session,
            0,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        debug!(session, %reason, "Session retired");
    }

    fn handle_event(&mut self, event: ConnectionEvent) {
        if !self.connection.handle_event(&event) {
            return;
        }

        match event {
            ConnectionEvent::Audio { bytes, .. } => match &self.active {
                Some(active) => {
                    self.ctx.accumulator.append(active.id(), &bytes);
                }
                None => debug!(len = bytes.len(), "Dropping audio with no active session"),
            },
            ConnectionEvent::Control { event, .. } => log_server_event(&event),
            ConnectionEvent::Failed { .. } | ConnectionEvent::Closed { .. } => {
                if let Some(active) = &self.active {
                    info!(session = active.id(), "Connection lost during session");
                    active.signals.send_modify(|s| s.stream_lost = true);
                }
            }
            ConnectionEvent::Opened { .. } => {}
        }
    }

    fn handle_exit(&mut self, exit: PlaybackExit) {
        let finished = self
            .active
            .as_ref()
            .is_some_and(|active| active.id() == exit.session);
        if finished {
            self.active = None;
            self.ctx.accumulator.set_accepting(false);
            // Text the session never delivered must not replay on the next connect
            self.connection.clear_pending();
            let _ = self.active_session.compare_exchange(
                exit.session,
                0,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }
}

fn log_server_event(event: &ServerEvent) {
    match event {
        ServerEvent::Metadata {
            request_id,
            model_name,
        } => debug!(?request_id, ?model_name, "Provider metadata"),
        ServerEvent::Flushed { sequence_id } => debug!(?sequence_id, "Provider flushed"),
        ServerEvent::Cleared { sequence_id } => debug!(?sequence_id, "Provider cleared"),
        ServerEvent::Warning { description, code } => {
            warn!(?code, "Provider warning: {}", description.as_deref().unwrap_or(""))
        }
        ServerEvent::Error { description, code } => {
            warn!(?code, "Provider error: {}", description.as_deref().unwrap_or(""))
        }
        ServerEvent::Unknown => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn offline_config() -> SpeechConfig {
        let mut config = SpeechConfig::new("test-key");
        config.stream_url = "ws://127.0.0.1:9/speak".to_string();
        config.fallback_url = "http://127.0.0.1:9/speak".to_string();
        config.preconnect = false;
        config
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let mut config = offline_config();
        config.api_key = Default::default();
        let result = StreamingSpeaker::builder(config).build();
        assert!(matches!(result, Err(SpeechError::InvalidConfiguration(_))));
    }

    #[tokio::test]
    async fn test_blank_text_is_ignored() {
        let speaker = StreamingSpeaker::builder(offline_config())
            .without_fallback()
            .build()
            .unwrap();
        assert!(speaker.enqueue("   ").is_ok());
        assert_eq!(speaker.current_session(), None);
        speaker.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_fires_stopped_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let speaker = StreamingSpeaker::builder(offline_config())
            .without_fallback()
            .on_finished(move |report| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(report);
                }
            })
            .build()
            .unwrap();

        speaker.start_stream().unwrap();
        speaker.stop().unwrap();

        let report = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.session, 1);
        assert_eq!(report.reason, FinishReason::Stopped);

        speaker.shutdown().await;
        assert!(rx.try_recv().is_err());
    }
}
