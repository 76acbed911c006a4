//! Per-session playback loop.
//!
//! One [`PlaybackLoop`] runs for every session. It polls the shared session state
//! on a fixed cadence rather than reacting to each frame: the buffer is written to
//! the device in bulk once the provider goes quiet, so arrival timing does not
//! need to be tracked frame by frame.
//!
//! Each tick, in order:
//! 1. stale check against the session ticket
//! 2. completion flush of the unplayed tail after the quiet period
//! 3. fallback trigger when a finished session produced no audio
//! 4. exit heuristics
//!
//! On exit the loop waits out the drain delay, releases the device and the
//! forced route, and fires the completion latch if the session is still current.

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::PlaybackTimings;
use crate::core::audio::{
    AudioAccumulator, AudioFormat, AudioOutput, AudioSink, OutputHandle, write_all,
};
use crate::core::fallback::FallbackFetcher;
use crate::core::route::AudioRouteController;
use crate::core::session::{CompletionLatch, FinishReason, SessionId, SessionTicket};

/// Session state published by the coordinator and read by the playback loop.
#[derive(Debug, Clone, Default)]
pub struct SessionSignals {
    /// `end_stream()` was called
    pub text_finished: bool,
    /// When text was last sent to the provider
    pub last_speak_at: Option<Instant>,
    /// Everything sent this session, for the fallback request
    pub spoken: String,
    /// The streaming connection dropped during the session
    pub stream_lost: bool,
}

impl SessionSignals {
    pub fn has_text(&self) -> bool {
        !self.spoken.is_empty()
    }

    pub fn record_text(&mut self, text: &str) {
        if !self.spoken.is_empty() {
            self.spoken.push(' ');
        }
        self.spoken.push_str(text);
        self.last_speak_at = Some(Instant::now());
    }
}

/// Sent to the coordinator when a loop ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackExit {
    pub session: SessionId,
    /// `None` when the session was cancelled from outside
    pub reason: Option<FinishReason>,
}

/// Collaborators shared by every session's loop.
#[derive(Clone)]
pub struct PlaybackContext {
    pub timings: PlaybackTimings,
    pub format: AudioFormat,
    pub accumulator: Arc<AudioAccumulator>,
    pub output: Arc<dyn AudioOutput>,
    pub routes: Arc<AudioRouteController>,
    pub output_handle: Arc<ArcSwapOption<OutputHandle>>,
    pub fallback: Option<FallbackFetcher>,
    pub exits: mpsc::UnboundedSender<PlaybackExit>,
    pub tracker: TaskTracker,
}

enum Flush {
    Nothing,
    Written,
    Failed,
}

/// The loop for one session.
pub struct PlaybackLoop {
    ctx: PlaybackContext,
    ticket: SessionTicket,
    signals: watch::Receiver<SessionSignals>,
    latch: Arc<CompletionLatch>,
    sink: Option<Box<dyn AudioSink>>,
    started_at: Instant,
    fallback_task: Option<JoinHandle<bool>>,
    fallback_fired: bool,
    implicit_end: bool,
}

impl PlaybackLoop {
    pub fn new(
        ctx: PlaybackContext,
        ticket: SessionTicket,
        signals: watch::Receiver<SessionSignals>,
        latch: Arc<CompletionLatch>,
    ) -> Self {
        Self {
            ctx,
            ticket,
            signals,
            latch,
            sink: None,
            started_at: Instant::now(),
            fallback_task: None,
            fallback_fired: false,
            implicit_end: false,
        }
    }

    pub async fn run(mut self) {
        let session = self.ticket.id();

        if self.ticket.is_current() {
            self.ctx.routes.engage(session);
            self.open_output().await;
        }

        let mut ticker = tokio::time::interval(self.ctx.timings.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let reason = loop {
            tokio::select! {
                _ = self.ticket.cancelled() => break None,
                _ = ticker.tick() => {}
            }
            if !self.ticket.is_current() {
                break None;
            }
            if let Some(reason) = self.tick(session).await {
                break Some(reason);
            }
        };

        self.finish(session, reason).await;
    }

    async fn tick(&mut self, session: SessionId) -> Option<FinishReason> {
        let timings = self.ctx.timings;
        let now = Instant::now();
        let status = self.ctx.accumulator.status();
        if status.session != session {
            return None;
        }

        let (explicit_end, last_speak_at, has_text, stream_lost) = {
            let signals = self.signals.borrow();
            (
                signals.text_finished,
                signals.last_speak_at,
                signals.has_text(),
                signals.stream_lost,
            )
        };

        let last_activity = [Some(self.started_at), status.last_audio_at, last_speak_at]
            .into_iter()
            .flatten()
            .max()
            .unwrap_or(self.started_at);
        if !explicit_end
            && !self.implicit_end
            && now.duration_since(last_activity) >= timings.streaming_idle_timeout
        {
            info!(session, "No activity, treating text stream as finished");
            self.implicit_end = true;
        }
        let text_finished = explicit_end || self.implicit_end;

        // Completion flush
        let quiet = status
            .last_audio_at
            .is_some_and(|at| now.duration_since(at) >= timings.quiet_period);
        if status.unplayed() > 0 && (stream_lost || (text_finished && quiet)) {
            match self.flush(session).await {
                Flush::Failed => return Some(FinishReason::OutputFailed),
                Flush::Written | Flush::Nothing => {}
            }
            if !self.ticket.is_current() {
                return None;
            }
        }
        let status = self.ctx.accumulator.status();

        if stream_lost {
            return Some(FinishReason::ConnectionLost);
        }
        if text_finished && !has_text && !status.received {
            return Some(FinishReason::NoAudio);
        }

        let speak_idle = last_speak_at.map_or(now.duration_since(self.started_at), |at| {
            now.duration_since(at)
        });

        // Fallback trigger
        if text_finished
            && has_text
            && !status.received
            && !self.fallback_fired
            && speak_idle >= timings.fallback_grace
        {
            self.fallback_fired = true;
            self.start_fallback(session);
        }

        // Exit heuristics
        let timeout = timings.idle_timeout(text_finished);
        let fallback_in_flight = self
            .fallback_task
            .as_ref()
            .is_some_and(|task| !task.is_finished());

        if status.received {
            let audio_idle = status
                .last_audio_at
                .map_or(Duration::ZERO, |at| now.duration_since(at));
            if audio_idle >= timeout && speak_idle >= timeout && status.fully_played() {
                return Some(FinishReason::Completed);
            }
        } else if text_finished && speak_idle >= timeout && !fallback_in_flight {
            return Some(FinishReason::NoAudio);
        }

        None
    }

    async fn open_output(&mut self) {
        let session = self.ticket.id();
        let output = Arc::clone(&self.ctx.output);
        let format = self.ctx.format;

        match tokio::task::spawn_blocking(move || output.open(session, format)).await {
            Ok(Ok(mut sink)) => {
                if !self.ticket.is_current() {
                    sink.abort();
                    return;
                }
                debug!(session, output = %sink.handle(), "Output opened");
                self.ctx
                    .output_handle
                    .store(Some(Arc::new(sink.handle().clone())));
                self.sink = Some(sink);
            }
            Ok(Err(e)) => warn!(session, "Failed to open audio output: {}", e),
            Err(e) => warn!(session, "Audio output open task failed: {}", e),
        }
    }

    async fn flush(&mut self, session: SessionId) -> Flush {
        let Some(pcm) = self.ctx.accumulator.take_unplayed(session) else {
            return Flush::Nothing;
        };
        let Some(mut sink) = self.sink.take() else {
            warn!(session, bytes = pcm.len(), "No output open, discarding audio");
            return Flush::Failed;
        };

        let len = pcm.len();
        let chunk = self.ctx.timings.write_chunk_bytes;
        debug!(
            session,
            bytes = len,
            duration = ?self.ctx.format.duration_of(len),
            "Flushing audio to output"
        );

        let written = tokio::task::spawn_blocking(move || {
            let result = write_all(sink.as_mut(), &pcm, chunk);
            (sink, result)
        })
        .await;

        match written {
            Ok((sink, Ok(written))) => {
                self.latch.record_played(written);
                if written < len {
                    warn!(session, written, len, "Output stalled, abandoning write");
                }
                self.sink = Some(sink);
                Flush::Written
            }
            Ok((mut sink, Err(e))) => {
                warn!(session, "Audio output write failed: {}", e);
                sink.abort();
                self.clear_handle(session);
                Flush::Failed
            }
            Err(e) => {
                warn!(session, "Audio output write task failed: {}", e);
                self.clear_handle(session);
                Flush::Failed
            }
        }
    }

    fn start_fallback(&mut self, session: SessionId) {
        let Some(fetcher) = self.ctx.fallback.clone() else {
            debug!(session, "No fallback configured");
            return;
        };
        if !self.ctx.accumulator.seal_for_fallback(session) {
            debug!(session, "Streamed audio arrived, skipping fallback");
            return;
        }
        let text = self.signals.borrow().spoken.clone();
        let ticket = self.ticket.clone();
        let latch = Arc::clone(&self.latch);
        self.fallback_task = Some(
            self.ctx
                .tracker
                .spawn(async move { fetcher.run(ticket, text, latch).await }),
        );
    }

    async fn finish(mut self, session: SessionId, reason: Option<FinishReason>) {
        if reason.is_some() && !self.ctx.timings.drain_delay.is_zero() {
            tokio::select! {
                _ = self.ticket.cancelled() => {}
                _ = tokio::time::sleep(self.ctx.timings.drain_delay) => {}
            }
        }

        if let Some(mut sink) = self.sink.take() {
            let abort = !self.ticket.is_current();
            let closed = tokio::task::spawn_blocking(move || {
                if abort {
                    sink.abort();
                    Ok(())
                } else {
                    sink.close()
                }
            })
            .await;
            match closed {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(session, "Failed to close audio output: {}", e),
                Err(e) => warn!(session, "Audio output close task failed: {}", e),
            }
        }

        if let Some(task) = self.fallback_task.take()
            && !task.is_finished()
        {
            task.abort();
        }

        self.ctx.routes.release(session);
        self.clear_handle(session);

        if let Some(reason) = reason
            && self.ticket.is_current()
        {
            self.latch.fire(reason);
        }

        debug!(session, ?reason, "Playback loop finished");
        let _ = self.ctx.exits.send(PlaybackExit { session, reason });
    }

    fn clear_handle(&self, session: SessionId) {
        self.ctx.output_handle.rcu(|current| match current {
            Some(handle) if handle.session == session => None,
            other => other.clone(),
        });
    }
}
