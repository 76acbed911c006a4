//! Session sequencing and the one-shot completion latch.
//!
//! Every `start_stream` call opens a new session. The [`SessionSequencer`] hands
//! out monotonically increasing ids together with a cancellation token; advancing
//! or invalidating the sequencer cancels the previous token, so background work
//! holding an old [`SessionTicket`] observes the change both by polling
//! [`SessionTicket::is_current`] and by awaiting [`SessionTicket::cancelled`].
//!
//! The [`CompletionLatch`] guarantees that the caller's completion callback runs
//! exactly once per session, regardless of which path (natural completion,
//! stop, supersede, connection loss) gets there first.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

/// Session identifier. Zero means "no session has ever started".
pub type SessionId = u64;

/// Async completion callback, invoked once per session.
pub type CompletionCallback =
    Arc<dyn Fn(SessionReport) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

// =============================================================================
// Finish reporting
// =============================================================================

/// Why a session finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FinishReason {
    /// Audio played out and the provider went quiet
    Completed,
    /// Text was sent but no audio ever arrived (streaming or fallback)
    NoAudio,
    /// `stop()` was called
    Stopped,
    /// A newer `start_stream()` preempted the session
    Superseded,
    /// The streaming connection failed or closed mid-session
    ConnectionLost,
    /// `disconnect()` was called during the session
    Disconnected,
    /// The output device failed mid-write
    OutputFailed,
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FinishReason::Completed => "completed",
            FinishReason::NoAudio => "no_audio",
            FinishReason::Stopped => "stopped",
            FinishReason::Superseded => "superseded",
            FinishReason::ConnectionLost => "connection_lost",
            FinishReason::Disconnected => "disconnected",
            FinishReason::OutputFailed => "output_failed",
        };
        f.write_str(label)
    }
}

/// Payload handed to the completion callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub session: SessionId,
    pub reason: FinishReason,
    /// Bytes actually written to the output device
    pub bytes_played: usize,
    /// Whether the played audio came from the fallback endpoint
    pub used_fallback: bool,
}

impl SessionReport {
    /// False is the only failure signal a caller gets.
    pub fn played_audio(&self) -> bool {
        self.bytes_played > 0
    }
}

// =============================================================================
// Sequencer
// =============================================================================

/// Monotonic session counter owned by the coordinator.
#[derive(Debug)]
pub struct SessionSequencer {
    live: Arc<AtomicU64>,
    token: CancellationToken,
}

impl Default for SessionSequencer {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionSequencer {
    pub fn new() -> Self {
        Self {
            live: Arc::new(AtomicU64::new(0)),
            token: CancellationToken::new(),
        }
    }

    /// Start a new session, cancelling whatever held the previous ticket.
    pub fn advance(&mut self) -> SessionTicket {
        let id = self.bump();
        SessionTicket {
            id,
            token: self.token.clone(),
            live: Arc::clone(&self.live),
        }
    }

    /// Invalidate outstanding work without starting a session (stop, disconnect).
    pub fn invalidate(&mut self) -> SessionId {
        self.bump()
    }

    /// Live counter value.
    pub fn current(&self) -> SessionId {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_current(&self, id: SessionId) -> bool {
        self.current() == id
    }

    fn bump(&mut self) -> SessionId {
        self.token.cancel();
        self.token = CancellationToken::new();
        let id = self.live.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(session = id, "Session counter advanced");
        id
    }
}

/// Captured session id plus its cancellation token.
#[derive(Debug, Clone)]
pub struct SessionTicket {
    id: SessionId,
    token: CancellationToken,
    live: Arc<AtomicU64>,
}

impl SessionTicket {
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Checked before every side effect.
    pub fn is_current(&self) -> bool {
        !self.token.is_cancelled() && self.live.load(Ordering::Acquire) == self.id
    }

    /// Resolves once the session is superseded, stopped or invalidated.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.token.cancelled()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

// =============================================================================
// Completion latch
// =============================================================================

/// One-shot finished notification for a single session.
pub struct CompletionLatch {
    session: SessionId,
    fired: AtomicBool,
    bytes_played: AtomicUsize,
    used_fallback: AtomicBool,
    callback: Option<CompletionCallback>,
    tracker: TaskTracker,
}

impl fmt::Debug for CompletionLatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionLatch")
            .field("session", &self.session)
            .field("fired", &self.has_fired())
            .field("bytes_played", &self.bytes_played())
            .finish()
    }
}

impl CompletionLatch {
    pub fn new(
        session: SessionId,
        callback: Option<CompletionCallback>,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            session,
            fired: AtomicBool::new(false),
            bytes_played: AtomicUsize::new(0),
            used_fallback: AtomicBool::new(false),
            callback,
            tracker,
        }
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn record_played(&self, bytes: usize) {
        self.bytes_played.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn bytes_played(&self) -> usize {
        self.bytes_played.load(Ordering::Acquire)
    }

    pub fn mark_fallback(&self) {
        self.used_fallback.store(true, Ordering::Release);
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    /// Fire the notification. Returns `false` if it had already fired.
    ///
    /// The callback runs on its own task so the caller never executes user code.
    pub fn fire(&self, reason: FinishReason) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }

        let report = SessionReport {
            session: self.session,
            reason,
            bytes_played: self.bytes_played(),
            used_fallback: self.used_fallback.load(Ordering::Acquire),
        };

        info!(
            session = report.session,
            reason = %report.reason,
            bytes_played = report.bytes_played,
            used_fallback = report.used_fallback,
            "Speech session finished"
        );

        if let Some(callback) = &self.callback {
            self.tracker.spawn(callback(report));
        }
        true
    }
}
