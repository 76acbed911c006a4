//! Streaming connection manager.
//!
//! [`StreamConnection`] owns at most one duplex WebSocket to the synthesis
//! provider. It is driven entirely by the coordinator task: the caller-facing
//! methods here never block, and everything the socket reports comes back as a
//! [`ConnectionEvent`] on the coordinator's event channel.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  ClientMessage  ┌──────────────┐
//! │ Coordinator  │────────────────▶│   I/O task   │◀───▶ provider
//! │ (owns this)  │◀────────────────│ (generation) │
//! └──────────────┘ ConnectionEvent └──────────────┘
//! ```
//!
//! Each connect attempt gets a new generation number. Events carry the
//! generation that produced them, so events from a torn-down socket are ignored.

mod messages;
mod queue;

pub use messages::{ClientMessage, Inbound, ServerEvent, decode_text};
pub use queue::PendingText;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::config::SpeechConfig;
use crate::errors::{SpeechError, SpeechResult};

// =============================================================================
// Connection State
// =============================================================================

/// Connection state of the streaming socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// Something the I/O task observed.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// Handshake completed
    Opened { generation: u64 },
    /// Decoded audio frame
    Audio { generation: u64, bytes: Bytes },
    /// Provider control event
    Control { generation: u64, event: ServerEvent },
    /// Connect or transport failure; `unsent` holds messages never written
    Failed {
        generation: u64,
        error: String,
        unsent: Vec<ClientMessage>,
    },
    /// The socket closed
    Closed {
        generation: u64,
        unsent: Vec<ClientMessage>,
    },
}

impl ConnectionEvent {
    pub fn generation(&self) -> u64 {
        match self {
            ConnectionEvent::Opened { generation }
            | ConnectionEvent::Audio { generation, .. }
            | ConnectionEvent::Control { generation, .. }
            | ConnectionEvent::Failed { generation, .. }
            | ConnectionEvent::Closed { generation, .. } => *generation,
        }
    }

    /// Failed or Closed.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionEvent::Failed { .. } | ConnectionEvent::Closed { .. }
        )
    }
}

// =============================================================================
// StreamConnection
// =============================================================================

/// The single streaming connection, owned by the coordinator.
pub struct StreamConnection {
    config: Arc<SpeechConfig>,
    state: ConnectionState,
    generation: u64,
    attempts: u64,
    writer: Option<mpsc::UnboundedSender<ClientMessage>>,
    io_task: Option<JoinHandle<()>>,
    io_shutdown: Option<CancellationToken>,
    pending: PendingText,
    flush_pending: bool,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    state_tx: watch::Sender<ConnectionState>,
    tracker: TaskTracker,
}

impl StreamConnection {
    pub fn new(
        config: Arc<SpeechConfig>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
        tracker: TaskTracker,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let pending = PendingText::new(config.pending_queue_capacity);
        Self {
            config,
            state: ConnectionState::Disconnected,
            generation: 0,
            attempts: 0,
            writer: None,
            io_task: None,
            io_shutdown: None,
            pending,
            flush_pending: false,
            events,
            state_tx,
            tracker,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Watch channel mirroring [`Self::state`].
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Number of connection attempts started so far.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Open the socket. No-op while connected or connecting.
    pub fn connect(&mut self) {
        if self.state != ConnectionState::Disconnected {
            debug!(state = %self.state, "Connect ignored, connection already live");
            return;
        }

        self.teardown();
        self.generation += 1;
        self.attempts += 1;
        let generation = self.generation;

        let (writer, outbound) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let endpoint = match self.config.stream_endpoint() {
            Ok(url) => url,
            Err(e) => {
                warn!(generation, "Cannot connect: {}", e);
                let _ = self.events.send(ConnectionEvent::Failed {
                    generation,
                    error: e.to_string(),
                    unsent: Vec::new(),
                });
                self.set_state(ConnectionState::Connecting);
                return;
            }
        };

        let io = IoTask {
            endpoint,
            authorization: self.config.authorization(),
            connect_timeout: self.config.connect_timeout,
            generation,
            outbound,
            events: self.events.clone(),
            shutdown: shutdown.clone(),
        };

        debug!(generation, "Opening speech stream connection");
        self.writer = Some(writer);
        self.io_shutdown = Some(shutdown);
        self.io_task = Some(self.tracker.spawn(io.run()));
        self.set_state(ConnectionState::Connecting);
    }

    /// Send text for synthesis, followed by a flush. Queues and connects if the
    /// socket is not open yet.
    pub fn speak(&mut self, text: String) {
        if self.state == ConnectionState::Connected {
            match self.send(ClientMessage::speak(text)) {
                Ok(()) => {
                    let _ = self.send(ClientMessage::Flush);
                    return;
                }
                Err(unsent) => {
                    if let ClientMessage::Speak { text } = unsent {
                        self.queue(text);
                    }
                }
            }
        } else {
            self.queue(text);
        }
        self.connect();
    }

    /// Drop queued text and tell the provider to discard buffered audio.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.flush_pending = false;
        if self.state == ConnectionState::Connected {
            debug!(generation = self.generation, "Sending Clear");
            let _ = self.send(ClientMessage::Clear);
        }
    }

    /// Drop queued text without touching the socket.
    pub fn clear_pending(&mut self) {
        self.pending.clear();
        self.flush_pending = false;
    }

    /// Close the socket gracefully. Events from the closing socket are ignored.
    pub fn disconnect(&mut self) {
        self.clear_pending();
        if let Some(writer) = self.writer.take() {
            let _ = writer.send(ClientMessage::Close);
            info!(generation = self.generation, "Disconnecting speech stream");
        }
        // The I/O task finishes once it has written Close and seen the writer drop.
        self.io_task = None;
        self.io_shutdown = None;
        self.generation += 1;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Abort the socket immediately.
    pub fn shutdown(&mut self) {
        self.clear_pending();
        if let Some(writer) = self.writer.take() {
            let _ = writer.send(ClientMessage::Close);
        }
        if let Some(token) = self.io_shutdown.take() {
            token.cancel();
        }
        self.io_task = None;
        self.generation += 1;
        self.set_state(ConnectionState::Disconnected);
    }

    /// Apply a connection event. Returns `false` for events from a stale
    /// generation, which the caller must ignore.
    pub fn handle_event(&mut self, event: &ConnectionEvent) -> bool {
        if event.generation() != self.generation {
            trace!(
                generation = event.generation(),
                current = self.generation,
                "Ignoring event from stale connection"
            );
            return false;
        }

        match event {
            ConnectionEvent::Opened { generation } => {
                info!(generation, "Speech stream connected");
                self.set_state(ConnectionState::Connected);
                self.replay_pending();
            }
            ConnectionEvent::Failed {
                generation,
                error,
                unsent,
            } => {
                warn!(generation, "Speech stream failed: {}", error);
                self.requeue(unsent);
                self.drop_connection();
            }
            ConnectionEvent::Closed { generation, unsent } => {
                info!(generation, "Speech stream closed");
                self.requeue(unsent);
                self.drop_connection();
            }
            ConnectionEvent::Audio { .. } | ConnectionEvent::Control { .. } => {}
        }
        true
    }

    fn send(&self, message: ClientMessage) -> Result<(), ClientMessage> {
        match &self.writer {
            Some(writer) => writer.send(message).map_err(|e| e.0),
            None => Err(message),
        }
    }

    fn queue(&mut self, text: String) {
        debug!(
            queued = self.pending.len() + 1,
            "Connection not ready, queueing text"
        );
        self.pending.push(text);
        self.flush_pending = true;
    }

    fn replay_pending(&mut self) {
        let texts = self.pending.drain();
        if !texts.is_empty() {
            debug!(count = texts.len(), "Replaying queued text");
        }
        for (index, text) in texts.iter().enumerate() {
            if let Err(ClientMessage::Speak { .. }) = self.send(ClientMessage::speak(text.clone()))
            {
                self.pending
                    .requeue_front(texts.iter().skip(index).cloned().collect());
                return;
            }
        }
        if self.flush_pending && self.send(ClientMessage::Flush).is_ok() {
            self.flush_pending = false;
        }
    }

    fn requeue(&mut self, unsent: &[ClientMessage]) {
        let mut texts = Vec::new();
        for message in unsent {
            match message {
                ClientMessage::Speak { text } => texts.push(text.clone()),
                ClientMessage::Flush => self.flush_pending = true,
                ClientMessage::Clear | ClientMessage::Close => {}
            }
        }
        if !texts.is_empty() {
            debug!(count = texts.len(), "Re-queueing unsent text");
            self.pending.requeue_front(texts);
            self.flush_pending = true;
        }
    }

    fn drop_connection(&mut self) {
        self.writer = None;
        self.io_task = None;
        self.io_shutdown = None;
        self.set_state(ConnectionState::Disconnected);
    }

    fn teardown(&mut self) {
        self.writer = None;
        if let Some(token) = self.io_shutdown.take() {
            token.cancel();
        }
        if let Some(handle) = self.io_task.take() {
            handle.abort();
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        self.state_tx.send_replace(state);
    }
}

// =============================================================================
// I/O task
// =============================================================================

struct IoTask {
    endpoint: Url,
    authorization: String,
    connect_timeout: Duration,
    generation: u64,
    outbound: mpsc::UnboundedReceiver<ClientMessage>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    shutdown: CancellationToken,
}

impl IoTask {
    async fn run(mut self) {
        let generation = self.generation;

        let request = match build_request(&self.endpoint, &self.authorization) {
            Ok(request) => request,
            Err(e) => {
                self.fail(e.to_string());
                return;
            }
        };

        let connected = tokio::select! {
            _ = self.shutdown.cancelled() => return,
            result = timeout(self.connect_timeout, connect_async(request)) => result,
        };

        let ws_stream = match connected {
            Ok(Ok((ws_stream, _response))) => ws_stream,
            Ok(Err(e)) => {
                self.fail(SpeechError::ConnectionFailed(e.to_string()).to_string());
                return;
            }
            Err(_elapsed) => {
                self.fail(format!(
                    "Connection timed out after {:?}",
                    self.connect_timeout
                ));
                return;
            }
        };

        let _ = self.events.send(ConnectionEvent::Opened { generation });
        let (mut ws_sink, mut ws_stream) = ws_stream.split();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!(generation, "Connection task cancelled");
                    let _ = ws_sink.send(Message::Close(None)).await;
                    return;
                }

                outgoing = self.outbound.recv() => {
                    let Some(message) = outgoing else {
                        let _ = ws_sink.send(Message::Close(None)).await;
                        break;
                    };
                    let json = match message.to_json() {
                        Ok(json) => json,
                        Err(e) => {
                            warn!(generation, "Dropping unserializable message: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = ws_sink.send(Message::Text(json.into())).await {
                        let mut unsent = vec![message];
                        unsent.extend(self.drain_outbound());
                        let _ = self.events.send(ConnectionEvent::Failed {
                            generation,
                            error: SpeechError::from(e).to_string(),
                            unsent,
                        });
                        return;
                    }
                    trace!(generation, "Sent {:?}", message);
                    if message == ClientMessage::Close {
                        let _ = ws_sink.send(Message::Close(None)).await;
                        break;
                    }
                }

                incoming = ws_stream.next() => {
                    match incoming {
                        Some(Ok(Message::Binary(bytes))) => {
                            trace!(generation, len = bytes.len(), "Binary audio frame");
                            let _ = self.events.send(ConnectionEvent::Audio { generation, bytes });
                        }
                        Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()),
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = ws_sink.send(Message::Pong(payload)).await;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(generation, "Provider closed the stream: {:?}", frame);
                            let unsent = self.drain_outbound();
                            let _ = self.events.send(ConnectionEvent::Closed { generation, unsent });
                            return;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            let unsent = self.drain_outbound();
                            let _ = self.events.send(ConnectionEvent::Failed {
                                generation,
                                error: SpeechError::from(e).to_string(),
                                unsent,
                            });
                            return;
                        }
                        None => {
                            let unsent = self.drain_outbound();
                            let _ = self.events.send(ConnectionEvent::Closed { generation, unsent });
                            return;
                        }
                    }
                }
            }
        }

        let _ = self.events.send(ConnectionEvent::Closed {
            generation,
            unsent: Vec::new(),
        });
    }

    fn handle_text(&self, text: &str) {
        let generation = self.generation;
        match decode_text(text) {
            Ok(Inbound::Audio(bytes)) => {
                let _ = self.events.send(ConnectionEvent::Audio { generation, bytes });
            }
            Ok(Inbound::Control(event)) => {
                let _ = self.events.send(ConnectionEvent::Control { generation, event });
            }
            Ok(Inbound::Ignored) => trace!(generation, "Ignoring inbound message: {}", text),
            Err(e) => debug!(generation, "Dropping undecodable frame: {}", e),
        }
    }

    fn fail(&mut self, error: String) {
        warn!(generation = self.generation, "Speech stream connect failed: {}", error);
        let unsent = self.drain_outbound();
        let _ = self.events.send(ConnectionEvent::Failed {
            generation: self.generation,
            error,
            unsent,
        });
    }

    fn drain_outbound(&mut self) -> Vec<ClientMessage> {
        let mut unsent = Vec::new();
        while let Ok(message) = self.outbound.try_recv() {
            unsent.push(message);
        }
        unsent
    }
}

fn build_request(
    endpoint: &Url,
    authorization: &str,
) -> SpeechResult<tokio_tungstenite::tungstenite::handshake::client::Request> {
    let mut request = endpoint
        .as_str()
        .into_client_request()
        .map_err(|e| SpeechError::ConnectionFailed(format!("invalid request: {e}")))?;
    let value = HeaderValue::from_str(authorization)
        .map_err(|e| SpeechError::InvalidConfiguration(format!("invalid auth header: {e}")))?;
    request.headers_mut().insert("Authorization", value);
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> (StreamConnection, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let mut config = SpeechConfig::new("test-key");
        // Nothing listens here; the attempt fails quickly.
        config.stream_url = "ws://127.0.0.1:9/speak".to_string();
        config.connect_timeout = Duration::from_millis(200);
        config.pending_queue_capacity = 4;
        let (tx, rx) = mpsc::unbounded_channel();
        (
            StreamConnection::new(Arc::new(config), tx, TaskTracker::new()),
            rx,
        )
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Connected.to_string(), "connected");
        assert_eq!(ConnectionState::default(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_build_request_sets_authorization() {
        let url = Url::parse("wss://api.deepgram.com/v1/speak?model=aura").unwrap();
        let request = build_request(&url, "Token abc").unwrap();
        assert_eq!(request.headers().get("Authorization").unwrap(), "Token abc");
        assert_eq!(request.uri().host(), Some("api.deepgram.com"));
    }

    #[tokio::test]
    async fn test_connect_is_idempotent_while_connecting() {
        let (mut conn, _rx) = connection();
        conn.connect();
        conn.connect();
        conn.connect();
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert_eq!(conn.attempts(), 1);
    }

    #[tokio::test]
    async fn test_speak_while_disconnected_queues_and_connects() {
        let (mut conn, _rx) = connection();
        conn.speak("Hello".into());
        conn.speak("there".into());
        assert_eq!(conn.pending_len(), 2);
        assert_eq!(conn.attempts(), 1);
        assert_eq!(conn.state(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn test_failure_returns_to_disconnected_and_keeps_queue() {
        let (mut conn, mut rx) = connection();
        conn.speak("Hello".into());

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(event.is_terminal());
        assert!(conn.handle_event(&event));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_stale_generation_is_ignored() {
        let (mut conn, _rx) = connection();
        conn.connect();
        conn.disconnect();

        let stale = ConnectionEvent::Opened { generation: 1 };
        assert!(!conn.handle_event(&stale));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_clear_drops_pending() {
        let (mut conn, _rx) = connection();
        conn.speak("one".into());
        conn.clear();
        assert_eq!(conn.pending_len(), 0);
    }
}
