//! WebSocket mock of the streaming speak endpoint.
//!
//! Records every control message and handshake, and answers `Flush` according
//! to a scripted [`Behavior`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;

/// Audio byte value used by every mock frame.
pub const FRAME_BYTE: u8 = 7;

/// How the mock answers a `Flush`.
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    /// Binary frames, then a `Flushed` event
    Stream { frames: usize, frame_bytes: usize },
    /// Base64 JSON audio payloads, then a `Flushed` event
    StreamJson { frames: usize, frame_bytes: usize },
    /// Accept text, never produce audio
    Silent,
    /// Send `bytes` of audio on the first flush, then drop the socket
    DropAfter { bytes: usize },
}

/// Shared state of a running mock.
pub struct SpeakMockState {
    behavior: Behavior,
    pub connection_count: AtomicU64,
    rejections: AtomicU64,
    messages: Mutex<Vec<Value>>,
    authorizations: Mutex<Vec<String>>,
    queries: Mutex<Vec<String>>,
}

/// Handle to a running mock server.
pub struct SpeakMock {
    addr: SocketAddr,
    pub state: Arc<SpeakMockState>,
}

impl SpeakMock {
    pub async fn start(behavior: Behavior) -> Self {
        Self::start_rejecting(behavior, 0).await
    }

    /// Like [`SpeakMock::start`], but fails the first `rejections` handshakes
    /// with `503 Service Unavailable`.
    pub async fn start_rejecting(behavior: Behavior, rejections: u64) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock listener");
        let addr = listener.local_addr().expect("mock address");
        let state = Arc::new(SpeakMockState {
            behavior,
            connection_count: AtomicU64::new(0),
            rejections: AtomicU64::new(rejections),
            messages: Mutex::new(Vec::new()),
            authorizations: Mutex::new(Vec::new()),
            queries: Mutex::new(Vec::new()),
        });

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = Arc::clone(&accept_state);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, state).await {
                        eprintln!("Speak mock connection error: {}", e);
                    }
                });
            }
        });

        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/v1/speak", self.addr)
    }

    pub fn connections(&self) -> u64 {
        self.state.connection_count.load(Ordering::Acquire)
    }

    /// Every JSON message received, across connections.
    pub fn messages(&self) -> Vec<Value> {
        self.state.messages.lock().clone()
    }

    /// The `type` of every message received.
    pub fn message_types(&self) -> Vec<String> {
        self.messages()
            .iter()
            .filter_map(|m| m["type"].as_str().map(str::to_owned))
            .collect()
    }

    /// Texts of every `Speak` received.
    pub fn spoken(&self) -> Vec<String> {
        self.messages()
            .iter()
            .filter(|m| m["type"] == "Speak")
            .filter_map(|m| m["text"].as_str().map(str::to_owned))
            .collect()
    }

    pub fn authorizations(&self) -> Vec<String> {
        self.state.authorizations.lock().clone()
    }

    pub fn queries(&self) -> Vec<String> {
        self.state.queries.lock().clone()
    }

    /// Poll until `check` holds, failing after five seconds.
    pub async fn wait_for(&self, what: &str, check: impl Fn(&Self) -> bool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !check(self) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {what}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn audio_frame(len: usize) -> Vec<u8> {
    vec![FRAME_BYTE; len]
}

async fn handle_connection(
    stream: TcpStream,
    state: Arc<SpeakMockState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let handshake_state = Arc::clone(&state);
    let callback = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if let Some(auth) = request
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
        {
            handshake_state.authorizations.lock().push(auth.to_string());
        }
        handshake_state
            .queries
            .lock()
            .push(request.uri().query().unwrap_or_default().to_string());
        let rejected = handshake_state
            .rejections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            let mut error = ErrorResponse::new(Some("unavailable".to_string()));
            *error.status_mut() = StatusCode::SERVICE_UNAVAILABLE;
            return Err(error);
        }
        Ok(response)
    };

    let ws_stream = accept_hdr_async(stream, callback).await?;
    let (mut write, mut read) = ws_stream.split();
    state.connection_count.fetch_add(1, Ordering::AcqRel);

    while let Some(msg) = read.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let value: Value = serde_json::from_str(text.as_str())?;
        let kind = value["type"].as_str().unwrap_or_default().to_string();
        state.messages.lock().push(value);

        match kind.as_str() {
            "Flush" => match state.behavior {
                Behavior::Stream {
                    frames,
                    frame_bytes,
                } => {
                    for _ in 0..frames {
                        write
                            .send(Message::Binary(Bytes::from(audio_frame(frame_bytes))))
                            .await?;
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    let flushed = json!({"type": "Flushed", "sequence_id": 0});
                    write.send(Message::Text(flushed.to_string().into())).await?;
                }
                Behavior::StreamJson {
                    frames,
                    frame_bytes,
                } => {
                    for _ in 0..frames {
                        let payload = json!({
                            "type": "Audio",
                            "audio": STANDARD.encode(audio_frame(frame_bytes)),
                        });
                        write.send(Message::Text(payload.to_string().into())).await?;
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                    let flushed = json!({"type": "Flushed", "sequence_id": 0});
                    write.send(Message::Text(flushed.to_string().into())).await?;
                }
                Behavior::Silent => {}
                Behavior::DropAfter { bytes } => {
                    write
                        .send(Message::Binary(Bytes::from(audio_frame(bytes))))
                        .await?;
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    // Drop both halves without a close handshake
                    return Ok(());
                }
            },
            "Close" => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            _ => {}
        }
    }

    Ok(())
}
