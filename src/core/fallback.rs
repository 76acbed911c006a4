//! Fallback synthesis.
//!
//! When the streaming connection produces no audio for a finished session, the
//! playback loop asks the [`FallbackFetcher`] to synthesize the session's whole
//! text in one request. A successful response replaces the session buffer; any
//! failure leaves state untouched so the playback loop's timeout resolves the
//! session.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::SpeechConfig;
use crate::core::audio::{AudioAccumulator, wav};
use crate::core::session::{CompletionLatch, SessionTicket};
use crate::errors::{SpeechError, SpeechResult};

/// One-shot text to PCM synthesis.
#[async_trait]
pub trait FallbackSynthesizer: Send + Sync {
    /// Synthesize `text`, returning headerless linear PCM.
    async fn synthesize(&self, text: &str) -> SpeechResult<Bytes>;
}

#[derive(Serialize)]
struct SpeakRequest<'a> {
    text: &'a str,
}

// =============================================================================
// HttpFallback
// =============================================================================

/// REST synthesis endpoint.
#[derive(Debug, Clone)]
pub struct HttpFallback {
    client: reqwest::Client,
    endpoint: Url,
    authorization: String,
    sample_rate: u32,
}

impl HttpFallback {
    pub fn new(config: &SpeechConfig) -> SpeechResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.fallback_timeout)
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| SpeechError::InvalidConfiguration(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: config.fallback_endpoint()?,
            authorization: config.authorization(),
            sample_rate: config.sample_rate,
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl FallbackSynthesizer for HttpFallback {
    async fn synthesize(&self, text: &str) -> SpeechResult<Bytes> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .header(AUTHORIZATION, &self.authorization)
            .header(ACCEPT, "audio/wav")
            .json(&SpeakRequest { text })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(SpeechError::FallbackFailed(format!(
                "synthesis API error {status}: {error_text}"
            )));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = response.bytes().await?;

        if body.is_empty() {
            return Err(SpeechError::FallbackFailed("empty response body".to_string()));
        }

        if !wav::is_container(content_type.as_deref(), &body) {
            return Ok(body);
        }

        let payload = wav::parse(&body)?;
        if let Some(format) = payload.format
            && format.sample_rate != self.sample_rate
        {
            warn!(
                expected = self.sample_rate,
                received = format.sample_rate,
                "Fallback audio sample rate differs from output format"
            );
        }
        if payload.pcm.is_empty() {
            return Err(SpeechError::FallbackFailed("WAV body has no samples".to_string()));
        }
        Ok(payload.pcm)
    }
}

// =============================================================================
// FallbackFetcher
// =============================================================================

/// Applies fallback audio to the accumulator for a captured session.
#[derive(Clone)]
pub struct FallbackFetcher {
    synthesizer: Arc<dyn FallbackSynthesizer>,
    accumulator: Arc<AudioAccumulator>,
}

impl FallbackFetcher {
    pub fn new(synthesizer: Arc<dyn FallbackSynthesizer>, accumulator: Arc<AudioAccumulator>) -> Self {
        Self {
            synthesizer,
            accumulator,
        }
    }

    /// Fetch and apply fallback audio. Returns whether the buffer was replaced.
    pub async fn run(&self, ticket: SessionTicket, text: String, latch: Arc<CompletionLatch>) -> bool {
        let session = ticket.id();
        info!(
            session,
            chars = text.len(),
            "No streamed audio, requesting fallback synthesis"
        );

        let result = tokio::select! {
            _ = ticket.cancelled() => {
                debug!(session, "Fallback cancelled");
                return false;
            }
            result = self.synthesizer.synthesize(&text) => result,
        };

        let pcm = match result {
            Ok(pcm) => pcm,
            Err(e) => {
                warn!(session, "Fallback synthesis failed: {}", e);
                return false;
            }
        };

        if !ticket.is_current() {
            debug!(session, "Discarding fallback audio for stale session");
            return false;
        }
        if !self.accumulator.replace(session, &pcm) {
            return false;
        }

        latch.mark_fallback();
        info!(session, bytes = pcm.len(), "Fallback audio ready");
        true
    }
}
