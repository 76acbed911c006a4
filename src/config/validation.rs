//! Configuration validation
//!
//! Endpoint checks make sure each URL parses, has a host and uses a scheme the
//! matching client can speak. The remaining checks keep the playback heuristics
//! internally consistent.

use std::time::Duration;

use url::Url;

use super::{ConfigError, SpeechConfig};

/// Which client an endpoint is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    /// Duplex WebSocket endpoint (`ws`/`wss`)
    Streaming,
    /// One-shot HTTP endpoint (`http`/`https`)
    Http,
}

impl EndpointKind {
    fn schemes(self) -> &'static [&'static str] {
        match self {
            EndpointKind::Streaming => &["ws", "wss"],
            EndpointKind::Http => &["http", "https"],
        }
    }
}

/// Validate a single endpoint URL.
///
/// # Errors
/// - The URL does not parse
/// - The scheme does not match `kind`
/// - The URL has no host
pub fn validate_endpoint(raw: &str, kind: EndpointKind) -> Result<Url, ConfigError> {
    let url = Url::parse(raw)
        .map_err(|e| ConfigError::Invalid(format!("invalid URL format {raw}: {e}")))?;

    let scheme = url.scheme();
    if !kind.schemes().contains(&scheme) {
        return Err(ConfigError::Invalid(format!(
            "URL scheme must be one of {:?}, got: {scheme}",
            kind.schemes()
        )));
    }

    if url.host_str().is_none_or(str::is_empty) {
        return Err(ConfigError::Invalid(format!("URL must have a host: {raw}")));
    }

    Ok(url)
}

pub(super) fn validate_config(config: &SpeechConfig) -> Result<(), ConfigError> {
    if config.api_key.is_empty() {
        return Err(ConfigError::Invalid(
            "API key is required (SPEAKSTREAM_API_KEY or DEEPGRAM_API_KEY)".to_string(),
        ));
    }
    if config.auth_scheme.trim().is_empty() {
        return Err(ConfigError::Invalid("auth_scheme must not be empty".to_string()));
    }
    if config.model.trim().is_empty() {
        return Err(ConfigError::Invalid("model must not be empty".to_string()));
    }

    validate_endpoint(&config.stream_url, EndpointKind::Streaming)?;
    validate_endpoint(&config.fallback_url, EndpointKind::Http)?;

    non_zero("sample_rate", config.sample_rate as u64)?;
    non_zero("channels", config.channels as u64)?;
    non_zero(
        "pending_queue_capacity",
        config.pending_queue_capacity as u64,
    )?;

    let timings = &config.timings;
    if timings.tick_interval == Duration::ZERO {
        return Err(ConfigError::Invalid(
            "tick_interval must be greater than zero".to_string(),
        ));
    }
    non_zero("write_chunk_bytes", timings.write_chunk_bytes as u64)?;

    if timings.quiet_period >= timings.finished_idle_timeout {
        return Err(ConfigError::Invalid(format!(
            "quiet_period ({:?}) must be shorter than finished_idle_timeout ({:?})",
            timings.quiet_period, timings.finished_idle_timeout
        )));
    }
    if timings.fallback_grace >= timings.finished_idle_timeout {
        return Err(ConfigError::Invalid(format!(
            "fallback_grace ({:?}) must be shorter than finished_idle_timeout ({:?})",
            timings.fallback_grace, timings.finished_idle_timeout
        )));
    }
    if timings.finished_idle_timeout > timings.streaming_idle_timeout {
        return Err(ConfigError::Invalid(format!(
            "finished_idle_timeout ({:?}) must not exceed streaming_idle_timeout ({:?})",
            timings.finished_idle_timeout, timings.streaming_idle_timeout
        )));
    }

    Ok(())
}

fn non_zero(name: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Invalid(format!(
            "{name} must be greater than zero"
        )));
    }
    Ok(())
}
