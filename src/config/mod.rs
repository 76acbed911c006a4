//! Configuration module for speakstream
//!
//! This module handles configuration from various sources: .env files, YAML files,
//! and environment variables. Priority: YAML > ENV vars > .env values > defaults.
//!
//! # Modules
//! - `yaml`: YAML configuration file loading
//! - `validation`: Configuration validation logic
//!
//! # Example
//! ```rust,no_run
//! use speakstream::config::SpeechConfig;
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Load from environment variables only
//! let config = SpeechConfig::from_env()?;
//!
//! // Load from YAML file with environment variable fallbacks
//! let config = SpeechConfig::from_file(&PathBuf::from("speakstream.yaml"))?;
//!
//! println!("Streaming from {}", config.stream_endpoint()?);
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;
use url::Url;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::core::audio::AudioFormat;

mod validation;
mod yaml;

pub use validation::{EndpointKind, validate_endpoint};
pub use yaml::YamlConfig;

/// Default streaming synthesis endpoint.
pub const DEFAULT_STREAM_URL: &str = "wss://api.deepgram.com/v1/speak";
/// Default one-shot synthesis endpoint used by the fallback path.
pub const DEFAULT_FALLBACK_URL: &str = "https://api.deepgram.com/v1/speak";
/// Default voice model.
pub const DEFAULT_MODEL: &str = "aura-asteria-en";
/// Default output sample rate in Hz.
pub const DEFAULT_SAMPLE_RATE: u32 = 16000;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl From<ConfigError> for crate::SpeechError {
    fn from(err: ConfigError) -> Self {
        crate::SpeechError::InvalidConfiguration(err.to_string())
    }
}

/// Provider API key. Zeroed on drop and never printed.
#[derive(Clone, Default, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The raw key, for building the authorization header.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "ApiKey(<unset>)")
        } else {
            write!(f, "ApiKey(***)")
        }
    }
}

/// Timing heuristics for the playback loop.
///
/// Defaults match the streaming provider's observed latency. Tune per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaybackTimings {
    /// Cadence of the playback loop
    pub tick_interval: Duration,
    /// No new bytes for this long means the provider paused or finished
    pub quiet_period: Duration,
    /// Time after the last text was sent before the fallback fetch fires
    pub fallback_grace: Duration,
    /// Idle ceiling once the caller has ended the text stream
    pub finished_idle_timeout: Duration,
    /// Idle ceiling while text may still be coming
    pub streaming_idle_timeout: Duration,
    /// Tail allowance before the device is released
    pub drain_delay: Duration,
    /// Maximum bytes handed to the device per write call
    pub write_chunk_bytes: usize,
}

impl Default for PlaybackTimings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(50),
            quiet_period: Duration::from_millis(200),
            fallback_grace: Duration::from_millis(1500),
            finished_idle_timeout: Duration::from_millis(3000),
            streaming_idle_timeout: Duration::from_millis(15000),
            drain_delay: Duration::from_millis(1000),
            write_chunk_bytes: 3200,
        }
    }
}

impl PlaybackTimings {
    /// Idle ceiling for the exit heuristics.
    pub fn idle_timeout(&self, text_finished: bool) -> Duration {
        if text_finished {
            self.finished_idle_timeout
        } else {
            self.streaming_idle_timeout
        }
    }
}

/// Complete configuration for a [`StreamingSpeaker`](crate::StreamingSpeaker).
#[derive(Debug, Clone)]
pub struct SpeechConfig {
    // Provider settings
    pub api_key: ApiKey,
    /// Authorization scheme, sent as `Authorization: <scheme> <key>`
    pub auth_scheme: String,
    pub model: String,
    pub stream_url: String,
    pub fallback_url: String,

    // Audio format (linear16 is fixed)
    pub sample_rate: u32,
    pub channels: u16,

    // Connection settings
    pub connect_timeout: Duration,
    pub fallback_timeout: Duration,
    /// Texts held while the connection is not ready; oldest dropped on overflow
    pub pending_queue_capacity: usize,
    /// Open the streaming connection as soon as the speaker is built
    pub preconnect: bool,

    pub timings: PlaybackTimings,
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            api_key: ApiKey::default(),
            auth_scheme: "Token".to_string(),
            model: DEFAULT_MODEL.to_string(),
            stream_url: DEFAULT_STREAM_URL.to_string(),
            fallback_url: DEFAULT_FALLBACK_URL.to_string(),
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: 1,
            connect_timeout: Duration::from_secs(5),
            fallback_timeout: Duration::from_secs(10),
            pending_queue_capacity: 64,
            preconnect: true,
            timings: PlaybackTimings::default(),
        }
    }
}

impl SpeechConfig {
    /// Default configuration with the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: ApiKey::new(api_key),
            ..Default::default()
        }
    }

    /// Load configuration from environment variables and validate it.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file, falling back to environment variables
    /// for anything the file leaves unset.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let yaml = YamlConfig::from_file(path)?;
        let mut config = Self::from_lookup(|key| std::env::var(key).ok())?;
        yaml.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from an arbitrary variable source without validating.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(key) = lookup("SPEAKSTREAM_API_KEY").or_else(|| lookup("DEEPGRAM_API_KEY")) {
            config.api_key = ApiKey::new(key);
        }
        if let Some(scheme) = lookup("SPEAKSTREAM_AUTH_SCHEME") {
            config.auth_scheme = scheme;
        }
        if let Some(model) = lookup("SPEAKSTREAM_MODEL") {
            config.model = model;
        }
        if let Some(url) = lookup("SPEAKSTREAM_STREAM_URL") {
            config.stream_url = url;
        }
        if let Some(url) = lookup("SPEAKSTREAM_FALLBACK_URL") {
            config.fallback_url = url;
        }
        if let Some(rate) = parse_var::<u32, _>(&lookup, "SPEAKSTREAM_SAMPLE_RATE")? {
            config.sample_rate = rate;
        }
        if let Some(capacity) = parse_var::<usize, _>(&lookup, "SPEAKSTREAM_PENDING_QUEUE")? {
            config.pending_queue_capacity = capacity;
        }
        if let Some(raw) = lookup("SPEAKSTREAM_PRECONNECT") {
            config.preconnect = parse_bool(&raw).ok_or_else(|| {
                ConfigError::Invalid(format!("SPEAKSTREAM_PRECONNECT: not a boolean: {raw}"))
            })?;
        }

        let timings = &mut config.timings;
        if let Some(ms) = parse_var::<u64, _>(&lookup, "SPEAKSTREAM_QUIET_PERIOD_MS")? {
            timings.quiet_period = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "SPEAKSTREAM_FALLBACK_GRACE_MS")? {
            timings.fallback_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "SPEAKSTREAM_FINISHED_IDLE_MS")? {
            timings.finished_idle_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "SPEAKSTREAM_STREAMING_IDLE_MS")? {
            timings.streaming_idle_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "SPEAKSTREAM_DRAIN_DELAY_MS")? {
            timings.drain_delay = Duration::from_millis(ms);
        }

        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validation::validate_config(self)
    }

    /// Value of the `Authorization` header for both endpoints.
    pub fn authorization(&self) -> String {
        format!("{} {}", self.auth_scheme, self.api_key.expose())
    }

    /// Streaming endpoint with the audio format query parameters applied.
    pub fn stream_endpoint(&self) -> Result<Url, ConfigError> {
        self.endpoint(&self.stream_url, "none")
    }

    /// Fallback endpoint with the audio format query parameters applied.
    pub fn fallback_endpoint(&self) -> Result<Url, ConfigError> {
        self.endpoint(&self.fallback_url, "wav")
    }

    /// Output format produced by both endpoints.
    pub fn audio_format(&self) -> AudioFormat {
        AudioFormat::linear16(self.sample_rate, self.channels)
    }

    fn endpoint(&self, base: &str, container: &str) -> Result<Url, ConfigError> {
        let mut url = Url::parse(base)
            .map_err(|e| ConfigError::Invalid(format!("invalid endpoint {base}: {e}")))?;
        url.query_pairs_mut()
            .append_pair("model", &self.model)
            .append_pair("encoding", "linear16")
            .append_pair("sample_rate", &self.sample_rate.to_string())
            .append_pair("container", container);
        Ok(url)
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::Invalid(format!("{key}: {e}"))),
        None => Ok(None),
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
