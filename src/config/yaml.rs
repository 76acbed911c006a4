use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use super::{ApiKey, ConfigError, SpeechConfig};

/// Complete YAML configuration structure
///
/// All fields are optional to allow partial configuration. Anything the file sets
/// takes priority over environment variables.
///
/// # Example YAML structure
/// ```yaml
/// provider:
///   api_key: "your-deepgram-key"
///   auth_scheme: "Token"
///   model: "aura-asteria-en"
///   stream_url: "wss://api.deepgram.com/v1/speak"
///   fallback_url: "https://api.deepgram.com/v1/speak"
///
/// audio:
///   sample_rate: 16000
///   channels: 1
///
/// connection:
///   connect_timeout_ms: 5000
///   fallback_timeout_ms: 10000
///   pending_queue_capacity: 64
///   preconnect: true
///
/// playback:
///   tick_interval_ms: 50
///   quiet_period_ms: 200
///   fallback_grace_ms: 1500
///   finished_idle_timeout_ms: 3000
///   streaming_idle_timeout_ms: 15000
///   drain_delay_ms: 1000
///   write_chunk_bytes: 3200
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub provider: Option<ProviderYaml>,
    pub audio: Option<AudioYaml>,
    pub connection: Option<ConnectionYaml>,
    pub playback: Option<PlaybackYaml>,
}

/// Provider settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ProviderYaml {
    pub api_key: Option<String>,
    pub auth_scheme: Option<String>,
    pub model: Option<String>,
    pub stream_url: Option<String>,
    pub fallback_url: Option<String>,
}

/// Audio format from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AudioYaml {
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
}

/// Connection settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ConnectionYaml {
    pub connect_timeout_ms: Option<u64>,
    pub fallback_timeout_ms: Option<u64>,
    pub pending_queue_capacity: Option<usize>,
    pub preconnect: Option<bool>,
}

/// Playback heuristics from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PlaybackYaml {
    pub tick_interval_ms: Option<u64>,
    pub quiet_period_ms: Option<u64>,
    pub fallback_grace_ms: Option<u64>,
    pub finished_idle_timeout_ms: Option<u64>,
    pub streaming_idle_timeout_ms: Option<u64>,
    pub drain_delay_ms: Option<u64>,
    pub write_chunk_bytes: Option<usize>,
}

impl YamlConfig {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    /// Returns an error if:
    /// - The file cannot be read
    /// - The YAML is malformed
    /// - Fields have invalid types
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config: YamlConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    /// Overlay every value set in the file onto `config`.
    pub fn apply(&self, config: &mut SpeechConfig) {
        if let Some(provider) = &self.provider {
            if let Some(key) = &provider.api_key {
                config.api_key = ApiKey::new(key.clone());
            }
            set(&mut config.auth_scheme, provider.auth_scheme.clone());
            set(&mut config.model, provider.model.clone());
            set(&mut config.stream_url, provider.stream_url.clone());
            set(&mut config.fallback_url, provider.fallback_url.clone());
        }

        if let Some(audio) = &self.audio {
            set(&mut config.sample_rate, audio.sample_rate);
            set(&mut config.channels, audio.channels);
        }

        if let Some(connection) = &self.connection {
            set(&mut config.connect_timeout, millis(connection.connect_timeout_ms));
            set(&mut config.fallback_timeout, millis(connection.fallback_timeout_ms));
            set(
                &mut config.pending_queue_capacity,
                connection.pending_queue_capacity,
            );
            set(&mut config.preconnect, connection.preconnect);
        }

        if let Some(playback) = &self.playback {
            let timings = &mut config.timings;
            set(&mut timings.tick_interval, millis(playback.tick_interval_ms));
            set(&mut timings.quiet_period, millis(playback.quiet_period_ms));
            set(&mut timings.fallback_grace, millis(playback.fallback_grace_ms));
            set(
                &mut timings.finished_idle_timeout,
                millis(playback.finished_idle_timeout_ms),
            );
            set(
                &mut timings.streaming_idle_timeout,
                millis(playback.streaming_idle_timeout_ms),
            );
            set(&mut timings.drain_delay, millis(playback.drain_delay_ms));
            set(&mut timings.write_chunk_bytes, playback.write_chunk_bytes);
        }
    }
}

fn set<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn millis(value: Option<u64>) -> Option<Duration> {
    value.map(Duration::from_millis)
}
