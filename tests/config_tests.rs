//! Configuration layering: YAML file over environment over defaults.

use std::collections::HashMap;
use std::fs;
use std::time::Duration;

use speakstream::config::{ConfigError, YamlConfig};
use speakstream::{SpeechConfig, SpeechError, StreamingSpeaker};
use tempfile::TempDir;

fn write_yaml(dir: &TempDir, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join("speakstream.yaml");
    fs::write(&path, contents).unwrap();
    path
}

fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    move |key| vars.get(key).cloned()
}

#[test]
fn test_yaml_overrides_environment() {
    let mut config = SpeechConfig::from_lookup(lookup(&[
        ("SPEAKSTREAM_API_KEY", "env-key"),
        ("SPEAKSTREAM_MODEL", "aura-env-en"),
        ("SPEAKSTREAM_QUIET_PERIOD_MS", "300"),
        ("SPEAKSTREAM_DRAIN_DELAY_MS", "400"),
    ]))
    .unwrap();

    let yaml: YamlConfig = serde_yaml::from_str(
        r#"
provider:
  model: "aura-yaml-en"
playback:
  quiet_period_ms: 250
"#,
    )
    .unwrap();
    yaml.apply(&mut config);

    assert_eq!(config.api_key.expose(), "env-key");
    assert_eq!(config.model, "aura-yaml-en");
    assert_eq!(config.timings.quiet_period, Duration::from_millis(250));
    assert_eq!(config.timings.drain_delay, Duration::from_millis(400));
    assert!(config.validate().is_ok());
}

#[test]
fn test_from_file_full_configuration() {
    let dir = TempDir::new().unwrap();
    let path = write_yaml(
        &dir,
        r#"
provider:
  api_key: "file-key"
  auth_scheme: "Bearer"
  model: "aura-luna-en"
  stream_url: "wss://speech.example.com/v1/speak"
  fallback_url: "https://speech.example.com/v1/speak"
audio:
  sample_rate: 24000
connection:
  connect_timeout_ms: 2500
  pending_queue_capacity: 8
  preconnect: false
playback:
  fallback_grace_ms: 1000
  finished_idle_timeout_ms: 2000
"#,
    );

    let config = SpeechConfig::from_file(&path).unwrap();
    assert_eq!(config.api_key.expose(), "file-key");
    assert_eq!(config.authorization(), "Bearer file-key");
    assert_eq!(config.sample_rate, 24000);
    assert_eq!(config.connect_timeout, Duration::from_millis(2500));
    assert_eq!(config.pending_queue_capacity, 8);
    assert!(!config.preconnect);
    assert_eq!(config.timings.fallback_grace, Duration::from_secs(1));
    assert_eq!(config.timings.finished_idle_timeout, Duration::from_secs(2));

    let endpoint = config.fallback_endpoint().unwrap();
    assert_eq!(endpoint.host_str(), Some("speech.example.com"));
    let query = endpoint.query().unwrap();
    assert!(query.contains("model=aura-luna-en"));
    assert!(query.contains("sample_rate=24000"));
    assert!(query.contains("container=wav"));
}

#[test]
fn test_from_file_rejects_inconsistent_timings() {
    let dir = TempDir::new().unwrap();
    let path = write_yaml(
        &dir,
        r#"
provider:
  api_key: "file-key"
playback:
  finished_idle_timeout_ms: 20000
  streaming_idle_timeout_ms: 10000
"#,
    );

    let result = SpeechConfig::from_file(&path);
    assert!(matches!(result, Err(ConfigError::Invalid(_))));
}

#[test]
fn test_from_file_rejects_bad_stream_scheme() {
    let dir = TempDir::new().unwrap();
    let path = write_yaml(
        &dir,
        r#"
provider:
  api_key: "file-key"
  stream_url: "https://speech.example.com/v1/speak"
"#,
    );

    assert!(matches!(
        SpeechConfig::from_file(&path),
        Err(ConfigError::Invalid(_))
    ));
}

#[test]
fn test_missing_file_is_io_error() {
    let dir = TempDir::new().unwrap();
    let result = SpeechConfig::from_file(&dir.path().join("absent.yaml"));
    assert!(matches!(result, Err(ConfigError::Io(_))));
}

#[test]
fn test_debug_output_never_shows_key() {
    let config = SpeechConfig::new("super-secret-key");
    let rendered = format!("{config:?}");
    assert!(!rendered.contains("super-secret-key"));
    assert!(rendered.contains("ApiKey(***)"));
}

#[tokio::test]
async fn test_builder_surfaces_config_errors() {
    let mut config = SpeechConfig::new("key");
    config.sample_rate = 0;
    let result = StreamingSpeaker::builder(config).build();
    assert!(matches!(result, Err(SpeechError::InvalidConfiguration(_))));
}
