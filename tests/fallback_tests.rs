//! Fallback synthesis against a mocked REST endpoint.

mod mock_providers;

use std::sync::Arc;
use std::time::{Duration, Instant};

use mock_providers::websocket_mock::{Behavior, SpeakMock};
use mock_providers::{RecordingOutput, Reports, test_config};
use serde_json::json;
use speakstream::{FinishReason, SpeechConfig, StreamingSpeaker};
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn build(config: SpeechConfig, output: &RecordingOutput) -> (StreamingSpeaker, Reports) {
    let (tx, reports) = Reports::channel();
    let speaker = StreamingSpeaker::builder(config)
        .output(Arc::new(output.clone()))
        .on_finished(move |report| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(report);
            }
        })
        .build()
        .expect("speaker should build");
    (speaker, reports)
}

fn wav_body(samples: &[i16]) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 16000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for sample in samples {
            writer.write_sample(*sample).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

#[tokio::test]
async fn test_silent_stream_falls_back_once() {
    let stream = SpeakMock::start(Behavior::Silent).await;
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/speak"))
        .and(query_param("container", "wav"))
        .and(query_param("encoding", "linear16"))
        .and(header("authorization", "Token test-key"))
        .and(header("accept", "audio/wav"))
        .and(body_json(json!({"text": "Hello there"})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "application/octet-stream")
                .set_body_bytes(vec![3u8; 32000]),
        )
        .expect(1)
        .mount(&server)
        .await;

    let config = test_config(&stream.url(), &format!("{}/v1/speak", server.uri()));
    let grace = config.timings.fallback_grace;
    let drain = config.timings.drain_delay;
    let output = RecordingOutput::new();
    let (speaker, mut reports) = build(config, &output);

    speaker.start_stream().unwrap();
    speaker.enqueue("Hello there").unwrap();
    let ended = Instant::now();
    speaker.end_stream().unwrap();

    let report = reports.next().await;
    assert!(ended.elapsed() >= grace + drain);
    assert_eq!(report.reason, FinishReason::Completed);
    assert_eq!(report.bytes_played, 32000);
    assert!(report.used_fallback);

    let written = output.written(1);
    assert_eq!(written.len(), 32000);
    assert!(written.iter().all(|b| *b == 3));
    assert_eq!(output.closed(), vec![1]);

    reports.assert_quiet(Duration::from_millis(300)).await;
    speaker.shutdown().await;
}

#[tokio::test]
async fn test_wav_response_is_unwrapped() {
    let stream = SpeakMock::start(Behavior::Silent).await;
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/speak"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "audio/wav")
                .set_body_bytes(wav_body(&[1, -1, 2, -2, 3, -3])),
        )
        .expect(1)
        .mount(&server)
        .await;

    let config = test_config(&stream.url(), &format!("{}/v1/speak", server.uri()));
    let output = RecordingOutput::new();
    let (speaker, mut reports) = build(config, &output);

    speaker.start_stream().unwrap();
    speaker.enqueue("Tiny.").unwrap();
    speaker.end_stream().unwrap();

    let report = reports.next().await;
    assert_eq!(report.reason, FinishReason::Completed);
    assert_eq!(report.bytes_played, 12);
    let expected: Vec<u8> = [1i16, -1, 2, -2, 3, -3]
        .iter()
        .flat_map(|s| s.to_le_bytes())
        .collect();
    assert_eq!(output.written(1), expected);
    speaker.shutdown().await;
}

#[tokio::test]
async fn test_fallback_failure_ends_without_audio() {
    let stream = SpeakMock::start(Behavior::Silent).await;
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/speak"))
        .respond_with(ResponseTemplate::new(500).set_body_string("synthesis unavailable"))
        .expect(1)
        .mount(&server)
        .await;

    let config = test_config(&stream.url(), &format!("{}/v1/speak", server.uri()));
    let output = RecordingOutput::new();
    let (speaker, mut reports) = build(config, &output);

    speaker.start_stream().unwrap();
    speaker.enqueue("Is anyone there?").unwrap();
    speaker.end_stream().unwrap();

    let report = reports.next().await;
    assert_eq!(report.reason, FinishReason::NoAudio);
    assert!(!report.played_audio());
    assert!(!report.used_fallback);
    assert!(output.written(1).is_empty());
    speaker.shutdown().await;
}

#[tokio::test]
async fn test_streamed_audio_skips_fallback() {
    let stream = SpeakMock::start(Behavior::Stream {
        frames: 3,
        frame_bytes: 320,
    })
    .await;
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 64]))
        .expect(0)
        .mount(&server)
        .await;

    let config = test_config(&stream.url(), &format!("{}/v1/speak", server.uri()));
    let output = RecordingOutput::new();
    let (speaker, mut reports) = build(config, &output);

    speaker.start_stream().unwrap();
    speaker.enqueue("Streaming works.").unwrap();
    speaker.end_stream().unwrap();

    let report = reports.next().await;
    assert_eq!(report.reason, FinishReason::Completed);
    assert!(!report.used_fallback);
    assert_eq!(report.bytes_played, 960);
    speaker.shutdown().await;
}

#[tokio::test]
async fn test_each_session_gets_its_own_fallback() {
    let stream = SpeakMock::start(Behavior::Silent).await;
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/speak"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![5u8; 640]))
        .expect(2)
        .mount(&server)
        .await;

    let config = test_config(&stream.url(), &format!("{}/v1/speak", server.uri()));
    let output = RecordingOutput::new();
    let (speaker, mut reports) = build(config, &output);

    for session in 1..=2 {
        speaker.start_stream().unwrap();
        speaker.enqueue(format!("Session {session}.")).unwrap();
        speaker.end_stream().unwrap();

        let report = reports.next().await;
        assert_eq!(report.session, session);
        assert_eq!(report.reason, FinishReason::Completed);
        assert_eq!(report.bytes_played, 640);
        assert!(report.used_fallback);
    }
    speaker.shutdown().await;
}
