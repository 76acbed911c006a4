use std::path::PathBuf;
use std::sync::Arc;

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use speakstream::{
    AudioOutput, ClauseChunker, SessionReport, SpeechConfig, StreamingSpeaker, WavFileOutput,
};

/// speakstream - streaming text-to-speech playback
#[derive(Parser, Debug)]
#[command(name = "speakstream")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Write each session to a WAV file in this directory instead of the audio device
    #[arg(long = "wav-dir", value_name = "DIR", global = true)]
    wav_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Speak the given words as one session
    Say {
        #[arg(required = true)]
        words: Vec<String>,
    },

    /// Speak stdin line by line, releasing text at clause boundaries
    Pipe,

    /// Print the resolved configuration with secrets redacted
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Initialize crypto provider for TLS connections
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let config = if let Some(config_path) = &cli.config {
        info!("Loading configuration from {}", config_path.display());
        SpeechConfig::from_file(config_path).map_err(|e| anyhow!(e.to_string()))?
    } else {
        SpeechConfig::from_env().map_err(|e| anyhow!(e.to_string()))?
    };

    match cli.command {
        Commands::Config => {
            println!("{config:#?}");
            Ok(())
        }
        Commands::Say { words } => {
            let (speaker, finished) = start(config, select_output(cli.wav_dir)?)?;
            speaker.start_stream()?;

            let mut chunker = ClauseChunker::new();
            for word in &words {
                if let Some(clause) = chunker.push(&format!("{word} ")) {
                    speaker.enqueue(clause)?;
                }
            }
            if let Some(rest) = chunker.finish() {
                speaker.enqueue(rest)?;
            }
            speaker.end_stream()?;
            summarize(&wait_finished(speaker, finished).await?)
        }
        Commands::Pipe => {
            let (speaker, finished) = start(config, select_output(cli.wav_dir)?)?;
            speaker.start_stream()?;

            let mut chunker = ClauseChunker::new();
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Some(line) = lines.next_line().await? {
                if let Some(clause) = chunker.push(&format!("{line} ")) {
                    speaker.enqueue(clause)?;
                }
            }
            if let Some(rest) = chunker.finish() {
                speaker.enqueue(rest)?;
            }
            speaker.end_stream()?;
            summarize(&wait_finished(speaker, finished).await?)
        }
    }
}

fn select_output(wav_dir: Option<PathBuf>) -> anyhow::Result<Arc<dyn AudioOutput>> {
    if let Some(dir) = wav_dir {
        std::fs::create_dir_all(&dir)
            .map_err(|e| anyhow!("Failed to create {}: {}", dir.display(), e))?;
        info!("Writing sessions to {}", dir.display());
        return Ok(Arc::new(WavFileOutput::new(dir)));
    }

    #[cfg(feature = "device-output")]
    {
        Ok(Arc::new(speakstream::DeviceOutput::new()))
    }

    #[cfg(not(feature = "device-output"))]
    {
        tracing::warn!("Built without device-output and no --wav-dir given; audio is discarded");
        Ok(Arc::new(speakstream::NullOutput::new()))
    }
}

fn start(
    config: SpeechConfig,
    output: Arc<dyn AudioOutput>,
) -> anyhow::Result<(StreamingSpeaker, mpsc::UnboundedReceiver<SessionReport>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let speaker = StreamingSpeaker::builder(config)
        .output(output)
        .on_finished(move |report| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(report);
            }
        })
        .build()?;
    Ok((speaker, rx))
}

/// Wait for the session's completion report, then shut the speaker down.
async fn wait_finished(
    speaker: StreamingSpeaker,
    mut finished: mpsc::UnboundedReceiver<SessionReport>,
) -> anyhow::Result<SessionReport> {
    let report = finished
        .recv()
        .await
        .ok_or_else(|| anyhow!("Speaker stopped before the session finished"))?;
    speaker.shutdown().await;
    Ok(report)
}

fn summarize(report: &SessionReport) -> anyhow::Result<()> {
    println!(
        "session {} {}: {} bytes played{}",
        report.session,
        report.reason,
        report.bytes_played,
        if report.used_fallback { " (fallback)" } else { "" }
    );
    if !report.played_audio() {
        anyhow::bail!("No audio was played");
    }
    Ok(())
}
