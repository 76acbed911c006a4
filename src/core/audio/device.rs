//! System audio device output (cpal).
//!
//! The cpal stream is not `Send` on every host, so each sink parks it on a
//! dedicated thread for the life of the session. Writes push samples onto a
//! shared queue that the device callback drains; a write blocks while more than
//! `max_buffered` of audio is queued.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cpal::Sample;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{AudioFormat, AudioOutput, AudioSink, OutputHandle};
use crate::core::session::SessionId;
use crate::errors::{SpeechError, SpeechResult};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Plays through the host's default output device.
#[derive(Debug, Clone)]
pub struct DeviceOutput {
    max_buffered: Duration,
}

impl Default for DeviceOutput {
    fn default() -> Self {
        Self {
            max_buffered: Duration::from_millis(500),
        }
    }
}

impl DeviceOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_buffered(mut self, max_buffered: Duration) -> Self {
        self.max_buffered = max_buffered;
        self
    }
}

type SampleQueue = Arc<Mutex<VecDeque<i16>>>;

impl AudioOutput for DeviceOutput {
    fn open(&self, session: SessionId, format: AudioFormat) -> SpeechResult<Box<dyn AudioSink>> {
        let queue: SampleQueue = Arc::new(Mutex::new(VecDeque::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = mpsc::channel::<Result<String, String>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let thread_queue = Arc::clone(&queue);
        let thread_alive = Arc::clone(&alive);
        let thread = std::thread::Builder::new()
            .name(format!("speakstream-output-{session}"))
            .spawn(move || {
                let (stream, label) = match build_stream(format, thread_queue, thread_alive) {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(format!("failed to start stream: {e}")));
                    return;
                }
                let _ = ready_tx.send(Ok(label));
                // Hold the stream until the sink is closed or dropped.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| SpeechError::AudioOutput(format!("failed to spawn output thread: {e}")))?;

        let label = ready_rx
            .recv()
            .map_err(|_| SpeechError::AudioOutput("output thread exited".to_string()))?
            .map_err(SpeechError::AudioOutput)?;

        let max_samples = (format.bytes_per_second() as f64 * self.max_buffered.as_secs_f64())
            as usize
            / size_of::<i16>();

        debug!(session, device = %label, "Opened audio device");
        Ok(Box::new(DeviceSink {
            handle: OutputHandle::new(session, format, label),
            queue,
            alive,
            max_samples: max_samples.max(1),
            carry: None,
            stop: Some(stop_tx),
            thread: Some(thread),
        }))
    }
}

fn build_stream(
    format: AudioFormat,
    queue: SampleQueue,
    alive: Arc<AtomicBool>,
) -> Result<(cpal::Stream, String), String> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| "no audio output device found".to_string())?;
    let label = device.name().unwrap_or_else(|_| "default".to_string());
    let config = choose_config(&device, format);
    debug!(
        device = %label,
        channels = config.channels,
        sample_rate = config.sample_rate.0,
        "Selected output stream config"
    );

    let mapper = FrameMapper::new(format, &config);
    match open_stream::<f32>(&device, &config, mapper.clone(), Arc::clone(&queue), Arc::clone(&alive)) {
        Ok(stream) => Ok((stream, label)),
        Err(e) => {
            debug!("f32 output stream unavailable, trying i16: {}", e);
            open_stream::<i16>(&device, &config, mapper, queue, alive)
                .map(|stream| (stream, label))
                .map_err(|e| format!("failed to build output stream: {e}"))
        }
    }
}

/// Device channel layout at the source rate when the device supports it, else
/// the device's default rate.
fn choose_config(device: &cpal::Device, format: AudioFormat) -> cpal::StreamConfig {
    let rate = cpal::SampleRate(format.sample_rate);
    let Ok(default) = device.default_output_config() else {
        // Stereo is accepted by far more hosts than mono
        return cpal::StreamConfig {
            channels: 2,
            sample_rate: rate,
            buffer_size: cpal::BufferSize::Default,
        };
    };

    let channels = default.channels();
    let rate_supported = device
        .supported_output_configs()
        .map(|mut configs| {
            configs.any(|range| {
                range.channels() == channels
                    && range.min_sample_rate() <= rate
                    && rate <= range.max_sample_rate()
            })
        })
        .unwrap_or(false);

    cpal::StreamConfig {
        channels,
        sample_rate: if rate_supported { rate } else { default.sample_rate() },
        buffer_size: cpal::BufferSize::Default,
    }
}

fn open_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut mapper: FrameMapper,
    queue: SampleQueue,
    alive: Arc<AtomicBool>,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: cpal::SizedSample + cpal::FromSample<i16>,
{
    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            mapper.fill(&mut queue.lock(), data);
        },
        move |err| {
            warn!("Audio device error: {}", err);
            alive.store(false, Ordering::Release);
        },
        None,
    )
}

/// Converts queued source frames to the device's channel layout and rate.
///
/// Rate conversion is a sample-and-hold: each device frame repeats the current
/// source frame until enough device time has passed to move to the next one.
#[derive(Debug, Clone)]
struct FrameMapper {
    source_channels: usize,
    device_channels: usize,
    /// Source frames per device frame
    step: f64,
    position: f64,
    current: Vec<i16>,
}

impl FrameMapper {
    fn new(format: AudioFormat, config: &cpal::StreamConfig) -> Self {
        let source_channels = format.channels.max(1) as usize;
        Self {
            source_channels,
            device_channels: config.channels.max(1) as usize,
            step: format.sample_rate as f64 / config.sample_rate.0.max(1) as f64,
            position: 1.0,
            current: vec![0; source_channels],
        }
    }

    fn fill<T>(&mut self, queue: &mut VecDeque<i16>, data: &mut [T])
    where
        T: cpal::Sample + cpal::FromSample<i16>,
    {
        for frame in data.chunks_mut(self.device_channels) {
            while self.position >= 1.0 {
                self.position -= 1.0;
                for slot in self.current.iter_mut() {
                    *slot = queue.pop_front().unwrap_or(0);
                }
            }
            for (channel, slot) in frame.iter_mut().enumerate() {
                *slot = T::from_sample(self.current[channel % self.source_channels]);
            }
            self.position += self.step;
        }
    }
}

struct DeviceSink {
    handle: OutputHandle,
    queue: SampleQueue,
    alive: Arc<AtomicBool>,
    max_samples: usize,
    carry: Option<u8>,
    stop: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl DeviceSink {
    fn release(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl AudioSink for DeviceSink {
    fn handle(&self) -> &OutputHandle {
        &self.handle
    }

    fn write(&mut self, pcm: &[u8]) -> SpeechResult<usize> {
        if self.stop.is_none() {
            return Err(SpeechError::AudioOutput("device already closed".to_string()));
        }

        let mut bytes = Vec::with_capacity(pcm.len() + 1);
        bytes.extend(self.carry.take());
        bytes.extend_from_slice(pcm);
        let mut pairs = bytes.chunks_exact(2);
        let samples: Vec<i16> = (&mut pairs)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        self.carry = pairs.remainder().first().copied();

        while self.queue.lock().len() >= self.max_samples {
            if !self.alive.load(Ordering::Acquire) {
                return Ok(0);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        if !self.alive.load(Ordering::Acquire) {
            return Ok(0);
        }

        self.queue.lock().extend(samples);
        Ok(pcm.len())
    }

    fn close(&mut self) -> SpeechResult<()> {
        let queued = self.queue.lock().len() * size_of::<i16>();
        let deadline =
            Instant::now() + self.handle.format.duration_of(queued) + Duration::from_millis(250);

        while self.alive.load(Ordering::Acquire)
            && !self.queue.lock().is_empty()
            && Instant::now() < deadline
        {
            std::thread::sleep(POLL_INTERVAL);
        }
        self.release();
        Ok(())
    }

    fn abort(&mut self) {
        self.queue.lock().clear();
        self.release();
    }
}

impl Drop for DeviceSink {
    fn drop(&mut self) {
        self.queue.lock().clear();
        self.release();
    }
}
