//! Hardware output through cpal and a ring buffer
//!
//! `cpal::Stream` cannot leave the thread that built it, so each open
//! device gets its own small thread that owns the stream and parks until
//! the sink is deinitialized. The sink thread only touches the ring
//! producer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use nether_pcm::{AudioFormat, ChannelLayout, DataFormat, SoundPacket};
use ringbuf::{
    HeapProd, HeapRb,
    traits::{Consumer, Observer, Producer, Split},
};
use tracing::{debug, error, info};

use super::AudioSink;
use crate::error::SinkError;

/// Ring buffer length in seconds
const RING_SECONDS: f64 = 0.1;
/// Period handed to the engine, in seconds
const PERIOD_SECONDS: f64 = 0.01;

/// Names of the default host's output devices.
pub fn output_devices() -> Vec<String> {
    let host = cpal::default_host();
    match host.output_devices() {
        Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
        Err(e) => {
            error!("Failed to enumerate output devices: {}", e);
            Vec::new()
        }
    }
}

struct OpenDevice {
    producer: HeapProd<f32>,
    format: AudioFormat,
    channels: usize,
    lost: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl OpenDevice {
    fn close(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

#[derive(Default)]
pub struct CpalSink {
    open: Option<OpenDevice>,
}

impl CpalSink {
    pub fn new() -> Self {
        Self::default()
    }
}

fn find_device(host: &cpal::Host, name: &str) -> Result<cpal::Device, SinkError> {
    if name.is_empty() || name == "default" {
        return host
            .default_output_device()
            .ok_or_else(|| SinkError::DeviceNotFound("default".into()));
    }
    let devices = host
        .output_devices()
        .map_err(|e| SinkError::Open(e.to_string()))?;
    for device in devices {
        if device.name().ok().as_deref() == Some(name) {
            return Ok(device);
        }
    }
    Err(SinkError::DeviceNotFound(name.into()))
}

/// Build and start the stream on the calling thread.
fn build_stream(
    device: &cpal::Device,
    config: cpal::SupportedStreamConfig,
    mut consumer: ringbuf::HeapCons<f32>,
    lost: Arc<AtomicBool>,
) -> Result<cpal::Stream, SinkError> {
    let on_error = move |err: cpal::StreamError| {
        error!("Audio stream error: {}", err);
        if matches!(err, cpal::StreamError::DeviceNotAvailable) {
            lost.store(true, Ordering::Release);
        }
    };

    let stream = match config.sample_format() {
        cpal::SampleFormat::F32 => {
            let config = config.into();
            device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let popped = consumer.pop_slice(data);
                    data[popped..].fill(0.0);
                },
                on_error,
                None,
            )
        }
        cpal::SampleFormat::I16 => {
            let config = config.into();
            let mut temp: Vec<f32> = vec![0.0; 4096];
            device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    if temp.len() < data.len() {
                        temp.resize(data.len(), 0.0);
                    }
                    let popped = consumer.pop_slice(&mut temp[..data.len()]);
                    for (out, &f) in data.iter_mut().zip(&temp[..popped]) {
                        *out = (f * 32767.0).clamp(-32768.0, 32767.0) as i16;
                    }
                    data[popped..].fill(0);
                },
                on_error,
                None,
            )
        }
        cpal::SampleFormat::U16 => {
            let config = config.into();
            let mut temp: Vec<f32> = vec![0.0; 4096];
            device.build_output_stream(
                &config,
                move |data: &mut [u16], _: &cpal::OutputCallbackInfo| {
                    if temp.len() < data.len() {
                        temp.resize(data.len(), 0.0);
                    }
                    let popped = consumer.pop_slice(&mut temp[..data.len()]);
                    for (out, &f) in data.iter_mut().zip(&temp[..popped]) {
                        *out = (f * 32767.0 + 32768.0).clamp(0.0, 65535.0) as u16;
                    }
                    data[popped..].fill(32768);
                },
                on_error,
                None,
            )
        }
        other => {
            return Err(SinkError::Unsupported(format!(
                "device sample format {:?}",
                other
            )));
        }
    }
    .map_err(|e| SinkError::Open(e.to_string()))?;

    stream.play().map_err(|e| SinkError::Open(e.to_string()))?;
    Ok(stream)
}

impl AudioSink for CpalSink {
    fn name(&self) -> &str {
        "cpal"
    }

    fn initialize(&mut self, format: &AudioFormat, device: &str) -> Result<AudioFormat, SinkError> {
        self.deinitialize();
        if format.is_raw() {
            return Err(SinkError::Unsupported(format!(
                "passthrough {} on a PCM device",
                format.data_format
            )));
        }

        let host = cpal::default_host();
        let device = find_device(&host, device)?;
        let config = device
            .default_output_config()
            .map_err(|e| SinkError::Open(e.to_string()))?;
        let sample_rate = config.sample_rate().0;
        let channels = config.channels() as usize;
        let layout = ChannelLayout::for_count(channels).unwrap_or_else(ChannelLayout::stereo);

        let capacity = ((sample_rate as f64 * RING_SECONDS) as usize).max(1) * channels;
        let (producer, consumer) = HeapRb::<f32>::new(capacity).split();
        let lost = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));

        let (ready_tx, ready_rx) = mpsc::channel();
        let thread_lost = Arc::clone(&lost);
        let thread_stop = Arc::clone(&stop);
        let thread = thread::Builder::new()
            .name("audio-cpal".into())
            .spawn(move || {
                let stream = match build_stream(&device, config, consumer, thread_lost) {
                    Ok(stream) => {
                        let _ = ready_tx.send(Ok(()));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                while !thread_stop.load(Ordering::Acquire) {
                    thread::park();
                }
                drop(stream);
                debug!("Audio stream stopped");
            })
            .map_err(|e| SinkError::Open(e.to_string()))?;

        let mut open = OpenDevice {
            producer,
            format: AudioFormat::pcm(
                DataFormat::Float,
                sample_rate,
                layout,
                ((sample_rate as f64 * PERIOD_SECONDS) as usize).max(1),
            ),
            channels,
            lost,
            stop,
            thread: Some(thread),
        };

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                open.close();
                return Err(e);
            }
            Err(_) => {
                open.close();
                return Err(SinkError::Open("stream thread exited".into()));
            }
        }

        info!("Audio stream started: {}", open.format);
        let actual = open.format.clone();
        self.open = Some(open);
        Ok(actual)
    }

    fn add_packets(&mut self, packet: &SoundPacket, offset: usize) -> Result<usize, SinkError> {
        let open = self.open.as_mut().ok_or(SinkError::NotInitialized)?;
        if open.lost.load(Ordering::Acquire) {
            return Err(SinkError::ConfigLost);
        }
        let channels = open.channels;
        let remaining = packet.nb_samples.saturating_sub(offset);
        let frames = remaining.min(open.producer.vacant_len() / channels);
        if frames == 0 {
            return Ok(0);
        }
        let start = offset * channels;
        let samples = &packet.plane_f32(0)[start..start + frames * channels];
        let pushed = open.producer.push_slice(samples);
        Ok(pushed / channels)
    }

    fn delay(&self) -> f64 {
        match &self.open {
            Some(open) => {
                let frames = open.producer.occupied_len() / open.channels;
                open.format.duration_of(frames)
            }
            None => 0.0,
        }
    }

    fn drain(&mut self) -> Result<(), SinkError> {
        let Some(open) = self.open.as_ref() else {
            return Ok(());
        };
        let deadline = Instant::now() + Duration::from_secs_f64(RING_SECONDS * 4.0);
        while !open.producer.is_empty() {
            if open.lost.load(Ordering::Acquire) {
                return Err(SinkError::ConfigLost);
            }
            if Instant::now() >= deadline {
                return Err(SinkError::Drain("device stopped consuming".into()));
            }
            thread::sleep(Duration::from_millis(2));
        }
        Ok(())
    }

    fn deinitialize(&mut self) {
        if let Some(mut open) = self.open.take() {
            open.close();
        }
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.deinitialize();
    }
}
