use std::thread;
use std::time::{Duration, Instant};

use nether_pcm::{AudioFormat, SoundPacket};

use super::AudioSink;
use crate::error::SinkError;

/// Audio the null sink pretends the device holds when pacing.
const DEVICE_BUFFER: f64 = 0.1;

/// Discards everything. With `realtime`, consumes at the configured rate so
/// the pipeline runs at playback speed without hardware.
#[derive(Debug)]
pub struct NullSink {
    realtime: bool,
    format: Option<AudioFormat>,
    started: Instant,
    frames_written: u64,
}

impl NullSink {
    pub fn new() -> Self {
        Self {
            realtime: false,
            format: None,
            started: Instant::now(),
            frames_written: 0,
        }
    }

    pub fn realtime() -> Self {
        Self {
            realtime: true,
            ..Self::new()
        }
    }

    fn written_time(&self) -> f64 {
        match &self.format {
            Some(format) => format.duration_of(self.frames_written as usize),
            None => 0.0,
        }
    }

    fn queued_time(&self) -> f64 {
        (self.written_time() - self.started.elapsed().as_secs_f64()).max(0.0)
    }
}

impl Default for NullSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSink for NullSink {
    fn name(&self) -> &str {
        "null"
    }

    fn initialize(&mut self, format: &AudioFormat, _device: &str) -> Result<AudioFormat, SinkError> {
        if format.sample_rate == 0 || format.channel_layout.is_empty() {
            return Err(SinkError::Unsupported(format.to_string()));
        }
        let mut actual = format.clone();
        if actual.frames == 0 {
            actual.frames = (actual.sample_rate / 100) as usize;
        }
        self.format = Some(actual.clone());
        self.started = Instant::now();
        self.frames_written = 0;
        Ok(actual)
    }

    fn add_packets(&mut self, packet: &SoundPacket, offset: usize) -> Result<usize, SinkError> {
        if self.format.is_none() {
            return Err(SinkError::NotInitialized);
        }
        if self.realtime {
            let ahead = self.queued_time() - DEVICE_BUFFER;
            if ahead > 0.0 {
                thread::sleep(Duration::from_secs_f64(ahead));
            }
        }
        let frames = packet.nb_samples.saturating_sub(offset);
        self.frames_written += frames as u64;
        Ok(frames)
    }

    fn delay(&self) -> f64 {
        if self.realtime { self.queued_time() } else { 0.0 }
    }

    fn drain(&mut self) -> Result<(), SinkError> {
        if self.realtime {
            thread::sleep(Duration::from_secs_f64(self.queued_time()));
        }
        Ok(())
    }

    fn deinitialize(&mut self) {
        self.format = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nether_pcm::{ChannelLayout, DataFormat};

    #[test]
    fn test_null_sink_accepts_everything() {
        let mut sink = NullSink::new();
        let format = AudioFormat::pcm(DataFormat::S16, 44100, ChannelLayout::stereo(), 0);
        let actual = sink.initialize(&format, "default").unwrap();
        assert_eq!(actual.frames, 441);

        let mut packet = SoundPacket::new(actual.sample_config(), actual.frames);
        packet.nb_samples = 441;
        assert_eq!(sink.add_packets(&packet, 41).unwrap(), 400);
        assert_eq!(sink.delay(), 0.0);
        sink.deinitialize();
        assert_eq!(
            sink.add_packets(&packet, 0),
            Err(SinkError::NotInitialized)
        );
    }

    #[test]
    fn test_realtime_reports_delay() {
        let mut sink = NullSink::realtime();
        let format = AudioFormat::pcm(DataFormat::Float, 48000, ChannelLayout::stereo(), 4800);
        sink.initialize(&format, "default").unwrap();
        let mut packet = SoundPacket::new(format.sample_config(), 4800);
        packet.nb_samples = 4800;
        sink.add_packets(&packet, 0).unwrap();
        let delay = sink.delay();
        assert!(delay > 0.0 && delay <= 0.1);
    }
}
