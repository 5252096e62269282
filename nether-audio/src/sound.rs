//! Fully decoded sound clips
//!
//! A [`Sound`] is decoded up front and lives on the engine thread once
//! registered. Playing it never clones the samples: the engine tracks each
//! playback as a cursor into the converted copy, which is rebuilt whenever
//! the mixing format changes.

use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use nether_pcm::{AudioFormat, ChannelLayout, DataFormat, PcmError, Resampler, SampleConfig, SoundPacket};
use tracing::debug;

use crate::error::SoundError;
use crate::volume::SharedVolume;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SoundId(u32);

impl SoundId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU32 = AtomicU32::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug)]
pub struct Sound {
    id: SoundId,
    format: AudioFormat,
    data: SoundPacket,
    converted: Option<(AudioFormat, SoundPacket)>,
    volume: SharedVolume,
}

impl Sound {
    /// Wrap an already decoded packet.
    pub fn from_packet(data: SoundPacket, layout: ChannelLayout) -> Result<Self, SoundError> {
        if data.nb_samples == 0 {
            return Err(SoundError::Empty);
        }
        if layout.count() != data.channels() {
            return Err(SoundError::UnsupportedChannels(data.channels() as u16));
        }
        let format = AudioFormat::pcm(data.format(), data.sample_rate(), layout, data.nb_samples);
        Ok(Self {
            id: SoundId::next(),
            format,
            data,
            converted: None,
            volume: SharedVolume::default(),
        })
    }

    pub fn from_wav(path: &Path) -> Result<Self, SoundError> {
        let reader = hound::WavReader::open(path)?;
        Self::decode_wav(reader)
    }

    pub fn from_wav_reader<R: Read>(reader: R) -> Result<Self, SoundError> {
        Self::decode_wav(hound::WavReader::new(reader)?)
    }

    fn decode_wav<R: Read>(mut reader: hound::WavReader<R>) -> Result<Self, SoundError> {
        let spec = reader.spec();
        let layout = ChannelLayout::for_count(spec.channels as usize)
            .ok_or(SoundError::UnsupportedChannels(spec.channels))?;
        let channels = spec.channels as usize;

        let packet = match (spec.sample_format, spec.bits_per_sample) {
            (hound::SampleFormat::Float, 32) => {
                let samples = reader.samples::<f32>().collect::<Result<Vec<_>, _>>()?;
                fill_packet(DataFormat::Float, channels, spec.sample_rate, &samples)
            }
            (hound::SampleFormat::Int, 8) => {
                let samples = reader
                    .samples::<i8>()
                    .map(|s| s.map(|s| (s as i16) << 8))
                    .collect::<Result<Vec<_>, _>>()?;
                fill_packet(DataFormat::S16, channels, spec.sample_rate, &samples)
            }
            (hound::SampleFormat::Int, 16) => {
                let samples = reader.samples::<i16>().collect::<Result<Vec<_>, _>>()?;
                fill_packet(DataFormat::S16, channels, spec.sample_rate, &samples)
            }
            (hound::SampleFormat::Int, bits @ (24 | 32)) => {
                let shift = 32 - bits;
                let samples = reader
                    .samples::<i32>()
                    .map(|s| s.map(|s| s << shift))
                    .collect::<Result<Vec<_>, _>>()?;
                fill_packet(DataFormat::S32, channels, spec.sample_rate, &samples)
            }
            (hound::SampleFormat::Float, bits) => {
                return Err(SoundError::UnsupportedFormat { bits, kind: "float" });
            }
            (hound::SampleFormat::Int, bits) => {
                return Err(SoundError::UnsupportedFormat { bits, kind: "int" });
            }
        };

        let sound = Self::from_packet(packet, layout)?;
        debug!(
            "Sound::decode_wav - {} ({:.2}s)",
            sound.format,
            sound.duration()
        );
        Ok(sound)
    }

    pub fn id(&self) -> SoundId {
        self.id
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    pub fn frames(&self) -> usize {
        self.data.nb_samples
    }

    pub fn duration(&self) -> f64 {
        self.format.duration_of(self.data.nb_samples)
    }

    pub fn volume(&self) -> f32 {
        self.volume.get()
    }

    pub fn set_volume(&self, volume: f32) {
        self.volume.set(volume);
    }

    pub(crate) fn shared_volume(&self) -> SharedVolume {
        self.volume.clone()
    }

    /// True if a converted copy for `target`'s rate, layout and sample type
    /// is ready.
    pub fn is_converted_to(&self, target: &AudioFormat) -> bool {
        self.converted
            .as_ref()
            .is_some_and(|(format, _)| format.same_stream_shape(target))
    }

    /// Converted samples, if [`convert`](Self::convert) ran for the current
    /// mixing format.
    pub fn converted(&self) -> Option<&SoundPacket> {
        self.converted.as_ref().map(|(_, packet)| packet)
    }

    /// Resample the original data into `target`'s shape.
    pub fn convert(&mut self, target: &AudioFormat) -> Result<(), PcmError> {
        if self.is_converted_to(target) {
            return Ok(());
        }
        let mut resampler = Resampler::new(&self.format, target, true)?;
        let packet = resampler.convert_all(&self.data);
        let mut format = target.clone();
        format.frames = packet.nb_samples;
        self.converted = Some((format, packet));
        Ok(())
    }
}

fn fill_packet<T: bytemuck::Pod>(
    format: DataFormat,
    channels: usize,
    sample_rate: u32,
    samples: &[T],
) -> SoundPacket {
    let frames = samples.len() / channels.max(1);
    let config = SampleConfig {
        format,
        channels,
        sample_rate,
    };
    let mut packet = SoundPacket::new(config, frames);
    let used = frames * channels;
    packet.plane_mut::<T>(0)[..used].copy_from_slice(&samples[..used]);
    packet.nb_samples = frames;
    packet
}

/// Caller-side reference to a registered sound.
#[derive(Debug, Clone)]
pub struct SoundHandle {
    id: SoundId,
    volume: SharedVolume,
    duration: f64,
}

impl SoundHandle {
    pub(crate) fn new(sound: &Sound) -> Self {
        Self {
            id: sound.id,
            volume: sound.shared_volume(),
            duration: sound.duration(),
        }
    }

    pub fn id(&self) -> SoundId {
        self.id
    }

    pub fn duration(&self) -> f64 {
        self.duration
    }

    pub fn volume(&self) -> f32 {
        self.volume.get()
    }

    pub fn set_volume(&self, volume: f32) {
        self.volume.set(volume);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn wav_bytes(spec: hound::WavSpec, write: impl FnOnce(&mut hound::WavWriter<&mut Cursor<Vec<u8>>>)) -> Vec<u8> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
            write(&mut writer);
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }

    #[test]
    fn test_decode_s16_stereo() {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 22050,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let bytes = wav_bytes(spec, |w| {
            for i in 0..100i16 {
                w.write_sample(i).unwrap();
                w.write_sample(-i).unwrap();
            }
        });
        let sound = Sound::from_wav_reader(Cursor::new(bytes)).unwrap();
        assert_eq!(sound.frames(), 100);
        assert_eq!(sound.format().data_format, DataFormat::S16);
        assert_eq!(sound.format().channel_layout, ChannelLayout::stereo());
        assert!((sound.duration() - 100.0 / 22050.0).abs() < 1e-9);
    }

    #[test]
    fn test_decode_float_mono() {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 48000,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let bytes = wav_bytes(spec, |w| {
            for _ in 0..480 {
                w.write_sample(0.5f32).unwrap();
            }
        });
        let sound = Sound::from_wav_reader(Cursor::new(bytes)).unwrap();
        assert_eq!(sound.format().data_format, DataFormat::Float);
        assert_eq!(sound.format().channel_layout, ChannelLayout::mono());
    }

    #[test]
    fn test_empty_wav_rejected() {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 44100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let bytes = wav_bytes(spec, |_| {});
        assert!(matches!(
            Sound::from_wav_reader(Cursor::new(bytes)),
            Err(SoundError::Empty)
        ));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Sound::from_wav(&dir.path().join("missing.wav")).is_err());
    }

    #[test]
    fn test_convert_to_mixing_format() {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 48000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let bytes = wav_bytes(spec, |w| {
            for _ in 0..480 {
                w.write_sample(16384i16).unwrap();
            }
        });
        let mut sound = Sound::from_wav_reader(Cursor::new(bytes)).unwrap();
        let target = AudioFormat::pcm(DataFormat::Float, 48000, ChannelLayout::stereo(), 480);
        assert!(!sound.is_converted_to(&target));

        sound.convert(&target).unwrap();
        assert!(sound.is_converted_to(&target));
        let converted = sound.converted().unwrap();
        assert_eq!(converted.nb_samples, 480);
        assert_eq!(converted.channels(), 2);
        // Mono centre feeds both fronts at unity
        assert!((converted.plane_f32(0)[0] - 0.5).abs() < 1e-3);
        assert!((converted.plane_f32(0)[1] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_handle_shares_volume() {
        let mut packet = SoundPacket::new(
            SampleConfig {
                format: DataFormat::Float,
                channels: 2,
                sample_rate: 44100,
            },
            10,
        );
        packet.nb_samples = 10;
        let sound = Sound::from_packet(packet, ChannelLayout::stereo()).unwrap();
        let handle = SoundHandle::new(&sound);
        handle.set_volume(0.3);
        assert_eq!(sound.volume(), 0.3);
        assert_eq!(handle.id(), sound.id());
    }
}
