//! Audio format descriptors

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::channels::ChannelLayout;

/// Compressed bitstreams that can be passed through to a capable receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RawCodec {
    Ac3,
    Eac3,
    Dts,
    DtsHd,
    TrueHd,
    Aac,
}

impl RawCodec {
    pub fn name(self) -> &'static str {
        match self {
            RawCodec::Ac3 => "AC3",
            RawCodec::Eac3 => "EAC3",
            RawCodec::Dts => "DTS",
            RawCodec::DtsHd => "DTS-HD",
            RawCodec::TrueHd => "TrueHD",
            RawCodec::Aac => "AAC",
        }
    }
}

/// Sample representation.
///
/// `*P` variants are planar (one plane per channel), the rest interleaved.
/// `Raw` carries an encoded bitstream packed into an S16 container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataFormat {
    U8,
    S16,
    S32,
    Float,
    U8P,
    S16P,
    S32P,
    FloatP,
    Raw(RawCodec),
}

impl DataFormat {
    pub const fn is_raw(self) -> bool {
        matches!(self, DataFormat::Raw(_))
    }

    pub const fn is_planar(self) -> bool {
        matches!(
            self,
            DataFormat::U8P | DataFormat::S16P | DataFormat::S32P | DataFormat::FloatP
        )
    }

    /// Bytes per sample of a single channel.
    pub const fn bytes_per_sample(self) -> usize {
        match self {
            DataFormat::U8 | DataFormat::U8P => 1,
            DataFormat::S16 | DataFormat::S16P | DataFormat::Raw(_) => 2,
            DataFormat::S32 | DataFormat::S32P | DataFormat::Float | DataFormat::FloatP => 4,
        }
    }

    /// Storage format used by buffer pools. Raw bitstreams live in S16 packets.
    pub const fn container(self) -> DataFormat {
        match self {
            DataFormat::Raw(_) => DataFormat::S16,
            other => other,
        }
    }

    pub const fn to_planar(self) -> DataFormat {
        match self {
            DataFormat::U8 => DataFormat::U8P,
            DataFormat::S16 => DataFormat::S16P,
            DataFormat::S32 => DataFormat::S32P,
            DataFormat::Float => DataFormat::FloatP,
            other => other,
        }
    }

    pub const fn to_interleaved(self) -> DataFormat {
        match self {
            DataFormat::U8P => DataFormat::U8,
            DataFormat::S16P => DataFormat::S16,
            DataFormat::S32P => DataFormat::S32,
            DataFormat::FloatP => DataFormat::Float,
            other => other,
        }
    }

    pub const fn raw_codec(self) -> Option<RawCodec> {
        match self {
            DataFormat::Raw(codec) => Some(codec),
            _ => None,
        }
    }
}

impl fmt::Display for DataFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataFormat::U8 => f.write_str("U8"),
            DataFormat::S16 => f.write_str("S16"),
            DataFormat::S32 => f.write_str("S32"),
            DataFormat::Float => f.write_str("FLOAT"),
            DataFormat::U8P => f.write_str("U8P"),
            DataFormat::S16P => f.write_str("S16P"),
            DataFormat::S32P => f.write_str("S32P"),
            DataFormat::FloatP => f.write_str("FLOATP"),
            DataFormat::Raw(codec) => write!(f, "RAW/{}", codec.name()),
        }
    }
}

/// Stream parameters of an encoded passthrough bitstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawStreamInfo {
    pub codec: RawCodec,
    /// Sample rate of the decoded content
    pub sample_rate: u32,
    /// Channel count of the decoded content
    pub channels: u8,
}

/// The subset of a format a [`SoundPacket`](crate::SoundPacket) needs to lay out storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleConfig {
    pub format: DataFormat,
    pub channels: usize,
    pub sample_rate: u32,
}

/// Full description of an audio stream or sink configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub data_format: DataFormat,
    pub sample_rate: u32,
    pub channel_layout: ChannelLayout,
    /// Frames per period (buffer size of the pools built for this format)
    pub frames: usize,
    /// Bytes per frame across all channels
    pub frame_size: usize,
    pub stream_info: Option<RawStreamInfo>,
}

impl AudioFormat {
    /// PCM format with `frame_size` derived from the layout.
    pub fn pcm(
        data_format: DataFormat,
        sample_rate: u32,
        channel_layout: ChannelLayout,
        frames: usize,
    ) -> Self {
        let mut format = Self {
            data_format,
            sample_rate,
            channel_layout,
            frames,
            frame_size: 0,
            stream_info: None,
        };
        format.update_frame_size();
        format
    }

    /// Passthrough format: `container` is the layout of the S16 transport
    /// (2.0 for IEC 61937 framing, 7.1 for HBR codecs).
    pub fn raw(
        info: RawStreamInfo,
        sample_rate: u32,
        container: ChannelLayout,
        frames: usize,
    ) -> Self {
        let mut format = Self {
            data_format: DataFormat::Raw(info.codec),
            sample_rate,
            channel_layout: container,
            frames,
            frame_size: 0,
            stream_info: Some(info),
        };
        format.update_frame_size();
        format
    }

    pub fn channel_count(&self) -> usize {
        self.channel_layout.count()
    }

    pub fn is_raw(&self) -> bool {
        self.data_format.is_raw()
    }

    /// Recompute `frame_size` after the data format or layout changed.
    pub fn update_frame_size(&mut self) {
        self.frame_size = self.channel_count() * self.data_format.bytes_per_sample();
    }

    pub fn with_data_format(mut self, data_format: DataFormat) -> Self {
        self.data_format = data_format;
        self.update_frame_size();
        self
    }

    pub fn sample_config(&self) -> SampleConfig {
        SampleConfig {
            format: self.data_format.container(),
            channels: self.channel_count(),
            sample_rate: self.sample_rate,
        }
    }

    /// Duration in seconds of `frames` frames at this format's rate.
    pub fn duration_of(&self, frames: usize) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        frames as f64 / self.sample_rate as f64
    }

    /// Equal data format, rate and layout. Period size is ignored.
    pub fn same_stream_shape(&self, other: &AudioFormat) -> bool {
        self.data_format == other.data_format
            && self.sample_rate == other.sample_rate
            && self.channel_layout == other.channel_layout
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}Hz {} ({} frames)",
            self.data_format, self.sample_rate, self.channel_layout, self.frames
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm_frame_size() {
        let format = AudioFormat::pcm(DataFormat::S16, 48000, ChannelLayout::surround_5_1(), 4800);
        assert_eq!(format.frame_size, 12);

        let float = format.clone().with_data_format(DataFormat::FloatP);
        assert_eq!(float.frame_size, 24);
        assert_eq!(float.frames, 4800);
    }

    #[test]
    fn test_raw_uses_s16_container() {
        let info = RawStreamInfo {
            codec: RawCodec::Ac3,
            sample_rate: 48000,
            channels: 6,
        };
        let format = AudioFormat::raw(info, 48000, ChannelLayout::stereo(), 1536);
        assert!(format.is_raw());
        assert_eq!(format.frame_size, 4);
        assert_eq!(format.sample_config().format, DataFormat::S16);
    }

    #[test]
    fn test_planar_conversions() {
        assert_eq!(DataFormat::S16.to_planar(), DataFormat::S16P);
        assert_eq!(DataFormat::FloatP.to_interleaved(), DataFormat::Float);
        assert!(DataFormat::S32P.is_planar());
        assert!(!DataFormat::Raw(RawCodec::Dts).is_planar());
    }

    #[test]
    fn test_duration_of() {
        let format = AudioFormat::pcm(DataFormat::Float, 44100, ChannelLayout::stereo(), 4410);
        assert!((format.duration_of(4410) - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_display() {
        let format = AudioFormat::pcm(DataFormat::Float, 44100, ChannelLayout::stereo(), 4410);
        assert_eq!(format.to_string(), "FLOAT 44100Hz FL,FR (4410 frames)");
    }
}
