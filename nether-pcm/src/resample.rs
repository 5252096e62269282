//! Format, layout and rate conversion
//!
//! The resampler decodes input into `f32`, routes it through a
//! [`RemapMatrix`] onto the output layout and keeps the result as a backlog
//! at the input rate. Output frames are produced from the backlog with
//! linear interpolation, carrying the fractional read position between calls
//! so consecutive packets join without discontinuities.

use crate::convert::{read_frames, write_frames};
use crate::error::PcmError;
use crate::format::{AudioFormat, SampleConfig};
use crate::packet::SoundPacket;
use crate::remap::RemapMatrix;

pub struct Resampler {
    src: SampleConfig,
    dst: SampleConfig,
    matrix: RemapMatrix,
    /// Input frames advanced per output frame
    step: f64,
    /// Read position into `backlog`
    pos: f64,
    /// Remapped input awaiting rate conversion, one vector per output channel
    backlog: Vec<Vec<f32>>,
    decoded: Vec<Vec<f32>>,
    rendered: Vec<Vec<f32>>,
}

impl Resampler {
    /// Build a converter from `src` to `dst`. With `normalize`, downmix rows
    /// are scaled so they cannot clip.
    pub fn new(src: &AudioFormat, dst: &AudioFormat, normalize: bool) -> Result<Self, PcmError> {
        if src.sample_rate == 0 {
            return Err(PcmError::InvalidSampleRate(src.sample_rate));
        }
        if dst.sample_rate == 0 {
            return Err(PcmError::InvalidSampleRate(dst.sample_rate));
        }
        if src.channel_layout.is_empty() || dst.channel_layout.is_empty() {
            return Err(PcmError::EmptyLayout);
        }
        if src.is_raw() || dst.is_raw() {
            return Err(PcmError::RawConversion {
                from: src.data_format,
                to: dst.data_format,
            });
        }

        let out_channels = dst.channel_count();
        Ok(Self {
            src: src.sample_config(),
            dst: dst.sample_config(),
            matrix: RemapMatrix::new(&src.channel_layout, &dst.channel_layout, normalize),
            step: src.sample_rate as f64 / dst.sample_rate as f64,
            pos: 0.0,
            backlog: vec![Vec::new(); out_channels],
            decoded: vec![Vec::new(); src.channel_count()],
            rendered: vec![Vec::new(); out_channels],
        })
    }

    pub fn src_config(&self) -> SampleConfig {
        self.src
    }

    pub fn dst_config(&self) -> SampleConfig {
        self.dst
    }

    /// Output frames needed for `src_samples` input frames, rounded up.
    pub fn dst_sample_count(src_samples: usize, dst_rate: u32, src_rate: u32) -> usize {
        if src_rate == 0 {
            return 0;
        }
        (src_samples as u64 * dst_rate as u64).div_ceil(src_rate as u64) as usize
    }

    /// Output frames that can still be produced from the backlog.
    pub fn buffered_samples(&self) -> usize {
        let len = self.backlog.first().map_or(0, Vec::len);
        let remaining = len as f64 - self.pos;
        if remaining <= 0.0 {
            return 0;
        }
        (remaining / self.step).ceil() as usize
    }

    /// Convert into `dst`, appending at `dst.nb_samples`.
    ///
    /// `src` is `(packet, first_frame, frame_count)`; `None` drains the
    /// backlog, holding the final sample for the interpolation tail. At most
    /// `max_out` frames are produced (also bounded by free space in `dst`).
    /// Returns the number of frames written; `dst.nb_samples` is advanced.
    pub fn resample(
        &mut self,
        dst: &mut SoundPacket,
        max_out: usize,
        src: Option<(&SoundPacket, usize, usize)>,
    ) -> usize {
        let draining = src.is_none();
        if let Some((packet, offset, count)) = src {
            let count = count.min(packet.nb_samples.saturating_sub(offset));
            for channel in self.decoded.iter_mut() {
                channel.clear();
            }
            read_frames(packet, offset, count, &mut self.decoded);
            self.matrix.apply(&self.decoded, 0, count, &mut self.backlog);
        }

        let limit = max_out.min(dst.free_samples());
        let len = self.backlog.first().map_or(0, Vec::len);
        for channel in self.rendered.iter_mut() {
            channel.clear();
        }

        let mut produced = 0;
        while produced < limit {
            let index = self.pos.floor() as usize;
            if index >= len {
                break;
            }
            let frac = (self.pos - index as f64) as f32;
            let has_next = index + 1 < len;
            if frac != 0.0 && !has_next && !draining {
                break;
            }
            for (out, channel) in self.rendered.iter_mut().zip(&self.backlog) {
                let s1 = channel[index];
                let s2 = if has_next { channel[index + 1] } else { s1 };
                out.push(s1 + (s2 - s1) * frac);
            }
            produced += 1;
            self.pos += self.step;
        }

        let consumed = (self.pos.floor() as usize).min(len);
        if consumed > 0 {
            for channel in self.backlog.iter_mut() {
                channel.drain(..consumed);
            }
            self.pos -= consumed as f64;
        }
        if draining && self.backlog.first().is_none_or(Vec::is_empty) {
            self.pos = 0.0;
        }

        if produced > 0 {
            write_frames(dst, dst.nb_samples, &self.rendered, produced);
            dst.nb_samples += produced;
        }
        produced
    }

    /// Convert a whole packet in one go, draining the backlog.
    pub fn convert_all(&mut self, src: &SoundPacket) -> SoundPacket {
        let capacity =
            Self::dst_sample_count(src.nb_samples, self.dst.sample_rate, self.src.sample_rate) + 1;
        let mut out = SoundPacket::new(self.dst, capacity);
        self.resample(&mut out, capacity, Some((src, 0, src.nb_samples)));
        while out.free_samples() > 0 {
            let free = out.free_samples();
            if self.resample(&mut out, free, None) == 0 {
                break;
            }
        }
        out
    }

    /// Drop any backlog.
    pub fn reset(&mut self) {
        for channel in self.backlog.iter_mut() {
            channel.clear();
        }
        self.pos = 0.0;
    }
}

impl std::fmt::Debug for Resampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resampler")
            .field("src", &self.src)
            .field("dst", &self.dst)
            .field("step", &self.step)
            .field("buffered", &self.buffered_samples())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ChannelLayout;
    use crate::format::DataFormat;

    fn format(data_format: DataFormat, rate: u32, layout: ChannelLayout) -> AudioFormat {
        AudioFormat::pcm(data_format, rate, layout, rate as usize / 100)
    }

    fn ramp(format: &AudioFormat, frames: usize) -> SoundPacket {
        let mut packet = SoundPacket::new(format.sample_config(), frames);
        let channels = format.channel_count();
        for (i, value) in packet.plane_f32_mut(0).iter_mut().enumerate() {
            *value = (i / channels) as f32 / frames as f32;
        }
        packet.nb_samples = frames;
        packet
    }

    #[test]
    fn test_equal_rate_emits_every_frame() {
        let src = format(DataFormat::Float, 48000, ChannelLayout::stereo());
        let dst = format(DataFormat::S16, 48000, ChannelLayout::stereo());
        let mut resampler = Resampler::new(&src, &dst, false).unwrap();

        let input = ramp(&src, 480);
        let mut out = SoundPacket::new(dst.sample_config(), 480);
        let produced = resampler.resample(&mut out, 480, Some((&input, 0, 480)));
        assert_eq!(produced, 480);
        assert_eq!(out.nb_samples, 480);
        assert_eq!(resampler.buffered_samples(), 0);
    }

    #[test]
    fn test_output_bounded_by_max_out_keeps_backlog() {
        let src = format(DataFormat::Float, 48000, ChannelLayout::stereo());
        let mut resampler = Resampler::new(&src, &src, false).unwrap();

        let input = ramp(&src, 300);
        let mut out = SoundPacket::new(src.sample_config(), 480);
        assert_eq!(resampler.resample(&mut out, 100, Some((&input, 0, 300))), 100);
        assert_eq!(resampler.buffered_samples(), 200);
        assert_eq!(resampler.resample(&mut out, 480, None), 200);
        assert_eq!(resampler.buffered_samples(), 0);
    }

    #[test]
    fn test_downsample_frame_count() {
        let src = format(DataFormat::Float, 48000, ChannelLayout::stereo());
        let dst = format(DataFormat::Float, 44100, ChannelLayout::stereo());
        let mut resampler = Resampler::new(&src, &dst, false).unwrap();

        let input = ramp(&src, 4800);
        let out = resampler.convert_all(&input);
        let expected = Resampler::dst_sample_count(4800, 44100, 48000);
        assert_eq!(expected, 4410);
        assert!(out.nb_samples.abs_diff(expected) <= 1);
        assert_eq!(resampler.buffered_samples(), 0);
    }

    #[test]
    fn test_interpolates_between_samples() {
        let src = format(DataFormat::Float, 1000, ChannelLayout::mono());
        let dst = format(DataFormat::Float, 2000, ChannelLayout::mono());
        let mut resampler = Resampler::new(&src, &dst, false).unwrap();

        let mut input = SoundPacket::new(src.sample_config(), 2);
        input.plane_f32_mut(0).copy_from_slice(&[0.0, 1.0]);
        input.nb_samples = 2;

        let out = resampler.convert_all(&input);
        assert_eq!(&out.plane_f32(0)[..3], &[0.0, 0.5, 1.0]);
    }

    #[test]
    fn test_remaps_layout() {
        let src = format(DataFormat::Float, 48000, ChannelLayout::stereo());
        let dst = format(DataFormat::FloatP, 48000, ChannelLayout::surround_5_1());
        let mut resampler = Resampler::new(&src, &dst, false).unwrap();

        let mut input = SoundPacket::new(src.sample_config(), 1);
        input.plane_f32_mut(0).copy_from_slice(&[0.25, -0.25]);
        input.nb_samples = 1;

        let out = resampler.convert_all(&input);
        assert_eq!(out.nb_samples, 1);
        assert_eq!(out.plane_f32(0)[0], 0.25);
        assert_eq!(out.plane_f32(1)[0], -0.25);
        assert_eq!(out.plane_f32(2)[0], 0.0);
    }

    #[test]
    fn test_rejects_raw() {
        let src = format(DataFormat::Raw(crate::RawCodec::Ac3), 48000, ChannelLayout::stereo());
        let dst = format(DataFormat::Float, 48000, ChannelLayout::stereo());
        assert!(matches!(
            Resampler::new(&src, &dst, false),
            Err(PcmError::RawConversion { .. })
        ));
    }
}
