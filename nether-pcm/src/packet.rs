//! Sample storage

use bytemuck::Pod;

use crate::format::{DataFormat, SampleConfig};

/// Fixed-capacity sample storage for one period of audio.
///
/// Planes are backed by `u32` words so they can be reinterpreted as any
/// supported sample type without alignment faults.
#[derive(Debug, Clone)]
pub struct SoundPacket {
    config: SampleConfig,
    planes: usize,
    bytes_per_sample: usize,
    /// Bytes per plane at full capacity
    linesize: usize,
    max_nb_samples: usize,
    /// Frames currently filled
    pub nb_samples: usize,
    data: Vec<Vec<u32>>,
}

impl SoundPacket {
    pub fn new(config: SampleConfig, max_nb_samples: usize) -> Self {
        let planar = config.format.is_planar();
        let planes = if planar { config.channels.max(1) } else { 1 };
        let bytes_per_sample = config.format.bytes_per_sample();
        let plane_channels = if planar { 1 } else { config.channels };
        let linesize = max_nb_samples * bytes_per_sample * plane_channels;
        let words = linesize.div_ceil(4);

        Self {
            config,
            planes,
            bytes_per_sample,
            linesize,
            max_nb_samples,
            nb_samples: 0,
            data: (0..planes).map(|_| vec![0u32; words]).collect(),
        }
    }

    pub fn config(&self) -> SampleConfig {
        self.config
    }

    pub fn format(&self) -> DataFormat {
        self.config.format
    }

    pub fn channels(&self) -> usize {
        self.config.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate
    }

    pub fn planes(&self) -> usize {
        self.planes
    }

    pub fn bytes_per_sample(&self) -> usize {
        self.bytes_per_sample
    }

    pub fn linesize(&self) -> usize {
        self.linesize
    }

    pub fn max_nb_samples(&self) -> usize {
        self.max_nb_samples
    }

    pub fn free_samples(&self) -> usize {
        self.max_nb_samples - self.nb_samples
    }

    pub fn is_full(&self) -> bool {
        self.nb_samples >= self.max_nb_samples
    }

    /// Channels stored in each plane (all of them when interleaved).
    pub fn plane_channels(&self) -> usize {
        if self.planes == 1 { self.config.channels } else { 1 }
    }

    /// Bytes per frame within one plane.
    pub fn plane_frame_bytes(&self) -> usize {
        self.bytes_per_sample * self.plane_channels()
    }

    pub fn plane_bytes(&self, plane: usize) -> &[u8] {
        &bytemuck::cast_slice::<u32, u8>(&self.data[plane])[..self.linesize]
    }

    pub fn plane_bytes_mut(&mut self, plane: usize) -> &mut [u8] {
        let linesize = self.linesize;
        &mut bytemuck::cast_slice_mut::<u32, u8>(&mut self.data[plane])[..linesize]
    }

    /// Plane reinterpreted as `T`, trimmed to capacity.
    pub fn plane<T: Pod>(&self, plane: usize) -> &[T] {
        let len = self.linesize / std::mem::size_of::<T>();
        &bytemuck::cast_slice::<u32, T>(&self.data[plane])[..len]
    }

    pub fn plane_mut<T: Pod>(&mut self, plane: usize) -> &mut [T] {
        let len = self.linesize / std::mem::size_of::<T>();
        &mut bytemuck::cast_slice_mut::<u32, T>(&mut self.data[plane])[..len]
    }

    /// Float view of a plane. Only meaningful for `Float`/`FloatP` packets.
    pub fn plane_f32(&self, plane: usize) -> &[f32] {
        debug_assert!(matches!(
            self.config.format,
            DataFormat::Float | DataFormat::FloatP
        ));
        self.plane::<f32>(plane)
    }

    pub fn plane_f32_mut(&mut self, plane: usize) -> &mut [f32] {
        debug_assert!(matches!(
            self.config.format,
            DataFormat::Float | DataFormat::FloatP
        ));
        self.plane_mut::<f32>(plane)
    }

    /// Samples in use per plane (`nb_samples` times channels per plane).
    pub fn used_values(&self) -> usize {
        self.nb_samples * self.plane_channels()
    }

    /// Zero every plane (0x80 for unsigned 8-bit) and mark the packet full.
    pub fn fill_silence(&mut self) {
        let unsigned = matches!(self.config.format, DataFormat::U8 | DataFormat::U8P);
        for plane in 0..self.planes {
            if unsigned {
                self.plane_bytes_mut(plane).fill(0x80);
            } else {
                self.data[plane].fill(0);
            }
        }
        self.nb_samples = self.max_nb_samples;
    }

    /// Silence the unused tail `[nb_samples, max_nb_samples)` and mark the packet full.
    pub fn pad_with_silence(&mut self) {
        let unsigned = matches!(self.config.format, DataFormat::U8 | DataFormat::U8P);
        let start = self.nb_samples * self.plane_frame_bytes();
        let value = if unsigned { 0x80 } else { 0 };
        for plane in 0..self.planes {
            self.plane_bytes_mut(plane)[start..].fill(value);
        }
        self.nb_samples = self.max_nb_samples;
    }

    /// Copy up to `frames` frames from `source` planes, appending at `nb_samples`.
    ///
    /// `source` must hold one slice per plane laid out in this packet's
    /// format. Returns the number of frames copied, bounded by free space and
    /// by the shortest source plane.
    pub fn append_bytes(&mut self, source: &[&[u8]], frames: usize) -> usize {
        if source.len() < self.planes {
            return 0;
        }
        let frame_bytes = self.plane_frame_bytes();
        let available = source
            .iter()
            .take(self.planes)
            .map(|plane| plane.len() / frame_bytes.max(1))
            .min()
            .unwrap_or(0);
        let count = frames.min(self.free_samples()).min(available);
        if count == 0 {
            return 0;
        }

        let start = self.nb_samples * frame_bytes;
        let len = count * frame_bytes;
        for (plane, src) in source.iter().enumerate().take(self.planes) {
            self.plane_bytes_mut(plane)[start..start + len].copy_from_slice(&src[..len]);
        }
        self.nb_samples += count;
        count
    }

    /// Append `count` frames of `other`, starting at frame `offset`. Both
    /// packets must share a sample configuration.
    pub fn append_frames(&mut self, other: &SoundPacket, offset: usize, count: usize) -> usize {
        if other.config != self.config {
            return 0;
        }
        let count = count
            .min(self.free_samples())
            .min(other.nb_samples.saturating_sub(offset));
        let frame_bytes = self.plane_frame_bytes();
        let dst_start = self.nb_samples * frame_bytes;
        let src_start = offset * frame_bytes;
        let len = count * frame_bytes;
        for plane in 0..self.planes {
            let src = &other.plane_bytes(plane)[src_start..src_start + len];
            self.plane_bytes_mut(plane)[dst_start..dst_start + len].copy_from_slice(src);
        }
        self.nb_samples += count;
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(format: DataFormat, channels: usize) -> SampleConfig {
        SampleConfig {
            format,
            channels,
            sample_rate: 48000,
        }
    }

    #[test]
    fn test_interleaved_layout() {
        let packet = SoundPacket::new(config(DataFormat::S16, 2), 100);
        assert_eq!(packet.planes(), 1);
        assert_eq!(packet.linesize(), 400);
        assert_eq!(packet.plane::<i16>(0).len(), 200);
    }

    #[test]
    fn test_planar_layout() {
        let packet = SoundPacket::new(config(DataFormat::FloatP, 6), 480);
        assert_eq!(packet.planes(), 6);
        assert_eq!(packet.linesize(), 480 * 4);
        assert_eq!(packet.plane_f32(5).len(), 480);
    }

    #[test]
    fn test_odd_u8_linesize_is_word_backed() {
        let packet = SoundPacket::new(config(DataFormat::U8, 1), 3);
        assert_eq!(packet.linesize(), 3);
        assert_eq!(packet.plane_bytes(0).len(), 3);
    }

    #[test]
    fn test_fill_silence_u8_uses_midpoint() {
        let mut packet = SoundPacket::new(config(DataFormat::U8, 2), 4);
        packet.fill_silence();
        assert!(packet.is_full());
        assert!(packet.plane_bytes(0).iter().all(|&b| b == 0x80));
    }

    #[test]
    fn test_append_bytes_bounded_by_capacity() {
        let mut packet = SoundPacket::new(config(DataFormat::S16, 2), 4);
        let data = [1u8; 4 * 6];
        let copied = packet.append_bytes(&[&data], 6);
        assert_eq!(copied, 4);
        assert!(packet.is_full());
        assert_eq!(packet.append_bytes(&[&data], 1), 0);
    }

    #[test]
    fn test_append_frames_copies_at_cursor() {
        let mut src = SoundPacket::new(config(DataFormat::Float, 1), 4);
        src.plane_f32_mut(0).copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        src.nb_samples = 4;

        let mut dst = SoundPacket::new(config(DataFormat::Float, 1), 4);
        dst.nb_samples = 1;
        assert_eq!(dst.append_frames(&src, 2, 10), 2);
        assert_eq!(dst.nb_samples, 3);
        assert_eq!(&dst.plane_f32(0)[1..3], &[3.0, 4.0]);
    }

    #[test]
    fn test_pad_with_silence() {
        let mut packet = SoundPacket::new(config(DataFormat::Float, 1), 4);
        packet.plane_f32_mut(0).fill(0.25);
        packet.nb_samples = 1;
        packet.pad_with_silence();
        assert_eq!(packet.plane_f32(0), &[0.25, 0.0, 0.0, 0.0]);
        assert!(packet.is_full());
    }
}
