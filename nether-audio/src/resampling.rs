//! Buffer pool with an attached format converter
//!
//! Input buffers (owned by other pools) are queued on `input`, converted into
//! this pool's own buffers and published on `output`. When the input and
//! output formats match, buffers pass straight through without conversion.

use std::collections::VecDeque;

use nether_pcm::{AudioFormat, Resampler};
use tracing::{debug, error};

use crate::buffer::{BufferPool, SampleBuffer};

pub struct ResamplingBufferPool {
    pool: BufferPool,
    input_format: AudioFormat,
    resampler: Option<Resampler>,
    /// Buffers awaiting conversion
    pub input: VecDeque<SampleBuffer>,
    /// Converted buffers ready for consumption
    pub output: VecDeque<SampleBuffer>,
    /// Partially filled output buffer
    proc_sample: Option<SampleBuffer>,
    fill_packets: bool,
    drain: bool,
    change_ratio: bool,
    resample_ratio: f64,
    /// Rate the converter currently produces
    out_rate: u32,
    normalize: bool,
}

impl ResamplingBufferPool {
    pub fn new(input_format: AudioFormat, output_format: AudioFormat) -> Self {
        Self {
            pool: BufferPool::new(output_format),
            input_format,
            resampler: None,
            input: VecDeque::new(),
            output: VecDeque::new(),
            proc_sample: None,
            fill_packets: false,
            drain: false,
            change_ratio: false,
            resample_ratio: 1.0,
            out_rate: 0,
            normalize: false,
        }
    }

    /// Allocate output buffers and, if the formats differ, the converter.
    /// `normalize` keeps downmixes from clipping.
    pub fn create(&mut self, total_time_ms: u32, normalize: bool) {
        self.pool.create(total_time_ms);
        self.normalize = normalize;
        self.out_rate = self.pool.format().sample_rate;
        if !self.input_format.same_stream_shape(self.pool.format()) {
            self.resampler = self.build_resampler(self.pool.format().sample_rate);
        }
    }

    fn build_resampler(&self, out_rate: u32) -> Option<Resampler> {
        let mut target = self.pool.format().clone();
        target.sample_rate = out_rate;
        match Resampler::new(&self.input_format, &target, self.normalize) {
            Ok(resampler) => Some(resampler),
            Err(e) => {
                error!(
                    "ResamplingBufferPool - cannot convert {} to {}: {}",
                    self.input_format, target, e
                );
                None
            }
        }
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn format(&self) -> &AudioFormat {
        self.pool.format()
    }

    pub fn input_format(&self) -> &AudioFormat {
        &self.input_format
    }

    pub fn has_resampler(&self) -> bool {
        self.resampler.is_some()
    }

    pub fn set_fill_packets(&mut self, fill: bool) {
        self.fill_packets = fill;
    }

    pub fn fill_packets(&self) -> bool {
        self.fill_packets
    }

    pub fn set_drain(&mut self, drain: bool) {
        self.drain = drain;
    }

    pub fn is_draining(&self) -> bool {
        self.drain
    }

    /// Request a new rate ratio. Applied once pending output is flushed.
    pub fn set_resample_ratio(&mut self, ratio: f64) {
        if ratio > 0.0 && ratio != self.resample_ratio {
            self.resample_ratio = ratio;
            self.change_ratio = true;
        }
    }

    pub fn resample_ratio(&self) -> f64 {
        self.resample_ratio
    }

    pub fn has_partial(&self) -> bool {
        self.proc_sample.is_some()
    }

    /// Return a buffer to this pool, or queue it on `recycle` if another
    /// pool owns it.
    pub fn give_back(&mut self, buffer: SampleBuffer, recycle: &mut Vec<SampleBuffer>) {
        if let Err(buffer) = self.pool.return_buffer(buffer) {
            recycle.push(buffer);
        }
    }

    pub fn return_buffer(&mut self, buffer: SampleBuffer) -> Result<(), SampleBuffer> {
        self.pool.return_buffer(buffer)
    }

    /// Take one of this pool's own buffers, e.g. to feed it as a source.
    pub fn get_free_buffer(&mut self) -> Option<SampleBuffer> {
        self.pool.get_free_buffer()
    }

    fn target_rate(&self) -> u32 {
        (self.pool.format().sample_rate as f64 * self.resample_ratio).round() as u32
    }

    fn apply_ratio_change(&mut self) {
        let out_rate = self.target_rate();
        debug!(
            "ResamplingBufferPool - ratio {:.4}, effective output rate {}",
            self.resample_ratio, out_rate
        );
        if out_rate == self.pool.format().sample_rate
            && self.input_format.same_stream_shape(self.pool.format())
        {
            self.resampler = None;
        } else {
            self.resampler = self.build_resampler(out_rate);
        }
        self.out_rate = out_rate;
        self.change_ratio = false;
    }

    /// Run one conversion step. Returns whether any work was done.
    ///
    /// Consumed input buffers that belong to other pools are pushed onto
    /// `recycle` for the caller to route home.
    pub fn resample_buffers(&mut self, timestamp: u64, recycle: &mut Vec<SampleBuffer>) -> bool {
        let mut busy = false;

        if self.change_ratio && self.target_rate() == self.out_rate {
            self.change_ratio = false;
        }

        let Some(resampler) = self.resampler.as_mut() else {
            if self.change_ratio {
                self.apply_ratio_change();
                return true;
            }
            while let Some(buffer) = self.input.pop_front() {
                self.output.push_back(buffer);
                busy = true;
            }
            return busy;
        };

        let free_space = self
            .proc_sample
            .as_ref()
            .map_or(self.pool.format().frames, |s| s.pkt.free_samples());
        // Too much backlog: flush it before taking more input
        let skip_input = resampler.buffered_samples() > free_space * 2;
        // A pending ratio change holds input back until the old rate is flushed
        let has_input = !skip_input && !self.change_ratio && !self.input.is_empty();

        if !(has_input || skip_input || self.drain || self.change_ratio) {
            return false;
        }

        if self.proc_sample.is_none() {
            match self.pool.get_free_buffer() {
                Some(mut buffer) => {
                    buffer.timestamp = timestamp;
                    self.proc_sample = Some(buffer);
                }
                None => return false,
            }
        }
        let Some(mut proc) = self.proc_sample.take() else {
            return false;
        };

        let input = if has_input { self.input.pop_front() } else { None };
        let free = proc.pkt.free_samples();
        let out = resampler.resample(
            &mut proc.pkt,
            free,
            input
                .as_ref()
                .map(|buffer| (&buffer.pkt, 0, buffer.pkt.nb_samples)),
        );

        if (self.drain || self.change_ratio) && out == 0 {
            if self.fill_packets && proc.pkt.nb_samples != 0 {
                proc.pkt.pad_with_silence();
            }
            if proc.pkt.nb_samples == 0 {
                if let Err(buffer) = self.pool.return_buffer(proc) {
                    recycle.push(buffer);
                }
            } else {
                self.output.push_back(proc);
                busy = true;
            }
            if self.change_ratio {
                self.apply_ratio_change();
                busy = true;
            }
        } else {
            busy = true;
            let ready = if self.fill_packets {
                proc.pkt.is_full()
            } else {
                proc.pkt.nb_samples > 0
            };
            if ready {
                self.output.push_back(proc);
            } else {
                self.proc_sample = Some(proc);
            }
        }

        if let Some(buffer) = input {
            recycle.push(buffer);
        }
        busy
    }

    /// Queued time in seconds across input, partial, output and backlog.
    pub fn delay(&self) -> f64 {
        let seconds = |buffer: &SampleBuffer| {
            let rate = buffer.pkt.sample_rate();
            if rate == 0 {
                0.0
            } else {
                buffer.pkt.nb_samples as f64 / rate as f64
            }
        };
        let mut delay: f64 = self.input.iter().map(seconds).sum();
        delay += self.output.iter().map(seconds).sum::<f64>();
        if let Some(proc) = &self.proc_sample {
            delay += seconds(proc);
        }
        if let Some(resampler) = &self.resampler {
            let rate = self.pool.format().sample_rate;
            if rate > 0 {
                delay += resampler.buffered_samples() as f64 / rate as f64;
            }
        }
        delay
    }

    /// True when a requested drain has pushed everything through and the
    /// output has been consumed.
    pub fn is_drained(&self) -> bool {
        self.drain
            && self.input.is_empty()
            && self.output.is_empty()
            && self.proc_sample.is_none()
            && self
                .resampler
                .as_ref()
                .is_none_or(|r| r.buffered_samples() == 0)
    }

    /// Drop all queued audio. Own buffers go back to the free list, foreign
    /// ones onto `recycle`.
    pub fn flush(&mut self, recycle: &mut Vec<SampleBuffer>) {
        if let Some(proc) = self.proc_sample.take() {
            self.give_back(proc, recycle);
        }
        while let Some(buffer) = self.input.pop_front() {
            self.give_back(buffer, recycle);
        }
        while let Some(buffer) = self.output.pop_front() {
            self.give_back(buffer, recycle);
        }
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }

    pub fn is_destroyable(&self) -> bool {
        self.pool.is_destroyable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nether_pcm::{ChannelLayout, DataFormat};

    fn format(data_format: DataFormat, frames: usize) -> AudioFormat {
        AudioFormat::pcm(data_format, 48000, ChannelLayout::stereo(), frames)
    }

    fn filled(pool: &mut BufferPool, frames: usize, value: f32) -> SampleBuffer {
        let mut buffer = pool.get_free_buffer().unwrap();
        buffer.pkt.plane_f32_mut(0)[..frames * 2].fill(value);
        buffer.pkt.nb_samples = frames;
        buffer
    }

    fn route(sources: &mut [&mut BufferPool], recycle: Vec<SampleBuffer>) {
        for buffer in recycle {
            let owner = sources
                .iter_mut()
                .find(|pool| pool.owns(&buffer))
                .expect("buffer without owner");
            owner.return_buffer(buffer).unwrap();
        }
    }

    #[test]
    fn test_passthrough_preserves_fifo() {
        let fmt = format(DataFormat::Float, 480);
        let mut source = BufferPool::new(fmt.clone());
        source.create(0);
        let mut pool = ResamplingBufferPool::new(fmt.clone(), fmt);
        pool.create(0, false);
        assert!(!pool.has_resampler());

        let mut origins = Vec::new();
        for i in 0..3 {
            let buffer = filled(&mut source, 480, i as f32);
            origins.push(buffer.origin());
            pool.input.push_back(buffer);
        }

        let mut recycle = Vec::new();
        assert!(pool.resample_buffers(0, &mut recycle));
        assert!(recycle.is_empty());
        let out: Vec<_> = pool.output.iter().map(|b| b.origin()).collect();
        assert_eq!(out, origins);
        assert_eq!(pool.output[2].pkt.plane_f32(0)[0], 2.0);
    }

    #[test]
    fn test_passthrough_silence_unchanged() {
        let fmt = format(DataFormat::Float, 256);
        let mut pool = ResamplingBufferPool::new(fmt.clone(), fmt);
        pool.create(0, false);

        let mut silence = BufferPool::new(pool.format().clone());
        silence.create(0);
        let mut buffer = silence.get_free_buffer().unwrap();
        buffer.pkt.fill_silence();
        pool.input.push_back(buffer);

        let mut recycle = Vec::new();
        pool.resample_buffers(0, &mut recycle);
        let out = pool.output.pop_front().unwrap();
        assert_eq!(out.pkt.nb_samples, 256);
        assert!(out.pkt.plane_f32(0).iter().all(|&s| s == 0.0));
        silence.return_buffer(out).unwrap();
    }

    #[test]
    fn test_idle_call_does_nothing() {
        let mut pool = ResamplingBufferPool::new(
            format(DataFormat::S16, 480),
            format(DataFormat::Float, 480),
        );
        pool.create(0, false);
        let free = pool.pool().free_count();

        let mut recycle = Vec::new();
        assert!(!pool.resample_buffers(0, &mut recycle));
        assert_eq!(pool.pool().free_count(), free);
        assert!(!pool.has_partial());
        assert!(recycle.is_empty());
    }

    #[test]
    fn test_fill_packets_splits_into_full_buffers() {
        // 20ms of S16 input into 10ms float packets
        let input_format = format(DataFormat::S16, 960);
        let mut source = BufferPool::new(input_format.clone());
        source.create(0);

        let mut pool =
            ResamplingBufferPool::new(input_format, format(DataFormat::Float, 480));
        pool.create(0, false);
        pool.set_fill_packets(true);

        let mut buffer = source.get_free_buffer().unwrap();
        buffer.pkt.nb_samples = 960;
        pool.input.push_back(buffer);

        let mut recycle = Vec::new();
        assert!(pool.resample_buffers(0, &mut recycle));
        assert_eq!(pool.output.len(), 1);

        pool.set_drain(true);
        for _ in 0..4 {
            pool.resample_buffers(1, &mut recycle);
        }

        assert_eq!(pool.output.len(), 2);
        assert!(pool.output.iter().all(|b| b.pkt.nb_samples == 480));
        assert!(!pool.has_partial());

        route(&mut [&mut source], recycle);
        assert!(source.is_destroyable());
    }

    #[test]
    fn test_fill_packets_pads_on_drain() {
        let mut source = BufferPool::new(format(DataFormat::S16, 100));
        source.create(0);
        let mut pool =
            ResamplingBufferPool::new(format(DataFormat::S16, 100), format(DataFormat::Float, 480));
        pool.create(0, false);
        pool.set_fill_packets(true);

        let mut buffer = source.get_free_buffer().unwrap();
        buffer.pkt.nb_samples = 100;
        pool.input.push_back(buffer);

        let mut recycle = Vec::new();
        pool.resample_buffers(0, &mut recycle);
        assert!(pool.output.is_empty());
        assert!(pool.has_partial());

        pool.set_drain(true);
        pool.resample_buffers(1, &mut recycle);
        assert_eq!(pool.output.len(), 1);
        assert!(pool.output[0].pkt.is_full());
        assert!(!pool.is_drained());
        pool.output.clear();
    }

    #[test]
    fn test_partial_published_without_fill_packets() {
        let mut source = BufferPool::new(format(DataFormat::S16, 100));
        source.create(0);
        let mut pool =
            ResamplingBufferPool::new(format(DataFormat::S16, 100), format(DataFormat::Float, 480));
        pool.create(0, false);

        let mut buffer = source.get_free_buffer().unwrap();
        buffer.pkt.nb_samples = 100;
        pool.input.push_back(buffer);

        let mut recycle = Vec::new();
        assert!(pool.resample_buffers(0, &mut recycle));
        assert_eq!(pool.output.len(), 1);
        assert_eq!(pool.output[0].pkt.nb_samples, 100);
        assert!((pool.delay() - 100.0 / 48000.0).abs() < 1e-9);
    }

    #[test]
    fn test_flush_returns_everything() {
        let mut source = BufferPool::new(format(DataFormat::S16, 960));
        source.create(0);
        let mut pool =
            ResamplingBufferPool::new(format(DataFormat::S16, 960), format(DataFormat::Float, 480));
        pool.create(0, false);
        pool.set_fill_packets(true);

        for _ in 0..2 {
            let mut buffer = source.get_free_buffer().unwrap();
            buffer.pkt.nb_samples = 960;
            pool.input.push_back(buffer);
        }
        let mut recycle = Vec::new();
        pool.resample_buffers(0, &mut recycle);

        pool.flush(&mut recycle);
        assert!(pool.is_destroyable());
        assert_eq!(pool.delay(), 0.0);
        route(&mut [&mut source], recycle);
        assert!(source.is_destroyable());
    }

    #[test]
    fn test_ratio_change_rebuilds_resampler() {
        let fmt = format(DataFormat::Float, 480);
        let mut pool = ResamplingBufferPool::new(fmt.clone(), fmt);
        pool.create(0, false);
        assert!(!pool.has_resampler());

        pool.set_resample_ratio(1.01);
        let mut recycle = Vec::new();
        assert!(pool.resample_buffers(0, &mut recycle));
        assert!(pool.has_resampler());

        pool.set_resample_ratio(1.0);
        // Pending partial buffer is empty, so the change applies at once
        assert!(pool.resample_buffers(0, &mut recycle));
        assert!(!pool.has_resampler());
        assert!(pool.pool().is_destroyable());
    }

    #[test]
    fn test_ratio_change_applies_under_steady_input() {
        let mut source = BufferPool::new(format(DataFormat::S16, 100));
        source.create(0);
        let mut pool =
            ResamplingBufferPool::new(format(DataFormat::S16, 100), format(DataFormat::Float, 480));
        pool.create(0, false);
        pool.set_resample_ratio(0.5);

        let mut produced = Vec::new();
        for cycle in 0..50 {
            if let Some(mut buffer) = source.get_free_buffer() {
                buffer.pkt.nb_samples = 100;
                pool.input.push_back(buffer);
            }
            let mut recycle = Vec::new();
            pool.resample_buffers(cycle, &mut recycle);
            while let Some(out) = pool.output.pop_front() {
                produced.push(out.pkt.nb_samples);
                pool.return_buffer(out).unwrap();
            }
            route(&mut [&mut source], recycle);
        }

        assert!((pool.resample_ratio() - 0.5).abs() < f64::EPSILON);
        let last = *produced.last().unwrap();
        assert!((48..=52).contains(&last), "last packet had {} frames", last);
    }

    #[test]
    fn test_ratio_change_to_current_rate_is_dropped() {
        let fmt = format(DataFormat::Float, 480);
        let mut pool = ResamplingBufferPool::new(fmt.clone(), fmt);
        pool.create(0, false);

        // Rounds to the rate already in use
        pool.set_resample_ratio(1.000001);
        let mut recycle = Vec::new();
        assert!(!pool.resample_buffers(0, &mut recycle));
        assert!(!pool.has_resampler());
    }
}
