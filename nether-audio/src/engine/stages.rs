use nether_pcm::mix::{mul_add, scale};
use tracing::{debug, error, warn};

use super::{Engine, EngineMode};
use crate::buffer::SampleBuffer;
use crate::protocol::StreamReply;
use crate::resampling::ResamplingBufferPool;
use crate::stats::{MAX_CACHE_LEVEL, MAX_WATER_LEVEL};

fn has_queued(pool: &ResamplingBufferPool) -> bool {
    !pool.input.is_empty() || !pool.output.is_empty()
}

/// Interleaved float samples in use.
fn used_f32(buffer: &mut SampleBuffer) -> &mut [f32] {
    let len = buffer.pkt.nb_samples * buffer.pkt.channels();
    &mut buffer.pkt.plane_f32_mut(0)[..len]
}

impl Engine {
    /// One pass of the pipeline. Returns whether anything moved.
    pub(crate) fn run_stages(&mut self) -> bool {
        self.metrics.cycles += 1;
        let now = self.now_ms();
        let mut busy = false;
        let mut recycle = Vec::new();

        // Sounds alone still need something to mix onto
        if !self.playing.is_empty() && self.streams.is_empty() {
            if let Some(pool) = self.silence_buffers.as_mut() {
                if !has_queued(pool) {
                    if let Some(mut buffer) = pool.get_free_buffer() {
                        buffer.pkt.fill_silence();
                        buffer.timestamp = now;
                        pool.input.push_back(buffer);
                    }
                }
                busy |= pool.resample_buffers(now, &mut recycle);
            }
        }

        busy |= self.run_streams(now, &mut recycle);

        if self.shared.stats.water_level() < MAX_WATER_LEVEL {
            busy |= match self.mode {
                EngineMode::Raw => self.forward_raw(),
                EngineMode::Pcm | EngineMode::Transcode => self.mix(&mut recycle),
            };
        }

        if let Some(pool) = self.sink_buffers.as_mut() {
            busy |= pool.resample_buffers(now, &mut recycle);
            while let Some(buffer) = pool.output.pop_front() {
                // Counted before posting: the sink may report it back at once
                let frames = buffer.pkt.nb_samples;
                self.shared.stats.add_samples(frames, &[]);
                match self.sink.send_sample(buffer) {
                    Ok(()) => {
                        self.metrics.packets_sent += 1;
                        busy = true;
                    }
                    Err(buffer) => {
                        warn!("Engine::run_stages - sink thread gone, dropping output");
                        self.shared.stats.retract_samples(frames);
                        pool.give_back(buffer, &mut recycle);
                    }
                }
            }
        }

        self.return_all(recycle);
        if busy {
            self.metrics.busy_cycles += 1;
        }
        busy
    }

    /// Advance each stream's resampler, lend out empty buffers while the
    /// stream is short of audio and answer completed drains.
    fn run_streams(&mut self, now: u64, recycle: &mut Vec<SampleBuffer>) -> bool {
        let water_level = self.shared.stats.water_level();
        let mut busy = false;
        let mut served = 0;
        let mut cache = Vec::with_capacity(self.streams.len());

        for stream in &mut self.streams {
            let Some(pool) = stream.resample.as_mut() else {
                continue;
            };
            let mut consumed = Vec::new();
            busy |= pool.resample_buffers(now, &mut consumed);
            for buffer in consumed {
                if let Err(buffer) = stream.input.return_buffer(buffer) {
                    recycle.push(buffer);
                }
            }

            if !stream.drain_pending {
                while water_level + stream.buffered() < MAX_CACHE_LEVEL {
                    let Some(buffer) = stream.input.get_free_buffer() else {
                        break;
                    };
                    stream.processing.insert(buffer.origin());
                    stream.port.send_in(StreamReply::Buffer(buffer));
                    served += 1;
                    busy = true;
                }
            } else if stream.resample.as_ref().is_some_and(|pool| pool.is_drained()) {
                if let Some(pool) = stream.resample.as_mut() {
                    pool.set_drain(false);
                }
                stream.drain_pending = false;
                stream.port.send_in(StreamReply::Drained);
                debug!("Engine::run_streams - {} drained", stream.id);
                busy = true;
            }

            cache.push((stream.id, stream.buffered()));
        }

        self.metrics.buffers_served += served;
        self.shared.stats.add_samples(0, &cache);
        busy
    }

    /// Passthrough: hand the stream's packets to the sink untouched.
    fn forward_raw(&mut self) -> bool {
        let Some(sink_pool) = self.sink_buffers.as_mut() else {
            return false;
        };
        let mut busy = false;
        for stream in &mut self.streams {
            let buffer = stream
                .resample
                .as_mut()
                .and_then(|pool| pool.output.pop_front());
            if let Some(buffer) = buffer {
                sink_pool.input.push_back(buffer);
                busy = true;
            }
        }
        busy
    }

    /// Mix one buffer from every source that has output, overlay sounds,
    /// apply master volume and queue the result for the sink.
    fn mix(&mut self, recycle: &mut Vec<SampleBuffer>) -> bool {
        if self.mode == EngineMode::Transcode
            && !self.encoder_buffers.as_ref().is_some_and(|pool| pool.has_free())
        {
            return false;
        }

        let mut out = self
            .silence_buffers
            .as_mut()
            .and_then(|pool| pool.output.pop_front());

        for stream in &mut self.streams {
            let Some(pool) = stream.resample.as_mut() else {
                continue;
            };
            let Some(mut buffer) = pool.output.pop_front() else {
                continue;
            };
            let volume = stream.volume.get();
            match out.as_mut() {
                None => {
                    if volume < 1.0 {
                        scale(used_f32(&mut buffer), volume);
                    }
                    out = Some(buffer);
                }
                Some(dst) => {
                    let len = dst.pkt.nb_samples.min(buffer.pkt.nb_samples) * dst.pkt.channels();
                    mul_add(
                        &mut dst.pkt.plane_f32_mut(0)[..len],
                        &buffer.pkt.plane_f32(0)[..len],
                        volume,
                    );
                    pool.give_back(buffer, recycle);
                }
            }
        }

        let Some(mut mixed) = out else {
            return false;
        };
        self.metrics.buffers_mixed += 1;
        self.mix_sounds(&mut mixed);

        let gain = if self.is_muted() {
            0.0
        } else {
            self.shared.master.get()
        };
        if gain < 1.0 {
            scale(used_f32(&mut mixed), gain);
        }

        match self.mode {
            EngineMode::Transcode => self.encode(mixed, recycle),
            _ => match self.sink_buffers.as_mut() {
                Some(pool) => pool.input.push_back(mixed),
                None => recycle.push(mixed),
            },
        }
        true
    }

    fn encode(&mut self, mut mixed: SampleBuffer, recycle: &mut Vec<SampleBuffer>) {
        let (Some(encoder), Some(pool), Some(sink_pool)) = (
            self.encoder.as_mut(),
            self.encoder_buffers.as_mut(),
            self.sink_buffers.as_mut(),
        ) else {
            recycle.push(mixed);
            return;
        };
        let Some(mut encoded) = pool.get_free_buffer() else {
            recycle.push(mixed);
            return;
        };

        if !mixed.pkt.is_full() {
            mixed.pkt.pad_with_silence();
        }
        match encoder.encode(&mixed.pkt, &mut encoded.pkt) {
            Ok(_) => {
                encoded.timestamp = mixed.timestamp;
                sink_pool.input.push_back(encoded);
            }
            Err(e) => {
                error!("Engine::encode - {} encoder failed: {}", encoder.codec().name(), e);
                if let Err(buffer) = pool.return_buffer(encoded) {
                    recycle.push(buffer);
                }
            }
        }
        recycle.push(mixed);
    }

    /// Overlay every playing sound onto `out`, dropping finished ones.
    fn mix_sounds(&mut self, out: &mut SampleBuffer) {
        if self.playing.is_empty() {
            return;
        }
        let Some(internal) = self.internal_format.clone() else {
            return;
        };
        let channels = out.pkt.channels();
        let frames = out.pkt.nb_samples;
        let dst = used_f32(out);
        let sounds = &mut self.sounds;
        let mut mixed = 0;

        self.playing.retain_mut(|playing| {
            let Some(sound) = sounds.get_mut(&playing.id) else {
                return false;
            };
            if let Err(e) = sound.convert(&internal) {
                error!("Engine::mix_sounds - cannot convert sound: {}", e);
                return false;
            }
            let volume = sound.volume();
            let Some(data) = sound.converted() else {
                return false;
            };
            let total = data.nb_samples;
            let count = total.saturating_sub(playing.played).min(frames);
            let start = playing.played * channels;
            let len = count * channels;
            mul_add(&mut dst[..len], &data.plane_f32(0)[start..start + len], volume);
            playing.played += count;
            mixed += 1;
            playing.played < total
        });
        self.metrics.sounds_mixed += mixed;
    }

    /// Convert registered sounds to the mixing format ahead of playback.
    pub(crate) fn resample_sounds(&mut self) {
        if self.mode == EngineMode::Raw {
            return;
        }
        let Some(internal) = self.internal_format.clone() else {
            return;
        };
        for sound in self.sounds.values_mut() {
            if let Err(e) = sound.convert(&internal) {
                warn!("Engine::resample_sounds - {:?} not converted: {}", sound.id(), e);
            }
        }
    }

    /// Whether queued audio or sounds are still waiting to reach the sink.
    /// Buffers held by producers do not count.
    pub(crate) fn has_work(&self) -> bool {
        !self.playing.is_empty()
            || self.sink_buffers.as_ref().is_some_and(has_queued)
            || self.silence_buffers.as_ref().is_some_and(has_queued)
            || self.streams.iter().any(|stream| {
                stream.drain_pending || stream.resample.as_ref().is_some_and(has_queued)
            })
    }
}
