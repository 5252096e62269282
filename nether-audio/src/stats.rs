//! Buffering and latency statistics
//!
//! Shared between the engine thread, the sink thread and callers querying
//! latency, so every access goes through one lock.

use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use hashbrown::HashMap;
use tracing::{error, warn};

use crate::stream::StreamId;

/// Upper bound of audio cached per stream ahead of the sink, in seconds.
pub const MAX_CACHE_LEVEL: f64 = 0.5;
/// Mixing pauses while more than this many seconds are queued for the sink.
pub const MAX_WATER_LEVEL: f64 = 0.25;

#[derive(Debug)]
struct StatsInner {
    sink_delay: f64,
    sink_update: Instant,
    sink_sample_rate: u32,
    buffered_samples: usize,
    streams: HashMap<StreamId, f64>,
}

#[derive(Debug)]
pub struct EngineStats {
    inner: Mutex<StatsInner>,
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineStats {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StatsInner {
                sink_delay: 0.0,
                sink_update: Instant::now(),
                sink_sample_rate: 0,
                buffered_samples: 0,
                streams: HashMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StatsInner> {
        self.inner.lock().unwrap_or_else(|e| {
            warn!("EngineStats mutex poisoned; continuing");
            e.into_inner()
        })
    }

    /// Start over for a freshly opened sink.
    pub fn reset(&self, sample_rate: u32) {
        let mut inner = self.lock();
        inner.sink_delay = 0.0;
        inner.sink_update = Instant::now();
        inner.sink_sample_rate = sample_rate;
        inner.buffered_samples = 0;
    }

    /// Called by the sink after writing `samples` frames; `delay` is the
    /// device latency in seconds.
    pub fn update_sink_delay(&self, delay: f64, samples: usize) {
        let mut inner = self.lock();
        inner.sink_delay = delay;
        inner.sink_update = Instant::now();
        if samples > inner.buffered_samples {
            error!(
                "EngineStats::update_sink_delay - inconsistency in buffer time ({} returned, {} buffered)",
                samples, inner.buffered_samples
            );
            inner.buffered_samples = 0;
        } else {
            inner.buffered_samples -= samples;
        }
    }

    /// Account for `samples` frames sent toward the sink and refresh the
    /// per-stream buffered times.
    pub fn add_samples(&self, samples: usize, streams: &[(StreamId, f64)]) {
        let mut inner = self.lock();
        inner.buffered_samples += samples;
        for &(id, buffered) in streams {
            inner.streams.insert(id, buffered);
        }
    }

    /// Undo [`add_samples`](Self::add_samples) for frames that never
    /// reached the sink.
    pub fn retract_samples(&self, samples: usize) {
        let mut inner = self.lock();
        inner.buffered_samples = inner.buffered_samples.saturating_sub(samples);
    }

    pub fn remove_stream(&self, id: StreamId) {
        self.lock().streams.remove(&id);
    }

    fn buffered_time(inner: &StatsInner) -> f64 {
        if inner.sink_sample_rate == 0 {
            return 0.0;
        }
        inner.buffered_samples as f64 / inner.sink_sample_rate as f64
    }

    /// Seconds until a sample submitted now becomes audible.
    pub fn delay(&self) -> f64 {
        let inner = self.lock();
        let elapsed = inner.sink_update.elapsed().as_secs_f64();
        let sink = (inner.sink_delay - elapsed).max(0.0);
        sink + Self::buffered_time(&inner)
    }

    /// [`delay`](Self::delay) plus what is queued inside the stream.
    pub fn stream_delay(&self, id: StreamId) -> f64 {
        let stream = self.lock().streams.get(&id).copied().unwrap_or(0.0);
        self.delay() + stream
    }

    /// Audio queued ahead of the sink for this stream, in seconds.
    pub fn cache_time(&self, id: StreamId) -> f64 {
        let inner = self.lock();
        Self::buffered_time(&inner) + inner.streams.get(&id).copied().unwrap_or(0.0)
    }

    pub fn cache_total(&self) -> f64 {
        MAX_CACHE_LEVEL
    }

    /// Seconds of audio sent to the sink and not yet played.
    pub fn water_level(&self) -> f64 {
        Self::buffered_time(&self.lock())
    }

    pub fn buffered_samples(&self) -> usize {
        self.lock().buffered_samples
    }

    pub fn sink_sample_rate(&self) -> u32 {
        self.lock().sink_sample_rate
    }
}
