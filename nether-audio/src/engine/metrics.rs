use std::time::Instant;

use tracing::debug;

/// Engine thread health counters, logged once per second.
#[derive(Debug, Clone)]
pub(crate) struct EngineMetrics {
    /// Pipeline iterations run
    pub cycles: u64,
    /// Iterations that did work
    pub busy_cycles: u64,
    /// Mixed buffers produced
    pub buffers_mixed: u64,
    /// Buffers handed to the sink thread
    pub packets_sent: u64,
    /// Empty buffers handed to producers
    pub buffers_served: u64,
    /// Sound overlays mixed
    pub sounds_mixed: u64,
    /// Waits that ran into their timeout
    pub idle_waits: u64,
    last_log_time: Instant,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            cycles: 0,
            busy_cycles: 0,
            buffers_mixed: 0,
            packets_sent: 0,
            buffers_served: 0,
            sounds_mixed: 0,
            idle_waits: 0,
            last_log_time: Instant::now(),
        }
    }

    /// Log if enough time has passed (every 1 second)
    pub fn maybe_log(&mut self, water_level: f64) {
        if self.last_log_time.elapsed().as_secs() < 1 {
            return;
        }
        if self.cycles > 0 || self.idle_waits > 0 {
            debug!(
                "AUDIO ENGINE [tid={:?}]: cycles={} (busy={}), mixed={}, sent={}, served={}, \
                 sounds={}, idle_waits={}, water={:.3}s",
                std::thread::current().id(),
                self.cycles,
                self.busy_cycles,
                self.buffers_mixed,
                self.packets_sent,
                self.buffers_served,
                self.sounds_mixed,
                self.idle_waits,
                water_level
            );
        }

        // Reset counters for next interval (show per-second rates)
        self.cycles = 0;
        self.busy_cycles = 0;
        self.buffers_mixed = 0;
        self.packets_sent = 0;
        self.buffers_served = 0;
        self.sounds_mixed = 0;
        self.idle_waits = 0;
        self.last_log_time = Instant::now();
    }
}
