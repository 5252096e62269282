//! Pool-owned sample buffers
//!
//! A [`BufferPool`] allocates every buffer up front. Buffers leave the pool
//! by value and travel between threads inside message payloads; each one
//! remembers its origin (pool id + slot) so it can be routed home. The pool
//! tracks which slots are checked out, which gives the accounting invariant
//!
//! ```text
//! capacity() == free_count() + checked_out_count()
//! ```
//!
//! and a pool may only be destroyed once `checked_out_count() == 0`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};

use nether_pcm::{AudioFormat, SoundPacket};
use tracing::error;

/// Minimum number of buffers a pool allocates regardless of period length.
pub const MIN_POOL_BUFFERS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolId(u32);

impl PoolId {
    fn next() -> Self {
        static NEXT: AtomicU32 = AtomicU32::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Where a buffer must be returned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferOrigin {
    pub pool: PoolId,
    pub slot: u32,
}

/// One period of audio owned by a pool.
#[derive(Debug)]
pub struct SampleBuffer {
    pub pkt: SoundPacket,
    /// Engine clock (ms) when the first sample was written
    pub timestamp: u64,
    origin: BufferOrigin,
}

impl SampleBuffer {
    pub fn origin(&self) -> BufferOrigin {
        self.origin
    }

    pub fn pool(&self) -> PoolId {
        self.origin.pool
    }
}

#[derive(Debug)]
pub struct BufferPool {
    id: PoolId,
    format: AudioFormat,
    free: VecDeque<SampleBuffer>,
    checked_out: Vec<bool>,
}

impl BufferPool {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            id: PoolId::next(),
            format,
            free: VecDeque::new(),
            checked_out: Vec::new(),
        }
    }

    pub fn id(&self) -> PoolId {
        self.id
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    /// Allocate buffers until they cover `total_time_ms`, and at least
    /// [`MIN_POOL_BUFFERS`].
    pub fn create(&mut self, total_time_ms: u32) {
        let period_ms = if self.format.sample_rate == 0 {
            0.0
        } else {
            self.format.frames as f64 * 1000.0 / self.format.sample_rate as f64
        };
        let mut buffered_ms = 0.0;
        let mut count = 0;
        while count < MIN_POOL_BUFFERS || (period_ms > 0.0 && buffered_ms < total_time_ms as f64)
        {
            self.allocate();
            buffered_ms += period_ms;
            count += 1;
        }
    }

    fn allocate(&mut self) {
        let slot = self.checked_out.len() as u32;
        self.checked_out.push(false);
        self.free.push_back(SampleBuffer {
            pkt: SoundPacket::new(self.format.sample_config(), self.format.frames),
            timestamp: 0,
            origin: BufferOrigin {
                pool: self.id,
                slot,
            },
        });
    }

    /// Take the oldest free buffer, empty and ready to fill.
    pub fn get_free_buffer(&mut self) -> Option<SampleBuffer> {
        let buffer = self.free.pop_front()?;
        self.checked_out[buffer.origin.slot as usize] = true;
        Some(buffer)
    }

    pub fn has_free(&self) -> bool {
        !self.free.is_empty()
    }

    pub fn owns(&self, buffer: &SampleBuffer) -> bool {
        buffer.origin.pool == self.id
    }

    /// Put a buffer back on the free list.
    ///
    /// Buffers from another pool, or slots that are not checked out, are
    /// handed back in `Err` untouched.
    pub fn return_buffer(&mut self, mut buffer: SampleBuffer) -> Result<(), SampleBuffer> {
        if !self.owns(&buffer) {
            return Err(buffer);
        }
        let slot = buffer.origin.slot as usize;
        match self.checked_out.get_mut(slot) {
            Some(out) if *out => *out = false,
            _ => {
                error!(
                    "BufferPool::return_buffer - slot {} of pool {:?} returned twice",
                    slot, self.id
                );
                return Err(buffer);
            }
        }
        buffer.pkt.nb_samples = 0;
        buffer.timestamp = 0;
        self.free.push_back(buffer);
        Ok(())
    }

    /// Buffers ever issued by this pool.
    pub fn capacity(&self) -> usize {
        self.checked_out.len()
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn checked_out_count(&self) -> usize {
        self.checked_out.iter().filter(|&&out| out).count()
    }

    /// True once every issued buffer is back on the free list.
    pub fn is_destroyable(&self) -> bool {
        self.free.len() == self.checked_out.len()
    }
}
