//! Producer-side stream handle
//!
//! The engine hands empty buffers to the producer over the stream's port.
//! [`AudioStream::add_data`] fills them and posts them back; when no buffer
//! is available the producer waits, which is the only backpressure in the
//! system.
//!
//! ```text
//! engine ──StreamReply::Buffer──► AudioStream (fill)
//!        ◄─StreamSignal::Sample──
//! ```

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use nether_pcm::{AudioFormat, DataFormat};
use tracing::{debug, warn};

use crate::buffer::SampleBuffer;
use crate::error::StreamError;
use crate::protocol::{DataPort, DataSignal, StreamPort, StreamReply, StreamSignal};
use crate::stats::EngineStats;
use crate::volume::SharedVolume;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u32);

impl StreamId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub(crate) fn next() -> Self {
        static NEXT: AtomicU32 = AtomicU32::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// Parameters of a new stream.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    /// Format the producer will deliver. `frames` is ignored; buffers hold
    /// a tenth of a second.
    pub format: AudioFormat,
    pub volume: f32,
}

impl StreamRequest {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            volume: 1.0,
        }
    }
}

/// What the engine returns for an accepted stream.
pub struct StreamGrant {
    pub id: StreamId,
    pub format: AudioFormat,
    pub port: Arc<StreamPort>,
    pub volume: SharedVolume,
}

pub struct AudioStream {
    id: StreamId,
    format: AudioFormat,
    port: Arc<StreamPort>,
    data: Arc<DataPort>,
    stats: Arc<EngineStats>,
    volume: SharedVolume,
    /// Buffer currently being filled
    current: Option<SampleBuffer>,
    /// Buffers received from the engine, not yet touched
    spare: VecDeque<SampleBuffer>,
    freed: bool,
}

impl AudioStream {
    pub(crate) fn new(grant: StreamGrant, data: Arc<DataPort>, stats: Arc<EngineStats>) -> Self {
        Self {
            id: grant.id,
            format: grant.format,
            port: grant.port,
            data,
            stats,
            volume: grant.volume,
            current: None,
            spare: VecDeque::new(),
            freed: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    fn check_open(&self) -> Result<(), StreamError> {
        if self.freed || self.port.is_closed() {
            Err(StreamError::Closed)
        } else {
            Ok(())
        }
    }

    /// Move engine replies off the port. Returns true if a drain completed.
    fn collect_replies(&mut self) -> bool {
        let mut drained = false;
        while let Some(reply) = self.port.receive_in() {
            match reply {
                StreamReply::Buffer(buffer) => self.spare.push_back(buffer),
                StreamReply::Drained => drained = true,
            }
        }
        drained
    }

    /// Wait up to `deadline` for the next empty buffer.
    fn next_buffer(&mut self, deadline: Instant) -> Option<SampleBuffer> {
        loop {
            self.collect_replies();
            if let Some(buffer) = self.spare.pop_front() {
                return Some(buffer);
            }
            if self.port.is_closed() {
                return None;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            match self.port.wait_in(remaining) {
                Some(StreamReply::Buffer(buffer)) => return Some(buffer),
                Some(StreamReply::Drained) => {}
                None => return None,
            }
        }
    }

    fn submit(&mut self, buffer: SampleBuffer) -> Result<(), StreamError> {
        match self.port.post(StreamSignal::Sample(buffer)) {
            Ok(()) => Ok(()),
            Err(_) => Err(StreamError::Closed),
        }
    }

    /// Copy `frames` frames from `planes` (one slice per plane, in the
    /// stream's sample format) into engine buffers.
    ///
    /// Blocks up to `timeout` for free buffers and returns how many frames
    /// were accepted, which is less than `frames` only on timeout.
    pub fn add_data(
        &mut self,
        planes: &[&[u8]],
        frames: usize,
        timeout: Duration,
    ) -> Result<usize, StreamError> {
        self.check_open()?;
        let deadline = Instant::now() + timeout;
        let mut written = 0;

        while written < frames {
            let mut buffer = match self.current.take() {
                Some(buffer) => buffer,
                None => match self.next_buffer(deadline) {
                    Some(buffer) => buffer,
                    None => break,
                },
            };

            let frame_bytes = buffer.pkt.plane_frame_bytes();
            let start = written * frame_bytes;
            let source: Vec<&[u8]> = planes
                .iter()
                .map(|plane| plane.get(start..).unwrap_or(&[]))
                .collect();
            let copied = buffer.pkt.append_bytes(&source, frames - written);
            written += copied;

            if buffer.pkt.is_full() {
                self.submit(buffer)?;
            } else {
                self.current = Some(buffer);
                if copied == 0 {
                    warn!(
                        "AudioStream::add_data - {} got planes that do not match its format",
                        self.id
                    );
                    break;
                }
            }
        }
        Ok(written)
    }

    /// Interleaved float convenience for [`add_data`](Self::add_data).
    pub fn add_f32(&mut self, samples: &[f32], timeout: Duration) -> Result<usize, StreamError> {
        if self.format.data_format != DataFormat::Float {
            return Err(StreamError::FormatMismatch {
                actual: data_format_name(self.format.data_format),
                supplied: "FLOAT",
            });
        }
        let channels = self.format.channel_count().max(1);
        let bytes: &[u8] = bytemuck::cast_slice(samples);
        self.add_data(&[bytes], samples.len() / channels, timeout)
    }

    /// Interleaved 16-bit convenience for [`add_data`](Self::add_data).
    pub fn add_s16(&mut self, samples: &[i16], timeout: Duration) -> Result<usize, StreamError> {
        if self.format.data_format != DataFormat::S16 {
            return Err(StreamError::FormatMismatch {
                actual: data_format_name(self.format.data_format),
                supplied: "S16",
            });
        }
        let channels = self.format.channel_count().max(1);
        let bytes: &[u8] = bytemuck::cast_slice(samples);
        self.add_data(&[bytes], samples.len() / channels, timeout)
    }

    /// Send the partially filled buffer, if any.
    pub fn flush(&mut self) -> Result<(), StreamError> {
        self.check_open()?;
        match self.current.take() {
            Some(buffer) if buffer.pkt.nb_samples > 0 => self.submit(buffer),
            Some(buffer) => {
                self.spare.push_front(buffer);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Flush and block until the engine has played out everything queued.
    pub fn drain(&mut self, timeout: Duration) -> Result<(), StreamError> {
        self.flush()?;
        self.port.send_out(StreamSignal::Drain)?;
        let deadline = Instant::now() + timeout;
        loop {
            if self.collect_replies() {
                debug!("AudioStream::drain - {} drained", self.id);
                return Ok(());
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(StreamError::DrainTimeout);
            }
            if self.port.is_closed() {
                return Err(StreamError::Closed);
            }
            match self.port.wait_in(remaining) {
                Some(StreamReply::Drained) => {
                    debug!("AudioStream::drain - {} drained", self.id);
                    return Ok(());
                }
                Some(StreamReply::Buffer(buffer)) => self.spare.push_back(buffer),
                None => {}
            }
        }
    }

    /// Seconds until a frame added now is heard.
    pub fn delay(&self) -> f64 {
        self.stats.stream_delay(self.id)
    }

    /// Seconds of this stream's audio queued ahead of the sink.
    pub fn cache_time(&self) -> f64 {
        self.stats.cache_time(self.id)
    }

    pub fn cache_total(&self) -> f64 {
        self.stats.cache_total()
    }

    pub fn volume(&self) -> f32 {
        self.volume.get()
    }

    pub fn set_volume(&self, volume: f32) {
        self.volume.set(volume);
    }

    /// Adjust the playback rate by `ratio` (1.0 = nominal), e.g. to follow
    /// a drifting clock.
    pub fn set_resample_ratio(&self, ratio: f64) -> Result<(), StreamError> {
        self.check_open()?;
        self.port.send_out(StreamSignal::ResampleRatio(ratio))?;
        Ok(())
    }

    /// Tear the stream down, handing every held buffer back to the engine.
    pub fn free(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.freed {
            return;
        }
        self.freed = true;
        self.collect_replies();
        let mut returned: Vec<SampleBuffer> = self.spare.drain(..).collect();
        returned.extend(self.current.take());

        debug!(
            "AudioStream::release - {} returning {} buffers",
            self.id,
            returned.len()
        );
        let signal = DataSignal::FreeStream {
            stream: self.id,
            returned,
        };
        if self.data.post(signal).is_err() {
            debug!("AudioStream::release - engine already stopped");
        }
    }
}

impl Drop for AudioStream {
    fn drop(&mut self) {
        self.release();
    }
}

fn data_format_name(format: DataFormat) -> &'static str {
    match format {
        DataFormat::U8 => "U8",
        DataFormat::S16 => "S16",
        DataFormat::S32 => "S32",
        DataFormat::Float => "FLOAT",
        DataFormat::U8P => "U8P",
        DataFormat::S16P => "S16P",
        DataFormat::S32P => "S32P",
        DataFormat::FloatP => "FLOATP",
        DataFormat::Raw(_) => "RAW",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::port::{Event, Protocol};
    use nether_pcm::ChannelLayout;

    struct Fixture {
        stream: AudioStream,
        port: Arc<StreamPort>,
        data: Arc<DataPort>,
        pool: BufferPool,
    }

    fn fixture(frames: usize) -> Fixture {
        let format = AudioFormat::pcm(DataFormat::Float, 48000, ChannelLayout::stereo(), frames);
        let engine_event = Arc::new(Event::new());
        let port = Arc::new(Protocol::new(
            "stream",
            Arc::clone(&engine_event),
            Arc::new(Event::new()),
        ));
        let data = Arc::new(Protocol::new(
            "data",
            Arc::clone(&engine_event),
            Arc::new(Event::new()),
        ));
        let mut pool = BufferPool::new(format.clone());
        pool.create(0);
        let grant = StreamGrant {
            id: StreamId::new(1),
            format,
            port: Arc::clone(&port),
            volume: SharedVolume::default(),
        };
        let stream = AudioStream::new(grant, Arc::clone(&data), Arc::new(EngineStats::new()));
        Fixture {
            stream,
            port,
            data,
            pool,
        }
    }

    fn serve(f: &mut Fixture, count: usize) {
        for _ in 0..count {
            let buffer = f.pool.get_free_buffer().unwrap();
            f.port.send_in(StreamReply::Buffer(buffer));
        }
    }

    #[test]
    fn test_add_data_fills_and_submits() {
        let mut f = fixture(4);
        serve(&mut f, 2);

        let samples = [0.25f32; 12];
        let written = f.stream.add_f32(&samples, Duration::from_millis(50)).unwrap();
        assert_eq!(written, 6);

        // One full buffer went back, the rest is pending locally
        let message = f.port.receive_out().unwrap();
        match message.signal {
            StreamSignal::Sample(buffer) => {
                assert_eq!(buffer.pkt.nb_samples, 4);
                assert_eq!(buffer.pkt.plane_f32(0)[7], 0.25);
                f.pool.return_buffer(buffer).unwrap();
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(f.port.receive_out().is_none());

        f.stream.flush().unwrap();
        match f.port.receive_out().unwrap().signal {
            StreamSignal::Sample(buffer) => {
                assert_eq!(buffer.pkt.nb_samples, 2);
                f.pool.return_buffer(buffer).unwrap();
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_add_data_times_out_without_buffers() {
        let mut f = fixture(4);
        let written = f
            .stream
            .add_f32(&[0.0; 8], Duration::from_millis(10))
            .unwrap();
        assert_eq!(written, 0);
    }

    #[test]
    fn test_format_mismatch() {
        let mut f = fixture(4);
        assert_eq!(
            f.stream.add_s16(&[0; 8], Duration::ZERO),
            Err(StreamError::FormatMismatch {
                actual: "FLOAT",
                supplied: "S16"
            })
        );
    }

    #[test]
    fn test_free_returns_held_buffers() {
        let mut f = fixture(4);
        serve(&mut f, 3);
        f.stream.add_f32(&[0.0; 2], Duration::ZERO).unwrap();

        let Fixture {
            stream,
            data,
            mut pool,
            ..
        } = f;
        stream.free();

        let (signal, _) = data.receive_out().unwrap().into_parts();
        match signal {
            DataSignal::FreeStream { stream, returned } => {
                assert_eq!(stream, StreamId::new(1));
                assert_eq!(returned.len(), 3);
                for buffer in returned {
                    pool.return_buffer(buffer).unwrap();
                }
            }
            _ => panic!("expected FreeStream"),
        }
        assert!(pool.is_destroyable());
        // Dropping after free does not post again
        assert!(data.receive_out().is_none());
    }

    #[test]
    fn test_drain_waits_for_reply() {
        let mut f = fixture(4);
        f.port.send_in(StreamReply::Drained);
        f.stream.drain(Duration::from_millis(100)).unwrap();
        assert!(matches!(
            f.port.receive_out().map(|m| m.signal),
            Some(StreamSignal::Drain)
        ));
    }

    #[test]
    fn test_drain_timeout() {
        let mut f = fixture(4);
        assert_eq!(
            f.stream.drain(Duration::from_millis(10)),
            Err(StreamError::DrainTimeout)
        );
    }

    #[test]
    fn test_closed_port() {
        let f = fixture(4);
        f.port.close();
        assert_eq!(f.stream.set_resample_ratio(1.01), Err(StreamError::Closed));
    }
}
