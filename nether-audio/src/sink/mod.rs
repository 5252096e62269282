//! Output sinks and the thread that drives them
//!
//! ```text
//! Engine Thread                  Sink Thread                 Device
//!     │                               │                         │
//! [configure]──(control, sync)──►[initialize]                   │
//! [send_sample]──(data)─────────►[add_packets]──────────────►[play]
//!     ◄────────(ReturnSample)──────[update stats]                │
//! [drain]──(data, sync)─────────►[drain]                        │
//! ```
//!
//! Drains travel on the data port behind queued samples, so a drain reply
//! means every earlier sample has been written and handed back.

#[cfg(feature = "cpal")]
mod device;
mod null;
pub mod remote;

#[cfg(feature = "cpal")]
pub use device::{CpalSink, output_devices};
pub use null::NullSink;
pub use remote::RemoteSink;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nether_pcm::{AudioFormat, SoundPacket};
use tracing::{debug, error, info, warn};

use crate::buffer::SampleBuffer;
use crate::error::{EngineError, SinkError};
use crate::port::{Event, Protocol};
use crate::protocol::{
    SinkControl, SinkControlPort, SinkControlReply, SinkData, SinkDataPort, SinkEvent,
};
use crate::stats::EngineStats;

/// Sync timeout for sink configure and drain.
pub const SINK_TIMEOUT: Duration = Duration::from_millis(2000);

/// Sink thread wake interval when idle.
const IDLE_WAIT: Duration = Duration::from_millis(100);

/// Back-off when the device has no room for more frames.
const FULL_WAIT: Duration = Duration::from_millis(2);

/// An audio output endpoint. Called only from the sink thread.
pub trait AudioSink: Send {
    fn name(&self) -> &str;

    /// Open `device` for `format`. Returns the format actually in use, which
    /// may differ in rate, layout, sample type or period size.
    fn initialize(&mut self, format: &AudioFormat, device: &str) -> Result<AudioFormat, SinkError>;

    /// Write frames of `packet` from frame `offset` on. Returns how many
    /// were accepted; 0 means no room right now.
    ///
    /// [`SinkError::ConfigLost`] reports that the device went away.
    fn add_packets(&mut self, packet: &SoundPacket, offset: usize) -> Result<usize, SinkError>;

    /// Seconds of audio written but not yet heard.
    fn delay(&self) -> f64;

    /// Block until written audio has played.
    fn drain(&mut self) -> Result<(), SinkError>;

    fn deinitialize(&mut self);
}

/// Engine-side handle to the sink thread.
pub struct SinkHost {
    control: Arc<SinkControlPort>,
    data: Arc<SinkDataPort>,
    wake: Arc<Event>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    name: String,
    requested: Option<(AudioFormat, String)>,
    format: Option<AudioFormat>,
    valid: bool,
}

impl SinkHost {
    /// Start the sink thread. Returned samples and device notifications
    /// set `engine_event`.
    pub fn spawn(
        sink: Box<dyn AudioSink>,
        engine_event: Arc<Event>,
        stats: Arc<EngineStats>,
    ) -> Result<Self, EngineError> {
        let wake = Arc::new(Event::new());
        let control = Arc::new(Protocol::new(
            "sink-control",
            Arc::clone(&wake),
            Arc::new(Event::new()),
        ));
        let data = Arc::new(Protocol::new("sink-data", Arc::clone(&wake), engine_event));
        let stop = Arc::new(AtomicBool::new(false));
        let name = sink.name().to_string();

        let mut worker = SinkWorker {
            sink,
            control: Arc::clone(&control),
            data: Arc::clone(&data),
            wake: Arc::clone(&wake),
            stop: Arc::clone(&stop),
            stats,
            open: false,
        };
        let thread = thread::Builder::new()
            .name("audio-sink".into())
            .spawn(move || worker.run())
            .map_err(|source| EngineError::Spawn {
                name: "audio-sink",
                source,
            })?;

        Ok(Self {
            control,
            data,
            wake,
            stop,
            thread: Some(thread),
            name,
            requested: None,
            format: None,
            valid: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Negotiated format, if the sink is open.
    pub fn format(&self) -> Option<&AudioFormat> {
        self.format.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.format.is_some() && self.valid
    }

    /// Whether a request for `format` on `device` needs the sink reopened.
    pub fn needs_reconfigure(&self, format: &AudioFormat, device: &str) -> bool {
        if !self.is_open() {
            return true;
        }
        match &self.requested {
            Some((requested, requested_device)) => {
                !requested.same_stream_shape(format)
                    || requested.stream_info != format.stream_info
                    || requested_device != device
            }
            None => true,
        }
    }

    /// Mark the open configuration unusable (device changed).
    pub fn invalidate(&mut self) {
        self.valid = false;
    }

    /// Open the sink for `format`. Samples still queued for the old
    /// configuration are returned unplayed.
    pub fn configure(&mut self, format: &AudioFormat, device: &str) -> Result<AudioFormat, SinkError> {
        self.format = None;
        self.requested = None;
        let signal = SinkControl::Configure {
            format: format.clone(),
            device: device.to_string(),
        };
        match self.control.send_out_sync(signal, SINK_TIMEOUT)? {
            SinkControlReply::Configured(actual) => {
                info!(
                    "SinkHost::configure - {} opened '{}' as {}",
                    self.name, device, actual
                );
                self.requested = Some((format.clone(), device.to_string()));
                self.format = Some(actual.clone());
                self.valid = true;
                Ok(actual)
            }
            SinkControlReply::Error(e) => Err(e),
            SinkControlReply::Done => Err(SinkError::Open("unexpected reply".into())),
        }
    }

    /// Close the device without tearing down the thread.
    pub fn deinitialize(&mut self) -> Result<(), SinkError> {
        self.format = None;
        self.requested = None;
        match self.control.send_out_sync(SinkControl::Deinitialize, SINK_TIMEOUT)? {
            SinkControlReply::Error(e) => Err(e),
            _ => Ok(()),
        }
    }

    /// Wait until every queued sample has been written and played.
    pub fn drain(&self) -> Result<(), SinkError> {
        match self.data.send_out_sync(SinkData::Drain, SINK_TIMEOUT)? {
            SinkEvent::Drained => Ok(()),
            SinkEvent::Error(e) => Err(e),
            _ => Err(SinkError::Drain("unexpected reply".into())),
        }
    }

    /// Queue a buffer for output; handed back if the sink thread is gone.
    pub fn send_sample(&self, buffer: SampleBuffer) -> Result<(), SampleBuffer> {
        match self.data.post(SinkData::Sample(buffer)) {
            Ok(()) => Ok(()),
            Err(SinkData::Sample(buffer)) => Err(buffer),
            Err(SinkData::Drain) => Ok(()),
        }
    }

    /// Next returned sample or notification.
    pub fn receive_event(&self) -> Option<SinkEvent> {
        self.data.receive_in()
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.control.close();
        self.data.close();
        self.wake.set();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SinkHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct SinkWorker {
    sink: Box<dyn AudioSink>,
    control: Arc<SinkControlPort>,
    data: Arc<SinkDataPort>,
    wake: Arc<Event>,
    stop: Arc<AtomicBool>,
    stats: Arc<EngineStats>,
    open: bool,
}

impl SinkWorker {
    fn run(&mut self) {
        debug!("Sink thread started ({})", self.sink.name());
        self.control.bind_consumer();
        self.data.bind_consumer();

        while !self.stop.load(Ordering::Acquire) {
            if let Some(message) = self.control.receive_out() {
                let (signal, replier) = message.into_parts();
                replier.reply(self.handle_control(signal));
                continue;
            }
            if let Some(message) = self.data.receive_out() {
                let (signal, replier) = message.into_parts();
                match signal {
                    SinkData::Sample(buffer) => self.write(buffer),
                    SinkData::Drain => {
                        replier.reply(self.drain());
                    }
                }
                continue;
            }
            self.wake.wait(IDLE_WAIT);
        }

        if self.open {
            self.sink.deinitialize();
        }
        self.return_queued();
        debug!("Sink thread finished");
    }

    fn handle_control(&mut self, signal: SinkControl) -> SinkControlReply {
        match signal {
            SinkControl::Configure { format, device } => {
                self.return_queued();
                if self.open {
                    self.sink.deinitialize();
                    self.open = false;
                }
                match self.sink.initialize(&format, &device) {
                    Ok(actual) => {
                        self.open = true;
                        SinkControlReply::Configured(actual)
                    }
                    Err(e) => {
                        error!("Sink::initialize - {} failed: {}", self.sink.name(), e);
                        SinkControlReply::Error(e)
                    }
                }
            }
            SinkControl::Deinitialize => {
                self.return_queued();
                if self.open {
                    self.sink.deinitialize();
                    self.open = false;
                }
                SinkControlReply::Done
            }
        }
    }

    fn drain(&mut self) -> SinkEvent {
        if !self.open {
            return SinkEvent::Drained;
        }
        match self.sink.drain() {
            Ok(()) => SinkEvent::Drained,
            Err(e) => {
                error!("Sink::drain - {} failed: {}", self.sink.name(), e);
                SinkEvent::Error(e)
            }
        }
    }

    fn write(&mut self, buffer: SampleBuffer) {
        let frames = buffer.pkt.nb_samples;
        let mut offset = 0;
        while self.open && offset < frames {
            match self.sink.add_packets(&buffer.pkt, offset) {
                Ok(0) => {
                    if self.stop.load(Ordering::Acquire) {
                        break;
                    }
                    thread::sleep(FULL_WAIT);
                }
                Ok(written) => offset += written,
                Err(SinkError::ConfigLost) => {
                    warn!("Sink::add_packets - {} lost its device", self.sink.name());
                    self.sink.deinitialize();
                    self.open = false;
                    self.data.send_in(SinkEvent::DeviceChanged);
                }
                Err(e) => {
                    error!("Sink::add_packets - {} failed: {}", self.sink.name(), e);
                    break;
                }
            }
        }
        let delay = if self.open { self.sink.delay() } else { 0.0 };
        self.stats.update_sink_delay(delay, frames);
        self.data.send_in(SinkEvent::ReturnSample(buffer));
    }

    /// Hand back samples queued for a configuration that no longer exists.
    fn return_queued(&mut self) {
        for message in self.data.drain_out() {
            let (signal, replier) = message.into_parts();
            match signal {
                SinkData::Sample(buffer) => {
                    self.stats.update_sink_delay(0.0, buffer.pkt.nb_samples);
                    self.data.send_in(SinkEvent::ReturnSample(buffer));
                }
                SinkData::Drain => {
                    replier.reply(SinkEvent::Drained);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use nether_pcm::{ChannelLayout, DataFormat};
    use std::sync::Mutex;

    /// Counts frames and can be told to lose its device.
    struct CountingSink {
        written: Arc<Mutex<usize>>,
        lose_device: Arc<AtomicBool>,
    }

    impl AudioSink for CountingSink {
        fn name(&self) -> &str {
            "counting"
        }

        fn initialize(
            &mut self,
            format: &AudioFormat,
            _device: &str,
        ) -> Result<AudioFormat, SinkError> {
            if format.sample_rate == 0 {
                return Err(SinkError::Unsupported("zero rate".into()));
            }
            Ok(format.clone())
        }

        fn add_packets(&mut self, packet: &SoundPacket, offset: usize) -> Result<usize, SinkError> {
            if self.lose_device.load(Ordering::Acquire) {
                return Err(SinkError::ConfigLost);
            }
            let frames = packet.nb_samples - offset;
            *self.written.lock().unwrap() += frames;
            Ok(frames)
        }

        fn delay(&self) -> f64 {
            0.0
        }

        fn drain(&mut self) -> Result<(), SinkError> {
            Ok(())
        }

        fn deinitialize(&mut self) {}
    }

    fn host() -> (SinkHost, Arc<Event>, Arc<Mutex<usize>>, Arc<AtomicBool>, Arc<EngineStats>) {
        let written = Arc::new(Mutex::new(0));
        let lose = Arc::new(AtomicBool::new(false));
        let sink = CountingSink {
            written: Arc::clone(&written),
            lose_device: Arc::clone(&lose),
        };
        let event = Arc::new(Event::new());
        let stats = Arc::new(EngineStats::new());
        let host = SinkHost::spawn(Box::new(sink), Arc::clone(&event), Arc::clone(&stats)).unwrap();
        (host, event, written, lose, stats)
    }

    fn format() -> AudioFormat {
        AudioFormat::pcm(DataFormat::Float, 48000, ChannelLayout::stereo(), 480)
    }

    #[test]
    fn test_configure_and_reconfigure_check() {
        let (mut host, ..) = host();
        assert!(host.needs_reconfigure(&format(), "default"));

        let actual = host.configure(&format(), "default").unwrap();
        assert_eq!(actual, format());
        assert!(host.is_open());
        assert!(!host.needs_reconfigure(&format(), "default"));
        assert!(host.needs_reconfigure(&format(), "other"));

        host.invalidate();
        assert!(host.needs_reconfigure(&format(), "default"));
    }

    #[test]
    fn test_configure_error_is_reported() {
        let (mut host, ..) = host();
        let mut bad = format();
        bad.sample_rate = 0;
        assert!(matches!(
            host.configure(&bad, "default"),
            Err(SinkError::Unsupported(_))
        ));
        assert!(!host.is_open());
    }

    #[test]
    fn test_samples_return_after_drain() {
        let (mut host, _event, written, _lose, stats) = host();
        let actual = host.configure(&format(), "default").unwrap();
        stats.reset(actual.sample_rate);

        let mut pool = BufferPool::new(actual);
        pool.create(0);
        for _ in 0..3 {
            let mut buffer = pool.get_free_buffer().unwrap();
            buffer.pkt.nb_samples = 480;
            stats.add_samples(480, &[]);
            host.send_sample(buffer).unwrap();
        }

        host.drain().unwrap();
        while let Some(event) = host.receive_event() {
            match event {
                SinkEvent::ReturnSample(buffer) => pool.return_buffer(buffer).unwrap(),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(pool.is_destroyable());
        assert_eq!(*written.lock().unwrap(), 1440);
        assert_eq!(stats.buffered_samples(), 0);
    }

    #[test]
    fn test_device_loss_is_reported() {
        let (mut host, event, _written, lose, stats) = host();
        let actual = host.configure(&format(), "default").unwrap();
        stats.reset(actual.sample_rate);
        lose.store(true, Ordering::Release);

        let mut pool = BufferPool::new(actual);
        pool.create(0);
        let mut buffer = pool.get_free_buffer().unwrap();
        buffer.pkt.nb_samples = 480;
        stats.add_samples(480, &[]);
        host.send_sample(buffer).unwrap();
        host.drain().unwrap();

        assert!(event.wait(Duration::from_secs(1)));
        let mut changed = false;
        while let Some(event) = host.receive_event() {
            match event {
                SinkEvent::DeviceChanged => changed = true,
                SinkEvent::ReturnSample(buffer) => pool.return_buffer(buffer).unwrap(),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert!(changed);
        assert!(pool.is_destroyable());
    }
}
