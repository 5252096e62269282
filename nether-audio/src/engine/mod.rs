//! The engine thread and its public handle
//!
//! Everything that mixes audio lives on one thread. Producers, the sink and
//! the caller talk to it only through message ports:
//!
//! ```text
//!  AudioEngine ──control──┐
//!  AudioEngine ──data─────┤
//!  AudioStream ──stream───┼──► Engine Thread ──sink-data──► Sink Thread ──► device
//!  AudioStream ◄─buffers──┘        │    ▲                       │
//!                                  │    └──────ReturnSample─────┘
//!                                  ▼
//!                             EngineStats (locked, read by callers)
//! ```
//!
//! Each iteration of the loop either dispatches one message to the state
//! machine or, if nothing is queued, a timeout. In the play state a timeout
//! runs one pass of the pipeline:
//!
//! ```text
//! stream input ─► stream resample pool ─┐
//! stream input ─► stream resample pool ─┼─► mix ─► sounds ─► volume ─► [encode] ─► sink pool ─► sink
//! silence pool (sounds only) ───────────┘
//! ```

mod configure;
mod handle;
mod machine;
mod metrics;
mod stages;
mod state;
mod thread;


pub use handle::{AudioEngine, EngineOptions};
pub use state::EngineState;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use hashbrown::{HashMap, HashSet};
use nether_pcm::{AudioFormat, ChannelLayout, DataFormat};
use tracing::{debug, error};

use crate::buffer::{BufferOrigin, BufferPool, PoolId, SampleBuffer};
use crate::config::AudioSettings;
use crate::encoder::AudioEncoder;
use crate::port::{Event, Protocol, Replier};
use crate::protocol::{
    ControlPort, ControlReply, ControlSignal, DataPort, DataReply, DataSignal, SinkEvent,
    StreamPort, StreamSignal,
};
use crate::resampling::ResamplingBufferPool;
use crate::sink::SinkHost;
use crate::sound::{Sound, SoundId};
use crate::stats::EngineStats;
use crate::stream::StreamId;
use crate::volume::SharedVolume;

use metrics::EngineMetrics;
use state::StateCell;

/// Loop timeout before `Init` arrives.
const INITIAL_TIMEOUT: Duration = Duration::from_millis(1000);
/// Tick while configured with nothing to play.
const IDLE_TIMEOUT: Duration = Duration::from_millis(5000);
/// Re-check interval while work is pending but blocked.
const PLAY_TIMEOUT: Duration = Duration::from_millis(100);
/// Tick while in the error state.
const ERROR_TIMEOUT: Duration = Duration::from_millis(1000);
/// Sync timeout for `Init`.
pub const INIT_TIMEOUT: Duration = Duration::from_millis(5000);
/// Sync timeout for a new stream.
pub const NEW_STREAM_TIMEOUT: Duration = Duration::from_millis(1000);

/// Reference format when no stream exists.
pub fn default_format() -> AudioFormat {
    AudioFormat::pcm(DataFormat::Float, 44100, ChannelLayout::stereo(), 4410)
}

/// How the current configuration moves audio to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    /// Bitstream passthrough of a single stream
    Raw,
    /// Mix, then encode into a passthrough codec
    Transcode,
    /// Mix and convert to the sink's PCM format
    Pcm,
}

/// Engine-side state of one producer stream.
struct Stream {
    id: StreamId,
    format: AudioFormat,
    /// Buffers lent to the producer
    input: BufferPool,
    /// Converts to the mixing format; built by `configure`
    resample: Option<ResamplingBufferPool>,
    /// Origins of buffers the producer currently holds
    processing: HashSet<BufferOrigin>,
    port: Arc<StreamPort>,
    volume: SharedVolume,
    drain_pending: bool,
}

impl Stream {
    fn buffered(&self) -> f64 {
        let period = self.input.format().duration_of(self.input.format().frames);
        let queued = self.resample.as_ref().map_or(0.0, |pool| pool.delay());
        self.processing.len() as f64 * period + queued
    }
}

/// A sound being played, as a cursor into its converted samples.
#[derive(Debug, Clone, Copy)]
struct PlayingSound {
    id: SoundId,
    played: usize,
}

/// Pools waiting for their buffers to come home before being dropped.
enum DiscardedPool {
    Plain(BufferPool),
    Resampling(ResamplingBufferPool),
}

impl DiscardedPool {
    fn id(&self) -> PoolId {
        match self {
            DiscardedPool::Plain(pool) => pool.id(),
            DiscardedPool::Resampling(pool) => pool.pool().id(),
        }
    }

    fn return_buffer(&mut self, buffer: SampleBuffer) -> Result<(), SampleBuffer> {
        match self {
            DiscardedPool::Plain(pool) => pool.return_buffer(buffer),
            DiscardedPool::Resampling(pool) => pool.return_buffer(buffer),
        }
    }

    fn is_destroyable(&self) -> bool {
        match self {
            DiscardedPool::Plain(pool) => pool.is_destroyable(),
            DiscardedPool::Resampling(pool) => pool.is_destroyable(),
        }
    }
}

/// One unit of work for the state machine.
pub(crate) enum Input {
    Control(ControlSignal, Replier<ControlReply>),
    Data(DataSignal, Replier<DataReply>),
    Stream(StreamId, StreamSignal),
    Sink(SinkEvent),
    Timeout,
}

impl Input {
    fn describe(&self) -> &'static str {
        match self {
            Input::Control(ControlSignal::Init, _) => "control/init",
            Input::Control(ControlSignal::Reconfigure(_), _) => "control/reconfigure",
            Input::Control(ControlSignal::Volume(_), _) => "control/volume",
            Input::Control(ControlSignal::Mute(_), _) => "control/mute",
            Input::Data(DataSignal::NewSound(_), _) => "data/new-sound",
            Input::Data(DataSignal::PlaySound(_), _) => "data/play-sound",
            Input::Data(DataSignal::FreeSound(_), _) => "data/free-sound",
            Input::Data(DataSignal::NewStream(_), _) => "data/new-stream",
            Input::Data(DataSignal::FreeStream { .. }, _) => "data/free-stream",
            Input::Stream(_, StreamSignal::Sample(_)) => "stream/sample",
            Input::Stream(_, StreamSignal::Drain) => "stream/drain",
            Input::Stream(_, StreamSignal::ResampleRatio(_)) => "stream/ratio",
            Input::Sink(SinkEvent::ReturnSample(_)) => "sink/return",
            Input::Sink(SinkEvent::DeviceChanged) => "sink/device-changed",
            Input::Sink(SinkEvent::Drained) => "sink/drained",
            Input::Sink(SinkEvent::Error(_)) => "sink/error",
            Input::Timeout => "timeout",
        }
    }
}

/// Handles shared between the engine thread and [`AudioEngine`].
#[derive(Clone)]
pub(crate) struct EngineShared {
    pub event: Arc<Event>,
    pub control: Arc<ControlPort>,
    pub data: Arc<DataPort>,
    pub stats: Arc<EngineStats>,
    pub state: Arc<StateCell>,
    pub stop: Arc<AtomicBool>,
    pub master: SharedVolume,
    pub muted: Arc<AtomicBool>,
}

impl EngineShared {
    pub fn new(master_volume: f32) -> Self {
        let event = Arc::new(Event::new());
        Self {
            control: Arc::new(Protocol::new("control", Arc::clone(&event), Arc::new(Event::new()))),
            data: Arc::new(Protocol::new("data", Arc::clone(&event), Arc::new(Event::new()))),
            event,
            stats: Arc::new(EngineStats::new()),
            state: Arc::new(StateCell::new(EngineState::TopUnconfigured)),
            stop: Arc::new(AtomicBool::new(false)),
            master: SharedVolume::new(master_volume),
            muted: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Owns the whole pipeline. Lives on the engine thread.
pub(crate) struct Engine {
    shared: EngineShared,
    state: EngineState,
    ext_timeout: Duration,
    self_trigger: bool,
    sink: SinkHost,
    settings: AudioSettings,
    encoder: Option<Box<dyn AudioEncoder>>,
    keep_config: Duration,

    mode: EngineMode,
    reference_format: Option<AudioFormat>,
    sink_request_format: Option<AudioFormat>,
    internal_format: Option<AudioFormat>,

    sink_buffers: Option<ResamplingBufferPool>,
    encoder_buffers: Option<BufferPool>,
    silence_buffers: Option<ResamplingBufferPool>,
    discarded: Vec<DiscardedPool>,

    streams: Vec<Stream>,
    sounds: HashMap<SoundId, Sound>,
    playing: Vec<PlayingSound>,

    /// Drop back to the default configuration once the last stream is gone
    reconfigure_at: Option<Instant>,
    started: Instant,
    next_stream: usize,
    metrics: EngineMetrics,
}

impl Engine {
    pub fn new(
        shared: EngineShared,
        sink: SinkHost,
        settings: AudioSettings,
        options: EngineOptions,
    ) -> Self {
        shared.master.set(settings.master_volume);
        Self {
            shared,
            state: EngineState::TopUnconfigured,
            ext_timeout: INITIAL_TIMEOUT,
            self_trigger: false,
            sink,
            settings,
            encoder: options.encoder,
            keep_config: options.keep_config,
            mode: EngineMode::Pcm,
            reference_format: None,
            sink_request_format: None,
            internal_format: None,
            sink_buffers: None,
            encoder_buffers: None,
            silence_buffers: None,
            discarded: Vec::new(),
            streams: Vec::new(),
            sounds: HashMap::new(),
            playing: Vec::new(),
            reconfigure_at: None,
            started: Instant::now(),
            next_stream: 0,
            metrics: EngineMetrics::new(),
        }
    }

    fn set_state(&mut self, state: EngineState) {
        if state != self.state {
            debug!("Engine::set_state - {} -> {}", self.state, state);
            self.state = state;
            self.shared.state.set(state);
        }
    }

    /// Move to `state` and loop again without waiting.
    fn enter(&mut self, state: EngineState) {
        self.set_state(state);
        self.ext_timeout = Duration::ZERO;
    }

    /// Engine clock in milliseconds, stamped on buffers.
    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn is_muted(&self) -> bool {
        self.shared.muted.load(Ordering::Acquire)
    }

    fn stream_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.streams.iter_mut().find(|stream| stream.id == id)
    }

    /// Every pool a buffer may belong to.
    fn pools_mut(&mut self) -> impl Iterator<Item = PoolRef<'_>> {
        let streams = self.streams.iter_mut().flat_map(|stream| {
            std::iter::once(PoolRef::Plain(&mut stream.input))
                .chain(stream.resample.as_mut().map(PoolRef::Resampling))
        });
        streams
            .chain(self.sink_buffers.as_mut().map(PoolRef::Resampling))
            .chain(self.silence_buffers.as_mut().map(PoolRef::Resampling))
            .chain(self.encoder_buffers.as_mut().map(PoolRef::Plain))
            .chain(self.discarded.iter_mut().map(PoolRef::Discarded))
    }

    /// Route a buffer back to the pool that issued it.
    fn return_buffer(&mut self, buffer: SampleBuffer) {
        let owner = buffer.pool();
        match self.pools_mut().find(|pool| pool.id() == owner) {
            Some(pool) => {
                if pool.return_buffer(buffer).is_err() {
                    error!("Engine::return_buffer - pool {:?} refused its buffer", owner);
                }
            }
            None => error!("Engine::return_buffer - no pool {:?} for buffer", owner),
        }
    }

    fn return_all(&mut self, buffers: Vec<SampleBuffer>) {
        for buffer in buffers {
            self.return_buffer(buffer);
        }
    }
}

/// Borrowed view over the different pool kinds for buffer routing.
enum PoolRef<'a> {
    Plain(&'a mut BufferPool),
    Resampling(&'a mut ResamplingBufferPool),
    Discarded(&'a mut DiscardedPool),
}

impl PoolRef<'_> {
    fn id(&self) -> PoolId {
        match self {
            PoolRef::Plain(pool) => pool.id(),
            PoolRef::Resampling(pool) => pool.pool().id(),
            PoolRef::Discarded(pool) => pool.id(),
        }
    }

    fn return_buffer(self, buffer: SampleBuffer) -> Result<(), SampleBuffer> {
        match self {
            PoolRef::Plain(pool) => pool.return_buffer(buffer),
            PoolRef::Resampling(pool) => pool.return_buffer(buffer),
            PoolRef::Discarded(pool) => pool.return_buffer(buffer),
        }
    }
}
