//! Signals exchanged over the engine's ports
//!
//! One enum per direction per port. Payloads that carry a [`SampleBuffer`]
//! move ownership of that buffer with the message.

use nether_pcm::AudioFormat;

use crate::buffer::SampleBuffer;
use crate::config::AudioSettings;
use crate::error::{SinkError, StreamRejected};
use crate::port::Protocol;
use crate::sound::{Sound, SoundId};
use crate::stream::{StreamGrant, StreamId, StreamRequest};

/// Lifecycle requests to the engine.
#[derive(Debug)]
pub enum ControlSignal {
    Init,
    Reconfigure(Box<AudioSettings>),
    Volume(f32),
    Mute(bool),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlReply {
    Acc,
    Error,
}

/// Data-plane requests to the engine.
#[derive(Debug)]
pub enum DataSignal {
    NewSound(Box<Sound>),
    PlaySound(SoundId),
    FreeSound(SoundId),
    NewStream(StreamRequest),
    /// Tear a stream down; `returned` holds every buffer the producer still had
    FreeStream {
        stream: StreamId,
        returned: Vec<SampleBuffer>,
    },
}

pub enum DataReply {
    Acc,
    Stream(StreamGrant),
    Error(StreamRejected),
}

/// Producer to engine, on a stream's own port.
#[derive(Debug)]
pub enum StreamSignal {
    /// A filled buffer. An empty one is simply handed back to its pool.
    Sample(SampleBuffer),
    Drain,
    ResampleRatio(f64),
}

/// Engine to producer.
#[derive(Debug)]
pub enum StreamReply {
    /// An empty buffer to fill
    Buffer(SampleBuffer),
    Drained,
}

#[derive(Debug)]
pub enum SinkControl {
    Configure { format: AudioFormat, device: String },
    Deinitialize,
}

#[derive(Debug)]
pub enum SinkControlReply {
    Configured(AudioFormat),
    Done,
    Error(SinkError),
}

/// Engine to sink, ordered: a drain completes only after every sample
/// queued before it.
#[derive(Debug)]
pub enum SinkData {
    Sample(SampleBuffer),
    Drain,
}

/// Sink to engine.
#[derive(Debug)]
pub enum SinkEvent {
    ReturnSample(SampleBuffer),
    /// The device lost its negotiated configuration
    DeviceChanged,
    Drained,
    Error(SinkError),
}

pub type ControlPort = Protocol<ControlSignal, ControlReply>;
pub type DataPort = Protocol<DataSignal, DataReply>;
pub type StreamPort = Protocol<StreamSignal, StreamReply>;
pub type SinkControlPort = Protocol<SinkControl, SinkControlReply>;
pub type SinkDataPort = Protocol<SinkData, SinkEvent>;
