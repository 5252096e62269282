//! Nethercore audio engine
//!
//! A single engine thread mixes any number of PCM producer streams and
//! one-shot sounds, converts the result to what the output sink negotiated
//! and hands it to a dedicated sink thread. A lone encoded stream can
//! instead be passed to the sink untouched (passthrough), or the mix can be
//! handed to an [`AudioEncoder`] (transcode).
//!
//! # Threads
//!
//! | Thread | Owns |
//! |--------|------|
//! | caller | [`AudioEngine`], [`AudioStream`], [`SoundHandle`] |
//! | `audio-engine` | state machine, buffer pools, mixer |
//! | `audio-sink` | the [`AudioSink`] implementation |
//!
//! Nothing is shared between them except message ports, the stats lock and
//! a few atomics (volumes, mute, state). See [`engine`] for the pipeline.
//!
//! # Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use nether_pcm::{AudioFormat, ChannelLayout, DataFormat};
//! use nethercore_audio::{AudioEngine, AudioSettings, EngineOptions, NullSink, StreamRequest};
//!
//! let engine = AudioEngine::start(
//!     AudioSettings::default(),
//!     Box::new(NullSink::realtime()),
//!     EngineOptions::default(),
//! )?;
//! let format = AudioFormat::pcm(DataFormat::Float, 48000, ChannelLayout::stereo(), 0);
//! let mut stream = engine.make_stream(StreamRequest::new(format))?;
//! stream.add_f32(&vec![0.0; 48000 * 2], Duration::from_secs(2))?;
//! stream.drain(Duration::from_secs(2))?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod buffer;
pub mod config;
pub mod encoder;
pub mod engine;
pub mod error;
pub mod port;
pub mod protocol;
pub mod resampling;
pub mod sink;
pub mod sound;
pub mod stats;
pub mod stream;
pub mod volume;

pub use config::{AudioConfig, AudioSettings};
pub use encoder::AudioEncoder;
pub use engine::{AudioEngine, EngineOptions, EngineState};
pub use error::{EngineError, SinkError, SoundError, StreamError, StreamRejected};
#[cfg(feature = "cpal")]
pub use sink::CpalSink;
pub use sink::{AudioSink, NullSink, RemoteSink};
pub use sound::SoundHandle;
pub use stream::{AudioStream, StreamRequest};
