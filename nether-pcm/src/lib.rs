//! Nether-PCM: sample formats and conversion for the Nethercore audio engine
//!
//! **This is a pure toolkit** - it owns no threads and performs no I/O. The
//! engine (`nethercore-audio`) builds its buffer pools and mixer on top of it.
//!
//! # Contents
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`format`] | `AudioFormat`, `DataFormat`, raw passthrough codecs |
//! | [`channels`] | Named speaker positions and standard layouts |
//! | [`packet`] | `SoundPacket`, word-aligned plane storage |
//! | [`convert`] | Sample representation to/from `f32` |
//! | [`remap`] | Channel matrix (downmix/upmix) |
//! | [`resample`] | Rate conversion with a carried backlog |
//! | [`mix`] | Multiply-accumulate kernels |
//!
//! # Sample storage
//!
//! Planes are stored as `Vec<u32>` so that every plane is 4-byte aligned and
//! can be viewed as `u8`, `i16`, `i32` or `f32` through `bytemuck` without
//! copying:
//!
//! ```text
//! interleaved (S16, 2ch):  plane 0 = L0 R0 L1 R1 L2 R2 ...
//! planar     (FloatP, 2ch): plane 0 = L0 L1 L2 ...
//!                           plane 1 = R0 R1 R2 ...
//! ```
//!
//! # Usage
//!
//! ```
//! use nether_pcm::{AudioFormat, ChannelLayout, DataFormat, Resampler, SoundPacket};
//!
//! let src = AudioFormat::pcm(DataFormat::S16, 48000, ChannelLayout::stereo(), 480);
//! let dst = AudioFormat::pcm(DataFormat::Float, 48000, ChannelLayout::stereo(), 480);
//!
//! let mut input = SoundPacket::new(src.sample_config(), 480);
//! input.fill_silence();
//!
//! let mut resampler = Resampler::new(&src, &dst, false).unwrap();
//! let output = resampler.convert_all(&input);
//! assert_eq!(output.nb_samples, 480);
//! ```

pub mod channels;
pub mod convert;
mod error;
pub mod format;
pub mod mix;
pub mod packet;
pub mod remap;
pub mod resample;

pub use channels::{Channel, ChannelLayout};
pub use error::PcmError;
pub use format::{AudioFormat, DataFormat, RawCodec, RawStreamInfo, SampleConfig};
pub use packet::SoundPacket;
pub use resample::Resampler;
