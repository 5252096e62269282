//! Bitstream encoder seam used in transcode mode

use nether_pcm::{AudioFormat, ChannelLayout, DataFormat, RawCodec, RawStreamInfo, SoundPacket};
use thiserror::Error;

/// Frames per transcode packet.
pub const TRANSCODE_FRAMES: usize = 1536;
/// Sample rate of the transcode pipeline and the encoded stream.
pub const TRANSCODE_RATE: u32 = 48000;

/// Mixing format while transcoding: float 5.1 in encoder-sized packets.
pub fn transcode_input_format() -> AudioFormat {
    AudioFormat::pcm(
        DataFormat::Float,
        TRANSCODE_RATE,
        ChannelLayout::surround_5_1(),
        TRANSCODE_FRAMES,
    )
}

/// Sink request for an encoded `codec` stream, packed in a stereo S16
/// container.
pub fn transcode_output_format(codec: RawCodec) -> AudioFormat {
    let info = RawStreamInfo {
        codec,
        sample_rate: TRANSCODE_RATE,
        channels: 6,
    };
    AudioFormat::raw(info, TRANSCODE_RATE, ChannelLayout::stereo(), TRANSCODE_FRAMES)
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("encoder expects {expected} frames, got {actual}")]
    FrameCount { expected: usize, actual: usize },
    #[error("encoded frame does not fit the output packet")]
    Overflow,
    #[error("encoder failure: {0}")]
    Codec(String),
}

/// Encodes mixed PCM into a passthrough codec.
///
/// The engine mixes into packets of [`transcode_input_format`] and hands
/// each one to [`encode`](Self::encode) together with an empty packet of
/// [`transcode_output_format`], the container the sink receives.
pub trait AudioEncoder: Send {
    fn codec(&self) -> RawCodec;

    /// Encode one full input packet, appending to `output`. Returns the
    /// number of container frames written.
    fn encode(&mut self, input: &SoundPacket, output: &mut SoundPacket)
    -> Result<usize, EncodeError>;

    /// Encoder latency in seconds.
    fn delay(&self) -> f64 {
        0.0
    }
}
