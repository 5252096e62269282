use crate::format::DataFormat;

/// Errors raised when building a conversion between two formats.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PcmError {
    /// A sample rate of zero was supplied
    #[error("invalid sample rate: {0}")]
    InvalidSampleRate(u32),
    /// The channel layout is empty
    #[error("channel layout has no channels")]
    EmptyLayout,
    /// Raw bitstreams can only be passed through, never converted
    #[error("cannot convert raw stream {from} to {to}")]
    RawConversion { from: DataFormat, to: DataFormat },
}
