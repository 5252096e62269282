//! Engine error types

use std::io;

use nether_pcm::PcmError;
use thiserror::Error;

/// Failures of a message port exchange.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PortError {
    /// No reply arrived within the allowed time
    #[error("port {port}: no reply within {millis}ms")]
    Timeout { port: &'static str, millis: u64 },
    /// The message was released without a reply
    #[error("port {port}: message released without reply")]
    NoReply { port: &'static str },
    /// A synchronous send from the consuming thread with no inline handler
    #[error("port {port}: synchronous send from the consuming thread")]
    WouldDeadlock { port: &'static str },
    /// The port has been closed
    #[error("port {port} is closed")]
    Closed { port: &'static str },
}

/// Failures reported by an output sink.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinkError {
    #[error("no output device named '{0}'")]
    DeviceNotFound(String),
    #[error("format not supported by sink: {0}")]
    Unsupported(String),
    #[error("sink open failed: {0}")]
    Open(String),
    #[error("sink write failed: {0}")]
    Write(String),
    #[error("sink drain failed: {0}")]
    Drain(String),
    #[error("sink is not initialized")]
    NotInitialized,
    /// The negotiated configuration is no longer valid (device went away)
    #[error("sink lost its negotiated configuration")]
    ConfigLost,
    #[error(transparent)]
    Port(#[from] PortError),
}

/// Errors while loading a sound clip.
#[derive(Debug, Error)]
pub enum SoundError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("WAV decode error: {0}")]
    Decode(#[from] hound::Error),
    #[error("unsupported sample format: {bits}-bit {kind}")]
    UnsupportedFormat { bits: u16, kind: &'static str },
    #[error("unsupported channel count: {0}")]
    UnsupportedChannels(u16),
    #[error("sound contains no samples")]
    Empty,
}

/// Errors seen by a stream producer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    /// The engine has torn the stream down
    #[error("stream is closed")]
    Closed,
    #[error("stream format is {actual}, data was supplied as {supplied}")]
    FormatMismatch {
        actual: &'static str,
        supplied: &'static str,
    },
    #[error("timed out waiting for the stream to drain")]
    DrainTimeout,
    #[error(transparent)]
    Port(#[from] PortError),
}

/// Reasons a new stream request is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StreamRejected {
    /// A raw passthrough stream is active; nothing else may join it
    #[error("a passthrough stream is already active")]
    PassthroughActive,
    /// Raw streams cannot be mixed with other streams
    #[error("a passthrough stream cannot join active streams")]
    PassthroughNotExclusive,
    /// The engine is not in a configured state
    #[error("engine is not configured")]
    NotConfigured,
    #[error("invalid stream format")]
    InvalidFormat,
}

/// Configuration file errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Failed to determine config directory")]
    NoConfigDirectory,
}

/// Top-level engine errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("engine initialization failed")]
    InitFailed,
    #[error("engine thread is not running")]
    NotRunning,
    #[error(transparent)]
    Port(#[from] PortError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Sound(#[from] SoundError),
    #[error(transparent)]
    Stream(#[from] StreamRejected),
    #[error(transparent)]
    Pcm(#[from] PcmError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PortError::Timeout {
            port: "control",
            millis: 5000,
        };
        assert_eq!(err.to_string(), "port control: no reply within 5000ms");

        let err = EngineError::from(StreamRejected::PassthroughActive);
        assert_eq!(err.to_string(), "a passthrough stream is already active");

        let err = SinkError::from(PortError::Closed { port: "sink-control" });
        assert_eq!(err.to_string(), "port sink-control is closed");
    }
}
