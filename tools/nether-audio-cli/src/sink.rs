//! Output selection shared by the commands

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use nethercore_audio::{AudioSink, NullSink, RemoteSink};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Args)]
pub struct SinkArgs {
    /// Discard output at real-time pace instead of playing it
    #[arg(long, conflicts_with = "remote")]
    pub null: bool,

    /// Stream to a remote receiver (host:port)
    #[arg(long)]
    pub remote: Option<String>,
}

pub fn open_sink(args: &SinkArgs) -> Result<Box<dyn AudioSink>> {
    if let Some(addr) = &args.remote {
        let sink = RemoteSink::connect(addr, CONNECT_TIMEOUT)
            .with_context(|| format!("Failed to connect to receiver at {}", addr))?;
        return Ok(Box::new(sink));
    }
    if args.null {
        return Ok(Box::new(NullSink::realtime()));
    }
    Ok(device_sink())
}

#[cfg(feature = "cpal")]
fn device_sink() -> Box<dyn AudioSink> {
    Box::new(nethercore_audio::CpalSink::new())
}

#[cfg(not(feature = "cpal"))]
fn device_sink() -> Box<dyn AudioSink> {
    tracing::warn!("Built without device output, discarding audio");
    Box::new(NullSink::realtime())
}
