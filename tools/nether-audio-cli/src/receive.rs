//! `receive` command: a remote receiver that accepts every format it
//! advertises and throws the audio away. Useful for exercising the remote
//! sink without a real device.

use std::net::TcpListener;

use anyhow::{Context, Result};
use clap::Args;
use nether_pcm::{AudioFormat, ChannelLayout, DataFormat};
use nethercore_audio::sink::remote::{
    RemoteCapabilities, RemoteError, RemoteReply, RemoteRequest, read_message, write_message,
};
use tracing::{info, warn};

#[derive(Args)]
pub struct ReceiveArgs {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:7700")]
    pub listen: String,
}

fn capabilities() -> RemoteCapabilities {
    RemoteCapabilities {
        sample_rates: vec![44100, 48000],
        layouts: vec![ChannelLayout::stereo(), ChannelLayout::surround_5_1()],
        formats: vec![DataFormat::Float, DataFormat::S16],
        passthrough: Vec::new(),
    }
}

pub fn execute(args: ReceiveArgs) -> Result<()> {
    let listener = TcpListener::bind(&args.listen)
        .with_context(|| format!("Failed to listen on {}", args.listen))?;
    info!("Receiver listening on {}", args.listen);

    for connection in listener.incoming() {
        let mut stream = connection?;
        let peer = stream.peer_addr()?;
        info!("Connection from {}", peer);

        let mut format: Option<AudioFormat> = None;
        let mut frames: u64 = 0;
        loop {
            let request: RemoteRequest = match read_message(&mut stream) {
                Ok(request) => request,
                Err(RemoteError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => {
                    warn!("Receiver - {}: {}", peer, e);
                    break;
                }
            };
            let reply = match request {
                RemoteRequest::Capabilities => RemoteReply::Capabilities(capabilities()),
                RemoteRequest::Open { format: requested } => {
                    info!("Receiver - opened {}", requested);
                    format = Some(requested.clone());
                    RemoteReply::Opened(requested)
                }
                RemoteRequest::Write { frames: count, .. } => {
                    frames += u64::from(count);
                    RemoteReply::Written {
                        frames: count,
                        delay: 0.0,
                    }
                }
                RemoteRequest::Delay => RemoteReply::Delay(0.0),
                RemoteRequest::Drain => RemoteReply::Drained,
                RemoteRequest::Close => RemoteReply::Closed,
            };
            write_message(&mut stream, &reply)?;
        }

        let seconds = format
            .as_ref()
            .map_or(0.0, |format| format.duration_of(frames as usize));
        info!("Disconnected {} after {} frames ({:.2}s)", peer, frames, seconds);
    }
    Ok(())
}
