//! Nether Audio - command line front end for the audio engine
//!
//! # Commands
//!
//! - `nether-audio play <file.wav>` - Stream a WAV file through the engine
//! - `nether-audio play --sound <file.wav>` - Play it as a one-shot sound
//! - `nether-audio devices` - List output devices
//! - `nether-audio config` - Show or create `audio.toml`
//! - `nether-audio receive` - Run a remote receiver that swallows audio
//!
//! # Usage
//!
//! ```bash
//! # Play through a receiver on another machine
//! nether-audio receive --listen 0.0.0.0:7700
//! nether-audio play music.wav --remote 192.168.1.20:7700
//!
//! # Verbose engine logs
//! RUST_LOG=nethercore_audio=debug nether-audio play music.wav --null
//! ```

mod config;
mod devices;
mod play;
mod receive;
mod sink;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// Nether Audio - play files through the Nethercore audio engine
#[derive(Parser)]
#[command(name = "nether-audio")]
#[command(about = "Play audio through the Nethercore audio engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play a WAV file as a stream or a sound
    Play(play::PlayArgs),

    /// List output devices
    Devices,

    /// Show the audio configuration
    Config(config::ConfigArgs),

    /// Accept a remote sink connection and discard what it sends
    Receive(receive::ReceiveArgs),
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Play(args) => play::execute(args),
        Commands::Devices => devices::execute(),
        Commands::Config(args) => config::execute(args),
        Commands::Receive(args) => receive::execute(args),
    }
}
