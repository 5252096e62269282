//! `play` command

use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::Args;
use nether_pcm::{AudioFormat, ChannelLayout, DataFormat};
use nethercore_audio::{AudioEngine, EngineOptions, StreamRequest, config};
use tracing::info;

use crate::sink::{SinkArgs, open_sink};

/// How long a blocked write may wait for the engine.
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);
/// Upper bound for the final drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Args)]
pub struct PlayArgs {
    /// WAV file to play
    pub file: PathBuf,

    /// Play as a one-shot sound instead of a stream
    #[arg(long)]
    pub sound: bool,

    /// Volume (0.0 - 1.0)
    #[arg(long, default_value_t = 1.0)]
    pub volume: f32,

    #[command(flatten)]
    pub sink: SinkArgs,
}

pub fn execute(args: PlayArgs) -> Result<()> {
    let settings = config::load().settings();
    let sink = open_sink(&args.sink)?;
    let engine = AudioEngine::start(settings, sink, EngineOptions::default())
        .context("Failed to start audio engine")?;

    let result = if args.sound {
        play_sound(&engine, &args.file, args.volume)
    } else {
        play_stream(&engine, &args.file, args.volume)
    };
    engine.shutdown();
    result
}

fn play_sound(engine: &AudioEngine, path: &Path, volume: f32) -> Result<()> {
    let sound = engine
        .make_sound(path)
        .with_context(|| format!("Failed to load {}", path.display()))?;
    sound.set_volume(volume);
    info!("Playing {} ({:.2}s) as sound", path.display(), sound.duration());

    engine.play_sound(&sound)?;
    let tail = engine.delay() + 0.2;
    thread::sleep(Duration::from_secs_f64(sound.duration() + tail));
    engine.free_sound(sound)?;
    Ok(())
}

/// Interleaved float samples and stream format of a WAV file.
fn read_wav(path: &Path) -> Result<(AudioFormat, Vec<f32>)> {
    let mut reader = hound::WavReader::open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let spec = reader.spec();
    let layout = ChannelLayout::for_count(spec.channels as usize)
        .ok_or_else(|| anyhow!("Unsupported channel count: {}", spec.channels))?;

    let samples = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<Vec<_>, _>>()?,
        hound::SampleFormat::Int => {
            let scale = 1.0 / (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|sample| sample.map(|value| value as f32 * scale))
                .collect::<Result<Vec<_>, _>>()?
        }
    };
    let format = AudioFormat::pcm(DataFormat::Float, spec.sample_rate, layout, 0);
    Ok((format, samples))
}

fn play_stream(engine: &AudioEngine, path: &Path, volume: f32) -> Result<()> {
    let (format, samples) = read_wav(path)?;
    let channels = format.channel_count();
    let total_frames = samples.len() / channels;
    info!(
        "Streaming {} ({}, {:.2}s)",
        path.display(),
        format,
        format.duration_of(total_frames)
    );

    let mut request = StreamRequest::new(format.clone());
    request.volume = volume;
    let mut stream = engine.make_stream(request).context("Engine refused the stream")?;

    // A tenth of a second per write
    let chunk = (format.sample_rate as usize / 10).max(1) * channels;
    for (index, block) in samples.chunks(chunk).enumerate() {
        let frames = block.len() / channels;
        let written = stream.add_f32(block, WRITE_TIMEOUT)?;
        if written < frames {
            bail!("Engine stopped taking audio after {} of {} frames", written, frames);
        }
        if index % 10 == 9 {
            info!(
                "cache {:.3}s of {:.3}s, delay {:.3}s, state {}",
                stream.cache_time(),
                stream.cache_total(),
                stream.delay(),
                engine.state()
            );
        }
    }

    stream.drain(DRAIN_TIMEOUT)?;
    info!("Finished, sink delay {:.3}s", engine.delay());
    stream.free();
    Ok(())
}
