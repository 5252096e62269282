use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nether_pcm::{ChannelLayout, SoundPacket};
use tracing::{info, warn};

use super::{Engine, EngineShared, EngineState, INIT_TIMEOUT, NEW_STREAM_TIMEOUT};
use crate::config::AudioSettings;
use crate::encoder::AudioEncoder;
use crate::error::{EngineError, StreamRejected};
use crate::protocol::{ControlReply, ControlSignal, DataReply, DataSignal};
use crate::sink::{AudioSink, SinkHost};
use crate::sound::{Sound, SoundHandle};
use crate::stats::EngineStats;
use crate::stream::{AudioStream, StreamRequest};

/// Optional engine parts.
pub struct EngineOptions {
    /// Enables transcode mode
    pub encoder: Option<Box<dyn AudioEncoder>>,
    /// How long the last stream's configuration is kept before falling back
    /// to the default format
    pub keep_config: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            encoder: None,
            keep_config: Duration::from_secs(10),
        }
    }
}

/// Caller-side handle. Dropping it stops both engine and sink threads.
pub struct AudioEngine {
    shared: EngineShared,
    settings: AudioSettings,
    thread: Option<JoinHandle<()>>,
}

impl AudioEngine {
    /// Spawn the sink and engine threads and wait for the initial
    /// configuration.
    pub fn start(
        settings: AudioSettings,
        sink: Box<dyn AudioSink>,
        options: EngineOptions,
    ) -> Result<Self, EngineError> {
        let shared = EngineShared::new(settings.master_volume);
        let host = SinkHost::spawn(sink, Arc::clone(&shared.event), Arc::clone(&shared.stats))?;
        info!("AudioEngine::start - sink '{}'", host.name());
        let engine = Engine::new(shared.clone(), host, settings.clone(), options);
        let thread = thread::Builder::new()
            .name("audio-engine".into())
            .spawn(move || engine.run())
            .map_err(|source| EngineError::Spawn {
                name: "audio-engine",
                source,
            })?;

        let handle = Self {
            shared,
            settings,
            thread: Some(thread),
        };
        match handle.shared.control.send_out_sync(ControlSignal::Init, INIT_TIMEOUT)? {
            ControlReply::Acc => Ok(handle),
            ControlReply::Error => Err(EngineError::InitFailed),
        }
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        match &self.thread {
            Some(thread) if !thread.is_finished() => Ok(()),
            _ => Err(EngineError::NotRunning),
        }
    }

    /// Open a stream. Fails if the engine rejects the format or does not
    /// answer within a second.
    pub fn make_stream(&self, request: StreamRequest) -> Result<AudioStream, EngineError> {
        self.ensure_running()?;
        let signal = DataSignal::NewStream(request);
        match self.shared.data.send_out_sync(signal, NEW_STREAM_TIMEOUT)? {
            DataReply::Stream(grant) => Ok(AudioStream::new(
                grant,
                Arc::clone(&self.shared.data),
                Arc::clone(&self.shared.stats),
            )),
            DataReply::Error(reason) => Err(reason.into()),
            DataReply::Acc => Err(StreamRejected::NotConfigured.into()),
        }
    }

    /// Decode a WAV file and register it.
    pub fn make_sound(&self, path: &Path) -> Result<SoundHandle, EngineError> {
        let sound = Sound::from_wav(path)?;
        self.register(sound)
    }

    /// Register already decoded samples.
    pub fn make_sound_from_packet(
        &self,
        packet: SoundPacket,
        layout: ChannelLayout,
    ) -> Result<SoundHandle, EngineError> {
        let sound = Sound::from_packet(packet, layout)?;
        self.register(sound)
    }

    fn register(&self, sound: Sound) -> Result<SoundHandle, EngineError> {
        self.ensure_running()?;
        let handle = SoundHandle::new(&sound);
        self.shared
            .data
            .send_out(DataSignal::NewSound(Box::new(sound)))?;
        Ok(handle)
    }

    /// Start a sound from the beginning. Overlapping plays are allowed.
    pub fn play_sound(&self, sound: &SoundHandle) -> Result<(), EngineError> {
        self.shared.data.send_out(DataSignal::PlaySound(sound.id()))?;
        Ok(())
    }

    pub fn free_sound(&self, sound: SoundHandle) -> Result<(), EngineError> {
        self.shared.data.send_out(DataSignal::FreeSound(sound.id()))?;
        Ok(())
    }

    pub fn settings(&self) -> &AudioSettings {
        &self.settings
    }

    /// Post new settings. The engine reconfigures only if they change
    /// what it asks of the sink.
    pub fn apply_settings(&mut self, settings: AudioSettings) -> Result<(), EngineError> {
        if settings == self.settings {
            return Ok(());
        }
        let changed = self.settings.changed_keys(&settings);
        info!("AudioEngine::apply_settings - changed {:?}", changed);
        self.shared
            .control
            .send_out(ControlSignal::Reconfigure(Box::new(settings.clone())))?;
        self.settings = settings;
        Ok(())
    }

    pub fn set_volume(&self, volume: f32) -> Result<(), EngineError> {
        self.shared.control.send_out(ControlSignal::Volume(volume))?;
        Ok(())
    }

    pub fn volume(&self) -> f32 {
        self.shared.master.get()
    }

    pub fn set_mute(&self, muted: bool) -> Result<(), EngineError> {
        self.shared.control.send_out(ControlSignal::Mute(muted))?;
        Ok(())
    }

    pub fn is_muted(&self) -> bool {
        self.shared.muted.load(Ordering::Acquire)
    }

    /// Seconds of audio queued at the sink.
    pub fn delay(&self) -> f64 {
        self.shared.stats.delay()
    }

    /// Seconds of mixed audio buffered ahead of the sink.
    pub fn cache_time(&self) -> f64 {
        self.shared.stats.water_level()
    }

    pub fn stats(&self) -> &EngineStats {
        &self.shared.stats
    }

    pub fn state(&self) -> EngineState {
        self.shared.state.get()
    }

    /// Stop and join both threads.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.shared.stop.store(true, Ordering::Release);
        self.shared.event.set();
        if thread.join().is_err() {
            warn!("AudioEngine::stop - engine thread panicked");
        }
        info!("AudioEngine stopped");
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
