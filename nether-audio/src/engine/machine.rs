//! State handlers
//!
//! Each handler either consumes its input or hands it back; dispatch then
//! offers it to the parent state. Whatever reaches past `Top` is answered
//! with a failure so no synchronous caller is left waiting.

use std::time::Instant;

use tracing::{debug, error, info, warn};

use super::{
    ERROR_TIMEOUT, Engine, EngineMode, EngineState, IDLE_TIMEOUT, INITIAL_TIMEOUT, Input,
    PLAY_TIMEOUT, PlayingSound,
};
use crate::config::AudioSettings;
use crate::error::StreamRejected;
use crate::protocol::{
    ControlReply, ControlSignal, DataReply, DataSignal, SinkEvent, StreamReply, StreamSignal,
};

/// Outcome of offering an input to one state.
pub(crate) enum Dispatch {
    Handled,
    Unhandled(Input),
}

use Dispatch::{Handled, Unhandled};

impl Engine {
    /// Offer `input` to the current state, then to each ancestor.
    pub(crate) fn dispatch(&mut self, input: Input) {
        let mut input = input;
        let mut level = Some(self.state);
        while let Some(state) = level {
            match self.handle(state, input) {
                Handled => return,
                Unhandled(back) => {
                    input = back;
                    level = state.parent();
                }
            }
        }
        self.unhandled(input);
    }

    fn handle(&mut self, state: EngineState, input: Input) -> Dispatch {
        match state {
            EngineState::Top => self.handle_top(input),
            EngineState::TopError => self.handle_error(input),
            EngineState::TopUnconfigured => self.handle_unconfigured(input),
            EngineState::TopReconfiguring => self.handle_reconfiguring(input),
            EngineState::TopConfigured => self.handle_configured(input),
            EngineState::TopConfiguredIdle => self.handle_idle(input),
            EngineState::TopConfiguredPlay => self.handle_play(input),
        }
    }

    fn unhandled(&mut self, input: Input) {
        warn!(
            "Engine::dispatch - {} not handled in {}",
            input.describe(),
            self.state
        );
        match input {
            Input::Control(_, replier) => {
                replier.reply(ControlReply::Error);
            }
            Input::Data(_, replier) => {
                replier.reply(DataReply::Error(StreamRejected::NotConfigured));
            }
            Input::Stream(_, StreamSignal::Sample(buffer))
            | Input::Sink(SinkEvent::ReturnSample(buffer)) => self.return_buffer(buffer),
            _ => {}
        }
    }

    /// Configure and land in play or error.
    fn configure_or_fail(&mut self) -> bool {
        match self.configure() {
            Ok(()) => {
                let next = if self.has_work() {
                    EngineState::TopConfiguredPlay
                } else {
                    EngineState::TopConfiguredIdle
                };
                self.enter(next);
                true
            }
            Err(e) => {
                error!("Engine::configure - failed: {}", e);
                self.set_state(EngineState::TopError);
                self.ext_timeout = ERROR_TIMEOUT;
                false
            }
        }
    }

    /// Hold data and stream messages back while the pipeline is rebuilt.
    fn defer_inputs(&mut self, defer: bool) {
        self.shared.data.defer_out(defer);
        for stream in &self.streams {
            stream.port.defer_out(defer);
        }
    }

    /// Store new settings, returning the keys that changed. Master volume
    /// is pushed only when the settings themselves change it, so a level
    /// set live survives unrelated edits.
    fn take_settings(&mut self, settings: AudioSettings) -> Vec<&'static str> {
        let changed = self.settings.changed_keys(&settings);
        self.settings = settings;
        if changed.contains(&"output.master_volume") {
            self.shared.master.set(self.settings.master_volume);
        }
        changed
    }

    fn begin_reconfigure(&mut self) {
        info!("Engine - reconfiguring");
        self.defer_inputs(true);
        self.enter(EngineState::TopReconfiguring);
    }

    fn handle_top(&mut self, input: Input) -> Dispatch {
        match input {
            Input::Control(ControlSignal::Volume(volume), replier) => {
                self.shared.master.set(volume);
                replier.reply(ControlReply::Acc);
            }
            Input::Control(ControlSignal::Mute(muted), replier) => {
                self.shared
                    .muted
                    .store(muted, std::sync::atomic::Ordering::Release);
                replier.reply(ControlReply::Acc);
            }
            Input::Data(DataSignal::NewSound(sound), replier) => {
                debug!(
                    "Engine - registered {:?} ({} frames, {})",
                    sound.id(),
                    sound.frames(),
                    sound.format()
                );
                self.sounds.insert(sound.id(), *sound);
                replier.reply(DataReply::Acc);
            }
            Input::Data(DataSignal::FreeSound(id), replier) => {
                self.sounds.remove(&id);
                self.playing.retain(|playing| playing.id != id);
                replier.reply(DataReply::Acc);
            }
            Input::Data(DataSignal::FreeStream { stream, returned }, replier) => {
                self.discard_stream(stream, returned);
                replier.reply(DataReply::Acc);
            }
            Input::Data(DataSignal::NewStream(_), replier) => {
                replier.reply(DataReply::Error(StreamRejected::NotConfigured));
            }
            Input::Data(DataSignal::PlaySound(id), replier) => {
                debug!("Engine - {:?} not played in {}", id, self.state);
                replier.reply(DataReply::Acc);
            }
            Input::Sink(SinkEvent::ReturnSample(buffer)) => self.return_buffer(buffer),
            Input::Sink(SinkEvent::DeviceChanged) => {
                warn!("Engine - sink device changed");
                self.sink.invalidate();
            }
            Input::Sink(event) => debug!("Engine - ignoring sink event {:?}", event),
            Input::Stream(id, StreamSignal::Sample(buffer)) => {
                // Not mixing: the audio is dropped
                let leftover = match self.stream_mut(id) {
                    Some(stream) => {
                        stream.processing.remove(&buffer.origin());
                        stream.input.return_buffer(buffer).err()
                    }
                    None => Some(buffer),
                };
                if let Some(buffer) = leftover {
                    self.return_buffer(buffer);
                }
            }
            Input::Stream(id, StreamSignal::Drain) => {
                if let Some(stream) = self.stream_mut(id) {
                    stream.port.send_in(StreamReply::Drained);
                }
            }
            Input::Stream(id, StreamSignal::ResampleRatio(ratio)) => {
                let pool = self
                    .stream_mut(id)
                    .and_then(|stream| stream.resample.as_mut());
                if let Some(pool) = pool {
                    pool.set_resample_ratio(ratio);
                }
            }
            Input::Timeout => {}
            other => return Unhandled(other),
        }
        Handled
    }

    fn handle_error(&mut self, input: Input) -> Dispatch {
        match input {
            Input::Control(ControlSignal::Reconfigure(settings), replier) => {
                self.take_settings(*settings);
                replier.reply(ControlReply::Acc);
                info!("Engine - new settings while in error, retrying configure");
                self.defer_inputs(false);
                self.configure_or_fail();
            }
            Input::Timeout => self.ext_timeout = ERROR_TIMEOUT,
            other => return Unhandled(other),
        }
        Handled
    }

    fn handle_unconfigured(&mut self, input: Input) -> Dispatch {
        match input {
            Input::Control(ControlSignal::Init, replier) => {
                if self.configure_or_fail() {
                    info!("Engine - initialized");
                    replier.reply(ControlReply::Acc);
                } else {
                    replier.reply(ControlReply::Error);
                }
            }
            Input::Control(ControlSignal::Reconfigure(settings), replier) => {
                // Applied by Init
                self.take_settings(*settings);
                replier.reply(ControlReply::Acc);
            }
            Input::Timeout => self.ext_timeout = INITIAL_TIMEOUT,
            other => return Unhandled(other),
        }
        Handled
    }

    fn handle_reconfiguring(&mut self, input: Input) -> Dispatch {
        match input {
            Input::Control(ControlSignal::Reconfigure(settings), replier) => {
                // Picked up once the current rebuild settles
                self.take_settings(*settings);
                replier.reply(ControlReply::Acc);
            }
            Input::Timeout => {
                if self.run_stages() {
                    self.ext_timeout = std::time::Duration::ZERO;
                    return Handled;
                }
                if self.has_work() {
                    self.ext_timeout = PLAY_TIMEOUT;
                    return Handled;
                }
                // Every way out of here releases the held inputs
                self.defer_inputs(false);
                if let Err(e) = self.drain_sink() {
                    error!("Engine::drain_sink - failed: {}", e);
                    self.set_state(EngineState::TopError);
                    self.ext_timeout = ERROR_TIMEOUT;
                    return Handled;
                }
                self.configure_or_fail();
            }
            other => return Unhandled(other),
        }
        Handled
    }

    fn handle_configured(&mut self, input: Input) -> Dispatch {
        match input {
            Input::Control(ControlSignal::Reconfigure(settings), replier) => {
                let requires = self.settings.requires_reconfigure(&settings);
                let changed = self.take_settings(*settings);
                replier.reply(ControlReply::Acc);
                debug!("Engine - settings changed: {:?}", changed);
                if requires && self.need_reconfigure() {
                    self.begin_reconfigure();
                }
            }
            Input::Data(DataSignal::NewStream(request), replier) => {
                match self.create_stream(request) {
                    Ok(grant) => {
                        let id = grant.id;
                        if !replier.reply(DataReply::Stream(grant)) {
                            warn!("Engine - {} requester gone, discarding", id);
                            self.discard_stream(id, Vec::new());
                        }
                        if self.configure_or_fail() {
                            self.enter(EngineState::TopConfiguredPlay);
                        }
                    }
                    Err(reason) => {
                        warn!("Engine - stream rejected: {}", reason);
                        replier.reply(DataReply::Error(reason));
                    }
                }
            }
            Input::Data(DataSignal::PlaySound(id), replier) => {
                replier.reply(DataReply::Acc);
                if self.mode == EngineMode::Raw {
                    debug!("Engine - {:?} not played during passthrough", id);
                } else if self.sounds.contains_key(&id) {
                    self.playing.push(PlayingSound { id, played: 0 });
                    self.enter(EngineState::TopConfiguredPlay);
                } else {
                    warn!("Engine - play request for unknown {:?}", id);
                }
            }
            Input::Stream(id, StreamSignal::Sample(buffer)) => {
                self.accept_sample(id, buffer);
                self.enter(EngineState::TopConfiguredPlay);
            }
            Input::Stream(id, StreamSignal::Drain) => {
                if let Some(stream) = self.stream_mut(id) {
                    match stream.resample.as_mut() {
                        Some(pool) => {
                            pool.set_drain(true);
                            stream.drain_pending = true;
                        }
                        None => stream.port.send_in(StreamReply::Drained),
                    }
                }
                self.enter(EngineState::TopConfiguredPlay);
            }
            Input::Sink(SinkEvent::ReturnSample(buffer)) => {
                // A returned buffer may let a stream take more audio
                self.return_buffer(buffer);
                self.enter(EngineState::TopConfiguredPlay);
            }
            Input::Sink(SinkEvent::DeviceChanged) => {
                warn!("Engine - sink device changed, reconfiguring");
                self.sink.invalidate();
                self.begin_reconfigure();
            }
            other => return Unhandled(other),
        }
        Handled
    }

    fn handle_idle(&mut self, input: Input) -> Dispatch {
        match input {
            Input::Timeout => {
                self.resample_sounds();
                self.clear_discarded_buffers();

                let Some(at) = self.reconfigure_at else {
                    self.ext_timeout = IDLE_TIMEOUT;
                    return Handled;
                };
                let now = Instant::now();
                if now < at {
                    self.ext_timeout = (at - now).min(IDLE_TIMEOUT);
                    return Handled;
                }
                self.reconfigure_at = None;
                if self.streams.is_empty() && !self.has_work() && self.need_reconfigure() {
                    info!("Engine - no streams left, returning to default configuration");
                    if let Err(e) = self.drain_sink() {
                        error!("Engine::drain_sink - failed: {}", e);
                        self.set_state(EngineState::TopError);
                        self.ext_timeout = ERROR_TIMEOUT;
                        return Handled;
                    }
                    self.configure_or_fail();
                } else {
                    self.ext_timeout = IDLE_TIMEOUT;
                }
            }
            other => return Unhandled(other),
        }
        Handled
    }

    fn handle_play(&mut self, input: Input) -> Dispatch {
        match input {
            Input::Timeout => {
                if self.run_stages() {
                    self.self_trigger = true;
                    self.ext_timeout = PLAY_TIMEOUT;
                } else if self.has_work() {
                    self.resample_sounds();
                    self.clear_discarded_buffers();
                    self.ext_timeout = PLAY_TIMEOUT;
                } else {
                    self.enter(EngineState::TopConfiguredIdle);
                }
            }
            other => return Unhandled(other),
        }
        Handled
    }
}
