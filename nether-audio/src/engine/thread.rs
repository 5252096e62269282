use std::sync::Arc;
use std::sync::atomic::Ordering;

use tracing::{debug, info};

use super::{Engine, Input};
use crate::error::StreamRejected;
use crate::protocol::{ControlReply, ControlSignal, DataReply, DataSignal};

impl Engine {
    /// Engine thread body. Returns once the stop flag is raised.
    pub(crate) fn run(mut self) {
        info!("Audio engine thread started");
        self.shared.control.bind_consumer();
        self.shared.data.bind_consumer();
        self.install_inline_control();

        while !self.shared.stop.load(Ordering::Acquire) {
            self.metrics.maybe_log(self.shared.stats.water_level());

            if let Some(input) = self.poll() {
                self.dispatch(input);
                continue;
            }
            if self.self_trigger {
                self.self_trigger = false;
                self.dispatch(Input::Timeout);
                continue;
            }
            if self.ext_timeout.is_zero() {
                self.dispatch(Input::Timeout);
                continue;
            }
            if !self.shared.event.wait(self.ext_timeout) {
                self.metrics.idle_waits += 1;
                self.dispatch(Input::Timeout);
            }
        }

        self.close_ports();
        info!("Audio engine thread finished");
    }

    /// Synchronous control sends from this thread cannot wait for the loop.
    /// Volume and mute apply at once; anything else is queued for the
    /// next iteration.
    fn install_inline_control(&self) {
        let master = self.shared.master.clone();
        let muted = Arc::clone(&self.shared.muted);
        let control = Arc::downgrade(&self.shared.control);
        self.shared.control.set_inline_handler(move |signal| match signal {
            ControlSignal::Volume(volume) => {
                master.set(volume);
                Some(ControlReply::Acc)
            }
            ControlSignal::Mute(mute) => {
                muted.store(mute, Ordering::Release);
                Some(ControlReply::Acc)
            }
            other => {
                let port = control.upgrade()?;
                port.post(other).ok().map(|()| ControlReply::Acc)
            }
        });
    }

    /// Next input in priority order: control, sink, data, then streams
    /// round robin. Deferred ports yield nothing.
    fn poll(&mut self) -> Option<Input> {
        if let Some(message) = self.shared.control.receive_out() {
            let (signal, replier) = message.into_parts();
            return Some(Input::Control(signal, replier));
        }
        if let Some(event) = self.sink.receive_event() {
            return Some(Input::Sink(event));
        }
        if let Some(message) = self.shared.data.receive_out() {
            let (signal, replier) = message.into_parts();
            return Some(Input::Data(signal, replier));
        }
        let count = self.streams.len();
        for offset in 0..count {
            let index = (self.next_stream + offset) % count;
            let stream = &self.streams[index];
            if let Some(message) = stream.port.receive_out() {
                self.next_stream = index + 1;
                return Some(Input::Stream(stream.id, message.signal));
            }
        }
        None
    }

    /// Refuse new messages and answer whatever is still queued.
    fn close_ports(&mut self) {
        self.shared.control.close();
        self.shared.data.close();
        for message in self.shared.control.drain_out() {
            let (_, replier) = message.into_parts();
            replier.reply(ControlReply::Error);
        }

        let mut recycle = Vec::new();
        for message in self.shared.data.drain_out() {
            let (signal, replier) = message.into_parts();
            match signal {
                DataSignal::FreeStream { returned, .. } => recycle.extend(returned),
                DataSignal::NewStream(_) => {
                    replier.reply(DataReply::Error(StreamRejected::NotConfigured));
                }
                _ => {
                    replier.reply(DataReply::Acc);
                }
            }
        }
        for stream in &self.streams {
            stream.port.close();
        }
        self.return_all(recycle);
        debug!(
            "Engine::close_ports - {} streams, {} sounds at shutdown",
            self.streams.len(),
            self.sounds.len()
        );
    }
}
