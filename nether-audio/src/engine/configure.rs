//! Format selection, pool (re)building and stream lifecycle

use std::sync::Arc;
use std::time::Instant;

use hashbrown::HashSet;
use nether_pcm::{AudioFormat, ChannelLayout, DataFormat};
use tracing::{debug, info, warn};

use super::{DiscardedPool, Engine, EngineMode, Stream, default_format};
use crate::buffer::{BufferPool, SampleBuffer};
use crate::encoder::{transcode_input_format, transcode_output_format};
use crate::error::{EngineError, SinkError, StreamRejected};
use crate::port::{Event, Protocol};
use crate::protocol::{SinkEvent, StreamReply, StreamSignal};
use crate::resampling::ResamplingBufferPool;
use crate::stats::{MAX_CACHE_LEVEL, MAX_WATER_LEVEL};
use crate::stream::{StreamGrant, StreamId, StreamRequest};
use crate::volume::SharedVolume;

fn millis(seconds: f64) -> u32 {
    (seconds * 1000.0) as u32
}

impl Engine {
    fn reference(&self) -> AudioFormat {
        self.streams
            .first()
            .map(|stream| stream.format.clone())
            .unwrap_or_else(default_format)
    }

    /// Sink request and pipeline mode for a reference format under the
    /// current settings.
    pub(crate) fn apply_settings_to_format(&self, format: &AudioFormat) -> (AudioFormat, EngineMode) {
        if let DataFormat::Raw(codec) = format.data_format {
            if self.settings.passthrough_enabled(codec) {
                return (format.clone(), EngineMode::Raw);
            }
            debug!(
                "Engine::apply_settings_to_format - {} passthrough disabled, using PCM",
                codec.name()
            );
        }

        let multichannel = format.channel_count() > 2 || self.settings.stereo_upmix;
        let transcode = self.settings.ac3_passthrough
            && !self.settings.multichannel_lpcm
            && !self.streams.is_empty()
            && multichannel;
        if transcode {
            match &self.encoder {
                Some(encoder) => return (transcode_output_format(encoder.codec()), EngineMode::Transcode),
                None => debug!("Engine::apply_settings_to_format - no encoder, transcode unavailable"),
            }
        }

        let mut request = format.clone().with_data_format(DataFormat::Float);
        request.stream_info = None;
        if format.is_raw() {
            request.channel_layout = ChannelLayout::stereo();
        }
        if multichannel {
            request.channel_layout = ChannelLayout::from_setting(self.settings.channels);
        }
        if let Some(rate) = self.settings.forced_sample_rate {
            request.sample_rate = rate;
        }
        request.frames = (request.sample_rate / 50) as usize;
        request.update_frame_size();
        (request, EngineMode::Pcm)
    }

    fn device_for(&self, mode: EngineMode) -> String {
        match mode {
            EngineMode::Raw | EngineMode::Transcode => self.settings.passthrough_device.clone(),
            EngineMode::Pcm => self.settings.device.clone(),
        }
    }

    /// Whether the current settings and streams call for a different
    /// sink or pipeline than the one in place.
    pub(crate) fn need_reconfigure(&self) -> bool {
        let reference = self.reference();
        let (request, mode) = self.apply_settings_to_format(&reference);
        let device = self.device_for(mode);
        mode != self.mode
            || self.reference_format.as_ref() != Some(&reference)
            || self.sink_request_format.as_ref() != Some(&request)
            || self.sink.needs_reconfigure(&request, &device)
    }

    /// Build the pipeline for the current streams and settings, reopening
    /// the sink only if its format or device changes.
    pub(crate) fn configure(&mut self) -> Result<(), EngineError> {
        let reference = self.reference();
        let (request, mode) = self.apply_settings_to_format(&reference);
        let device = self.device_for(mode);

        let multichannel = reference.channel_count() > 2 || self.settings.stereo_upmix;
        if mode == EngineMode::Pcm
            && self.encoder.is_none()
            && self.settings.ac3_passthrough
            && !self.settings.multichannel_lpcm
            && !self.streams.is_empty()
            && multichannel
        {
            warn!("Engine::configure - transcode requested but no encoder available, using PCM");
        }

        let init_sink = self.sink.needs_reconfigure(&request, &device);
        if init_sink {
            self.drain_sink()?;
            let actual = self.sink.configure(&request, &device)?;
            self.shared.stats.reset(actual.sample_rate);
        }
        let sink_format = self.sink.format().cloned().ok_or(SinkError::NotInitialized)?;

        let internal = match mode {
            EngineMode::Raw => sink_format.clone(),
            EngineMode::Transcode => transcode_input_format(),
            EngineMode::Pcm => sink_format.clone().with_data_format(DataFormat::Float),
        };

        let rebuild = init_sink
            || mode != self.mode
            || self.internal_format.as_ref() != Some(&internal)
            || self.sink_buffers.is_none();
        if rebuild {
            self.rebuild_output_pools(mode, &internal, &sink_format);
        }

        info!(
            "Engine::configure - {:?} mode, reference {}, sink {}, mixing {}",
            mode, reference, sink_format, internal
        );
        if mode == EngineMode::Raw && !self.playing.is_empty() {
            debug!("Engine::configure - passthrough active, stopping {} sounds", self.playing.len());
            self.playing.clear();
        }
        self.mode = mode;
        self.reference_format = Some(reference);
        self.sink_request_format = Some(request);
        self.internal_format = Some(internal.clone());

        let fill_packets = mode == EngineMode::Transcode || self.streams.len() > 1;
        for stream in &mut self.streams {
            let stale = stream.resample.as_ref().is_some_and(|pool| {
                rebuild
                    || !pool.format().same_stream_shape(&internal)
                    || pool.format().frames != internal.frames
            });
            let stale_pool = if stale { stream.resample.take() } else { None };
            if let Some(pool) = stale_pool {
                debug!("Engine::configure - discarding resample pool of {}", stream.id);
                self.discarded.push(DiscardedPool::Resampling(pool));
            }
            let pool = stream.resample.get_or_insert_with(|| {
                let mut pool = ResamplingBufferPool::new(stream.format.clone(), internal.clone());
                pool.create(millis(MAX_CACHE_LEVEL), true);
                pool
            });
            pool.set_fill_packets(fill_packets);
        }

        self.clear_discarded_buffers();
        Ok(())
    }

    fn rebuild_output_pools(&mut self, mode: EngineMode, internal: &AudioFormat, sink_format: &AudioFormat) {
        if let Some(pool) = self.sink_buffers.take() {
            self.discarded.push(DiscardedPool::Resampling(pool));
        }
        if let Some(pool) = self.silence_buffers.take() {
            debug!("Engine::configure - discarding silence pool {}", pool.format());
            self.discarded.push(DiscardedPool::Resampling(pool));
        }
        if let Some(pool) = self.encoder_buffers.take() {
            self.discarded.push(DiscardedPool::Plain(pool));
        }

        let sink_input = match mode {
            EngineMode::Transcode => self
                .encoder
                .as_ref()
                .map(|encoder| transcode_output_format(encoder.codec()))
                .unwrap_or_else(|| sink_format.clone()),
            _ => internal.clone(),
        };
        if mode == EngineMode::Transcode {
            let mut pool = BufferPool::new(sink_input.clone());
            pool.create(millis(MAX_WATER_LEVEL));
            self.encoder_buffers = Some(pool);
        }

        let mut sink_buffers = ResamplingBufferPool::new(sink_input, sink_format.clone());
        sink_buffers.create(millis(MAX_WATER_LEVEL), false);
        self.sink_buffers = Some(sink_buffers);

        if mode != EngineMode::Raw {
            let mut silence = ResamplingBufferPool::new(internal.clone(), internal.clone());
            silence.create(0, false);
            self.silence_buffers = Some(silence);
        }
    }

    /// Play out everything queued at the sink and take the buffers back.
    pub(crate) fn drain_sink(&mut self) -> Result<(), SinkError> {
        if self.sink.is_open() {
            self.sink.drain()?;
        }
        while let Some(event) = self.sink.receive_event() {
            match event {
                SinkEvent::ReturnSample(buffer) => self.return_buffer(buffer),
                SinkEvent::DeviceChanged => self.sink.invalidate(),
                other => debug!("Engine::drain_sink - ignoring {:?}", other),
            }
        }
        Ok(())
    }

    /// Flush discarded resampling pools and drop every pool whose buffers
    /// are all home.
    pub(crate) fn clear_discarded_buffers(&mut self) {
        let mut recycle = Vec::new();
        for pool in &mut self.discarded {
            if let DiscardedPool::Resampling(pool) = pool {
                pool.flush(&mut recycle);
            }
        }
        self.return_all(recycle);

        let before = self.discarded.len();
        self.discarded.retain(|pool| !pool.is_destroyable());
        let dropped = before - self.discarded.len();
        if dropped > 0 {
            debug!(
                "Engine::clear_discarded_buffers - dropped {} pools, {} waiting",
                dropped,
                self.discarded.len()
            );
        }
    }

    /// Validate a stream request and register the stream. The pipeline is
    /// not reconfigured here.
    pub(crate) fn create_stream(&mut self, request: StreamRequest) -> Result<StreamGrant, StreamRejected> {
        let mut format = request.format;
        if self.streams.iter().any(|stream| stream.format.is_raw()) {
            return Err(StreamRejected::PassthroughActive);
        }
        if format.sample_rate == 0 || format.channel_layout.is_empty() {
            return Err(StreamRejected::InvalidFormat);
        }
        if let DataFormat::Raw(codec) = format.data_format {
            if !self.streams.is_empty() {
                return Err(StreamRejected::PassthroughNotExclusive);
            }
            if !self.settings.passthrough_enabled(codec) || format.stream_info.is_none() {
                return Err(StreamRejected::InvalidFormat);
            }
        }

        format.frames = (format.sample_rate / 10) as usize;
        format.update_frame_size();
        let mut input = BufferPool::new(format.clone());
        input.create(millis(MAX_CACHE_LEVEL));

        let id = StreamId::next();
        let port = Arc::new(Protocol::new(
            "stream",
            Arc::clone(&self.shared.event),
            Arc::new(Event::new()),
        ));
        let volume = SharedVolume::new(request.volume);
        self.streams.push(Stream {
            id,
            format: format.clone(),
            input,
            resample: None,
            processing: HashSet::new(),
            port: Arc::clone(&port),
            volume: volume.clone(),
            drain_pending: false,
        });
        self.reconfigure_at = None;
        info!("Engine::create_stream - {} {}", id, format);

        Ok(StreamGrant {
            id,
            format,
            port,
            volume,
        })
    }

    /// Tear down a stream, reclaiming every buffer it still has out.
    pub(crate) fn discard_stream(&mut self, id: StreamId, returned: Vec<SampleBuffer>) {
        let Some(index) = self.streams.iter().position(|stream| stream.id == id) else {
            warn!("Engine::discard_stream - unknown {}", id);
            self.return_all(returned);
            return;
        };
        let mut stream = self.streams.remove(index);
        stream.port.close();

        let mut recycle = returned;
        for message in stream.port.drain_out() {
            if let StreamSignal::Sample(buffer) = message.signal {
                recycle.push(buffer);
            }
        }
        for reply in stream.port.drain_in() {
            if let StreamReply::Buffer(buffer) = reply {
                recycle.push(buffer);
            }
        }
        stream.processing.clear();
        self.shared.stats.remove_stream(id);

        self.discarded.push(DiscardedPool::Plain(stream.input));
        if let Some(pool) = stream.resample.take() {
            self.discarded.push(DiscardedPool::Resampling(pool));
        }
        self.return_all(recycle);
        self.clear_discarded_buffers();

        let fill_packets = self.mode == EngineMode::Transcode || self.streams.len() > 1;
        for stream in &mut self.streams {
            if let Some(pool) = stream.resample.as_mut() {
                pool.set_fill_packets(fill_packets);
            }
        }
        if self.streams.is_empty() {
            self.reconfigure_at = Some(Instant::now() + self.keep_config);
        }
        info!("Engine::discard_stream - {} removed, {} left", id, self.streams.len());
    }

    /// Take a filled buffer back from a producer.
    pub(crate) fn accept_sample(&mut self, id: StreamId, mut buffer: SampleBuffer) {
        let timestamp = self.now_ms();
        let leftover = match self.stream_mut(id) {
            Some(stream) => {
                if !stream.processing.remove(&buffer.origin()) {
                    warn!("Engine::accept_sample - {} sent a buffer it did not hold", id);
                }
                match stream.resample.as_mut() {
                    Some(pool) if buffer.pkt.nb_samples > 0 => {
                        buffer.timestamp = timestamp;
                        pool.input.push_back(buffer);
                        None
                    }
                    _ => stream.input.return_buffer(buffer).err(),
                }
            }
            None => {
                warn!("Engine::accept_sample - sample for unknown {}", id);
                Some(buffer)
            }
        };
        if let Some(buffer) = leftover {
            self.return_buffer(buffer);
        }
    }
}
