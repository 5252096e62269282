//! Network sink
//!
//! A remote receiver advertises what it can play, the sink picks the
//! closest match to the engine's request and then streams interleaved
//! frames. Every request gets exactly one reply.
//!
//! Wire format (TCP): `[u32 LE length][bincode payload]` per message.
//!
//! Finding the receiver's address (mDNS or similar) is up to the caller.

use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use nether_pcm::{AudioFormat, ChannelLayout, DataFormat, RawCodec, SoundPacket};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::AudioSink;
use crate::error::SinkError;

/// Largest accepted message body.
pub const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;

/// Frames sent per write request.
const MAX_WRITE_FRAMES: usize = 4096;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("encoding error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("message of {0} bytes exceeds the limit")]
    TooLarge(usize),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// What a receiver can play.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteCapabilities {
    pub sample_rates: Vec<u32>,
    pub layouts: Vec<ChannelLayout>,
    /// Interleaved PCM sample types
    pub formats: Vec<DataFormat>,
    pub passthrough: Vec<RawCodec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteRequest {
    Capabilities,
    Open { format: AudioFormat },
    /// Interleaved frames in the opened format
    Write { frames: u32, data: Vec<u8> },
    Delay,
    Drain,
    Close,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteReply {
    Capabilities(RemoteCapabilities),
    Opened(AudioFormat),
    Written { frames: u32, delay: f64 },
    Delay(f64),
    Drained,
    Closed,
    /// The receiver dropped the negotiated configuration
    ConfigLost,
    Error(String),
}

/// Request/reply channel to a receiver.
pub trait RemoteTransport: Send {
    fn request(&mut self, request: &RemoteRequest) -> Result<RemoteReply, RemoteError>;
}

/// Write one length-prefixed message.
pub fn write_message<T: Serialize>(writer: &mut impl Write, message: &T) -> Result<(), RemoteError> {
    let body = bincode::serialize(message)?;
    if body.len() > MAX_MESSAGE_BYTES {
        return Err(RemoteError::TooLarge(body.len()));
    }
    writer.write_all(&(body.len() as u32).to_le_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Read one length-prefixed message.
pub fn read_message<T: for<'de> Deserialize<'de>>(reader: &mut impl Read) -> Result<T, RemoteError> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len)?;
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_MESSAGE_BYTES {
        return Err(RemoteError::TooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    Ok(bincode::deserialize(&body)?)
}

pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    pub fn connect(addr: impl ToSocketAddrs, timeout: Duration) -> Result<Self, RemoteError> {
        let mut last = None;
        for addr in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_read_timeout(Some(timeout))?;
                    stream.set_write_timeout(Some(timeout))?;
                    return Ok(Self { stream });
                }
                Err(e) => last = Some(e),
            }
        }
        Err(last
            .map(RemoteError::Io)
            .unwrap_or_else(|| RemoteError::Protocol("no address to connect to".into())))
    }
}

impl RemoteTransport for TcpTransport {
    fn request(&mut self, request: &RemoteRequest) -> Result<RemoteReply, RemoteError> {
        write_message(&mut self.stream, request)?;
        read_message(&mut self.stream)
    }
}

/// Pick the closest format `caps` can play.
pub fn negotiate(requested: &AudioFormat, caps: &RemoteCapabilities) -> Result<AudioFormat, SinkError> {
    if let DataFormat::Raw(codec) = requested.data_format {
        if caps.passthrough.contains(&codec) && caps.sample_rates.contains(&requested.sample_rate) {
            return Ok(requested.clone());
        }
        return Err(SinkError::Unsupported(format!(
            "receiver cannot pass through {}",
            codec.name()
        )));
    }

    let sample_rate = if caps.sample_rates.contains(&requested.sample_rate) {
        requested.sample_rate
    } else {
        caps.sample_rates
            .iter()
            .copied()
            .filter(|&rate| rate >= requested.sample_rate)
            .min()
            .or_else(|| caps.sample_rates.iter().copied().max())
            .ok_or_else(|| SinkError::Unsupported("receiver lists no sample rates".into()))?
    };

    let wanted = requested.channel_count();
    let layout = if caps.layouts.contains(&requested.channel_layout) {
        requested.channel_layout.clone()
    } else {
        caps.layouts
            .iter()
            .filter(|layout| layout.count() >= wanted)
            .min_by_key(|layout| layout.count())
            .or_else(|| caps.layouts.iter().max_by_key(|layout| layout.count()))
            .cloned()
            .ok_or_else(|| SinkError::Unsupported("receiver lists no layouts".into()))?
    };

    let interleaved = requested.data_format.to_interleaved();
    let data_format = [interleaved, DataFormat::Float, DataFormat::S32, DataFormat::S16]
        .into_iter()
        .find(|format| caps.formats.contains(format))
        .ok_or_else(|| SinkError::Unsupported("receiver lists no usable sample type".into()))?;

    let frames = if requested.frames > 0 {
        requested.frames
    } else {
        (sample_rate / 100) as usize
    };
    Ok(AudioFormat::pcm(data_format, sample_rate, layout, frames))
}

/// Sink that streams to a [`RemoteTransport`].
pub struct RemoteSink<T: RemoteTransport = TcpTransport> {
    transport: T,
    name: String,
    caps: Option<RemoteCapabilities>,
    format: Option<AudioFormat>,
    delay: f64,
}

impl RemoteSink<TcpTransport> {
    pub fn connect(addr: &str, timeout: Duration) -> Result<Self, RemoteError> {
        let transport = TcpTransport::connect(addr, timeout)?;
        Ok(Self::new(transport, format!("remote:{}", addr)))
    }
}

impl<T: RemoteTransport> RemoteSink<T> {
    pub fn new(transport: T, name: impl Into<String>) -> Self {
        Self {
            transport,
            name: name.into(),
            caps: None,
            format: None,
            delay: 0.0,
        }
    }

    pub fn capabilities(&mut self) -> Result<&RemoteCapabilities, SinkError> {
        if self.caps.is_none() {
            let reply = self
                .transport
                .request(&RemoteRequest::Capabilities)
                .map_err(|e| SinkError::Open(e.to_string()))?;
            match reply {
                RemoteReply::Capabilities(caps) => {
                    debug!("RemoteSink::capabilities - {:?}", caps);
                    self.caps = Some(caps);
                }
                RemoteReply::Error(e) => return Err(SinkError::Open(e)),
                other => return Err(SinkError::Open(format!("unexpected reply {:?}", other))),
            }
        }
        self.caps
            .as_ref()
            .ok_or_else(|| SinkError::Open("no capabilities".into()))
    }
}

impl<T: RemoteTransport> AudioSink for RemoteSink<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn initialize(&mut self, format: &AudioFormat, _device: &str) -> Result<AudioFormat, SinkError> {
        self.format = None;
        let negotiated = negotiate(format, self.capabilities()?)?;
        let reply = self
            .transport
            .request(&RemoteRequest::Open {
                format: negotiated.clone(),
            })
            .map_err(|e| SinkError::Open(e.to_string()))?;
        match reply {
            RemoteReply::Opened(actual) => {
                info!("RemoteSink::initialize - {} playing {}", self.name, actual);
                self.format = Some(actual.clone());
                self.delay = 0.0;
                Ok(actual)
            }
            RemoteReply::Error(e) => Err(SinkError::Open(e)),
            RemoteReply::ConfigLost => Err(SinkError::ConfigLost),
            other => Err(SinkError::Open(format!("unexpected reply {:?}", other))),
        }
    }

    fn add_packets(&mut self, packet: &SoundPacket, offset: usize) -> Result<usize, SinkError> {
        let format = self.format.as_ref().ok_or(SinkError::NotInitialized)?;
        let frame_bytes = format.frame_size;
        let frames = packet
            .nb_samples
            .saturating_sub(offset)
            .min(MAX_WRITE_FRAMES);
        if frames == 0 {
            return Ok(0);
        }
        let start = offset * frame_bytes;
        let data = packet.plane_bytes(0)[start..start + frames * frame_bytes].to_vec();

        let reply = self.transport.request(&RemoteRequest::Write {
            frames: frames as u32,
            data,
        });
        match reply {
            Ok(RemoteReply::Written { frames, delay }) => {
                self.delay = delay;
                Ok(frames as usize)
            }
            Ok(RemoteReply::ConfigLost) => {
                self.format = None;
                Err(SinkError::ConfigLost)
            }
            Ok(RemoteReply::Error(e)) => Err(SinkError::Write(e)),
            Ok(other) => Err(SinkError::Write(format!("unexpected reply {:?}", other))),
            Err(e) => {
                warn!("RemoteSink::add_packets - {} connection lost: {}", self.name, e);
                self.format = None;
                Err(SinkError::ConfigLost)
            }
        }
    }

    fn delay(&self) -> f64 {
        self.delay
    }

    fn drain(&mut self) -> Result<(), SinkError> {
        if self.format.is_none() {
            return Ok(());
        }
        match self.transport.request(&RemoteRequest::Drain) {
            Ok(RemoteReply::Drained) => {
                self.delay = 0.0;
                Ok(())
            }
            Ok(RemoteReply::Error(e)) => Err(SinkError::Drain(e)),
            Ok(other) => Err(SinkError::Drain(format!("unexpected reply {:?}", other))),
            Err(e) => Err(SinkError::Drain(e.to_string())),
        }
    }

    fn deinitialize(&mut self) {
        if self.format.take().is_some() {
            if let Err(e) = self.transport.request(&RemoteRequest::Close) {
                debug!("RemoteSink::deinitialize - {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};
    use std::thread;

    fn caps() -> RemoteCapabilities {
        RemoteCapabilities {
            sample_rates: vec![44100, 48000],
            layouts: vec![ChannelLayout::stereo(), ChannelLayout::surround_5_1()],
            formats: vec![DataFormat::S16, DataFormat::Float],
            passthrough: vec![RawCodec::Ac3],
        }
    }

    /// In-process receiver.
    struct FakeReceiver {
        caps: RemoteCapabilities,
        opened: Option<AudioFormat>,
        received: Arc<Mutex<usize>>,
        lose_after: Option<usize>,
    }

    impl RemoteTransport for FakeReceiver {
        fn request(&mut self, request: &RemoteRequest) -> Result<RemoteReply, RemoteError> {
            Ok(match request {
                RemoteRequest::Capabilities => RemoteReply::Capabilities(self.caps.clone()),
                RemoteRequest::Open { format } => {
                    self.opened = Some(format.clone());
                    RemoteReply::Opened(format.clone())
                }
                RemoteRequest::Write { frames, data } => {
                    let Some(format) = &self.opened else {
                        return Ok(RemoteReply::ConfigLost);
                    };
                    assert_eq!(data.len(), *frames as usize * format.frame_size);
                    let mut received = self.received.lock().unwrap();
                    if self.lose_after.is_some_and(|limit| *received >= limit) {
                        self.opened = None;
                        return Ok(RemoteReply::ConfigLost);
                    }
                    *received += *frames as usize;
                    RemoteReply::Written {
                        frames: *frames,
                        delay: 0.05,
                    }
                }
                RemoteRequest::Delay => RemoteReply::Delay(0.0),
                RemoteRequest::Drain => RemoteReply::Drained,
                RemoteRequest::Close => {
                    self.opened = None;
                    RemoteReply::Closed
                }
            })
        }
    }

    fn fake(lose_after: Option<usize>) -> (RemoteSink<FakeReceiver>, Arc<Mutex<usize>>) {
        let received = Arc::new(Mutex::new(0));
        let receiver = FakeReceiver {
            caps: caps(),
            opened: None,
            received: Arc::clone(&received),
            lose_after,
        };
        (RemoteSink::new(receiver, "fake"), received)
    }

    #[test]
    fn test_negotiate_exact_match() {
        let requested = AudioFormat::pcm(DataFormat::Float, 48000, ChannelLayout::stereo(), 480);
        assert_eq!(negotiate(&requested, &caps()).unwrap(), requested);
    }

    #[test]
    fn test_negotiate_falls_back() {
        // 96k 7.1 S32 -> 48k 5.1 float
        let requested = AudioFormat::pcm(DataFormat::S32, 96000, ChannelLayout::surround_7_1(), 0);
        let actual = negotiate(&requested, &caps()).unwrap();
        assert_eq!(actual.sample_rate, 48000);
        assert_eq!(actual.channel_layout, ChannelLayout::surround_5_1());
        assert_eq!(actual.data_format, DataFormat::Float);
        assert_eq!(actual.frames, 480);

        // 32k rounds up to the next supported rate
        let requested = AudioFormat::pcm(DataFormat::S16, 32000, ChannelLayout::mono(), 320);
        let actual = negotiate(&requested, &caps()).unwrap();
        assert_eq!(actual.sample_rate, 44100);
        assert_eq!(actual.channel_layout, ChannelLayout::stereo());
        assert_eq!(actual.data_format, DataFormat::S16);
    }

    #[test]
    fn test_negotiate_passthrough() {
        let info = nether_pcm::RawStreamInfo {
            codec: RawCodec::Ac3,
            sample_rate: 48000,
            channels: 6,
        };
        let ac3 = AudioFormat::raw(info, 48000, ChannelLayout::stereo(), 1536);
        assert_eq!(negotiate(&ac3, &caps()).unwrap(), ac3);

        let dts = AudioFormat::raw(
            nether_pcm::RawStreamInfo {
                codec: RawCodec::Dts,
                ..info
            },
            48000,
            ChannelLayout::stereo(),
            512,
        );
        assert!(matches!(
            negotiate(&dts, &caps()),
            Err(SinkError::Unsupported(_))
        ));
    }

    #[test]
    fn test_stream_frames() {
        let (mut sink, received) = fake(None);
        let format = AudioFormat::pcm(DataFormat::S16, 44100, ChannelLayout::stereo(), 441);
        let actual = sink.initialize(&format, "default").unwrap();

        let mut packet = SoundPacket::new(actual.sample_config(), 441);
        packet.nb_samples = 441;
        assert_eq!(sink.add_packets(&packet, 0).unwrap(), 441);
        assert_eq!(*received.lock().unwrap(), 441);
        assert_eq!(sink.delay(), 0.05);
        sink.drain().unwrap();
        sink.deinitialize();
    }

    #[test]
    fn test_config_loss_surfaces() {
        let (mut sink, _) = fake(Some(100));
        let format = AudioFormat::pcm(DataFormat::S16, 44100, ChannelLayout::stereo(), 100);
        let actual = sink.initialize(&format, "default").unwrap();
        let mut packet = SoundPacket::new(actual.sample_config(), 100);
        packet.nb_samples = 100;

        assert_eq!(sink.add_packets(&packet, 0).unwrap(), 100);
        assert_eq!(sink.add_packets(&packet, 0), Err(SinkError::ConfigLost));
        assert_eq!(sink.add_packets(&packet, 0), Err(SinkError::NotInitialized));
    }

    #[test]
    fn test_tcp_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut receiver = FakeReceiver {
                caps: caps(),
                opened: None,
                received: Arc::new(Mutex::new(0)),
                lose_after: None,
            };
            loop {
                let request: RemoteRequest = match read_message(&mut socket) {
                    Ok(request) => request,
                    Err(_) => break,
                };
                let done = request == RemoteRequest::Close;
                let reply = receiver.request(&request).unwrap();
                write_message(&mut socket, &reply).unwrap();
                if done {
                    break;
                }
            }
            receiver.received.lock().map(|r| *r).unwrap_or(0)
        });

        let mut sink = RemoteSink::connect(&addr.to_string(), Duration::from_secs(5)).unwrap();
        let format = AudioFormat::pcm(DataFormat::Float, 48000, ChannelLayout::stereo(), 480);
        let actual = sink.initialize(&format, "default").unwrap();
        assert_eq!(actual, format);

        let mut packet = SoundPacket::new(actual.sample_config(), 480);
        packet.nb_samples = 480;
        assert_eq!(sink.add_packets(&packet, 80).unwrap(), 400);
        sink.deinitialize();

        assert_eq!(server.join().unwrap(), 400);
    }
}
