//! TCP frame receiver.
//!
//! Reassembles fixed-size frames from a byte stream that may deliver any
//! number of bytes per read. Each [`FrameReceiver::receive_frame`] call
//! either yields one complete payload or fails and leaves the receiver
//! disconnected. Reconnecting is up to the caller.

use crate::config::Config;
use crate::socket::{SocketLibrary, SocketLibraryError, SocketLibraryGuard};
use std::io::{self, ErrorKind, Read};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Failure to establish a connection.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("failed to resolve {endpoint}: {source}")]
    Resolve {
        endpoint: String,
        source: io::Error,
    },

    #[error("{endpoint} resolved to no addresses")]
    NoAddress { endpoint: String },

    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        source: io::Error,
    },

    #[error("failed to configure socket: {0}")]
    SocketOption(io::Error),
}

/// Failure to receive a complete frame. The receiver is disconnected
/// afterwards (except for `NotConnected`, where it already was).
#[derive(Error, Debug)]
pub enum ReceiveError {
    #[error("not connected")]
    NotConnected,

    #[error("connection closed after {received} of {expected} bytes")]
    ConnectionClosed { received: usize, expected: usize },

    #[error("read timed out after {received} of {expected} bytes")]
    Timeout { received: usize, expected: usize },

    #[error("stopped after {received} of {expected} bytes")]
    Interrupted { received: usize, expected: usize },

    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

/// Longest a blocked read waits before re-checking a stop flag.
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A connected byte stream the receiver can read frames from.
pub trait Transport: Read {
    /// Closes both directions of the stream.
    fn close(&mut self) -> io::Result<()>;

    /// Bounds how long a single read may block. Transports without
    /// timeouts ignore it.
    fn set_read_timeout(&mut self, _timeout: Option<Duration>) -> io::Result<()> {
        Ok(())
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }
}

impl Transport for TcpStream {
    fn close(&mut self) -> io::Result<()> {
        TcpStream::shutdown(self, Shutdown::Both)
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        TcpStream::peer_addr(self).ok()
    }
}

/// Opens transports for a [`FrameReceiver`].
pub trait Connector {
    type Stream: Transport;

    fn connect(&mut self, config: &Config) -> Result<Self::Stream, ConnectionError>;
}

/// Connects over TCP using `std::net`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&mut self, config: &Config) -> Result<TcpStream, ConnectionError> {
        let endpoint = config.endpoint();
        let addrs: Vec<SocketAddr> = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|source| ConnectionError::Resolve {
                endpoint: endpoint.clone(),
                source,
            })?
            .collect();

        let mut last_err = None;
        for addr in &addrs {
            let attempt = match config.connect_timeout {
                Some(timeout) => TcpStream::connect_timeout(addr, timeout),
                None => TcpStream::connect(addr),
            };
            match attempt {
                Ok(stream) => {
                    stream
                        .set_nodelay(config.tcp_nodelay)
                        .map_err(ConnectionError::SocketOption)?;
                    stream
                        .set_read_timeout(config.read_timeout)
                        .map_err(ConnectionError::SocketOption)?;
                    return Ok(stream);
                }
                Err(err) => {
                    debug!(%addr, error = %err, "connect attempt failed");
                    last_err = Some(err);
                }
            }
        }

        match last_err {
            Some(source) => Err(ConnectionError::Connect { endpoint, source }),
            None => Err(ConnectionError::NoAddress { endpoint }),
        }
    }
}

/// Cumulative receive counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReceiverStats {
    /// Wire bytes (header + payload) of successfully received frames
    pub bytes: u64,
    /// Successfully received frames
    pub frames: u64,
}

/// Receives fixed-size frames over a single connection.
pub struct FrameReceiver<C: Connector = TcpConnector> {
    config: Arc<Config>,
    connector: C,
    stream: Option<C::Stream>,
    header: Vec<u8>,
    // Stream read timeout is the short poll interval rather than the configured one.
    polling: bool,
    total_bytes_received: u64,
    total_frames_received: u64,
    // Dropped last so the stream closes before the library is released.
    _socket_lib: SocketLibraryGuard,
}

impl FrameReceiver<TcpConnector> {
    /// Creates a disconnected TCP receiver.
    pub fn new(config: Arc<Config>) -> Result<Self, SocketLibraryError> {
        Self::with_connector(config, TcpConnector)
    }
}

impl<C: Connector> FrameReceiver<C> {
    /// Creates a disconnected receiver using a custom transport.
    pub fn with_connector(config: Arc<Config>, connector: C) -> Result<Self, SocketLibraryError> {
        let socket_lib = SocketLibrary::acquire()?;
        Ok(Self {
            header: vec![0; config.header_size],
            config,
            connector,
            stream: None,
            polling: false,
            total_bytes_received: 0,
            total_frames_received: 0,
            _socket_lib: socket_lib,
        })
    }

    /// Connects to the configured endpoint. A no-op when already connected.
    pub fn connect(&mut self) -> Result<(), ConnectionError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = self.connector.connect(&self.config)?;
        match stream.peer_addr() {
            Some(peer) => info!(%peer, frame_size = self.frame_size(), "connected"),
            None => info!(endpoint = %self.config.endpoint(), "connected"),
        }
        self.stream = Some(stream);
        self.polling = false;
        Ok(())
    }

    /// Closes the connection. Idempotent; statistics are kept.
    pub fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(err) = stream.close() {
                // The peer may already be gone.
                debug!(error = %err, "close failed");
            }
            info!(
                frames = self.total_frames_received,
                bytes = self.total_bytes_received,
                "disconnected"
            );
        }
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Address of the connected peer, if the transport knows it.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.stream.as_ref().and_then(|stream| stream.peer_addr())
    }

    /// Payload bytes per frame, excluding the header.
    pub fn frame_size(&self) -> usize {
        self.config.frame_size()
    }

    pub fn total_bytes_received(&self) -> u64 {
        self.total_bytes_received
    }

    pub fn total_frames_received(&self) -> u64 {
        self.total_frames_received
    }

    pub fn stats(&self) -> ReceiverStats {
        ReceiverStats {
            bytes: self.total_bytes_received,
            frames: self.total_frames_received,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Shared handle to the config, for building a matching decoder.
    pub fn shared_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Receives one frame into `buffer`, resizing it to [`frame_size`].
    ///
    /// Blocks until the header and the full payload have arrived. On error
    /// the receiver is disconnected and `buffer` must not be used.
    ///
    /// [`frame_size`]: FrameReceiver::frame_size
    pub fn receive_frame(&mut self, buffer: &mut Vec<u8>) -> Result<(), ReceiveError> {
        self.receive(buffer, None)
    }

    /// Like [`receive_frame`](FrameReceiver::receive_frame), but gives up
    /// with [`ReceiveError::Interrupted`] once `stop` is raised.
    ///
    /// A blocked read notices the flag within [`STOP_POLL_INTERVAL`]. The
    /// configured read timeout still applies, measured from the last byte
    /// received.
    pub fn receive_frame_until(
        &mut self,
        buffer: &mut Vec<u8>,
        stop: &AtomicBool,
    ) -> Result<(), ReceiveError> {
        self.receive(buffer, Some(stop))
    }

    fn receive(&mut self, buffer: &mut Vec<u8>, stop: Option<&AtomicBool>) -> Result<(), ReceiveError> {
        let frame_size = self.frame_size();
        let header_size = self.header.len();
        let expected = header_size + frame_size;
        let read_timeout = self.config.read_timeout;

        let Some(stream) = self.stream.as_mut() else {
            return Err(ReceiveError::NotConnected);
        };

        let result = switch_polling(&mut *stream, &mut self.polling, stop.is_some(), read_timeout)
            .and_then(|()| {
                buffer.resize(frame_size, 0);
                let mut reader = ExactReader {
                    stop,
                    read_timeout,
                    expected,
                    last_progress: Instant::now(),
                };
                reader.fill(&mut *stream, &mut self.header, 0)?;
                reader.fill(stream, buffer, header_size)
            });

        match result {
            Ok(()) => {
                if header_size > 0 {
                    trace!(header = ?self.header, "frame header");
                }
                self.total_bytes_received += expected as u64;
                self.total_frames_received += 1;
                debug!(frame = self.total_frames_received, bytes = expected, "frame received");
                Ok(())
            }
            Err(err) => {
                if matches!(err, ReceiveError::Interrupted { .. }) {
                    debug!(error = %err, "frame receive stopped");
                } else {
                    warn!(error = %err, "frame receive failed");
                }
                self.disconnect();
                Err(err)
            }
        }
    }
}

impl<C: Connector> Drop for FrameReceiver<C> {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl<C: Connector> std::fmt::Debug for FrameReceiver<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReceiver")
            .field("endpoint", &self.config.endpoint())
            .field("connected", &self.is_connected())
            .field("frame_size", &self.frame_size())
            .field("total_frames_received", &self.total_frames_received)
            .finish()
    }
}

/// Moves the stream between the configured read timeout and the short
/// poll interval used while watching a stop flag.
fn switch_polling<T: Transport + ?Sized>(
    stream: &mut T,
    polling: &mut bool,
    want: bool,
    read_timeout: Option<Duration>,
) -> Result<(), ReceiveError> {
    if *polling == want {
        return Ok(());
    }
    let timeout = if want {
        Some(read_timeout.map_or(STOP_POLL_INTERVAL, |t| t.min(STOP_POLL_INTERVAL)))
    } else {
        read_timeout
    };
    stream.set_read_timeout(timeout)?;
    *polling = want;
    Ok(())
}

/// Fills buffers completely, looping over partial reads.
struct ExactReader<'a> {
    stop: Option<&'a AtomicBool>,
    read_timeout: Option<Duration>,
    /// Header plus payload, for the byte counts reported on failure
    expected: usize,
    last_progress: Instant,
}

impl ExactReader<'_> {
    /// `offset` is the number of frame bytes read before `buf`.
    fn fill<R: Read + ?Sized>(
        &mut self,
        stream: &mut R,
        buf: &mut [u8],
        offset: usize,
    ) -> Result<(), ReceiveError> {
        let expected = self.expected;
        let mut filled = 0;
        while filled < buf.len() {
            match stream.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(ReceiveError::ConnectionClosed {
                        received: offset + filled,
                        expected,
                    })
                }
                Ok(n) => {
                    filled += n;
                    self.last_progress = Instant::now();
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    let received = offset + filled;
                    // Without a stop flag the socket timeout is the configured one.
                    let Some(stop) = self.stop else {
                        return Err(ReceiveError::Timeout { received, expected });
                    };
                    if stop.load(Ordering::Relaxed) {
                        return Err(ReceiveError::Interrupted { received, expected });
                    }
                    if self
                        .read_timeout
                        .is_some_and(|limit| self.last_progress.elapsed() >= limit)
                    {
                        return Err(ReceiveError::Timeout { received, expected });
                    }
                }
                Err(err) => return Err(ReceiveError::Io(err)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// In-memory stream handing out data in a repeating pattern of chunk sizes.
    #[derive(Debug)]
    struct ChunkedStream {
        data: Vec<u8>,
        pos: usize,
        chunks: Vec<usize>,
        reads: usize,
        interrupt_every: Option<usize>,
        end_error: Option<ErrorKind>,
        stall_reads: usize,
    }

    impl ChunkedStream {
        fn new(data: Vec<u8>, chunks: Vec<usize>) -> Self {
            Self {
                data,
                pos: 0,
                chunks,
                reads: 0,
                interrupt_every: None,
                end_error: None,
                stall_reads: 0,
            }
        }
    }

    impl Read for ChunkedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.reads += 1;
            if self.reads <= self.stall_reads {
                return Err(io::Error::from(ErrorKind::WouldBlock));
            }
            if matches!(self.interrupt_every, Some(n) if self.reads % n == 0) {
                return Err(io::Error::from(ErrorKind::Interrupted));
            }
            if self.pos >= self.data.len() {
                return match self.end_error {
                    Some(kind) => Err(io::Error::from(kind)),
                    None => Ok(0),
                };
            }
            let chunk = self.chunks[self.reads % self.chunks.len()];
            let n = chunk.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    impl Transport for ChunkedStream {
        fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct ScriptedConnector {
        streams: VecDeque<ChunkedStream>,
        attempts: usize,
    }

    impl Connector for ScriptedConnector {
        type Stream = ChunkedStream;

        fn connect(&mut self, config: &Config) -> Result<ChunkedStream, ConnectionError> {
            self.attempts += 1;
            self.streams
                .pop_front()
                .ok_or_else(|| ConnectionError::Connect {
                    endpoint: config.endpoint(),
                    source: io::Error::from(ErrorKind::ConnectionRefused),
                })
        }
    }

    fn receiver(header_size: usize, streams: Vec<ChunkedStream>) -> FrameReceiver<ScriptedConnector> {
        let cfg = Config::new(4, 2).unwrap().with_header_size(header_size);
        let connector = ScriptedConnector {
            streams: streams.into(),
            attempts: 0,
        };
        FrameReceiver::with_connector(Arc::new(cfg), connector).unwrap()
    }

    fn receiver_with_timeout(
        read_timeout: Duration,
        streams: Vec<ChunkedStream>,
    ) -> FrameReceiver<ScriptedConnector> {
        let cfg = Config::new(4, 2)
            .unwrap()
            .with_read_timeout(Some(read_timeout));
        let connector = ScriptedConnector {
            streams: streams.into(),
            attempts: 0,
        };
        FrameReceiver::with_connector(Arc::new(cfg), connector).unwrap()
    }

    #[test]
    fn test_frame_size() {
        let cfg = Config::new(640, 480).unwrap();
        let rx = FrameReceiver::new(Arc::new(cfg)).unwrap();
        assert_eq!(rx.frame_size(), 76_800);
        assert!(!rx.is_connected());
    }

    #[test]
    fn test_receive_single_frame() {
        let mut rx = receiver(0, vec![ChunkedStream::new(vec![1, 2, 3, 4], vec![4])]);
        rx.connect().unwrap();

        let mut buffer = Vec::new();
        rx.receive_frame(&mut buffer).unwrap();

        assert_eq!(buffer, vec![1, 2, 3, 4]);
        assert_eq!(rx.total_frames_received(), 1);
        assert_eq!(rx.total_bytes_received(), 4);
    }

    #[test]
    fn test_partial_reads_reassembled() {
        let data: Vec<u8> = (0..12).collect();
        let mut stream = ChunkedStream::new(data, vec![1, 3, 2]);
        stream.interrupt_every = Some(4);
        let mut rx = receiver(0, vec![stream]);
        rx.connect().unwrap();

        let mut buffer = vec![0xAA; 100];
        for expected in [[0, 1, 2, 3], [4, 5, 6, 7], [8, 9, 10, 11]] {
            rx.receive_frame(&mut buffer).unwrap();
            assert_eq!(buffer, expected);
        }
        assert_eq!(rx.stats(), ReceiverStats { bytes: 12, frames: 3 });
    }

    #[test]
    fn test_header_discarded() {
        let data = vec![0xEE, 0xEE, 9, 8, 7, 6, 0xEE, 0xEE, 5, 4, 3, 2];
        let mut rx = receiver(2, vec![ChunkedStream::new(data, vec![3])]);
        rx.connect().unwrap();

        let mut buffer = Vec::new();
        rx.receive_frame(&mut buffer).unwrap();
        assert_eq!(buffer, vec![9, 8, 7, 6]);
        rx.receive_frame(&mut buffer).unwrap();
        assert_eq!(buffer, vec![5, 4, 3, 2]);
        assert_eq!(rx.total_bytes_received(), 12);
    }

    #[test]
    fn test_close_mid_frame_disconnects() {
        let mut rx = receiver(0, vec![ChunkedStream::new(vec![1, 2, 3, 4, 5, 6], vec![2])]);
        rx.connect().unwrap();
        let mut buffer = Vec::new();
        rx.receive_frame(&mut buffer).unwrap();

        let err = rx.receive_frame(&mut buffer).unwrap_err();

        assert!(matches!(
            err,
            ReceiveError::ConnectionClosed {
                received: 2,
                expected: 4
            }
        ));
        assert!(!rx.is_connected());
        assert_eq!(rx.total_frames_received(), 1);
        assert_eq!(rx.total_bytes_received(), 4);
    }

    #[test]
    fn test_close_inside_header() {
        let mut rx = receiver(4, vec![ChunkedStream::new(vec![0xEE], vec![1])]);
        rx.connect().unwrap();
        let err = rx.receive_frame(&mut Vec::new()).unwrap_err();
        assert!(matches!(
            err,
            ReceiveError::ConnectionClosed {
                received: 1,
                expected: 8
            }
        ));
    }

    #[test]
    fn test_timeout_and_socket_error() {
        let mut timed_out = ChunkedStream::new(vec![1], vec![1]);
        timed_out.end_error = Some(ErrorKind::WouldBlock);
        let mut reset = ChunkedStream::new(vec![], vec![1]);
        reset.end_error = Some(ErrorKind::ConnectionReset);
        let mut rx = receiver(0, vec![timed_out, reset]);
        let mut buffer = Vec::new();

        rx.connect().unwrap();
        let err = rx.receive_frame(&mut buffer).unwrap_err();
        assert!(matches!(err, ReceiveError::Timeout { received: 1, .. }));
        assert!(!rx.is_connected());

        rx.connect().unwrap();
        let err = rx.receive_frame(&mut buffer).unwrap_err();
        assert!(matches!(err, ReceiveError::Io(_)));
        assert!(!rx.is_connected());
    }

    #[test]
    fn test_receive_while_disconnected() {
        let mut rx = receiver(0, vec![]);
        let mut buffer = vec![7];
        assert!(matches!(
            rx.receive_frame(&mut buffer),
            Err(ReceiveError::NotConnected)
        ));
        assert_eq!(buffer, vec![7]);
    }

    #[test]
    fn test_connect_is_idempotent() {
        let mut rx = receiver(0, vec![ChunkedStream::new(vec![], vec![1])]);
        rx.connect().unwrap();
        rx.connect().unwrap();
        assert_eq!(rx.connector.attempts, 1);
        assert!(rx.is_connected());
    }

    #[test]
    fn test_connect_failure() {
        let mut rx = receiver(0, vec![]);
        assert!(matches!(
            rx.connect(),
            Err(ConnectionError::Connect { .. })
        ));
        assert!(!rx.is_connected());
    }

    #[test]
    fn test_stats_survive_reconnect() {
        let mut rx = receiver(
            0,
            vec![
                ChunkedStream::new(vec![1, 2, 3, 4], vec![4]),
                ChunkedStream::new(vec![5, 6, 7, 8], vec![4]),
            ],
        );
        let mut buffer = Vec::new();

        rx.connect().unwrap();
        rx.receive_frame(&mut buffer).unwrap();
        rx.disconnect();
        rx.disconnect();
        assert_eq!(rx.total_frames_received(), 1);

        rx.connect().unwrap();
        rx.receive_frame(&mut buffer).unwrap();
        assert_eq!(buffer, vec![5, 6, 7, 8]);
        assert_eq!(rx.stats(), ReceiverStats { bytes: 8, frames: 2 });
    }

    #[test]
    fn test_moved_receiver_keeps_connection() {
        let mut rx = receiver(0, vec![ChunkedStream::new(vec![1, 2, 3, 4], vec![4])]);
        rx.connect().unwrap();
        let mut moved = rx;
        let mut buffer = Vec::new();
        moved.receive_frame(&mut buffer).unwrap();
        assert!(moved.is_connected());
    }

    #[test]
    fn test_raised_stop_interrupts_stalled_read() {
        let mut stalled = ChunkedStream::new(vec![1], vec![1]);
        stalled.end_error = Some(ErrorKind::WouldBlock);
        let mut rx = receiver(0, vec![stalled]);
        rx.connect().unwrap();

        let err = rx
            .receive_frame_until(&mut Vec::new(), &AtomicBool::new(true))
            .unwrap_err();

        assert!(matches!(
            err,
            ReceiveError::Interrupted {
                received: 1,
                expected: 4
            }
        ));
        assert!(!rx.is_connected());
        assert_eq!(rx.total_frames_received(), 0);
    }

    #[test]
    fn test_unraised_stop_keeps_waiting() {
        let mut slow = ChunkedStream::new(vec![1, 2, 3, 4], vec![4]);
        slow.stall_reads = 3;
        let mut rx = receiver(0, vec![slow]);
        rx.connect().unwrap();

        let mut buffer = Vec::new();
        rx.receive_frame_until(&mut buffer, &AtomicBool::new(false))
            .unwrap();

        assert_eq!(buffer, vec![1, 2, 3, 4]);
        assert!(rx.is_connected());
    }

    #[test]
    fn test_read_timeout_applies_while_polling() {
        let mut silent = ChunkedStream::new(vec![], vec![1]);
        silent.end_error = Some(ErrorKind::WouldBlock);
        let mut rx = receiver_with_timeout(Duration::from_millis(5), vec![silent]);
        rx.connect().unwrap();

        let err = rx
            .receive_frame_until(&mut Vec::new(), &AtomicBool::new(false))
            .unwrap_err();

        assert!(matches!(err, ReceiveError::Timeout { received: 0, .. }));
        assert!(!rx.is_connected());
    }

    #[test]
    fn test_shared_config_is_same_instance() {
        let rx = receiver(3, vec![]);
        let cfg = rx.shared_config();
        assert_eq!(cfg.header_size, 3);
        assert!(std::ptr::eq(&*cfg, rx.config()));
    }
}
