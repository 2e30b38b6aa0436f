//! Receive → decode → sink pipeline.

use crate::decoder::FrameDecoder;
use crate::output::{EventSink, OutputError};
use crate::receiver::{ConnectionError, Connector, FrameReceiver, ReceiveError, TcpConnector};
use crate::types::Event;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that abort a conversion run.
#[derive(Error, Debug)]
pub enum ConvertError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("failed to write events: {0}")]
    Output(#[from] OutputError),
}

/// Why a conversion run ended.
#[derive(Debug)]
pub enum StopReason {
    /// The frame limit was reached
    FrameLimit,
    /// The stop flag was raised
    Stopped,
    /// Receiving failed; the receiver is disconnected
    Disconnected(ReceiveError),
}

/// Counters for one or more conversion runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConverterStats {
    /// Frames decoded and handed to the sink
    pub frames: u64,
    /// Events handed to the sink
    pub events: u64,
    /// Frames received but rejected by the decoder
    pub skipped_frames: u64,
    /// Wire bytes received
    pub bytes: u64,
}

/// Drives a [`FrameReceiver`] and a [`FrameDecoder`] into an [`EventSink`].
///
/// The decoder is built from the receiver's own config, so both always
/// agree on the frame size. Frame numbers start at 0 and advance with every received frame,
/// including skipped ones, so timestamps keep tracking wire order.
#[derive(Debug)]
pub struct Converter<C: Connector = TcpConnector> {
    receiver: FrameReceiver<C>,
    decoder: FrameDecoder,
    next_frame_number: u64,
    frame: Vec<u8>,
    events: Vec<Event>,
    stats: ConverterStats,
}

impl<C: Connector> Converter<C> {
    pub fn new(receiver: FrameReceiver<C>) -> Self {
        let decoder = FrameDecoder::new(receiver.shared_config());
        Self {
            frame: Vec::with_capacity(decoder.expected_frame_size()),
            receiver,
            decoder,
            next_frame_number: 0,
            events: Vec::new(),
            stats: ConverterStats::default(),
        }
    }

    pub fn receiver(&self) -> &FrameReceiver<C> {
        &self.receiver
    }

    pub fn receiver_mut(&mut self) -> &mut FrameReceiver<C> {
        &mut self.receiver
    }

    pub fn decoder(&self) -> &FrameDecoder {
        &self.decoder
    }

    pub fn stats(&self) -> ConverterStats {
        self.stats
    }

    /// Number the next received frame will get.
    pub fn next_frame_number(&self) -> u64 {
        self.next_frame_number
    }

    /// Receives and decodes one frame into `sink`.
    ///
    /// Returns `Ok(None)` after a frame was handled (decoded or skipped),
    /// or `Ok(Some(reason))` when the receiver failed.
    pub fn step<S: EventSink + ?Sized>(
        &mut self,
        sink: &mut S,
    ) -> Result<Option<StopReason>, ConvertError> {
        self.advance(sink, None)
    }

    fn advance<S: EventSink + ?Sized>(
        &mut self,
        sink: &mut S,
        stop: Option<&AtomicBool>,
    ) -> Result<Option<StopReason>, ConvertError> {
        let received = match stop {
            Some(stop) => self.receiver.receive_frame_until(&mut self.frame, stop),
            None => self.receiver.receive_frame(&mut self.frame),
        };
        match received {
            Ok(()) => {}
            Err(ReceiveError::Interrupted { .. }) => return Ok(Some(StopReason::Stopped)),
            Err(err) => return Ok(Some(StopReason::Disconnected(err))),
        }
        self.stats.bytes = self.receiver.total_bytes_received();

        let frame_number = self.next_frame_number;
        self.next_frame_number += 1;

        match self.decoder.unpack(&self.frame, frame_number, &mut self.events) {
            Ok(count) => {
                sink.append_events(&self.events)?;
                self.stats.frames += 1;
                self.stats.events += count as u64;
                debug!(frame_number, events = count, "frame decoded");
            }
            Err(err) => {
                self.stats.skipped_frames += 1;
                warn!(frame_number, error = %err, "skipping frame");
            }
        }
        Ok(None)
    }

    /// Connects if needed and converts frames until the limit, the stop
    /// flag, or a receive failure.
    ///
    /// Raising `stop` also ends a receive blocked on a silent peer; the
    /// partial frame is dropped and the sink is still flushed.
    pub fn run<S: EventSink + ?Sized>(
        &mut self,
        sink: &mut S,
        frame_limit: Option<u64>,
        stop: &AtomicBool,
    ) -> Result<StopReason, ConvertError> {
        self.receiver.connect()?;
        let start_frames = self.stats.frames + self.stats.skipped_frames;

        let reason = loop {
            if stop.load(Ordering::Relaxed) {
                break StopReason::Stopped;
            }
            let handled = self.stats.frames + self.stats.skipped_frames - start_frames;
            if frame_limit.is_some_and(|limit| handled >= limit) {
                break StopReason::FrameLimit;
            }
            if let Some(reason) = self.advance(sink, Some(stop))? {
                break reason;
            }
        };

        sink.flush()?;
        info!(
            frames = self.stats.frames,
            events = self.stats.events,
            skipped = self.stats.skipped_frames,
            reason = ?reason,
            "conversion stopped"
        );
        Ok(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::receiver::Transport;
    use std::io::{self, Cursor, ErrorKind, Read};
    use std::sync::Arc;

    struct MemoryStream(Cursor<Vec<u8>>);

    impl Read for MemoryStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.read(buf)
        }
    }

    impl Transport for MemoryStream {
        fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct MemoryConnector(Option<Vec<u8>>);

    impl Connector for MemoryConnector {
        type Stream = MemoryStream;

        fn connect(&mut self, config: &Config) -> Result<MemoryStream, ConnectionError> {
            self.0
                .take()
                .map(|data| MemoryStream(Cursor::new(data)))
                .ok_or_else(|| ConnectionError::NoAddress {
                    endpoint: config.endpoint(),
                })
        }
    }

    fn converter(wire: Vec<u8>, interval: u64) -> Converter<MemoryConnector> {
        let cfg = Arc::new(Config::new(4, 2).unwrap().with_timestamp_interval(interval));
        let receiver = FrameReceiver::with_connector(cfg, MemoryConnector(Some(wire))).unwrap();
        Converter::new(receiver)
    }

    #[test]
    fn test_run_until_disconnect() {
        let wire = vec![
            0x80, 0x00, 0x00, 0x00, // frame 0: (0,0,+)
            0x00, 0x00, 0x00, 0x10, // frame 1: (3,1,-)
            0x80, 0x00, // truncated frame
        ];
        let mut conv = converter(wire, 100);
        let mut sink: Vec<Event> = Vec::new();

        let reason = conv.run(&mut sink, None, &AtomicBool::new(false)).unwrap();

        assert!(matches!(
            reason,
            StopReason::Disconnected(ReceiveError::ConnectionClosed { .. })
        ));
        assert_eq!(
            sink,
            vec![Event::new(0, 0, 0, true), Event::new(100, 3, 1, false)]
        );
        assert_eq!(
            conv.stats(),
            ConverterStats {
                frames: 2,
                events: 2,
                skipped_frames: 0,
                bytes: 8
            }
        );
        assert!(!conv.receiver().is_connected());
    }

    #[test]
    fn test_frame_limit() {
        let mut conv = converter(vec![0xFF; 40], 1);
        let mut sink: Vec<Event> = Vec::new();

        let reason = conv.run(&mut sink, Some(3), &AtomicBool::new(false)).unwrap();

        assert!(matches!(reason, StopReason::FrameLimit));
        assert_eq!(conv.stats().frames, 3);
        assert_eq!(conv.next_frame_number(), 3);
        assert_eq!(sink.len(), 3 * 16);
        assert_eq!(sink.last().unwrap().timestamp, 2);
    }

    #[test]
    fn test_stop_flag() {
        let mut conv = converter(vec![0; 8], 1);
        let mut sink: Vec<Event> = Vec::new();

        let reason = conv.run(&mut sink, None, &AtomicBool::new(true)).unwrap();

        assert!(matches!(reason, StopReason::Stopped));
        assert_eq!(conv.stats().frames, 0);
    }

    #[test]
    fn test_connect_failure_aborts() {
        let cfg = Arc::new(Config::new(4, 2).unwrap());
        let receiver = FrameReceiver::with_connector(cfg, MemoryConnector(None)).unwrap();
        let mut conv = Converter::new(receiver);

        let err = conv
            .run(&mut Vec::<Event>::new(), None, &AtomicBool::new(false))
            .unwrap_err();
        assert!(matches!(err, ConvertError::Connection(_)));
    }

    #[test]
    fn test_overflowing_frame_skipped() {
        let cfg = Arc::new(
            Config::new(4, 2)
                .unwrap()
                .with_timestamp_interval(u64::MAX / 2 + 1),
        );
        let receiver = FrameReceiver::with_connector(cfg, MemoryConnector(Some(vec![0x80; 12]))).unwrap();
        let mut conv = Converter::new(receiver);
        let mut sink: Vec<Event> = Vec::new();

        conv.run(&mut sink, None, &AtomicBool::new(false)).unwrap();

        // Frames 0 and 1 fit; frame 2 overflows.
        assert_eq!(conv.stats().frames, 2);
        assert_eq!(conv.stats().skipped_frames, 1);
        assert_eq!(sink.len(), 8);
    }

    /// Delivers its data, then reports a stalled read once the stop flag is up.
    struct StallingStream {
        data: Cursor<Vec<u8>>,
        stop: Arc<AtomicBool>,
    }

    impl Read for StallingStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.data.read(buf)? {
                0 => {
                    self.stop.store(true, Ordering::Relaxed);
                    Err(io::Error::from(ErrorKind::WouldBlock))
                }
                n => Ok(n),
            }
        }
    }

    impl Transport for StallingStream {
        fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct StallingConnector(Option<StallingStream>);

    impl Connector for StallingConnector {
        type Stream = StallingStream;

        fn connect(&mut self, config: &Config) -> Result<StallingStream, ConnectionError> {
            self.0.take().ok_or_else(|| ConnectionError::NoAddress {
                endpoint: config.endpoint(),
            })
        }
    }

    #[test]
    fn test_stop_during_stalled_receive() {
        let stop = Arc::new(AtomicBool::new(false));
        let stream = StallingStream {
            // One full frame, then half of the next.
            data: Cursor::new(vec![0x80, 0, 0, 0, 0x80, 0]),
            stop: Arc::clone(&stop),
        };
        let cfg = Arc::new(Config::new(4, 2).unwrap());
        let receiver = FrameReceiver::with_connector(cfg, StallingConnector(Some(stream))).unwrap();
        let mut conv = Converter::new(receiver);
        let mut sink: Vec<Event> = Vec::new();

        let reason = conv.run(&mut sink, None, &stop).unwrap();

        assert!(matches!(reason, StopReason::Stopped));
        assert_eq!(sink, vec![Event::new(0, 0, 0, true)]);
        assert_eq!(conv.stats().frames, 1);
        assert!(!conv.receiver().is_connected());
    }

    #[test]
    fn test_decoder_follows_receiver_geometry() {
        let cfg = Arc::new(Config::new(20, 3).unwrap().with_header_size(2));
        let receiver = FrameReceiver::with_connector(cfg, MemoryConnector(None)).unwrap();
        let conv = Converter::new(receiver);

        assert_eq!(conv.decoder().expected_frame_size(), conv.receiver().frame_size());
        assert_eq!(conv.decoder().resolution(), conv.receiver().config().resolution());
    }
}
