//! Bit-plane frame receiver and event decoder for event-camera emulation.
//!
//! An upstream sensor or simulator pushes dense frames over TCP. Each frame
//! holds two stacked bit-planes (positive and negative polarity) with one bit
//! per pixel. This crate reassembles those frames from the byte stream and
//! turns every set bit into a timestamped event.
//!
//! # Example
//!
//! ```no_run
//! use evstream_core::{Config, FrameDecoder, FrameReceiver};
//! use std::sync::Arc;
//!
//! let config = Arc::new(Config::new(640, 480).unwrap().with_endpoint("127.0.0.1", 5000));
//! let mut receiver = FrameReceiver::new(config.clone()).unwrap();
//! let decoder = FrameDecoder::new(config);
//!
//! receiver.connect().unwrap();
//! let mut frame = Vec::new();
//! let mut events = Vec::new();
//! for frame_number in 0.. {
//!     if receiver.receive_frame(&mut frame).is_err() {
//!         break;
//!     }
//!     let count = decoder.unpack(&frame, frame_number, &mut events).unwrap();
//!     println!("frame {}: {} events", frame_number, count);
//! }
//! ```
//!
//! # Features
//!
//! - Exact-size frame reassembly over partial TCP reads, with an optional
//!   per-frame header
//! - Deterministic `(channel, y, x)` event order with uniform per-frame timestamps
//! - MSB-first or LSB-first pixel order within bytes
//! - Frame encoder for simulators and synthetic test data
//! - CSV and binary event writers behind a common sink trait

pub mod bitplane;
pub mod config;
pub mod converter;
pub mod decoder;
pub mod encoder;
pub mod output;
pub mod receiver;
pub mod socket;
pub mod types;

// Re-export commonly used types
pub use config::{Config, ConfigError};
pub use converter::{ConvertError, Converter, ConverterStats, StopReason};
pub use decoder::{DecodeError, FrameDecoder};
pub use encoder::{EncodeError, FrameEncoder};
pub use output::{EventSink, FieldOrder, OutputError};
pub use receiver::{
    ConnectionError, Connector, FrameReceiver, ReceiveError, ReceiverStats, TcpConnector, Transport,
};
pub use socket::{SocketLibrary, SocketLibraryError};
pub use types::{BitOrder, Channel, Event, Resolution};
