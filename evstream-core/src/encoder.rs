//! Packs events back into bit-plane frames.
//!
//! Used by the replay simulator and to build synthetic frames. Bits are
//! placed with the same convention the decoder reads them with.

use crate::bitplane;
use crate::config::Config;
use crate::types::Event;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur while encoding a frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("event at ({x}, {y}) lies outside the {width}x{height} sensor")]
    OutOfBounds { x: u16, y: u16, width: u32, height: u32 },
}

/// Writes events into a dense two-channel frame.
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    config: Arc<Config>,
}

impl FrameEncoder {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    pub fn frame_size(&self) -> usize {
        self.config.frame_size()
    }

    /// Encodes `events` into `buffer`, resizing and zeroing it first.
    ///
    /// Timestamps are ignored; duplicate events set the same bit. On error
    /// the buffer holds the events encoded so far.
    pub fn encode(&self, events: &[Event], buffer: &mut Vec<u8>) -> Result<(), EncodeError> {
        let (width, height) = (self.config.width, self.config.height);
        let row_bytes = bitplane::row_bytes(width);
        let channel_size = bitplane::channel_size(width, height);

        buffer.clear();
        buffer.resize(self.frame_size(), 0);

        for event in events {
            if u32::from(event.x) >= width || u32::from(event.y) >= height {
                return Err(EncodeError::OutOfBounds {
                    x: event.x,
                    y: event.y,
                    width,
                    height,
                });
            }
            let start = event.channel() * channel_size;
            bitplane::set_bit(
                &mut buffer[start..start + channel_size],
                event.x as usize,
                event.y as usize,
                row_bytes,
                self.config.bit_order,
            );
        }
        Ok(())
    }

    /// Convenience wrapper returning a fresh buffer.
    pub fn encode_to_vec(&self, events: &[Event]) -> Result<Vec<u8>, EncodeError> {
        let mut buffer = Vec::with_capacity(self.frame_size());
        self.encode(events, &mut buffer)?;
        Ok(buffer)
    }
}
