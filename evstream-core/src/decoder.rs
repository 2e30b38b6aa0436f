//! Bit-plane frame decoder.
//!
//! Converts one dense two-channel frame into a sparse, ordered list of
//! events. The decoder holds no per-call state, so a single instance can be
//! shared across threads as long as every call gets its own output vector.

use crate::bitplane;
use crate::config::Config;
use crate::types::{BitOrder, Channel, Event, Resolution};
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur while decoding a frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid frame size: expected {expected} bytes, got {actual}")]
    InvalidFrameSize { expected: usize, actual: usize },

    #[error("timestamp overflow for frame {frame_number}")]
    TimestampOverflow { frame_number: u64 },
}

/// Stateless decoder for bit-plane frames.
#[derive(Debug, Clone)]
pub struct FrameDecoder {
    config: Arc<Config>,
    row_bytes: usize,
    channel_size: usize,
}

impl FrameDecoder {
    /// Creates a decoder for the geometry and timing in `config`.
    ///
    /// The config is used as given; see [`Config::validate`].
    pub fn new(config: Arc<Config>) -> Self {
        let row_bytes = bitplane::row_bytes(config.width);
        let channel_size = bitplane::channel_size(config.width, config.height);
        Self {
            config,
            row_bytes,
            channel_size,
        }
    }

    /// Frame payload size in bytes: `2 * ceil(width / 8) * height`.
    #[inline]
    pub fn expected_frame_size(&self) -> usize {
        bitplane::CHANNELS * self.channel_size
    }

    pub fn resolution(&self) -> Resolution {
        self.config.resolution()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Timestamp shared by every event of `frame_number`.
    pub fn timestamp_for(&self, frame_number: u64) -> Result<u64, DecodeError> {
        frame_number
            .checked_mul(self.config.timestamp_interval)
            .and_then(|t| t.checked_add(self.config.timestamp_offset))
            .ok_or(DecodeError::TimestampOverflow { frame_number })
    }

    /// Decodes `frame_data` into `events`, replacing its previous contents.
    ///
    /// Events are emitted in `(channel, y, x)` order and all carry the same
    /// timestamp. Returns the number of events, i.e. the number of set bits
    /// inside the sensor area of both channels. On error `events` is left
    /// empty.
    pub fn unpack(
        &self,
        frame_data: &[u8],
        frame_number: u64,
        events: &mut Vec<Event>,
    ) -> Result<usize, DecodeError> {
        events.clear();

        let expected = self.expected_frame_size();
        if frame_data.len() != expected {
            return Err(DecodeError::InvalidFrameSize {
                expected,
                actual: frame_data.len(),
            });
        }

        let timestamp = self.timestamp_for(frame_number)?;
        // A zero-width sensor has no rows to scan.
        if self.row_bytes == 0 {
            return Ok(0);
        }
        let (positive, negative) = frame_data.split_at(self.channel_size);

        for channel in Channel::ALL {
            let plane = match channel {
                Channel::Positive => positive,
                Channel::Negative => negative,
            };
            self.unpack_plane(plane, timestamp, channel.polarity(), events);
        }

        Ok(events.len())
    }

    /// Returns whether pixel `(x, y)` is set in `channel` of `frame_data`.
    ///
    /// `frame_data` must already have the expected size.
    pub fn get_bit(&self, frame_data: &[u8], channel: Channel, x: u32, y: u32) -> bool {
        let start = channel as usize * self.channel_size;
        let plane = &frame_data[start..start + self.channel_size];
        bitplane::get_bit(
            plane,
            x as usize,
            y as usize,
            self.row_bytes,
            self.config.bit_order,
        )
    }

    /// Scans one bit-plane row by row, skipping empty bytes.
    #[inline]
    fn unpack_plane(&self, plane: &[u8], timestamp: u64, polarity: bool, events: &mut Vec<Event>) {
        let width = self.config.width as usize;
        let order: BitOrder = self.config.bit_order;

        for (y, row) in plane.chunks_exact(self.row_bytes).enumerate() {
            for (column, &byte) in row.iter().enumerate() {
                if byte == 0 {
                    continue;
                }
                let base_x = column * 8;
                for offset in bitplane::set_offsets(byte, order) {
                    let x = base_x + offset;
                    // Padding bits past the sensor edge.
                    if x >= width {
                        break;
                    }
                    events.push(Event::new(timestamp, x as u16, y as u16, polarity));
                }
            }
        }
    }
}
