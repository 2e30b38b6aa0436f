//! Core types shared by the receiver, decoder and output writers.

use serde::Deserialize;

/// A decoded per-pixel change event.
///
/// Each event marks one set bit of a frame's bit-planes: the pixel coordinates,
/// the channel it came from and the timestamp synthesized from the frame number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(C)]
pub struct Event {
    /// Timestamp in configured time units
    pub timestamp: u64,
    /// X coordinate of the pixel, `0..width`
    pub x: u16,
    /// Y coordinate of the pixel, `0..height`
    pub y: u16,
    /// `true` for the positive channel, `false` for the negative channel
    pub polarity: bool,
}

impl Event {
    /// Creates a new event.
    #[inline]
    pub fn new(timestamp: u64, x: u16, y: u16, polarity: bool) -> Self {
        Self {
            timestamp,
            x,
            y,
            polarity,
        }
    }

    /// Bit-plane channel this event belongs to (0 = positive, 1 = negative).
    #[inline]
    pub fn channel(&self) -> usize {
        Channel::from_polarity(self.polarity) as usize
    }
}

/// One of the two stacked bit-planes in a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Channel {
    /// Positive brightness change (channel 0)
    Positive = 0,
    /// Negative brightness change (channel 1)
    Negative = 1,
}

impl Channel {
    /// Both channels in wire order.
    pub const ALL: [Channel; 2] = [Channel::Positive, Channel::Negative];

    #[inline]
    pub fn from_polarity(polarity: bool) -> Self {
        if polarity {
            Self::Positive
        } else {
            Self::Negative
        }
    }

    #[inline]
    pub fn polarity(self) -> bool {
        matches!(self, Self::Positive)
    }
}

/// Order of pixels within a byte of a bit-plane row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BitOrder {
    /// Pixel `x % 8 == 0` is the top bit (`0x80`) of its byte
    #[default]
    MsbFirst,
    /// Pixel `x % 8 == 0` is the bottom bit (`0x01`) of its byte
    LsbFirst,
}

impl std::str::FromStr for BitOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "msb" | "msb-first" | "msb_first" => Ok(Self::MsbFirst),
            "lsb" | "lsb-first" | "lsb_first" => Ok(Self::LsbFirst),
            other => Err(format!("Unknown bit order: {}. Use msb-first or lsb-first", other)),
        }
    }
}

/// Sensor geometry in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for Resolution {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}
