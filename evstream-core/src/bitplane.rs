//! Low-level bit-plane geometry and bit access.
//!
//! A frame is two stacked bit-planes. Each plane stores `height` rows of
//! `ceil(width / 8)` bytes, one bit per pixel, rows padded to whole bytes.
//! Every function that maps a pixel to a bit goes through [`bit_index`] and
//! [`bit_mask`] so the decoder and encoder cannot disagree on the convention.

use crate::types::BitOrder;

/// Number of bit-planes per frame.
pub const CHANNELS: usize = 2;

/// Bytes per bit-plane row: `ceil(width / 8)`.
#[inline]
pub fn row_bytes(width: u32) -> usize {
    (width as usize).div_ceil(8)
}

/// Bytes per bit-plane: `ceil(width / 8) * height`.
#[inline]
pub fn channel_size(width: u32, height: u32) -> usize {
    row_bytes(width) * height as usize
}

/// Payload bytes per frame: `2 * ceil(width / 8) * height`.
#[inline]
pub fn frame_size(width: u32, height: u32) -> usize {
    CHANNELS * channel_size(width, height)
}

/// Byte offset of pixel `(x, y)` within one bit-plane.
#[inline]
pub fn bit_index(x: usize, y: usize, row_bytes: usize) -> usize {
    y * row_bytes + x / 8
}

/// Mask selecting pixel `x` inside its byte.
#[inline]
pub fn bit_mask(x: usize, order: BitOrder) -> u8 {
    match order {
        BitOrder::MsbFirst => 0x80 >> (x % 8),
        BitOrder::LsbFirst => 0x01 << (x % 8),
    }
}

/// Returns whether pixel `(x, y)` is set in `plane`.
///
/// `plane` must hold at least `bit_index(x, y, row_bytes) + 1` bytes.
#[inline]
pub fn get_bit(plane: &[u8], x: usize, y: usize, row_bytes: usize, order: BitOrder) -> bool {
    plane[bit_index(x, y, row_bytes)] & bit_mask(x, order) != 0
}

/// Sets pixel `(x, y)` in `plane`.
#[inline]
pub fn set_bit(plane: &mut [u8], x: usize, y: usize, row_bytes: usize, order: BitOrder) {
    plane[bit_index(x, y, row_bytes)] |= bit_mask(x, order);
}

/// Pixel offsets within a byte whose bits are set, in ascending `x` order.
///
/// Returns an iterator over `0..8`; the caller adds `8 * byte_column`.
#[inline]
pub fn set_offsets(byte: u8, order: BitOrder) -> impl Iterator<Item = usize> {
    (0..8).filter(move |&offset| byte & bit_mask(offset, order) != 0)
}
