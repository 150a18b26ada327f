//! Single-block padding for fixed-length records.
//!
//! Layout of the padded block:
//!
//! ```text
//! bytes  0..33  record
//! byte   33     0x80
//! bytes 34..56  0x00
//! bytes 56..64  00 00 00 00 00 00 01 08   (264 bits, big-endian)
//! ```
//!
//! Records longer than [`MAX_SINGLE_BLOCK_INPUT`](super::MAX_SINGLE_BLOCK_INPUT)
//! would need a second block; this engine only handles the 33-byte shape.

use super::constants::{BLOCK_LEN, RECORD_BIT_LEN, RECORD_LEN};
use super::{Block, Record};

/// Padding marker appended directly after the message.
pub const PAD_MARKER: u8 = 0x80;

/// The 31 bytes that follow every record in its padded block.
pub const PADDING_TAIL: [u8; BLOCK_LEN - RECORD_LEN] = padding_tail();

const fn padding_tail() -> [u8; BLOCK_LEN - RECORD_LEN] {
    let mut tail = [0u8; BLOCK_LEN - RECORD_LEN];
    tail[0] = PAD_MARKER;
    let len = RECORD_BIT_LEN.to_be_bytes();
    let base = tail.len() - 8;
    let mut i = 0;
    while i < 8 {
        tail[base + i] = len[i];
        i += 1;
    }
    tail
}

/// Build the padded block for one record.
#[inline]
pub fn pad_record(record: &Record) -> Block {
    let mut block = [0u8; BLOCK_LEN];
    block[..RECORD_LEN].copy_from_slice(record);
    block[RECORD_LEN..].copy_from_slice(&PADDING_TAIL);
    block
}
