//! Message schedule expansion.
//!
//! Two forms of the same recurrence:
//!
//! * [`MessageSchedule`] materializes all 64 words.
//! * [`ScheduleWindow`] keeps only 16 words, addressed modulo 16, and
//!   produces `W[t]` on demand. Slot `t % 16` holds `W[t-16]` right up to
//!   the moment `W[t]` replaces it, so the evicted word is read into a
//!   local before the slot is written.
//!
//! Both must agree word for word; the lane kernel uses the windowed form.

use super::Block;

#[inline(always)]
pub fn small_sigma0(x: u32) -> u32 {
    x.rotate_right(7) ^ x.rotate_right(18) ^ (x >> 3)
}

#[inline(always)]
pub fn small_sigma1(x: u32) -> u32 {
    x.rotate_right(17) ^ x.rotate_right(19) ^ (x >> 10)
}

/// `W[0..16]`: the block as big-endian 32-bit words.
#[inline]
pub fn block_words(block: &Block) -> [u32; 16] {
    let mut w = [0u32; 16];
    for (word, bytes) in w.iter_mut().zip(block.chunks_exact(4)) {
        *word = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    }
    w
}

/// Fully expanded schedule `W[0..64]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSchedule {
    pub words: [u32; 64],
}

impl MessageSchedule {
    pub fn expand(block: &Block) -> Self {
        let mut words = [0u32; 64];
        words[..16].copy_from_slice(&block_words(block));
        for i in 16..64 {
            words[i] = small_sigma1(words[i - 2])
                .wrapping_add(words[i - 7])
                .wrapping_add(small_sigma0(words[i - 15]))
                .wrapping_add(words[i - 16]);
        }
        Self { words }
    }
}

/// Sliding 16-word window over the schedule.
///
/// Yields `W[0], W[1], ..., W[63]` in order and then stops.
#[derive(Debug, Clone)]
pub struct ScheduleWindow {
    w: [u32; 16],
    t: usize,
}

impl ScheduleWindow {
    pub fn new(block: &Block) -> Self {
        Self { w: block_words(block), t: 0 }
    }

    /// Next schedule word. `t` only ever advances by one.
    #[inline(always)]
    fn advance(&mut self) -> u32 {
        let t = self.t;
        self.t += 1;
        let slot = t & 15;
        if t < 16 {
            return self.w[slot];
        }

        // Slot `t % 16` still holds W[t-16]; take it before overwriting.
        let evicted = self.w[slot];
        let w15 = self.w[(t + 1) & 15];
        let w7 = self.w[(t + 9) & 15];
        let w2 = self.w[(t + 14) & 15];

        let next = small_sigma1(w2)
            .wrapping_add(w7)
            .wrapping_add(small_sigma0(w15))
            .wrapping_add(evicted);
        self.w[slot] = next;
        next
    }
}

impl Iterator for ScheduleWindow {
    type Item = u32;

    #[inline]
    fn next(&mut self) -> Option<u32> {
        if self.t >= 64 {
            return None;
        }
        Some(self.advance())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = 64 - self.t;
        (left, Some(left))
    }
}

impl ExactSizeIterator for ScheduleWindow {}
