//! SHA-256 compression function (FIPS 180-4 §6.2.2).
//!
//! Pure: one 64-byte block plus the running state in, updated state out.
//! All arithmetic wraps modulo 2^32.

use super::constants::K;
use super::schedule::ScheduleWindow;
use super::{Block, HashState};

#[inline(always)]
pub fn big_sigma0(x: u32) -> u32 {
    x.rotate_right(2) ^ x.rotate_right(13) ^ x.rotate_right(22)
}

#[inline(always)]
pub fn big_sigma1(x: u32) -> u32 {
    x.rotate_right(6) ^ x.rotate_right(11) ^ x.rotate_right(25)
}

#[inline(always)]
pub fn ch(x: u32, y: u32, z: u32) -> u32 {
    (x & y) ^ (!x & z)
}

#[inline(always)]
pub fn maj(x: u32, y: u32, z: u32) -> u32 {
    (x & y) ^ (x & z) ^ (y & z)
}

/// Working registers `a..h`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkingState {
    pub a: u32,
    pub b: u32,
    pub c: u32,
    pub d: u32,
    pub e: u32,
    pub f: u32,
    pub g: u32,
    pub h: u32,
}

impl WorkingState {
    #[inline(always)]
    pub fn load(state: &HashState) -> Self {
        let [a, b, c, d, e, f, g, h] = *state;
        Self { a, b, c, d, e, f, g, h }
    }

    /// One round with round constant `k` and schedule word `w`.
    #[inline(always)]
    pub fn round(&mut self, k: u32, w: u32) {
        let t1 = self
            .h
            .wrapping_add(big_sigma1(self.e))
            .wrapping_add(ch(self.e, self.f, self.g))
            .wrapping_add(k)
            .wrapping_add(w);
        let t2 = big_sigma0(self.a).wrapping_add(maj(self.a, self.b, self.c));

        self.h = self.g;
        self.g = self.f;
        self.f = self.e;
        self.e = self.d.wrapping_add(t1);
        self.d = self.c;
        self.c = self.b;
        self.b = self.a;
        self.a = t1.wrapping_add(t2);
    }

    #[inline(always)]
    pub fn fold_into(self, state: &mut HashState) {
        let regs = [self.a, self.b, self.c, self.d, self.e, self.f, self.g, self.h];
        for (word, reg) in state.iter_mut().zip(regs) {
            *word = word.wrapping_add(reg);
        }
    }
}

/// Apply one compression step to `state`.
#[inline]
pub fn compress(state: &mut HashState, block: &Block) {
    let mut regs = WorkingState::load(state);
    for (k, w) in K.iter().zip(ScheduleWindow::new(block)) {
        regs.round(*k, w);
    }
    regs.fold_into(state);
}
