//! Incremental handlespace checksums.
//!
//! Each element contributes a 16-bit word sum over its identity and policy fields. Contributions
//! are kept in a 32-bit accumulator so they can be added when an element appears and
//! subtracted when it goes away. [`ChecksumAccumulator::finish`] folds the carries into the
//! 16-bit value exchanged with peers.

use std::{
    fmt,
    ops::{Add, AddAssign, Sub, SubAssign},
};

use serde::{Deserialize, Serialize};

/// Finished 16-bit checksum as exchanged between registrars.
pub type HandlespaceChecksum = u16;

/// 32-bit running checksum.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChecksumAccumulator(u32);

impl ChecksumAccumulator {
    /// The empty accumulator.
    pub const INITIAL: ChecksumAccumulator = ChecksumAccumulator(0);

    /// Wraps a raw accumulator value.
    pub const fn from_raw(raw: u32) -> Self {
        ChecksumAccumulator(raw)
    }

    /// Returns the raw accumulator value.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Adds the big-endian 16-bit words of `buf`, zero-padding an odd trailing byte.
    pub fn compute(self, buf: &[u8]) -> Self {
        let mut chunks = buf.chunks_exact(2);
        let mut sum = self.0;
        for word in &mut chunks {
            sum = sum.wrapping_add(u32::from(u16::from_be_bytes([word[0], word[1]])));
        }
        if let [last] = chunks.remainder() {
            sum = sum.wrapping_add(u32::from(u16::from_be_bytes([*last, 0])));
        }
        ChecksumAccumulator(sum)
    }

    /// Folds the carries and returns the one's complement.
    pub fn finish(self) -> HandlespaceChecksum {
        let mut sum = self.0;
        while sum >> 16 != 0 {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        !(sum as u16)
    }
}

impl Add for ChecksumAccumulator {
    type Output = ChecksumAccumulator;

    fn add(self, rhs: Self) -> Self::Output {
        ChecksumAccumulator(self.0.wrapping_add(rhs.0))
    }
}

impl AddAssign for ChecksumAccumulator {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for ChecksumAccumulator {
    type Output = ChecksumAccumulator;

    fn sub(self, rhs: Self) -> Self::Output {
        ChecksumAccumulator(self.0.wrapping_sub(rhs.0))
    }
}

impl SubAssign for ChecksumAccumulator {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl fmt::Display for ChecksumAccumulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${:04x}", self.finish())
    }
}
