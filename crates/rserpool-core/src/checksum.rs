//! Handlespace checksums.
//!
//! Registrars compare handlespaces by exchanging a 16-bit one's-complement
//! checksum instead of the handlespace itself. Each pool element contributes
//! a checksum over its pool handle and identifier. Contributions are kept in
//! a wider [`ChecksumAccumulator`] so they can be added and subtracted
//! incrementally as elements come and go, and only folded down to the
//! 16-bit wire value by [`ChecksumAccumulator::finish`].

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use crate::pool_handle::PoolHandle;

/// Finished 16-bit checksum as carried in a Handlespace Checksum parameter.
pub type HandlespaceChecksum = u16;

/// Running sum of 16-bit words, carries not yet folded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ChecksumAccumulator(u32);

impl ChecksumAccumulator {
    pub const INITIAL: ChecksumAccumulator = ChecksumAccumulator(0);

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    /// Add `bytes` as big-endian 16-bit words. A trailing odd byte is
    /// padded with zero.
    pub fn compute(self, bytes: &[u8]) -> Self {
        let mut sum = self.0;
        let mut words = bytes.chunks_exact(2);
        for word in &mut words {
            sum = sum.wrapping_add(u32::from(u16::from_be_bytes([word[0], word[1]])));
        }
        if let [last] = words.remainder() {
            sum = sum.wrapping_add(u32::from(u16::from_be_bytes([*last, 0])));
        }
        Self(sum)
    }

    /// Fold the carries back into 16 bits and complement.
    pub fn finish(self) -> HandlespaceChecksum {
        let mut sum = self.0;
        while sum >> 16 != 0 {
            sum = (sum & 0xffff) + (sum >> 16);
        }
        !(sum as u16)
    }
}

impl Add for ChecksumAccumulator {
    type Output = Self;

    fn add(self, other: Self) -> Self {
        Self(self.0.wrapping_add(other.0))
    }
}

impl AddAssign for ChecksumAccumulator {
    fn add_assign(&mut self, other: Self) {
        *self = *self + other;
    }
}

impl Sub for ChecksumAccumulator {
    type Output = Self;

    fn sub(self, other: Self) -> Self {
        Self(self.0.wrapping_sub(other.0))
    }
}

impl SubAssign for ChecksumAccumulator {
    fn sub_assign(&mut self, other: Self) {
        *self = *self - other;
    }
}

impl std::iter::Sum for ChecksumAccumulator {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::INITIAL, Add::add)
    }
}

impl fmt::Display for ChecksumAccumulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.finish())
    }
}

/// Contribution of one pool element: its handle, then its identifier in
/// network byte order.
pub fn pool_element_checksum(handle: &PoolHandle, identifier: u32) -> ChecksumAccumulator {
    ChecksumAccumulator::INITIAL
        .compute(handle.as_bytes())
        .compute(&identifier.to_be_bytes())
}
