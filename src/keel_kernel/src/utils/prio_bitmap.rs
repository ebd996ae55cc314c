//! A one-word bit set over priority levels supporting constant-time
//! highest-set-bit scans.
//!
//! The fixed-priority scheduler keeps one bit per priority level; finding
//! the highest non-empty ready list is a single count-leading-zeros
//! instruction on the target.
use core::fmt;

use super::Init;

/// Bit set over `LEN` priority levels (`LEN <= 32`). Bit `i` set means
/// "level `i` is non-empty".
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) struct PrioBitmap<const LEN: usize> {
    bits: u32,
}

impl<const LEN: usize> Init for PrioBitmap<LEN> {
    const INIT: Self = Self { bits: 0 };
}

impl<const LEN: usize> fmt::Debug for PrioBitmap<LEN> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_list()
            .entries((0..LEN).filter(|&i| self.get(i)))
            .finish()
    }
}

impl<const LEN: usize> PrioBitmap<LEN> {
    const VALID: () = assert!(LEN >= 1 && LEN <= 32, "unsupported level count");

    /// Get the bit at the specified position.
    pub(crate) fn get(&self, i: usize) -> bool {
        let () = Self::VALID;
        assert!(i < LEN);
        self.bits & (1 << i) != 0
    }

    /// Set the bit at the specified position.
    pub(crate) fn set(&mut self, i: usize) {
        assert!(i < LEN);
        self.bits |= 1 << i;
    }

    /// Clear the bit at the specified position.
    pub(crate) fn clear(&mut self, i: usize) {
        assert!(i < LEN);
        self.bits &= !(1 << i);
    }

    /// Get the position of the highest set bit.
    pub(crate) fn find_highest(&self) -> Option<usize> {
        if self.bits == 0 {
            None
        } else {
            Some(31 - self.bits.leading_zeros() as usize)
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.bits == 0
    }
}
