//! A signal set, one bit per [`crate::Signal`] number.
//!
//! [`NSIG`](crate::NSIG) fits comfortably in a single machine word, so
//! unlike the page- and privilege-bitmaps elsewhere in this workspace
//! this does not need [`hadron_core::bitmap::Bitmap`]'s borrowed
//! multi-word storage; a plain `u32` is both the mask and the pending
//! set representation.

use crate::signal::Signal;

/// A set of signal numbers, represented as a bitmask with bit `n`
/// meaning signal number `n`. Bit 0 is unused (there is no signal 0).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SigSet(u32);

impl SigSet {
    /// The empty set.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// The set containing every signal this kernel defines.
    #[must_use]
    pub fn full() -> Self {
        let mut s = Self::empty();
        for n in 1..32u8 {
            if Signal::from_u8(n).is_some() {
                s.add(n);
            }
        }
        s
    }

    /// Adds signal number `n` to the set. A no-op if `n` is out of range.
    pub fn add(&mut self, n: u8) {
        if n < 32 {
            self.0 |= 1 << n;
        }
    }

    /// Removes signal number `n` from the set.
    pub fn remove(&mut self, n: u8) {
        if n < 32 {
            self.0 &= !(1 << n);
        }
    }

    /// Returns whether signal number `n` is in the set.
    #[must_use]
    pub const fn contains(self, n: u8) -> bool {
        n < 32 && (self.0 & (1 << n)) != 0
    }

    /// Returns whether the set has no members.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns the union of `self` and `other`.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Returns `self` with every member of `other` removed.
    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Returns the intersection of `self` and `other`.
    #[must_use]
    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Returns the lowest-numbered signal present in `self` and absent
    /// from `mask`, if any. Matches POSIX's lowest-number-first
    /// delivery order among simultaneously pending signals.
    #[must_use]
    pub fn lowest_unmasked(self, mask: Self) -> Option<Signal> {
        let deliverable = self.difference(mask);
        for n in 1..32u8 {
            if deliverable.contains(n) {
                if let Some(sig) = Signal::from_u8(n) {
                    return Some(sig);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_contains_remove() {
        let mut s = SigSet::empty();
        assert!(!s.contains(Signal::Term.number()));
        s.add(Signal::Term.number());
        assert!(s.contains(Signal::Term.number()));
        s.remove(Signal::Term.number());
        assert!(!s.contains(Signal::Term.number()));
    }

    #[test]
    fn lowest_unmasked_prefers_smaller_number() {
        let mut s = SigSet::empty();
        s.add(Signal::Term.number());
        s.add(Signal::Hup.number());
        assert_eq!(s.lowest_unmasked(SigSet::empty()), Some(Signal::Hup));
    }

    #[test]
    fn masked_signal_is_skipped() {
        let mut s = SigSet::empty();
        s.add(Signal::Hup.number());
        s.add(Signal::Term.number());
        let mut mask = SigSet::empty();
        mask.add(Signal::Hup.number());
        assert_eq!(s.lowest_unmasked(mask), Some(Signal::Term));
    }

    #[test]
    fn full_excludes_unassigned_numbers() {
        let full = SigSet::full();
        assert!(!full.contains(16));
        assert!(full.contains(Signal::Kill.number()));
    }

    #[test]
    fn set_algebra() {
        let mut a = SigSet::empty();
        a.add(1);
        a.add(2);
        let mut b = SigSet::empty();
        b.add(2);
        assert!(a.intersection(b).contains(2));
        assert!(a.difference(b).contains(1));
        assert!(!a.difference(b).contains(2));
    }
}
