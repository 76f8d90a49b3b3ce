//! # Multi-state Bitmap
//!
//! A bit-packed array of small fixed-width states over borrowed storage.
//! Every item is `bits_per_state` bits wide (1, 2, 4 or 8) and items are
//! packed least-significant first, so with two bits per state index 0 lives
//! in bits 1..0 of byte 0, index 1 in bits 3..2 and so on.
//!
//! Every state change goes through a [`TransitionGuard`] that may refuse it.
//! The physical memory manager uses this to reject double frees and writes to
//! reserved frames.
//!
//! ```rust
//! # use kernel_bitmap::{AllowAll, Bitmap};
//! let mut bytes = [0u8; 2];
//! let mut map = Bitmap::new(&mut bytes, 2, AllowAll);
//! assert_eq!(map.capacity(), 8);
//! assert!(map.set_continuous(1, 3, 0b01));
//! assert_eq!(map.find_continuous(0b00, 4), Some(4));
//! assert!(map.find_continuous_at(0b01, 3, 1));
//! assert_eq!(map.as_bytes(), &[0b0101_0100, 0]);
//! ```
//!
//! ## Partial application
//! [`Bitmap::set_continuous`] does not roll back: when the guard refuses an
//! item, the items before it keep their new state. Callers that need all or
//! nothing check the run with [`Bitmap::find_continuous_at`] first.

#![cfg_attr(not(any(test, doctest)), no_std)]

use core::fmt;
use core::ops::Range;
use kernel_error::{Fatal, fatal};

/// Decides whether item `index` may change from `old` to `new`.
pub trait TransitionGuard {
    fn allow(&self, index: usize, old: u8, new: u8) -> bool;
}

impl<F> TransitionGuard for F
where
    F: Fn(usize, u8, u8) -> bool,
{
    #[inline]
    fn allow(&self, index: usize, old: u8, new: u8) -> bool {
        self(index, old, new)
    }
}

/// Guard that permits every transition.
#[derive(Debug, Default, Copy, Clone)]
pub struct AllowAll;

impl TransitionGuard for AllowAll {
    #[inline]
    fn allow(&self, _index: usize, _old: u8, _new: u8) -> bool {
        true
    }
}

/// Bit-packed state array over a borrowed byte slice.
pub struct Bitmap<'a, G> {
    bytes: &'a mut [u8],
    bits_per_state: usize,
    guard: G,
}

impl<'a, G: TransitionGuard> Bitmap<'a, G> {
    /// Wraps `bytes` without touching their contents.
    ///
    /// Stops the kernel if `bits_per_state` is not one of 1, 2, 4 or 8.
    #[track_caller]
    pub fn new(bytes: &'a mut [u8], bits_per_state: usize, guard: G) -> Self {
        if bits_per_state == 0 || bits_per_state > 8 || 8 % bits_per_state != 0 {
            fatal(Fatal::BitmapWidth {
                bits: bits_per_state,
            });
        }
        Self {
            bytes,
            bits_per_state,
            guard,
        }
    }

    #[inline]
    #[must_use]
    pub const fn bits_per_state(&self) -> usize {
        self.bits_per_state
    }

    #[inline]
    const fn states_per_byte(&self) -> usize {
        8 / self.bits_per_state
    }

    #[inline]
    const fn mask(&self) -> u8 {
        ((1u16 << self.bits_per_state) - 1) as u8
    }

    /// Number of items the storage holds.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.bytes.len() * self.states_per_byte()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..]
    }

    #[must_use]
    pub const fn guard(&self) -> &G {
        &self.guard
    }

    pub const fn guard_mut(&mut self) -> &mut G {
        &mut self.guard
    }

    #[inline]
    const fn locate(&self, index: usize) -> (usize, usize) {
        let per_byte = self.states_per_byte();
        (index / per_byte, (index % per_byte) * self.bits_per_state)
    }

    #[track_caller]
    fn check_index(&self, index: usize) {
        if index >= self.capacity() {
            fatal(Fatal::BitmapIndexOutOfRange {
                index,
                capacity: self.capacity(),
            });
        }
    }

    #[inline]
    fn read(&self, index: usize) -> u8 {
        let (byte, shift) = self.locate(index);
        (self.bytes[byte] >> shift) & self.mask()
    }

    #[inline]
    fn write(&mut self, index: usize, state: u8) {
        let (byte, shift) = self.locate(index);
        let mask = self.mask() << shift;
        self.bytes[byte] = (self.bytes[byte] & !mask) | (state << shift);
    }

    /// State of item `index`.
    #[track_caller]
    #[must_use]
    pub fn get(&self, index: usize) -> u8 {
        self.check_index(index);
        self.read(index)
    }

    /// Moves `len` items starting at `index` to `state`, asking the guard
    /// for every item.
    ///
    /// Returns `false` at the first refused transition; earlier items of the
    /// run are left changed.
    #[track_caller]
    pub fn set_continuous(&mut self, index: usize, len: usize, state: u8) -> bool {
        if state > self.mask() {
            fatal(Fatal::BitmapStateTooWide {
                state,
                bits: self.bits_per_state,
            });
        }
        if len == 0 {
            fatal(Fatal::BitmapEmptyRun);
        }
        match index.checked_add(len) {
            Some(end) if end <= self.capacity() => {}
            _ => fatal(Fatal::BitmapIndexOutOfRange {
                index: index.saturating_add(len - 1),
                capacity: self.capacity(),
            }),
        }

        for i in index..index + len {
            let old = self.read(i);
            if !self.guard.allow(i, old, state) {
                log::trace!("bitmap: transition {old} -> {state} refused at index {i}");
                return false;
            }
            self.write(i, state);
        }
        true
    }

    /// Index of the leftmost run of `len` items all in `state`.
    #[must_use]
    pub fn find_continuous(&self, state: u8, len: usize) -> Option<usize> {
        self.find_continuous_in(state, len, 0..self.capacity())
    }

    /// Like [`find_continuous`](Self::find_continuous) but the run must lie
    /// completely inside `within` (clamped to the capacity).
    #[must_use]
    pub fn find_continuous_in(&self, state: u8, len: usize, within: Range<usize>) -> Option<usize> {
        if len == 0 {
            return None;
        }
        let end = within.end.min(self.capacity());
        let mut run_start = within.start;
        let mut run_len = 0;
        for i in within.start..end {
            if self.read(i) == state {
                run_len += 1;
                if run_len == len {
                    return Some(run_start);
                }
            } else {
                run_start = i + 1;
                run_len = 0;
            }
        }
        None
    }

    /// Whether the `len` items starting at `at` are all in `state`.
    ///
    /// A run reaching past the capacity is never a match.
    #[must_use]
    pub fn find_continuous_at(&self, state: u8, len: usize, at: usize) -> bool {
        match at.checked_add(len) {
            Some(end) if len > 0 && end <= self.capacity() => (at..end).all(|i| self.read(i) == state),
            _ => false,
        }
    }

    /// Number of items in `state` within `within` (clamped to the capacity).
    #[must_use]
    pub fn count_in(&self, state: u8, within: Range<usize>) -> usize {
        let end = within.end.min(self.capacity());
        (within.start..end).filter(|&i| self.read(i) == state).count()
    }
}

impl<G> fmt::Debug for Bitmap<'_, G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("bytes", &self.bytes.len())
            .field("bits_per_state", &self.bits_per_state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_bit_states_pack_lsb_first() {
        let mut bytes = [0xFF_u8; 3];
        let mut map = Bitmap::new(&mut bytes, 2, AllowAll);
        for i in 0..4 {
            assert!(map.set_continuous(i, 1, i as u8));
        }
        assert_eq!(map.as_bytes(), &[0xE4, 0xFF, 0xFF]);
        for i in 0..4 {
            assert_eq!(map.get(i), i as u8);
        }
        assert_eq!(map.get(4), 3);
    }

    #[test]
    #[should_panic(expected = "bitmap state 4 does not fit in 2 bits")]
    fn state_wider_than_width_is_fatal() {
        let mut bytes = [0xFF_u8; 3];
        let mut map = Bitmap::new(&mut bytes, 2, AllowAll);
        map.set_continuous(3, 1, 4);
    }

    #[test]
    #[should_panic(expected = "does not divide a byte")]
    fn width_must_divide_eight() {
        let mut bytes = [0_u8; 1];
        let _ = Bitmap::new(&mut bytes, 3, AllowAll);
    }

    #[test]
    #[should_panic(expected = "bitmap run of zero items")]
    fn empty_run_is_fatal() {
        let mut bytes = [0_u8; 1];
        let mut map = Bitmap::new(&mut bytes, 1, AllowAll);
        map.set_continuous(0, 0, 1);
    }

    #[test]
    #[should_panic(expected = "bitmap index 8 out of range (capacity 8)")]
    fn get_past_capacity_is_fatal() {
        let mut bytes = [0_u8; 1];
        let map = Bitmap::new(&mut bytes, 1, AllowAll);
        let _ = map.get(8);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn set_past_capacity_is_fatal() {
        let mut bytes = [0_u8; 1];
        let mut map = Bitmap::new(&mut bytes, 2, AllowAll);
        map.set_continuous(2, 3, 1);
    }

    #[test]
    fn refused_transition_keeps_prefix() {
        let mut bytes = [0_u8; 1];
        let mut map = Bitmap::new(&mut bytes, 1, |index: usize, _old: u8, _new: u8| index != 5);
        assert!(!map.set_continuous(3, 4, 1));
        assert_eq!(map.as_bytes(), &[0b0001_1000]);
    }

    #[test]
    fn refused_first_item_changes_nothing() {
        let mut bytes = [0_u8; 1];
        let mut map = Bitmap::new(&mut bytes, 1, |_: usize, old: u8, new: u8| old != new);
        assert!(map.set_continuous(0, 2, 1));
        assert!(!map.set_continuous(0, 2, 1));
        assert_eq!(map.as_bytes(), &[0b11]);
    }

    #[test]
    fn find_returns_leftmost_run() {
        let mut bytes = [0b0100_0100_u8, 0];
        let map = Bitmap::new(&mut bytes, 1, AllowAll);
        assert_eq!(map.find_continuous(0, 1), Some(0));
        assert_eq!(map.find_continuous(0, 2), Some(0));
        assert_eq!(map.find_continuous(0, 3), Some(3));
        assert_eq!(map.find_continuous(0, 9), Some(7));
        assert_eq!(map.find_continuous(0, 10), None);
        assert_eq!(map.find_continuous(1, 1), Some(2));
        assert_eq!(map.find_continuous(1, 2), None);
    }

    #[test]
    fn find_in_respects_bounds() {
        let mut bytes = [0_u8; 1];
        let map = Bitmap::new(&mut bytes, 1, AllowAll);
        assert_eq!(map.find_continuous_in(0, 2, 1..8), Some(1));
        assert_eq!(map.find_continuous_in(0, 2, 1..2), None);
        assert_eq!(map.find_continuous_in(0, 2, 6..100), Some(6));
        assert_eq!(map.find_continuous_in(0, 3, 6..100), None);
    }

    #[test]
    fn find_at_rejects_runs_past_capacity() {
        let mut bytes = [0_u8; 1];
        let map = Bitmap::new(&mut bytes, 4, AllowAll);
        assert!(map.find_continuous_at(0, 2, 0));
        assert!(!map.find_continuous_at(0, 2, 1));
        assert!(!map.find_continuous_at(0, 0, 0));
        assert!(!map.find_continuous_at(0, usize::MAX, 1));
    }

    #[test]
    fn count_in_counts_states() {
        let mut bytes = [0b1110_0100_u8];
        let map = Bitmap::new(&mut bytes, 2, AllowAll);
        assert_eq!(map.count_in(0, 0..4), 1);
        assert_eq!(map.count_in(3, 0..4), 1);
        assert_eq!(map.count_in(0, 1..100), 0);
    }
}
