use std::{
    ops::RangeInclusive,
    sync::atomic::{AtomicU64, Ordering},
};

const WORD_BITS: usize = u64::BITS as usize;
const WORD_SHIFT: usize = 6;
const WORD_MASK: usize = WORD_BITS - 1;

/// Fixed-size bit array with word-granular range operations.
///
/// Words are atomics so a vector can be shared between threads: single-bit
/// `set` reports whether it won the transition, everything else is a
/// point-in-time snapshot.
#[derive(Debug)]
pub struct BitVector {
    words: Box<[AtomicU64]>,
    len: usize,
}

impl BitVector {
    pub const WORD_BITS: usize = WORD_BITS;

    pub fn new(len: usize) -> Self {
        let words = (0..len.div_ceil(WORD_BITS))
            .map(|_| AtomicU64::new(0))
            .collect();

        Self { words, len }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn word_count(&self) -> usize {
        self.words.len()
    }

    #[inline]
    pub fn is_set(&self, bit: usize) -> bool {
        let word = self.words[bit >> WORD_SHIFT].load(Ordering::Acquire);
        word & (1 << (bit & WORD_MASK)) != 0
    }

    /// Returns true if any bit in `start..=end` is set.
    pub fn is_range_set(&self, start: usize, end: usize) -> bool {
        if start == end {
            return self.is_set(start);
        }

        debug_assert!(start < end, "inverted bit range {start}..={end}");

        let start_index = start >> WORD_SHIFT;
        let start_mask = u64::MAX << (start & WORD_MASK);

        let end_index = end >> WORD_SHIFT;
        let end_mask = u64::MAX >> (WORD_MASK - (end & WORD_MASK));

        if start_index == end_index {
            return self.load(start_index) & start_mask & end_mask != 0;
        }

        if self.load(start_index) & start_mask != 0 {
            return true;
        }

        if self.words[start_index + 1..end_index]
            .iter()
            .any(|w| w.load(Ordering::Acquire) != 0)
        {
            return true;
        }

        self.load(end_index) & end_mask != 0
    }

    /// Sets `bit`, returning true if it was previously unset.
    #[inline]
    pub fn set(&self, bit: usize) -> bool {
        let mask = 1 << (bit & WORD_MASK);
        let old = self.words[bit >> WORD_SHIFT].fetch_or(mask, Ordering::AcqRel);
        old & mask == 0
    }

    /// Sets every bit in `start..=end`.
    pub fn set_range(&self, start: usize, end: usize) {
        if start == end {
            self.set(start);
            return;
        }

        debug_assert!(start < end, "inverted bit range {start}..={end}");

        let start_index = start >> WORD_SHIFT;
        let start_mask = u64::MAX << (start & WORD_MASK);

        let end_index = end >> WORD_SHIFT;
        let end_mask = u64::MAX >> (WORD_MASK - (end & WORD_MASK));

        if start_index == end_index {
            self.words[start_index].fetch_or(start_mask & end_mask, Ordering::AcqRel);
            return;
        }

        self.words[start_index].fetch_or(start_mask, Ordering::AcqRel);

        for word in &self.words[start_index + 1..end_index] {
            word.store(u64::MAX, Ordering::Release);
        }

        self.words[end_index].fetch_or(end_mask, Ordering::AcqRel);
    }

    /// Clears `bit`, returning true if it was previously set.
    #[inline]
    pub fn clear(&self, bit: usize) -> bool {
        let mask = 1 << (bit & WORD_MASK);
        let old = self.words[bit >> WORD_SHIFT].fetch_and(!mask, Ordering::AcqRel);
        old & mask != 0
    }

    /// Zeroes whole words, `words` being word indices rather than bit indices.
    pub fn clear_words(&self, words: RangeInclusive<usize>) {
        for word in &self.words[words] {
            word.store(0, Ordering::Release);
        }
    }

    pub fn clear_all(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::Release);
        }
    }

    pub fn any_set(&self) -> bool {
        self.words.iter().any(|w| w.load(Ordering::Acquire) != 0)
    }

    #[inline]
    fn load(&self, index: usize) -> u64 {
        self.words[index].load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_reports_first_transition_only() {
        let bits = BitVector::new(8);

        assert!(bits.set(3));
        assert!(!bits.set(3));
        assert!(bits.is_set(3));
        assert!(!bits.is_set(2));
    }

    #[test]
    fn range_set_is_visible_only_inside_range() {
        let bits = BitVector::new(10_000);
        bits.set_range(130, 255);

        assert!(bits.is_range_set(130, 255));
        assert!(bits.is_range_set(200, 9999));
        assert!(!bits.is_range_set(0, 129));
        assert!(!bits.is_range_set(256, 9999));
        assert!(bits.is_set(130));
        assert!(bits.is_set(255));
        assert!(!bits.is_set(129));
        assert!(!bits.is_set(256));
    }

    #[test]
    fn range_inside_single_word() {
        let bits = BitVector::new(64);
        bits.set_range(10, 12);

        assert!(!bits.is_range_set(0, 9));
        assert!(bits.is_range_set(12, 63));
        assert!(!bits.is_range_set(13, 63));
    }

    #[test]
    fn range_spanning_exact_word_boundaries() {
        let bits = BitVector::new(256);
        bits.set_range(64, 191);

        assert!(!bits.is_range_set(0, 63));
        assert!(bits.is_range_set(63, 64));
        assert!(bits.is_range_set(191, 255));
        assert!(!bits.is_range_set(192, 255));
    }

    #[test]
    fn middle_word_scan_finds_isolated_bit() {
        let bits = BitVector::new(1024);
        bits.set(500);

        assert!(bits.is_range_set(3, 1000));
        assert!(!bits.is_range_set(3, 499));
        assert!(!bits.is_range_set(501, 1023));
    }

    #[test]
    fn clear_and_clear_words() {
        let bits = BitVector::new(256);
        bits.set_range(0, 255);

        assert!(bits.clear(5));
        assert!(!bits.clear(5));
        assert!(!bits.is_set(5));

        bits.clear_words(1..=2);
        assert!(!bits.is_range_set(64, 191));
        assert!(bits.is_range_set(0, 63));
        assert!(bits.is_set(192));

        bits.clear_all();
        assert!(!bits.any_set());
    }

    #[test]
    fn word_count_rounds_up() {
        assert_eq!(BitVector::new(0).word_count(), 0);
        assert_eq!(BitVector::new(1).word_count(), 1);
        assert_eq!(BitVector::new(64).word_count(), 1);
        assert_eq!(BitVector::new(65).word_count(), 2);
    }
}
