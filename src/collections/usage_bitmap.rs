use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

use super::bit_vector::BitVector;

/// Per-slot, per-chunk record of which byte ranges of a buffer each in-flight
/// submission slot read or wrote.
///
/// Every slot owns an identically sized, word-aligned region of the backing
/// [`BitVector`]. The first half of a region is the read plane, the second the
/// write plane. Writes mark both planes, so the read plane answers "touched at all".
#[derive(Debug)]
pub struct BufferUsageBitmap {
    bits: BitVector,
    size: u64,
    granularity: u64,
    slot_count: usize,
    write_bit_offset: usize,
    words_per_slot: usize,
    bits_per_slot: usize,
    clamped: AtomicU64,
}

impl BufferUsageBitmap {
    pub fn new(size: u64, granularity: u64, slot_count: usize) -> Self {
        assert!(granularity > 0, "usage granularity must be non-zero");

        let chunks = size.div_ceil(granularity) as usize;
        let words_per_slot = (chunks * 2).div_ceil(BitVector::WORD_BITS);
        let bits_per_slot = words_per_slot * BitVector::WORD_BITS;

        Self {
            bits: BitVector::new(bits_per_slot * slot_count),
            size,
            granularity,
            slot_count,
            write_bit_offset: chunks,
            words_per_slot,
            bits_per_slot,
            clamped: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn granularity(&self) -> u64 {
        self.granularity
    }

    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    /// Number of uses that reached past the end of the buffer and were cut short.
    pub fn clamped_ranges(&self) -> u64 {
        self.clamped.load(Ordering::Relaxed)
    }

    pub fn add(&self, slot: usize, offset: u64, size: u64, write: bool) {
        // Some drivers fetch vertex data past the bound range.
        let Some((start, end)) = self.chunk_range(slot, offset, size, true) else {
            return;
        };

        self.bits.set_range(start, end);

        if write {
            self.bits
                .set_range(start + self.write_bit_offset, end + self.write_bit_offset);
        }
    }

    pub fn overlaps_with(&self, slot: usize, offset: u64, size: u64, write: bool) -> bool {
        let Some((start, end)) = self.chunk_range(slot, offset, size, false) else {
            return false;
        };

        let plane = if write { self.write_bit_offset } else { 0 };

        self.bits.is_range_set(start + plane, end + plane)
    }

    pub fn overlaps_with_any(&self, offset: u64, size: u64, write: bool) -> bool {
        (0..self.slot_count).any(|slot| self.overlaps_with(slot, offset, size, write))
    }

    /// Forgets everything `slot` recorded.
    pub fn clear(&self, slot: usize) {
        if self.words_per_slot == 0 {
            return;
        }

        let first = slot * self.words_per_slot;
        self.bits.clear_words(first..=first + self.words_per_slot - 1);
    }

    pub fn any_set(&self) -> bool {
        self.bits.any_set()
    }

    fn chunk_range(
        &self,
        slot: usize,
        offset: u64,
        size: u64,
        count_clamp: bool,
    ) -> Option<(usize, usize)> {
        assert!(slot < self.slot_count, "slot {slot} out of range");

        if size == 0 || offset >= self.size {
            return None;
        }

        let size = if offset.saturating_add(size) > self.size {
            if count_clamp {
                self.clamped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Clamping usage {}..{} to buffer size {}",
                    offset,
                    offset.saturating_add(size),
                    self.size
                );
            }

            self.size - offset
        } else {
            size
        };

        let base = slot * self.bits_per_slot;
        let start = base + (offset / self.granularity) as usize;
        let end = base + ((offset + size - 1) / self.granularity) as usize;

        Some((start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_bounds_use_is_clamped_to_last_chunk() {
        let usage = BufferUsageBitmap::new(4096, 256, 4);
        usage.add(0, 4000, 200, false);

        assert!(usage.overlaps_with(0, 4050, 10, false));
        assert!(!usage.overlaps_with(1, 4050, 10, false));
        assert_eq!(usage.clamped_ranges(), 1);

        // Nothing spilled into slot 1's region.
        assert!(!usage.overlaps_with(1, 0, 4096, false));
    }

    #[test]
    fn write_plane_is_subset_of_read_plane() {
        let usage = BufferUsageBitmap::new(4096, 256, 2);
        usage.add(1, 0, 512, true);
        usage.add(1, 1024, 256, false);

        assert!(usage.overlaps_with(1, 100, 1, false));
        assert!(usage.overlaps_with(1, 100, 1, true));

        assert!(usage.overlaps_with(1, 1024, 1, false));
        assert!(!usage.overlaps_with(1, 1024, 1, true));

        assert!(!usage.overlaps_with(1, 512, 512, false));
    }

    #[test]
    fn any_slot_query() {
        let usage = BufferUsageBitmap::new(1 << 20, 4096, 8);
        usage.add(6, 65536, 4096, false);

        assert!(usage.overlaps_with_any(65536, 1, false));
        assert!(!usage.overlaps_with_any(65536, 1, true));
        assert!(!usage.overlaps_with_any(0, 65536, false));
    }

    #[test]
    fn clearing_a_slot_leaves_others() {
        let usage = BufferUsageBitmap::new(8192, 64, 3);
        usage.add(0, 0, 8192, true);
        usage.add(1, 0, 8192, true);
        usage.add(2, 0, 8192, true);

        usage.clear(1);

        assert!(usage.overlaps_with(0, 8191, 1, true));
        assert!(!usage.overlaps_with(1, 0, 8192, false));
        assert!(usage.overlaps_with(2, 0, 1, true));
    }

    #[test]
    fn empty_and_past_end_ranges_are_ignored() {
        let usage = BufferUsageBitmap::new(1024, 256, 1);
        usage.add(0, 0, 0, true);
        usage.add(0, 1024, 16, true);

        assert!(!usage.any_set());
        assert!(!usage.overlaps_with(0, 0, 0, false));
        assert_eq!(usage.clamped_ranges(), 0);
    }
}
