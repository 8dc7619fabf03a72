use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::{
    collections::usage_bitmap::BufferUsageBitmap, error::RhiError,
    rhi::device::RenderFenceDevice,
};

use super::fence::{FenceHolder, FenceLease, all_signaled, wait_all_indefinitely};

type FenceList<D> = SmallVec<[Arc<FenceHolder<D>>; 8]>;

/// The fences of every submission slot that may still touch one resource,
/// plus (for buffers) which byte ranges each slot used.
#[derive(Debug)]
pub struct MultiFenceHolder<D: RenderFenceDevice> {
    fences: Mutex<Vec<Option<Arc<FenceHolder<D>>>>>,
    usage: Option<BufferUsageBitmap>,
}

impl<D: RenderFenceDevice> MultiFenceHolder<D> {
    pub fn new(slot_count: usize) -> Self {
        Self {
            fences: Mutex::new(vec![None; slot_count]),
            usage: None,
        }
    }

    /// A holder that also tracks per-slot byte-range usage of a `size`-byte buffer.
    pub fn with_usage(slot_count: usize, size: u64, granularity: u64) -> Self {
        Self {
            fences: Mutex::new(vec![None; slot_count]),
            usage: Some(BufferUsageBitmap::new(size, granularity, slot_count)),
        }
    }

    #[inline]
    pub fn slot_count(&self) -> usize {
        self.fences.lock().len()
    }

    #[inline]
    pub fn usage(&self) -> Option<&BufferUsageBitmap> {
        self.usage.as_ref()
    }

    /// Stores `fence` for `slot` if the slot has none yet, returning whether it did.
    pub fn add_fence(&self, slot: usize, fence: &Arc<FenceHolder<D>>) -> bool {
        let mut fences = self.fences.lock();
        let entry = &mut fences[slot];

        if entry.is_some() {
            return false;
        }

        *entry = Some(Arc::clone(fence));
        true
    }

    pub fn remove_fence(&self, slot: usize) {
        self.fences.lock()[slot] = None;
    }

    pub fn has_fence(&self, slot: usize) -> bool {
        self.fences.lock()[slot].is_some()
    }

    pub fn add_buffer_use(&self, slot: usize, offset: u64, size: u64, write: bool) {
        if let Some(usage) = &self.usage {
            usage.add(slot, offset, size, write);
        }
    }

    pub fn remove_buffer_uses(&self, slot: usize) {
        if let Some(usage) = &self.usage {
            usage.clear(slot);
        }
    }

    /// Whether `slot` (or any slot, for `None`) used the range with the given access.
    ///
    /// Without usage tracking, any attached fence counts as using every range.
    pub fn is_range_in_use(&self, slot: Option<usize>, offset: u64, size: u64, write: bool) -> bool {
        match (&self.usage, slot) {
            (Some(usage), Some(slot)) => usage.overlaps_with(slot, offset, size, write),
            (Some(usage), None) => usage.overlaps_with_any(offset, size, write),
            (None, Some(slot)) => self.has_fence(slot),
            (None, None) => self.fences.lock().iter().any(Option::is_some),
        }
    }

    /// Blocks until every attached fence signals.
    pub fn wait_for_fences(&self) -> Result<bool, RhiError> {
        self.wait_impl(None, None)
    }

    /// Waits at most `timeout`, returning whether everything signalled.
    pub fn wait_for_fences_timeout(&self, timeout: Duration) -> Result<bool, RhiError> {
        self.wait_impl(None, Some(timeout))
    }

    /// Blocks until every slot that used `offset..offset + size` has signalled.
    pub fn wait_for_range(&self, offset: u64, size: u64) -> Result<bool, RhiError> {
        self.wait_impl(Some((offset, size)), None)
    }

    pub fn wait_for_range_timeout(
        &self,
        offset: u64,
        size: u64,
        timeout: Duration,
    ) -> Result<bool, RhiError> {
        self.wait_impl(Some((offset, size)), Some(timeout))
    }

    fn gather(&self, range: Option<(u64, u64)>) -> FenceList<D> {
        self.fences
            .lock()
            .iter()
            .enumerate()
            .filter_map(|(slot, fence)| {
                let fence = fence.as_ref()?;

                match (range, &self.usage) {
                    (Some((offset, size)), Some(usage))
                        if !usage.overlaps_with(slot, offset, size, false) =>
                    {
                        None
                    }
                    _ => Some(Arc::clone(fence)),
                }
            })
            .collect()
    }

    fn wait_impl(
        &self,
        range: Option<(u64, u64)>,
        timeout: Option<Duration>,
    ) -> Result<bool, RhiError> {
        let holders = self.gather(range);

        // Fences that cannot be referenced any more have already retired.
        let leases = holders
            .iter()
            .filter_map(|holder| holder.try_get())
            .collect::<SmallVec<[FenceLease<'_, D>; 8]>>();

        let Some(first) = leases.first() else {
            return Ok(true);
        };

        let device = first.holder().device();
        let slice = first.holder().wait_slice();
        let fences = leases.iter().map(|l| &**l).collect::<SmallVec<[_; 8]>>();

        match timeout {
            Some(timeout) => all_signaled(device, &fences, timeout),
            None => wait_all_indefinitely(device, &fences, slice).map(|_| true),
        }
    }
}
