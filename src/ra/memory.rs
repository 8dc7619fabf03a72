use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::{
    error::{AllocationError, RhiError},
    rhi::{
        device::RenderMemoryDevice,
        resources::{HostPtr, MemoryLocation, MemoryRequirements},
    },
    settings::TrackerSettings,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FreeRange {
    offset: u64,
    size: u64,
}

impl FreeRange {
    #[inline]
    fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// One coarse native allocation, carved into sub-ranges.
///
/// Free ranges are sorted by offset, never overlap and are never adjacent.
pub struct MemoryBlock<D: RenderMemoryDevice> {
    device: Arc<D>,
    memory: Option<D::Memory>,
    host_ptr: Option<HostPtr>,
    size: u64,
    free_ranges: Mutex<Vec<FreeRange>>,
}

impl<D: RenderMemoryDevice> MemoryBlock<D> {
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.host_ptr.is_some()
    }

    #[inline]
    pub fn host_ptr(&self) -> Option<HostPtr> {
        self.host_ptr
    }

    pub fn memory(&self) -> &D::Memory {
        self.memory.as_ref().expect("block memory already freed")
    }

    fn free_bytes(&self) -> u64 {
        self.free_ranges.lock().iter().map(|r| r.size).sum()
    }

    /// First fit. Alignment padding and leftover stay free.
    fn try_carve(&self, size: u64, alignment: u64) -> Option<u64> {
        let mut ranges = self.free_ranges.lock();

        let (index, offset) = ranges.iter().enumerate().find_map(|(index, range)| {
            let offset = range.offset.next_multiple_of(alignment);
            let padding = offset - range.offset;

            (padding < range.size && range.size - padding >= size).then_some((index, offset))
        })?;

        let range = ranges.remove(index);
        let mut insert_at = index;

        if offset > range.offset {
            ranges.insert(
                insert_at,
                FreeRange {
                    offset: range.offset,
                    size: offset - range.offset,
                },
            );
            insert_at += 1;
        }

        if offset + size < range.end() {
            ranges.insert(
                insert_at,
                FreeRange {
                    offset: offset + size,
                    size: range.end() - (offset + size),
                },
            );
        }

        Some(offset)
    }

    /// Returns a range, merging it with its neighbours. Reports whether the
    /// block is now totally free.
    fn release(&self, offset: u64, size: u64) -> bool {
        let mut ranges = self.free_ranges.lock();
        let index = ranges.partition_point(|r| r.offset < offset);

        debug_assert!(
            index == 0 || ranges[index - 1].end() <= offset,
            "range {offset}+{size} freed twice"
        );

        let merge_left = index > 0 && ranges[index - 1].end() == offset;
        let merge_right = index < ranges.len() && ranges[index].offset == offset + size;

        match (merge_left, merge_right) {
            (true, true) => {
                let right = ranges.remove(index);
                ranges[index - 1].size += size + right.size;
            }
            (true, false) => ranges[index - 1].size += size,
            (false, true) => {
                ranges[index].offset = offset;
                ranges[index].size += size;
            }
            (false, false) => ranges.insert(index, FreeRange { offset, size }),
        }

        self.is_totally_free_locked(&ranges)
    }

    fn is_totally_free(&self) -> bool {
        self.is_totally_free_locked(&self.free_ranges.lock())
    }

    fn is_totally_free_locked(&self, ranges: &[FreeRange]) -> bool {
        matches!(ranges, [only] if only.offset == 0 && only.size == self.size)
    }
}

impl<D: RenderMemoryDevice> Drop for MemoryBlock<D> {
    fn drop(&mut self) {
        if let Some(memory) = self.memory.take() {
            self.device.free_memory(memory);
        }
    }
}

impl<D: RenderMemoryDevice> std::fmt::Debug for MemoryBlock<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("size", &self.size)
            .field("mapped", &self.is_mapped())
            .field("free_ranges", &self.free_ranges.lock().len())
            .finish()
    }
}

struct MemoryBlockListInner<D: RenderMemoryDevice> {
    device: Arc<D>,
    memory_type_index: u32,
    block_alignment: u64,
    block_granularity: u64,
    blocks: RwLock<Vec<Arc<MemoryBlock<D>>>>,
    allocated: AtomicU64,
}

/// All blocks of a single memory type, sorted by block size.
///
/// Scanning for space takes the list's read lock. Adding or removing a block
/// takes the write lock.
pub struct MemoryBlockList<D: RenderMemoryDevice>(Arc<MemoryBlockListInner<D>>);

impl<D: RenderMemoryDevice> Clone for MemoryBlockList<D> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<D: RenderMemoryDevice> MemoryBlockList<D> {
    pub fn new(
        device: Arc<D>,
        memory_type_index: u32,
        block_alignment: u64,
        block_granularity: u64,
    ) -> Self {
        assert!(block_alignment > 0, "block alignment must be non-zero");

        Self(Arc::new(MemoryBlockListInner {
            device,
            memory_type_index,
            block_alignment,
            block_granularity,
            blocks: RwLock::new(Vec::new()),
            allocated: AtomicU64::new(0),
        }))
    }

    #[inline]
    pub fn memory_type_index(&self) -> u32 {
        self.0.memory_type_index
    }

    pub fn allocate(
        &self,
        size: u64,
        alignment: u64,
        map: bool,
    ) -> Result<MemoryAllocation<D>, AllocationError> {
        if alignment == 0 || alignment > isize::MAX as u64 {
            return Err(AllocationError::InvalidAlignment(alignment));
        }

        if size == 0 {
            return Err(AllocationError::ZeroSize);
        }

        {
            let blocks = self.0.blocks.read();

            for block in blocks.iter().filter(|b| b.is_mapped() == map) {
                if let Some(offset) = block.try_carve(size, alignment) {
                    return Ok(self.allocation(Arc::clone(block), offset, size));
                }
            }
        }

        let block = self.create_block(size, map)?;
        let offset = block
            .try_carve(size, alignment)
            .expect("fresh block is large enough for the request");

        {
            let mut blocks = self.0.blocks.write();
            let index = blocks.partition_point(|b| b.size <= block.size);
            blocks.insert(index, Arc::clone(&block));
        }

        Ok(self.allocation(block, offset, size))
    }

    /// Returns `offset..offset + size` to `block`, releasing the block once
    /// nothing in it is allocated.
    pub(crate) fn free(&self, block: &Arc<MemoryBlock<D>>, offset: u64, size: u64) {
        self.0.allocated.fetch_sub(size, Ordering::AcqRel);

        if !block.release(offset, size) {
            return;
        }

        let mut blocks = self.0.blocks.write();

        // Somebody may have carved from it before the write lock was taken.
        if !block.is_totally_free() {
            return;
        }

        if let Some(index) = blocks.iter().position(|b| Arc::ptr_eq(b, block)) {
            let removed = blocks.remove(index);
            debug!(
                "Releasing {} byte block of memory type {}",
                removed.size, self.0.memory_type_index
            );
        }
    }

    pub fn block_count(&self) -> usize {
        self.0.blocks.read().len()
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.0.allocated.load(Ordering::Acquire)
    }

    pub fn free_bytes(&self) -> u64 {
        self.0.blocks.read().iter().map(|b| b.free_bytes()).sum()
    }

    pub fn total_block_bytes(&self) -> u64 {
        self.0.blocks.read().iter().map(|b| b.size).sum()
    }

    fn allocation(
        &self,
        block: Arc<MemoryBlock<D>>,
        offset: u64,
        size: u64,
    ) -> MemoryAllocation<D> {
        self.0.allocated.fetch_add(size, Ordering::AcqRel);

        MemoryAllocation {
            list: self.clone(),
            block,
            offset,
            size,
        }
    }

    fn create_block(
        &self,
        size: u64,
        map: bool,
    ) -> Result<Arc<MemoryBlock<D>>, AllocationError> {
        let inner = &self.0;
        let block_size = size
            .max(inner.block_granularity)
            .next_multiple_of(inner.block_alignment);

        let memory = inner
            .device
            .allocate_memory(block_size, inner.memory_type_index)?;

        let host_ptr = if map {
            match inner.device.map_memory(&memory, block_size) {
                Ok(ptr) => Some(ptr),
                Err(err) => {
                    inner.device.free_memory(memory);
                    return Err(err.into());
                }
            }
        } else {
            None
        };

        debug!(
            "Allocated {} byte block of memory type {}{}",
            block_size,
            inner.memory_type_index,
            if map { " (mapped)" } else { "" }
        );

        Ok(Arc::new(MemoryBlock {
            device: Arc::clone(&inner.device),
            memory: Some(memory),
            host_ptr,
            size: block_size,
            free_ranges: Mutex::new(vec![FreeRange {
                offset: 0,
                size: block_size,
            }]),
        }))
    }
}

/// A sub-range of a [`MemoryBlock`]. Returned to its block on drop.
pub struct MemoryAllocation<D: RenderMemoryDevice> {
    list: MemoryBlockList<D>,
    block: Arc<MemoryBlock<D>>,
    offset: u64,
    size: u64,
}

impl<D: RenderMemoryDevice> MemoryAllocation<D> {
    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn memory_type_index(&self) -> u32 {
        self.list.memory_type_index()
    }

    #[inline]
    pub fn block(&self) -> &Arc<MemoryBlock<D>> {
        &self.block
    }

    #[inline]
    pub fn memory(&self) -> &D::Memory {
        self.block.memory()
    }

    /// Host address of the first byte, for allocations made in mapped blocks.
    pub fn host_ptr(&self) -> Option<HostPtr> {
        self.block
            .host_ptr()
            .map(|ptr| unsafe { ptr.add(self.offset) })
    }

    pub fn free(self) {
        drop(self);
    }
}

impl<D: RenderMemoryDevice> Drop for MemoryAllocation<D> {
    fn drop(&mut self) {
        self.list.free(&self.block, self.offset, self.size);
    }
}

impl<D: RenderMemoryDevice> std::fmt::Debug for MemoryAllocation<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryAllocation")
            .field("memory_type_index", &self.memory_type_index())
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

/// Picks a memory type per request and forwards to that type's block list.
pub struct MemoryAllocator<D: RenderMemoryDevice> {
    device: Arc<D>,
    lists: Vec<MemoryBlockList<D>>,
}

impl<D: RenderMemoryDevice> MemoryAllocator<D> {
    pub fn new(device: Arc<D>, settings: &TrackerSettings) -> Self {
        let lists = (0..device.memory_types().len() as u32)
            .map(|index| {
                MemoryBlockList::new(
                    Arc::clone(&device),
                    index,
                    settings.block_alignment,
                    settings.block_granularity_for(index),
                )
            })
            .collect();

        Self { device, lists }
    }

    pub fn allocate(
        &self,
        requirements: MemoryRequirements,
        location: MemoryLocation,
    ) -> Result<MemoryAllocation<D>, AllocationError> {
        let candidates = self.memory_type_candidates(requirements.memory_type_bits, location);

        if candidates.is_empty() {
            return Err(AllocationError::NoCompatibleMemoryType {
                type_bits: requirements.memory_type_bits,
                location,
            });
        }

        let mut last_err = None;

        for index in candidates {
            match self.lists[index as usize].allocate(
                requirements.size,
                requirements.alignment,
                location.is_host_visible(),
            ) {
                Ok(allocation) => return Ok(allocation),
                Err(AllocationError::Device(RhiError::OutOfDeviceMemory)) => {
                    debug!("Memory type {} exhausted, trying the next one", index);
                    last_err = Some(AllocationError::Device(RhiError::OutOfDeviceMemory));
                }
                Err(err) => return Err(err),
            }
        }

        Err(last_err.expect("at least one candidate was tried"))
    }

    /// Memory types usable for `location`, preferred ones first.
    pub fn memory_type_candidates(&self, type_bits: u32, location: MemoryLocation) -> Vec<u32> {
        let required = location.required();
        let preferred = location.preferred();

        let (mut candidates, fallback): (Vec<_>, Vec<_>) = self
            .device
            .memory_types()
            .iter()
            .enumerate()
            .filter(|(index, ty)| {
                *index < 32 && type_bits & (1 << *index) != 0 && ty.properties.contains(required)
            })
            .partition(|(_, ty)| ty.properties.contains(preferred));

        candidates.extend(fallback);
        candidates.into_iter().map(|(index, _)| index as u32).collect()
    }

    pub fn block_list(&self, memory_type_index: u32) -> Option<&MemoryBlockList<D>> {
        self.lists.get(memory_type_index as usize)
    }

    pub fn block_count(&self) -> usize {
        self.lists.iter().map(MemoryBlockList::block_count).sum()
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.lists.iter().map(MemoryBlockList::allocated_bytes).sum()
    }

    pub fn free_bytes(&self) -> u64 {
        self.lists.iter().map(MemoryBlockList::free_bytes).sum()
    }

    pub fn total_block_bytes(&self) -> u64 {
        self.lists.iter().map(MemoryBlockList::total_block_bytes).sum()
    }
}
