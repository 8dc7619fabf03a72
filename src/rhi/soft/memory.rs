use std::{
    alloc::{self, Layout},
    ptr::NonNull,
    sync::atomic::Ordering,
};

use crate::{
    error::RhiError,
    rhi::{
        device::RenderMemoryDevice,
        resources::{HostPtr, MemoryProperties, MemoryType},
    },
};

use super::device::SoftDevice;

const SOFT_MEMORY_ALIGNMENT: usize = 256;

#[derive(Debug)]
pub struct SoftMemory {
    ptr: HostPtr,
    layout: Layout,
    memory_type_index: u32,
}

impl SoftMemory {
    #[inline]
    pub fn size(&self) -> u64 {
        self.layout.size() as u64
    }

    #[inline]
    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }
}

impl Drop for SoftMemory {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl RenderMemoryDevice for SoftDevice {
    type Memory = SoftMemory;

    fn memory_types(&self) -> &[MemoryType] {
        &self.desc.memory_types
    }

    fn allocate_memory(&self, size: u64, memory_type_index: u32) -> Result<Self::Memory, RhiError> {
        if memory_type_index as usize >= self.desc.memory_types.len() {
            return Err(RhiError::InvalidMemoryType(memory_type_index));
        }

        if size == 0 {
            return Err(RhiError::OutOfDeviceMemory);
        }

        let previous = self
            .counters
            .allocated_bytes
            .fetch_add(size, Ordering::AcqRel);
        if self
            .desc
            .memory_budget
            .is_some_and(|budget| previous + size > budget)
        {
            self.counters
                .allocated_bytes
                .fetch_sub(size, Ordering::AcqRel);
            return Err(RhiError::OutOfDeviceMemory);
        }

        let layout = usize::try_from(size)
            .ok()
            .and_then(|size| Layout::from_size_align(size, SOFT_MEMORY_ALIGNMENT).ok());
        let ptr = layout.and_then(|layout| NonNull::new(unsafe { alloc::alloc_zeroed(layout) }));

        let (Some(layout), Some(ptr)) = (layout, ptr) else {
            self.counters
                .allocated_bytes
                .fetch_sub(size, Ordering::AcqRel);
            return Err(RhiError::OutOfHostMemory);
        };

        self.counters.live_allocations.fetch_add(1, Ordering::Relaxed);

        Ok(SoftMemory {
            ptr: HostPtr::new(ptr),
            layout,
            memory_type_index,
        })
    }

    fn map_memory(&self, memory: &Self::Memory, size: u64) -> Result<HostPtr, RhiError> {
        let properties = self.desc.memory_types[memory.memory_type_index as usize].properties;

        if !properties.contains(MemoryProperties::HostVisible)
            || size > memory.size()
        {
            return Err(RhiError::MemoryMapFailed);
        }

        Ok(memory.ptr)
    }

    fn free_memory(&self, memory: Self::Memory) {
        self.counters
            .allocated_bytes
            .fetch_sub(memory.size(), Ordering::AcqRel);
        self.counters.live_allocations.fetch_sub(1, Ordering::Relaxed);
    }
}
