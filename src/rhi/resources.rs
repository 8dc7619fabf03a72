use std::ptr::NonNull;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    CpuToGpu,
    GpuToGpu,
    GpuToCpu,
}

impl MemoryLocation {
    #[inline]
    pub fn is_host_visible(&self) -> bool {
        !matches!(self, MemoryLocation::GpuToGpu)
    }

    pub(crate) fn required(&self) -> MemoryProperties {
        match self {
            MemoryLocation::CpuToGpu => {
                MemoryProperties::HostVisible | MemoryProperties::HostCoherent
            }
            MemoryLocation::GpuToGpu => MemoryProperties::empty(),
            MemoryLocation::GpuToCpu => MemoryProperties::HostVisible,
        }
    }

    pub(crate) fn preferred(&self) -> MemoryProperties {
        match self {
            MemoryLocation::CpuToGpu => MemoryProperties::DeviceLocal,
            MemoryLocation::GpuToGpu => MemoryProperties::DeviceLocal,
            MemoryLocation::GpuToCpu => MemoryProperties::HostCached,
        }
    }
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
    pub struct MemoryProperties: u32 {
        const DeviceLocal = 1 << 0;
        const HostVisible = 1 << 1;
        const HostCoherent = 1 << 2;
        const HostCached = 1 << 3;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemoryType {
    pub properties: MemoryProperties,
    pub heap_index: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MemoryRequirements {
    pub size: u64,
    pub alignment: u64,
    pub memory_type_bits: u32,
}

impl MemoryRequirements {
    pub fn new(size: u64, alignment: u64) -> Self {
        Self {
            size,
            alignment,
            memory_type_bits: u32::MAX,
        }
    }

    pub fn with_memory_type_bits(mut self, bits: u32) -> Self {
        self.memory_type_bits = bits;
        self
    }
}

/// Host address of mapped device memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostPtr(NonNull<u8>);

// A mapping stays valid until the memory is freed, and access through it is
// governed by the fences guarding the range, not by the thread holding it.
unsafe impl Send for HostPtr {}
unsafe impl Sync for HostPtr {}

impl HostPtr {
    pub fn new(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// # Safety
    ///
    /// `offset` must stay within the mapped range.
    #[inline]
    pub unsafe fn add(&self, offset: u64) -> Self {
        unsafe { Self(self.0.add(offset as usize)) }
    }
}
