use std::fmt::Debug;

use crate::error::RhiError;

use super::resources::{HostPtr, MemoryType};

pub trait RenderFenceDevice: Send + Sync + 'static {
    type Fence: Debug + Send + Sync + 'static;

    fn create_fence(&self, signaled: bool) -> Result<Self::Fence, RhiError>;
    fn destroy_fence(&self, fence: Self::Fence);

    /// Waits until every fence in `fences` is signalled.
    ///
    /// Returns `Ok(false)` when `timeout_ns` elapsed first. A zero timeout polls.
    fn wait_for_fences(&self, fences: &[&Self::Fence], timeout_ns: u64) -> Result<bool, RhiError>;

    /// Some drivers define waiting on one fence from several threads at once
    /// as undefined behaviour.
    fn concurrent_wait_unsupported(&self) -> bool;
}

pub trait RenderMemoryDevice: Send + Sync + 'static {
    type Memory: Debug + Send + Sync + 'static;

    fn memory_types(&self) -> &[MemoryType];

    fn allocate_memory(&self, size: u64, memory_type_index: u32) -> Result<Self::Memory, RhiError>;
    fn map_memory(&self, memory: &Self::Memory, size: u64) -> Result<HostPtr, RhiError>;

    /// Frees `memory`, implicitly unmapping it.
    fn free_memory(&self, memory: Self::Memory);
}
