use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use tracing::info;

use crate::rhi::resources::{MemoryProperties, MemoryType};

#[derive(Clone, Debug)]
pub struct SoftDeviceDesc {
    pub name: String,
    pub concurrent_wait_unsupported: bool,
    /// Total bytes the device will hand out before reporting out of memory.
    pub memory_budget: Option<u64>,
    pub memory_types: Vec<MemoryType>,
}

impl Default for SoftDeviceDesc {
    fn default() -> Self {
        Self {
            name: "soft".to_string(),
            concurrent_wait_unsupported: false,
            memory_budget: None,
            memory_types: vec![
                MemoryType {
                    properties: MemoryProperties::DeviceLocal,
                    heap_index: 0,
                },
                MemoryType {
                    properties: MemoryProperties::HostVisible | MemoryProperties::HostCoherent,
                    heap_index: 1,
                },
                MemoryType {
                    properties: MemoryProperties::DeviceLocal
                        | MemoryProperties::HostVisible
                        | MemoryProperties::HostCoherent,
                    heap_index: 0,
                },
                MemoryType {
                    properties: MemoryProperties::HostVisible
                        | MemoryProperties::HostCoherent
                        | MemoryProperties::HostCached,
                    heap_index: 1,
                },
            ],
        }
    }
}

impl SoftDeviceDesc {
    pub fn with_concurrent_wait_unsupported(mut self, value: bool) -> Self {
        self.concurrent_wait_unsupported = value;
        self
    }

    pub fn with_memory_budget(mut self, budget: u64) -> Self {
        self.memory_budget = Some(budget);
        self
    }
}

#[derive(Debug, Default)]
pub(super) struct SoftCounters {
    pub(super) live_fences: AtomicUsize,
    pub(super) live_allocations: AtomicUsize,
    pub(super) allocated_bytes: AtomicU64,
    pub(super) concurrent_wait_violations: AtomicUsize,
}

/// A device that runs entirely on the CPU. Fences are signalled by whoever
/// plays the GPU, memory comes from the host heap.
#[derive(Debug)]
pub struct SoftDevice {
    pub(super) desc: SoftDeviceDesc,
    pub(super) counters: SoftCounters,
    lost: AtomicBool,
}

impl SoftDevice {
    pub fn new(desc: SoftDeviceDesc) -> Self {
        info!(
            "Creating soft device {} with {} memory types",
            desc.name,
            desc.memory_types.len()
        );

        if desc.concurrent_wait_unsupported {
            info!("Concurrent fence waits are NOT supported");
        }

        Self {
            desc,
            counters: Default::default(),
            lost: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn desc(&self) -> &SoftDeviceDesc {
        &self.desc
    }

    pub fn live_fences(&self) -> usize {
        self.counters.live_fences.load(Ordering::Relaxed)
    }

    pub fn live_allocations(&self) -> usize {
        self.counters.live_allocations.load(Ordering::Relaxed)
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.counters.allocated_bytes.load(Ordering::Relaxed)
    }

    /// Number of times two threads were inside a wait on the same fence.
    pub fn concurrent_wait_violations(&self) -> usize {
        self.counters
            .concurrent_wait_violations
            .load(Ordering::Relaxed)
    }

    /// Makes every following wait fail with [`RhiError::DeviceLost`](crate::error::RhiError).
    pub fn lose(&self) {
        self.lost.store(true, Ordering::Release);
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }
}
