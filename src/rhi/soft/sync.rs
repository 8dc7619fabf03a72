use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{error::RhiError, rhi::device::RenderFenceDevice};

use super::device::SoftDevice;

/// CPU-side stand-in for a GPU fence. Clones share the same signal.
#[derive(Clone, Debug)]
pub struct SoftFence {
    inner: Arc<SoftFenceInner>,
}

#[derive(Debug)]
struct SoftFenceInner {
    signaled: Mutex<bool>,
    cond: Condvar,
    waiters: AtomicUsize,
    destroyed: AtomicBool,
}

impl SoftFence {
    fn new(signaled: bool) -> Self {
        Self {
            inner: Arc::new(SoftFenceInner {
                signaled: Mutex::new(signaled),
                cond: Condvar::new(),
                waiters: AtomicUsize::new(0),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /// Marks the fence complete, as the GPU would when the submission retires.
    pub fn signal(&self) {
        *self.inner.signaled.lock() = true;
        self.inner.cond.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        *self.inner.signaled.lock()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    fn wait_until(&self, deadline: Option<Instant>) -> bool {
        let mut signaled = self.inner.signaled.lock();

        while !*signaled {
            match deadline {
                Some(deadline) => {
                    if self.inner.cond.wait_until(&mut signaled, deadline).timed_out() {
                        return *signaled;
                    }
                }
                None => self.inner.cond.wait(&mut signaled),
            }
        }

        true
    }
}

impl RenderFenceDevice for SoftDevice {
    type Fence = SoftFence;

    fn create_fence(&self, signaled: bool) -> Result<Self::Fence, RhiError> {
        self.counters.live_fences.fetch_add(1, Ordering::Relaxed);
        Ok(SoftFence::new(signaled))
    }

    fn destroy_fence(&self, fence: Self::Fence) {
        let was_destroyed = fence.inner.destroyed.swap(true, Ordering::AcqRel);
        assert!(!was_destroyed, "fence destroyed twice");

        self.counters.live_fences.fetch_sub(1, Ordering::Relaxed);
    }

    fn wait_for_fences(&self, fences: &[&Self::Fence], timeout_ns: u64) -> Result<bool, RhiError> {
        if self.is_lost() {
            return Err(RhiError::DeviceLost);
        }

        for fence in fences {
            assert!(!fence.is_destroyed(), "wait on a destroyed fence");

            if fence.inner.waiters.fetch_add(1, Ordering::AcqRel) > 0 {
                self.counters
                    .concurrent_wait_violations
                    .fetch_add(1, Ordering::Relaxed);
            }
        }

        let deadline = Instant::now().checked_add(Duration::from_nanos(timeout_ns));
        let signaled = fences.iter().all(|fence| {
            if timeout_ns == 0 {
                fence.is_signaled()
            } else {
                fence.wait_until(deadline)
            }
        });

        for fence in fences {
            fence.inner.waiters.fetch_sub(1, Ordering::AcqRel);
        }

        Ok(signaled)
    }

    fn concurrent_wait_unsupported(&self) -> bool {
        self.desc.concurrent_wait_unsupported
    }
}
