use std::{
    ops::Deref,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use tracing::warn;

use crate::{error::RhiError, rhi::device::RenderFenceDevice};

/// How waits on a single fence are issued.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum WaitDiscipline {
    /// Any number of threads may wait on the fence at once.
    #[default]
    Direct,
    /// Waits are serialized through a per-fence spinlock.
    Serialized,
}

impl WaitDiscipline {
    pub fn from_concurrent_wait_unsupported(unsupported: bool) -> Self {
        if unsupported {
            WaitDiscipline::Serialized
        } else {
            WaitDiscipline::Direct
        }
    }
}

/// Waits until all `fences` signal, retrying every `slice` and reporting each retry.
pub fn wait_all_indefinitely<D: RenderFenceDevice>(
    device: &D,
    fences: &[&D::Fence],
    slice: Duration,
) -> Result<(), RhiError> {
    let timeout = slice.as_nanos().min(u64::MAX as u128) as u64;

    while !device.wait_for_fences(fences, timeout)? {
        warn!(
            "Fence wait timed out after {} ms, retrying",
            slice.as_millis()
        );
    }

    Ok(())
}

pub fn all_signaled<D: RenderFenceDevice>(
    device: &D,
    fences: &[&D::Fence],
    timeout: Duration,
) -> Result<bool, RhiError> {
    device.wait_for_fences(fences, timeout.as_nanos().min(u64::MAX as u128) as u64)
}

/// Reference-counted owner of one native fence.
///
/// The native fence lives while the count is above zero. Waiters first take a
/// reference with [`try_get`](Self::try_get), so a fence is never destroyed
/// underneath a wait.
#[derive(Debug)]
pub struct FenceHolder<D: RenderFenceDevice> {
    device: Arc<D>,
    fence: RwLock<Option<D::Fence>>,
    reference_count: AtomicUsize,
    lock: AtomicBool,
    discipline: WaitDiscipline,
    wait_slice: Duration,
    disposed: AtomicBool,
}

impl<D: RenderFenceDevice> FenceHolder<D> {
    pub fn new(
        device: Arc<D>,
        discipline: WaitDiscipline,
        wait_slice: Duration,
    ) -> Result<Self, RhiError> {
        let fence = device.create_fence(false)?;

        Ok(Self::from_fence(device, fence, discipline, wait_slice))
    }

    pub fn from_fence(
        device: Arc<D>,
        fence: D::Fence,
        discipline: WaitDiscipline,
        wait_slice: Duration,
    ) -> Self {
        Self {
            device,
            fence: RwLock::new(Some(fence)),
            reference_count: AtomicUsize::new(1),
            lock: AtomicBool::new(false),
            discipline,
            wait_slice,
            disposed: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn discipline(&self) -> WaitDiscipline {
        self.discipline
    }

    #[inline]
    pub fn reference_count(&self) -> usize {
        self.reference_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.fence.read().is_none()
    }

    /// Takes another reference. The caller must already hold one.
    pub fn get(&self) {
        let old = self.reference_count.fetch_add(1, Ordering::AcqRel);
        assert!(old > 0, "fence referenced after destruction");
    }

    /// Takes a reference unless the fence is already being destroyed, and under
    /// [`WaitDiscipline::Serialized`] also takes the wait lock.
    pub fn try_get(&self) -> Option<FenceLease<'_, D>> {
        if !self.try_reference() {
            return None;
        }

        if self.discipline == WaitDiscipline::Serialized {
            self.acquire_lock();
        }

        Some(FenceLease::new(self))
    }

    /// Borrows the fence without taking a reference.
    ///
    /// Only valid for a caller that knows it holds a reference.
    pub fn get_unsafe(&self) -> Option<MappedRwLockReadGuard<'_, D::Fence>> {
        RwLockReadGuard::try_map(self.fence.read(), Option::as_ref).ok()
    }

    /// Drops one reference, destroying the native fence on the last one.
    pub fn put(&self) {
        let old = self.reference_count.fetch_sub(1, Ordering::AcqRel);
        assert!(old > 0, "fence reference count went negative");

        if old == 1 {
            self.destroy();
        }
    }

    /// Releases the wait lock taken by [`try_get`](Self::try_get), then the reference.
    pub fn put_lock(&self) {
        if self.discipline == WaitDiscipline::Serialized {
            self.release_lock();
        }

        self.put();
    }

    /// Blocks until the fence signals. A fence that is already gone has retired.
    pub fn wait(&self) -> Result<(), RhiError> {
        let Some(lease) = self.try_get() else {
            return Ok(());
        };

        wait_all_indefinitely(&*self.device, &[&*lease], self.wait_slice)
    }

    /// Polls the fence once.
    ///
    /// Under [`WaitDiscipline::Serialized`] a fence somebody else is waiting
    /// on reports unsignalled instead of blocking.
    pub fn is_signaled(&self) -> Result<bool, RhiError> {
        if !self.try_reference() {
            return Ok(true);
        }

        if self.discipline == WaitDiscipline::Serialized && !self.try_acquire_lock() {
            self.put();
            return Ok(false);
        }

        let lease = FenceLease::new(self);
        all_signaled(&*self.device, &[&*lease], Duration::ZERO)
    }

    /// Releases the creator's reference. Repeated calls do nothing.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.put();
        }
    }

    #[inline]
    pub(crate) fn device(&self) -> &D {
        &self.device
    }

    #[inline]
    pub(crate) fn wait_slice(&self) -> Duration {
        self.wait_slice
    }

    fn try_reference(&self) -> bool {
        self.reference_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count > 0).then_some(count + 1)
            })
            .is_ok()
    }

    fn try_acquire_lock(&self) -> bool {
        !self.lock.swap(true, Ordering::Acquire)
    }

    fn acquire_lock(&self) {
        while !self.try_acquire_lock() {
            for _ in 0..32 {
                std::hint::spin_loop();
            }
        }
    }

    fn release_lock(&self) {
        self.lock.store(false, Ordering::Release);
    }

    fn destroy(&self) {
        if let Some(fence) = self.fence.write().take() {
            self.device.destroy_fence(fence);
        }
    }
}

impl<D: RenderFenceDevice> Drop for FenceHolder<D> {
    fn drop(&mut self) {
        if let Some(fence) = self.fence.get_mut().take() {
            self.device.destroy_fence(fence);
        }
    }
}

/// A live reference to a fence, plus the wait lock when waits are serialized.
/// Dropping it calls [`FenceHolder::put_lock`].
pub struct FenceLease<'a, D: RenderFenceDevice> {
    holder: &'a FenceHolder<D>,
    fence: Option<MappedRwLockReadGuard<'a, D::Fence>>,
}

impl<'a, D: RenderFenceDevice> FenceLease<'a, D> {
    fn new(holder: &'a FenceHolder<D>) -> Self {
        let fence = RwLockReadGuard::map(holder.fence.read(), |fence| {
            fence
                .as_ref()
                .expect("referenced fence has been destroyed")
        });

        Self {
            holder,
            fence: Some(fence),
        }
    }

    #[inline]
    pub fn holder(&self) -> &'a FenceHolder<D> {
        self.holder
    }
}

impl<D: RenderFenceDevice> Deref for FenceLease<'_, D> {
    type Target = D::Fence;

    fn deref(&self) -> &Self::Target {
        self.fence.as_deref().expect("lease already released")
    }
}

impl<D: RenderFenceDevice> Drop for FenceLease<'_, D> {
    fn drop(&mut self) {
        drop(self.fence.take());
        self.holder.put_lock();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::rhi::soft::{SoftDevice, SoftDeviceDesc};

    fn holder(discipline: WaitDiscipline) -> (Arc<SoftDevice>, FenceHolder<SoftDevice>) {
        let device = Arc::new(SoftDevice::new(SoftDeviceDesc::default()));
        let holder =
            FenceHolder::new(Arc::clone(&device), discipline, Duration::from_millis(5)).unwrap();

        (device, holder)
    }

    #[test]
    fn last_put_destroys_native_fence() {
        let (device, holder) = holder(WaitDiscipline::Direct);

        holder.get();
        assert_eq!(holder.reference_count(), 2);

        holder.dispose();
        holder.dispose();
        assert_eq!(holder.reference_count(), 1);
        assert_eq!(device.live_fences(), 1);

        holder.put();
        assert!(holder.is_destroyed());
        assert_eq!(device.live_fences(), 0);
    }

    #[test]
    fn try_get_fails_once_destroyed() {
        let (_device, holder) = holder(WaitDiscipline::Serialized);

        {
            let lease = holder.try_get().unwrap();
            assert!(!lease.is_signaled());
            assert_eq!(holder.reference_count(), 2);
        }
        assert_eq!(holder.reference_count(), 1);

        holder.dispose();
        assert!(holder.try_get().is_none());
        assert!(holder.wait().is_ok());
        assert!(holder.is_signaled().unwrap());
    }

    #[test]
    fn lease_outlives_creator_reference() {
        let (device, holder) = holder(WaitDiscipline::Direct);

        let lease = holder.try_get().unwrap();
        holder.dispose();
        assert_eq!(device.live_fences(), 1);

        lease.signal();
        drop(lease);
        assert_eq!(device.live_fences(), 0);
    }

    #[test]
    fn is_signaled_polls() {
        let (_device, holder) = holder(WaitDiscipline::Serialized);

        assert!(!holder.is_signaled().unwrap());
        holder.get_unsafe().unwrap().signal();
        assert!(holder.is_signaled().unwrap());
        assert_eq!(holder.reference_count(), 1);
    }

    #[test]
    fn serialized_poll_reports_busy_while_another_thread_waits() {
        let (_device, holder) = holder(WaitDiscipline::Serialized);

        let lease = holder.try_get().unwrap();
        assert!(!holder.is_signaled().unwrap());

        lease.signal();
        drop(lease);
        assert!(holder.is_signaled().unwrap());
    }

    #[test]
    fn wait_retries_until_signalled() {
        let (_device, holder) = holder(WaitDiscipline::Direct);
        let fence = holder.get_unsafe().unwrap().clone();

        thread::scope(|s| {
            s.spawn(|| {
                thread::sleep(Duration::from_millis(30));
                fence.signal();
            });

            holder.wait().unwrap();
        });

        assert!(holder.is_signaled().unwrap());
    }

    #[test]
    fn serialized_waits_never_overlap() {
        let device = Arc::new(SoftDevice::new(
            SoftDeviceDesc::default().with_concurrent_wait_unsupported(true),
        ));
        let discipline =
            WaitDiscipline::from_concurrent_wait_unsupported(device.concurrent_wait_unsupported());
        let holder =
            FenceHolder::new(Arc::clone(&device), discipline, Duration::from_millis(1)).unwrap();
        let fence = holder.get_unsafe().unwrap().clone();

        thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| holder.wait().unwrap());
            }

            thread::sleep(Duration::from_millis(20));
            fence.signal();
        });

        assert_eq!(device.concurrent_wait_violations(), 0);
    }

    #[test]
    fn device_loss_is_propagated() {
        let (device, holder) = holder(WaitDiscipline::Direct);

        device.lose();
        assert_eq!(holder.wait(), Err(RhiError::DeviceLost));
        assert_eq!(holder.reference_count(), 1);
    }
}
