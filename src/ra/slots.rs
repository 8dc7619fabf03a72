use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    error::{LifetimeError, RhiError},
    rhi::device::RenderFenceDevice,
    settings::TrackerSettings,
};

use super::{
    fence::{FenceHolder, WaitDiscipline},
    multi_fence::MultiFenceHolder,
    tracked::SlotDependant,
};

/// The submission slot a resource is being referenced from.
pub trait SlotScope<D: RenderFenceDevice> {
    fn slot(&self) -> usize;

    /// Keeps `dependant` alive until the slot retires. Takes a strong
    /// reference, which fails if the dependant is already destroyed.
    fn add_dependant(&self, dependant: Arc<dyn SlotDependant<D>>) -> Result<(), LifetimeError>;

    /// Attaches the slot's fence to `waitable` until the slot retires.
    fn add_waitable(&self, waitable: &Arc<MultiFenceHolder<D>>);
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SlotState {
    #[default]
    Idle,
    Recording,
    Submitted,
    /// Teardown is running. The slot cannot be reused until it is idle again.
    Retiring,
}

struct SlotEntry<D: RenderFenceDevice> {
    state: SlotState,
    fence: Option<Arc<FenceHolder<D>>>,
    dependants: Vec<Arc<dyn SlotDependant<D>>>,
    waitables: Vec<Arc<MultiFenceHolder<D>>>,
}

impl<D: RenderFenceDevice> Default for SlotEntry<D> {
    fn default() -> Self {
        Self {
            state: SlotState::Idle,
            fence: None,
            dependants: Vec::new(),
            waitables: Vec::new(),
        }
    }
}

/// A fixed ring of submission slots, each with its own fence and the list of
/// resources it keeps alive.
pub struct SlotPool<D: RenderFenceDevice> {
    device: Arc<D>,
    discipline: WaitDiscipline,
    wait_slice: Duration,
    slots: Box<[Mutex<SlotEntry<D>>]>,
}

impl<D: RenderFenceDevice> SlotPool<D> {
    pub fn new(device: Arc<D>, settings: &TrackerSettings) -> Self {
        let discipline = WaitDiscipline::from_concurrent_wait_unsupported(
            settings
                .concurrent_wait_unsupported
                .unwrap_or_else(|| device.concurrent_wait_unsupported()),
        );

        debug!(
            "Creating slot pool with {} slots and {:?} fence waits",
            settings.slot_count, discipline
        );

        Self {
            device,
            discipline,
            wait_slice: settings.fence_timeout,
            slots: (0..settings.slot_count)
                .map(|_| Mutex::new(SlotEntry::default()))
                .collect(),
        }
    }

    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn discipline(&self) -> WaitDiscipline {
        self.discipline
    }

    pub fn state(&self, slot: usize) -> SlotState {
        self.slots[slot].lock().state
    }

    /// The fence of a recording or submitted slot.
    pub fn fence(&self, slot: usize) -> Option<Arc<FenceHolder<D>>> {
        self.slots[slot].lock().fence.clone()
    }

    /// Starts recording into an idle slot with a fresh fence.
    ///
    /// # Panics
    ///
    /// If the slot is not idle.
    pub fn begin(&self, slot: usize) -> Result<PoolScope<'_, D>, RhiError> {
        match self.try_begin(slot)? {
            Some(scope) => Ok(scope),
            None => panic!("slot {slot} is still in flight"),
        }
    }

    /// [`begin`](Self::begin) that returns `None` while the slot is busy.
    pub fn try_begin(&self, slot: usize) -> Result<Option<PoolScope<'_, D>>, RhiError> {
        let mut entry = self.slots[slot].lock();
        if entry.state != SlotState::Idle {
            return Ok(None);
        }

        let fence = FenceHolder::new(Arc::clone(&self.device), self.discipline, self.wait_slice)?;
        entry.fence = Some(Arc::new(fence));
        entry.state = SlotState::Recording;

        Ok(Some(PoolScope { pool: self, slot }))
    }

    pub fn scope(&self, slot: usize) -> PoolScope<'_, D> {
        assert_eq!(
            self.state(slot),
            SlotState::Recording,
            "slot {slot} is not recording"
        );

        PoolScope { pool: self, slot }
    }

    /// Hands the slot to the GPU. The returned fence signals when its work is done.
    pub fn submit(&self, slot: usize) -> Arc<FenceHolder<D>> {
        let mut entry = self.slots[slot].lock();
        assert_eq!(
            entry.state,
            SlotState::Recording,
            "slot {slot} is not recording"
        );

        entry.state = SlotState::Submitted;
        entry
            .fence
            .clone()
            .expect("recording slot always has a fence")
    }

    /// Waits for the slot's work and releases everything it kept alive.
    ///
    /// A slot that is idle, or that another thread is already retiring, is
    /// left alone.
    ///
    /// # Panics
    ///
    /// If the slot is still recording.
    pub fn retire(&self, slot: usize) -> Result<(), RhiError> {
        let fence = {
            let entry = self.slots[slot].lock();
            assert_ne!(
                entry.state,
                SlotState::Recording,
                "slot {slot} retired without being submitted"
            );

            if entry.state != SlotState::Submitted {
                return Ok(());
            }

            entry
                .fence
                .clone()
                .expect("submitted slot always has a fence")
        };

        fence.wait()?;
        self.release(slot, &fence);

        Ok(())
    }

    /// Retires the slot only if its fence has already signalled. Returns
    /// whether this call released it.
    pub fn try_retire(&self, slot: usize) -> Result<bool, RhiError> {
        let fence = {
            let entry = self.slots[slot].lock();
            if entry.state != SlotState::Submitted {
                return Ok(false);
            }

            entry
                .fence
                .clone()
                .expect("submitted slot always has a fence")
        };

        if !fence.is_signaled()? {
            return Ok(false);
        }

        Ok(self.release(slot, &fence))
    }

    pub fn retire_all(&self) -> Result<(), RhiError> {
        for slot in 0..self.slots.len() {
            if self.state(slot) == SlotState::Submitted {
                self.retire(slot)?;
            }
        }

        Ok(())
    }

    /// Tears down the submission `fence` belongs to, unless another caller
    /// already did. The slot stays non-idle until teardown is complete.
    fn release(&self, slot: usize, fence: &Arc<FenceHolder<D>>) -> bool {
        let (fence, dependants, waitables) = {
            let mut entry = self.slots[slot].lock();

            let current = entry.fence.as_ref().is_some_and(|f| Arc::ptr_eq(f, fence));
            if entry.state != SlotState::Submitted || !current {
                return false;
            }

            entry.state = SlotState::Retiring;

            (
                entry.fence.take(),
                std::mem::take(&mut entry.dependants),
                std::mem::take(&mut entry.waitables),
            )
        };

        for waitable in &waitables {
            waitable.remove_fence(slot);
            waitable.remove_buffer_uses(slot);
        }

        for dependant in &dependants {
            dependant.decrement_slot_reference(slot);
        }

        if let Some(fence) = fence {
            fence.dispose();
        }

        self.slots[slot].lock().state = SlotState::Idle;

        debug!(
            "Retired slot {} ({} dependants, {} waitables)",
            slot,
            dependants.len(),
            waitables.len()
        );

        true
    }
}

/// [`SlotScope`] handed out by a [`SlotPool`] for one recording slot.
pub struct PoolScope<'a, D: RenderFenceDevice> {
    pool: &'a SlotPool<D>,
    slot: usize,
}

impl<D: RenderFenceDevice> SlotScope<D> for PoolScope<'_, D> {
    #[inline]
    fn slot(&self) -> usize {
        self.slot
    }

    fn add_dependant(&self, dependant: Arc<dyn SlotDependant<D>>) -> Result<(), LifetimeError> {
        dependant.increment_reference_count()?;
        self.pool.slots[self.slot].lock().dependants.push(dependant);

        Ok(())
    }

    fn add_waitable(&self, waitable: &Arc<MultiFenceHolder<D>>) {
        let mut entry = self.pool.slots[self.slot].lock();
        let Some(fence) = entry.fence.clone() else {
            return;
        };

        if waitable.add_fence(self.slot, &fence) {
            entry.waitables.push(Arc::clone(waitable));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Weak,
            atomic::{AtomicBool, Ordering},
        },
        thread,
    };

    use super::*;
    use crate::{
        ra::tracked::TrackedResource,
        rhi::soft::{SoftDevice, SoftDeviceDesc},
    };

    fn pool(slots: usize) -> (Arc<SoftDevice>, SlotPool<SoftDevice>) {
        let device = Arc::new(SoftDevice::new(SoftDeviceDesc::default()));
        let settings = TrackerSettings {
            slot_count: slots,
            fence_timeout: Duration::from_millis(5),
            ..Default::default()
        };

        let pool = SlotPool::new(Arc::clone(&device), &settings);
        (device, pool)
    }

    #[test]
    fn slot_lifecycle() {
        let (device, pool) = pool(2);

        assert_eq!(pool.state(0), SlotState::Idle);
        pool.begin(0).unwrap();
        assert_eq!(pool.state(0), SlotState::Recording);
        assert_eq!(device.live_fences(), 1);

        let fence = pool.submit(0);
        assert!(!pool.try_retire(0).unwrap());

        fence.get_unsafe().unwrap().signal();
        assert!(pool.try_retire(0).unwrap());
        assert_eq!(pool.state(0), SlotState::Idle);
        assert_eq!(device.live_fences(), 0);
    }

    #[test]
    fn waitables_lose_the_fence_on_retire() {
        let (_device, pool) = pool(2);
        let waitable = Arc::new(MultiFenceHolder::with_usage(2, 1024, 64));

        let scope = pool.begin(1).unwrap();
        scope.add_waitable(&waitable);
        scope.add_waitable(&waitable);
        waitable.add_buffer_use(1, 0, 64, true);
        assert!(waitable.has_fence(1));

        pool.submit(1).get_unsafe().unwrap().signal();
        pool.retire(1).unwrap();

        assert!(!waitable.has_fence(1));
        assert!(!waitable.is_range_in_use(Some(1), 0, 64, false));
    }

    #[test]
    fn slot_count_follows_settings() {
        let (_device, pool) = pool(3);

        assert_eq!(pool.slot_count(), 3);
        assert_eq!(pool.discipline(), WaitDiscipline::Direct);
    }

    #[test]
    fn settings_override_device_wait_capability() {
        let device = Arc::new(SoftDevice::new(SoftDeviceDesc::default()));
        let settings = TrackerSettings {
            concurrent_wait_unsupported: Some(true),
            ..Default::default()
        };

        let pool = SlotPool::new(device, &settings);
        assert_eq!(pool.discipline(), WaitDiscipline::Serialized);
    }

    #[test]
    #[should_panic(expected = "retired without being submitted")]
    fn retiring_a_recording_slot_is_a_bug() {
        let (_device, pool) = pool(1);
        pool.begin(0).unwrap();
        let _ = pool.retire(0);
    }

    #[test]
    fn retiring_an_idle_slot_does_nothing() {
        let (_device, pool) = pool(1);

        pool.retire(0).unwrap();
        assert!(!pool.try_retire(0).unwrap());
        assert_eq!(pool.state(0), SlotState::Idle);
    }

    /// Looks at the pool from inside the slot's teardown.
    struct TeardownObserver {
        pool: Weak<SlotPool<SoftDevice>>,
        seen: Mutex<Option<(SlotState, bool, bool)>>,
        waitable: Arc<MultiFenceHolder<SoftDevice>>,
    }

    impl SlotDependant<SoftDevice> for TeardownObserver {
        fn add_slot_dependencies(
            self: Arc<Self>,
            scope: &dyn SlotScope<SoftDevice>,
        ) -> Result<(), LifetimeError> {
            scope.add_dependant(self)
        }

        fn increment_reference_count(&self) -> Result<(), LifetimeError> {
            Ok(())
        }

        fn decrement_reference_count(&self) {}

        fn decrement_slot_reference(&self, slot: usize) {
            let pool = self.pool.upgrade().unwrap();
            let reused = pool.try_begin(slot).unwrap().is_some();

            *self.seen.lock() = Some((pool.state(slot), reused, self.waitable.has_fence(slot)));
        }
    }

    #[test]
    fn slot_stays_busy_until_teardown_finishes() {
        let device = Arc::new(SoftDevice::new(SoftDeviceDesc::default()));
        let pool = Arc::new(SlotPool::new(device, &TrackerSettings::default()));
        let waitable = Arc::new(MultiFenceHolder::with_usage(pool.slot_count(), 256, 64));
        let observer = Arc::new(TeardownObserver {
            pool: Arc::downgrade(&pool),
            seen: Mutex::new(None),
            waitable: Arc::clone(&waitable),
        });

        let scope = pool.begin(0).unwrap();
        scope.add_waitable(&waitable);
        Arc::clone(&observer).add_slot_dependencies(&scope).unwrap();

        pool.submit(0).get_unsafe().unwrap().signal();
        pool.retire(0).unwrap();

        // Waitables are detached before dependants are released.
        assert_eq!(*observer.seen.lock(), Some((SlotState::Retiring, false, false)));
        assert_eq!(pool.state(0), SlotState::Idle);
        assert!(pool.try_begin(0).unwrap().is_some());
    }

    #[test]
    fn racing_retirers_release_once() {
        let (device, pool) = pool(1);

        for _ in 0..50 {
            let scope = pool.begin(0).unwrap();
            let resource = Arc::new(TrackedResource::<u32, SoftDevice>::new(7, 1));
            drop(resource.get(&scope));
            resource.dispose();

            pool.submit(0).get_unsafe().unwrap().signal();

            let released = thread::scope(|s| {
                let retirer = s.spawn(|| {
                    pool.retire(0).unwrap();
                });
                let pollers = (0..3)
                    .map(|_| s.spawn(|| pool.try_retire(0).unwrap()))
                    .collect::<Vec<_>>();

                retirer.join().unwrap();
                pollers
                    .into_iter()
                    .map(|p| p.join().unwrap() as usize)
                    .sum::<usize>()
            });

            assert!(released <= 1);
            assert!(resource.is_destroyed());
            assert_eq!(resource.reference_count(), 0);
            assert_eq!(pool.state(0), SlotState::Idle);
        }

        assert_eq!(device.live_fences(), 0);
    }

    #[test]
    fn reused_slots_never_release_a_registered_resource_early() {
        const SLOTS: usize = 3;

        let (device, pool) = pool(SLOTS);
        let waitable = Arc::new(MultiFenceHolder::with_usage(SLOTS, 4096, 256));
        let resource = Arc::new(
            TrackedResource::<u32, SoftDevice>::new(42, SLOTS).with_waitable(Arc::clone(&waitable)),
        );
        let done = AtomicBool::new(false);

        thread::scope(|s| {
            let recorders = (0..SLOTS)
                .map(|slot| {
                    let pool = &pool;
                    let resource = &resource;
                    let waitable = &waitable;

                    s.spawn(move || {
                        for frame in 0..200 {
                            let scope = loop {
                                if let Some(scope) = pool.try_begin(slot).unwrap() {
                                    break scope;
                                }
                                thread::yield_now();
                            };

                            assert_eq!(*resource.get_range(&scope, 0, 256, false), 42);
                            assert!(resource.is_owned_by(slot));
                            assert!(resource.reference_count() >= 2);
                            assert!(waitable.has_fence(slot));

                            pool.submit(slot).get_unsafe().unwrap().signal();

                            if frame % 4 == 0 {
                                pool.retire(slot).unwrap();
                            }
                        }
                    })
                })
                .collect::<Vec<_>>();

            for _ in 0..2 {
                s.spawn(|| {
                    while !done.load(Ordering::Acquire) {
                        for slot in 0..SLOTS {
                            pool.try_retire(slot).unwrap();
                        }
                    }
                });
            }

            for recorder in recorders {
                recorder.join().unwrap();
            }
            done.store(true, Ordering::Release);
        });

        pool.retire_all().unwrap();

        assert!(!resource.is_destroyed());
        assert_eq!(resource.reference_count(), 1);
        assert!(!waitable.is_range_in_use(None, 0, 4096, false));

        resource.dispose();
        assert!(resource.is_destroyed());
        assert_eq!(device.live_fences(), 0);
    }

    #[test]
    #[should_panic(expected = "still in flight")]
    fn beginning_a_busy_slot_is_a_bug() {
        let (_device, pool) = pool(1);
        pool.begin(0).unwrap();
        let _ = pool.begin(0);
    }
}
