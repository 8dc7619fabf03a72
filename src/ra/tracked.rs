//! Reference-counted ownership of GPU resources across in-flight submissions.
//!
//! A [`TrackedResource`] owns one native object. Its creator holds one
//! reference, and every submission slot that records a use of it holds another
//! until the slot retires. The object is released exactly once, when the last
//! of those references goes away, regardless of the order slots retire in.
//!
//! Resources may own children (a view owning its image, a descriptor set
//! owning its buffers). Registering a resource on a slot registers the whole
//! ownership subgraph, and releasing it drops one reference from each child.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard};
use smallvec::SmallVec;
use tracing::trace;

use crate::{
    collections::bit_vector::BitVector, error::LifetimeError, rhi::device::RenderFenceDevice,
};

use super::{multi_fence::MultiFenceHolder, slots::SlotScope};

/// Object-safe view of a tracked resource, as seen by slots and parents.
pub trait SlotDependant<D: RenderFenceDevice>: Send + Sync {
    fn add_slot_dependencies(
        self: Arc<Self>,
        scope: &dyn SlotScope<D>,
    ) -> Result<(), LifetimeError>;

    fn increment_reference_count(&self) -> Result<(), LifetimeError>;
    fn decrement_reference_count(&self);

    /// Called by a retiring slot: forget the slot, then drop its reference.
    fn decrement_slot_reference(&self, slot: usize);
}

/// Values able to serve a read from a shadow copy instead of stalling on
/// pending GPU work.
pub trait Mirrorable<D: RenderFenceDevice>: Sized + Send + Sync + 'static {
    /// Returns a mirror holding the contents of `offset..offset + size` and
    /// the offset of that data inside it, or `None` to use the original.
    fn mirror(
        &self,
        scope: &dyn SlotScope<D>,
        offset: u64,
        size: u64,
    ) -> Option<(Arc<TrackedResource<Self, D>>, u64)>;
}

/// What [`TrackedResource::get_mirrorable`] registered on the slot.
pub struct Mirrored<V, D: RenderFenceDevice> {
    pub resource: Arc<TrackedResource<V, D>>,
    pub offset: u64,
    pub mirrored: bool,
}

pub struct TrackedResource<V, D: RenderFenceDevice> {
    value: RwLock<Option<V>>,
    reference_count: AtomicUsize,
    slot_ownership: BitVector,
    waitable: Option<Arc<MultiFenceHolder<D>>>,
    children: SmallVec<[Arc<dyn SlotDependant<D>>; 2]>,
    destroyed: AtomicBool,
    disposed: AtomicBool,
}

impl<V, D> TrackedResource<V, D>
where
    V: Send + Sync + 'static,
    D: RenderFenceDevice,
{
    pub fn new(value: V, slot_count: usize) -> Self {
        Self {
            value: RwLock::new(Some(value)),
            reference_count: AtomicUsize::new(1),
            slot_ownership: BitVector::new(slot_count),
            waitable: None,
            children: SmallVec::new(),
            destroyed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn with_waitable(mut self, waitable: Arc<MultiFenceHolder<D>>) -> Self {
        self.waitable = Some(waitable);
        self
    }

    /// Children receive one decrement when this resource is released. Their
    /// references are transferred, not taken.
    pub fn with_children(
        mut self,
        children: impl IntoIterator<Item = Arc<dyn SlotDependant<D>>>,
    ) -> Self {
        self.children.extend(children);
        self
    }

    #[inline]
    pub fn reference_count(&self) -> usize {
        self.reference_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn waitable(&self) -> Option<&Arc<MultiFenceHolder<D>>> {
        self.waitable.as_ref()
    }

    /// Whether `slot` currently holds a reference.
    #[inline]
    pub fn is_owned_by(&self, slot: usize) -> bool {
        self.slot_ownership.is_set(slot)
    }

    /// Returns the value, keeping it alive until the scope's slot retires.
    ///
    /// # Panics
    ///
    /// If the resource has been destroyed.
    pub fn get(self: &Arc<Self>, scope: &dyn SlotScope<D>) -> MappedRwLockReadGuard<'_, V> {
        self.try_get(scope)
            .expect("tracked resource accessed after destruction")
    }

    /// [`get`](Self::get) for callers that may race destruction.
    pub fn try_get(
        self: &Arc<Self>,
        scope: &dyn SlotScope<D>,
    ) -> Option<MappedRwLockReadGuard<'_, V>> {
        if !self.is_destroyed() {
            self.register_slot_dependency(scope).ok()?;
        }

        self.get_unsafe()
    }

    /// [`get`](Self::get) that also records a byte-range use for the scope's slot.
    pub fn get_range(
        self: &Arc<Self>,
        scope: &dyn SlotScope<D>,
        offset: u64,
        size: u64,
        write: bool,
    ) -> MappedRwLockReadGuard<'_, V> {
        if let Some(waitable) = &self.waitable {
            waitable.add_buffer_use(scope.slot(), offset, size, write);
        }

        self.get(scope)
    }

    /// Borrows the value without registering anything.
    pub fn get_unsafe(&self) -> Option<MappedRwLockReadGuard<'_, V>> {
        RwLockReadGuard::try_map(self.value.read(), Option::as_ref).ok()
    }

    /// Registers `scope`'s slot as a dependant of this resource and of every child.
    ///
    /// Idempotent per slot: only the first registration does any work.
    pub fn register_slot_dependency(
        self: &Arc<Self>,
        scope: &dyn SlotScope<D>,
    ) -> Result<(), LifetimeError> {
        let slot = scope.slot();

        if !self.slot_ownership.set(slot) {
            return Ok(());
        }

        if let Err(err) = scope.add_dependant(Arc::clone(self) as Arc<dyn SlotDependant<D>>) {
            self.slot_ownership.clear(slot);
            return Err(err);
        }

        if let Some(waitable) = &self.waitable {
            scope.add_waitable(waitable);
        }

        for child in &self.children {
            Arc::clone(child).add_slot_dependencies(scope)?;
        }

        Ok(())
    }

    /// Takes a reference, failing if the count already dropped to zero.
    pub fn increment_reference_count(&self) -> Result<(), LifetimeError> {
        if self.try_increment_reference_count() {
            Ok(())
        } else {
            Err(LifetimeError::AlreadyDestroyed)
        }
    }

    /// Takes a reference only while the resource is alive.
    pub fn try_increment_reference_count(&self) -> bool {
        self.reference_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count > 0).then_some(count + 1)
            })
            .is_ok()
    }

    /// Drops a reference, releasing the value and one reference of each child
    /// on the last one.
    pub fn decrement_reference_count(&self) {
        let old = self.reference_count.fetch_sub(1, Ordering::AcqRel);
        assert!(old > 0, "tracked resource reference count went negative");

        if old == 1 {
            self.destroy();
        }
    }

    /// Drops the reference held by a retiring slot.
    pub fn decrement_slot_reference(&self, slot: usize) {
        self.slot_ownership.clear(slot);
        self.decrement_reference_count();
    }

    /// Drops the creator's reference. Repeated calls do nothing.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.decrement_reference_count();
        }
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);

        let value = self.value.write().take();
        drop(value);

        trace!(
            "Released {} with {} children",
            std::any::type_name::<V>(),
            self.children.len()
        );

        for child in &self.children {
            child.decrement_reference_count();
        }
    }
}

impl<V, D> TrackedResource<V, D>
where
    V: Mirrorable<D>,
    D: RenderFenceDevice,
{
    /// Registers either a mirror of `offset..offset + size` or, when the value
    /// cannot supply one, the resource itself.
    ///
    /// # Panics
    ///
    /// If the resource has been destroyed.
    pub fn get_mirrorable(
        self: &Arc<Self>,
        scope: &dyn SlotScope<D>,
        offset: u64,
        size: u64,
    ) -> Mirrored<V, D> {
        let mirror = self
            .get_unsafe()
            .expect("tracked resource accessed after destruction")
            .mirror(scope, offset, size);

        if let Some((mirror, mirror_offset)) = mirror {
            if mirror.register_slot_dependency(scope).is_ok() {
                if let Some(waitable) = mirror.waitable() {
                    waitable.add_buffer_use(scope.slot(), mirror_offset, size, false);
                }

                return Mirrored {
                    resource: mirror,
                    offset: mirror_offset,
                    mirrored: true,
                };
            }
        }

        drop(self.get_range(scope, offset, size, false));

        Mirrored {
            resource: Arc::clone(self),
            offset,
            mirrored: false,
        }
    }
}

impl<V, D> SlotDependant<D> for TrackedResource<V, D>
where
    V: Send + Sync + 'static,
    D: RenderFenceDevice,
{
    fn add_slot_dependencies(
        self: Arc<Self>,
        scope: &dyn SlotScope<D>,
    ) -> Result<(), LifetimeError> {
        self.register_slot_dependency(scope)
    }

    fn increment_reference_count(&self) -> Result<(), LifetimeError> {
        TrackedResource::increment_reference_count(self)
    }

    fn decrement_reference_count(&self) {
        TrackedResource::decrement_reference_count(self)
    }

    fn decrement_slot_reference(&self, slot: usize) {
        TrackedResource::decrement_slot_reference(self, slot)
    }
}

impl<V, D: RenderFenceDevice> std::fmt::Debug for TrackedResource<V, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedResource")
            .field("type", &std::any::type_name::<V>())
            .field("reference_count", &self.reference_count.load(Ordering::Relaxed))
            .field("destroyed", &self.destroyed.load(Ordering::Relaxed))
            .field("children", &self.children.len())
            .finish()
    }
}
