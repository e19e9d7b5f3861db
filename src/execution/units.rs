//! # Pooled Execution Units
//!
//! Work handed to execution contexts is a `Box<dyn Runnable>`. The two units the bus
//! schedules on every event, [`DispatchUnit`] and [`DeliveryUnit`], are recycled through
//! lock-free [`UnitPool`]s so steady-state dispatch does not allocate task objects.
//!
//! Lifecycle: `obtain` pops a cleared unit (or allocates one) and fills it; the unit is
//! handed to a context; when it runs it does its job, clears every field and pushes its
//! own `Box` back. Once submitted, a unit belongs to the context: the same allocation may
//! be serving an unrelated event on another thread as soon as it finishes.

use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::bus::{EventBus, WeakEventBus};
use crate::dispatch;
use crate::events::EventEnvelope;
use crate::registry::{AnyTarget, Subscription};

/// Units retained per pool; extra units are freed after a burst.
pub const DEFAULT_POOL_CAPACITY: usize = 256;

pub(crate) static DISPATCH_UNITS: UnitPool<DispatchUnit> = UnitPool::new(DEFAULT_POOL_CAPACITY);
pub(crate) static DELIVERY_UNITS: UnitPool<DeliveryUnit> = UnitPool::new(DEFAULT_POOL_CAPACITY);

/// A unit of work an execution context can run exactly once.
pub trait Runnable: Send {
    fn run(self: Box<Self>);
}

/// Adapter running a closure as a [`Runnable`].
pub struct FnTask<F>(F);

impl<F: FnOnce() + Send> Runnable for FnTask<F> {
    fn run(self: Box<Self>) {
        (self.0)()
    }
}

/// Box a closure as a task.
pub fn task<F: FnOnce() + Send + 'static>(f: F) -> Box<dyn Runnable> {
    Box::new(FnTask(f))
}

/// Lock-free pool of reusable units
pub struct UnitPool<U> {
    units: SegQueue<Box<U>>,
    capacity: AtomicUsize,
}

impl<U: Default> UnitPool<U> {
    pub const fn new(capacity: usize) -> Self {
        Self {
            units: SegQueue::new(),
            capacity: AtomicUsize::new(capacity),
        }
    }

    /// Pop a cleared unit, or allocate a fresh one when the pool is empty.
    pub fn obtain(&self) -> Box<U> {
        self.units.pop().unwrap_or_default()
    }

    /// Return a cleared unit. Dropped instead when the pool is at capacity.
    pub fn recycle(&self, unit: Box<U>) {
        if self.units.len() < self.capacity.load(Ordering::Relaxed) {
            self.units.push(unit);
        }
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Runs the dispatch algorithm for one event on whichever context executes it.
///
/// Holds the bus weakly: an event still queued when the last handle goes away is dropped.
#[derive(Default)]
pub struct DispatchUnit {
    bus: Option<WeakEventBus>,
    envelope: Option<EventEnvelope>,
    single_target: Option<Arc<AnyTarget>>,
    pool: Option<&'static UnitPool<DispatchUnit>>,
}

impl DispatchUnit {
    pub fn obtain(
        bus: &EventBus,
        envelope: EventEnvelope,
        single_target: Option<Arc<AnyTarget>>,
    ) -> Box<Self> {
        Self::obtain_from(&DISPATCH_UNITS, bus, envelope, single_target)
    }

    pub fn obtain_from(
        pool: &'static UnitPool<DispatchUnit>,
        bus: &EventBus,
        envelope: EventEnvelope,
        single_target: Option<Arc<AnyTarget>>,
    ) -> Box<Self> {
        let mut unit = pool.obtain();
        unit.bus = Some(bus.downgrade());
        unit.envelope = Some(envelope);
        unit.single_target = single_target;
        unit.pool = Some(pool);
        unit
    }

    /// True when every field has been reset.
    pub fn is_clear(&self) -> bool {
        self.bus.is_none()
            && self.envelope.is_none()
            && self.single_target.is_none()
            && self.pool.is_none()
    }
}

impl Runnable for DispatchUnit {
    fn run(mut self: Box<Self>) {
        let bus = self.bus.take().and_then(|bus| bus.upgrade());
        if let (Some(bus), Some(envelope)) = (bus, self.envelope.take()) {
            dispatch::dispatch(&bus, envelope, self.single_target.take());
        }
        self.envelope = None;
        self.single_target = None;
        if let Some(pool) = self.pool.take() {
            pool.recycle(self);
        }
    }
}

/// Delivers one event to one subscription on whichever context executes it.
#[derive(Default)]
pub struct DeliveryUnit {
    bus: Option<EventBus>,
    subscription: Option<Arc<Subscription>>,
    envelope: Option<EventEnvelope>,
    pool: Option<&'static UnitPool<DeliveryUnit>>,
}

impl DeliveryUnit {
    pub fn obtain(
        bus: EventBus,
        subscription: Arc<Subscription>,
        envelope: EventEnvelope,
    ) -> Box<Self> {
        Self::obtain_from(&DELIVERY_UNITS, bus, subscription, envelope)
    }

    pub fn obtain_from(
        pool: &'static UnitPool<DeliveryUnit>,
        bus: EventBus,
        subscription: Arc<Subscription>,
        envelope: EventEnvelope,
    ) -> Box<Self> {
        let mut unit = pool.obtain();
        unit.bus = Some(bus);
        unit.subscription = Some(subscription);
        unit.envelope = Some(envelope);
        unit.pool = Some(pool);
        unit
    }

    pub fn is_clear(&self) -> bool {
        self.bus.is_none()
            && self.subscription.is_none()
            && self.envelope.is_none()
            && self.pool.is_none()
    }
}

impl Runnable for DeliveryUnit {
    fn run(mut self: Box<Self>) {
        if let (Some(bus), Some(subscription), Some(envelope)) = (
            self.bus.take(),
            self.subscription.take(),
            self.envelope.take(),
        ) {
            subscription.deliver(&bus, &envelope);
        }
        if let Some(pool) = self.pool.take() {
            pool.recycle(self);
        }
    }
}
