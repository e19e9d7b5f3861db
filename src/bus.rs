//! # Event Bus
//!
//! The publish/subscribe entry point.
//!
//! ## Overview
//!
//! Each bus owns a serial dispatch thread, a background executor and a
//! [`SubscriberRegistry`]. `post*` calls hand the event to the dispatch thread and return
//! at once; events posted to one bus start dispatching in post order. `send*` calls
//! dispatch on the caller's thread and return once every `CallerThread` handler has run.
//! Handlers on other affinities are only submitted by then.
//!
//! Handler failures never reach publishers. They go to the bus's
//! [`SubscriberExceptionHandler`], which by default logs them.
//!
//! ## Usage
//!
//! ```rust
//! use async_event_bus::events::EventType;
//! use async_event_bus::registry::{EventSubscriber, HandlerSet};
//! use async_event_bus::{EventBus, ThreadAffinity};
//! use std::sync::atomic::{AtomicU64, Ordering};
//! use std::sync::{Arc, Weak};
//!
//! struct Deposit(u64);
//! impl EventType for Deposit {}
//!
//! #[derive(Default)]
//! struct Ledger {
//!     balance: AtomicU64,
//! }
//!
//! impl EventSubscriber for Ledger {
//!     fn declare_handlers(handlers: &mut HandlerSet<Self>) {
//!         handlers.on_thread::<Deposit, _>("credit", ThreadAffinity::CallerThread, |ledger, deposit| {
//!             ledger.balance.fetch_add(deposit.0, Ordering::SeqCst);
//!         });
//!     }
//! }
//!
//! # fn main() -> async_event_bus::Result<()> {
//! let bus = EventBus::named("accounts")?;
//! let ledger = Arc::new(Ledger::default());
//! bus.register(&ledger)?;
//!
//! bus.send(Deposit(40));
//! bus.send(Deposit(2));
//! assert_eq!(ledger.balance.load(Ordering::SeqCst), 42);
//! # Ok(())
//! # }
//! ```

use std::any::{Any, TypeId};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::EventBusConfig;
use crate::dispatch;
use crate::error::{HandlerError, Result};
use crate::events::{Event, EventEnvelope};
use crate::execution::units::{DELIVERY_UNITS, DISPATCH_UNITS};
use crate::execution::{
    BackgroundExecutor, ContextThread, DispatchUnit, EagerThreadPool, ExecutionContext,
};
use crate::registry::handlers::erase;
use crate::registry::{AnyTarget, EventSubscriber, HandlerDescriptor, SubscriberRegistry, Subscription};

/// A handler failure as seen by a [`SubscriberExceptionHandler`]
pub struct SubscriberException<'a> {
    bus: &'a EventBus,
    target: Option<&'a Arc<AnyTarget>>,
    handler: &'a HandlerDescriptor,
    error: &'a HandlerError,
}

impl<'a> SubscriberException<'a> {
    pub fn bus(&self) -> &'a EventBus {
        self.bus
    }

    /// The target whose handler failed, if it is still alive.
    pub fn target(&self) -> Option<&'a Arc<AnyTarget>> {
        self.target
    }

    pub fn target_as<T: Any + Send + Sync>(&self) -> Option<&'a T> {
        self.target.and_then(|target| target.downcast_ref::<T>())
    }

    pub fn handler(&self) -> &'a HandlerDescriptor {
        self.handler
    }

    pub fn error(&self) -> &'a HandlerError {
        self.error
    }
}

/// Receives every error or panic raised by a handler of the bus.
pub trait SubscriberExceptionHandler: Send + Sync {
    fn on_subscriber_exception(&self, exception: &SubscriberException<'_>);
}

/// Logs handler failures at `error` level and carries on.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingExceptionHandler;

impl SubscriberExceptionHandler for LoggingExceptionHandler {
    fn on_subscriber_exception(&self, exception: &SubscriberException<'_>) {
        error!(
            bus = %exception.bus().name(),
            subscriber = exception.handler().subscriber_type().name(),
            handler = exception.handler().name(),
            event_type = exception.handler().event_type().name(),
            target_alive = exception.target().is_some(),
            error = %exception.error(),
            "❌ Subscriber failed while handling event"
        );
    }
}

struct BusInner {
    id: Uuid,
    config: EventBusConfig,
    registry: SubscriberRegistry,
    dispatch_thread: ContextThread,
    background: Arc<dyn BackgroundExecutor>,
    owned_pool: Option<Arc<EagerThreadPool>>,
    exception_handler: Arc<dyn SubscriberExceptionHandler>,
    shut_down: AtomicBool,
}

impl Drop for BusInner {
    fn drop(&mut self) {
        if !self.shut_down.swap(true, Ordering::AcqRel) {
            self.dispatch_thread.quit();
            if let Some(pool) = &self.owned_pool {
                BackgroundExecutor::shutdown(pool.as_ref());
            }
            debug!(bus = %self.config.name, id = %self.id, "Event bus dropped");
        }
    }
}

/// Handle to an event bus. Clones share the same bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

/// Non-owning bus handle held by queued dispatch work, so pending and delayed posts
/// never keep a dropped bus alive.
#[derive(Clone)]
pub(crate) struct WeakEventBus {
    inner: Weak<BusInner>,
}

impl WeakEventBus {
    pub(crate) fn upgrade(&self) -> Option<EventBus> {
        self.inner.upgrade().map(|inner| EventBus { inner })
    }
}

impl EventBus {
    /// A bus named "default" with default configuration.
    pub fn new() -> Result<EventBus> {
        Self::builder().build()
    }

    pub fn named(name: impl Into<String>) -> Result<EventBus> {
        Self::builder().name(name).build()
    }

    pub fn from_config(config: EventBusConfig) -> Result<EventBus> {
        Self::builder().config(config).build()
    }

    pub fn builder() -> EventBusBuilder {
        EventBusBuilder::default()
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn config(&self) -> &EventBusConfig {
        &self.inner.config
    }

    /// Subscribe every handler `T` declares. Also records the calling thread's execution
    /// context for `AsRegistered` handlers.
    ///
    /// Fails with a configuration error when `T`'s handler declarations are malformed.
    pub fn register<T: EventSubscriber>(&self, target: &Arc<T>) -> Result<()> {
        let added = self.inner.registry.register(target)?;
        debug!(
            bus = %self.name(),
            subscriber = target.subscriber_name(),
            subscriptions = added,
            "Target registered on bus"
        );
        Ok(())
    }

    /// Remove `target`'s subscriptions along with those of every dropped target.
    /// Returns how many subscriptions were removed.
    pub fn unregister<T: Any + Send + Sync>(&self, target: &Arc<T>) -> usize {
        self.inner.registry.unregister(Some(&erase(target)))
    }

    /// Remove only the subscriptions of dropped targets.
    pub fn purge_collected(&self) -> usize {
        self.inner.registry.unregister(None)
    }

    /// Record the calling thread's execution context as `target`'s `AsRegistered` context.
    pub fn assign_thread_for_target<T: Any + Send + Sync>(&self, target: &Arc<T>) {
        self.inner.registry.assign_context(&erase(target));
    }

    /// Queue `event` for dispatch on the bus thread.
    pub fn post<E: Event>(&self, event: E) {
        self.enqueue(EventEnvelope::new(event), None, None);
    }

    /// Queue `event` for dispatch to `target`'s handlers only.
    pub fn post_to_target<E: Event, T: Any + Send + Sync>(&self, event: E, target: &Arc<T>) {
        self.enqueue(EventEnvelope::new(event), Some(erase(target)), None);
    }

    /// Queue `event` for dispatch no earlier than `delay` from now.
    pub fn post_delayed<E: Event>(&self, event: E, delay: Duration) {
        self.enqueue(EventEnvelope::new(event), None, Some(delay));
    }

    pub fn post_to_target_delayed<E: Event, T: Any + Send + Sync>(
        &self,
        event: E,
        target: &Arc<T>,
        delay: Duration,
    ) {
        self.enqueue(EventEnvelope::new(event), Some(erase(target)), Some(delay));
    }

    /// Dispatch `event` on the calling thread. Returns after every `CallerThread`
    /// handler has run.
    pub fn send<E: Event>(&self, event: E) {
        dispatch::dispatch(self, EventEnvelope::new(event), None);
    }

    pub fn send_to_target<E: Event, T: Any + Send + Sync>(&self, event: E, target: &Arc<T>) {
        dispatch::dispatch(self, EventEnvelope::new(event), Some(erase(target)));
    }

    /// Publish an event that is already shared, keeping its identity.
    pub fn post_shared<E: Event>(&self, event: Arc<E>) {
        self.enqueue(EventEnvelope::from_arc(event), None, None);
    }

    pub fn send_shared<E: Event>(&self, event: Arc<E>) {
        dispatch::dispatch(self, EventEnvelope::from_arc(event), None);
    }

    fn enqueue(
        &self,
        envelope: EventEnvelope,
        single_target: Option<Arc<AnyTarget>>,
        delay: Option<Duration>,
    ) {
        let event_type = envelope.event_type();
        let unit = DispatchUnit::obtain(self, envelope, single_target);
        let context = self.inner.dispatch_thread.context();
        let submitted = match delay {
            Some(delay) => context.execute_after(delay, unit),
            None => context.execute(unit),
        };
        if submitted.is_err() {
            warn!(
                bus = %self.name(),
                event_type = %event_type,
                "Bus is shut down; dropping posted event"
            );
        }
    }

    /// Snapshot of the subscriptions registered for exactly routing type `V`.
    pub fn subscriptions_for<V: ?Sized + 'static>(&self) -> Vec<Arc<Subscription>> {
        self.inner
            .registry
            .subscriptions_for(TypeId::of::<V>())
            .snapshot()
            .to_vec()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.registry.subscription_count()
    }

    /// The serial context running posted dispatches.
    pub fn dispatch_context(&self) -> ExecutionContext {
        self.inner.dispatch_thread.context()
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    /// Stop the dispatch thread and the bus-owned background pool, waiting for both.
    ///
    /// Posts not yet dispatched are discarded. A background executor supplied through the
    /// builder is left running.
    pub fn shutdown(&self) {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.dispatch_thread.join();
        if let Some(pool) = &self.inner.owned_pool {
            pool.shutdown_and_wait();
        }
        info!(bus = %self.name(), id = %self.id(), "🛑 Event bus shut down");
    }

    pub(crate) fn downgrade(&self) -> WeakEventBus {
        WeakEventBus {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub(crate) fn registry(&self) -> &SubscriberRegistry {
        &self.inner.registry
    }

    pub(crate) fn background(&self) -> &dyn BackgroundExecutor {
        self.inner.background.as_ref()
    }

    pub(crate) fn report_subscriber_exception(
        &self,
        target: Option<&Arc<AnyTarget>>,
        handler: &HandlerDescriptor,
        error: &HandlerError,
    ) {
        let exception = SubscriberException {
            bus: self,
            target,
            handler,
            error,
        };
        let reported = panic::catch_unwind(AssertUnwindSafe(|| {
            self.inner
                .exception_handler
                .on_subscriber_exception(&exception)
        }));
        if reported.is_err() {
            error!(
                bus = %self.name(),
                handler = %handler,
                "Subscriber exception handler panicked"
            );
        }
    }
}

impl PartialEq for EventBus {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for EventBus {}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("name", &self.name())
            .field("id", &self.id())
            .field("registry", &self.inner.registry)
            .finish()
    }
}

/// Configures and starts an [`EventBus`]
#[derive(Default)]
pub struct EventBusBuilder {
    config: EventBusConfig,
    background: Option<Arc<dyn BackgroundExecutor>>,
    exception_handler: Option<Arc<dyn SubscriberExceptionHandler>>,
}

impl EventBusBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Replace the whole configuration. Call before `name` to keep a custom name.
    pub fn config(mut self, config: EventBusConfig) -> Self {
        self.config = config;
        self
    }

    /// Run `Background` deliveries on `executor` instead of a bus-owned pool.
    pub fn background_executor(mut self, executor: Arc<dyn BackgroundExecutor>) -> Self {
        self.background = Some(executor);
        self
    }

    pub fn exception_handler(mut self, handler: Arc<dyn SubscriberExceptionHandler>) -> Self {
        self.exception_handler = Some(handler);
        self
    }

    /// Validate the configuration and start the dispatch thread. Returns once the thread
    /// accepts work.
    pub fn build(self) -> Result<EventBus> {
        let config = self.config;
        config.validate()?;

        DISPATCH_UNITS.set_capacity(config.unit_pool_capacity);
        DELIVERY_UNITS.set_capacity(config.unit_pool_capacity);

        let (background, owned_pool) = match self.background {
            Some(executor) => (executor, None),
            None => {
                let pool = Arc::new(EagerThreadPool::new(config.pool_config())?);
                (Arc::clone(&pool) as Arc<dyn BackgroundExecutor>, Some(pool))
            }
        };

        let dispatch_thread = ContextThread::spawn(format!("{}-dispatch", config.name))?;
        let id = Uuid::new_v4();
        info!(
            bus = %config.name,
            id = %id,
            shared_background = owned_pool.is_none(),
            "🚌 Event bus started"
        );

        Ok(EventBus {
            inner: Arc::new(BusInner {
                id,
                config,
                registry: SubscriberRegistry::new(),
                dispatch_thread,
                background,
                owned_pool,
                exception_handler: self
                    .exception_handler
                    .unwrap_or_else(|| Arc::new(LoggingExceptionHandler)),
                shut_down: AtomicBool::new(false),
            }),
        })
    }
}
