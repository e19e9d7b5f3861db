//! # Handler Declarations
//!
//! Subscriber types describe their handlers once, in [`EventSubscriber::declare_handlers`].
//! The declaration is validated and turned into [`HandlerDescriptor`]s the first time a
//! type is registered with any bus; the resulting [`HandlerTable`] is cached per type for
//! the life of the process.
//!
//! ```rust
//! use async_event_bus::events::EventType;
//! use async_event_bus::registry::{EventSubscriber, HandlerSet};
//! use async_event_bus::ThreadAffinity;
//!
//! pub struct OrderPlaced {
//!     pub order_id: u64,
//! }
//! impl EventType for OrderPlaced {}
//!
//! pub struct Auditor;
//!
//! impl Auditor {
//!     fn on_order(&self, event: &OrderPlaced) {
//!         println!("order {}", event.order_id);
//!     }
//! }
//!
//! impl EventSubscriber for Auditor {
//!     fn declare_handlers(handlers: &mut HandlerSet<Self>) {
//!         handlers.on_thread("on_order", ThreadAffinity::Background, Self::on_order);
//!     }
//! }
//! ```

use dashmap::DashMap;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};
use tracing::debug;

use super::AnyTarget;
use crate::error::{BoxError, BusError, Result};
use crate::events::{AnyEvent, EventType, TypeKey, View};
use crate::execution::ThreadAffinity;

static HANDLER_CACHE: OnceLock<DashMap<TypeId, Arc<HandlerTable>>> = OnceLock::new();

fn cache() -> &'static DashMap<TypeId, Arc<HandlerTable>> {
    HANDLER_CACHE.get_or_init(DashMap::new)
}

/// A type whose instances can be registered on a bus.
pub trait EventSubscriber: Sized + Send + Sync + 'static {
    /// List every handler of this type. Called once per process.
    fn declare_handlers(handlers: &mut HandlerSet<Self>);

    fn subscriber_name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

/// Values a handler may return.
///
/// `()` always succeeds. `Result<(), E>` reports `Err` to the bus's exception handler.
pub trait HandlerOutput {
    fn into_result(self) -> std::result::Result<(), BoxError>;
}

impl HandlerOutput for () {
    fn into_result(self) -> std::result::Result<(), BoxError> {
        Ok(())
    }
}

impl<E: Into<BoxError>> HandlerOutput for std::result::Result<(), E> {
    fn into_result(self) -> std::result::Result<(), BoxError> {
        self.map_err(Into::into)
    }
}

type Invoker = Arc<
    dyn Fn(&AnyTarget, &View, &AnyEvent) -> Option<std::result::Result<(), BoxError>>
        + Send
        + Sync,
>;

/// One declared handler: its name, accepted routing type, affinity, and entry point.
pub struct HandlerDescriptor {
    name: &'static str,
    subscriber_type: TypeKey,
    event_type: TypeKey,
    affinity: ThreadAffinity,
    invoker: Invoker,
}

impl HandlerDescriptor {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn subscriber_type(&self) -> TypeKey {
        self.subscriber_type
    }

    /// The routing type the handler accepts.
    pub fn event_type(&self) -> TypeKey {
        self.event_type
    }

    pub fn affinity(&self) -> ThreadAffinity {
        self.affinity
    }

    /// Run the handler against `target` with `event` projected through `view`.
    ///
    /// `None` when the target or the event is not of the type this handler was built for.
    pub(crate) fn invoke(
        &self,
        target: &AnyTarget,
        view: &View,
        event: &AnyEvent,
    ) -> Option<std::result::Result<(), BoxError>> {
        (self.invoker)(target, view, event)
    }
}

impl fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("name", &self.name)
            .field("subscriber_type", &self.subscriber_type)
            .field("event_type", &self.event_type)
            .field("affinity", &self.affinity)
            .finish()
    }
}

impl fmt::Display for HandlerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}::{}({})",
            self.subscriber_type, self.name, self.event_type
        )
    }
}

/// Collects the handlers of subscriber type `T`.
pub struct HandlerSet<T: EventSubscriber> {
    declared: Vec<HandlerDescriptor>,
    _subscriber: PhantomData<fn(&T)>,
}

impl<T: EventSubscriber> HandlerSet<T> {
    fn new() -> Self {
        Self {
            declared: Vec::new(),
            _subscriber: PhantomData,
        }
    }

    /// Declare a handler for routing type `V` with the default `AsRegistered` affinity.
    pub fn on<V, R>(
        &mut self,
        name: &'static str,
        handler: impl Fn(&T, &V) -> R + Send + Sync + 'static,
    ) -> &mut Self
    where
        V: EventType + ?Sized,
        R: HandlerOutput,
    {
        self.on_thread(name, ThreadAffinity::default(), handler)
    }

    /// Declare a handler for routing type `V` running with `affinity`.
    pub fn on_thread<V, R>(
        &mut self,
        name: &'static str,
        affinity: ThreadAffinity,
        handler: impl Fn(&T, &V) -> R + Send + Sync + 'static,
    ) -> &mut Self
    where
        V: EventType + ?Sized,
        R: HandlerOutput,
    {
        let invoker: Invoker = Arc::new(
            move |target: &AnyTarget, view: &View, event: &AnyEvent| {
                let target = target.downcast_ref::<T>()?;
                let event = view.project::<V>(event)?;
                Some(handler(target, event).into_result())
            },
        );

        self.declared.push(HandlerDescriptor {
            name,
            subscriber_type: TypeKey::of::<T>(),
            event_type: TypeKey::of::<V>(),
            affinity,
            invoker,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.declared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.declared.is_empty()
    }
}

/// Validated, cached handlers of one subscriber type, grouped by routing type
#[derive(Debug)]
pub struct HandlerTable {
    subscriber_type: TypeKey,
    by_event_type: HashMap<TypeKey, Vec<Arc<HandlerDescriptor>>>,
}

impl HandlerTable {
    /// The cached table of `T`, building and validating it on first use.
    ///
    /// Declaration errors are returned on every call and never cached.
    pub fn of<T: EventSubscriber>() -> Result<Arc<HandlerTable>> {
        let id = TypeId::of::<T>();
        if let Some(found) = cache().get(&id) {
            return Ok(Arc::clone(found.value()));
        }

        let built = Arc::new(Self::build::<T>()?);
        debug!(
            subscriber = built.subscriber_type.name(),
            handlers = built.len(),
            event_types = built.by_event_type.len(),
            "Discovered subscriber handlers"
        );
        Ok(Arc::clone(cache().entry(id).or_insert(built).value()))
    }

    fn build<T: EventSubscriber>() -> Result<HandlerTable> {
        let subscriber_type = TypeKey::of::<T>();
        let mut set = HandlerSet::<T>::new();
        T::declare_handlers(&mut set);

        let mut by_event_type: HashMap<TypeKey, Vec<Arc<HandlerDescriptor>>> = HashMap::new();
        for descriptor in set.declared {
            if descriptor.name.trim().is_empty() {
                return Err(BusError::configuration(
                    subscriber_type.name(),
                    format!("handler for {} has an empty name", descriptor.event_type),
                ));
            }

            let handlers = by_event_type.entry(descriptor.event_type).or_default();
            if handlers.iter().any(|existing| existing.name == descriptor.name) {
                return Err(BusError::configuration(
                    subscriber_type.name(),
                    format!(
                        "handler '{}' declared twice for {}",
                        descriptor.name, descriptor.event_type
                    ),
                ));
            }
            handlers.push(Arc::new(descriptor));
        }

        Ok(HandlerTable {
            subscriber_type,
            by_event_type,
        })
    }

    pub fn subscriber_type(&self) -> TypeKey {
        self.subscriber_type
    }

    /// Routing types with their handlers.
    pub fn iter(&self) -> impl Iterator<Item = (TypeKey, &[Arc<HandlerDescriptor>])> + '_ {
        self.by_event_type
            .iter()
            .map(|(key, handlers)| (*key, handlers.as_slice()))
    }

    pub fn handlers_for(&self, event_type: TypeId) -> &[Arc<HandlerDescriptor>] {
        self.by_event_type
            .iter()
            .find(|(key, _)| key.id() == event_type)
            .map(|(_, handlers)| handlers.as_slice())
            .unwrap_or(&[])
    }

    /// Total number of handlers.
    pub fn len(&self) -> usize {
        self.by_event_type.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_event_type.is_empty()
    }
}

/// Erase a strong target reference.
pub(crate) fn erase<T: Any + Send + Sync>(target: &Arc<T>) -> Arc<AnyTarget> {
    let erased: Arc<AnyTarget> = Arc::clone(target) as Arc<AnyTarget>;
    erased
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Lineage, TypeClosure};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Reading(u32);
    impl EventType for Reading {}

    trait Measured: Send + Sync {
        fn value(&self) -> u32;
    }
    impl EventType for dyn Measured {}

    struct Calibrated {
        reading: Reading,
    }
    impl Measured for Calibrated {
        fn value(&self) -> u32 {
            self.reading.0 * 10
        }
    }
    impl EventType for Calibrated {
        fn lineage(lineage: &mut Lineage<Self>) {
            lineage
                .extends::<Reading>(|c| &c.reading)
                .implements::<dyn Measured>(|c| c);
        }
    }

    #[derive(Default)]
    struct Gauge {
        readings: AtomicUsize,
        measured: AtomicUsize,
    }

    impl Gauge {
        fn on_reading(&self, event: &Reading) {
            self.readings.fetch_add(event.0 as usize, Ordering::SeqCst);
        }
    }

    impl EventSubscriber for Gauge {
        fn declare_handlers(handlers: &mut HandlerSet<Self>) {
            handlers
                .on_thread("on_reading", ThreadAffinity::CallerThread, Self::on_reading)
                .on::<dyn Measured, _>("on_measured", |gauge, event| {
                    gauge.measured.fetch_add(event.value() as usize, Ordering::SeqCst);
                })
                .on::<Reading, _>("on_reading_checked", |_, event| {
                    if event.0 == 0 {
                        Err("zero reading")
                    } else {
                        Ok(())
                    }
                });
        }
    }

    struct Unnamed;
    impl EventSubscriber for Unnamed {
        fn declare_handlers(handlers: &mut HandlerSet<Self>) {
            handlers.on::<Reading, _>(" ", |_, _| ());
        }
    }

    struct Duplicated;
    impl EventSubscriber for Duplicated {
        fn declare_handlers(handlers: &mut HandlerSet<Self>) {
            handlers
                .on::<Reading, _>("handle", |_, _| ())
                .on::<Reading, _>("handle", |_, _| ());
        }
    }

    struct Overloaded;
    impl EventSubscriber for Overloaded {
        fn declare_handlers(handlers: &mut HandlerSet<Self>) {
            handlers
                .on::<Reading, _>("handle", |_, _| ())
                .on::<dyn Measured, _>("handle", |_, _| ());
        }
    }

    #[test]
    fn test_table_groups_handlers_by_event_type() {
        let table = HandlerTable::of::<Gauge>().unwrap();

        assert_eq!(table.len(), 3);
        assert_eq!(table.handlers_for(TypeId::of::<Reading>()).len(), 2);
        assert_eq!(table.handlers_for(TypeId::of::<dyn Measured>()).len(), 1);
        assert!(table.handlers_for(TypeId::of::<Calibrated>()).is_empty());

        let reading = &table.handlers_for(TypeId::of::<Reading>())[0];
        assert_eq!(reading.name(), "on_reading");
        assert_eq!(reading.affinity(), ThreadAffinity::CallerThread);
        let measured = &table.handlers_for(TypeId::of::<dyn Measured>())[0];
        assert_eq!(measured.affinity(), ThreadAffinity::AsRegistered);
    }

    #[test]
    fn test_table_is_cached_per_type() {
        let first = HandlerTable::of::<Gauge>().unwrap();
        let second = HandlerTable::of::<Gauge>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_empty_handler_name_is_configuration_error() {
        let err = HandlerTable::of::<Unnamed>().unwrap_err();
        assert!(matches!(err, BusError::Configuration { .. }));
        assert!(err.to_string().contains("empty name"));
    }

    #[test]
    fn test_duplicate_handler_is_configuration_error_every_time() {
        for _ in 0..2 {
            let err = HandlerTable::of::<Duplicated>().unwrap_err();
            assert!(err.to_string().contains("declared twice"));
        }
    }

    #[test]
    fn test_same_name_for_different_event_types_is_allowed() {
        let table = HandlerTable::of::<Overloaded>().unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_invoke_projects_event_onto_declared_type() {
        let table = HandlerTable::of::<Gauge>().unwrap();
        let gauge = Arc::new(Gauge::default());
        let target = erase(&gauge);
        let event: Arc<AnyEvent> = Arc::new(Calibrated {
            reading: Reading(4),
        });
        let closure = TypeClosure::of::<Calibrated>();

        let measured = &table.handlers_for(TypeId::of::<dyn Measured>())[0];
        let view = closure.view(TypeId::of::<dyn Measured>()).unwrap();
        assert!(matches!(
            measured.invoke(target.as_ref(), view, event.as_ref()),
            Some(Ok(()))
        ));
        assert_eq!(gauge.measured.load(Ordering::SeqCst), 40);

        let reading = &table.handlers_for(TypeId::of::<Reading>())[0];
        let view = closure.view(TypeId::of::<Reading>()).unwrap();
        reading.invoke(target.as_ref(), view, event.as_ref());
        assert_eq!(gauge.readings.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_invoke_reports_returned_error() {
        let table = HandlerTable::of::<Gauge>().unwrap();
        let target = erase(&Arc::new(Gauge::default()));
        let event: Arc<AnyEvent> = Arc::new(Reading(0));
        let closure = TypeClosure::of::<Reading>();
        let view = closure.view(TypeId::of::<Reading>()).unwrap();

        let checked = &table.handlers_for(TypeId::of::<Reading>())[1];
        let outcome = checked.invoke(target.as_ref(), view, event.as_ref()).unwrap();
        assert_eq!(outcome.unwrap_err().to_string(), "zero reading");
    }

    #[test]
    fn test_invoke_with_wrong_target_is_none() {
        let table = HandlerTable::of::<Gauge>().unwrap();
        let wrong = erase(&Arc::new(Unnamed));
        let event: Arc<AnyEvent> = Arc::new(Reading(1));
        let closure = TypeClosure::of::<Reading>();
        let view = closure.view(TypeId::of::<Reading>()).unwrap();

        let handler = &table.handlers_for(TypeId::of::<Reading>())[0];
        assert!(handler.invoke(wrong.as_ref(), view, event.as_ref()).is_none());
    }
}
