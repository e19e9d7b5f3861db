//! # Subscriber Registry
//!
//! Per-bus index from routing type to the subscriptions accepting it.
//!
//! ## Overview
//!
//! Registering a target looks up (or builds) the cached [`HandlerTable`] of its type and
//! adds one [`Subscription`] per handler to the set of the handler's routing type. Sets
//! are copy-on-write: a dispatcher iterates an immutable snapshot while registrations and
//! unregistrations replace the underlying vector, so neither side blocks the other.
//!
//! ## Key Features
//!
//! - **Weak targets**: the registry never keeps a target alive.
//! - **Passive sweep**: every `unregister` also removes subscriptions and context
//!   assignments whose target has been dropped.
//! - **Registration context**: the execution context of the registering thread is
//!   recorded per target for `AsRegistered` handlers.

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::any::TypeId;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, info};

use super::handlers::erase;
use super::{AnyTarget, EventSubscriber, HandlerTable, Subscription};
use crate::error::Result;
use crate::execution::{ExecutionContext, WeakContext};

/// Subscriptions for one routing type
#[derive(Default)]
pub struct SubscriptionSet {
    entries: RwLock<Arc<Vec<Arc<Subscription>>>>,
}

impl SubscriptionSet {
    /// Immutable view of the current subscriptions. Later changes do not affect it.
    pub fn snapshot(&self) -> Arc<Vec<Arc<Subscription>>> {
        Arc::clone(&self.entries.read())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Add `subscription` unless an equal one is present. Returns whether it was added.
    fn insert(&self, subscription: Subscription) -> bool {
        let mut entries = self.entries.write();
        if entries.iter().any(|existing| **existing == subscription) {
            return false;
        }
        let mut next = Vec::with_capacity(entries.len() + 1);
        next.extend(entries.iter().cloned());
        next.push(Arc::new(subscription));
        *entries = Arc::new(next);
        true
    }

    /// Keep only subscriptions matching `keep`. Returns how many were removed.
    fn retain(&self, mut keep: impl FnMut(&Subscription) -> bool) -> usize {
        let mut entries = self.entries.write();
        if entries.iter().all(|subscription| keep(&**subscription)) {
            return 0;
        }
        let next: Vec<_> = entries
            .iter()
            .filter(|subscription| keep(&***subscription))
            .cloned()
            .collect();
        let removed = entries.len() - next.len();
        *entries = Arc::new(next);
        removed
    }
}

impl fmt::Debug for SubscriptionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.snapshot().iter()).finish()
    }
}

struct RegisteredContext {
    target: Weak<AnyTarget>,
    context: WeakContext,
}

/// Registry of one bus's subscriptions
#[derive(Default)]
pub struct SubscriberRegistry {
    by_event_type: DashMap<TypeId, Arc<SubscriptionSet>>,
    /// Keyed by target address; the weak target keeps the address from being reused.
    contexts: DashMap<usize, RegisteredContext>,
    mutation: Mutex<()>,
}

fn address(target: &Arc<AnyTarget>) -> usize {
    Arc::as_ptr(target) as *const () as usize
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe every handler of `target`. Returns how many subscriptions were added;
    /// registering the same target twice adds none the second time.
    pub fn register<T: EventSubscriber>(&self, target: &Arc<T>) -> Result<usize> {
        let table = HandlerTable::of::<T>()?;
        let erased = erase(target);

        let _mutation = self.mutation.lock();
        self.record_context(&erased);

        let mut added = 0;
        for (event_type, handlers) in table.iter() {
            let set = self.subscriptions_for(event_type.id());
            for handler in handlers {
                if set.insert(Subscription::new(&erased, Arc::clone(handler))) {
                    added += 1;
                }
            }
        }

        info!(
            subscriber = target.subscriber_name(),
            subscriptions = added,
            "Registered subscriber"
        );
        Ok(added)
    }

    /// Remove every subscription of `target` (when given) and of every dropped target.
    /// Returns how many subscriptions were removed.
    pub fn unregister(&self, target: Option<&Arc<AnyTarget>>) -> usize {
        let _mutation = self.mutation.lock();

        let mut removed = 0;
        for entry in self.by_event_type.iter() {
            removed += entry.value().retain(|subscription| {
                subscription.is_alive() && !target.is_some_and(|t| subscription.is_for(t))
            });
        }

        let target_address = target.map(address);
        self.contexts.retain(|key, registered| {
            registered.target.strong_count() > 0 && Some(*key) != target_address
        });

        if removed > 0 {
            info!(subscriptions = removed, "Unregistered subscriptions");
        } else {
            debug!("Unregister found nothing to remove");
        }
        removed
    }

    /// Record the calling thread's context for `target`, replacing any earlier one.
    /// A thread without a context leaves an earlier assignment in place.
    pub fn assign_context(&self, target: &Arc<AnyTarget>) {
        let _mutation = self.mutation.lock();
        self.record_context(target);
    }

    fn record_context(&self, target: &Arc<AnyTarget>) {
        let Some(context) = ExecutionContext::current() else {
            return;
        };
        debug!(context = %context.name(), "Recorded registration context");
        self.contexts.insert(
            address(target),
            RegisteredContext {
                target: Arc::downgrade(target),
                context: context.downgrade(),
            },
        );
    }

    /// The live context recorded for `target`.
    pub fn context_for(&self, target: &Arc<AnyTarget>) -> Option<ExecutionContext> {
        let registered = self.contexts.get(&address(target))?;
        if registered.target.strong_count() == 0 {
            return None;
        }
        registered.context.upgrade()
    }

    /// The subscription set of `event_type`, created empty on first access.
    pub fn subscriptions_for(&self, event_type: TypeId) -> Arc<SubscriptionSet> {
        Arc::clone(self.by_event_type.entry(event_type).or_default().value())
    }

    /// The subscription set of `event_type` if one exists.
    pub fn existing_subscriptions(&self, event_type: TypeId) -> Option<Arc<SubscriptionSet>> {
        self.by_event_type
            .get(&event_type)
            .map(|set| Arc::clone(set.value()))
    }

    /// Total subscriptions across all routing types, including not yet swept dead ones.
    pub fn subscription_count(&self) -> usize {
        self.by_event_type
            .iter()
            .map(|entry| entry.value().len())
            .sum()
    }

    /// Number of targets with a recorded registration context.
    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    pub fn clear(&self) {
        let _mutation = self.mutation.lock();
        self.by_event_type.clear();
        self.contexts.clear();
    }
}

impl fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("event_types", &self.by_event_type.len())
            .field("subscriptions", &self.subscription_count())
            .field("contexts", &self.contexts.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use crate::execution::{ContextThread, Looper};
    use crate::registry::HandlerSet;
    use crate::ThreadAffinity;
    use std::thread;

    struct Alert;
    impl EventType for Alert {}

    struct Heartbeat;
    impl EventType for Heartbeat {}

    struct Monitor;
    impl EventSubscriber for Monitor {
        fn declare_handlers(handlers: &mut HandlerSet<Self>) {
            handlers
                .on_thread::<Alert, _>("on_alert", ThreadAffinity::CallerThread, |_, _| ())
                .on_thread::<Heartbeat, _>("on_heartbeat", ThreadAffinity::CallerThread, |_, _| ());
        }
    }

    #[test]
    fn test_register_adds_one_subscription_per_handler() {
        let registry = SubscriberRegistry::new();
        let monitor = Arc::new(Monitor);

        assert_eq!(registry.register(&monitor).unwrap(), 2);
        assert_eq!(registry.subscription_count(), 2);
        assert_eq!(registry.subscriptions_for(TypeId::of::<Alert>()).len(), 1);
        assert_eq!(registry.subscriptions_for(TypeId::of::<Heartbeat>()).len(), 1);
    }

    #[test]
    fn test_register_twice_is_idempotent() {
        let registry = SubscriberRegistry::new();
        let monitor = Arc::new(Monitor);

        registry.register(&monitor).unwrap();
        assert_eq!(registry.register(&monitor).unwrap(), 0);
        assert_eq!(registry.subscription_count(), 2);
    }

    #[test]
    fn test_unregister_removes_only_that_target() {
        let registry = SubscriberRegistry::new();
        let first = Arc::new(Monitor);
        let second = Arc::new(Monitor);
        registry.register(&first).unwrap();
        registry.register(&second).unwrap();

        assert_eq!(registry.unregister(Some(&erase(&first))), 2);
        assert_eq!(registry.subscription_count(), 2);
        assert!(registry
            .subscriptions_for(TypeId::of::<Alert>())
            .snapshot()
            .iter()
            .all(|s| s.is_for(&erase(&second))));
    }

    #[test]
    fn test_unregister_sweeps_dropped_targets() {
        let registry = SubscriberRegistry::new();
        let kept = Arc::new(Monitor);
        let dropped = Arc::new(Monitor);
        registry.register(&kept).unwrap();
        registry.register(&dropped).unwrap();
        drop(dropped);

        assert_eq!(registry.subscription_count(), 4);
        assert_eq!(registry.unregister(None), 2);
        assert_eq!(registry.subscription_count(), 2);
    }

    #[test]
    fn test_snapshot_is_unaffected_by_later_changes() {
        let registry = SubscriberRegistry::new();
        let monitor = Arc::new(Monitor);
        registry.register(&monitor).unwrap();

        let set = registry.subscriptions_for(TypeId::of::<Alert>());
        let snapshot = set.snapshot();
        registry.unregister(Some(&erase(&monitor)));

        assert_eq!(snapshot.len(), 1);
        assert!(set.is_empty());
    }

    #[test]
    fn test_subscriptions_for_creates_empty_set() {
        let registry = SubscriberRegistry::new();
        assert!(registry.existing_subscriptions(TypeId::of::<Alert>()).is_none());
        assert!(registry.subscriptions_for(TypeId::of::<Alert>()).is_empty());
        assert!(registry.existing_subscriptions(TypeId::of::<Alert>()).is_some());
    }

    #[test]
    fn test_registration_context_is_recorded_and_purged() {
        let registry = Arc::new(SubscriberRegistry::new());
        let monitor = Arc::new(Monitor);
        let erased = erase(&monitor);

        // No context on a plain test thread.
        registry.register(&monitor).unwrap();
        assert!(registry.context_for(&erased).is_none());

        let worker = ContextThread::spawn("registry-context").unwrap();
        let context = worker.context();
        let (done_tx, done_rx) = crossbeam::channel::bounded(1);
        let (reg, target) = (Arc::clone(&registry), Arc::clone(&erased));
        context
            .run(move || {
                reg.assign_context(&target);
                let _ = done_tx.send(());
            })
            .unwrap();
        done_rx.recv().unwrap();

        assert_eq!(registry.context_for(&erased), Some(context.clone()));
        assert_eq!(registry.context_count(), 1);

        // Registering again from a thread without a context keeps the assignment.
        registry.register(&monitor).unwrap();
        registry.assign_context(&erased);
        assert_eq!(registry.context_for(&erased), Some(context.clone()));

        registry.unregister(Some(&erased));
        assert!(registry.context_for(&erased).is_none());
        assert_eq!(registry.context_count(), 0);
    }

    #[test]
    fn test_context_of_dropped_target_is_swept() {
        let handle = thread::spawn(|| {
            let _looper = Looper::prepare("sweep").unwrap();
            let registry = SubscriberRegistry::new();
            let monitor = Arc::new(Monitor);
            registry.register(&monitor).unwrap();
            assert_eq!(registry.context_count(), 1);

            drop(monitor);
            registry.unregister(None);
            assert_eq!(registry.context_count(), 0);
        });
        handle.join().unwrap();
    }
}
