//! # Dispatch Engine
//!
//! Routes one event to every matching live subscription, placing each delivery on the
//! thread its handler's affinity asks for. Runs on the bus's dispatch thread for posted
//! events and on the publisher's thread for sent ones.
//!
//! An event that reaches no subscription is wrapped in a [`DeadEvent`] and dispatched once
//! more. A `DeadEvent` that also goes undelivered is dropped.

use std::sync::Arc;
use tracing::{debug, error, trace, warn};

use crate::bus::EventBus;
use crate::events::{DeadEvent, EventEnvelope};
use crate::execution::{DeliveryUnit, ExecutionContext, Runnable, ThreadAffinity};
use crate::registry::{AnyTarget, Subscription};

/// Deliver `envelope` to every live subscription of its type closure. With
/// `single_target`, only that target's subscriptions are considered.
pub(crate) fn dispatch(bus: &EventBus, envelope: EventEnvelope, single_target: Option<Arc<AnyTarget>>) {
    let closure = envelope.closure();
    let mut delivered = false;

    for key in closure.keys() {
        let Some(set) = bus.registry().existing_subscriptions(key.id()) else {
            continue;
        };

        for subscription in set.snapshot().iter() {
            let Some(target) = subscription.target() else {
                continue;
            };
            if single_target
                .as_ref()
                .is_some_and(|only| !subscription.is_for(only))
            {
                continue;
            }

            delivered = true;
            route(bus, subscription, &target, &envelope);
        }
    }

    if delivered {
        return;
    }

    if closure.contains_type::<DeadEvent>() {
        debug!(bus = %bus.name(), "Dropping dead event nobody handles");
        return;
    }

    debug!(
        bus = %bus.name(),
        event_type = %envelope.event_type(),
        "No subscriber for event; dispatching dead event"
    );
    let dead = EventEnvelope::new(DeadEvent::new(bus.clone(), &envelope));
    dispatch(bus, dead, None);
}

fn route(
    bus: &EventBus,
    subscription: &Arc<Subscription>,
    target: &Arc<AnyTarget>,
    envelope: &EventEnvelope,
) {
    let affinity = subscription.affinity();
    trace!(
        bus = %bus.name(),
        handler = %subscription.handler(),
        affinity = %affinity,
        "Routing delivery"
    );

    match affinity {
        ThreadAffinity::CallerThread => subscription.deliver(bus, envelope),
        ThreadAffinity::DispatchThread => {
            let context = bus.dispatch_context();
            if context.is_current() {
                subscription.deliver(bus, envelope);
            } else {
                submit(bus, &context, delivery(bus, subscription, envelope));
            }
        }
        ThreadAffinity::Background => {
            bus.background().execute(delivery(bus, subscription, envelope));
        }
        ThreadAffinity::Main => match ExecutionContext::main() {
            Ok(context) => submit(bus, &context, delivery(bus, subscription, envelope)),
            Err(err) => {
                error!(
                    bus = %bus.name(),
                    handler = %subscription.handler(),
                    error = %err,
                    "Main execution context unavailable; delivering on background pool"
                );
                bus.background().execute(delivery(bus, subscription, envelope));
            }
        },
        ThreadAffinity::AsRegistered => match bus.registry().context_for(target) {
            Some(context) => submit(bus, &context, delivery(bus, subscription, envelope)),
            None => {
                warn!(
                    bus = %bus.name(),
                    handler = %subscription.handler(),
                    "Target was registered from a thread without a live execution context; \
                     delivering on background pool"
                );
                bus.background().execute(delivery(bus, subscription, envelope));
            }
        },
    }
}

fn delivery(bus: &EventBus, subscription: &Arc<Subscription>, envelope: &EventEnvelope) -> Box<dyn Runnable> {
    DeliveryUnit::obtain(bus.clone(), Arc::clone(subscription), envelope.clone())
}

fn submit(bus: &EventBus, context: &ExecutionContext, unit: Box<dyn Runnable>) {
    if let Err(rejected) = context.execute(unit) {
        warn!(
            bus = %bus.name(),
            context = %context.name(),
            "Execution context stopped; delivering on background pool"
        );
        bus.background().execute(rejected.into_inner());
    }
}
