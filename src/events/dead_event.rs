//! Wrapper for events that no live subscription accepted.

use std::fmt;
use std::sync::Arc;

use super::{AnyEvent, Event, EventEnvelope, EventType, TypeKey};
use crate::bus::EventBus;

/// An event that was posted but matched no live subscription.
///
/// Produced only by the dispatcher, which re-dispatches it once. Subscribing to
/// `DeadEvent` is how an application observes routing misses. A `DeadEvent` that nobody
/// handles is dropped; it is never wrapped again.
pub struct DeadEvent {
    source: EventBus,
    event: Arc<AnyEvent>,
    event_type: TypeKey,
}

impl EventType for DeadEvent {}

impl DeadEvent {
    pub(crate) fn new(source: EventBus, original: &EventEnvelope) -> Self {
        Self {
            source,
            event: Arc::clone(original.shared()),
            event_type: original.event_type(),
        }
    }

    /// The bus that failed to deliver the event.
    pub fn source(&self) -> &EventBus {
        &self.source
    }

    /// The undelivered event.
    pub fn event(&self) -> &AnyEvent {
        self.event.as_ref()
    }

    pub fn shared_event(&self) -> &Arc<AnyEvent> {
        &self.event
    }

    /// Concrete type of the undelivered event.
    pub fn event_type(&self) -> TypeKey {
        self.event_type
    }

    pub fn downcast_ref<E: Event>(&self) -> Option<&E> {
        self.event.downcast_ref::<E>()
    }
}

impl fmt::Debug for DeadEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadEvent")
            .field("source", &self.source.name())
            .field("event_type", &self.event_type)
            .finish()
    }
}
