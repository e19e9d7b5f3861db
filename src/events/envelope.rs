//! Type-erased event in flight through the dispatcher.

use std::fmt;
use std::sync::Arc;

use super::{AnyEvent, Event, TypeClosure, TypeKey};

/// A published event together with the means to resolve its type closure.
///
/// Cloning is cheap: every clone shares the same event allocation, so handlers on
/// different threads observe the same instance.
#[derive(Clone)]
pub struct EventEnvelope {
    event: Arc<AnyEvent>,
    event_type: TypeKey,
    resolve: fn() -> Arc<TypeClosure>,
}

impl EventEnvelope {
    pub fn new<E: Event>(event: E) -> Self {
        Self::from_arc(Arc::new(event))
    }

    pub fn from_arc<E: Event>(event: Arc<E>) -> Self {
        Self {
            event,
            event_type: TypeKey::of::<E>(),
            resolve: TypeClosure::of::<E>,
        }
    }

    pub fn event(&self) -> &AnyEvent {
        self.event.as_ref()
    }

    pub fn shared(&self) -> &Arc<AnyEvent> {
        &self.event
    }

    pub fn event_type(&self) -> TypeKey {
        self.event_type
    }

    /// Resolve (and cache on first use) the routing types of the wrapped event.
    pub fn closure(&self) -> Arc<TypeClosure> {
        (self.resolve)()
    }

    pub fn downcast_ref<E: Event>(&self) -> Option<&E> {
        self.event.downcast_ref::<E>()
    }
}

impl fmt::Debug for EventEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEnvelope")
            .field("event_type", &self.event_type)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;

    struct Ping(u32);
    impl EventType for Ping {}

    #[test]
    fn test_envelope_shares_event_between_clones() {
        let envelope = EventEnvelope::new(Ping(3));
        let copy = envelope.clone();

        assert!(Arc::ptr_eq(envelope.shared(), copy.shared()));
        assert_eq!(copy.downcast_ref::<Ping>().map(|p| p.0), Some(3));
        assert_eq!(envelope.event_type(), TypeKey::of::<Ping>());
    }

    #[test]
    fn test_envelope_resolves_closure_of_concrete_type() {
        let envelope = EventEnvelope::new(Ping(1));
        let closure = envelope.closure();
        assert_eq!(closure.concrete(), TypeKey::of::<Ping>());
        assert!(Arc::ptr_eq(&closure, &TypeClosure::of::<Ping>()));
    }
}
