//! A (target, handler) pair with a weak hold on the target.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tracing::error;

use super::{AnyTarget, HandlerDescriptor};
use crate::bus::EventBus;
use crate::error::HandlerError;
use crate::events::EventEnvelope;
use crate::execution::ThreadAffinity;

/// Binds one handler of one registered target.
///
/// The target is held weakly: once the application drops its last strong reference the
/// subscription goes inert and is swept on the next `unregister`. Equality and hashing use
/// target identity and handler identity, never the target's own `Eq`.
pub struct Subscription {
    target: Weak<AnyTarget>,
    handler: Arc<HandlerDescriptor>,
    hash: u64,
}

fn target_address(target: *const AnyTarget) -> usize {
    target as *const () as usize
}

impl Subscription {
    pub(crate) fn new(target: &Arc<AnyTarget>, handler: Arc<HandlerDescriptor>) -> Self {
        let mut hasher = DefaultHasher::new();
        target_address(Arc::as_ptr(target)).hash(&mut hasher);
        (Arc::as_ptr(&handler) as usize).hash(&mut hasher);

        Self {
            target: Arc::downgrade(target),
            handler,
            hash: hasher.finish(),
        }
    }

    /// The target, if it is still alive.
    pub fn target(&self) -> Option<Arc<AnyTarget>> {
        self.target.upgrade()
    }

    pub fn is_alive(&self) -> bool {
        self.target.strong_count() > 0
    }

    /// Whether this subscription belongs to `target` (by identity).
    pub fn is_for(&self, target: &Arc<AnyTarget>) -> bool {
        target_address(Weak::as_ptr(&self.target)) == target_address(Arc::as_ptr(target))
    }

    pub fn handler(&self) -> &Arc<HandlerDescriptor> {
        &self.handler
    }

    pub fn affinity(&self) -> ThreadAffinity {
        self.handler.affinity()
    }

    /// Invoke the handler for `envelope` on the calling thread.
    ///
    /// Does nothing when the target has been dropped. Errors and panics raised by the
    /// handler are reported to the bus's exception handler.
    pub(crate) fn deliver(&self, bus: &EventBus, envelope: &EventEnvelope) {
        // Upgrade once, then test: the target must stay alive for the whole call.
        let Some(target) = self.target.upgrade() else {
            return;
        };

        let closure = envelope.closure();
        let Some(view) = closure.view(self.handler.event_type().id()) else {
            error!(
                handler = %self.handler,
                event_type = %envelope.event_type(),
                "Event is not deliverable to handler's declared type"
            );
            return;
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.handler.invoke(target.as_ref(), view, envelope.event())
        }));

        let failure = match outcome {
            Ok(Some(Ok(()))) => return,
            Ok(Some(Err(err))) => HandlerError::Failed(err),
            Ok(None) => {
                error!(handler = %self.handler, "Handler could not bind its target");
                return;
            }
            Err(payload) => HandlerError::from_panic(payload),
        };

        bus.report_subscriber_exception(Some(&target), &self.handler, &failure);
    }
}

impl PartialEq for Subscription {
    fn eq(&self, other: &Self) -> bool {
        Weak::ptr_eq(&self.target, &other.target) && Arc::ptr_eq(&self.handler, &other.handler)
    }
}

impl Eq for Subscription {}

impl Hash for Subscription {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("handler", &self.handler.to_string())
            .field("affinity", &self.affinity())
            .field("alive", &self.is_alive())
            .finish()
    }
}
