//! # Registry Infrastructure
//!
//! Handler discovery and subscription bookkeeping.
//!
//! ## Architecture
//!
//! ```text
//! Registry Infrastructure
//! ├── handlers             (EventSubscriber declarations, cached HandlerTable per type)
//! ├── subscription         (weak target + handler descriptor, delivery on one thread)
//! └── subscriber_registry  (per-bus routing-type index and registration contexts)
//! ```

pub mod handlers;
pub mod subscriber_registry;
pub mod subscription;

use std::any::Any;

pub use handlers::{EventSubscriber, HandlerDescriptor, HandlerOutput, HandlerSet, HandlerTable};
pub use subscriber_registry::{SubscriberRegistry, SubscriptionSet};
pub use subscription::Subscription;

/// A registered target, type-erased.
pub type AnyTarget = dyn Any + Send + Sync;
