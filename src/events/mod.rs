//! # Event Types
//!
//! Routing vocabulary for the bus.
//!
//! ## Overview
//!
//! An event is delivered to every handler whose declared parameter type the event can be
//! viewed as: its own concrete type, the types it embeds as "parents", the trait-object
//! views it exposes, the parents of those, and finally the universal [`AnyEvent`] root.
//!
//! A type takes part in routing by implementing [`EventType`] and listing its direct
//! parents in [`EventType::lineage`]. Every `EventType + Send + Sync` struct is an
//! [`Event`] and can be published.
//!
//! ```rust
//! use async_event_bus::events::{EventType, Lineage};
//!
//! pub trait Shape: Send + Sync {
//!     fn area(&self) -> f64;
//! }
//! impl EventType for dyn Shape {}
//!
//! pub struct Drawn {
//!     pub layer: u32,
//! }
//! impl EventType for Drawn {}
//!
//! pub struct CircleDrawn {
//!     pub drawn: Drawn,
//!     pub radius: f64,
//! }
//!
//! impl Shape for CircleDrawn {
//!     fn area(&self) -> f64 {
//!         std::f64::consts::PI * self.radius * self.radius
//!     }
//! }
//!
//! impl EventType for CircleDrawn {
//!     fn lineage(lineage: &mut Lineage<Self>) {
//!         lineage
//!             .extends::<Drawn>(|circle| &circle.drawn)
//!             .implements::<dyn Shape>(|circle| circle);
//!     }
//! }
//! ```

pub mod closure;
pub mod dead_event;
pub mod envelope;

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

pub use closure::{TypeClosure, View};
pub use dead_event::DeadEvent;
pub use envelope::EventEnvelope;

use closure::ClosureBuilder;

/// The universal routing type: every event is deliverable under it.
pub type AnyEvent = dyn Any + Send + Sync;

/// A type events can be routed under.
///
/// Implemented by concrete event structs and by trait-object views (`dyn Trait`).
pub trait EventType: 'static {
    /// Declare the direct parents of this type. Parents of parents are discovered
    /// transitively, so only the immediate ones belong here.
    fn lineage(_lineage: &mut Lineage<Self>) {}
}

impl EventType for AnyEvent {}

/// A concrete, publishable event.
pub trait Event: EventType + Send + Sync {}

impl<T: EventType + Send + Sync> Event for T {}

/// Identity of a routing type
#[derive(Clone, Copy)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Projection from a type-erased concrete event onto one routing type.
pub(crate) type Caster<V> = Arc<dyn for<'a> Fn(&'a AnyEvent) -> Option<&'a V> + Send + Sync>;

pub(crate) fn caster<V, F>(f: F) -> Caster<V>
where
    V: ?Sized + 'static,
    F: for<'a> Fn(&'a AnyEvent) -> Option<&'a V> + Send + Sync + 'static,
{
    Arc::new(f)
}

type ParentEdge<S> = Box<dyn Fn(Caster<S>, &mut ClosureBuilder)>;

/// Direct parents of a routing type, collected by [`EventType::lineage`].
pub struct Lineage<S: ?Sized + 'static> {
    parents: Vec<ParentEdge<S>>,
}

impl<S: EventType + ?Sized> Lineage<S> {
    pub(crate) fn new() -> Self {
        Self {
            parents: Vec::new(),
        }
    }

    /// Declare `P` as a parent reachable through `upcast` (typically a field projection).
    pub fn extends<P: EventType + ?Sized>(&mut self, upcast: for<'a> fn(&'a S) -> &'a P) -> &mut Self {
        self.parents.push(Box::new(move |below: Caster<S>, builder: &mut ClosureBuilder| {
            builder.visit::<P>(caster::<P, _>(move |event| below.as_ref()(event).map(upcast)));
        }));
        self
    }

    /// Declare a trait-object view `dyn Trait` of this type.
    pub fn implements<P: EventType + ?Sized>(&mut self, upcast: for<'a> fn(&'a S) -> &'a P) -> &mut Self {
        self.extends::<P>(upcast)
    }

    pub(crate) fn into_parents(self) -> Vec<ParentEdge<S>> {
        self.parents
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }
}
