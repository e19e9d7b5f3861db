//! # Type-Closure Resolver
//!
//! Computes, once per concrete event type, every routing type an event of that type is
//! deliverable under, and caches the result for the lifetime of the process.
//!
//! The walk is breadth-first over [`EventType::lineage`] edges starting at the concrete
//! type, so parents come before grandparents. When two paths reach the same routing type
//! the first one wins. The universal [`AnyEvent`] root is always last.
//!
//! The cache is a `DashMap` keyed by `TypeId`. Two threads racing on the first lookup of
//! the same type may both compute the closure; only one result is kept and every caller
//! afterwards receives that same `Arc`.

use dashmap::DashMap;
use std::any::{Any, TypeId};
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, OnceLock};
use tracing::trace;

use super::{caster, AnyEvent, Caster, Event, EventType, Lineage, TypeKey};

static CLOSURE_CACHE: OnceLock<DashMap<TypeId, Arc<TypeClosure>>> = OnceLock::new();

fn cache() -> &'static DashMap<TypeId, Arc<TypeClosure>> {
    CLOSURE_CACHE.get_or_init(DashMap::new)
}

/// One routing type of a closure, able to project the concrete event onto that type.
#[derive(Clone)]
pub struct View {
    key: TypeKey,
    caster: Arc<dyn Any + Send + Sync>,
}

impl View {
    pub fn key(&self) -> TypeKey {
        self.key
    }

    /// Project `event` onto routing type `V`.
    ///
    /// Returns `None` when `V` is not the type this view was built for, or when `event`
    /// is not of the closure's concrete type.
    pub fn project<'a, V: ?Sized + 'static>(&self, event: &'a AnyEvent) -> Option<&'a V> {
        let caster = self.caster.downcast_ref::<Caster<V>>()?;
        caster.as_ref()(event)
    }
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View").field("key", &self.key).finish()
    }
}

/// Every routing type of one concrete event type
pub struct TypeClosure {
    concrete: TypeKey,
    views: Vec<View>,
}

impl TypeClosure {
    /// The cached closure of `E`, computing it on first use.
    pub fn of<E: Event>() -> Arc<TypeClosure> {
        let id = TypeId::of::<E>();
        if let Some(found) = cache().get(&id) {
            return Arc::clone(found.value());
        }

        let computed = Arc::new(Self::compute::<E>());
        trace!(
            event_type = computed.concrete.name(),
            routing_types = computed.views.len(),
            "Computed event type closure"
        );
        Arc::clone(cache().entry(id).or_insert(computed).value())
    }

    /// The closure of the value behind `_event`; convenience for `TypeClosure::of::<E>()`.
    pub fn of_event<E: Event>(_event: &E) -> Arc<TypeClosure> {
        Self::of::<E>()
    }

    /// Drop every cached closure. Subsequent lookups recompute.
    pub fn clear_cache() {
        cache().clear();
    }

    pub fn cached_types() -> usize {
        cache().len()
    }

    fn compute<E: Event>() -> TypeClosure {
        let mut builder = ClosureBuilder::default();
        builder.visit::<E>(caster::<E, _>(|event| event.downcast_ref::<E>()));
        while let Some(step) = builder.pending.pop_front() {
            step(&mut builder);
        }
        builder.visit::<AnyEvent>(caster::<AnyEvent, _>(|event| Some(event)));

        TypeClosure {
            concrete: TypeKey::of::<E>(),
            views: builder.views,
        }
    }

    pub fn concrete(&self) -> TypeKey {
        self.concrete
    }

    pub fn contains(&self, id: TypeId) -> bool {
        self.views.iter().any(|view| view.key.id() == id)
    }

    pub fn contains_type<T: ?Sized + 'static>(&self) -> bool {
        self.contains(TypeId::of::<T>())
    }

    pub fn view(&self, id: TypeId) -> Option<&View> {
        self.views.iter().find(|view| view.key.id() == id)
    }

    pub fn keys(&self) -> impl Iterator<Item = TypeKey> + '_ {
        self.views.iter().map(|view| view.key)
    }

    pub fn views(&self) -> &[View] {
        &self.views
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }
}

impl fmt::Debug for TypeClosure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeClosure")
            .field("concrete", &self.concrete)
            .field("types", &self.keys().collect::<Vec<_>>())
            .finish()
    }
}

type PendingStep = Box<dyn FnOnce(&mut ClosureBuilder)>;

#[derive(Default)]
pub(crate) struct ClosureBuilder {
    views: Vec<View>,
    seen: HashSet<TypeId>,
    pending: VecDeque<PendingStep>,
}

impl ClosureBuilder {
    pub(crate) fn visit<V: EventType + ?Sized>(&mut self, caster: Caster<V>) {
        let key = TypeKey::of::<V>();
        if !self.seen.insert(key.id()) {
            return;
        }

        let mut lineage = Lineage::<V>::new();
        V::lineage(&mut lineage);
        for parent in lineage.into_parents() {
            let below = Arc::clone(&caster);
            self.pending
                .push_back(Box::new(move |builder: &mut ClosureBuilder| parent(below, builder)));
        }

        self.views.push(View {
            key,
            caster: Arc::new(caster),
        });
    }
}
