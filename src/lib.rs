#![allow(clippy::doc_markdown)] // Allow technical terms like TypeId, DashMap in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Async Event Bus
//!
//! In-process publish/subscribe with type-hierarchy routing and per-handler thread
//! affinity.
//!
//! ## Overview
//!
//! Publishers hand events to an [`EventBus`]; the bus delivers each event to every
//! registered handler whose declared type the event can be viewed as (its own type, its
//! declared parents, trait-object views, and the universal root). Each handler chooses
//! where it runs through its [`ThreadAffinity`]. Targets are held weakly, so dropping a
//! subscriber is enough to stop deliveries to it.
//!
//! ## Key Features
//!
//! - **Type-closure routing** computed once per event type and cached
//! - **Handler discovery** declared per subscriber type and cached
//! - **Serial dispatch thread** per bus, giving FIFO dispatch of posted events
//! - **Eager background pool** that grows to its maximum before queueing
//! - **Dead events** for everything nobody handled
//! - **Pooled execution units** so steady-state dispatch reuses its task objects
//!
//! ## Module Organization
//!
//! - [`events`] - Routing types, type closures, envelopes and dead events
//! - [`registry`] - Handler declarations, subscriptions and the subscriber registry
//! - [`execution`] - Affinities, execution contexts, the eager pool and pooled units
//! - [`bus`] - The bus handle, its builder and the exception hook
//! - [`config`] - Serde-backed configuration
//! - [`error`] - Structured error handling
//! - [`logging`] - Optional `tracing` subscriber setup
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # All tests
//! cargo bench --features benchmarks
//! ```

pub mod bus;
pub mod config;
mod dispatch;
pub mod error;
pub mod events;
pub mod execution;
pub mod logging;
pub mod registry;

pub use bus::{
    EventBus, EventBusBuilder, LoggingExceptionHandler, SubscriberException,
    SubscriberExceptionHandler,
};
pub use config::EventBusConfig;
pub use error::{BoxError, BusError, HandlerError, Result};
pub use events::{AnyEvent, DeadEvent, Event, EventType, Lineage, TypeClosure, TypeKey};
pub use execution::{
    BackgroundExecutor, ContextThread, EagerPoolConfig, EagerThreadPool, ExecutionContext,
    Looper, ThreadAffinity,
};
pub use registry::{AnyTarget, EventSubscriber, HandlerSet, Subscription};
