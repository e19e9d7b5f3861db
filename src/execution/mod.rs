//! # Execution
//!
//! Where handlers run.
//!
//! - [`affinity`]: the thread affinities a handler can declare
//! - [`context`]: serial execution contexts bound to one thread each
//! - [`eager_pool`]: the background pool that grows before it queues
//! - [`units`]: pooled dispatch and delivery tasks

pub mod affinity;
pub mod context;
pub mod eager_pool;
pub mod units;

pub use affinity::ThreadAffinity;
pub use context::{ContextThread, ExecutionContext, Looper, RejectedTask, WeakContext};
pub use eager_pool::{BackgroundExecutor, EagerPoolConfig, EagerThreadPool, PoolStats};
pub use units::{task, DeliveryUnit, DispatchUnit, FnTask, Runnable, UnitPool};
