//! Thread affinity declared by each handler.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a handler runs when an event is routed to it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadAffinity {
    /// On whichever thread is running the dispatch: the bus's dispatch thread for
    /// `post*`, the publisher's own thread for `send*`. Best for short handlers.
    CallerThread,
    /// Always on the bus's serial dispatch thread. Runs inline when dispatch already
    /// happens there, otherwise it is queued behind pending posts.
    DispatchThread,
    /// On the bus's background pool; concurrent and unordered.
    Background,
    /// On the process-wide main execution context.
    Main,
    /// On the execution context of the thread that registered the target. Falls back to
    /// `Background` when that thread had no context or the context has since stopped.
    #[default]
    AsRegistered,
}

impl ThreadAffinity {
    /// Whether deliveries run before the dispatching call returns.
    pub fn is_inline(&self) -> bool {
        matches!(self, ThreadAffinity::CallerThread)
    }
}

impl fmt::Display for ThreadAffinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ThreadAffinity::CallerThread => "caller_thread",
            ThreadAffinity::DispatchThread => "dispatch_thread",
            ThreadAffinity::Background => "background",
            ThreadAffinity::Main => "main",
            ThreadAffinity::AsRegistered => "as_registered",
        };
        f.write_str(name)
    }
}
