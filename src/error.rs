//! # Error Types
//!
//! Two families of errors exist on the bus:
//!
//! - [`BusError`]: synchronous failures returned from the call that caused them
//!   (malformed handler declarations, invalid configuration, context misuse).
//! - [`HandlerError`]: failures raised inside a handler body. These never reach a
//!   publisher; they are routed to the bus's
//!   [`SubscriberExceptionHandler`](crate::bus::SubscriberExceptionHandler).

use std::error::Error as StdError;

/// Boxed error type accepted from handler bodies.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Errors returned synchronously by bus operations
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// A subscriber type declared a malformed handler
    #[error("Configuration error in {subscriber}: {reason}")]
    Configuration { subscriber: String, reason: String },

    /// Configuration values failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The calling thread already drives an execution context
    #[error("Thread '{thread}' is already bound to an execution context")]
    ContextAlreadyBound { thread: String },

    /// The process-wide main context was installed twice
    #[error("Main execution context is already installed")]
    MainContextInstalled,

    /// An OS thread could not be started
    #[error("Failed to spawn thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),

    /// Configuration sources could not be read or deserialized
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),
}

impl BusError {
    pub(crate) fn configuration(subscriber: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            subscriber: subscriber.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BusError>;

/// A failure raised while a handler was running
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The handler returned an error
    #[error("{0}")]
    Failed(BoxError),

    /// The handler panicked; the payload message is preserved when it is a string
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    /// The original error returned by the handler, if it returned one.
    pub fn source_error(&self) -> Option<&(dyn StdError + Send + Sync + 'static)> {
        match self {
            HandlerError::Failed(err) => Some(err.as_ref()),
            HandlerError::Panicked(_) => None,
        }
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        HandlerError::Panicked(message)
    }
}
