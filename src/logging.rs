//! # Structured Logging Module
//!
//! Environment-aware `tracing` setup for applications embedding the bus. The library
//! itself only emits events; calling [`init_structured_logging`] is optional.

use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging once per process.
///
/// The filter comes from `EVENT_BUS_LOG`, then `RUST_LOG`, then a default derived from
/// `EVENT_BUS_ENV`. `EVENT_BUS_LOG_FORMAT=json` switches to JSON lines. An already
/// installed global subscriber is left in place.
pub fn init_structured_logging() {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = get_filter(&environment);
        let json = std::env::var("EVENT_BUS_LOG_FORMAT").is_ok_and(|format| format == "json");

        let layer = if json {
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .json()
                .with_filter(EnvFilter::new(filter.clone()))
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_names(true)
                .with_level(true)
                .with_filter(EnvFilter::new(filter.clone()))
                .boxed()
        };

        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized - keeping it");
            return;
        }

        tracing::info!(
            environment = %environment,
            filter = %filter,
            json = json,
            "🔧 Structured logging initialized"
        );
    });
}

fn get_environment() -> String {
    std::env::var("EVENT_BUS_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn get_filter(environment: &str) -> String {
    std::env::var("EVENT_BUS_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| default_level(environment).to_string())
}

fn default_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        "test" => "warn",
        _ => "debug",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_level_per_environment() {
        assert_eq!(default_level("production"), "info");
        assert_eq!(default_level("test"), "warn");
        assert_eq!(default_level("development"), "debug");
        assert_eq!(default_level("staging"), "debug");
    }

    #[test]
    fn test_init_is_idempotent() {
        init_structured_logging();
        init_structured_logging();
        tracing::info!("still logging");
    }
}
