//! # Bus Configuration
//!
//! Serde-backed settings for an [`EventBus`](crate::EventBus). Every field has a default,
//! so an empty source yields a working configuration. Sources are layered through the
//! `config` crate: an optional file first, then `EVENT_BUS_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::thread;
use std::time::Duration;
use tracing::debug;

use crate::error::{BusError, Result};
use crate::execution::EagerPoolConfig;
use crate::execution::units::DEFAULT_POOL_CAPACITY;

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "EVENT_BUS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Bus name used in logs and for the dispatch thread
    pub name: String,
    pub background_core_threads: usize,
    pub background_max_threads: usize,
    pub background_keep_alive_ms: u64,
    /// Execution units retained by the process-wide unit pools
    pub unit_pool_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        let cpus = thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            name: "default".to_string(),
            background_core_threads: 2,
            background_max_threads: (cpus * 2).max(2),
            background_keep_alive_ms: 60_000,
            unit_pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

impl EventBusConfig {
    /// Defaults overridden by `EVENT_BUS_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    /// Settings from `path` (format chosen by extension), then environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::load(Some(path.as_ref()))
    }

    fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
            .build()?;

        let loaded: Self = settings.try_deserialize()?;
        loaded.validate()?;
        debug!(
            config = %serde_json::to_string(&loaded).unwrap_or_else(|_| "<unserializable>".to_string()),
            "Loaded event bus configuration"
        );
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(BusError::InvalidConfig("name must not be empty".to_string()));
        }
        self.pool_config().validate()
    }

    /// Sizing for the bus-owned background pool.
    pub fn pool_config(&self) -> EagerPoolConfig {
        EagerPoolConfig {
            core_threads: self.background_core_threads,
            max_threads: self.background_max_threads,
            keep_alive: Duration::from_millis(self.background_keep_alive_ms),
            thread_name_prefix: format!("{}-background", self.name),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}
