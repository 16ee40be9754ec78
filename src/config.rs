//! Engine configuration
//!
//! Settings are resolved in this order (highest priority first):
//!
//! 1. Environment variables (`BRAID_*`)
//! 2. A JSON config file
//! 3. Built-in defaults
//!
//! | Variable | Maps to |
//! |----------|---------|
//! | `BRAID_MAX_TOKENS` | `max_tokens` |
//! | `BRAID_MAX_CALL_DEPTH` | `max_call_depth` |
//! | `BRAID_GC_INTERVAL` | `gc_interval` |
//! | `BRAID_BLOCKING_WORKERS` | `blocking_workers` |
//! | `BRAID_MAX_PUBLICATIONS` | `max_publications` |

use std::collections::BTreeSet;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::site::Capability;

pub const ENV_MAX_TOKENS: &str = "BRAID_MAX_TOKENS";
pub const ENV_MAX_CALL_DEPTH: &str = "BRAID_MAX_CALL_DEPTH";
pub const ENV_GC_INTERVAL: &str = "BRAID_GC_INTERVAL";
pub const ENV_BLOCKING_WORKERS: &str = "BRAID_BLOCKING_WORKERS";
pub const ENV_MAX_PUBLICATIONS: &str = "BRAID_MAX_PUBLICATIONS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Live tokens (ready and parked) allowed at once
    pub max_tokens: usize,
    /// Longest return-linkage chain allowed
    pub max_call_depth: usize,
    /// Site categories that may be invoked
    pub capabilities: BTreeSet<Capability>,
    /// Heap allocations between collections; 0 disables automatic collection
    pub gc_interval: usize,
    /// Threads in the blocking pool
    pub blocking_workers: usize,
    /// Publications after which the run is stopped; 0 means no limit
    pub max_publications: u64,
    /// How long an idle `run` waits for a site reply before rechecking
    /// pause and terminate requests
    pub idle_poll_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_tokens: 100_000,
            max_call_depth: 10_000,
            capabilities: Capability::ALL.into_iter().collect(),
            gc_interval: 100_000,
            blocking_workers: num_cpus::get(),
            max_publications: 0,
            idle_poll_ms: 10,
        }
    }
}

impl EngineConfig {
    /// Read a JSON config file, then apply environment overrides
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_json(&text)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from any variable source. Only variables that are
    /// present are applied.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(val) = lookup(ENV_MAX_TOKENS) {
            self.max_tokens = parse(ENV_MAX_TOKENS, &val)?;
        }
        if let Some(val) = lookup(ENV_MAX_CALL_DEPTH) {
            self.max_call_depth = parse(ENV_MAX_CALL_DEPTH, &val)?;
        }
        if let Some(val) = lookup(ENV_GC_INTERVAL) {
            self.gc_interval = parse(ENV_GC_INTERVAL, &val)?;
        }
        if let Some(val) = lookup(ENV_BLOCKING_WORKERS) {
            self.blocking_workers = parse(ENV_BLOCKING_WORKERS, &val)?;
        }
        if let Some(val) = lookup(ENV_MAX_PUBLICATIONS) {
            self.max_publications = parse(ENV_MAX_PUBLICATIONS, &val)?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_tokens == 0 {
            return Err(ConfigError::Invalid("max_tokens must be at least 1".into()));
        }
        if self.max_call_depth == 0 {
            return Err(ConfigError::Invalid(
                "max_call_depth must be at least 1".into(),
            ));
        }
        if self.blocking_workers == 0 {
            return Err(ConfigError::Invalid(
                "blocking_workers must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn allows(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_max_call_depth(mut self, max_call_depth: usize) -> Self {
        self.max_call_depth = max_call_depth;
        self
    }

    pub fn with_gc_interval(mut self, gc_interval: usize) -> Self {
        self.gc_interval = gc_interval;
        self
    }

    pub fn with_max_publications(mut self, max_publications: u64) -> Self {
        self.max_publications = max_publications;
        self
    }

    pub fn with_blocking_workers(mut self, blocking_workers: usize) -> Self {
        self.blocking_workers = blocking_workers;
        self
    }

    pub fn with_capabilities(mut self, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        self.capabilities = capabilities.into_iter().collect();
        self
    }
}

fn parse<T: FromStr>(var: &'static str, val: &str) -> Result<T, ConfigError> {
    val.trim().parse::<T>().map_err(|_| ConfigError::Env {
        var,
        value: val.to_string(),
    })
}
