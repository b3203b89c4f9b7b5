//! Layered kernel configuration, built with the `config` crate.
//!
//! Defaults apply unless overridden by a `KERNEL_` environment variable or
//! a `kernel.toml`/`kernel.yaml` file in the current directory.

use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Max outstanding-invocation rounds `processFlow` will drive before
    /// giving up and returning a no-responder error.
    pub quiescence_budget: u32,
    /// Per-invocation transport timeout in milliseconds.
    pub invocation_timeout_ms: u64,
    /// Lite-query snapshot TTL in milliseconds.
    pub lite_query_ttl_ms: u64,
    /// Max age of a pending entry before it's evicted regardless of
    /// availability.
    pub pending_max_age_ms: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            quiescence_budget: 64,
            invocation_timeout_ms: 5_000,
            lite_query_ttl_ms: 1_000,
            pending_max_age_ms: 24 * 60 * 60 * 1_000,
        }
    }
}

impl KernelConfig {
    /// Load defaults overlaid with `kernel.{toml,yaml,json}` (if present)
    /// and `KERNEL_*` environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let defaults = Self::default();
        let built = config::Config::builder()
            .set_default("quiescence_budget", defaults.quiescence_budget)?
            .set_default("invocation_timeout_ms", defaults.invocation_timeout_ms)?
            .set_default("lite_query_ttl_ms", defaults.lite_query_ttl_ms)?
            .set_default("pending_max_age_ms", defaults.pending_max_age_ms)?
            .add_source(config::File::with_name("kernel").required(false))
            .add_source(config::Environment::with_prefix("KERNEL"))
            .build()?;
        built.try_deserialize()
    }

    pub fn invocation_timeout(&self) -> Duration {
        Duration::from_millis(self.invocation_timeout_ms)
    }

    pub fn lite_query_ttl(&self) -> Duration {
        Duration::from_millis(self.lite_query_ttl_ms)
    }

    pub fn pending_max_age(&self) -> Duration {
        Duration::from_millis(self.pending_max_age_ms)
    }
}
