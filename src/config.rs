//! Engine configuration.
//!
//! Deployment-policy settings: how to treat ambiguous fetch combinations,
//! and the lock-wait timeout surfaced to the store when a plan requests
//! pessimistic locking. Loaded from `config/config.toml` with
//! environment-variable overrides.

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// What to do when a plan requests two or more to-many fetch paths, which a
/// naive relational join turns into a cross-product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AmbiguousFetchPolicy {
    /// Fail plan building with `AmbiguousFetchCombination`.
    #[default]
    Reject,
    /// Log a warning and build the plan anyway.
    Warn,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub ambiguous_fetch: AmbiguousFetchPolicy,
    /// Forwarded on locking statements for the store to apply; the engine
    /// itself implements no lock management.
    #[serde(default)]
    pub lock_wait_timeout_ms: Option<u64>,
}

impl EngineConfig {
    /// Load from `config/config.toml` (optional), then `QUARRY_*` env vars.
    pub fn load() -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(File::with_name("config/config.toml").required(false))
            .add_source(Environment::with_prefix("QUARRY").separator("__"))
            .build()?;
        match settings.get::<EngineConfig>("engine") {
            Ok(cfg) => Ok(cfg),
            // No `engine` section anywhere: run with defaults.
            Err(ConfigError::NotFound(_)) => Ok(Self::default()),
            Err(err) => Err(ConfigError::Message(format!(
                "engine configuration could not be loaded: {err}"
            ))),
        }
    }
}
