/// Adapter configuration
///
/// Loaded from defaults or from `TETHER_*` environment variables.

use serde::Deserialize;
use std::env;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Result, TetherError};

/// Deliveries between forced yields during a range read.
pub const DEFAULT_YIELD_EVERY: usize = 200;

/// Where the remote engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    /// Dedicated OS thread, frames over a channel.
    Threaded,
    /// Same process and thread pool as the adapter.
    Inline,
}

impl FromStr for EngineMode {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "threaded" => Ok(EngineMode::Threaded),
            "inline" => Ok(EngineMode::Inline),
            other => Err(TetherError::ConfigError(format!("unknown engine mode '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Sent to the engine during setup.
    pub instance_id: String,
    pub engine_mode: EngineMode,
    pub yield_every: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            engine_mode: EngineMode::Threaded,
            yield_every: DEFAULT_YIELD_EVERY,
        }
    }
}

impl AdapterConfig {
    /// Defaults overridden by `TETHER_INSTANCE_ID`, `TETHER_ENGINE_MODE`
    /// and `TETHER_YIELD_EVERY`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(id) = env::var("TETHER_INSTANCE_ID") {
            config.instance_id = id;
        }
        if let Ok(mode) = env::var("TETHER_ENGINE_MODE") {
            config.engine_mode = mode.parse()?;
        }
        if let Ok(value) = env::var("TETHER_YIELD_EVERY") {
            config.yield_every = value.parse().map_err(|_| {
                TetherError::ConfigError(format!("TETHER_YIELD_EVERY must be a number, got '{}'", value))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_engine_mode(mut self, mode: EngineMode) -> Self {
        self.engine_mode = mode;
        self
    }

    pub fn with_yield_every(mut self, yield_every: usize) -> Self {
        self.yield_every = yield_every;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.yield_every == 0 {
            return Err(TetherError::ConfigError("yield_every must be at least 1".to_string()));
        }
        if self.instance_id.is_empty() {
            return Err(TetherError::ConfigError("instance_id must not be empty".to_string()));
        }
        Ok(())
    }
}
