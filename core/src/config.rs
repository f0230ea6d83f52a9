//! Configuration types for the fetch engine

use config::{Config, Environment};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::FetchError;
use crate::Result;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Pause between two iterations of the collection loop
    pub poll_interval_ms: u64,
    /// Deadline used when the caller does not bring its own cancellation
    pub request_timeout_ms: u64,
    /// Sort collected records by (partition, offset) before returning
    pub sort_by_offset: bool,
    /// Fail the whole request when any partition reader fails
    pub fail_on_partition_error: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 15,
            request_timeout_ms: 30_000,
            sort_by_offset: false,
            fail_on_partition_error: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `LOOKOUT_*` environment variables,
    /// falling back to defaults for anything unset
    pub fn from_env() -> Result<Self> {
        let settings = Config::builder()
            .add_source(Environment::with_prefix("LOOKOUT").try_parsing(true))
            .build()
            .map_err(|e| FetchError::invalid_config(e.to_string()))?;

        let config = settings
            .try_deserialize::<EngineConfig>()
            .map_err(|e| FetchError::invalid_config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Reject values that would spin the collection loop or cancel instantly
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(FetchError::invalid_config("poll_interval_ms must be > 0"));
        }
        if self.request_timeout_ms == 0 {
            return Err(FetchError::invalid_config("request_timeout_ms must be > 0"));
        }
        Ok(())
    }
}

/// Builder for EngineConfig
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn sort_by_offset(mut self, sort: bool) -> Self {
        self.config.sort_by_offset = sort;
        self
    }

    pub fn fail_on_partition_error(mut self, fail: bool) -> Self {
        self.config.fail_on_partition_error = fail;
        self
    }

    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
