//! Configuration management for gateway-throttle.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, ThrottleError};
use crate::ratelimit::{TokenBucket, DEFAULT_CAPACITY, DEFAULT_REFILL_PERIOD};

/// Prefix for environment overrides, e.g. `GATEWAY_THROTTLE__LIMITER__CAPACITY`.
const ENV_PREFIX: &str = "GATEWAY_THROTTLE";

/// Main configuration for gateway-throttle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Rate budget shared by the outbound stages
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Outbound pipeline configuration
    #[serde(default)]
    pub outbound: OutboundConfig,
}

/// Rate budget configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Units granted per refill window
    #[serde(default = "default_capacity")]
    pub capacity: u64,

    /// Refill window in milliseconds
    #[serde(default = "default_refill_period_ms")]
    pub refill_period_ms: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_period_ms: default_refill_period_ms(),
        }
    }
}

impl LimiterConfig {
    /// Get the refill window.
    pub fn refill_period(&self) -> Duration {
        Duration::from_millis(self.refill_period_ms)
    }

    /// Build the token bucket described by this configuration.
    pub fn build(&self) -> Result<TokenBucket> {
        TokenBucket::new(self.capacity, self.refill_period())
    }
}

fn default_capacity() -> u64 {
    DEFAULT_CAPACITY
}

fn default_refill_period_ms() -> u64 {
    DEFAULT_REFILL_PERIOD.as_millis() as u64
}

/// Outbound pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundConfig {
    /// Payloads buffered between the pipeline and the writer task
    #[serde(default = "default_buffer")]
    pub buffer: usize,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            buffer: default_buffer(),
        }
    }
}

fn default_buffer() -> usize {
    256
}

impl ThrottleConfig {
    /// Load configuration from a file, applying environment overrides.
    ///
    /// The format is picked from the file extension (YAML, TOML and JSON are
    /// accepted). Variables such as `GATEWAY_THROTTLE__LIMITER__CAPACITY=60`
    /// override the matching file entries.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading throttle configuration");

        let config: ThrottleConfig = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ThrottleConfig = serde_yaml::from_str(yaml)
            .map_err(|e| ThrottleError::Config(format!("Failed to parse throttle config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall or break the pipeline.
    pub fn validate(&self) -> Result<()> {
        if self.limiter.capacity == 0 || self.limiter.refill_period_ms == 0 {
            return Err(ThrottleError::InvalidLimit {
                capacity: self.limiter.capacity,
                refill_period_ms: self.limiter.refill_period_ms,
            });
        }
        if self.outbound.buffer == 0 {
            return Err(ThrottleError::Config(
                "outbound.buffer must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
