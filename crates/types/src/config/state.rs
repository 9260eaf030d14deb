//! Transaction, lease, watcher, and top-level state configuration.

use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use super::{ConfigError, ParseSnafu};

// =============================================================================
// Transaction Configuration
// =============================================================================

/// Default number of commit attempts before reporting contention.
fn default_max_attempts() -> u32 {
    3
}

/// Configuration for the optimistic transaction runner.
///
/// # Example
///
/// ```no_run
/// # use keel_types::config::TxnConfig;
/// let config = TxnConfig::builder().max_attempts(5).build().expect("valid txn config");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TxnConfig {
    /// Commit attempts per operation, counting the first.
    ///
    /// Must be in 1..=100.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[bon::bon]
impl TxnConfig {
    /// Creates a new transaction configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if `max_attempts` is out of range.
    #[builder]
    pub fn new(
        #[builder(default = default_max_attempts())] max_attempts: u32,
    ) -> Result<Self, ConfigError> {
        let config = Self { max_attempts };
        config.validate()?;
        Ok(config)
    }
}

impl TxnConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=100).contains(&self.max_attempts) {
            return Err(ConfigError::Validation {
                message: format!("max_attempts must be in 1..=100, got {}", self.max_attempts),
            });
        }
        Ok(())
    }
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self { max_attempts: default_max_attempts() }
    }
}

// =============================================================================
// Lease Configuration
// =============================================================================

/// Default interval between expired-lease sweeps.
fn default_gc_interval() -> Duration {
    Duration::from_secs(30)
}

/// Default maximum expired leases removed per sweep.
fn default_gc_batch_size() -> usize {
    500
}

/// Default poll interval while waiting for a lease to expire.
fn default_wait_poll_interval() -> Duration {
    Duration::from_millis(250)
}

/// Configuration for lease storage and expiry collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LeaseConfig {
    /// Interval between expired-lease sweeps.
    ///
    /// Must be >= 10ms.
    #[serde(default = "default_gc_interval")]
    #[serde(with = "super::humantime_serde")]
    #[schemars(with = "String")]
    pub gc_interval: Duration,
    /// Maximum expired leases removed per sweep.
    ///
    /// Must be > 0.
    #[serde(default = "default_gc_batch_size")]
    pub gc_batch_size: usize,
    /// How often `wait_until_expired` re-reads the lease.
    ///
    /// Must be >= 1ms.
    #[serde(default = "default_wait_poll_interval")]
    #[serde(with = "super::humantime_serde")]
    #[schemars(with = "String")]
    pub wait_poll_interval: Duration,
}

#[bon::bon]
impl LeaseConfig {
    /// Creates a new lease configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    #[builder]
    pub fn new(
        #[builder(default = default_gc_interval())] gc_interval: Duration,
        #[builder(default = default_gc_batch_size())] gc_batch_size: usize,
        #[builder(default = default_wait_poll_interval())] wait_poll_interval: Duration,
    ) -> Result<Self, ConfigError> {
        let config = Self { gc_interval, gc_batch_size, wait_poll_interval };
        config.validate()?;
        Ok(config)
    }
}

impl LeaseConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gc_interval < Duration::from_millis(10) {
            return Err(ConfigError::Validation {
                message: format!("gc_interval must be >= 10ms, got {:?}", self.gc_interval),
            });
        }
        if self.gc_batch_size == 0 {
            return Err(ConfigError::Validation {
                message: "gc_batch_size must be > 0".to_string(),
            });
        }
        if self.wait_poll_interval < Duration::from_millis(1) {
            return Err(ConfigError::Validation {
                message: format!(
                    "wait_poll_interval must be >= 1ms, got {:?}",
                    self.wait_poll_interval
                ),
            });
        }
        Ok(())
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            gc_interval: default_gc_interval(),
            gc_batch_size: default_gc_batch_size(),
            wait_poll_interval: default_wait_poll_interval(),
        }
    }
}

// =============================================================================
// Watcher Configuration
// =============================================================================

/// Default capacity of each per-collection change channel.
fn default_channel_capacity() -> usize {
    1024
}

/// Configuration for the watcher hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WatcherConfig {
    /// Buffered commit events per collection before slow watchers lag.
    ///
    /// A lagging watcher recomputes from scratch, so this bounds memory,
    /// not correctness. Must be in 16..=1_048_576.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

#[bon::bon]
impl WatcherConfig {
    /// Creates a new watcher configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if `channel_capacity` is out of range.
    #[builder]
    pub fn new(
        #[builder(default = default_channel_capacity())] channel_capacity: usize,
    ) -> Result<Self, ConfigError> {
        let config = Self { channel_capacity };
        config.validate()?;
        Ok(config)
    }
}

impl WatcherConfig {
    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(16..=1_048_576).contains(&self.channel_capacity) {
            return Err(ConfigError::Validation {
                message: format!(
                    "channel_capacity must be in 16..=1048576, got {}",
                    self.channel_capacity
                ),
            });
        }
        Ok(())
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self { channel_capacity: default_channel_capacity() }
    }
}

// =============================================================================
// State Configuration
// =============================================================================

/// Top-level configuration of a state session.
///
/// # Example
///
/// ```no_run
/// # use keel_types::config::{StateConfig, TxnConfig};
/// let config = StateConfig::builder()
///     .controller_uuid("deadbeef-0bad-400d-8000-4b1d0d06f00d".to_string())
///     .model_uuid("deadbeef-0bad-400d-8000-4b1d0d06f00d".to_string())
///     .txn(TxnConfig::builder().max_attempts(5).build().expect("valid"))
///     .build()
///     .expect("valid state config");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StateConfig {
    /// UUID of the controller. Singular leases may be named after it.
    pub controller_uuid: String,
    /// UUID of the hosted model. Singular leases may be named after it.
    pub model_uuid: String,
    /// Transaction runner settings.
    #[serde(default)]
    pub txn: TxnConfig,
    /// Lease settings.
    #[serde(default)]
    pub lease: LeaseConfig,
    /// Watcher settings.
    #[serde(default)]
    pub watcher: WatcherConfig,
}

#[bon::bon]
impl StateConfig {
    /// Creates a new state configuration with validation.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if a uuid is malformed or a nested
    /// config is invalid.
    #[builder]
    pub fn new(
        controller_uuid: String,
        model_uuid: String,
        #[builder(default)] txn: TxnConfig,
        #[builder(default)] lease: LeaseConfig,
        #[builder(default)] watcher: WatcherConfig,
    ) -> Result<Self, ConfigError> {
        let config = Self { controller_uuid, model_uuid, txn, lease, watcher };
        config.validate()?;
        Ok(config)
    }
}

impl StateConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML and
    /// [`ConfigError::Validation`] for out-of-range values.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source).context(ParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if any value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let uuids = [("controller_uuid", &self.controller_uuid), ("model_uuid", &self.model_uuid)];
        for (field, value) in uuids {
            if uuid::Uuid::parse_str(value).is_err() {
                return Err(ConfigError::Validation {
                    message: format!("{field} must be a uuid, got {value:?}"),
                });
            }
        }
        self.txn.validate()?;
        self.lease.validate()?;
        self.watcher.validate()
    }
}
