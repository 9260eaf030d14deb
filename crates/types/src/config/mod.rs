//! Configuration types for the keel state layer.
//!
//! Configuration is loaded from TOML. All config structs validate their
//! values at construction time via fallible builders. Post-deserialization
//! validation is available via the `validate()` method on each struct.

// The schemars `JsonSchema` derive macro internally uses `.unwrap()` in its
// expansions.
#![allow(clippy::disallowed_methods)]

mod state;

use snafu::Snafu;
pub use state::*;

/// Configuration validation error.
///
/// Returned when a configuration value is outside its valid range, violates a
/// cross-field constraint, or the TOML source cannot be parsed.
#[derive(Debug, Snafu)]
pub enum ConfigError {
    /// A configuration value is invalid.
    #[snafu(display("invalid config: {message}"))]
    Validation {
        /// Description of the validation failure.
        message: String,
    },

    /// The TOML document could not be parsed.
    #[snafu(display("invalid config file: {source}"))]
    Parse {
        /// The underlying TOML error.
        source: toml::de::Error,
    },
}

impl ConfigError {
    /// Returns the machine-readable code.
    pub fn code(&self) -> crate::ErrorCode {
        crate::ErrorCode::Config
    }
}

/// Duration serialization using humantime format.
mod humantime_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
