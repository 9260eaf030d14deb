//! Test configuration helpers.
//!
//! Centralizes the values tests would otherwise repeat: fixed uuids and
//! a fast lease sweep.

use std::time::Duration;

use keel_types::config::{LeaseConfig, StateConfig, TxnConfig, WatcherConfig};

/// Controller uuid used by [`test_state_config`].
pub const TEST_CONTROLLER_UUID: &str = "deadbeef-0bad-400d-8000-4b1d0d06f00d";

/// Model uuid used by [`test_state_config`].
pub const TEST_MODEL_UUID: &str = "c0ffee00-1234-4567-89ab-cdef01234567";

/// Returns a state configuration suitable for tests.
///
/// - `max_attempts`: 3 (the production default, so contention tests count hooks exactly)
/// - `gc_interval`: 20ms, `wait_poll_interval`: 5ms (fast lease tests)
/// - `channel_capacity`: 64
#[must_use]
pub fn test_state_config() -> StateConfig {
    StateConfig {
        controller_uuid: TEST_CONTROLLER_UUID.to_string(),
        model_uuid: TEST_MODEL_UUID.to_string(),
        txn: TxnConfig::default(),
        lease: LeaseConfig {
            gc_interval: Duration::from_millis(20),
            gc_batch_size: 100,
            wait_poll_interval: Duration::from_millis(5),
        },
        watcher: WatcherConfig { channel_capacity: 64 },
    }
}

/// Returns [`test_state_config`] with a different retry bound.
#[must_use]
pub fn test_state_config_with_attempts(max_attempts: u32) -> StateConfig {
    StateConfig { txn: TxnConfig { max_attempts }, ..test_state_config() }
}

/// Returns a random uuid string, for tests that need distinct models.
#[must_use]
pub fn random_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}
