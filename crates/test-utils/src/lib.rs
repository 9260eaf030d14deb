//! Shared test utilities for keel crates.
//!
//! - [`TestDir`] - Temporary directory for file-backed stores
//! - [`assert_eventually`] - Poll a condition until it's true or timeout
//! - [`ManualClock`] - Clock advanced by hand for lease expiry
//! - [`test_state_config`] - State configuration with fast sweeps
//! - [`strategies`] - Proptest generators for lifecycle steps, tags, and addresses
//! - [`init_tracing`] - Captured log output for tests

#![deny(unsafe_code)]
// Test utilities are allowed to use unwrap for simplicity
#![cfg_attr(test, allow(clippy::disallowed_methods))]

mod test_dir;
pub use test_dir::TestDir;

mod assertions;
pub use assertions::assert_eventually;

mod clock;
pub use clock::ManualClock;

mod config;
pub use config::{
    TEST_CONTROLLER_UUID, TEST_MODEL_UUID, random_uuid, test_state_config,
    test_state_config_with_attempts,
};

pub mod strategies;

mod logging;
pub use logging::init_tracing;
