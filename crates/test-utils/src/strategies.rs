//! Proptest strategies for keel domain values.
//!
//! # Usage
//!
//! ```no_run
//! use keel_test_utils::strategies;
//! use proptest::prelude::*;
//!
//! proptest! {
//!     #[test]
//!     fn lifecycle_never_goes_backwards(steps in strategies::arb_lifecycle_steps(20)) {
//!         // drive a machine through `steps` and check its observed life
//!     }
//! }
//! ```

use std::time::Duration;

use keel_types::Address;
use proptest::prelude::*;

/// One step a property test may apply to a machine and its single unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStep {
    /// Assign the unit to the machine.
    AssignUnit,
    /// Unassign the unit.
    UnassignUnit,
    /// `Machine::destroy`.
    Destroy,
    /// `Machine::ensure_dead`.
    EnsureDead,
    /// `Machine::remove`.
    Remove,
    /// `Machine::refresh`.
    Refresh,
}

/// Generates one lifecycle step.
pub fn arb_lifecycle_step() -> impl Strategy<Value = LifecycleStep> {
    prop_oneof![
        Just(LifecycleStep::AssignUnit),
        Just(LifecycleStep::UnassignUnit),
        Just(LifecycleStep::Destroy),
        Just(LifecycleStep::EnsureDead),
        Just(LifecycleStep::Remove),
        Just(LifecycleStep::Refresh),
    ]
}

/// Generates up to `max` lifecycle steps.
pub fn arb_lifecycle_steps(max: usize) -> impl Strategy<Value = Vec<LifecycleStep>> {
    proptest::collection::vec(arb_lifecycle_step(), 1..=max)
}

/// Generates a machine tag such as `machine-3` or `machine-1-lxc-0`.
pub fn arb_machine_tag() -> impl Strategy<Value = String> {
    prop_oneof![
        (0u32..50).prop_map(|n| format!("machine-{n}")),
        (0u32..10, 0u32..5).prop_map(|(p, c)| format!("machine-{p}-lxc-{c}")),
    ]
}

/// Generates a lease name from a small pool, so collisions are common.
pub fn arb_lease_name() -> impl Strategy<Value = String> {
    prop_oneof![Just("ns1".to_string()), Just("ns2".to_string()), "[a-z]{1,8}"]
}

/// Generates a positive lease duration between 1s and 60s.
pub fn arb_lease_duration() -> impl Strategy<Value = Duration> {
    (1u64..=60).prop_map(Duration::from_secs)
}

/// Generates an IPv4, IPv6, or empty address.
pub fn arb_address() -> impl Strategy<Value = Address> {
    prop_oneof![
        (0u8..8, 1u8..8).prop_map(|(a, b)| Address::new(format!("10.0.{a}.{b}"))),
        (1u16..8).prop_map(|a| Address::new(format!("2001:db8::{a}"))),
        Just(Address::new("")),
    ]
}
