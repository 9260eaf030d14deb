//! Control-plane state for keel.
//!
//! This crate sits on top of the record store (`keel-store`) and provides:
//!
//! - An optimistic transaction runner that rebuilds a batch after every abort
//! - Machines, services, and units with a monotonic `Alive -> Dying -> Dead`
//!   lifecycle, including containers, provisioning, networks, and addresses
//! - Time-bounded leases arbitrated by a pluggable [`Secretary`]
//! - Coalescing watchers fed by the store's change stream
//!
//! Everything is reached through a [`State`] session:
//!
//! ```no_run
//! use keel_state::{Lifecycle, State};
//! use keel_types::{MachineJob, config::StateConfig};
//!
//! # fn example(config: StateConfig) -> keel_state::Result<()> {
//! let st = State::in_memory(config)?;
//! let mut machine = st.add_machine("trusty", &[MachineJob::HostUnits])?;
//! machine.destroy()?;
//! machine.ensure_dead()?;
//! machine.remove()?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]

mod annotations;
mod cleanup;
mod docs;
mod error;
mod lease;
mod lifecycle;
mod machine;
pub mod metrics;
mod network;
mod service;
mod state;
mod status;
mod txn;
mod unit;
mod watcher;

pub use error::{Blocker, Result, StateError};
pub use lease::{
    Claimer, LeaseError, LeaseExpiryCollector, LeaseInfo, LeaseManager, Secretary,
    SingularSecretary,
};
pub use lifecycle::{Lifecycle, Removal};
pub use machine::{MANUAL_NONCE_PREFIX, Machine, NetworkInterface, NetworkInterfaceInfo};
pub use network::NetworkInfo;
pub use service::Service;
pub use state::{MachineTemplate, SINGULAR_NAMESPACE, State};
pub use txn::{HookCheck, HookFn, TestHook, TxnRunner};
pub use unit::Unit;
pub use watcher::{Coalesce, Watcher};
