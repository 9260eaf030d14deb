//! Core types, errors, and configuration for the keel control-plane state layer.
//!
//! This crate provides the vocabulary shared by the store and the state layer:
//! - Entity identifiers (machine ids, unit and service names) and tags
//! - The monotonic [`Life`] state and machine jobs
//! - Error kinds and machine-readable codes
//! - Postcard codec helpers
//! - Network address merging
//! - Configuration structs and the [`Clock`] abstraction

#![deny(unsafe_code)]

pub mod address;
pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod types;
pub mod validation;

// Re-export commonly used types at crate root
pub use address::{Address, AddressType, Scope, merge_addresses};
pub use clock::{Clock, SystemClock};
pub use codec::{CodecError, decode, encode};
pub use error::{ErrorCode, ErrorKind};
pub use types::*;
