//! Time-bounded exclusive claims.
//!
//! A [`LeaseManager`] stores claims for one namespace. Each claim names a
//! lease, its holder, and an expiry; at most one live claim exists per lease.
//! Which names, holders, and durations are acceptable is decided by the
//! [`Secretary`] the manager was built with.
//!
//! Claims are single conditional commits. Losing a race is reported as
//! [`LeaseError::Denied`] rather than retried; callers that want a lease
//! keep claiming it on a timer.

mod claimer;
mod collector;
mod manager;
mod secretary;

pub use claimer::Claimer;
pub use collector::LeaseExpiryCollector;
use keel_types::{ErrorCode, ErrorKind};
pub use manager::{LeaseInfo, LeaseManager};
pub use secretary::{Secretary, SingularSecretary};
use snafu::Snafu;

use crate::error::StateError;

/// Errors returned by lease operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LeaseError {
    /// The secretary rejected the lease name, holder, or duration.
    #[snafu(display("{message}"))]
    NotValid {
        /// Human readable reason.
        message: String,
    },

    /// Another holder has a live claim, or a concurrent claim won.
    #[snafu(display("lease {lease:?} denied to {holder:?}"))]
    Denied {
        /// Lease name.
        lease: String,
        /// Holder whose request was refused.
        holder: String,
    },

    /// The state session is closed.
    #[snafu(display("lease manager is closed"))]
    Closed,

    /// Reading or writing lease records failed.
    #[snafu(display("lease state error: {source}"))]
    State {
        /// The underlying state error.
        source: StateError,
    },
}

impl From<StateError> for LeaseError {
    fn from(source: StateError) -> Self {
        match source {
            StateError::Closed => LeaseError::Closed,
            source => LeaseError::State { source },
        }
    }
}

impl From<keel_store::Error> for LeaseError {
    fn from(source: keel_store::Error) -> Self {
        StateError::from(source).into()
    }
}

impl LeaseError {
    /// Returns the machine-readable code.
    pub fn code(&self) -> ErrorCode {
        match self {
            LeaseError::NotValid { .. } => ErrorCode::LeaseInvalid,
            LeaseError::Denied { .. } => ErrorCode::LeaseDenied,
            LeaseError::Closed => ErrorCode::StoreClosed,
            LeaseError::State { source } => source.code(),
        }
    }

    /// Returns the taxonomy kind.
    pub fn kind(&self) -> ErrorKind {
        self.code().kind()
    }

    /// Whether the claim was refused because someone else holds the lease.
    pub fn is_denied(&self) -> bool {
        matches!(self, LeaseError::Denied { .. })
    }
}
