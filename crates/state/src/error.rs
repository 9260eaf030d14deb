//! Error types for the state layer.
//!
//! [`StateError`] is returned by every entity operation. Lifecycle refusals
//! carry a [`Blocker`] naming the reason and the offending ids, so callers
//! can render them or act on them without parsing messages.

use keel_types::{ErrorCode, ErrorKind, MachineId, UnitName};
use snafu::Snafu;

/// Result type alias for state operations.
pub type Result<T, E = StateError> = std::result::Result<T, E>;

/// Why a lifecycle transition was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Blocker {
    /// The machine manages the environment and can never leave `Alive`.
    Required,
    /// The machine hosts these containers.
    HasContainers(Vec<MachineId>),
    /// These principal units are assigned to the machine.
    HasAssignedUnits(Vec<UnitName>),
    /// The machine is a voting member of the controller replica set.
    HasVote,
    /// The unit has these subordinates.
    HasSubordinates(Vec<UnitName>),
    /// Removal requires the entity to be dead first.
    NotDead,
}

impl Blocker {
    /// Ids of the dependents that block the transition.
    pub fn offending_ids(&self) -> Vec<String> {
        match self {
            Blocker::HasContainers(ids) => ids.iter().map(ToString::to_string).collect(),
            Blocker::HasAssignedUnits(names) | Blocker::HasSubordinates(names) => {
                names.iter().map(ToString::to_string).collect()
            },
            Blocker::Required | Blocker::HasVote | Blocker::NotDead => Vec::new(),
        }
    }

    fn describe(&self, entity: &str) -> String {
        match self {
            Blocker::Required => format!("{entity} is required by the environment"),
            Blocker::HasContainers(ids) => {
                let joined = ids.iter().map(MachineId::as_str).collect::<Vec<_>>().join(",");
                format!("{entity} is hosting containers {joined:?}")
            },
            Blocker::HasAssignedUnits(names) => {
                let first = names.first().map(UnitName::as_str).unwrap_or_default();
                format!("{entity} has unit {first:?} assigned")
            },
            Blocker::HasVote => format!("{entity} is a voting replica set member"),
            Blocker::HasSubordinates(names) => {
                let joined = names.iter().map(UnitName::as_str).collect::<Vec<_>>().join(",");
                format!("{entity} has subordinates {joined:?}")
            },
            Blocker::NotDead => {
                let kind = entity.split_once(' ').map_or(entity, |(kind, _)| kind);
                format!("cannot remove {entity}: {kind} is not dead")
            },
        }
    }
}

fn contention_message(context: &str) -> String {
    if context.is_empty() {
        "state changing too quickly; try again soon".to_string()
    } else {
        format!("{context}: state changing too quickly; try again soon")
    }
}

/// Errors returned by state operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StateError {
    /// The entity or record does not exist.
    #[snafu(display("{what} not found"))]
    NotFound {
        /// Description of the missing entity, e.g. `machine 2`.
        what: String,
    },

    /// The machine has no provisioned instance.
    #[snafu(display("machine {machine} not provisioned"))]
    NotProvisioned {
        /// Machine id.
        machine: MachineId,
    },

    /// Malformed argument or a disallowed change.
    #[snafu(display("{message}"))]
    NotValid {
        /// Human readable reason.
        message: String,
    },

    /// A create collided with an existing record.
    #[snafu(display("{message}"))]
    AlreadyExists {
        /// Human readable reason.
        message: String,
    },

    /// A lifecycle precondition does not hold.
    #[snafu(display("{}", reason.describe(entity)))]
    Blocked {
        /// The entity, e.g. `machine 1`.
        entity: String,
        /// What blocks the transition.
        reason: Blocker,
    },

    /// Every attempt of an optimistic transaction aborted.
    #[snafu(display("{}", contention_message(context)))]
    Contention {
        /// What was being attempted, e.g. `machine 1 cannot advance lifecycle`.
        context: String,
    },

    /// The session refused the write.
    #[snafu(display("unauthorized: {message}"))]
    Unauthorized {
        /// Why the write was refused.
        message: String,
    },

    /// The state session or subscription is closed.
    #[snafu(display("state is closed"))]
    Closed,

    /// The record store failed.
    #[snafu(display("store error: {source}"))]
    Store {
        /// The underlying store error.
        source: keel_store::Error,
    },
}

impl From<keel_store::Error> for StateError {
    fn from(source: keel_store::Error) -> Self {
        match source {
            keel_store::Error::Closed => StateError::Closed,
            keel_store::Error::Unauthorized { message } => StateError::Unauthorized { message },
            source => StateError::Store { source },
        }
    }
}

impl StateError {
    /// Returns the machine-readable code.
    pub fn code(&self) -> ErrorCode {
        match self {
            StateError::NotFound { .. } => ErrorCode::NotFound,
            StateError::NotProvisioned { .. } => ErrorCode::NotProvisioned,
            StateError::NotValid { .. } => ErrorCode::NotValid,
            StateError::AlreadyExists { .. } => ErrorCode::AlreadyExists,
            StateError::Blocked { reason: Blocker::NotDead, .. } => ErrorCode::NotDead,
            StateError::Blocked { .. } => ErrorCode::Blocked,
            StateError::Contention { .. } => ErrorCode::Contention,
            StateError::Unauthorized { .. } => ErrorCode::Unauthorized,
            StateError::Closed => ErrorCode::StoreClosed,
            StateError::Store { source } => source.code(),
        }
    }

    /// Returns the taxonomy kind.
    pub fn kind(&self) -> ErrorKind {
        self.code().kind()
    }

    /// Whether this error means the entity is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::NotFound { .. })
    }

    /// Returns the blocking reason, if this is a lifecycle refusal.
    pub fn blocker(&self) -> Option<&Blocker> {
        match self {
            StateError::Blocked { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// Attaches what was being attempted to a contention error.
    ///
    /// Other errors are returned unchanged.
    #[must_use]
    pub fn with_context(self, what: impl Into<String>) -> Self {
        match self {
            StateError::Contention { context } if context.is_empty() => {
                StateError::Contention { context: what.into() }
            },
            other => other,
        }
    }

    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        StateError::NotFound { what: what.into() }
    }

    pub(crate) fn not_valid(message: impl Into<String>) -> Self {
        StateError::NotValid { message: message.into() }
    }

    pub(crate) fn blocked(entity: impl Into<String>, reason: Blocker) -> Self {
        StateError::Blocked { entity: entity.into(), reason }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_messages() {
        let err = StateError::blocked("machine 0", Blocker::Required);
        assert_eq!(err.to_string(), "machine 0 is required by the environment");

        let err = StateError::blocked(
            "machine 1",
            Blocker::HasContainers(vec![MachineId::new("1/lxc/0")]),
        );
        assert_eq!(err.to_string(), r#"machine 1 is hosting containers "1/lxc/0""#);

        let err = StateError::blocked(
            "machine 1",
            Blocker::HasAssignedUnits(vec![UnitName::new("wordpress/0")]),
        );
        assert_eq!(err.to_string(), r#"machine 1 has unit "wordpress/0" assigned"#);

        let err = StateError::blocked("machine 1", Blocker::HasVote);
        assert_eq!(err.to_string(), "machine 1 is a voting replica set member");

        let err = StateError::blocked("machine 1", Blocker::NotDead);
        assert_eq!(err.to_string(), "cannot remove machine 1: machine is not dead");
        assert_eq!(err.code(), ErrorCode::NotDead);
        assert_eq!(err.kind(), ErrorKind::Blocked);
    }

    #[test]
    fn test_offending_ids() {
        let blocker = Blocker::HasContainers(vec![MachineId::new("1/lxc/0"), MachineId::new("1/kvm/0")]);
        assert_eq!(blocker.offending_ids(), vec!["1/lxc/0", "1/kvm/0"]);
        assert!(Blocker::HasVote.offending_ids().is_empty());
    }

    #[test]
    fn test_contention_context() {
        let err = StateError::Contention { context: String::new() };
        assert_eq!(err.to_string(), "state changing too quickly; try again soon");
        let err = err.with_context("machine 1 cannot advance lifecycle");
        assert_eq!(
            err.to_string(),
            "machine 1 cannot advance lifecycle: state changing too quickly; try again soon"
        );
        assert!(err.code().is_retryable());

        let other = StateError::not_found("machine 3").with_context("ignored");
        assert_eq!(other.to_string(), "machine 3 not found");
    }

    #[test]
    fn test_store_errors_map_onto_state_errors() {
        assert!(matches!(StateError::from(keel_store::Error::Closed), StateError::Closed));
        let err = StateError::from(keel_store::Error::Unauthorized { message: "ro".into() });
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        let err = StateError::from(keel_store::Error::Corrupted { reason: "x".into() });
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
