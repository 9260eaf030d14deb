//! Error classification shared by every keel crate.
//!
//! Concrete error enums live next to the code that raises them
//! (`keel_store::Error`, `keel_state::StateError`, `keel_state::LeaseError`).
//! Each of them maps its variants onto an [`ErrorKind`], the coarse taxonomy
//! callers branch on, and an [`ErrorCode`], a stable numeric identifier with a
//! retryability classification and a suggested recovery action.

use core::fmt;

/// Coarse error taxonomy.
///
/// Callers decide what to do from the kind alone: render a `Blocked` reason,
/// back off and retry after `Contention`, poll again after `Denied`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The entity or record is absent.
    NotFound,
    /// An argument is malformed or an attribute change is not permitted.
    NotValid,
    /// A create collided with an existing record.
    AlreadyExists,
    /// A lifecycle precondition is violated; carries a reason and ids.
    Blocked,
    /// The retry budget for an optimistic transaction was exhausted.
    Contention,
    /// A lease claim was rejected because another holder has it.
    Denied,
    /// A credential or policy check rejected the operation.
    Unauthorized,
    /// The session or subscription has been torn down.
    Closed,
    /// Encoding, persistence, or an invariant violation inside the store.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "not found",
            ErrorKind::NotValid => "not valid",
            ErrorKind::AlreadyExists => "already exists",
            ErrorKind::Blocked => "blocked",
            ErrorKind::Contention => "contention",
            ErrorKind::Denied => "denied",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Closed => "closed",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Machine-readable error codes.
///
/// | Range     | Domain                                   |
/// |-----------|------------------------------------------|
/// | 1000–1099 | Store (persistence, aborts, closed)      |
/// | 2000–2099 | Lifecycle (not found, blocked, contention) |
/// | 3000–3099 | Leases                                   |
/// | 4000–4099 | Codec and configuration                  |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    // --- Store (1000–1099) ---
    /// Backend read or write failed.
    StoreIo = 1000,
    /// Conditional batch aborted because an assertion did not hold.
    StoreAborted = 1001,
    /// The store session is closed.
    StoreClosed = 1002,
    /// A persisted snapshot could not be interpreted.
    StoreCorrupted = 1003,

    // --- Lifecycle (2000–2099) ---
    /// Entity not found.
    NotFound = 2000,
    /// Machine has no instance yet.
    NotProvisioned = 2001,
    /// Invalid argument or disallowed attribute change.
    NotValid = 2002,
    /// Duplicate create.
    AlreadyExists = 2003,
    /// Lifecycle transition blocked by a structural condition.
    Blocked = 2004,
    /// Operation requires the entity to be dead first.
    NotDead = 2005,
    /// Retry budget exhausted.
    Contention = 2006,
    /// Caller lacks permission.
    Unauthorized = 2007,

    // --- Leases (3000–3099) ---
    /// Another holder has a live claim.
    LeaseDenied = 3000,
    /// Lease name, holder, or duration rejected by policy.
    LeaseInvalid = 3001,

    // --- Codec and configuration (4000–4099) ---
    /// Serialization or deserialization error.
    Codec = 4000,
    /// Configuration value out of range.
    Config = 4001,
}

impl ErrorCode {
    /// Returns the numeric code value.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Converts a numeric code to an `ErrorCode`, returning `None` for unknown values.
    #[must_use]
    pub const fn from_u16(value: u16) -> Option<Self> {
        let code = match value {
            1000 => ErrorCode::StoreIo,
            1001 => ErrorCode::StoreAborted,
            1002 => ErrorCode::StoreClosed,
            1003 => ErrorCode::StoreCorrupted,
            2000 => ErrorCode::NotFound,
            2001 => ErrorCode::NotProvisioned,
            2002 => ErrorCode::NotValid,
            2003 => ErrorCode::AlreadyExists,
            2004 => ErrorCode::Blocked,
            2005 => ErrorCode::NotDead,
            2006 => ErrorCode::Contention,
            2007 => ErrorCode::Unauthorized,
            3000 => ErrorCode::LeaseDenied,
            3001 => ErrorCode::LeaseInvalid,
            4000 => ErrorCode::Codec,
            4001 => ErrorCode::Config,
            _ => return None,
        };
        Some(code)
    }

    /// Returns the taxonomy kind this code belongs to.
    #[must_use]
    pub const fn kind(self) -> ErrorKind {
        match self {
            ErrorCode::StoreIo | ErrorCode::StoreCorrupted | ErrorCode::Codec => {
                ErrorKind::Internal
            },
            ErrorCode::StoreAborted | ErrorCode::Contention => ErrorKind::Contention,
            ErrorCode::StoreClosed => ErrorKind::Closed,
            ErrorCode::NotFound | ErrorCode::NotProvisioned => ErrorKind::NotFound,
            ErrorCode::NotValid | ErrorCode::LeaseInvalid | ErrorCode::Config => {
                ErrorKind::NotValid
            },
            ErrorCode::AlreadyExists => ErrorKind::AlreadyExists,
            ErrorCode::Blocked | ErrorCode::NotDead => ErrorKind::Blocked,
            ErrorCode::Unauthorized => ErrorKind::Unauthorized,
            ErrorCode::LeaseDenied => ErrorKind::Denied,
        }
    }

    /// Whether the same call may succeed if repeated later without caller changes.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::StoreAborted
                | ErrorCode::Contention
                | ErrorCode::LeaseDenied
                | ErrorCode::StoreIo
        )
    }

    /// Short human-readable hint for operators.
    #[must_use]
    pub const fn suggested_action(self) -> &'static str {
        match self {
            ErrorCode::StoreIo => "Check the data directory and retry",
            ErrorCode::StoreAborted => "Re-read current state and retry the transaction",
            ErrorCode::StoreClosed => "Reopen the state session",
            ErrorCode::StoreCorrupted => "Restore the data directory from a backup",
            ErrorCode::NotFound => "Verify the entity id; it may have been removed",
            ErrorCode::NotProvisioned => "Wait for the provisioner to start an instance",
            ErrorCode::NotValid => "Correct the argument and retry",
            ErrorCode::AlreadyExists => "Use the existing entity or choose another name",
            ErrorCode::Blocked => "Clear the blocking dependents, then retry",
            ErrorCode::NotDead => "Destroy the entity and wait for it to become dead",
            ErrorCode::Contention => "State is changing quickly; retry shortly",
            ErrorCode::Unauthorized => "Check credentials and permissions",
            ErrorCode::LeaseDenied => "Another holder owns the lease; retry after it expires",
            ErrorCode::LeaseInvalid => "Use a permitted lease name, holder, and duration",
            ErrorCode::Codec => "Report this as a bug; stored data could not be read",
            ErrorCode::Config => "Fix the configuration value and restart",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}
