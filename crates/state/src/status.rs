//! Status values agents may set on machines and units.

use std::collections::BTreeMap;

use keel_types::{Status, StatusInfo};

use crate::error::{Result, StateError};

/// Which kind of entity a status is being set on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StatusOwner {
    Machine,
    Unit,
}

/// Checks that an agent may set `status` with `info` on `owner`.
///
/// Machines may go back to `pending` until provisioned; the caller checks that.
pub(crate) fn validate(owner: StatusOwner, status: Status, info: &str) -> Result<()> {
    match (owner, status) {
        (_, Status::Error) if info.is_empty() => {
            Err(StateError::not_valid(format!("cannot set status {:?} without info", "error")))
        },
        (_, Status::Down) => Err(StateError::not_valid(format!("cannot set status {:?}", "down"))),
        (StatusOwner::Unit, Status::Pending) | (StatusOwner::Machine, Status::Installed) => Err(
            StateError::not_valid(format!("cannot set invalid status {:?}", status.as_str())),
        ),
        _ => Ok(()),
    }
}

/// Builds the stored status value.
pub(crate) fn info(status: Status, info: &str, data: BTreeMap<String, String>) -> StatusInfo {
    StatusInfo { status, info: info.to_string(), data }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_error_requires_info() {
        let err = validate(StatusOwner::Machine, Status::Error, "").unwrap_err();
        assert_eq!(err.to_string(), r#"cannot set status "error" without info"#);
        validate(StatusOwner::Machine, Status::Error, "boom").unwrap();
    }

    #[test]
    fn test_derived_and_initial_statuses_are_rejected() {
        let err = validate(StatusOwner::Unit, Status::Down, "").unwrap_err();
        assert_eq!(err.to_string(), r#"cannot set status "down""#);
        let err = validate(StatusOwner::Unit, Status::Pending, "").unwrap_err();
        assert_eq!(err.to_string(), r#"cannot set invalid status "pending""#);
        let err = validate(StatusOwner::Machine, Status::Installed, "").unwrap_err();
        assert_eq!(err.to_string(), r#"cannot set invalid status "installed""#);
        validate(StatusOwner::Unit, Status::Installed, "").unwrap();
        validate(StatusOwner::Machine, Status::Pending, "").unwrap();
        validate(StatusOwner::Machine, Status::Started, "").unwrap();
    }
}
