//! Lease policy.

use std::{fmt, time::Duration};

use keel_types::validation;

use super::LeaseError;

/// Decides which lease names, holders, and durations a namespace accepts.
///
/// Implementations are stateless and cheap; they run before any storage
/// access.
pub trait Secretary: Send + Sync + fmt::Debug {
    /// Checks a lease name.
    ///
    /// # Errors
    ///
    /// [`LeaseError::NotValid`] if the name is not acceptable.
    fn check_lease(&self, name: &str) -> Result<(), LeaseError>;

    /// Checks a holder name.
    ///
    /// # Errors
    ///
    /// [`LeaseError::NotValid`] if the holder is not acceptable.
    fn check_holder(&self, name: &str) -> Result<(), LeaseError>;

    /// Checks a claim duration.
    ///
    /// # Errors
    ///
    /// [`LeaseError::NotValid`] if the duration is not acceptable.
    fn check_duration(&self, duration: Duration) -> Result<(), LeaseError>;
}

/// Policy for controller singleton leases.
///
/// Lease names must be the controller uuid or the model uuid, holders must
/// be machine tags, and durations must be positive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingularSecretary {
    controller_uuid: String,
    model_uuid: String,
}

impl SingularSecretary {
    /// Creates a policy for one controller and model.
    pub fn new(controller_uuid: impl Into<String>, model_uuid: impl Into<String>) -> Self {
        Self { controller_uuid: controller_uuid.into(), model_uuid: model_uuid.into() }
    }
}

impl Secretary for SingularSecretary {
    fn check_lease(&self, name: &str) -> Result<(), LeaseError> {
        if name != self.controller_uuid && name != self.model_uuid {
            return Err(LeaseError::NotValid {
                message: format!("expected controller or model uuid, got {name:?}"),
            });
        }
        Ok(())
    }

    fn check_holder(&self, name: &str) -> Result<(), LeaseError> {
        if validation::parse_machine_tag(name).is_none() {
            return Err(LeaseError::NotValid {
                message: format!("expected machine tag, got {name:?}"),
            });
        }
        Ok(())
    }

    fn check_duration(&self, duration: Duration) -> Result<(), LeaseError> {
        if duration.is_zero() {
            return Err(LeaseError::NotValid { message: "non-positive lease duration".to_string() });
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use keel_test_utils::{TEST_CONTROLLER_UUID, TEST_MODEL_UUID};

    use super::*;

    fn secretary() -> SingularSecretary {
        SingularSecretary::new(TEST_CONTROLLER_UUID, TEST_MODEL_UUID)
    }

    #[test]
    fn test_lease_names() {
        let s = secretary();
        s.check_lease(TEST_CONTROLLER_UUID).unwrap();
        s.check_lease(TEST_MODEL_UUID).unwrap();
        let err = s.check_lease("other").unwrap_err();
        assert_eq!(err.to_string(), r#"expected controller or model uuid, got "other""#);
    }

    #[test]
    fn test_holder_names() {
        let s = secretary();
        s.check_holder("machine-0").unwrap();
        s.check_holder("machine-1-lxc-2").unwrap();
        assert!(s.check_holder("unit-wordpress-0").is_err());
        assert!(s.check_holder("machine-").is_err());
    }

    #[test]
    fn test_durations() {
        let s = secretary();
        s.check_duration(Duration::from_secs(30)).unwrap();
        let err = s.check_duration(Duration::ZERO).unwrap_err();
        assert_eq!(err.to_string(), "non-positive lease duration");
    }
}
