//! Claim-only view of a lease namespace.

use std::time::Duration;

use keel_store::{InMemoryBackend, StorageBackend};

use super::{LeaseError, LeaseManager};

/// Narrow handle given to workers that only need to hold leases.
///
/// Workers claim on a timer shorter than the lease duration; a
/// [`LeaseError::Denied`] means another holder has it and the worker should
/// [`wait_until_expired`](Self::wait_until_expired) before trying again.
#[derive(Debug, Clone)]
pub struct Claimer<B: StorageBackend = InMemoryBackend> {
    manager: LeaseManager<B>,
}

impl<B: StorageBackend + 'static> Claimer<B> {
    /// Wraps `manager`.
    pub fn new(manager: LeaseManager<B>) -> Self {
        Self { manager }
    }

    /// Claims or extends `name` for `holder`.
    ///
    /// # Errors
    ///
    /// See [`LeaseManager::claim`].
    pub fn claim_lease(&self, name: &str, holder: &str, duration: Duration) -> Result<(), LeaseError> {
        self.manager.claim(name, holder, duration)
    }

    /// Resolves once `name` has no live claim.
    ///
    /// # Errors
    ///
    /// [`LeaseError::Closed`] if the session closes first.
    pub async fn wait_until_expired(&self, name: &str) -> Result<(), LeaseError> {
        self.manager.wait_until_expired(name).await
    }

    /// The underlying manager.
    pub fn manager(&self) -> &LeaseManager<B> {
        &self.manager
    }
}
