//! The lifecycle contract shared by machines and units.
//!
//! Life only moves forward: `Alive -> Dying -> Dead`, then the record is
//! deleted. Each transition is a guarded transaction whose assertions
//! re-check, inside the commit, the same facts the caller read. A
//! transition that finds the entity already at or past its target is a
//! successful no-op.

use keel_types::Life;

use crate::error::Result;

/// Outcome of a successful `remove`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// This call deleted the record.
    Deleted,
    /// The record was already gone.
    AlreadyGone,
}

/// Lifecycle operations of an entity handle.
///
/// Handles cache the last document they read; every method that commits
/// refreshes the cached life on success.
pub trait Lifecycle {
    /// Life as of the last read.
    fn life(&self) -> Life;

    /// Starts tearing the entity down.
    ///
    /// # Errors
    ///
    /// `Blocked` when a structural fact forbids it, `Contention` when the
    /// retry budget runs out.
    fn destroy(&mut self) -> Result<()>;

    /// Marks the entity finished.
    ///
    /// # Errors
    ///
    /// Same as [`destroy`](Self::destroy).
    fn ensure_dead(&mut self) -> Result<()>;

    /// Deletes a dead entity and its satellite records.
    ///
    /// # Errors
    ///
    /// `Blocked` with `NotDead` if the entity is still alive or dying.
    fn remove(&mut self) -> Result<Removal>;

    /// Re-reads the entity.
    ///
    /// # Errors
    ///
    /// `NotFound` once the record has been deleted.
    fn refresh(&mut self) -> Result<()>;
}
