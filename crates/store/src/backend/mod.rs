//! Storage backend abstraction for the record store.
//!
//! The store keeps its working set in memory. A backend decides whether and
//! where that working set is persisted: the in-memory backend keeps nothing,
//! the file backend rewrites a snapshot file after every commit.
//!
//! # Crash Safety
//!
//! The file backend writes the new snapshot to a sibling temporary file,
//! syncs it, and renames it over the previous snapshot. A crash leaves
//! either the old or the new snapshot in place, never a torn one.

mod file;
mod memory;

pub use file::FileBackend;
pub use memory::InMemoryBackend;

use crate::error::Result;

/// Magic prefix of snapshot files.
pub const MAGIC: &[u8; 8] = b"KEELSNAP";

/// Current snapshot format version.
pub const FORMAT_VERSION: u16 = 1;

/// Storage backend trait for abstracting snapshot persistence.
pub trait StorageBackend: Send + Sync {
    /// Reads the last persisted snapshot, if any.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the read fails.
    fn load(&self) -> Result<Option<Vec<u8>>>;

    /// Replaces the persisted snapshot.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the write or sync fails.
    fn persist(&self, snapshot: &[u8]) -> Result<()>;

    /// Whether [`persist`](Self::persist) should be called at all.
    ///
    /// Backends that drop snapshots return `false` so the store can skip
    /// encoding them.
    fn is_durable(&self) -> bool;
}
