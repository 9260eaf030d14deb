//! In-memory storage backend for testing.

use super::StorageBackend;
use crate::error::Result;

/// In-memory storage backend for testing.
///
/// Nothing is persisted; all data is lost when the database is dropped.
#[derive(Debug, Default, Clone, Copy)]
pub struct InMemoryBackend;

impl InMemoryBackend {
    /// Create a new in-memory backend.
    pub fn new() -> Self {
        Self
    }
}

impl StorageBackend for InMemoryBackend {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn persist(&self, _snapshot: &[u8]) -> Result<()> {
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }
}
