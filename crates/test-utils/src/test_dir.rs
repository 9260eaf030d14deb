//! Temporary directories for file-backed stores.

// Test utilities are expected to panic on failure - that's their purpose
#![allow(clippy::expect_used)]

use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// File name used for store snapshots inside a [`TestDir`].
const SNAPSHOT_FILE: &str = "state.snap";

/// A temporary directory removed when dropped.
///
/// # Example
///
/// ```
/// use keel_test_utils::TestDir;
///
/// let dir = TestDir::new();
/// let snapshot = dir.snapshot_path();
/// assert!(snapshot.starts_with(dir.path()));
/// ```
pub struct TestDir {
    inner: TempDir,
}

impl TestDir {
    /// Creates a fresh directory under the system temp root.
    ///
    /// # Panics
    ///
    /// Panics if the directory cannot be created.
    #[must_use]
    pub fn new() -> Self {
        Self { inner: tempfile::Builder::new().prefix("keel-").tempdir().expect("create temp dir") }
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    /// Returns `path` resolved inside the directory.
    #[must_use]
    pub fn join<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        self.path().join(path)
    }

    /// Returns the conventional snapshot location for a file-backed store.
    #[must_use]
    pub fn snapshot_path(&self) -> PathBuf {
        self.join(SNAPSHOT_FILE)
    }
}

impl Default for TestDir {
    fn default() -> Self {
        Self::new()
    }
}
