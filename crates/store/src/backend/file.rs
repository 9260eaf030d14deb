//! File-based storage backend.

use std::{
    fs::{self, File},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use snafu::ResultExt;
use tracing::debug;

use super::StorageBackend;
use crate::error::{IoSnafu, Result};

/// Storage backend that keeps one snapshot file on disk.
#[derive(Debug, Clone)]
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    /// Creates a backend persisting to `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the parent directory cannot be created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).context(IoSnafu)?;
        }
        Ok(Self { path })
    }

    /// Returns the snapshot file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl StorageBackend for FileBackend {
    fn load(&self) -> Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(source).context(IoSnafu),
        }
    }

    fn persist(&self, snapshot: &[u8]) -> Result<()> {
        let temp = self.temp_path();
        let mut file = File::create(&temp).context(IoSnafu)?;
        file.write_all(snapshot).context(IoSnafu)?;
        file.sync_all().context(IoSnafu)?;
        fs::rename(&temp, &self.path).context(IoSnafu)?;
        debug!(path = %self.path.display(), bytes = snapshot.len(), "Persisted snapshot");
        Ok(())
    }

    fn is_durable(&self) -> bool {
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_file_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = FileBackend::open(dir.path().join("state.snap")).expect("open");
        assert!(backend.load().expect("load").is_none());
    }

    #[test]
    fn test_persist_replaces_previous_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = FileBackend::open(dir.path().join("nested/state.snap")).expect("open");
        backend.persist(b"first").expect("persist");
        backend.persist(b"second").expect("persist");
        assert_eq!(backend.load().expect("load").as_deref(), Some(&b"second"[..]));
        assert!(!backend.temp_path().exists(), "temp file should be renamed away");
    }
}
