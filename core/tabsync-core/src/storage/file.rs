//! File-backed storage medium.
//!
//! Any number of processes may share the file, so locking is always on.
//!
//! # Atomic Writes
//!
//! Uses temp file + rename so a reader never observes a half-written blob.
//! Rename gives no compare-and-swap though; concurrent writers still race and
//! the last rename wins.

use std::io::Write;
use std::path::{Path, PathBuf};

use fs_err as fs;
use tempfile::NamedTempFile;

use crate::error::StorageError;

use super::{SessionStoreStrategy, SESSION_STORE_KEY};

#[derive(Debug, Clone)]
pub struct FileStrategy {
    path: PathBuf,
}

impl FileStrategy {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileStrategy { path: path.into() }
    }

    /// Stores the blob as `{dir}/_tabsync_s`.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(SESSION_STORE_KEY))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SessionStoreStrategy for FileStrategy {
    fn supports_locking(&self) -> bool {
        true
    }

    fn retrieve(&self) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(&self.path) {
            Ok(content) if content.trim().is_empty() => Ok(None),
            Ok(content) => Ok(Some(content.trim().to_string())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StorageError::io("read session file", err)),
        }
    }

    fn persist(&self, raw: &str) -> Result<(), StorageError> {
        let parent_dir = self.path.parent().ok_or_else(|| {
            StorageError::Unavailable(format!(
                "session file has no parent directory: {}",
                self.path.display()
            ))
        })?;
        fs::create_dir_all(parent_dir)
            .map_err(|err| StorageError::io("create session directory", err))?;

        let mut temp_file = NamedTempFile::new_in(parent_dir)
            .map_err(|err| StorageError::io("create temp session file", err))?;
        temp_file
            .write_all(raw.as_bytes())
            .map_err(|err| StorageError::io("write temp session file", err))?;
        temp_file
            .flush()
            .map_err(|err| StorageError::io("flush temp session file", err))?;
        temp_file
            .persist(&self.path)
            .map_err(|err| StorageError::io("commit session file", err.error))?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::io("remove session file", err)),
        }
    }
}
