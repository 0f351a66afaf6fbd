//! In-process storage medium.
//!
//! Clones share one cell, so several hosts built from clones of the same
//! `MemoryStrategy` behave like tabs over one origin's storage.

use std::sync::{Arc, Mutex};

use crate::error::StorageError;

use super::SessionStoreStrategy;

#[derive(Debug, Clone)]
pub struct MemoryStrategy {
    cell: Arc<Mutex<Option<String>>>,
    locking: bool,
}

impl MemoryStrategy {
    pub fn new(locking: bool) -> Self {
        MemoryStrategy {
            cell: Arc::new(Mutex::new(None)),
            locking,
        }
    }

    /// Current raw blob, bypassing the codec.
    pub fn raw(&self) -> Option<String> {
        self.cell
            .lock()
            .map(|value| value.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Overwrites the raw blob, bypassing the codec. Mirrors another context
    /// writing the medium directly.
    pub fn set_raw(&self, raw: Option<&str>) {
        let mut cell = self
            .cell
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *cell = raw.map(str::to_string);
    }
}

impl SessionStoreStrategy for MemoryStrategy {
    fn supports_locking(&self) -> bool {
        self.locking
    }

    fn retrieve(&self) -> Result<Option<String>, StorageError> {
        let cell = self
            .cell
            .lock()
            .map_err(|_| StorageError::Unavailable("memory cell poisoned".to_string()))?;
        Ok(cell.clone())
    }

    fn persist(&self, raw: &str) -> Result<(), StorageError> {
        let mut cell = self
            .cell
            .lock()
            .map_err(|_| StorageError::Unavailable("memory cell poisoned".to_string()))?;
        *cell = Some(raw.to_string());
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        let mut cell = self
            .cell
            .lock()
            .map_err(|_| StorageError::Unavailable("memory cell poisoned".to_string()))?;
        *cell = None;
        Ok(())
    }
}
