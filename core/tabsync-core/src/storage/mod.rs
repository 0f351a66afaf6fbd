//! Storage strategies for the shared session blob.
//!
//! A strategy reads and writes one opaque string at a well-known key. It
//! offers **no** atomicity: two contexts persisting at once may interleave
//! arbitrarily, and a read may observe another context's write at any time.
//! Mutual exclusion is layered on top by [`crate::operations`].
//!
//! [`SessionStorage`] is the typed facade the rest of the crate uses. It
//! decodes blobs and absorbs every strategy error: a failed read is an empty
//! session, a failed write is a logged no-op.

mod file;
mod memory;

use std::sync::Arc;

use tracing::warn;

use crate::error::StorageError;
use crate::state::{self, SessionState};

pub use file::FileStrategy;
pub use memory::MemoryStrategy;

/// Name of the blob shared by every product on the page.
pub const SESSION_STORE_KEY: &str = "_tabsync_s";

/// Contract every storage medium must satisfy.
pub trait SessionStoreStrategy: Send + Sync {
    /// Whether several independent writers may race on this medium, in which
    /// case operations go through the optimistic lock protocol.
    fn supports_locking(&self) -> bool;

    fn retrieve(&self) -> Result<Option<String>, StorageError>;

    fn persist(&self, raw: &str) -> Result<(), StorageError>;

    fn clear(&self) -> Result<(), StorageError>;
}

/// Typed, failure-absorbing view over a strategy.
#[derive(Clone)]
pub struct SessionStorage {
    strategy: Arc<dyn SessionStoreStrategy>,
}

impl SessionStorage {
    pub fn new(strategy: Arc<dyn SessionStoreStrategy>) -> Self {
        SessionStorage { strategy }
    }

    pub fn supports_locking(&self) -> bool {
        self.strategy.supports_locking()
    }

    pub fn retrieve_session(&self) -> SessionState {
        match self.strategy.retrieve() {
            Ok(Some(raw)) => state::decode(&raw),
            Ok(None) => SessionState::new(),
            Err(err) => {
                warn!(error = %err, "Session read failed; treating as no session");
                SessionState::new()
            }
        }
    }

    /// Writes the full record. An empty record is stored as a cleared blob.
    pub fn persist_session(&self, session: &SessionState) {
        if session.is_empty() {
            self.clear_session();
            return;
        }
        if let Err(err) = self.strategy.persist(&state::encode(session)) {
            warn!(error = %err, "Session write failed; dropping it");
        }
    }

    pub fn clear_session(&self) {
        if let Err(err) = self.strategy.clear() {
            warn!(error = %err, "Session clear failed");
        }
    }
}

impl std::fmt::Debug for SessionStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionStorage")
            .field("supports_locking", &self.supports_locking())
            .finish()
    }
}
