//! Error types for tabsync-core operations.
//!
//! Only configuration loading and the raw storage contract surface errors.
//! Everything above [`crate::storage::SessionStorage`] absorbs failures and
//! behaves as if there were no session, so host code is never disturbed.

use std::path::PathBuf;

// ═══════════════════════════════════════════════════════════════════════════════
// Storage Errors (strategy contract)
// ═══════════════════════════════════════════════════════════════════════════════

/// Failure reported by a [`crate::storage::SessionStoreStrategy`].
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Session storage unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        StorageError::Io {
            context: context.into(),
            source,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Crate Error
// ═══════════════════════════════════════════════════════════════════════════════

/// All errors that can be returned by fallible tabsync-core entry points.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration read failed: {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Home directory not found")]
    HomeDirNotFound,
}

/// Convenience type alias for Results using SessionError.
pub type Result<T> = std::result::Result<T, SessionError>;

// Conversion for string error compatibility
impl From<SessionError> for String {
    fn from(err: SessionError) -> String {
        err.to_string()
    }
}
