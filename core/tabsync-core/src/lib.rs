//! # tabsync-core
//!
//! Cross-tab session coordination over a shared storage medium that offers no
//! atomic operations.
//!
//! Every execution context ("tab") that can see the same storage shares one
//! session blob. Each product embedded in a tab runs its own session
//! lifecycle (tracking decision, inactivity expiry, absolute ceiling,
//! renewal on activity) against that blob without clobbering the others.
//!
//! ## Layers
//!
//! - [`storage`]: the raw strategy contract plus memory and file media.
//! - [`state`]: the flat key/value record and its blob codec.
//! - [`operations`]: lock-protected read-modify-write with a FIFO queue.
//! - [`manager`]: per-product lifecycle, timers, and activity wiring.
//!
//! ## Design Principles
//!
//! - **Never raise to the host**: unreadable storage is "no session", failed
//!   writes are dropped, lock starvation drops the operation.
//! - **No hidden globals**: timers and listeners belong to a [`SessionHost`]
//!   and die with it.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tabsync_core::{decision, ActivityKind, SessionConfig, SessionHost};
//!
//! let host = SessionHost::from_config(SessionConfig::default())?;
//! let rum = host.start_session_manager("rum", decision::sampled(100.0)).await;
//! host.notify_activity(ActivityKind::Click);
//! let session = rum.find_active_session(None);
//! ```

pub mod activity;
pub mod clock;
pub mod config;
pub mod decision;
pub mod error;
pub mod history;
pub mod manager;
pub mod operations;
pub mod state;
pub mod storage;
mod store;

pub use activity::{ActivityKind, Visibility};
pub use clock::{Clock, RuntimeClock, SystemClock, TimeStamp};
pub use config::{load_config, SessionConfig, StorageConfig};
pub use decision::TrackingDecision;
pub use error::{Result, SessionError, StorageError};
pub use manager::{SessionHost, SessionManager};
pub use operations::{OperationProcessor, Processed, SessionOperation};
pub use state::SessionState;
pub use storage::{
    FileStrategy, MemoryStrategy, SessionStorage, SessionStoreStrategy, SESSION_STORE_KEY,
};
pub use store::SessionContext;
