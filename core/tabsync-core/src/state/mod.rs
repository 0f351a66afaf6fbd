//! Shared Session Blob
//!
//! Every execution context on the page reads and writes one small blob at a
//! well-known key. The blob is **multiplexed**: each product owns one key for
//! its tracking decision, while `id`, `created` and `expire` are shared.
//!
//! ```text
//! id=7a3c...&created=1718000000000&expire=1718000900000&rum=1&logs=0
//! ```
//!
//! # Module Structure
//!
//! - [`types`]: [`SessionState`], the flat key/value record plus its liveness rules
//! - [`codec`]: `&`-joined `key=value` encoding, tolerant of malformed input
//!
//! Writers always decode the full record, change only the keys they own, and
//! re-encode everything. Keys a writer doesn't recognize survive untouched.

mod codec;
mod types;

pub use codec::{decode, encode};
pub use types::{SessionState, CREATED_KEY, EXPIRE_KEY, ID_KEY, LOCK_KEY};
