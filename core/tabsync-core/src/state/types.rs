//! The decoded session record.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::{duration_ms, TimeStamp};

/// Session identifier. Present iff at least one product tracks the session.
pub const ID_KEY: &str = "id";
/// Creation time. Immutable once set; absent on blobs from older writers.
pub const CREATED_KEY: &str = "created";
/// Inactivity deadline, rewritten on every successful write.
pub const EXPIRE_KEY: &str = "expire";
/// Writer token, present only inside a critical section.
pub const LOCK_KEY: &str = "lock";

/// Flat string-keyed session record.
///
/// Absence of a key means "unset"; an empty string is a real value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionState(BTreeMap<String, String>);

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn id(&self) -> Option<&str> {
        self.get(ID_KEY)
    }

    pub fn lock(&self) -> Option<&str> {
        self.get(LOCK_KEY)
    }

    /// Creation timestamp. Unparseable values read as absent.
    pub fn created(&self) -> Option<TimeStamp> {
        self.get(CREATED_KEY).and_then(|v| v.parse().ok())
    }

    /// Inactivity deadline. Unparseable values read as absent.
    pub fn expire(&self) -> Option<TimeStamp> {
        self.get(EXPIRE_KEY).and_then(|v| v.parse().ok())
    }

    pub fn set_lock(&mut self, token: &str) {
        self.set(LOCK_KEY, token);
    }

    pub fn without_lock(mut self) -> Self {
        self.0.remove(LOCK_KEY);
        self
    }

    /// True when nothing but bookkeeping (`expire`, `lock`) is left, meaning
    /// the blob should be cleared rather than written.
    pub fn is_cleared(&self) -> bool {
        self.0
            .keys()
            .all(|key| key == EXPIRE_KEY || key == LOCK_KEY)
    }

    /// Pushes the inactivity deadline to `now + expiration_delay`.
    pub fn expand(&mut self, now: TimeStamp, expiration_delay: Duration) {
        let deadline = now.saturating_add(duration_ms(expiration_delay));
        self.set(EXPIRE_KEY, deadline.to_string());
    }

    /// Whether this record still describes a live session at `now`.
    ///
    /// `created` and `expire` may be missing on blobs written by older
    /// versions; a missing field never expires the session on its own.
    pub fn is_active(&self, now: TimeStamp, time_out_delay: Duration) -> bool {
        let within_lifetime = self
            .created()
            .map_or(true, |created| {
                now.saturating_sub(created) < duration_ms(time_out_delay)
            });
        let within_deadline = self.expire().map_or(true, |expire| now < expire);
        within_lifetime && within_deadline
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for SessionState {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        SessionState(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}
