//! Time-indexed record of past session contexts.
//!
//! Lets callers attribute an event that happened at time `t` to the session
//! that was active at `t`, even after that session expired.

use std::collections::VecDeque;
use std::time::Duration;

use crate::clock::{duration_ms, TimeStamp};

#[derive(Debug, Clone, PartialEq, Eq)]
struct HistoryEntry<T> {
    value: T,
    start: TimeStamp,
    end: Option<TimeStamp>,
}

impl<T> HistoryEntry<T> {
    fn covers(&self, at: TimeStamp) -> bool {
        self.start <= at && self.end.map_or(true, |end| at <= end)
    }
}

/// Entries are kept newest first.
#[derive(Debug, Clone)]
pub struct ValueHistory<T> {
    entries: VecDeque<HistoryEntry<T>>,
    retention: Duration,
}

impl<T: Clone> ValueHistory<T> {
    /// `retention` bounds how long a closed entry stays queryable.
    pub fn new(retention: Duration) -> Self {
        ValueHistory {
            entries: VecDeque::new(),
            retention,
        }
    }

    pub fn add(&mut self, value: T, start: TimeStamp) {
        self.entries.push_front(HistoryEntry {
            value,
            start,
            end: None,
        });
    }

    /// Ends the newest entry if it is still open.
    pub fn close_active(&mut self, end: TimeStamp) {
        if let Some(latest) = self.entries.front_mut() {
            if latest.end.is_none() {
                latest.end = Some(end);
            }
        }
    }

    /// Without a time, returns the open entry, if any. With a time, returns
    /// the newest entry whose span contains it (bounds inclusive).
    pub fn find(&self, at: Option<TimeStamp>) -> Option<T> {
        match at {
            None => self
                .entries
                .front()
                .filter(|entry| entry.end.is_none())
                .map(|entry| entry.value.clone()),
            Some(at) => self
                .entries
                .iter()
                .find(|entry| entry.covers(at))
                .map(|entry| entry.value.clone()),
        }
    }

    /// Drops closed entries that ended more than `retention` before `now`.
    pub fn clear_old(&mut self, now: TimeStamp) {
        let threshold = now.saturating_sub(duration_ms(self.retention));
        self.entries
            .retain(|entry| entry.end.map_or(true, |end| end >= threshold));
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
