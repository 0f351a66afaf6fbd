//! User activity and page visibility signals.

use std::time::Duration;

use tokio::time::Instant;

/// Interaction that counts as user activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    Click,
    TouchStart,
    KeyDown,
    Scroll,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Visibility {
    #[default]
    Visible,
    Hidden,
}

/// Leading + trailing throttle.
///
/// The first hit in a window runs immediately; any further hits within the
/// window collapse into one trailing run at the end of it, which opens the
/// next window.
#[derive(Debug, Clone)]
pub(crate) struct Throttle {
    window: Duration,
    last_run: Option<Instant>,
    pending: bool,
}

impl Throttle {
    pub(crate) fn new(window: Duration) -> Self {
        Throttle {
            window,
            last_run: None,
            pending: false,
        }
    }

    /// Returns true when the call should run now.
    pub(crate) fn hit(&mut self, now: Instant) -> bool {
        match self.last_run {
            Some(last) if now < last + self.window => {
                self.pending = true;
                false
            }
            _ => {
                self.last_run = Some(now);
                self.pending = false;
                true
            }
        }
    }

    /// When the pending trailing call is due.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        match (self.pending, self.last_run) {
            (true, Some(last)) => Some(last + self.window),
            _ => None,
        }
    }

    /// Consumes the trailing call if it is due.
    pub(crate) fn take_trailing(&mut self, now: Instant) -> bool {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                self.pending = false;
                self.last_run = Some(now);
                true
            }
            _ => false,
        }
    }
}
