//! Fixed-window counter entry.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// What happened when a hit was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hit {
    /// First hit of a fresh window.
    Opened,
    /// Within the limit; `remaining` hits are left in this window.
    Admitted { remaining: u64 },
    /// Over the limit until the window resets.
    Rejected { retry_after: Duration },
}

impl Hit {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Hit::Rejected { .. })
    }
}

/// Count of hits for one key inside the current window.
///
/// Expiry is lazy: [`WindowEntry::record_hit`] resets an expired window before
/// counting, so an entry is never read across a window boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowEntry {
    count: u64,
    window_start: DateTime<Utc>,
}

impl WindowEntry {
    /// A fresh entry holding the first hit.
    pub fn open(now: DateTime<Utc>) -> Self {
        Self {
            count: 1,
            window_start: now,
        }
    }

    /// Record one hit at `now` against `limit` per `window`.
    pub fn record_hit(&mut self, now: DateTime<Utc>, limit: u64, window: Duration) -> Hit {
        if self.is_expired(now, window) {
            *self = Self::open(now);
            return Hit::Opened;
        }

        self.count = self.count.saturating_add(1);

        if self.count <= limit {
            Hit::Admitted {
                remaining: limit - self.count,
            }
        } else {
            Hit::Rejected {
                retry_after: self.duration_until_reset(now, window),
            }
        }
    }

    /// Whether the window that started at `window_start` has ended.
    pub fn is_expired(&self, now: DateTime<Utc>, window: Duration) -> bool {
        match (now - self.window_start).to_std() {
            Ok(elapsed) => elapsed >= window,
            // `now` before the window start: the clock went backwards
            Err(_) => false,
        }
    }

    /// Time left until the current window resets.
    pub fn duration_until_reset(&self, now: DateTime<Utc>, window: Duration) -> Duration {
        let elapsed = (now - self.window_start).to_std().unwrap_or(Duration::ZERO);
        window.saturating_sub(elapsed)
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn window_start(&self) -> DateTime<Utc> {
        self.window_start
    }
}
