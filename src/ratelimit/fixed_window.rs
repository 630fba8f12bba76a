//! In-memory fixed-window limiter.
//!
//! Each [`FixedWindowLimiter`] owns an independent key to [`WindowEntry`] map,
//! so one instance can guard the login route while another guards health
//! checks. Counts live only in process memory and are lost on restart.
//!
//! The map is a [`DashMap`]: the read-increment-compare sequence for a key
//! runs while holding that key's shard lock, so concurrent hits on the same
//! key are never lost.
//!
//! `max_entries` is a soft bound. Past it, expired entries are swept before a
//! new key is inserted; if every tracked window is still live the new key is
//! inserted anyway and a warning is logged. Keep the window short on limiters
//! keyed by peer address.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, trace, warn};

use super::clock::{Clock, SystemClock};
use super::counter::{Hit, WindowEntry};

/// Entry count above which expired entries are swept before inserting.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Shortest window a limiter will run with.
const MIN_WINDOW: Duration = Duration::from_secs(1);

/// Build a limiter allowing `limit` requests per key every `window_minutes`.
///
/// A zero window is raised to one second.
pub fn make_limiter(limit: u64, window_minutes: u64) -> FixedWindowLimiter {
    FixedWindowLimiter::new(limit, Duration::from_secs(window_minutes.saturating_mul(60)))
}

/// Fixed-window limiter keyed by caller identity.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    limit: u64,
    window: Duration,
    max_entries: usize,
    name: Option<String>,
    clock: Arc<dyn Clock>,
    entries: DashMap<String, WindowEntry>,
}

impl FixedWindowLimiter {
    /// `window` is floored at one second.
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            limit,
            window: window.max(MIN_WINDOW),
            max_entries: DEFAULT_MAX_ENTRIES,
            name: None,
            clock: Arc::new(SystemClock),
            entries: DashMap::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Soft bound on tracked keys; see the module docs.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Name used in log lines, e.g. `"login"`.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("fixed_window")
    }

    /// Record a hit for `key` and decide.
    pub fn check(&self, key: &str) -> Hit {
        let now = self.clock.now();

        if self.entries.len() >= self.max_entries && !self.entries.contains_key(key) {
            self.evict_expired();
            let tracked = self.entries.len();
            if tracked >= self.max_entries {
                warn!(
                    limiter = self.name(),
                    tracked,
                    max_entries = self.max_entries,
                    "Fixed window map over capacity with no expired entries"
                );
            }
        }

        let hit = match self.entries.get_mut(key) {
            Some(mut entry) => entry.record_hit(now, self.limit, self.window),
            None => {
                let mut hit = Hit::Opened;
                self.entries
                    .entry(key.to_string())
                    .and_modify(|entry| hit = entry.record_hit(now, self.limit, self.window))
                    .or_insert_with(|| WindowEntry::open(now));
                hit
            }
        };

        trace!(limiter = self.name(), key = %key, hit = ?hit, "Fixed window hit recorded");

        if let Hit::Rejected { retry_after } = hit {
            debug!(
                limiter = self.name(),
                key = %key,
                limit = self.limit,
                retry_after_secs = retry_after.as_secs(),
                "Fixed window limit exceeded"
            );
        }

        hit
    }

    /// Current count for `key`, or `None` if the key has no live window.
    pub fn current_count(&self, key: &str) -> Option<u64> {
        let now = self.clock.now();
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(now, self.window))
            .map(|entry| entry.count())
    }

    /// Drop every entry whose window has ended. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !entry.is_expired(now, self.window));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(limiter = self.name(), removed, "Evicted expired windows");
        }
        removed
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    fn limiter_with_clock(limit: u64, window_minutes: u64) -> (FixedWindowLimiter, ManualClock) {
        let clock = ManualClock::default();
        let limiter = make_limiter(limit, window_minutes).with_clock(Arc::new(clock.clone()));
        (limiter, clock)
    }

    #[test]
    fn test_two_per_minute_then_reset() {
        let (limiter, clock) = limiter_with_clock(2, 1);

        assert_eq!(limiter.check("ip:1.2.3.4"), Hit::Opened);
        assert_eq!(limiter.check("ip:1.2.3.4"), Hit::Admitted { remaining: 0 });
        assert!(matches!(limiter.check("ip:1.2.3.4"), Hit::Rejected { .. }));

        clock.advance(Duration::from_secs(61));

        assert_eq!(limiter.check("ip:1.2.3.4"), Hit::Opened);
        assert_eq!(limiter.current_count("ip:1.2.3.4"), Some(1));
    }

    #[test]
    fn test_keys_are_independent() {
        let (limiter, _clock) = limiter_with_clock(1, 1);

        assert!(limiter.check("a").is_allowed());
        assert!(!limiter.check("a").is_allowed());
        assert!(limiter.check("b").is_allowed());
    }

    #[test]
    fn test_instances_are_independent() {
        let first = make_limiter(1, 1);
        let second = make_limiter(1, 1);

        assert!(first.check("k").is_allowed());
        assert!(!first.check("k").is_allowed());
        assert!(second.check("k").is_allowed());
    }

    #[test]
    fn test_rejection_reports_time_left() {
        let (limiter, clock) = limiter_with_clock(1, 1);
        limiter.check("k");
        clock.advance(Duration::from_secs(15));

        assert_eq!(
            limiter.check("k"),
            Hit::Rejected {
                retry_after: Duration::from_secs(45)
            }
        );
    }

    #[test]
    fn test_expired_entries_swept_when_full() {
        let (limiter, clock) = limiter_with_clock(5, 1);
        let limiter = limiter.with_max_entries(2);

        limiter.check("a");
        limiter.check("b");
        assert_eq!(limiter.tracked_keys(), 2);

        clock.advance(Duration::from_secs(60));
        limiter.check("c");

        assert_eq!(limiter.tracked_keys(), 1);
        assert_eq!(limiter.current_count("a"), None);
        assert_eq!(limiter.current_count("c"), Some(1));
    }

    #[test]
    fn test_full_map_with_live_windows_still_admits() {
        let (limiter, _clock) = limiter_with_clock(5, 1);
        let limiter = limiter.with_max_entries(2);

        limiter.check("a");
        limiter.check("b");
        assert_eq!(limiter.check("c"), Hit::Opened);

        // soft bound: nothing expired, so nothing was evicted
        assert_eq!(limiter.tracked_keys(), 3);
        assert_eq!(limiter.current_count("a"), Some(1));
    }

    #[test]
    fn test_zero_window_is_floored() {
        let (limiter, clock) = limiter_with_clock(1, 0);
        assert_eq!(limiter.window(), Duration::from_secs(1));

        assert_eq!(limiter.check("k"), Hit::Opened);
        assert_eq!(
            limiter.check("k"),
            Hit::Rejected {
                retry_after: Duration::from_secs(1)
            }
        );

        clock.advance(Duration::from_secs(1));
        assert_eq!(limiter.check("k"), Hit::Opened);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_hits_are_not_lost() {
        let limiter = Arc::new(make_limiter(50, 1));

        let tasks: Vec<_> = (0..200)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.check("shared").is_allowed() })
            })
            .collect();

        let results = futures::future::join_all(tasks).await;
        let allowed = results
            .into_iter()
            .map(|r| r.unwrap())
            .filter(|allowed| *allowed)
            .count();

        assert_eq!(allowed, 50);
        assert_eq!(limiter.current_count("shared"), Some(200));
    }
}
