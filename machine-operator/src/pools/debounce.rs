use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Remembers the last observed {config hash, pool policy hash} per pool and
/// how long ago it changed, so a burst of config edits collapses into a
/// single rollout. In-memory only; entries die with the pool (or the
/// process, which just restarts the window).
#[derive(Default)]
pub struct DebounceTracker {
    entries: Mutex<HashMap<String, DebounceEntry>>,
}

#[derive(Clone, Debug)]
struct DebounceEntry {
    last_hash: String,
    pool_spec_hash: String,
    last_change: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DebounceDecision {
    pub proceed: bool,
    pub requeue_after: Duration,
}

impl DebounceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check_and_update(
        &self,
        pool: &str,
        config_hash: &str,
        pool_spec_hash: &str,
        debounce: Duration,
        now: DateTime<Utc>,
    ) -> DebounceDecision {
        let mut entries = self.entries.lock().unwrap();
        let last_change = entries.get(pool).and_then(|e| {
            (e.last_hash == config_hash && e.pool_spec_hash == pool_spec_hash)
                .then_some(e.last_change)
        });
        let Some(last_change) = last_change else {
            entries.insert(
                pool.to_string(),
                DebounceEntry {
                    last_hash: config_hash.to_string(),
                    pool_spec_hash: pool_spec_hash.to_string(),
                    last_change: now,
                },
            );
            // A zero window means no coalescing at all.
            return DebounceDecision {
                proceed: debounce.is_zero(),
                requeue_after: debounce,
            };
        };
        let elapsed = (now - last_change).to_std().unwrap_or_default();
        if elapsed < debounce {
            return DebounceDecision {
                proceed: false,
                requeue_after: debounce - elapsed,
            };
        }
        DebounceDecision {
            proceed: true,
            requeue_after: Duration::ZERO,
        }
    }

    pub fn reset(&self, pool: &str) {
        self.entries.lock().unwrap().remove(pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    const WINDOW: Duration = Duration::from_secs(30);

    #[test]
    fn first_observation_waits_out_the_window() {
        let tracker = DebounceTracker::new();
        let now = Utc::now();
        let d = tracker.check_and_update("worker", "h1", "p1", WINDOW, now);
        assert!(!d.proceed);
        assert_eq!(d.requeue_after, WINDOW);
    }

    #[test]
    fn proceeds_once_window_elapses() {
        let tracker = DebounceTracker::new();
        let now = Utc::now();
        tracker.check_and_update("worker", "h1", "p1", WINDOW, now);
        let mid = tracker.check_and_update(
            "worker",
            "h1",
            "p1",
            WINDOW,
            now + TimeDelta::seconds(10),
        );
        assert!(!mid.proceed);
        assert_eq!(mid.requeue_after, Duration::from_secs(20));
        let done = tracker.check_and_update(
            "worker",
            "h1",
            "p1",
            WINDOW,
            now + TimeDelta::seconds(30),
        );
        assert!(done.proceed);
        assert_eq!(done.requeue_after, Duration::ZERO);
    }

    #[test]
    fn hash_change_restarts_the_window() {
        let tracker = DebounceTracker::new();
        let now = Utc::now();
        tracker.check_and_update("worker", "h1", "p1", WINDOW, now);
        let later = now + TimeDelta::seconds(29);
        let d = tracker.check_and_update("worker", "h2", "p1", WINDOW, later);
        assert!(!d.proceed);
        assert_eq!(d.requeue_after, WINDOW);
        // The policy hash restarts it too.
        let d = tracker.check_and_update("worker", "h2", "p2", WINDOW, later);
        assert!(!d.proceed);
        assert_eq!(d.requeue_after, WINDOW);
    }

    #[test]
    fn zero_window_proceeds_immediately() {
        let tracker = DebounceTracker::new();
        let d = tracker.check_and_update("worker", "h1", "p1", Duration::ZERO, Utc::now());
        assert!(d.proceed);
    }

    #[test]
    fn pools_debounce_independently() {
        let tracker = DebounceTracker::new();
        let now = Utc::now();
        tracker.check_and_update("worker", "h1", "p1", WINDOW, now);
        let other = tracker.check_and_update("infra", "h1", "p1", WINDOW, now);
        assert!(!other.proceed);
        assert_eq!(other.requeue_after, WINDOW);
    }

    #[test]
    fn reset_forgets_the_pool() {
        let tracker = DebounceTracker::new();
        let now = Utc::now();
        tracker.check_and_update("worker", "h1", "p1", WINDOW, now);
        tracker.reset("worker");
        let d = tracker.check_and_update("worker", "h1", "p1", WINDOW, now + TimeDelta::seconds(60));
        assert!(!d.proceed);
        assert_eq!(d.requeue_after, WINDOW);
    }
}
