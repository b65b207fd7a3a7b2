//! Head-only caching counter.
//!
//! When enabled, only the first `limit` segments observed from each origin
//! host are persisted to disk; later segments still stream through to the
//! client but are never written. The counter lives in process memory only
//! and is scoped per origin host, not per manifest or globally.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};

pub struct HeadOnlyTracker {
    limit: u32,
    counts: DashMap<String, AtomicU32>,
}

impl HeadOnlyTracker {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            counts: DashMap::new(),
        }
    }

    /// Returns `true` if this segment should be written to disk, consuming
    /// one slot of the host's budget if so. Idempotent per call — every
    /// distinct segment fetch counts once, regardless of whether it was
    /// ultimately persisted.
    pub fn should_persist(&self, url: &str) -> bool {
        let host = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();

        let entry = self
            .counts
            .entry(host)
            .or_insert_with(|| AtomicU32::new(0));
        let prior = entry.fetch_add(1, Ordering::SeqCst);
        prior < self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persists_first_n_segments_then_stops() {
        let tracker = HeadOnlyTracker::new(3);
        let url = "http://origin.example/seg";
        assert!(tracker.should_persist(url));
        assert!(tracker.should_persist(url));
        assert!(tracker.should_persist(url));
        assert!(!tracker.should_persist(url));
        assert!(!tracker.should_persist(url));
    }

    #[test]
    fn counters_are_scoped_per_host() {
        let tracker = HeadOnlyTracker::new(1);
        assert!(tracker.should_persist("http://a.example/seg1"));
        assert!(tracker.should_persist("http://b.example/seg1"));
        assert!(!tracker.should_persist("http://a.example/seg2"));
    }
}
