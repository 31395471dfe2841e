//! Bounded cache of recently processed message ids.
//!
//! Consumers call [`DedupCache::seen`] before processing and
//! [`DedupCache::mark`] only once processing has finished, so a crash in
//! between leads to reprocessing rather than loss.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::DedupConfig;

#[derive(Debug)]
struct DedupState {
    entries: HashMap<String, Instant>,
    /// Insertion order; may hold stale positions for re-marked ids.
    order: VecDeque<(String, Instant)>,
}

#[derive(Debug)]
pub struct DedupCache {
    capacity: usize,
    retention: Duration,
    state: Mutex<DedupState>,
}

impl DedupCache {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            retention,
            state: Mutex::new(DedupState {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    pub fn from_config(config: &DedupConfig) -> Self {
        Self::new(config.capacity, Duration::from_secs(config.retention_secs))
    }

    pub fn seen(&self, message_id: &str) -> bool {
        self.seen_at(message_id, Instant::now())
    }

    pub fn mark(&self, message_id: &str) {
        self.mark_at(message_id, Instant::now());
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn seen_at(&self, message_id: &str, now: Instant) -> bool {
        let mut state = self.state.lock();
        self.evict_expired(&mut state, now);
        state.entries.contains_key(message_id)
    }

    pub(crate) fn mark_at(&self, message_id: &str, now: Instant) {
        let mut state = self.state.lock();
        self.evict_expired(&mut state, now);

        state.entries.insert(message_id.to_string(), now);
        state.order.push_back((message_id.to_string(), now));

        while state.entries.len() > self.capacity {
            let Some((id, at)) = state.order.pop_front() else {
                break;
            };
            if state.entries.get(&id) == Some(&at) {
                state.entries.remove(&id);
            }
        }
    }

    fn evict_expired(&self, state: &mut DedupState, now: Instant) {
        while let Some((id, at)) = state.order.front() {
            if now.saturating_duration_since(*at) < self.retention {
                break;
            }
            if state.entries.get(id) == Some(at) {
                state.entries.remove(id);
            }
            state.order.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_then_seen() {
        let cache = DedupCache::new(10, Duration::from_secs(60));
        assert!(!cache.seen("m1"));
        cache.mark("m1");
        assert!(cache.seen("m1"));
        assert!(!cache.seen("m2"));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let cache = DedupCache::new(2, Duration::from_secs(60));
        cache.mark("a");
        cache.mark("b");
        cache.mark("c");

        assert_eq!(cache.len(), 2);
        assert!(!cache.seen("a"));
        assert!(cache.seen("b"));
        assert!(cache.seen("c"));
    }

    #[test]
    fn test_retention_window_evicts_lazily() {
        let cache = DedupCache::new(10, Duration::from_secs(5));
        let t0 = Instant::now();
        cache.mark_at("old", t0);
        cache.mark_at("newer", t0 + Duration::from_secs(3));

        assert!(cache.seen_at("old", t0 + Duration::from_secs(4)));
        assert!(!cache.seen_at("old", t0 + Duration::from_secs(6)));
        assert!(cache.seen_at("newer", t0 + Duration::from_secs(6)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_remark_refreshes_position() {
        let cache = DedupCache::new(2, Duration::from_secs(60));
        let t0 = Instant::now();
        cache.mark_at("a", t0);
        cache.mark_at("b", t0 + Duration::from_millis(1));
        cache.mark_at("a", t0 + Duration::from_millis(2));
        cache.mark_at("c", t0 + Duration::from_millis(3));

        let now = t0 + Duration::from_millis(4);
        assert!(cache.seen_at("a", now));
        assert!(!cache.seen_at("b", now));
        assert!(cache.seen_at("c", now));
    }
}
