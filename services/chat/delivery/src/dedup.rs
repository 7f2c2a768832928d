//! Duplicate suppression for inbound messages.

use std::collections::HashSet;
use std::collections::VecDeque;

/// Ids retained before least-recently-seen eviction
pub const DEDUP_CAP: usize = 1000;

/// Bounded set of recently seen message ids.
///
/// At-least-once delivery means replays are normal; this set suppresses
/// them. A hit refreshes the id's recency so a message being actively
/// replayed is not evicted while older quiet ids are.
#[derive(Debug)]
pub struct DedupSet {
    seen: HashSet<String>,
    order: VecDeque<String>,
    cap: usize,
}

impl DedupSet {
    /// Create a set with the default capacity
    pub fn new() -> Self {
        Self::with_capacity(DEDUP_CAP)
    }

    /// Create a set with a custom capacity
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(cap),
            order: VecDeque::with_capacity(cap),
            cap,
        }
    }

    /// Record `id`. Returns `true` when the id is new, `false` for a
    /// replay (whose recency is refreshed).
    pub fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            if let Some(pos) = self.order.iter().position(|x| x == id) {
                self.order.remove(pos);
                self.order.push_back(id.to_string());
            }
            return false;
        }

        if self.seen.len() == self.cap {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }

    /// Whether `id` has been seen (without refreshing recency)
    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    /// Number of ids currently held
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

impl Default for DedupSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_detected() {
        let mut set = DedupSet::new();
        assert!(set.insert("m1"));
        assert!(!set.insert("m1"));
        assert!(set.insert("m2"));
    }

    #[test]
    fn test_eviction_at_capacity() {
        let mut set = DedupSet::with_capacity(3);
        set.insert("m1");
        set.insert("m2");
        set.insert("m3");
        set.insert("m4");

        assert!(!set.contains("m1"));
        assert!(set.contains("m4"));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_replay_refreshes_recency() {
        let mut set = DedupSet::with_capacity(3);
        set.insert("m1");
        set.insert("m2");
        set.insert("m3");

        // m1 replayed; m2 is now the least recently seen
        set.insert("m1");
        set.insert("m4");

        assert!(set.contains("m1"));
        assert!(!set.contains("m2"));
    }
}
