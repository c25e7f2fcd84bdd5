//! At-most-once gate for observed activity.

use std::collections::{HashSet, VecDeque};

use tracing::warn;

/// Default number of remembered activity ids.
pub const DEFAULT_DEDUP_CAPACITY: usize = 1000;

/// Insertion-ordered set of processed activity ids with FIFO eviction.
///
/// Call [`Deduplicator::is_duplicate`] before any side effect and
/// [`Deduplicator::mark_processed`] once the event is accepted. A `None` key is
/// never a duplicate; callers pass the composite identity for rows without a
/// transaction hash.
#[derive(Debug)]
pub struct Deduplicator {
    order: VecDeque<String>,
    seen: HashSet<String>,
    capacity: usize,
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}

impl Deduplicator {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Whether `id` was already processed.
    pub fn is_duplicate(&self, id: Option<&str>) -> bool {
        match id {
            Some(id) => self.seen.contains(id),
            None => false,
        }
    }

    /// Remember `id`. The oldest id is evicted once the bound is exceeded;
    /// the id just inserted is always the newest and is never the one evicted.
    pub fn mark_processed(&mut self, id: Option<&str>) {
        let Some(id) = id else {
            warn!("Activity without transaction hash, cannot deduplicate");
            return;
        };
        if !self.seen.insert(id.to_string()) {
            return;
        }
        self.order.push_back(id.to_string());

        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_after_mark() {
        let mut dedup = Deduplicator::default();
        assert!(!dedup.is_duplicate(Some("0xabc")));
        dedup.mark_processed(Some("0xabc"));
        assert!(dedup.is_duplicate(Some("0xabc")));
        assert!(!dedup.is_duplicate(Some("0xdef")));
    }

    #[test]
    fn test_missing_id_is_never_duplicate() {
        let mut dedup = Deduplicator::default();
        dedup.mark_processed(None);
        assert!(!dedup.is_duplicate(None));
        assert!(dedup.is_empty());
    }

    #[test]
    fn test_fifo_eviction() {
        let mut dedup = Deduplicator::new(3);
        for id in ["a", "b", "c", "d"] {
            dedup.mark_processed(Some(id));
        }

        assert_eq!(dedup.len(), 3);
        assert!(!dedup.is_duplicate(Some("a")));
        assert!(dedup.is_duplicate(Some("b")));
        assert!(dedup.is_duplicate(Some("d")));
    }

    #[test]
    fn test_remark_does_not_grow() {
        let mut dedup = Deduplicator::new(2);
        dedup.mark_processed(Some("a"));
        dedup.mark_processed(Some("a"));
        dedup.mark_processed(Some("b"));

        assert_eq!(dedup.len(), 2);
        assert!(dedup.is_duplicate(Some("a")));
    }

    #[test]
    fn test_default_capacity() {
        let mut dedup = Deduplicator::default();
        for i in 0..1500 {
            dedup.mark_processed(Some(&format!("tx{}", i)));
        }
        assert_eq!(dedup.len(), DEFAULT_DEDUP_CAPACITY);
        assert!(!dedup.is_duplicate(Some("tx499")));
        assert!(dedup.is_duplicate(Some("tx500")));
        assert!(dedup.is_duplicate(Some("tx1499")));
    }
}
