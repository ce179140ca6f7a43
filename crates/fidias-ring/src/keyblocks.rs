//! Owned key ranges
//!
//! The arcs `(pred, vnode]` of every local vnode. Any change moves
//! `last_change` forward; rebalance sweeps only run once the ranges have
//! been quiet for the stable threshold.

use fidias_common::Id;
use fidias_common::id::between_right_incl;
use parking_lot::RwLock;
use std::time::{Duration, Instant};

/// Ring arc `(start, end]`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyRange {
    pub start: Id,
    pub end: Id,
}

impl KeyRange {
    /// Whether `id` falls in this arc
    #[must_use]
    pub fn contains(&self, id: &Id) -> bool {
        between_right_incl(&self.start, &self.end, id)
    }
}

#[derive(Debug)]
struct Inner {
    ranges: Vec<KeyRange>,
    last_change: Instant,
}

/// Set of owned key ranges
#[derive(Debug)]
pub struct KeyBlocks {
    inner: RwLock<Inner>,
}

impl Default for KeyBlocks {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyBlocks {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                ranges: Vec::new(),
                last_change: Instant::now(),
            }),
        }
    }

    /// Replace the owned ranges; returns whether anything changed
    pub fn set(&self, mut ranges: Vec<KeyRange>) -> bool {
        ranges.sort_by(|a, b| a.end.cmp(&b.end));
        let mut inner = self.inner.write();
        if inner.ranges == ranges {
            return false;
        }
        inner.ranges = ranges;
        let now = Instant::now();
        if now > inner.last_change {
            inner.last_change = now;
        }
        true
    }

    /// Whether `id` falls in an owned range
    #[must_use]
    pub fn contains(&self, id: &Id) -> bool {
        self.inner.read().ranges.iter().any(|r| r.contains(id))
    }

    /// Current ranges
    #[must_use]
    pub fn ranges(&self) -> Vec<KeyRange> {
        self.inner.read().ranges.clone()
    }

    /// Time of the last range change
    #[must_use]
    pub fn last_change(&self) -> Instant {
        self.inner.read().last_change
    }

    /// Whether no range changed within `threshold`
    #[must_use]
    pub fn is_stable(&self, threshold: Duration) -> bool {
        self.last_change().elapsed() >= threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(a: u8, b: u8) -> KeyRange {
        KeyRange {
            start: Id::new(vec![a]),
            end: Id::new(vec![b]),
        }
    }

    #[test]
    fn test_set_tracks_changes() {
        let kb = KeyBlocks::new();
        let before = kb.last_change();
        std::thread::sleep(Duration::from_millis(2));
        assert!(kb.set(vec![range(10, 20)]));
        assert!(kb.last_change() > before);
        let stamp = kb.last_change();
        assert!(!kb.set(vec![range(10, 20)]));
        assert_eq!(kb.last_change(), stamp);
    }

    #[test]
    fn test_contains_and_stability() {
        let kb = KeyBlocks::new();
        kb.set(vec![range(200, 10), range(50, 60)]);
        assert!(kb.contains(&Id::new(vec![5])));
        assert!(kb.contains(&Id::new(vec![55])));
        assert!(!kb.contains(&Id::new(vec![30])));
        assert!(kb.is_stable(Duration::ZERO));
        assert!(!kb.is_stable(Duration::from_secs(3600)));
    }
}
