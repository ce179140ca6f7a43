//! Lamport clock

use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe Lamport clock
#[derive(Debug, Default)]
pub struct LamportClock {
    counter: AtomicU64,
}

impl LamportClock {
    /// Create a clock starting at zero
    #[must_use]
    pub const fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    /// Current time
    pub fn time(&self) -> u64 {
        self.counter.load(Ordering::Acquire)
    }

    /// Advance and return the new time
    pub fn increment(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Observe a remote time; the local clock moves past it
    pub fn witness(&self, remote: u64) {
        let mut current = self.counter.load(Ordering::Acquire);
        while remote >= current {
            match self.counter.compare_exchange_weak(
                current,
                remote + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_and_witness() {
        let clock = LamportClock::new();
        assert_eq!(clock.increment(), 1);
        clock.witness(10);
        assert_eq!(clock.time(), 11);
        clock.witness(3);
        assert_eq!(clock.time(), 11);
    }
}
