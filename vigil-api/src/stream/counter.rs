//! Per-session unread notification counter.

use std::sync::atomic::{AtomicI64, Ordering};

/// Unread counter that never drops below zero.
///
/// Every update is a compare-and-swap loop, so concurrent writers (the
/// fan-in loop and the periodic resync) cannot push it negative.
#[derive(Debug, Default)]
pub struct UnreadCounter(AtomicI64);

impl UnreadCounter {
    pub fn new(initial: i64) -> Self {
        Self(AtomicI64::new(initial.max(0)))
    }

    pub fn get(&self) -> i64 {
        self.0.load(Ordering::Acquire)
    }

    /// Add one unread notification. Returns the new value.
    pub fn increment(&self) -> i64 {
        self.update(|current| current.saturating_add(1))
    }

    /// Subtract `count` read notifications, flooring at zero.
    pub fn decrease_by(&self, count: i64) -> i64 {
        self.update(|current| current.saturating_sub(count.max(0)).max(0))
    }

    /// Replace the value with an authoritative count.
    pub fn set(&self, count: i64) -> i64 {
        let count = count.max(0);
        self.0.store(count, Ordering::Release);
        count
    }

    fn update(&self, f: impl Fn(i64) -> i64) -> i64 {
        let mut current = self.0.load(Ordering::Acquire);
        loop {
            let next = f(current);
            match self
                .0
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_increment_and_decrease() {
        let counter = UnreadCounter::new(2);
        assert_eq!(counter.increment(), 3);
        assert_eq!(counter.decrease_by(2), 1);
        assert_eq!(counter.get(), 1);
    }

    #[test]
    fn test_floor_at_zero() {
        let counter = UnreadCounter::new(1);
        assert_eq!(counter.decrease_by(5), 0);
        assert_eq!(UnreadCounter::new(-3).get(), 0);
        assert_eq!(counter.set(-1), 0);
        assert_eq!(counter.decrease_by(-4), 0);
    }

    #[test]
    fn test_concurrent_writers_never_negative() {
        let counter = Arc::new(UnreadCounter::new(0));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let counter = counter.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        if i % 2 == 0 {
                            counter.increment();
                        } else {
                            let value = counter.decrease_by(3);
                            assert!(value >= 0);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().is_ok());
        }
        assert!(counter.get() >= 0);
    }
}
