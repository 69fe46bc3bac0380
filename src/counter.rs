//! Atomic counter shared between execution units.

use crossbeam_utils::CachePadded;
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// A 64-bit counter every unit can update without going through the pool.
///
/// Cloning is cheap and yields a handle to the same value. All updates go
/// through atomic add or compare-and-swap, so concurrent updates are never
/// lost. The value sits on its own cache line.
#[derive(Clone, Default)]
pub struct SharedCounter {
    value: Arc<CachePadded<AtomicI64>>,
}

impl SharedCounter {
    pub fn new(initial: i64) -> Self {
        Self {
            value: Arc::new(CachePadded::new(AtomicI64::new(initial))),
        }
    }

    /// Add `delta` and return the previous value. Wraps on overflow.
    pub fn add(&self, delta: i64) -> i64 {
        self.value.fetch_add(delta, Ordering::AcqRel)
    }

    pub fn increment(&self) -> i64 {
        self.add(1)
    }

    /// Store `new` if the current value is `expected`.
    pub fn compare_and_swap(&self, expected: i64, new: i64) -> bool {
        self.value
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn load(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    /// Apply `f` atomically, retrying on contention.
    ///
    /// Returns `Ok(previous)` once `f`'s value is stored, or `Err(current)` if
    /// `f` returned `None`.
    pub fn fetch_update<F>(&self, mut f: F) -> Result<i64, i64>
    where
        F: FnMut(i64) -> Option<i64>,
    {
        let mut current = self.load();
        loop {
            let new = match f(current) {
                Some(new) => new,
                None => return Err(current),
            };
            match self
                .value
                .compare_exchange_weak(current, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(previous) => return Ok(previous),
                Err(actual) => current = actual,
            }
        }
    }

    /// Whether both handles point at the same counter.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

impl fmt::Debug for SharedCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SharedCounter").field(&self.load()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_add_returns_previous() {
        let counter = SharedCounter::new(10);
        assert_eq!(counter.add(5), 10);
        assert_eq!(counter.add(-3), 15);
        assert_eq!(counter.load(), 12);
    }

    #[test]
    fn test_compare_and_swap() {
        let counter = SharedCounter::new(1);
        assert!(!counter.compare_and_swap(0, 5));
        assert_eq!(counter.load(), 1);
        assert!(counter.compare_and_swap(1, 5));
        assert_eq!(counter.load(), 5);
    }

    #[test]
    fn test_fetch_update_bounded_increment() {
        let counter = SharedCounter::new(2);
        let cap = |v: i64| if v < 3 { Some(v + 1) } else { None };

        assert_eq!(counter.fetch_update(cap), Ok(2));
        assert_eq!(counter.fetch_update(cap), Err(3));
        assert_eq!(counter.load(), 3);
    }

    #[test]
    fn test_clones_share_value() {
        let a = SharedCounter::default();
        let b = a.clone();
        b.increment();
        assert_eq!(a.load(), 1);
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&SharedCounter::default()));
    }

    #[test]
    fn test_no_lost_updates_across_threads() {
        const THREADS: i64 = 8;
        const PER_THREAD: i64 = 10_000;

        let counter = SharedCounter::new(0);
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..PER_THREAD {
                        counter.add(1);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(counter.load(), THREADS * PER_THREAD);
    }

    #[test]
    fn test_cas_loop_under_contention() {
        let counter = SharedCounter::new(0);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        let _ = counter.fetch_update(|v| Some(v + 2));
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(counter.load(), 8_000);
    }
}
