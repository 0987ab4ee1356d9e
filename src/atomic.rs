use std::sync::atomic::{AtomicI64, Ordering};

/// A process-local atomic integer counter.
///
/// Used for progress tracking (`num_nodes`) and for round-robin queue
/// selection in [`crate::task::TaskSystem`]. All operations are a single
/// atomic instruction; there is no locking.
#[derive(Debug, Default)]
pub struct AtomicCounter {
    value: AtomicI64,
}

impl AtomicCounter {
    /// Creates a new counter starting at zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            value: AtomicI64::new(0),
        }
    }

    /// Reads the current value.
    #[must_use]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::SeqCst)
    }

    /// Overwrites the current value.
    pub fn set(&self, to: i64) {
        self.value.store(to, Ordering::SeqCst);
    }

    /// Adds `by` to the current value.
    pub fn increment(&self, by: i64) {
        self.value.fetch_add(by, Ordering::SeqCst);
    }

    /// Atomically replaces the value with `to`, returning the prior value.
    pub fn get_and_set(&self, to: i64) -> i64 {
        self.value.swap(to, Ordering::SeqCst)
    }

    /// Atomically adds `by`, returning the value prior to the increment.
    pub fn get_and_inc(&self, by: i64) -> i64 {
        self.value.fetch_add(by, Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::AtomicCounter;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn get_and_inc_is_linearizable() {
        let counter = Arc::new(AtomicCounter::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    c.get_and_inc(1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.get(), 8000);
    }

    #[test]
    fn get_and_set_returns_prior_value() {
        let counter = AtomicCounter::new();
        counter.set(5);
        assert_eq!(counter.get_and_set(10), 5);
        assert_eq!(counter.get(), 10);
    }
}
