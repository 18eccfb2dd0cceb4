//! CPU permit accounting

use std::sync::atomic::{AtomicUsize, Ordering};

/// Counting semaphore with `core_pool_size` permits gating admission to
/// CPU-bound scheduling.
///
/// Only non-blocking acquisition is ever needed, so this is a bare atomic
/// counter: `try_acquire` never parks and `release` never wakes anyone.
/// Wakeups are the scheduler's job (`request_cpu_worker`).
pub(crate) struct CpuPermits {
    available: AtomicUsize,
    total: usize,
}

impl CpuPermits {
    /// Create with all `total` permits available
    pub(crate) fn new(total: usize) -> Self {
        Self {
            available: AtomicUsize::new(total),
            total,
        }
    }

    /// Try to take one permit; returns false when all cores are busy
    pub(crate) fn try_acquire(&self) -> bool {
        let mut current = self.available.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return false;
            }
            match self.available.compare_exchange(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Return a previously acquired permit
    pub(crate) fn release(&self) {
        let previous = self.available.fetch_add(1, Ordering::AcqRel);
        debug_assert!(previous < self.total, "CPU permit released twice");
    }

    /// Number of currently available permits (racy snapshot)
    pub(crate) fn available(&self) -> usize {
        self.available.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_until_exhausted() {
        let permits = CpuPermits::new(2);

        assert!(permits.try_acquire());
        assert!(permits.try_acquire());
        assert!(!permits.try_acquire());
        assert_eq!(permits.available(), 0);
    }

    #[test]
    fn test_release_makes_permit_available() {
        let permits = CpuPermits::new(1);

        assert!(permits.try_acquire());
        assert!(!permits.try_acquire());

        permits.release();
        assert_eq!(permits.available(), 1);
        assert!(permits.try_acquire());
    }

    #[test]
    fn test_concurrent_acquire_never_oversubscribes() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let permits = Arc::new(CpuPermits::new(4));
        let acquired = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let permits = permits.clone();
                let acquired = acquired.clone();
                std::thread::spawn(move || {
                    if permits.try_acquire() {
                        acquired.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let taken = acquired.load(Ordering::Relaxed);
        assert!(taken <= 4);
        assert_eq!(permits.available(), 4 - taken);
    }
}
