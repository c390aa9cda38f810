//! Counting semaphore that bounds the number of running workers.

use std::sync::{Condvar, Mutex, MutexGuard};

#[derive(Debug)]
pub struct WorkerGate {
    available: Mutex<usize>,
    returned: Condvar,
}

/// A held worker slot. Dropping it returns the slot to its gate.
#[derive(Debug)]
pub struct Permit<'a> {
    gate: &'a WorkerGate,
}

impl WorkerGate {
    /// A gate with `permits` slots; zero is treated as one.
    pub fn new(permits: usize) -> Self {
        WorkerGate {
            available: Mutex::new(permits.max(1)),
            returned: Condvar::new(),
        }
    }

    /// Block until a slot is free and take it.
    pub fn acquire(&self) -> Permit<'_> {
        let mut available = self
            .returned
            .wait_while(self.lock(), |available| *available == 0)
            .unwrap_or_else(|e| e.into_inner());
        *available -= 1;
        Permit { gate: self }
    }

    /// Take a slot only if one is free right now.
    #[cfg(test)]
    fn try_acquire(&self) -> Option<Permit<'_>> {
        let mut available = self.lock();
        if *available == 0 {
            return None;
        }
        *available -= 1;
        Some(Permit { gate: self })
    }

    pub fn available(&self) -> usize {
        *self.lock()
    }

    fn lock(&self) -> MutexGuard<'_, usize> {
        self.available.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        *self.gate.lock() += 1;
        self.gate.returned.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_permits_are_returned_on_drop() {
        let gate = WorkerGate::new(2);
        let a = gate.acquire();
        let b = gate.acquire();
        assert!(gate.try_acquire().is_none());
        drop(a);
        assert_eq!(gate.available(), 1);
        drop(b);
        assert_eq!(gate.available(), 2);
    }

    #[test]
    fn test_zero_permits_means_one() {
        let gate = WorkerGate::new(0);
        let held = gate.acquire();
        assert!(gate.try_acquire().is_none());
        drop(held);
    }

    #[test]
    fn test_concurrency_never_exceeds_permits() {
        let gate = WorkerGate::new(3);
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        std::thread::scope(|scope| {
            for _ in 0..16 {
                let permit = gate.acquire();
                let (running, peak) = (&running, &peak);
                scope.spawn(move || {
                    let _permit = permit;
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(2));
                    running.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(gate.available(), 3);
    }
}
