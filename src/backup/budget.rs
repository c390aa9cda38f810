//! Shared budget of uncompressed bytes in flight.
//!
//! A task reserves its bytes before it starts and gives them back when its
//! [`Reservation`] drops, whether it finished, failed or unwound. A task is
//! admitted once `in_flight + bytes <= limit`; reservations are clamped to
//! the limit, so any single task is always admissible on an idle budget.

use std::sync::{Condvar, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct BudgetState {
    in_flight: u64,
    peak: u64,
}

#[derive(Debug)]
pub struct ByteBudget {
    limit: u64,
    state: Mutex<BudgetState>,
    released: Condvar,
}

/// Bytes held against a [`ByteBudget`] until dropped.
#[derive(Debug)]
pub struct Reservation<'a> {
    budget: &'a ByteBudget,
    bytes: u64,
}

impl Reservation<'_> {
    #[cfg(test)]
    fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl ByteBudget {
    /// A budget of `limit` bytes; zero is treated as one.
    pub fn new(limit: u64) -> Self {
        ByteBudget {
            limit: limit.max(1),
            state: Mutex::new(BudgetState::default()),
            released: Condvar::new(),
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Block until `bytes` fit and reserve them.
    pub fn reserve(&self, bytes: u64) -> Reservation<'_> {
        self.reserve_with(bytes, |_| ()).0
    }

    /// Block until `bytes` fit, reserve them, and run `decide` under the
    /// same lock with the headroom left before this reservation.
    pub fn reserve_with<T>(
        &self,
        bytes: u64,
        decide: impl FnOnce(u64) -> T,
    ) -> (Reservation<'_>, T) {
        let bytes = bytes.min(self.limit);
        let mut state = self
            .released
            .wait_while(self.lock(), |s| s.in_flight + bytes > self.limit)
            .unwrap_or_else(|e| e.into_inner());

        let decision = decide(self.limit - state.in_flight);
        state.in_flight += bytes;
        state.peak = state.peak.max(state.in_flight);

        (
            Reservation {
                budget: self,
                bytes,
            },
            decision,
        )
    }

    pub fn in_flight(&self) -> u64 {
        self.lock().in_flight
    }

    /// Highest `in_flight` value observed so far.
    pub fn peak(&self) -> u64 {
        self.lock().peak
    }

    fn lock(&self) -> MutexGuard<'_, BudgetState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.budget.lock().in_flight -= self.bytes;
        self.budget.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_reserve_and_release() {
        let budget = ByteBudget::new(100);
        let a = budget.reserve(60);
        assert_eq!(budget.in_flight(), 60);
        let b = budget.reserve(40);
        assert_eq!(budget.in_flight(), 100);
        drop(a);
        drop(b);
        assert_eq!(budget.in_flight(), 0);
        assert_eq!(budget.peak(), 100);
    }

    #[test]
    fn test_reservation_equal_to_limit_is_admitted() {
        let budget = ByteBudget::new(64);
        let held = budget.reserve(64);
        assert_eq!(held.bytes(), 64);
    }

    #[test]
    fn test_oversized_reservation_is_clamped() {
        let budget = ByteBudget::new(64);
        let held = budget.reserve(1 << 40);
        assert_eq!(held.bytes(), 64);
        assert_eq!(budget.in_flight(), 64);
    }

    #[test]
    fn test_headroom_is_measured_before_reserving() {
        let budget = ByteBudget::new(1000);
        let _first = budget.reserve(300);
        let (_second, headroom) = budget.reserve_with(200, |headroom| headroom);
        assert_eq!(headroom, 700);
        assert_eq!(budget.in_flight(), 500);
    }

    #[test]
    fn test_waiter_wakes_on_release() {
        let budget = ByteBudget::new(10);
        std::thread::scope(|scope| {
            let held = budget.reserve(8);
            let waiter = scope.spawn(|| {
                let r = budget.reserve(5);
                r.bytes()
            });
            std::thread::sleep(Duration::from_millis(20));
            assert_eq!(budget.in_flight(), 8);
            drop(held);
            assert_eq!(waiter.join().unwrap(), 5);
        });
        assert_eq!(budget.in_flight(), 0);
    }

    #[test]
    fn test_peak_never_exceeds_limit_under_contention() {
        let budget = ByteBudget::new(1000);
        std::thread::scope(|scope| {
            for i in 0..32u64 {
                let budget = &budget;
                scope.spawn(move || {
                    let _held = budget.reserve(100 + i * 37 % 400);
                    std::thread::sleep(Duration::from_millis(1));
                });
            }
        });
        assert!(budget.peak() <= 1000);
        assert!(budget.peak() >= 100);
        assert_eq!(budget.in_flight(), 0);
    }
}
