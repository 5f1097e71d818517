//! Per-target retry backoff

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Largest exponent applied to the base delay
const MAX_BACKOFF_EXPONENT: u32 = 30;

/// Exponential backoff tracked separately for every target name.
///
/// The n-th consecutive failure of a name waits `base * 2^(n-1)`, capped at
/// `max`. [`forget`](Self::forget) resets a name after a successful sync.
#[derive(Debug)]
pub struct ItemBackoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl ItemBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure and return how long to wait before the next attempt
    pub fn next_delay(&self, name: &str) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(name.to_string()).or_insert(0);
        let exponent = (*count).min(MAX_BACKOFF_EXPONENT);
        *count = count.saturating_add(1);

        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |delay| delay.min(self.max))
    }

    /// Consecutive failures recorded for a name
    pub fn failures(&self, name: &str) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    /// Reset a name after success
    pub fn forget(&self, name: &str) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_per_failure() {
        let backoff = ItemBackoff::new(Duration::from_millis(5), Duration::from_secs(1000));
        assert_eq!(backoff.next_delay("etcd"), Duration::from_millis(5));
        assert_eq!(backoff.next_delay("etcd"), Duration::from_millis(10));
        assert_eq!(backoff.next_delay("etcd"), Duration::from_millis(20));
        assert_eq!(backoff.failures("etcd"), 3);
    }

    #[test]
    fn delay_is_capped() {
        let backoff = ItemBackoff::new(Duration::from_secs(1), Duration::from_secs(10));
        for _ in 0..10 {
            backoff.next_delay("etcd");
        }
        assert_eq!(backoff.next_delay("etcd"), Duration::from_secs(10));
    }

    #[test]
    fn names_are_independent() {
        let backoff = ItemBackoff::new(Duration::from_millis(5), Duration::from_secs(1));
        backoff.next_delay("etcd");
        backoff.next_delay("etcd");
        assert_eq!(backoff.next_delay("kube-apiserver"), Duration::from_millis(5));
    }

    #[test]
    fn forget_resets() {
        let backoff = ItemBackoff::new(Duration::from_millis(5), Duration::from_secs(1));
        backoff.next_delay("etcd");
        backoff.next_delay("etcd");
        backoff.forget("etcd");
        assert_eq!(backoff.failures("etcd"), 0);
        assert_eq!(backoff.next_delay("etcd"), Duration::from_millis(5));
    }

    #[test]
    fn never_overflows() {
        let backoff = ItemBackoff::new(Duration::from_secs(u64::MAX / 4), Duration::MAX);
        for _ in 0..100 {
            let _ = backoff.next_delay("etcd");
        }
        assert_eq!(backoff.failures("etcd"), 100);
    }
}
