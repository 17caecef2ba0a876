//! Requeue delays for failed reconciles.

use parking_lot::Mutex;
use std::{
    collections::HashMap,
    hash::Hash,
    time::{Duration, Instant},
};

const BASE_DELAY: Duration = Duration::from_millis(200);
const MAX_DELAY: Duration = Duration::from_secs(5);
const RATE_PER_SEC: f64 = 10.0;
const BURST: f64 = 100.0;

/// Computes how long to wait before retrying a failed object.
///
/// Each object backs off exponentially on its own; every retry also draws
/// from a shared token bucket. The longer of the two delays is used.
#[derive(Debug)]
pub struct RetryPolicy<K> {
    failures: Mutex<HashMap<K, u32>>,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    updated: Option<Instant>,
}

// === impl RetryPolicy ===

impl<K: Eq + Hash> Default for RetryPolicy<K> {
    fn default() -> Self {
        Self {
            failures: Mutex::new(HashMap::new()),
            bucket: Mutex::new(Bucket {
                tokens: BURST,
                updated: None,
            }),
        }
    }
}

impl<K: Eq + Hash> RetryPolicy<K> {
    /// Records a failure of `key` and returns the delay before its retry.
    pub fn failed(&self, key: K, now: Instant) -> Duration {
        let backoff = {
            let mut failures = self.failures.lock();
            let n = failures.entry(key).or_default();
            let delay = backoff(*n);
            *n = n.saturating_add(1);
            delay
        };
        let limited = self.bucket.lock().take(now);
        backoff.max(limited)
    }

    /// Resets the backoff of `key` after a successful reconcile.
    pub fn succeeded(&self, key: &K) {
        self.failures.lock().remove(key);
    }

    pub fn failures(&self, key: &K) -> u32 {
        self.failures.lock().get(key).copied().unwrap_or(0)
    }
}

fn backoff(failures: u32) -> Duration {
    let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
    BASE_DELAY.saturating_mul(factor).min(MAX_DELAY)
}

// === impl Bucket ===

impl Bucket {
    /// Takes a token, returning how long the caller must wait for it.
    fn take(&mut self, now: Instant) -> Duration {
        if let Some(updated) = self.updated {
            let elapsed = now.saturating_duration_since(updated).as_secs_f64();
            self.tokens = (self.tokens + elapsed * RATE_PER_SEC).min(BURST);
        }
        self.updated = Some(now);
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(-self.tokens / RATE_PER_SEC)
    }
}
