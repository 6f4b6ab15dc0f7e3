//! Sliding-window limiter for failed authentication attempts.
//!
//! Per-source counters of failure timestamps that decay over a rolling
//! window. A source that has failed `max_failures` times inside the window
//! is refused before its credential is even sent to the verifier.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// A sliding-window counter with a configurable limit.
#[derive(Debug)]
pub struct RateLimiter {
    /// Maximum events allowed within the window.
    max_events: u32,
    /// Duration of the sliding window.
    window: Duration,
    /// Per-key tracking: key → event timestamps.
    entries: HashMap<IpAddr, Vec<Instant>>,
}

impl RateLimiter {
    pub fn new(max_events: u32, window: Duration) -> Self {
        Self {
            max_events,
            window,
            entries: HashMap::new(),
        }
    }

    /// Record one event for `key`.
    pub fn record(&mut self, key: IpAddr) {
        let now = Instant::now();
        let window = self.window;
        let events = self.entries.entry(key).or_default();
        events.retain(|t| now.duration_since(*t) < window);
        events.push(now);
    }

    /// Whether `key` is still under the limit.
    pub fn check(&self, key: IpAddr) -> bool {
        let now = Instant::now();
        match self.entries.get(&key) {
            Some(events) => {
                let active = events
                    .iter()
                    .filter(|t| now.duration_since(**t) < self.window)
                    .count();
                (active as u32) < self.max_events
            }
            None => true,
        }
    }

    /// Forget `key` entirely.
    pub fn reset(&mut self, key: IpAddr) {
        self.entries.remove(&key);
    }

    /// Garbage-collect expired entries to prevent memory growth.
    pub fn gc(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.entries.retain(|_, events| {
            events.retain(|t| now.duration_since(*t) < window);
            !events.is_empty()
        });
    }

    pub fn tracked(&self) -> usize {
        self.entries.len()
    }
}

/// Thread-safe wrapper shared by all front ends.
#[derive(Debug)]
pub struct AuthFailureLimiter {
    inner: Mutex<RateLimiter>,
}

impl AuthFailureLimiter {
    pub fn new(max_failures: u32, window: Duration) -> Self {
        Self {
            inner: Mutex::new(RateLimiter::new(max_failures, window)),
        }
    }

    pub fn is_allowed(&self, source: IpAddr) -> bool {
        self.lock().check(source)
    }

    pub fn record_failure(&self, source: IpAddr) {
        self.lock().record(source);
    }

    pub fn record_success(&self, source: IpAddr) {
        self.lock().reset(source);
    }

    pub fn gc(&self) {
        self.lock().gc();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RateLimiter> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn blocks_after_limit() {
        let limiter = AuthFailureLimiter::new(3, Duration::from_secs(60));
        let src = ip("203.0.113.7");
        for _ in 0..3 {
            assert!(limiter.is_allowed(src));
            limiter.record_failure(src);
        }
        assert!(!limiter.is_allowed(src));
        assert!(limiter.is_allowed(ip("203.0.113.8")));
    }

    #[test]
    fn success_resets() {
        let limiter = AuthFailureLimiter::new(1, Duration::from_secs(60));
        let src = ip("10.200.0.9");
        limiter.record_failure(src);
        assert!(!limiter.is_allowed(src));
        limiter.record_success(src);
        assert!(limiter.is_allowed(src));
    }

    #[test]
    fn window_expires() {
        let mut limiter = RateLimiter::new(1, Duration::from_millis(20));
        let src = ip("10.0.0.1");
        limiter.record(src);
        assert!(!limiter.check(src));
        std::thread::sleep(Duration::from_millis(40));
        assert!(limiter.check(src));
        limiter.gc();
        assert_eq!(limiter.tracked(), 0);
    }
}
