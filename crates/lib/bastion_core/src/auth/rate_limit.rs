//! Login rate limiting per client identity.
//!
//! A fixed window starts at the first failed attempt. Once `max_attempts`
//! failures have been recorded inside the window, further attempts are
//! denied until the window elapses. A successful login clears the entry.
//!
//! Counters are updated under the map's per-shard lock, so increments for a
//! key are atomic. Two logins racing on the threshold may both be admitted;
//! this is a deterrent, not a hard cap.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::AuthError;
use crate::config::AuthConfig;

/// How often the background task purges elapsed windows.
pub const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Outcome of [`LoginRateLimiter::admit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed { limit: u32, remaining: u32 },
    Limited { limit: u32, retry_after: Duration },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed { .. })
    }

    /// `Ok(remaining)` when admitted, `RateLimited` otherwise.
    pub fn into_result(self) -> Result<u32, AuthError> {
        match self {
            RateLimitDecision::Allowed { remaining, .. } => Ok(remaining),
            RateLimitDecision::Limited { limit, retry_after } => {
                Err(AuthError::RateLimited { limit, retry_after })
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct AttemptCounter {
    count: u32,
    window_start: Instant,
    last_seen: Instant,
}

/// Per-client failed-login counter with time-boxed lockout and a cap on the
/// number of tracked identities.
#[derive(Debug)]
pub struct LoginRateLimiter {
    attempts: DashMap<String, AttemptCounter>,
    max_attempts: u32,
    window: Duration,
    capacity: usize,
}

impl LoginRateLimiter {
    pub fn new(max_attempts: u32, window: Duration, capacity: usize) -> Self {
        Self {
            attempts: DashMap::new(),
            max_attempts,
            window,
            capacity: capacity.max(1),
        }
    }

    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(
            config.max_login_attempts,
            config.lockout_window(),
            config.rate_limit_capacity,
        )
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Number of identities currently tracked.
    pub fn tracked(&self) -> usize {
        self.attempts.len()
    }

    pub fn admit(&self, client: &str) -> RateLimitDecision {
        self.admit_at(client, Instant::now())
    }

    pub fn admit_at(&self, client: &str, now: Instant) -> RateLimitDecision {
        let full = RateLimitDecision::Allowed {
            limit: self.max_attempts,
            remaining: self.max_attempts,
        };
        let Some((count, window_start)) = self
            .attempts
            .get(client)
            .map(|e| (e.count, e.window_start))
        else {
            return full;
        };

        let reset_at = window_start + self.window;
        if now >= reset_at {
            self.attempts
                .remove_if(client, |_, e| now >= e.window_start + self.window);
            return full;
        }
        if count >= self.max_attempts {
            return RateLimitDecision::Limited {
                limit: self.max_attempts,
                retry_after: reset_at - now,
            };
        }
        RateLimitDecision::Allowed {
            limit: self.max_attempts,
            remaining: self.max_attempts - count,
        }
    }

    /// Record how a login attempt ended. Returns the attempts remaining.
    pub fn record_outcome(&self, client: &str, success: bool) -> u32 {
        self.record_outcome_at(client, success, Instant::now())
    }

    pub fn record_outcome_at(&self, client: &str, success: bool, now: Instant) -> u32 {
        if success {
            self.attempts.remove(client);
            return self.max_attempts;
        }

        if !self.attempts.contains_key(client) && self.attempts.len() >= self.capacity {
            self.make_room(now);
        }

        let mut entry = self
            .attempts
            .entry(client.to_string())
            .or_insert_with(|| AttemptCounter {
                count: 0,
                window_start: now,
                last_seen: now,
            });
        if now >= entry.window_start + self.window {
            entry.count = 0;
            entry.window_start = now;
        }
        entry.count = entry.count.saturating_add(1);
        entry.last_seen = now;
        self.max_attempts.saturating_sub(entry.count)
    }

    /// Drop every entry whose window has elapsed.
    pub fn purge_expired_at(&self, now: Instant) -> usize {
        let before = self.attempts.len();
        self.attempts
            .retain(|_, e| now < e.window_start + self.window);
        before.saturating_sub(self.attempts.len())
    }

    /// Purge elapsed windows, then evict the least recently active entry if
    /// the map is still at capacity.
    fn make_room(&self, now: Instant) {
        self.purge_expired_at(now);
        if self.attempts.len() < self.capacity {
            return;
        }
        let oldest = self
            .attempts
            .iter()
            .min_by_key(|e| e.last_seen)
            .map(|e| e.key().clone());
        if let Some(key) = oldest {
            debug!(client = %key, "rate limiter at capacity, evicting oldest entry");
            self.attempts.remove(&key);
        }
    }

    /// Spawn a periodic purge task. Stops when `shutdown` is cancelled.
    pub fn spawn_purge_task(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PURGE_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let purged = limiter.purge_expired_at(Instant::now());
                        if purged > 0 {
                            debug!(purged, "rate limiter purged elapsed windows");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(15 * 60);

    fn limiter() -> LoginRateLimiter {
        LoginRateLimiter::new(5, WINDOW, 100)
    }

    #[test]
    fn unknown_client_is_admitted_with_full_budget() {
        let l = limiter();
        assert_eq!(
            l.admit("1.2.3.4"),
            RateLimitDecision::Allowed {
                limit: 5,
                remaining: 5
            }
        );
    }

    #[test]
    fn denies_after_max_failures() {
        let l = limiter();
        let t0 = Instant::now();
        for i in 0..5 {
            assert!(l.admit_at("c", t0).is_allowed(), "attempt {i} should pass");
            l.record_outcome_at("c", false, t0);
        }
        match l.admit_at("c", t0 + Duration::from_secs(60)) {
            RateLimitDecision::Limited { limit, retry_after } => {
                assert_eq!(limit, 5);
                assert_eq!(retry_after, WINDOW - Duration::from_secs(60));
            }
            other => panic!("expected Limited, got {other:?}"),
        }
    }

    #[test]
    fn limited_decision_converts_to_error() {
        let l = limiter();
        let t0 = Instant::now();
        for _ in 0..5 {
            l.record_outcome_at("c", false, t0);
        }
        assert_eq!(l.admit_at("c", t0 + WINDOW / 2).into_result().ok(), None);
        match l.admit_at("c", t0).into_result() {
            Err(AuthError::RateLimited { limit, retry_after }) => {
                assert_eq!(limit, 5);
                assert_eq!(retry_after, WINDOW);
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
        assert_eq!(l.admit_at("other", t0).into_result().unwrap(), 5);
    }

    #[test]
    fn remaining_counts_down() {
        let l = limiter();
        let t0 = Instant::now();
        assert_eq!(l.record_outcome_at("c", false, t0), 4);
        assert_eq!(l.record_outcome_at("c", false, t0), 3);
        assert_eq!(
            l.admit_at("c", t0),
            RateLimitDecision::Allowed {
                limit: 5,
                remaining: 3
            }
        );
    }

    #[test]
    fn success_resets_counter() {
        let l = limiter();
        let t0 = Instant::now();
        for _ in 0..4 {
            l.record_outcome_at("c", false, t0);
        }
        l.record_outcome_at("c", true, t0);
        assert_eq!(l.tracked(), 0);
        for _ in 0..4 {
            l.record_outcome_at("c", false, t0);
        }
        assert!(l.admit_at("c", t0).is_allowed());
    }

    #[test]
    fn lockout_ends_when_window_elapses() {
        let l = limiter();
        let t0 = Instant::now();
        for _ in 0..5 {
            l.record_outcome_at("c", false, t0);
        }
        assert!(!l.admit_at("c", t0 + WINDOW - Duration::from_secs(1)).is_allowed());
        assert!(l.admit_at("c", t0 + WINDOW).is_allowed());
        assert_eq!(l.tracked(), 0);
    }

    #[test]
    fn failure_after_window_starts_fresh() {
        let l = limiter();
        let t0 = Instant::now();
        for _ in 0..4 {
            l.record_outcome_at("c", false, t0);
        }
        let later = t0 + WINDOW + Duration::from_secs(1);
        assert_eq!(l.record_outcome_at("c", false, later), 4);
    }

    #[test]
    fn clients_are_independent() {
        let l = limiter();
        let t0 = Instant::now();
        for _ in 0..5 {
            l.record_outcome_at("a", false, t0);
        }
        assert!(!l.admit_at("a", t0).is_allowed());
        assert!(l.admit_at("b", t0).is_allowed());
    }

    #[test]
    fn purge_drops_elapsed_windows() {
        let l = limiter();
        let t0 = Instant::now();
        l.record_outcome_at("old", false, t0);
        l.record_outcome_at("new", false, t0 + Duration::from_secs(600));
        assert_eq!(l.purge_expired_at(t0 + WINDOW), 1);
        assert_eq!(l.tracked(), 1);
    }

    #[test]
    fn capacity_evicts_least_recently_active() {
        let l = LoginRateLimiter::new(5, WINDOW, 2);
        let t0 = Instant::now();
        l.record_outcome_at("a", false, t0);
        l.record_outcome_at("b", false, t0 + Duration::from_secs(1));
        l.record_outcome_at("a", false, t0 + Duration::from_secs(2));
        l.record_outcome_at("c", false, t0 + Duration::from_secs(3));
        assert_eq!(l.tracked(), 2);
        // "b" was the least recently active.
        assert_eq!(
            l.admit_at("a", t0 + Duration::from_secs(3)),
            RateLimitDecision::Allowed {
                limit: 5,
                remaining: 3
            }
        );
        assert_eq!(
            l.admit_at("b", t0 + Duration::from_secs(3)),
            RateLimitDecision::Allowed {
                limit: 5,
                remaining: 5
            }
        );
    }

    #[test]
    fn concurrent_failures_are_all_counted() {
        let l = Arc::new(LoginRateLimiter::new(1_000, WINDOW, 10));
        let t0 = Instant::now();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let l = Arc::clone(&l);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        l.record_outcome_at("c", false, t0);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(
            l.admit_at("c", t0),
            RateLimitDecision::Allowed {
                limit: 1_000,
                remaining: 600
            }
        );
    }
}
