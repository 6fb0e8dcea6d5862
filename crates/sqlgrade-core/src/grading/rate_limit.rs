use crate::config::RateLimitConfig;
use crate::errors::GradeError;
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Admission control in front of sandbox provisioning.
///
/// A GCRA bucket per (user, problem) bounds attempt frequency; a per-user
/// counter bounds how many attempts one user has in flight at once.
pub struct RateLimiter {
    attempts: DefaultKeyedRateLimiter<(String, String)>,
    clock: DefaultClock,
    in_flight: Arc<Mutex<HashMap<String, usize>>>,
    max_concurrent_per_user: usize,
}

/// Held for the duration of an attempt; releases the user's slot on drop.
#[derive(Debug)]
pub struct InFlightPermit {
    users: Arc<Mutex<HashMap<String, usize>>>,
    user_id: String,
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        let mut users = self.users.lock().unwrap();
        if let Some(n) = users.get_mut(&self.user_id) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                users.remove(&self.user_id);
            }
        }
    }
}

impl RateLimiter {
    pub fn new(cfg: &RateLimitConfig) -> Self {
        let burst = NonZeroU32::new(cfg.burst).unwrap_or(NonZeroU32::MIN);
        let window = Duration::from_secs(cfg.window_seconds.max(1));
        let quota = Quota::with_period(window / burst.get())
            .unwrap_or_else(|| Quota::per_second(burst))
            .allow_burst(burst);
        Self {
            attempts: governor::RateLimiter::keyed(quota),
            clock: DefaultClock::default(),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            max_concurrent_per_user: cfg.max_concurrent_per_user.max(1),
        }
    }

    /// Takes a concurrency slot, then spends one token. A rejected attempt
    /// gives the slot back and leaves no other trace.
    pub fn admit(&self, user_id: &str, problem_id: &str) -> Result<InFlightPermit, GradeError> {
        let permit = self.enter(user_id)?;

        let key = (user_id.to_string(), problem_id.to_string());
        if let Err(not_until) = self.attempts.check_key(&key) {
            let retry_after_ms = not_until.wait_time_from(self.clock.now()).as_millis() as u64;
            tracing::info!(
                event = "rate_limited",
                user = %user_id,
                problem = %problem_id,
                retry_after_ms,
            );
            return Err(GradeError::RateLimited { retry_after_ms });
        }

        if self.attempts.len() > 10_000 {
            self.attempts.retain_recent();
        }
        Ok(permit)
    }

    fn enter(&self, user_id: &str) -> Result<InFlightPermit, GradeError> {
        let mut users = self.in_flight.lock().unwrap();
        let n = users.entry(user_id.to_string()).or_insert(0);
        if *n >= self.max_concurrent_per_user {
            tracing::info!(event = "too_many_concurrent", user = %user_id, in_flight = *n);
            return Err(GradeError::TooManyConcurrent {
                max: self.max_concurrent_per_user,
            });
        }
        *n += 1;
        Ok(InFlightPermit {
            users: self.in_flight.clone(),
            user_id: user_id.to_string(),
        })
    }

    pub fn in_flight(&self, user_id: &str) -> usize {
        self.in_flight
            .lock()
            .unwrap()
            .get(user_id)
            .copied()
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(burst: u32, concurrent: usize) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            burst,
            window_seconds: 60,
            max_concurrent_per_user: concurrent,
        })
    }

    #[test]
    fn test_burst_then_throttle_per_key() {
        let l = limiter(2, 10);
        assert!(l.admit("u1", "p1").is_ok());
        assert!(l.admit("u1", "p1").is_ok());
        match l.admit("u1", "p1") {
            Err(GradeError::RateLimited { retry_after_ms }) => {
                assert!(retry_after_ms > 0 && retry_after_ms <= 30_000)
            }
            other => panic!("expected rate limit, got {other:?}"),
        }
        // Other problems and other users have their own buckets.
        assert!(l.admit("u1", "p2").is_ok());
        assert!(l.admit("u2", "p1").is_ok());
    }

    #[test]
    fn test_concurrency_cap_releases_on_drop() {
        let l = limiter(100, 2);
        let a = l.admit("u1", "p1").unwrap();
        let _b = l.admit("u1", "p2").unwrap();
        assert!(matches!(
            l.admit("u1", "p3"),
            Err(GradeError::TooManyConcurrent { max: 2 })
        ));
        assert_eq!(l.in_flight("u1"), 2);
        drop(a);
        assert_eq!(l.in_flight("u1"), 1);
        assert!(l.admit("u1", "p3").is_ok());
    }

    #[test]
    fn test_rejected_attempt_frees_slot() {
        let l = limiter(1, 1);
        drop(l.admit("u1", "p1").unwrap());
        assert!(l.admit("u1", "p1").is_err());
        assert_eq!(l.in_flight("u1"), 0);
    }
}
