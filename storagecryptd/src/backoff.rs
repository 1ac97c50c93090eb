use rand::Rng;
use std::time::Duration;

/// Retry delay for a document whose action keeps failing transiently.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    /// `base * 2^attempt` capped at `max`; with jitter, a uniform pick in
    /// the upper half of that window.
    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let cap = u64::try_from(self.max.as_millis()).unwrap_or(u64::MAX);
        let base = u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX);
        let window = base.saturating_mul(1 << attempt.min(16)).min(cap);
        let millis = if self.jitter {
            rng.gen_range(window / 2..=window)
        } else {
            window
        };
        Duration::from_millis(millis)
    }
}

/// Account-scoped delay applied after a provider throttles us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub initial_ms: i64,
    pub max_ms: i64,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            initial_ms: 10_000,
            max_ms: 600_000,
        }
    }
}

impl RateLimitPolicy {
    /// Delay to store after one more throttled response.
    ///
    /// Starts at `initial_ms`, doubles afterwards, and is raised to a
    /// server-provided `Retry-After`. Always capped at `max_ms`.
    pub fn next_delay(&self, current_ms: i64, retry_after: Option<Duration>) -> i64 {
        let grown = if current_ms <= 0 {
            self.initial_ms
        } else {
            current_ms.saturating_mul(2)
        };
        let hinted = retry_after
            .map(|d| d.as_millis().min(i64::MAX as u128) as i64)
            .unwrap_or(0);
        grown.max(hinted).min(self.max_ms)
    }

    /// Milliseconds left before the account may be called again.
    pub fn remaining(last_error_ms: Option<i64>, delay_ms: i64, now_ms: i64) -> Option<i64> {
        let last = last_error_ms?;
        if delay_ms <= 0 {
            return None;
        }
        let ready_at = last.saturating_add(delay_ms);
        (now_ms < ready_at).then(|| ready_at - now_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn delay_doubles_until_the_cap() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(800), false);
        let mut rng = StdRng::seed_from_u64(1);
        let delays: Vec<u128> = (0..5)
            .map(|attempt| backoff.delay_with_rng(attempt, &mut rng).as_millis())
            .collect();
        assert_eq!(delays, [100u128, 200, 400, 800, 800]);
    }

    #[test]
    fn jittered_delay_stays_in_the_upper_half() {
        let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(800), true);
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..20 {
            let delay = backoff.delay_with_rng(3, &mut rng);
            assert!((400..=800).contains(&delay.as_millis()));
        }
    }

    #[test]
    fn rate_limit_delay_grows_until_capped() {
        let policy = RateLimitPolicy {
            initial_ms: 10_000,
            max_ms: 30_000,
        };
        let first = policy.next_delay(0, None);
        let second = policy.next_delay(first, None);
        let third = policy.next_delay(second, None);
        assert_eq!(first, 10_000);
        assert_eq!(second, 20_000);
        assert!(second > first);
        assert_eq!(third, 30_000);
    }

    #[test]
    fn retry_after_raises_delay() {
        let policy = RateLimitPolicy::default();
        assert_eq!(
            policy.next_delay(0, Some(Duration::from_secs(45))),
            45_000
        );
    }

    #[test]
    fn guard_window_ends_at_error_time_plus_delay() {
        assert_eq!(RateLimitPolicy::remaining(Some(5_000), 20_000, 14_000), Some(11_000));
        assert_eq!(RateLimitPolicy::remaining(Some(5_000), 20_000, 25_000), None);
        assert_eq!(RateLimitPolicy::remaining(None, 20_000, 0), None);
        assert_eq!(RateLimitPolicy::remaining(Some(5_000), 0, 0), None);
    }
}
