use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Token bucket bounding the request rate towards the API server
///
/// Every request takes one token. Callers that find the bucket empty are
/// handed a reservation and sleep until their token has accrued, so waiting
/// requests leave in arrival order at `qps`.
pub struct RequestLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    updated: Instant,
}

impl RequestLimiter {
    /// `qps <= 0` disables limiting; a zero burst is treated as one
    pub fn new(qps: f32, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps: f64::from(qps),
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                updated: Instant::now(),
            }),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.qps <= 0.0
    }

    /// Wait until one more request may be sent
    pub async fn acquire(&self) {
        let wait = self.reserve(Instant::now());
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Take a token at `now` and return how long the caller must wait for it
    fn reserve(&self, now: Instant) -> Duration {
        if self.is_unlimited() {
            return Duration::ZERO;
        }
        let mut bucket = self.bucket.lock();
        let elapsed = now.saturating_duration_since(bucket.updated).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.updated = now;
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_then_steady_rate() {
        let limiter = RequestLimiter::new(2.0, 3);
        let start = Instant::now();

        for _ in 0..3 {
            assert_eq!(limiter.reserve(start), Duration::ZERO);
        }
        assert_eq!(limiter.reserve(start), Duration::from_millis(500));
        assert_eq!(limiter.reserve(start), Duration::from_secs(1));

        // Both reservations are paid off after a second; one more token accrues by 1.5s
        let later = start + Duration::from_millis(1500);
        assert_eq!(limiter.reserve(later), Duration::ZERO);
        assert_eq!(limiter.reserve(later), Duration::from_millis(500));
    }

    #[test]
    fn test_idle_time_refills_only_up_to_burst() {
        let limiter = RequestLimiter::new(10.0, 2);
        let start = Instant::now();
        let idle = start + Duration::from_secs(60);

        assert_eq!(limiter.reserve(idle), Duration::ZERO);
        assert_eq!(limiter.reserve(idle), Duration::ZERO);
        assert_eq!(limiter.reserve(idle), Duration::from_millis(100));
    }

    #[test]
    fn test_non_positive_qps_is_unlimited() {
        let limiter = RequestLimiter::new(0.0, 1);
        assert!(limiter.is_unlimited());
        let now = Instant::now();
        for _ in 0..100 {
            assert_eq!(limiter.reserve(now), Duration::ZERO);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_sleeps_for_the_reservation() {
        let limiter = RequestLimiter::new(1.0, 1);
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(1));
    }
}
