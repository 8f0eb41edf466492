use std::num::NonZeroU32;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

/// Token bucket limiting dispatches to `speed` requests per second
pub struct Throttle {
    speed: f64,
    limiter: DefaultDirectRateLimiter,
}

impl Throttle {
    pub fn new(speed: f64) -> Self {
        let quota = Duration::try_from_secs_f64(1.0 / speed)
            .ok()
            .and_then(Quota::with_period)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN));

        Self {
            speed,
            limiter: RateLimiter::direct(quota),
        }
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Whether the bucket must be rebuilt for a new speed setting
    pub fn needs_rebuild(&self, speed: f64) -> bool {
        (self.speed - speed).abs() > 0.001
    }

    /// Wait until a token is available
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_needs_rebuild() {
        let throttle = Throttle::new(2.0);
        assert!(!throttle.needs_rebuild(2.0));
        assert!(!throttle.needs_rebuild(2.0005));
        assert!(throttle.needs_rebuild(3.0));
    }

    #[tokio::test]
    async fn test_speed_limits_dispatch() {
        let throttle = Throttle::new(5.0);
        let start = Instant::now();
        for _ in 0..10 {
            throttle.acquire().await;
        }
        // first token is immediate, the other nine arrive every 200ms
        assert!(start.elapsed() >= Duration::from_millis(1700));
    }
}
