//! Fixed delay plus random jitter before each remote call.

use std::time::Duration;

use rand::RngExt;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pacer {
    delay: Duration,
    jitter: Duration,
}

impl Pacer {
    pub fn new(delay: Duration, jitter: Duration) -> Self {
        Self { delay, jitter }
    }

    /// A pacer that never sleeps.
    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    /// Delay for the next call: `delay` plus a uniform draw from `[0, jitter]`.
    pub fn next_delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.delay;
        }
        let extra = rand::rng().random_range(0.0..=self.jitter.as_secs_f64());
        self.delay + Duration::from_secs_f64(extra)
    }

    pub async fn wait(&self) {
        let delay = self.next_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for Pacer {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_delay_bounds() {
        let pacer = Pacer::new(Duration::from_millis(500), Duration::from_millis(400));
        for _ in 0..50 {
            let delay = pacer.next_delay();
            assert!(delay >= Duration::from_millis(500));
            assert!(delay <= Duration::from_millis(900));
        }
    }

    #[test]
    fn test_no_jitter_is_exact() {
        let pacer = Pacer::new(Duration::from_millis(250), Duration::ZERO);
        assert_eq!(pacer.next_delay(), Duration::from_millis(250));
        assert_eq!(Pacer::none().next_delay(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_wait_none_returns_immediately() {
        let start = std::time::Instant::now();
        Pacer::none().wait().await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
