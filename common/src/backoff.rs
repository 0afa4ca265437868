use rand::Rng;
use std::time::Duration;

/// Reconnect pacing: exponential growth with +/-20% jitter so a herd of
/// proxies does not hammer a recovering gateway in lockstep.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// The next delay to wait, then doubles the base up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        let jitter = rand::rng().random_range(-0.2f64..=0.2f64);
        base.mul_f64(1.0 + jitter)
    }

    /// Call after a connection made it past authentication.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(3), Duration::from_secs(30))
    }
}
