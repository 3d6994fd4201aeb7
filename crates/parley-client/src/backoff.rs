use std::time::Duration;

/// Reconnect backoff: delay = base × 2^(attempt − 1), capped. After
/// `max_attempts` consecutive failures the client stops retrying and
/// surfaces a terminal connection-lost condition.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.base.saturating_mul(1u32 << exponent);
        delay.min(self.cap)
    }

    /// Same, with ±10% jitter so a fleet of clients does not reconnect in
    /// lockstep after a server restart.
    pub fn jittered(&self, attempt: u32) -> Duration {
        let factor = 0.9 + 0.2 * rand::random::<f64>();
        self.delay_for(attempt).mul_f64(factor)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }
}
