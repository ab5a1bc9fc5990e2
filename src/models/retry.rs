use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: u64,
}

impl RetryConfig {
    /// Delay before the redelivery that follows `attempts` failed attempts:
    /// `initial * multiplier^attempts`, capped at `max_delay_ms`.
    pub fn backoff_for(&self, attempts: u32) -> Duration {
        let factor = self.backoff_multiplier.saturating_pow(attempts);
        let delay_ms = self
            .initial_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);

        Duration::from_millis(delay_ms)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2,
        }
    }
}
