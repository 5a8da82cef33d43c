use std::time::Duration;

/// Bounded exponential backoff for transient fetch failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Total attempts including the first one
  pub max_attempts: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl RetryPolicy {
  pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
    Self {
      max_attempts: max_attempts.max(1),
      base_delay,
      max_delay,
    }
  }

  /// Never retry.
  pub fn none() -> Self {
    Self::new(1, Duration::ZERO, Duration::ZERO)
  }

  /// Delay before the attempt following failed attempt number `attempt`
  /// (1-based): base, 2x base, 4x base, ... capped at `max_delay`.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    self.base_delay.saturating_mul(factor).min(self.max_delay)
  }
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::new(3, Duration::from_millis(250), Duration::from_secs(4))
  }
}
