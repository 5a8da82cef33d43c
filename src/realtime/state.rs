use chrono::{DateTime, Utc};
use rand::Rng;
use std::fmt;
use std::time::Duration;

/// Connection lifecycle of the push channel.
///
/// `Disconnected -> Connecting -> Connected -> (Disconnected | Reconnecting)
/// -> Connected`. Only an explicit stop ends it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionStatus {
  #[default]
  Disconnected,
  Connecting,
  Connected,
  Reconnecting,
}

impl ConnectionStatus {
  pub fn is_live(self) -> bool {
    matches!(self, ConnectionStatus::Connected)
  }
}

impl fmt::Display for ConnectionStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let label = match self {
      ConnectionStatus::Disconnected => "offline",
      ConnectionStatus::Connecting => "connecting",
      ConnectionStatus::Connected => "live",
      ConnectionStatus::Reconnecting => "reconnecting",
    };
    f.write_str(label)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionState {
  pub status: ConnectionStatus,
  pub last_event_at: Option<DateTime<Utc>>,
}

/// Capped exponential backoff with jitter for reconnect attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl ReconnectPolicy {
  pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
    Self {
      base_delay,
      max_delay: max_delay.max(base_delay),
    }
  }

  /// Upper bound of the delay before reconnect attempt `attempt` (1-based).
  pub fn ceiling(&self, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
    self.base_delay.saturating_mul(factor).min(self.max_delay)
  }

  /// Delay before attempt `attempt`: half the ceiling plus a random share of
  /// the other half, so many clients do not reconnect in lockstep.
  pub fn delay_for(&self, attempt: u32) -> Duration {
    let ceiling = self.ceiling(attempt);
    let half = ceiling / 2;
    let spread = (ceiling - half).as_millis() as u64;
    let jitter = if spread > 0 {
      rand::rng().random_range(0..=spread)
    } else {
      0
    };
    half + Duration::from_millis(jitter)
  }
}

impl Default for ReconnectPolicy {
  fn default() -> Self {
    Self::new(Duration::from_millis(500), Duration::from_secs(30))
  }
}
