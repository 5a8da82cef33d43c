use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Trailing-edge debounce for keystroke-driven input.
///
/// Every call to [`Debouncer::settle`] waits out the window; only the most
/// recent caller sees `true`.
#[derive(Debug, Clone)]
pub struct Debouncer {
  delay: Duration,
  generation: Arc<AtomicU64>,
}

impl Debouncer {
  pub fn new(delay: Duration) -> Self {
    Self {
      delay,
      generation: Arc::new(AtomicU64::new(0)),
    }
  }

  /// Wait for the debounce window. Returns `false` if a later call (or
  /// [`Debouncer::cancel`]) superseded this one while waiting.
  pub async fn settle(&self) -> bool {
    let ticket = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
    tokio::time::sleep(self.delay).await;
    self.generation.load(Ordering::SeqCst) == ticket
  }

  /// Supersede any call currently waiting.
  pub fn cancel(&self) {
    self.generation.fetch_add(1, Ordering::SeqCst);
  }
}
