use tokio::sync::broadcast;

use crate::query::QueryKey;
use crate::realtime::ConnectionState;

const CHANNEL_CAPACITY: usize = 256;

/// Change notifications emitted by the store
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
  /// Pages, overlay or fetch state of a key changed; bound views re-emit
  KeyChanged(QueryKey),
  /// Realtime connection state changed
  ConnectionChanged(ConnectionState),
}

/// Fan-out of store events to every attached view.
///
/// Sending never blocks and never fails; with no subscribers the event is
/// simply dropped.
#[derive(Debug, Clone)]
pub struct Notifier {
  tx: broadcast::Sender<StoreEvent>,
}

impl Notifier {
  pub fn new() -> Self {
    let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
    Self { tx }
  }

  pub fn key_changed(&self, key: &QueryKey) {
    let _ = self.tx.send(StoreEvent::KeyChanged(key.clone()));
  }

  pub fn connection_changed(&self, state: &ConnectionState) {
    let _ = self.tx.send(StoreEvent::ConnectionChanged(state.clone()));
  }

  pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
    self.tx.subscribe()
  }
}

impl Default for Notifier {
  fn default() -> Self {
    Self::new()
  }
}
