//! Background task feeding push-channel events into the store.

use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::channel::PushChannel;
use super::state::{ConnectionState, ConnectionStatus, ReconnectPolicy};
use crate::store::SyncStore;

struct BridgeTask {
  shutdown: watch::Sender<bool>,
  handle: JoinHandle<()>,
}

/// Owns the push-channel subscription for one session.
///
/// The subscription runs as a spawned task between [`start`](Self::start)
/// and [`stop`](Self::stop). Dropping the bridge aborts the task.
pub struct RealtimeBridge {
  store: SyncStore,
  channel: Arc<dyn PushChannel>,
  policy: ReconnectPolicy,
  task: Option<BridgeTask>,
}

impl RealtimeBridge {
  pub fn new(store: SyncStore, channel: Arc<dyn PushChannel>) -> Self {
    let policy = store.options().reconnect.clone();
    Self {
      store,
      channel,
      policy,
      task: None,
    }
  }

  pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
    self.policy = policy;
    self
  }

  /// Spawn the subscription task. Calling it again while running is a no-op.
  pub fn start(&mut self) {
    if self.is_running() {
      return;
    }
    let (shutdown, signal) = watch::channel(false);
    let handle = tokio::spawn(run(
      self.store.clone(),
      Arc::clone(&self.channel),
      self.policy.clone(),
      signal,
    ));
    self.task = Some(BridgeTask { shutdown, handle });
  }

  /// Stop the task, wait for it to exit and reset the connection state.
  pub async fn stop(&mut self) {
    if let Some(task) = self.task.take() {
      let _ = task.shutdown.send(true);
      if let Err(err) = task.handle.await {
        if !err.is_cancelled() {
          warn!(error = %err, "realtime task ended abnormally");
        }
      }
    }
    self.store.reset_connection();
  }

  pub fn is_running(&self) -> bool {
    self
      .task
      .as_ref()
      .is_some_and(|task| !task.handle.is_finished())
  }

  pub fn connection(&self) -> ConnectionState {
    self.store.connection()
  }
}

impl Drop for RealtimeBridge {
  fn drop(&mut self) {
    if let Some(task) = self.task.take() {
      let _ = task.shutdown.send(true);
      task.handle.abort();
    }
  }
}

async fn run(
  store: SyncStore,
  channel: Arc<dyn PushChannel>,
  policy: ReconnectPolicy,
  mut shutdown: watch::Receiver<bool>,
) {
  let mut attempt: u32 = 0;
  let mut connected_before = false;

  loop {
    store.set_connection_status(if connected_before || attempt > 0 {
      ConnectionStatus::Reconnecting
    } else {
      ConnectionStatus::Connecting
    });

    let connected = tokio::select! {
      _ = shutdown.changed() => break,
      result = channel.connect() => result,
    };

    match connected {
      Ok(mut events) => {
        attempt = 0;
        store.set_connection_status(ConnectionStatus::Connected);

        // nothing sent before this connection is replayed, including
        // changes made while the first load was in flight
        tokio::select! {
          _ = shutdown.changed() => break,
          _ = store.catch_up() => {}
        }
        connected_before = true;

        loop {
          tokio::select! {
            _ = shutdown.changed() => return,
            next = events.next() => match next {
              Some(Ok(event)) => {
                debug!(
                  collection = %event.collection,
                  item = %event.item_id,
                  kind = ?event.kind,
                  version = event.version,
                  "change event"
                );
                store.record_event_received();
                store.apply_change(&event);
              }
              Some(Err(err)) => {
                warn!(error = %err, "push channel dropped");
                break;
              }
              None => {
                info!("push channel closed");
                break;
              }
            }
          }
        }
        store.set_connection_status(ConnectionStatus::Disconnected);
      }
      Err(err) => {
        warn!(error = %err, attempt, "push channel connect failed");
      }
    }

    attempt = attempt.saturating_add(1);
    let delay = policy.delay_for(attempt);
    debug!(?delay, attempt, "reconnecting after backoff");
    tokio::select! {
      _ = shutdown.changed() => break,
      _ = tokio::time::sleep(delay) => {}
    }
  }
}
