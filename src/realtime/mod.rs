//! Push-channel subscription and its translation into cache operations.

mod bridge;
mod channel;
mod state;

pub use bridge::RealtimeBridge;
pub use channel::{ChangeEvent, ChangeKind, EventStream, HttpPushChannel, PushChannel};
pub use state::{ConnectionState, ConnectionStatus, ReconnectPolicy};
