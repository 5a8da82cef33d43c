use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use futures::FutureExt;
use reqwest::header::ACCEPT;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use tracing::{debug, warn};
use url::Url;

use crate::api::HttpApi;
use crate::error::ChannelError;
use crate::model::{CollectionId, Payload};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
  Created,
  Updated,
  Removed,
}

/// A server-pushed notice that an item changed somewhere else.
///
/// Delivery is at-least-once with no ordering guarantee; `version` decides
/// precedence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
  pub collection: CollectionId,
  pub item_id: String,
  pub kind: ChangeKind,
  pub version: u64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub payload: Option<Payload>,
}

pub type EventStream = BoxStream<'static, Result<ChangeEvent, ChannelError>>;

/// A persistent connection delivering change events.
pub trait PushChannel: Send + Sync {
  /// Open a connection. The returned stream ends (or yields an error) when
  /// the connection drops.
  fn connect(&self) -> BoxFuture<'_, Result<EventStream, ChannelError>>;
}

/// Newline-delimited JSON events over a long-lived streaming GET.
#[derive(Clone)]
pub struct HttpPushChannel {
  client: Client,
  url: Url,
  api: HttpApi,
}

impl HttpPushChannel {
  /// Subscribe at `{api base}/{events_path}`.
  pub fn new(api: &HttpApi, events_path: &str) -> Self {
    let segments: Vec<&str> = events_path.split('/').filter(|s| !s.is_empty()).collect();
    Self {
      // no overall timeout: the response body is expected to stay open
      client: Client::new(),
      url: api.endpoint(&segments),
      api: api.clone(),
    }
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  async fn open(&self) -> Result<EventStream, ChannelError> {
    debug!(url = %self.url, "opening push channel");
    let response = self
      .api
      .authorize(self.client.get(self.url.clone()))
      .header(ACCEPT, "application/x-ndjson")
      .send()
      .await
      .map_err(|e| ChannelError::Connect(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
      return Err(ChannelError::Connect(format!(
        "push endpoint returned {}",
        status
      )));
    }

    Ok(ndjson_events(response.bytes_stream()))
  }
}

impl PushChannel for HttpPushChannel {
  fn connect(&self) -> BoxFuture<'_, Result<EventStream, ChannelError>> {
    self.open().boxed()
  }
}

/// Split a byte stream into lines and decode each as a [`ChangeEvent`].
///
/// Blank lines are keep-alives. Malformed lines are logged and skipped; a
/// transport error is yielded once and ends the stream.
pub(crate) fn ndjson_events<S, B, E>(bytes: S) -> EventStream
where
  S: Stream<Item = Result<B, E>> + Send + 'static,
  B: AsRef<[u8]> + Send + 'static,
  E: Display + Send + 'static,
{
  let state = (Box::pin(bytes), Vec::<u8>::new(), false);
  stream::unfold(state, |(mut bytes, mut buffer, done)| async move {
    if done {
      return None;
    }
    loop {
      if let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=pos).collect();
        match decode_line(&line) {
          Some(event) => return Some((Ok(event), (bytes, buffer, false))),
          None => continue,
        }
      }

      match bytes.next().await {
        Some(Ok(chunk)) => buffer.extend_from_slice(chunk.as_ref()),
        Some(Err(err)) => {
          let err = ChannelError::Stream(err.to_string());
          return Some((Err(err), (bytes, buffer, true)));
        }
        None => {
          // a final line without trailing newline
          let rest = std::mem::take(&mut buffer);
          return decode_line(&rest).map(|event| (Ok(event), (bytes, buffer, true)));
        }
      }
    }
  })
  .boxed()
}

fn decode_line(line: &[u8]) -> Option<ChangeEvent> {
  let text = String::from_utf8_lossy(line);
  let text = text.trim();
  if text.is_empty() {
    return None;
  }
  match serde_json::from_str::<ChangeEvent>(text) {
    Ok(event) => Some(event),
    Err(err) => {
      warn!(error = %err, line = %text, "dropping malformed push frame");
      None
    }
  }
}
