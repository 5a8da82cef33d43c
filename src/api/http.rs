use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::source::{CollectionSource, MutationSink, PageResponse};
use crate::cache::Mutation;
use crate::error::{FetchError, MutationError};
use crate::model::{CollectionId, ItemRecord};
use crate::query::QueryKey;

/// REST client for the listing/booking/favorite endpoints
#[derive(Clone)]
pub struct HttpApi {
  client: Client,
  base: Url,
  token: Option<String>,
}

impl HttpApi {
  pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
    let base =
      Url::parse(base_url).map_err(|e| eyre!("Invalid API url '{}': {}", base_url, e))?;
    if base.cannot_be_a_base() {
      return Err(eyre!("API url '{}' cannot be used as a base", base_url));
    }

    let client = Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base,
      token,
    })
  }

  /// `{base}/{segments...}`
  pub(crate) fn endpoint(&self, segments: &[&str]) -> Url {
    let mut url = self.base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
      path.pop_if_empty().extend(segments);
    }
    url
  }

  /// `GET {base}/{collection}?search=&filter.<k>=&sort=&page=&limit=`
  ///
  /// `page` is 1-based on the wire.
  pub fn page_url(&self, key: &QueryKey, page_index: usize) -> Url {
    let mut url = self.endpoint(&[key.collection().as_str()]);
    {
      let mut query = url.query_pairs_mut();
      query.append_pair("search", key.search());
      for (field, value) in key.filters() {
        query.append_pair(&format!("filter.{}", field), &value.to_param());
      }
      query.append_pair("sort", &key.sort().to_param());
      query.append_pair("page", &(page_index + 1).to_string());
      query.append_pair("limit", &key.page_size().to_string());
    }
    url
  }

  pub(crate) fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
    match &self.token {
      Some(token) => request.bearer_auth(token),
      None => request,
    }
  }

  async fn get_page(&self, key: &QueryKey, page_index: usize) -> Result<PageResponse, FetchError> {
    let url = self.page_url(key, page_index);
    debug!(%url, "fetching page");

    let response = self
      .authorize(self.client.get(url))
      .send()
      .await
      .map_err(fetch_error)?;

    let status = response.status();
    if !status.is_success() {
      let message = error_body(response).await;
      return Err(if status.is_server_error() {
        FetchError::Server {
          status: status.as_u16(),
          message,
        }
      } else {
        FetchError::Rejected {
          status: status.as_u16(),
          message,
        }
      });
    }

    response
      .json::<PageResponse>()
      .await
      .map_err(|e| FetchError::Decode(e.to_string()))
  }

  async fn send_mutation(
    &self,
    collection: &CollectionId,
    item_id: &str,
    mutation: &Mutation,
  ) -> Result<ItemRecord, MutationError> {
    let url = self.endpoint(&[collection.as_str(), item_id]);
    let request = match mutation {
      Mutation::Update(patch) => self.client.patch(url).json(patch),
      Mutation::Remove => self.client.delete(url),
    };

    let response = self
      .authorize(request)
      .send()
      .await
      .map_err(|e| MutationError::Network(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
      return Err(mutation_error(status, error_body(response).await));
    }

    response
      .json::<ItemRecord>()
      .await
      .map_err(|e| MutationError::Decode(e.to_string()))
  }
}

impl CollectionSource for HttpApi {
  fn fetch_page<'a>(
    &'a self,
    key: &'a QueryKey,
    page_index: usize,
  ) -> BoxFuture<'a, Result<PageResponse, FetchError>> {
    self.get_page(key, page_index).boxed()
  }
}

impl MutationSink for HttpApi {
  fn submit<'a>(
    &'a self,
    collection: &'a CollectionId,
    item_id: &'a str,
    mutation: &'a Mutation,
  ) -> BoxFuture<'a, Result<ItemRecord, MutationError>> {
    self.send_mutation(collection, item_id, mutation).boxed()
  }
}

fn fetch_error(err: reqwest::Error) -> FetchError {
  if err.is_timeout() {
    FetchError::Timeout
  } else {
    FetchError::Network(err.to_string())
  }
}

fn mutation_error(status: StatusCode, body: String) -> MutationError {
  if status.is_server_error() {
    // The write may or may not have happened; the next refetch will tell.
    MutationError::Network(format!("server error {}: {}", status.as_u16(), body))
  } else {
    MutationError::Rejected {
      status: status.as_u16(),
      reason: body,
    }
  }
}

/// Best-effort error message: the body's `message` field, else the raw text.
async fn error_body(response: Response) -> String {
  let status = response.status();
  let text = response.text().await.unwrap_or_default();
  serde_json::from_str::<serde_json::Value>(&text)
    .ok()
    .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
    .unwrap_or_else(|| {
      if text.is_empty() {
        status.canonical_reason().unwrap_or("request failed").to_string()
      } else {
        text
      }
    })
}
