//! Records exchanged with the rental backend.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Domain fields of a record, everything except `id` and `version`.
pub type Payload = Map<String, Value>;

/// Name of a server-side collection (e.g. "bookings").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionId(String);

impl CollectionId {
  pub fn new(name: impl Into<String>) -> Self {
    Self(name.into())
  }

  pub fn bookings() -> Self {
    Self::new("bookings")
  }

  pub fn favorites() -> Self {
    Self::new("favorites")
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for CollectionId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// A single item of a collection as the server last described it.
///
/// `id` is stable across pages, optimistic overlays and push events;
/// `version` only ever grows on the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemRecord {
  pub id: String,
  pub version: u64,
  #[serde(flatten)]
  pub payload: Payload,
}

impl ItemRecord {
  pub fn new(id: impl Into<String>, version: u64, payload: Payload) -> Self {
    Self {
      id: id.into(),
      version,
      payload,
    }
  }

  /// Shallow-merge `patch` into the payload. `null` removes the field.
  pub fn apply_patch(&mut self, patch: &Payload) {
    merge_payload(&mut self.payload, patch);
  }

  pub fn field_str(&self, name: &str) -> Option<&str> {
    self.payload.get(name).and_then(Value::as_str)
  }
}

/// Shallow JSON object merge used for optimistic and pushed patches.
pub fn merge_payload(target: &mut Payload, patch: &Payload) {
  for (field, value) in patch {
    if value.is_null() {
      target.remove(field);
    } else {
      target.insert(field.clone(), value.clone());
    }
  }
}

/// Booking fields the CLI cares about.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingSummary {
  #[serde(default)]
  pub listing_title: Option<String>,
  #[serde(default)]
  pub status: Option<String>,
  #[serde(default)]
  pub check_in: Option<String>,
  #[serde(default)]
  pub check_out: Option<String>,
}

/// Favorite fields the CLI cares about.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FavoriteSummary {
  #[serde(default)]
  pub listing_title: Option<String>,
  #[serde(default)]
  pub city: Option<String>,
}

impl ItemRecord {
  /// One-line rendering of a record, typed for the known collections.
  pub fn summary_line(&self, collection: &CollectionId) -> String {
    let payload = Value::Object(self.payload.clone());
    match collection.as_str() {
      "bookings" => match serde_json::from_value::<BookingSummary>(payload) {
        Ok(b) => format!(
          "{}  {:<28} {:<10} {} -> {}",
          self.id,
          b.listing_title.as_deref().unwrap_or("-"),
          b.status.as_deref().unwrap_or("-"),
          b.check_in.as_deref().unwrap_or("?"),
          b.check_out.as_deref().unwrap_or("?"),
        ),
        Err(_) => self.fallback_line(),
      },
      "favorites" => match serde_json::from_value::<FavoriteSummary>(payload) {
        Ok(f) => format!(
          "{}  {:<28} {}",
          self.id,
          f.listing_title.as_deref().unwrap_or("-"),
          f.city.as_deref().unwrap_or("-"),
        ),
        Err(_) => self.fallback_line(),
      },
      _ => self.fallback_line(),
    }
  }

  fn fallback_line(&self) -> String {
    format!("{}  v{}", self.id, self.version)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn payload(value: Value) -> Payload {
    match value {
      Value::Object(map) => map,
      _ => Payload::new(),
    }
  }

  #[test]
  fn test_wire_shape_flattens_payload() {
    let record: ItemRecord = serde_json::from_value(json!({
      "id": "b1",
      "version": 4,
      "status": "confirmed",
      "listingTitle": "Loft"
    }))
    .unwrap();

    assert_eq!(record.id, "b1");
    assert_eq!(record.version, 4);
    assert_eq!(record.field_str("status"), Some("confirmed"));
    assert!(!record.payload.contains_key("id"));
  }

  #[test]
  fn test_patch_merges_and_removes_null_fields() {
    let mut record = ItemRecord::new("b1", 1, payload(json!({"status": "confirmed", "note": "x"})));
    record.apply_patch(&payload(json!({"status": "cancelled", "note": null})));

    assert_eq!(record.field_str("status"), Some("cancelled"));
    assert!(!record.payload.contains_key("note"));
    assert_eq!(record.version, 1);
  }

  #[test]
  fn test_booking_summary_line() {
    let record = ItemRecord::new(
      "b7",
      2,
      payload(json!({"listingTitle": "Sea view", "status": "pending", "checkIn": "2026-07-01"})),
    );
    let line = record.summary_line(&CollectionId::bookings());
    assert!(line.starts_with("b7"));
    assert!(line.contains("Sea view"));
    assert!(line.contains("2026-07-01 -> ?"));
  }
}
