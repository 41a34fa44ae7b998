//! Core traits and types for stored records.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

use crate::models::{Collection, FieldValue};

/// Trait for entities that can be mirrored into the local store.
pub trait Record: Clone + Send + Sync + Serialize + DeserializeOwned {
  /// Primary key within the record's collection (e.g., pokemon id)
  fn cache_key(&self) -> String;

  /// Collection the record belongs to
  fn collection() -> Collection;
}

/// Subset of a collection selected by equality matches on JSON fields.
///
/// An empty scope selects the whole collection. Reads return rows in
/// insertion order unless an ordering field is set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scope {
  pub(crate) matches: Vec<(String, FieldValue)>,
  pub(crate) order: Option<(String, bool)>,
}

impl Scope {
  pub fn all() -> Self {
    Self::default()
  }

  pub fn field(field: &str, value: impl Into<FieldValue>) -> Self {
    Self::all().and(field, value)
  }

  pub fn and(mut self, field: &str, value: impl Into<FieldValue>) -> Self {
    self.matches.push((field.to_string(), value.into()));
    self
  }

  pub fn order_by(mut self, field: &str, ascending: bool) -> Self {
    self.order = Some((field.to_string(), ascending));
    self
  }

  pub fn is_all(&self) -> bool {
    self.matches.is_empty()
  }
}

/// Bookkeeping row written on every successful bulk save.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncMetadata {
  pub key: String,
  pub last_synced_at: DateTime<Utc>,
  pub version: u32,
}
