//! Contract for the authoritative backend.
//!
//! Records cross this boundary as JSON rows; typed conversion happens in the
//! repository. Every call can fail, and callers treat all failures alike.

#[cfg(test)]
pub mod memory;
mod rest;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::models::{Collection, FieldValue};

pub use rest::RestGateway;

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
  #[error("Network error: {0}")]
  Network(String),

  #[error("Server error ({status}): {body}")]
  Server { status: u16, body: String },

  #[error("Invalid response: {0}")]
  Decode(String),
}

impl GatewayError {
  /// Truncate a response body to avoid logging excessive data
  fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
      body.to_string()
    } else {
      let mut end = MAX_ERROR_BODY_LENGTH;
      while !body.is_char_boundary(end) {
        end -= 1;
      }
      format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }
  }

  pub fn from_status(status: u16, body: &str) -> Self {
    Self::Server {
      status,
      body: Self::truncate_body(body),
    }
  }
}

/// Ordering applied server-side to list results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
  pub field: String,
  pub ascending: bool,
}

/// Equality matches on named fields, plus optional ordering and projection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
  pub matches: Vec<(String, FieldValue)>,
  pub order: Option<Order>,
  /// Column projection, e.g. to embed joined rows
  pub select: Option<String>,
}

impl Filter {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn eq(mut self, field: &str, value: impl Into<FieldValue>) -> Self {
    self.matches.push((field.to_string(), value.into()));
    self
  }

  pub fn order_by(mut self, field: &str, ascending: bool) -> Self {
    self.order = Some(Order {
      field: field.to_string(),
      ascending,
    });
    self
  }

  pub fn select(mut self, columns: &str) -> Self {
    self.select = Some(columns.to_string());
    self
  }

  /// Whether a row satisfies every equality match.
  pub fn matches(&self, row: &Value) -> bool {
    self
      .matches
      .iter()
      .all(|(field, value)| row.get(field).is_some_and(|v| value.matches(v)))
  }
}

/// Read/write access to the hosted relational store.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
  /// Rows of `collection` matching `filter`.
  async fn list(&self, collection: Collection, filter: &Filter) -> Result<Vec<Value>, GatewayError>;

  /// Insert a row and return it as stored (with server-assigned fields).
  async fn insert(&self, collection: Collection, record: Value) -> Result<Value, GatewayError>;

  /// Delete rows matching `filter`.
  async fn delete(&self, collection: Collection, filter: &Filter) -> Result<(), GatewayError>;

  /// Cheap reachability check used by the connectivity probe.
  async fn ping(&self) -> Result<(), GatewayError>;
}
