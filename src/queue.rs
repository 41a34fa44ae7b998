//! Durable log of mutations that could not be confirmed against the backend.
//!
//! Operations are replayed in FIFO order by the sync engine. Nothing here
//! reorders, merges, or deduplicates: a catch followed by a release of the
//! same pokemon while offline stays queued as two operations.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{error, warn};

use crate::retry::DurableRetryPolicy;
use crate::store::SqliteStore;

pub const CATCH_POKEMON: &str = "catch_pokemon";
pub const RELEASE_POKEMON: &str = "release_pokemon";

/// Arguments of a catch, stored verbatim as the queued payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatchArgs {
  pub user_id: String,
  pub pokemon_id: i64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub nickname: Option<String>,
}

/// Arguments of a release, stored verbatim as the queued payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseArgs {
  pub user_id: String,
  pub pokemon_id: i64,
}

/// The finite set of mutations that can be replayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingMutation {
  Catch(CatchArgs),
  Release(ReleaseArgs),
}

#[derive(Debug, Error)]
pub enum QueueError {
  #[error("Unknown operation type: {0}")]
  UnknownKind(String),

  #[error("Invalid payload for {kind}: {source}")]
  InvalidPayload {
    kind: String,
    #[source]
    source: serde_json::Error,
  },
}

impl PendingMutation {
  /// Kind string persisted alongside the payload.
  pub fn kind(&self) -> &'static str {
    match self {
      Self::Catch(_) => CATCH_POKEMON,
      Self::Release(_) => RELEASE_POKEMON,
    }
  }

  pub fn payload(&self) -> serde_json::Result<Value> {
    match self {
      Self::Catch(args) => serde_json::to_value(args),
      Self::Release(args) => serde_json::to_value(args),
    }
  }

  /// Rebuild a mutation from its persisted kind and payload.
  pub fn decode(kind: &str, payload: &Value) -> Result<Self, QueueError> {
    let invalid = |source| QueueError::InvalidPayload {
      kind: kind.to_string(),
      source,
    };

    match kind {
      CATCH_POKEMON => serde_json::from_value(payload.clone())
        .map(Self::Catch)
        .map_err(invalid),
      RELEASE_POKEMON => serde_json::from_value(payload.clone())
        .map(Self::Release)
        .map_err(invalid),
      other => Err(QueueError::UnknownKind(other.to_string())),
    }
  }
}

/// A row of the pending queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedOperation {
  pub id: i64,
  pub kind: String,
  pub payload: Value,
  pub enqueued_at: DateTime<Utc>,
  pub retry_count: u32,
}

impl QueuedOperation {
  pub fn mutation(&self) -> Result<PendingMutation, QueueError> {
    PendingMutation::decode(&self.kind, &self.payload)
  }
}

/// What happened to an operation after a failed replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
  /// Still queued with the new retry count
  Requeued { retry_count: u32 },
  /// Retry ceiling reached; the operation was removed
  Dropped { retry_count: u32 },
}

/// Queue operations on top of the local store.
#[derive(Clone)]
pub struct PendingQueue {
  store: Arc<SqliteStore>,
}

impl PendingQueue {
  pub fn new(store: Arc<SqliteStore>) -> Self {
    Self { store }
  }

  /// Append a mutation with a zero retry count.
  pub fn enqueue(&self, mutation: &PendingMutation) -> bool {
    match mutation.payload() {
      Ok(payload) => self.store.enqueue_operation(mutation.kind(), &payload),
      Err(e) => {
        error!(kind = mutation.kind(), error = %e, "failed to encode pending operation");
        false
      }
    }
  }

  /// FIFO snapshot of the queue.
  pub fn snapshot(&self) -> Vec<QueuedOperation> {
    self.store.pending_operations()
  }

  pub fn len(&self) -> usize {
    self.snapshot().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Remove an operation that replayed successfully.
  pub fn complete(&self, operation: &QueuedOperation) -> bool {
    self.store.dequeue_operation(operation.id)
  }

  /// Count a failed replay, dropping the operation once the policy is exhausted.
  pub fn record_failure(
    &self,
    operation: &QueuedOperation,
    policy: &DurableRetryPolicy,
  ) -> RetryOutcome {
    let retry_count = operation.retry_count + 1;

    if policy.is_exhausted(retry_count) {
      warn!(
        id = operation.id,
        kind = %operation.kind,
        retry_count,
        "operation exceeded max retries, removing"
      );
      self.store.dequeue_operation(operation.id);
      RetryOutcome::Dropped { retry_count }
    } else {
      self.store.update_retry_count(operation.id, retry_count);
      RetryOutcome::Requeued { retry_count }
    }
  }

  /// Drop every pending operation without replaying it.
  pub fn clear(&self) -> bool {
    self.store.clear_pending_operations()
  }
}
