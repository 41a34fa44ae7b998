//! Replays the pending queue against the backend.
//!
//! The engine drains the queue on reconnect (after a settle delay) or on
//! demand. Operations are applied one at a time, in insertion order, since a
//! later operation may depend on an earlier one (catch before release).

use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::connectivity::ConnectivityEvent;
use crate::gateway::GatewayError;
use crate::query::QueryClient;
use crate::queue::{PendingMutation, PendingQueue, QueueError, QueuedOperation, RetryOutcome};
use crate::repository::PokedexRepository;
use crate::retry::DurableRetryPolicy;

/// Wait after reconnecting before draining, so a flaky link can settle.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SyncError {
  #[error(transparent)]
  Queue(#[from] QueueError),

  #[error(transparent)]
  Gateway(#[from] GatewayError),
}

/// Outcome of one drain pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
  pub attempted: usize,
  pub succeeded: usize,
  /// Failed and kept with an incremented retry count
  pub retried: usize,
  /// Failed at the retry ceiling and removed
  pub dropped: usize,
}

#[derive(Clone)]
pub struct SyncEngine {
  repository: PokedexRepository,
  queue: PendingQueue,
  client: QueryClient,
  policy: DurableRetryPolicy,
  settle_delay: Duration,
}

impl SyncEngine {
  pub fn new(repository: PokedexRepository, queue: PendingQueue, client: QueryClient) -> Self {
    Self {
      repository,
      queue,
      client,
      policy: DurableRetryPolicy::default(),
      settle_delay: DEFAULT_SETTLE_DELAY,
    }
  }

  pub fn with_policy(mut self, policy: DurableRetryPolicy) -> Self {
    self.policy = policy;
    self
  }

  pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
    self.settle_delay = settle_delay;
    self
  }

  /// Replay every queued operation once. Returns how many succeeded.
  pub async fn drain(&self) -> usize {
    self.drain_with_report().await.succeeded
  }

  pub async fn drain_with_report(&self) -> DrainReport {
    let operations = self.queue.snapshot();
    if operations.is_empty() {
      debug!("no pending operations to sync");
      return DrainReport::default();
    }

    info!(count = operations.len(), "syncing pending operations");
    let mut report = DrainReport::default();

    for operation in &operations {
      report.attempted += 1;

      match self.apply(operation).await {
        Ok(()) => {
          self.queue.complete(operation);
          report.succeeded += 1;
        }
        Err(e) => {
          warn!(id = operation.id, kind = %operation.kind, error = %e, "failed to sync operation");
          match self.queue.record_failure(operation, &self.policy) {
            RetryOutcome::Requeued { .. } => report.retried += 1,
            RetryOutcome::Dropped { .. } => report.dropped += 1,
          }
        }
      }
    }

    if report.succeeded > 0 {
      self.client.invalidate_all();
    }

    info!(
      attempted = report.attempted,
      succeeded = report.succeeded,
      retried = report.retried,
      dropped = report.dropped,
      "sync finished"
    );
    report
  }

  async fn apply(&self, operation: &QueuedOperation) -> Result<(), SyncError> {
    match operation.mutation()? {
      PendingMutation::Catch(args) => {
        self.repository.catch_pokemon(&args).await?;
      }
      PendingMutation::Release(args) => {
        self.repository.release_pokemon(&args).await?;
      }
    }
    Ok(())
  }

  /// Settle, drain, then refetch whatever is on screen.
  ///
  /// Returns `None` when the connection dropped again during the settle delay.
  pub async fn handle_reconnect(&self) -> Option<DrainReport> {
    tokio::time::sleep(self.settle_delay).await;

    if !self.repository.connectivity().is_online() {
      info!("connection lost again before sync, skipping");
      return None;
    }

    let report = self.drain_with_report().await;
    let refetched = self.client.refetch_active().await;
    debug!(refetched, "refetched active queries");
    Some(report)
  }

  /// Consume connectivity events until the channel closes.
  pub async fn run(&self, mut events: mpsc::UnboundedReceiver<ConnectivityEvent>) {
    while let Some(event) = events.recv().await {
      match event {
        ConnectivityEvent::Online => {
          self.handle_reconnect().await;
        }
        ConnectivityEvent::Offline => {
          info!("offline, mutations will be queued");
        }
      }
    }
    debug!("connectivity channel closed, sync loop stopped");
  }
}
