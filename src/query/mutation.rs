//! Optimistic mutations with rollback and offline queueing.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use super::{QueryClient, QueryFilter, QueryKey};
use crate::connectivity::Connectivity;
use crate::gateway::GatewayError;
use crate::queue::{PendingMutation, PendingQueue};
use crate::retry::{exponential_backoff, ImmediateRetryPolicy};

/// A write with a speculative effect on cached queries.
#[async_trait]
pub trait OptimisticMutation: Send + Sync {
  type Variables: Send + Sync;
  type Output: Send;

  /// Name used in logs
  fn name(&self) -> &'static str;

  /// Cache keys the mutation touches.
  fn affected_keys(&self, vars: &Self::Variables) -> Vec<QueryKey>;

  /// Synthetic data for `key` given its current data. `None` leaves it untouched.
  fn apply_optimistic(
    &self,
    key: &QueryKey,
    vars: &Self::Variables,
    current: Option<&Value>,
  ) -> Option<Value>;

  /// Perform the real write.
  async fn execute(&self, vars: &Self::Variables) -> Result<Self::Output, GatewayError>;

  /// The queue entry replaying this mutation later.
  fn pending(&self, vars: &Self::Variables) -> PendingMutation;
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MutationError {
  /// The write failed and the cache was rolled back. `queued` tells whether
  /// it was handed to the pending queue.
  #[error("{source}")]
  Failed {
    #[source]
    source: GatewayError,
    queued: bool,
  },
}

impl MutationError {
  pub fn is_queued(&self) -> bool {
    match self {
      Self::Failed { queued, .. } => *queued,
    }
  }
}

/// Runs [`OptimisticMutation`]s against the query cache.
#[derive(Clone)]
pub struct MutationRunner {
  client: QueryClient,
  queue: PendingQueue,
  connectivity: Connectivity,
  retry: ImmediateRetryPolicy,
}

impl MutationRunner {
  pub fn new(client: QueryClient, queue: PendingQueue, connectivity: Connectivity) -> Self {
    Self {
      client,
      queue,
      connectivity,
      retry: ImmediateRetryPolicy::new(2, exponential_backoff),
    }
  }

  pub fn with_retry(mut self, retry: ImmediateRetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn client(&self) -> &QueryClient {
    &self.client
  }

  /// Apply `mutation` optimistically, then confirm or roll back.
  ///
  /// 1. Cancel in-flight fetches of the affected keys
  /// 2. Snapshot and apply the synthetic update to each key
  /// 3. Execute under the retry policy
  /// 4. On failure restore every snapshot and enqueue the mutation
  /// 5. Invalidate the affected keys either way
  pub async fn run<M: OptimisticMutation>(
    &self,
    mutation: &M,
    vars: &M::Variables,
  ) -> Result<M::Output, MutationError> {
    let snapshots: Vec<(QueryKey, Option<Value>)> = mutation
      .affected_keys(vars)
      .into_iter()
      .map(|key| {
        self.client.cancel_queries(&key);
        let snapshot = self.client.snapshot(&key);
        if let Some(optimistic) = mutation.apply_optimistic(&key, vars, snapshot.as_ref()) {
          self.client.restore(&key, Some(optimistic));
        }
        (key, snapshot)
      })
      .collect();

    let result = self
      .retry
      .run(Some(&self.connectivity), || mutation.execute(vars))
      .await;

    let outcome = match result {
      Ok(output) => {
        debug!(mutation = mutation.name(), "mutation confirmed");
        Ok(output)
      }
      Err(source) => {
        for (key, snapshot) in &snapshots {
          self.client.restore(key, snapshot.clone());
        }
        let queued = self.queue.enqueue(&mutation.pending(vars));
        warn!(
          mutation = mutation.name(),
          error = %source,
          queued,
          "mutation failed, rolled back and queued for retry"
        );
        Err(MutationError::Failed { source, queued })
      }
    };

    for (key, _) in &snapshots {
      self.client.invalidate_queries(&QueryFilter::Key(key.clone()));
    }

    outcome
  }
}

/// State of a [`Mutation`] handle
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MutationState {
  #[default]
  Idle,
  Pending,
  Success,
  Error(String),
}

/// Handle for invoking one kind of mutation and observing its status.
///
/// Clones share state, so a render loop can watch `is_pending` while another
/// task awaits `mutate_async`.
pub struct Mutation<M> {
  runner: MutationRunner,
  mutation: Arc<M>,
  state: Arc<Mutex<MutationState>>,
}

impl<M> Clone for Mutation<M> {
  fn clone(&self) -> Self {
    Self {
      runner: self.runner.clone(),
      mutation: Arc::clone(&self.mutation),
      state: Arc::clone(&self.state),
    }
  }
}

impl<M: OptimisticMutation> Mutation<M> {
  pub fn new(runner: MutationRunner, mutation: M) -> Self {
    Self {
      runner,
      mutation: Arc::new(mutation),
      state: Arc::new(Mutex::new(MutationState::Idle)),
    }
  }

  fn set_state(&self, state: MutationState) {
    match self.state.lock() {
      Ok(mut current) => *current = state,
      Err(poisoned) => *poisoned.into_inner() = state,
    }
  }

  pub fn state(&self) -> MutationState {
    match self.state.lock() {
      Ok(state) => state.clone(),
      Err(poisoned) => poisoned.into_inner().clone(),
    }
  }

  pub async fn mutate_async(&self, vars: M::Variables) -> Result<M::Output, MutationError> {
    self.set_state(MutationState::Pending);
    let result = self.runner.run(self.mutation.as_ref(), &vars).await;
    self.set_state(match &result {
      Ok(_) => MutationState::Success,
      Err(e) => MutationState::Error(e.to_string()),
    });
    result
  }

  pub fn is_pending(&self) -> bool {
    self.state() == MutationState::Pending
  }

  pub fn is_success(&self) -> bool {
    self.state() == MutationState::Success
  }

  pub fn is_error(&self) -> bool {
    matches!(self.state(), MutationState::Error(_))
  }

  pub fn reset(&self) {
    self.set_state(MutationState::Idle);
  }
}
