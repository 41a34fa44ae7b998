//! Retry policies.
//!
//! Two policies exist and are never mixed:
//! - [`ImmediateRetryPolicy`] re-runs a single fetch or mutation attempt in
//!   place, with a backoff delay between attempts.
//! - [`DurableRetryPolicy`] caps how many drain cycles a queued operation
//!   survives.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::connectivity::Connectivity;

/// Upper bound for the exponential backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// `min(1s * 2^attempt, 30s)`
pub fn exponential_backoff(attempt: u32) -> Duration {
  let millis = 1000u64.saturating_mul(1u64 << attempt.min(16));
  Duration::from_millis(millis).min(MAX_BACKOFF)
}

pub fn no_backoff(_attempt: u32) -> Duration {
  Duration::ZERO
}

/// In-place retries for a single operation.
#[derive(Debug, Clone, Copy)]
pub struct ImmediateRetryPolicy {
  /// Retries after the first attempt
  pub attempts: u32,
  /// Delay before retry number `n` (zero-based)
  pub backoff: fn(u32) -> Duration,
}

impl ImmediateRetryPolicy {
  pub const fn new(attempts: u32, backoff: fn(u32) -> Duration) -> Self {
    Self { attempts, backoff }
  }

  /// Run once, never retry.
  pub const fn none() -> Self {
    Self::new(0, no_backoff)
  }

  pub fn delay_for(&self, attempt: u32) -> Duration {
    (self.backoff)(attempt)
  }

  /// Run `op`, retrying failures up to `attempts` times.
  ///
  /// When `connectivity` is given, retries stop as soon as the device is
  /// offline; the first attempt always runs.
  pub async fn run<T, E, F, Fut>(&self, connectivity: Option<&Connectivity>, mut op: F) -> Result<T, E>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
  {
    let mut attempt = 0;
    loop {
      match op().await {
        Ok(value) => return Ok(value),
        Err(e) => {
          if attempt >= self.attempts {
            return Err(e);
          }
          if connectivity.is_some_and(|c| !c.is_online()) {
            debug!(error = %e, "offline, not retrying");
            return Err(e);
          }

          let delay = self.delay_for(attempt);
          debug!(attempt = attempt + 1, ?delay, error = %e, "retrying");
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
      }
    }
  }
}

impl Default for ImmediateRetryPolicy {
  fn default() -> Self {
    Self::new(3, exponential_backoff)
  }
}

/// Ceiling on failed drain attempts for a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurableRetryPolicy {
  pub max_attempts: u32,
}

impl DurableRetryPolicy {
  pub const fn new(max_attempts: u32) -> Self {
    Self { max_attempts }
  }

  pub fn is_exhausted(&self, retry_count: u32) -> bool {
    retry_count >= self.max_attempts
  }
}

impl Default for DurableRetryPolicy {
  fn default() -> Self {
    Self::new(5)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};

  #[test]
  fn test_exponential_backoff_is_capped() {
    assert_eq!(exponential_backoff(0), Duration::from_secs(1));
    assert_eq!(exponential_backoff(1), Duration::from_secs(2));
    assert_eq!(exponential_backoff(4), Duration::from_secs(16));
    assert_eq!(exponential_backoff(5), MAX_BACKOFF);
    assert_eq!(exponential_backoff(40), MAX_BACKOFF);
  }

  #[tokio::test]
  async fn test_run_retries_until_success() {
    let calls = AtomicU32::new(0);
    let counter = &calls;
    let policy = ImmediateRetryPolicy::new(2, no_backoff);

    let result: Result<u32, String> = policy
      .run(None, move || async move {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        if n < 2 {
          Err("boom".to_string())
        } else {
          Ok(n)
        }
      })
      .await;

    assert_eq!(result, Ok(2));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_run_gives_up_after_attempts() {
    let calls = AtomicU32::new(0);
    let counter = &calls;
    let policy = ImmediateRetryPolicy::new(2, no_backoff);

    let result: Result<(), String> = policy
      .run(None, move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Err("boom".to_string())
      })
      .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_run_skips_retries_while_offline() {
    let calls = AtomicU32::new(0);
    let counter = &calls;
    let connectivity = Connectivity::new(false);
    let policy = ImmediateRetryPolicy::new(3, no_backoff);

    let result: Result<(), String> = policy
      .run(Some(&connectivity), move || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Err("offline".to_string())
      })
      .await;

    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_durable_policy_ceiling() {
    let policy = DurableRetryPolicy::default();
    assert!(!policy.is_exhausted(4));
    assert!(policy.is_exhausted(5));
  }
}
