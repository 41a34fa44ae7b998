//! Polling handle over one cached query.
//!
//! ```ignore
//! let repository = repository.clone();
//! let mut query = Query::new(&client, QueryKey::Pokemons, options, move || {
//!     let repository = repository.clone();
//!     async move { Ok(repository.fetch_pokemons().await.data) }
//! });
//!
//! query.fetch();
//!
//! // In event loop tick
//! if query.poll() {
//!     // State changed, trigger re-render
//! }
//! ```

use std::future::Future;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use super::client::{decode, erase, Fetcher};
use super::{QueryClient, QueryError, QueryFilter, QueryKey, QueryOptions};

/// The state of a query
#[derive(Debug, Clone)]
pub enum QueryState<T> {
  /// Query has not been started
  Idle,
  /// Query is currently fetching data
  Loading,
  /// Query completed successfully
  Success(T),
  /// Query failed with an error
  Error(String),
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error(_))
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

/// Observer of one [`QueryKey`] in a [`QueryClient`].
///
/// While alive it keeps the entry safe from garbage collection and lets
/// invalidations refetch it in the background. Cache writes made by others,
/// such as optimistic updates, show up on the next [`Query::poll`].
pub struct Query<T> {
  client: QueryClient,
  key: QueryKey,
  options: QueryOptions,
  fetcher: Fetcher,
  state: QueryState<T>,
  receiver: Option<mpsc::UnboundedReceiver<Result<T, QueryError>>>,
  /// Cache data last reflected in `state`
  seen: Option<Value>,
}

impl<T> Query<T>
where
  T: Serialize + DeserializeOwned + Send + 'static,
{
  /// Observe `key`, fetching with `fetcher` when needed.
  ///
  /// Starts in `Success` when the cache already holds data for `key`.
  pub fn new<F, Fut>(client: &QueryClient, key: QueryKey, options: QueryOptions, fetcher: F) -> Self
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, String>> + Send + 'static,
  {
    let fetcher = erase(fetcher);
    client.register_observer(&key, options, fetcher.clone());

    let mut query = Self {
      client: client.clone(),
      key,
      options,
      fetcher,
      state: QueryState::Idle,
      receiver: None,
      seen: None,
    };
    query.sync_with_cache();
    query
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  /// Get the current state of the query.
  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  pub fn data(&self) -> Option<&T> {
    self.state.data()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn is_success(&self) -> bool {
    self.state.is_success()
  }

  pub fn is_error(&self) -> bool {
    self.state.is_error()
  }

  pub fn error(&self) -> Option<&str> {
    self.state.error()
  }

  /// Check if the cached data is past its stale time or invalidated.
  pub fn is_stale(&self) -> bool {
    self.state.is_success() && self.client.is_stale(&self.key)
  }

  /// Start fetching data if not already loading.
  ///
  /// Fresh cached data is delivered without calling the fetcher.
  pub fn fetch(&mut self) {
    if self.state.is_loading() {
      return;
    }
    self.start_fetch();
  }

  /// Force a refetch, cancelling any pending fetch for the key.
  pub fn refetch(&mut self) {
    self.receiver = None;
    self.client.cancel_queries(&self.key);
    self
      .client
      .invalidate_queries(&QueryFilter::Key(self.key.clone()));
    self.start_fetch();
  }

  /// Poll for results from a pending fetch or changes to the cache.
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick handler.
  pub fn poll(&mut self) -> bool {
    let receiver = match &mut self.receiver {
      Some(rx) => rx,
      None => return self.sync_with_cache(),
    };

    match receiver.try_recv() {
      Ok(Ok(data)) => {
        self.state = QueryState::Success(data);
        self.seen = self.client.snapshot(&self.key);
        self.receiver = None;
        true
      }
      Ok(Err(error)) => {
        self.state = QueryState::Error(error.to_string());
        self.receiver = None;
        true
      }
      Err(mpsc::error::TryRecvError::Empty) => false,
      Err(mpsc::error::TryRecvError::Disconnected) => {
        self.state = QueryState::Error(QueryError::Cancelled.to_string());
        self.receiver = None;
        true
      }
    }
  }

  /// Pick up data written to the cache since the last look.
  fn sync_with_cache(&mut self) -> bool {
    let current = self.client.snapshot(&self.key);
    if current.is_none() || current == self.seen {
      return false;
    }

    self.seen = current.clone();
    match current.map(decode::<T>) {
      Some(Ok(data)) => self.state = QueryState::Success(data),
      Some(Err(e)) => self.state = QueryState::Error(e.to_string()),
      None => {}
    }
    true
  }

  fn start_fetch(&mut self) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    self.state = QueryState::Loading;

    let client = self.client.clone();
    let key = self.key.clone();
    let options = self.options;
    let fetcher = self.fetcher.clone();
    tokio::spawn(async move {
      let result = client
        .fetch_value(key, options, fetcher)
        .await
        .and_then(decode::<T>);
      // Receiver may have been dropped by a refetch
      let _ = tx.send(result);
    });
  }
}

impl<T> Drop for Query<T> {
  fn drop(&mut self) {
    self.client.unregister_observer(&self.key);
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("key", &self.key)
      .field("state", &self.state)
      .field("options", &self.options)
      .finish_non_exhaustive()
  }
}
