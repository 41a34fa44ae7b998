//! Shared query cache.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::Utc;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::task::AbortHandle;
use tracing::debug;

use super::{DehydratedQuery, NetworkMode, QueryError, QueryFilter, QueryKey, QueryOptions};
use crate::connectivity::Connectivity;

/// Type-erased fetcher producing JSON data.
pub(crate) type Fetcher = Arc<dyn Fn() -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

type SharedFetch = Shared<BoxFuture<'static, Result<Value, QueryError>>>;

/// Fetch lifecycle of a cache entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStatus {
  Idle,
  Fetching,
  Success,
  Error(String),
}

struct InFlight {
  generation: u64,
  future: SharedFetch,
  abort: AbortHandle,
}

struct CacheEntry {
  data: Option<Value>,
  updated_at: Option<Instant>,
  invalidated: bool,
  status: FetchStatus,
  in_flight: Option<InFlight>,
  /// Bumped on every fetch start and cancellation; stale responses compare unequal
  generation: u64,
  observers: usize,
  last_accessed: Instant,
  options: QueryOptions,
  fetcher: Option<Fetcher>,
}

impl CacheEntry {
  fn new(options: QueryOptions) -> Self {
    Self {
      data: None,
      updated_at: None,
      invalidated: false,
      status: FetchStatus::Idle,
      in_flight: None,
      generation: 0,
      observers: 0,
      last_accessed: Instant::now(),
      options,
      fetcher: None,
    }
  }

  fn is_fresh(&self) -> bool {
    !self.invalidated
      && self.data.is_some()
      && self
        .updated_at
        .is_some_and(|t| t.elapsed() < self.options.stale_time)
  }

  fn set_data(&mut self, data: Option<Value>) {
    self.updated_at = data.as_ref().map(|_| Instant::now());
    self.status = if data.is_some() {
      FetchStatus::Success
    } else {
      FetchStatus::Idle
    };
    self.data = data;
    self.invalidated = false;
  }
}

struct Inner {
  entries: Mutex<HashMap<QueryKey, CacheEntry>>,
  connectivity: Connectivity,
  defaults: QueryOptions,
}

impl Inner {
  fn entries(&self) -> MutexGuard<'_, HashMap<QueryKey, CacheEntry>> {
    match self.entries.lock() {
      Ok(entries) => entries,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  /// Store a finished fetch unless it was superseded or cancelled.
  fn settle(&self, key: &QueryKey, generation: u64, result: &Result<Value, QueryError>) {
    let mut entries = self.entries();
    let Some(entry) = entries.get_mut(key) else {
      return;
    };
    if entry.generation != generation {
      debug!(query = %key.description(), "discarding superseded response");
      return;
    }

    entry.in_flight = None;
    match result {
      Ok(data) => entry.set_data(Some(data.clone())),
      // Previous data stays visible after a failed refetch
      Err(e) => entry.status = FetchStatus::Error(e.to_string()),
    }
  }
}

/// Process-wide query cache, cheap to clone.
#[derive(Clone)]
pub struct QueryClient {
  inner: Arc<Inner>,
}

impl QueryClient {
  pub fn new(connectivity: Connectivity) -> Self {
    Self::with_defaults(connectivity, QueryOptions::default())
  }

  /// Create a client whose entries default to `defaults` until a fetch sets options.
  pub fn with_defaults(connectivity: Connectivity, defaults: QueryOptions) -> Self {
    Self {
      inner: Arc::new(Inner {
        entries: Mutex::new(HashMap::new()),
        connectivity,
        defaults,
      }),
    }
  }

  /// Read through the cache.
  ///
  /// Fresh data is returned as-is. A fetch already running for `key` is
  /// joined instead of starting another one. Otherwise `fetcher` runs under
  /// the query's retry policy and its result is cached.
  pub async fn fetch_query<T, F, Fut>(
    &self,
    key: QueryKey,
    options: QueryOptions,
    fetcher: F,
  ) -> Result<T, QueryError>
  where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, String>> + Send + 'static,
  {
    let value = self.fetch_value(key, options, erase(fetcher)).await?;
    decode(value)
  }

  pub(crate) async fn fetch_value(
    &self,
    key: QueryKey,
    options: QueryOptions,
    fetcher: Fetcher,
  ) -> Result<Value, QueryError> {
    let pending = {
      let mut entries = self.inner.entries();
      let entry = entries
        .entry(key.clone())
        .or_insert_with(|| CacheEntry::new(options));
      entry.options = options;
      entry.fetcher = Some(fetcher.clone());
      entry.last_accessed = Instant::now();

      if entry.is_fresh() {
        if let Some(data) = &entry.data {
          debug!(query = %key.description(), "cache hit");
          return Ok(data.clone());
        }
      }

      match &entry.in_flight {
        Some(in_flight) => {
          debug!(query = %key.description(), "joining in-flight fetch");
          in_flight.future.clone()
        }
        None => {
          if !self.may_start(&options) {
            debug!(query = %key.description(), "offline, query paused");
            return entry.data.clone().ok_or(QueryError::Paused);
          }
          self.start_fetch(&key, entry, fetcher)
        }
      }
    };

    pending.await
  }

  fn may_start(&self, options: &QueryOptions) -> bool {
    options.network_mode != NetworkMode::Online || self.inner.connectivity.is_online()
  }

  /// Spawn a fetch for `entry`. The caller holds the entries lock.
  fn start_fetch(&self, key: &QueryKey, entry: &mut CacheEntry, fetcher: Fetcher) -> SharedFetch {
    entry.generation += 1;
    entry.status = FetchStatus::Fetching;

    let generation = entry.generation;
    let options = entry.options;
    let connectivity =
      (options.network_mode != NetworkMode::Always).then(|| self.inner.connectivity.clone());
    let inner = Arc::clone(&self.inner);
    let task_key = key.clone();

    let handle = tokio::spawn(async move {
      let result = options
        .retry
        .run(connectivity.as_ref(), || fetcher())
        .await
        .map_err(QueryError::Fetch);
      inner.settle(&task_key, generation, &result);
      result
    });

    let abort = handle.abort_handle();
    let future = async move { handle.await.unwrap_or(Err(QueryError::Cancelled)) }
      .boxed()
      .shared();

    entry.in_flight = Some(InFlight {
      generation,
      future: future.clone(),
      abort,
    });
    future
  }

  /// Typed view of the cached data for `key`.
  pub fn get_query_data<T: DeserializeOwned>(&self, key: &QueryKey) -> Option<T> {
    self
      .snapshot(key)
      .and_then(|data| serde_json::from_value(data).ok())
  }

  /// Overwrite the cached data for `key`, marking it fresh.
  pub fn set_query_data<T: Serialize>(&self, key: &QueryKey, data: &T) -> Result<(), QueryError> {
    let value = serde_json::to_value(data).map_err(|e| QueryError::Decode(e.to_string()))?;
    self.restore(key, Some(value));
    Ok(())
  }

  /// Raw cached data for `key`, for snapshot/rollback.
  pub fn snapshot(&self, key: &QueryKey) -> Option<Value> {
    self
      .inner
      .entries()
      .get(key)
      .and_then(|entry| entry.data.clone())
  }

  /// Put back a snapshot taken with [`QueryClient::snapshot`]. `None` clears the data.
  pub fn restore(&self, key: &QueryKey, snapshot: Option<Value>) {
    let mut entries = self.inner.entries();
    match entries.get_mut(key) {
      Some(entry) => entry.set_data(snapshot),
      None => {
        if snapshot.is_some() {
          let mut entry = CacheEntry::new(self.inner.defaults);
          entry.set_data(snapshot);
          entries.insert(key.clone(), entry);
        }
      }
    }
  }

  /// Cancel the in-flight fetch for `key`; a late response is ignored.
  pub fn cancel_queries(&self, key: &QueryKey) {
    let mut entries = self.inner.entries();
    let Some(entry) = entries.get_mut(key) else {
      return;
    };

    entry.generation += 1;
    if let Some(in_flight) = entry.in_flight.take() {
      debug!(
        query = %key.description(),
        generation = in_flight.generation,
        "cancelling in-flight fetch"
      );
      in_flight.abort.abort();
    }
    if entry.status == FetchStatus::Fetching {
      entry.status = if entry.data.is_some() {
        FetchStatus::Success
      } else {
        FetchStatus::Idle
      };
    }
  }

  /// Mark matching entries stale and refetch the ones being observed.
  ///
  /// Refetches need a tokio runtime; without one entries are only marked
  /// stale and refetch on their next read. Returns the number of entries
  /// invalidated.
  pub fn invalidate_queries(&self, filter: &QueryFilter) -> usize {
    let can_spawn = tokio::runtime::Handle::try_current().is_ok();
    let mut entries = self.inner.entries();
    let mut count = 0;

    for (key, entry) in entries.iter_mut().filter(|(key, _)| filter.matches(key)) {
      entry.invalidated = true;
      count += 1;

      if !can_spawn
        || entry.observers == 0
        || entry.in_flight.is_some()
        || !self.may_start(&entry.options)
      {
        continue;
      }
      if let Some(fetcher) = entry.fetcher.clone() {
        debug!(query = %key.description(), "refetching invalidated query");
        // Runs in the background; observers pick the result up from the cache
        let _ = self.start_fetch(key, entry, fetcher);
      }
    }

    count
  }

  pub fn invalidate_all(&self) -> usize {
    self.invalidate_queries(&QueryFilter::All)
  }

  /// Refetch every observed entry and wait for all of them to settle.
  pub async fn refetch_active(&self) -> usize {
    let pending: Vec<SharedFetch> = {
      let mut entries = self.inner.entries();
      entries
        .iter_mut()
        .filter(|(_, entry)| entry.observers > 0 && self.may_start(&entry.options))
        .filter_map(|(key, entry)| match &entry.in_flight {
          Some(in_flight) => Some(in_flight.future.clone()),
          None => {
            let fetcher = entry.fetcher.clone()?;
            Some(self.start_fetch(key, entry, fetcher))
          }
        })
        .collect()
    };

    let count = pending.len();
    join_all(pending).await;
    count
  }

  /// Evict unobserved, idle entries older than their `gc_time`.
  pub fn collect_garbage(&self) -> usize {
    let mut entries = self.inner.entries();
    let before = entries.len();
    entries.retain(|_, entry| {
      entry.observers > 0
        || entry.in_flight.is_some()
        || entry.last_accessed.elapsed() < entry.options.gc_time
    });
    before - entries.len()
  }

  pub(crate) fn register_observer(&self, key: &QueryKey, options: QueryOptions, fetcher: Fetcher) {
    let mut entries = self.inner.entries();
    let entry = entries
      .entry(key.clone())
      .or_insert_with(|| CacheEntry::new(options));
    entry.options = options;
    entry.fetcher = Some(fetcher);
    entry.observers += 1;
    entry.last_accessed = Instant::now();
  }

  pub(crate) fn unregister_observer(&self, key: &QueryKey) {
    if let Some(entry) = self.inner.entries().get_mut(key) {
      entry.observers = entry.observers.saturating_sub(1);
      entry.last_accessed = Instant::now();
    }
  }

  pub fn status(&self, key: &QueryKey) -> Option<FetchStatus> {
    self
      .inner
      .entries()
      .get(key)
      .map(|entry| entry.status.clone())
  }

  pub fn is_stale(&self, key: &QueryKey) -> bool {
    self
      .inner
      .entries()
      .get(key)
      .map_or(true, |entry| !entry.is_fresh())
  }

  pub fn is_fetching(&self, key: &QueryKey) -> bool {
    self
      .inner
      .entries()
      .get(key)
      .is_some_and(|entry| entry.in_flight.is_some())
  }

  pub fn len(&self) -> usize {
    self.inner.entries().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Settled, valid entries in a form that can be persisted.
  ///
  /// Invalidated entries are left out: they may still hold optimistic data
  /// that only a refetch replaces.
  pub fn dehydrate(&self) -> Vec<DehydratedQuery> {
    let now = Utc::now();
    self
      .inner
      .entries()
      .iter()
      .filter(|(_, entry)| !entry.invalidated && entry.status != FetchStatus::Fetching)
      .filter_map(|(key, entry)| {
        let data = entry.data.clone()?;
        let age = entry.updated_at?.elapsed();
        let age = chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero());
        Some(DehydratedQuery {
          key: key.clone(),
          data,
          updated_at: now - age,
        })
      })
      .collect()
  }

  /// Seed the cache from persisted snapshots. Existing data wins.
  pub fn hydrate(&self, snapshots: Vec<DehydratedQuery>) -> usize {
    let now = Utc::now();
    let mut entries = self.inner.entries();
    let mut restored = 0;

    for snapshot in snapshots {
      let entry = entries
        .entry(snapshot.key)
        .or_insert_with(|| CacheEntry::new(self.inner.defaults));
      if entry.data.is_some() {
        continue;
      }

      let age = (now - snapshot.updated_at).to_std().unwrap_or_default();
      entry.set_data(Some(snapshot.data));
      entry.updated_at = Instant::now().checked_sub(age).or(entry.updated_at);
      restored += 1;
    }

    restored
  }
}

/// Wrap a typed fetcher into a JSON-producing one.
pub(crate) fn erase<T, F, Fut>(fetcher: F) -> Fetcher
where
  T: Serialize + Send + 'static,
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<T, String>> + Send + 'static,
{
  Arc::new(move || {
    let fut = fetcher();
    async move {
      let data = fut.await?;
      serde_json::to_value(data).map_err(|e| e.to_string())
    }
    .boxed()
  })
}

pub(crate) fn decode<T: DeserializeOwned>(value: Value) -> Result<T, QueryError> {
  serde_json::from_value(value).map_err(|e| QueryError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::retry::{no_backoff, ImmediateRetryPolicy};
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::time::Duration;

  fn options() -> QueryOptions {
    QueryOptions::default().with_retry(ImmediateRetryPolicy::none())
  }

  fn counting_fetcher(
    counter: Arc<AtomicU32>,
    delay: Duration,
  ) -> impl Fn() -> BoxFuture<'static, Result<u32, String>> + Send + Sync + 'static {
    move || {
      let counter = counter.clone();
      async move {
        tokio::time::sleep(delay).await;
        Ok(counter.fetch_add(1, Ordering::SeqCst) + 1)
      }
      .boxed()
    }
  }

  #[tokio::test]
  async fn test_fresh_data_is_served_from_cache() {
    let client = QueryClient::new(Connectivity::new(true));
    let counter = Arc::new(AtomicU32::new(0));

    let first: u32 = client
      .fetch_query(QueryKey::Pokemons, options(), counting_fetcher(counter.clone(), Duration::ZERO))
      .await
      .unwrap();
    let second: u32 = client
      .fetch_query(QueryKey::Pokemons, options(), counting_fetcher(counter.clone(), Duration::ZERO))
      .await
      .unwrap();

    assert_eq!((first, second), (1, 1));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_stale_data_is_refetched() {
    let client = QueryClient::new(Connectivity::new(true));
    let counter = Arc::new(AtomicU32::new(0));
    let opts = options().with_stale_time(Duration::ZERO);

    client
      .fetch_query::<u32, _, _>(QueryKey::Pokemons, opts, counting_fetcher(counter.clone(), Duration::ZERO))
      .await
      .unwrap();
    let second: u32 = client
      .fetch_query(QueryKey::Pokemons, opts, counting_fetcher(counter.clone(), Duration::ZERO))
      .await
      .unwrap();

    assert_eq!(second, 2);
  }

  #[tokio::test]
  async fn test_concurrent_fetches_are_coalesced() {
    let client = QueryClient::new(Connectivity::new(true));
    let counter = Arc::new(AtomicU32::new(0));
    let slow = Duration::from_millis(30);

    let (a, b) = tokio::join!(
      client.fetch_query::<u32, _, _>(QueryKey::Pokemons, options(), counting_fetcher(counter.clone(), slow)),
      client.fetch_query::<u32, _, _>(QueryKey::Pokemons, options(), counting_fetcher(counter.clone(), slow)),
    );

    assert_eq!(a.unwrap(), 1);
    assert_eq!(b.unwrap(), 1);
    assert_eq!(counter.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_cancelled_fetch_cannot_overwrite_data() {
    let client = QueryClient::new(Connectivity::new(true));
    let counter = Arc::new(AtomicU32::new(0));
    let key = QueryKey::Pokemons;

    let background = {
      let client = client.clone();
      let fetcher = counting_fetcher(counter.clone(), Duration::from_millis(40));
      tokio::spawn(async move { client.fetch_query::<u32, _, _>(QueryKey::Pokemons, options(), fetcher).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(client.is_fetching(&key));

    client.cancel_queries(&key);
    client.set_query_data(&key, &99u32).unwrap();

    assert_eq!(background.await.unwrap(), Err(QueryError::Cancelled));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.get_query_data::<u32>(&key), Some(99));
    assert!(!client.is_fetching(&key));
  }

  #[tokio::test]
  async fn test_invalidation_forces_refetch() {
    let client = QueryClient::new(Connectivity::new(true));
    let counter = Arc::new(AtomicU32::new(0));
    let user_key = QueryKey::Pokedex {
      user_id: "ash".to_string(),
    };

    for key in [QueryKey::Pokemons, user_key.clone()] {
      client
        .fetch_query::<u32, _, _>(key, options(), counting_fetcher(counter.clone(), Duration::ZERO))
        .await
        .unwrap();
    }

    assert_eq!(client.invalidate_queries(&QueryFilter::User("ash".to_string())), 1);
    assert!(client.is_stale(&user_key));
    assert!(!client.is_stale(&QueryKey::Pokemons));
    // Invalidated data is still readable until the refetch lands
    assert_eq!(client.get_query_data::<u32>(&user_key), Some(2));

    let refetched: u32 = client
      .fetch_query(user_key, options(), counting_fetcher(counter.clone(), Duration::ZERO))
      .await
      .unwrap();
    assert_eq!(refetched, 3);
  }

  #[tokio::test]
  async fn test_failed_refetch_keeps_previous_data() {
    let client = QueryClient::new(Connectivity::new(true));
    let opts = options().with_stale_time(Duration::ZERO);

    client
      .fetch_query(QueryKey::Pokemons, opts, || async { Ok::<_, String>(vec![1, 2]) })
      .await
      .unwrap();
    let result = client
      .fetch_query::<Vec<i32>, _, _>(QueryKey::Pokemons, opts, || async { Err("down".to_string()) })
      .await;

    assert_eq!(result, Err(QueryError::Fetch("down".to_string())));
    assert_eq!(client.get_query_data::<Vec<i32>>(&QueryKey::Pokemons), Some(vec![1, 2]));
    assert_eq!(
      client.status(&QueryKey::Pokemons),
      Some(FetchStatus::Error("down".to_string()))
    );
  }

  #[tokio::test]
  async fn test_fetch_retries_under_policy() {
    let client = QueryClient::new(Connectivity::new(true));
    let counter = Arc::new(AtomicU32::new(0));
    let calls = counter.clone();
    let opts = options().with_retry(ImmediateRetryPolicy::new(2, no_backoff));

    let result = client
      .fetch_query::<u32, _, _>(QueryKey::Pokemons, opts, move || {
        let calls = calls.clone();
        async move {
          calls.fetch_add(1, Ordering::SeqCst);
          Err("flaky".to_string())
        }
      })
      .await;

    assert!(result.is_err());
    assert_eq!(counter.load(Ordering::SeqCst), 3);
  }

  #[tokio::test]
  async fn test_online_mode_pauses_while_offline() {
    let connectivity = Connectivity::new(false);
    let client = QueryClient::new(connectivity.clone());
    let counter = Arc::new(AtomicU32::new(0));
    let opts = options().with_network_mode(NetworkMode::Online);

    let paused = client
      .fetch_query::<u32, _, _>(QueryKey::Pokemons, opts, counting_fetcher(counter.clone(), Duration::ZERO))
      .await;
    assert_eq!(paused, Err(QueryError::Paused));

    client.set_query_data(&QueryKey::Pokemons, &7u32).unwrap();
    client.invalidate_all();
    let cached: u32 = client
      .fetch_query(QueryKey::Pokemons, opts, counting_fetcher(counter.clone(), Duration::ZERO))
      .await
      .unwrap();
    assert_eq!(cached, 7);
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    // Offline-first still makes the first attempt
    let attempted: u32 = client
      .fetch_query(
        QueryKey::Pokemons,
        opts.with_network_mode(NetworkMode::OfflineFirst),
        counting_fetcher(counter.clone(), Duration::ZERO),
      )
      .await
      .unwrap();
    assert_eq!(attempted, 1);
  }

  #[tokio::test]
  async fn test_garbage_collection_spares_observed_entries() {
    let client = QueryClient::new(Connectivity::new(true));
    let opts = options().with_gc_time(Duration::ZERO);
    let observed = QueryKey::AllPokemonTypes;

    client
      .fetch_query(QueryKey::Pokemons, opts, || async { Ok::<_, String>(1) })
      .await
      .unwrap();
    client.register_observer(&observed, opts, erase(|| async { Ok::<_, String>(2) }));

    assert_eq!(client.collect_garbage(), 1);
    assert_eq!(client.len(), 1);

    client.unregister_observer(&observed);
    assert_eq!(client.collect_garbage(), 1);
    assert!(client.is_empty());
  }

  #[tokio::test]
  async fn test_dehydrate_and_hydrate() {
    let client = QueryClient::new(Connectivity::new(true));
    client.set_query_data(&QueryKey::Pokemons, &vec!["pikachu"]).unwrap();

    let snapshots = client.dehydrate();
    assert_eq!(snapshots.len(), 1);

    let restored = QueryClient::new(Connectivity::new(true));
    assert_eq!(restored.hydrate(snapshots), 1);
    assert_eq!(
      restored.get_query_data::<Vec<String>>(&QueryKey::Pokemons),
      Some(vec!["pikachu".to_string()])
    );
    assert!(!restored.is_stale(&QueryKey::Pokemons));
  }

  #[tokio::test]
  async fn test_dehydrate_skips_invalidated_entries() {
    let client = QueryClient::new(Connectivity::new(true));
    client.set_query_data(&QueryKey::Pokemons, &vec!["pikachu"]).unwrap();
    client.set_query_data(&QueryKey::AllPokemonTypes, &vec!["electric"]).unwrap();
    client.invalidate_queries(&QueryFilter::Key(QueryKey::Pokemons));

    let snapshots = client.dehydrate();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].key, QueryKey::AllPokemonTypes);

    let restored = QueryClient::new(Connectivity::new(true));
    assert_eq!(restored.hydrate(snapshots), 1);
    assert_eq!(restored.get_query_data::<Vec<String>>(&QueryKey::Pokemons), None);
    assert!(restored.is_stale(&QueryKey::Pokemons));
  }

  #[test]
  fn test_invalidation_without_runtime_only_marks_stale() {
    let client = QueryClient::new(Connectivity::new(true));
    let key = QueryKey::Pokemons;
    client.register_observer(&key, options(), erase(|| async { Ok::<_, String>(2) }));
    client.set_query_data(&key, &1u32).unwrap();

    assert_eq!(client.invalidate_all(), 1);
    assert!(client.is_stale(&key));
    assert!(!client.is_fetching(&key));
    assert_eq!(client.get_query_data::<u32>(&key), Some(1));
  }
}
