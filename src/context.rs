//! Application context: the single place where the store, connectivity,
//! repository, pending queue, and query cache are wired together.
//!
//! Built once at startup and passed by reference, so tests can stand up
//! isolated instances side by side.

use std::sync::Arc;

use color_eyre::Result;

use crate::config::{CacheConfig, Config, SyncConfig};
use crate::connectivity::Connectivity;
use crate::gateway::RemoteGateway;
use crate::models::{PokedexEntry, Pokemon, PokemonStat, PokemonType};
use crate::mutations::{CatchPokemon, ReleasePokemon};
use crate::query::{Mutation, MutationRunner, Query, QueryClient, QueryError, QueryKey};
use crate::queue::PendingQueue;
use crate::repository::{PokedexRepository, RepositoryError};
use crate::store::SqliteStore;
use crate::sync::SyncEngine;

pub struct AppContext {
  store: Arc<SqliteStore>,
  connectivity: Connectivity,
  repository: PokedexRepository,
  queue: PendingQueue,
  client: QueryClient,
  runner: MutationRunner,
  cache: CacheConfig,
  sync: SyncConfig,
}

impl AppContext {
  pub fn new(
    gateway: Arc<dyn RemoteGateway>,
    store: Arc<SqliteStore>,
    connectivity: Connectivity,
    cache: CacheConfig,
    sync: SyncConfig,
  ) -> Self {
    let repository = PokedexRepository::new(gateway, store.clone(), connectivity.clone());
    let queue = PendingQueue::new(store.clone());
    let client = QueryClient::with_defaults(connectivity.clone(), cache.query_options());
    let runner = MutationRunner::new(client.clone(), queue.clone(), connectivity.clone())
      .with_retry(sync.mutation_policy());

    Self {
      store,
      connectivity,
      repository,
      queue,
      client,
      runner,
      cache,
      sync,
    }
  }

  /// Open the configured store and wire everything around `gateway`.
  pub fn from_config(config: &Config, gateway: Arc<dyn RemoteGateway>, online: bool) -> Result<Self> {
    let store = Arc::new(SqliteStore::open_at(&config.database_path()?)?);
    Ok(Self::new(
      gateway,
      store,
      Connectivity::new(online),
      config.cache,
      config.sync,
    ))
  }

  pub fn store(&self) -> &Arc<SqliteStore> {
    &self.store
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  pub fn repository(&self) -> &PokedexRepository {
    &self.repository
  }

  pub fn queue(&self) -> &PendingQueue {
    &self.queue
  }

  pub fn client(&self) -> &QueryClient {
    &self.client
  }

  pub fn sync_config(&self) -> &SyncConfig {
    &self.sync
  }

  pub fn sync_engine(&self) -> SyncEngine {
    SyncEngine::new(self.repository.clone(), self.queue.clone(), self.client.clone())
      .with_policy(self.sync.durable_policy())
      .with_settle_delay(self.sync.settle_delay())
  }

  pub fn catch_mutation(&self) -> Mutation<CatchPokemon> {
    Mutation::new(self.runner.clone(), CatchPokemon::new(self.repository.clone()))
  }

  pub fn release_mutation(&self) -> Mutation<ReleasePokemon> {
    Mutation::new(self.runner.clone(), ReleasePokemon::new(self.repository.clone()))
  }

  // ==========================================================================
  // Queries
  // ==========================================================================

  pub async fn pokemons(&self) -> Result<Vec<Pokemon>, QueryError> {
    let repository = self.repository.clone();
    self
      .client
      .fetch_query(QueryKey::Pokemons, self.cache.catalog_query_options(), move || {
        let repository = repository.clone();
        async move { Ok(repository.fetch_pokemons().await.data) }
      })
      .await
  }

  pub async fn pokemon(&self, id: i64) -> Result<Option<Pokemon>, QueryError> {
    let repository = self.repository.clone();
    self
      .client
      .fetch_query(QueryKey::Pokemon { id }, self.cache.catalog_query_options(), move || {
        let repository = repository.clone();
        async move { Ok(repository.fetch_pokemon(id).await.data) }
      })
      .await
  }

  pub async fn pokemon_stats(&self, pokemon_id: i64) -> Result<Vec<PokemonStat>, QueryError> {
    let repository = self.repository.clone();
    self
      .client
      .fetch_query(
        QueryKey::PokemonStats { pokemon_id },
        self.cache.catalog_query_options(),
        move || {
          let repository = repository.clone();
          async move { Ok(repository.fetch_pokemon_stats(pokemon_id).await.data) }
        },
      )
      .await
  }

  pub async fn all_pokemon_stats(&self) -> Result<Vec<PokemonStat>, QueryError> {
    let repository = self.repository.clone();
    self
      .client
      .fetch_query(QueryKey::AllPokemonStats, self.cache.catalog_query_options(), move || {
        let repository = repository.clone();
        async move { Ok(repository.fetch_all_pokemon_stats().await.data) }
      })
      .await
  }

  pub async fn pokemon_types(&self, pokemon_id: i64) -> Result<Vec<PokemonType>, QueryError> {
    let repository = self.repository.clone();
    self
      .client
      .fetch_query(
        QueryKey::PokemonTypes { pokemon_id },
        self.cache.catalog_query_options(),
        move || {
          let repository = repository.clone();
          async move { Ok(repository.fetch_pokemon_types(pokemon_id).await.data) }
        },
      )
      .await
  }

  pub async fn all_pokemon_types(&self) -> Result<Vec<PokemonType>, QueryError> {
    let repository = self.repository.clone();
    self
      .client
      .fetch_query(QueryKey::AllPokemonTypes, self.cache.catalog_query_options(), move || {
        let repository = repository.clone();
        async move { Ok(repository.fetch_all_pokemon_types().await.data) }
      })
      .await
  }

  pub async fn pokedex(&self, user_id: &str) -> Result<Vec<PokedexEntry>, QueryError> {
    // Checked up front so the retry policy does not back off on it
    if user_id.is_empty() {
      return Err(QueryError::Fetch(RepositoryError::MissingUserId.to_string()));
    }

    let repository = self.repository.clone();
    let user = user_id.to_string();
    self
      .client
      .fetch_query(
        QueryKey::Pokedex {
          user_id: user_id.to_string(),
        },
        self.cache.query_options(),
        move || {
          let repository = repository.clone();
          let user = user.clone();
          async move {
            repository
              .fetch_pokedex(&user)
              .await
              .map(|fetched| fetched.data)
              .map_err(|e| e.to_string())
          }
        },
      )
      .await
  }

  pub async fn is_in_pokedex(&self, user_id: &str, pokemon_id: i64) -> Result<bool, QueryError> {
    let repository = self.repository.clone();
    let user = user_id.to_string();
    self
      .client
      .fetch_query(
        QueryKey::IsInPokedex {
          user_id: user_id.to_string(),
          pokemon_id,
        },
        self.cache.query_options(),
        move || {
          let repository = repository.clone();
          let user = user.clone();
          async move { Ok(repository.is_pokemon_in_pokedex(&user, pokemon_id).await.data) }
        },
      )
      .await
  }

  /// Observed pokedex query, refetched whenever it is invalidated.
  pub fn pokedex_query(&self, user_id: &str) -> Query<Vec<PokedexEntry>> {
    let repository = self.repository.clone();
    let user = user_id.to_string();
    Query::new(
      &self.client,
      QueryKey::Pokedex {
        user_id: user_id.to_string(),
      },
      self.cache.query_options(),
      move || {
        let repository = repository.clone();
        let user = user.clone();
        async move {
          repository
            .fetch_pokedex(&user)
            .await
            .map(|fetched| fetched.data)
            .map_err(|e| e.to_string())
        }
      },
    )
  }

  // ==========================================================================
  // Query cache persistence
  // ==========================================================================

  /// Save successful query results so the next start has data immediately.
  pub fn persist_query_cache(&self) -> bool {
    self.store.save_query_snapshots(&self.client.dehydrate())
  }

  /// Load query results saved within the cache's gc window.
  pub fn restore_query_cache(&self) -> usize {
    let max_age = chrono::Duration::seconds(self.cache.gc_time_secs as i64);
    self
      .client
      .hydrate(self.store.load_query_snapshots(max_age))
  }
}
