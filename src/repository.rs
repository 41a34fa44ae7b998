//! Offline-aware reads and writes over the gateway and the local store.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use crate::connectivity::Connectivity;
use crate::gateway::{Filter, GatewayError, RemoteGateway};
use crate::models::{PokedexEntry, Pokemon, PokemonStat, PokemonType};
use crate::queue::{CatchArgs, ReleaseArgs};
use crate::store::{Record, Scope, SqliteStore};

/// Columns requested for pokedex reads, embedding the catalog row.
const POKEDEX_SELECT: &str = "*,pokemons(id,name,type,sprite_url)";

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSource {
  /// Fresh data from the backend, now mirrored locally
  Network,
  /// Device offline, served from the local store without trying the network
  Offline,
  /// Backend call failed, served from the local store
  Fallback,
}

/// Result of a read, including where the data came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
  pub data: T,
  pub source: DataSource,
}

impl<T> Fetched<T> {
  fn new(data: T, source: DataSource) -> Self {
    Self { data, source }
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Fetched<U> {
    Fetched {
      data: f(self.data),
      source: self.source,
    }
  }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RepositoryError {
  #[error("User ID is required to fetch a pokedex")]
  MissingUserId,
}

/// Per-entity reads and writes that pick the remote or local source.
///
/// Reads never fail because of the backend: the worst case is stale or empty
/// data from the local store. Writes always go to the backend and never touch
/// the local store.
#[derive(Clone)]
pub struct PokedexRepository {
  gateway: Arc<dyn RemoteGateway>,
  store: Arc<SqliteStore>,
  connectivity: Connectivity,
}

impl PokedexRepository {
  pub fn new(
    gateway: Arc<dyn RemoteGateway>,
    store: Arc<SqliteStore>,
    connectivity: Connectivity,
  ) -> Self {
    Self {
      gateway,
      store,
      connectivity,
    }
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  /// Read-through over one collection.
  ///
  /// 1. Offline: return the local rows in `scope` without calling the backend
  /// 2. Online: fetch from the backend and mirror the rows into `scope`
  /// 3. On backend failure, return the local rows in `scope`
  async fn read_through<T: Record>(&self, filter: Filter, scope: Scope) -> Fetched<Vec<T>> {
    let collection = T::collection();

    if !self.connectivity.is_online() {
      debug!(collection = %collection, "offline, loading from local store");
      return Fetched::new(self.store.get_matching(&scope), DataSource::Offline);
    }

    match self.fetch_remote::<T>(&filter).await {
      Ok(records) => {
        if !self.store.replace_where(&scope, &records) {
          warn!(collection = %collection, "failed to mirror remote data locally");
        }
        Fetched::new(records, DataSource::Network)
      }
      Err(e) => {
        warn!(collection = %collection, error = %e, "remote read failed, falling back to local store");
        Fetched::new(self.store.get_matching(&scope), DataSource::Fallback)
      }
    }
  }

  async fn fetch_remote<T: Record>(&self, filter: &Filter) -> Result<Vec<T>, GatewayError> {
    self
      .gateway
      .list(T::collection(), filter)
      .await?
      .into_iter()
      .map(|row| serde_json::from_value(row).map_err(|e| GatewayError::Decode(e.to_string())))
      .collect()
  }

  // ==========================================================================
  // Catalog
  // ==========================================================================

  pub async fn fetch_pokemons(&self) -> Fetched<Vec<Pokemon>> {
    self
      .read_through(Filter::new().order_by("id", true), Scope::all())
      .await
  }

  pub async fn fetch_pokemon(&self, id: i64) -> Fetched<Option<Pokemon>> {
    self
      .read_through(Filter::new().eq("id", id), Scope::field("id", id))
      .await
      .map(|rows: Vec<Pokemon>| rows.into_iter().next())
  }

  pub async fn fetch_pokemon_stats(&self, pokemon_id: i64) -> Fetched<Vec<PokemonStat>> {
    self
      .read_through(
        Filter::new().eq("pokemon_id", pokemon_id),
        Scope::field("pokemon_id", pokemon_id),
      )
      .await
  }

  pub async fn fetch_all_pokemon_stats(&self) -> Fetched<Vec<PokemonStat>> {
    self.read_through(Filter::new(), Scope::all()).await
  }

  pub async fn fetch_pokemon_types(&self, pokemon_id: i64) -> Fetched<Vec<PokemonType>> {
    self
      .read_through(
        Filter::new()
          .eq("pokemon_id", pokemon_id)
          .order_by("slot", true),
        Scope::field("pokemon_id", pokemon_id),
      )
      .await
  }

  pub async fn fetch_all_pokemon_types(&self) -> Fetched<Vec<PokemonType>> {
    self.read_through(Filter::new(), Scope::all()).await
  }

  // ==========================================================================
  // Pokedex
  // ==========================================================================

  /// A user's caught pokemon, newest first when served by the backend.
  pub async fn fetch_pokedex(
    &self,
    user_id: &str,
  ) -> Result<Fetched<Vec<PokedexEntry>>, RepositoryError> {
    if user_id.is_empty() {
      return Err(RepositoryError::MissingUserId);
    }

    Ok(
      self
        .read_through(
          Filter::new()
            .select(POKEDEX_SELECT)
            .eq("user_id", user_id)
            .order_by("caught_at", false),
          Scope::field("user_id", user_id).order_by("caught_at", false),
        )
        .await,
    )
  }

  pub async fn is_pokemon_in_pokedex(&self, user_id: &str, pokemon_id: i64) -> Fetched<bool> {
    self
      .read_through(
        Filter::new()
          .select(POKEDEX_SELECT)
          .eq("user_id", user_id)
          .eq("pokemon_id", pokemon_id),
        Scope::field("user_id", user_id).and("pokemon_id", pokemon_id),
      )
      .await
      .map(|rows: Vec<PokedexEntry>| !rows.is_empty())
  }

  /// Insert a pokedex entry on the backend.
  pub async fn catch_pokemon(&self, args: &CatchArgs) -> Result<PokedexEntry, GatewayError> {
    let record = json!({
      "user_id": args.user_id,
      "pokemon_id": args.pokemon_id,
      "nickname": args.nickname,
      "caught_at": Utc::now().to_rfc3339(),
    });

    let row = self
      .gateway
      .insert(PokedexEntry::collection(), record)
      .await?;
    serde_json::from_value(row).map_err(|e| GatewayError::Decode(e.to_string()))
  }

  /// Delete a user's entries for a pokemon on the backend.
  pub async fn release_pokemon(&self, args: &ReleaseArgs) -> Result<(), GatewayError> {
    let filter = Filter::new()
      .eq("user_id", &args.user_id)
      .eq("pokemon_id", args.pokemon_id);
    self
      .gateway
      .delete(PokedexEntry::collection(), &filter)
      .await
  }
}
