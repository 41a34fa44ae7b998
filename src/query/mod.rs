//! In-memory query cache with optimistic mutation support.
//!
//! Inspired by TanStack Query:
//! - [`QueryClient`] caches fetched data per [`QueryKey`], coalesces
//!   concurrent fetches of the same key, and tracks freshness
//! - [`Query`] is a polling handle over one key, for rendering loops
//! - [`MutationRunner`] applies optimistic updates, rolls them back on
//!   failure, and hands failed mutations to the pending queue

mod client;
mod mutation;
mod observer;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::retry::ImmediateRetryPolicy;

pub use client::QueryClient;
pub use mutation::{Mutation, MutationError, MutationRunner, MutationState, OptimisticMutation};
pub use observer::{Query, QueryState};

/// Identity of a cached query: entity kind plus parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryKey {
  /// The whole catalog
  Pokemons,
  /// A single catalog entry
  Pokemon { id: i64 },
  /// A user's caught pokemon
  Pokedex { user_id: String },
  /// Whether a user has caught a pokemon
  IsInPokedex { user_id: String, pokemon_id: i64 },
  PokemonStats { pokemon_id: i64 },
  AllPokemonStats,
  PokemonTypes { pokemon_id: i64 },
  AllPokemonTypes,
}

impl QueryKey {
  pub fn description(&self) -> String {
    match self {
      Self::Pokemons => "all pokemons".to_string(),
      Self::Pokemon { id } => format!("pokemon {}", id),
      Self::Pokedex { user_id } => format!("pokedex of {}", user_id),
      Self::IsInPokedex {
        user_id,
        pokemon_id,
      } => format!("pokemon {} in pokedex of {}", pokemon_id, user_id),
      Self::PokemonStats { pokemon_id } => format!("stats of pokemon {}", pokemon_id),
      Self::AllPokemonStats => "all pokemon stats".to_string(),
      Self::PokemonTypes { pokemon_id } => format!("types of pokemon {}", pokemon_id),
      Self::AllPokemonTypes => "all pokemon types".to_string(),
    }
  }

  /// Keys whose data depends on a user's pokedex.
  pub fn belongs_to_user(&self, user: &str) -> bool {
    match self {
      Self::Pokedex { user_id } | Self::IsInPokedex { user_id, .. } => user_id == user,
      _ => false,
    }
  }
}

/// Selects cache entries for invalidation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryFilter {
  All,
  Key(QueryKey),
  /// Every pokedex-derived key of a user
  User(String),
}

impl QueryFilter {
  pub fn matches(&self, key: &QueryKey) -> bool {
    match self {
      Self::All => true,
      Self::Key(k) => k == key,
      Self::User(user) => key.belongs_to_user(user),
    }
  }
}

/// Whether a fetch may start while the device is offline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkMode {
  /// Offline starts are paused: cached data is served, the fetcher is not called
  Online,
  /// The first attempt always runs; retries only while online
  #[default]
  OfflineFirst,
  /// Connectivity is ignored
  Always,
}

/// Per-query settings.
#[derive(Debug, Clone, Copy)]
pub struct QueryOptions {
  /// How long fetched data counts as fresh
  pub stale_time: Duration,
  /// How long an unobserved entry is kept
  pub gc_time: Duration,
  pub retry: ImmediateRetryPolicy,
  pub network_mode: NetworkMode,
}

impl Default for QueryOptions {
  fn default() -> Self {
    Self {
      stale_time: Duration::from_secs(5 * 60),
      gc_time: Duration::from_secs(24 * 60 * 60),
      retry: ImmediateRetryPolicy::default(),
      network_mode: NetworkMode::OfflineFirst,
    }
  }
}

impl QueryOptions {
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  pub fn with_gc_time(mut self, gc_time: Duration) -> Self {
    self.gc_time = gc_time;
    self
  }

  pub fn with_retry(mut self, retry: ImmediateRetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn with_network_mode(mut self, network_mode: NetworkMode) -> Self {
    self.network_mode = network_mode;
    self
  }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueryError {
  #[error("{0}")]
  Fetch(String),

  #[error("Query was cancelled")]
  Cancelled,

  /// Offline in `NetworkMode::Online` with nothing cached
  #[error("Query is paused while offline")]
  Paused,

  #[error("Cached data has an unexpected shape: {0}")]
  Decode(String),
}

/// A successful cache entry in persistable form.
#[derive(Debug, Clone, PartialEq)]
pub struct DehydratedQuery {
  pub key: QueryKey,
  pub data: Value,
  pub updated_at: DateTime<Utc>,
}
