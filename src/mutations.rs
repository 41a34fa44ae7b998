//! Catch and release as optimistic mutations.

use async_trait::async_trait;
use serde_json::Value;

use crate::gateway::GatewayError;
use crate::models::PokedexEntry;
use crate::query::{OptimisticMutation, QueryKey};
use crate::queue::{CatchArgs, PendingMutation, ReleaseArgs};
use crate::repository::PokedexRepository;

fn decode_entries(current: Option<&Value>) -> Option<Vec<PokedexEntry>> {
  match current {
    None => Some(Vec::new()),
    // Leave data we cannot read alone rather than overwrite it
    Some(value) => serde_json::from_value(value.clone()).ok(),
  }
}

/// Adds a pokemon to a user's pokedex.
pub struct CatchPokemon {
  repository: PokedexRepository,
}

impl CatchPokemon {
  pub fn new(repository: PokedexRepository) -> Self {
    Self { repository }
  }
}

#[async_trait]
impl OptimisticMutation for CatchPokemon {
  type Variables = CatchArgs;
  type Output = PokedexEntry;

  fn name(&self) -> &'static str {
    "catch_pokemon"
  }

  fn affected_keys(&self, vars: &CatchArgs) -> Vec<QueryKey> {
    vec![
      QueryKey::Pokedex {
        user_id: vars.user_id.clone(),
      },
      QueryKey::IsInPokedex {
        user_id: vars.user_id.clone(),
        pokemon_id: vars.pokemon_id,
      },
    ]
  }

  fn apply_optimistic(&self, key: &QueryKey, vars: &CatchArgs, current: Option<&Value>) -> Option<Value> {
    match key {
      QueryKey::Pokedex { .. } => {
        let mut entries = decode_entries(current)?;
        if entries.iter().any(|entry| entry.pokemon_id == vars.pokemon_id) {
          return None;
        }
        // Newest first, like the backend ordering
        entries.insert(0, PokedexEntry::optimistic(vars));
        serde_json::to_value(entries).ok()
      }
      QueryKey::IsInPokedex { .. } => Some(Value::Bool(true)),
      _ => None,
    }
  }

  async fn execute(&self, vars: &CatchArgs) -> Result<PokedexEntry, GatewayError> {
    self.repository.catch_pokemon(vars).await
  }

  fn pending(&self, vars: &CatchArgs) -> PendingMutation {
    PendingMutation::Catch(vars.clone())
  }
}

/// Removes a pokemon from a user's pokedex.
pub struct ReleasePokemon {
  repository: PokedexRepository,
}

impl ReleasePokemon {
  pub fn new(repository: PokedexRepository) -> Self {
    Self { repository }
  }
}

#[async_trait]
impl OptimisticMutation for ReleasePokemon {
  type Variables = ReleaseArgs;
  type Output = ();

  fn name(&self) -> &'static str {
    "release_pokemon"
  }

  fn affected_keys(&self, vars: &ReleaseArgs) -> Vec<QueryKey> {
    vec![
      QueryKey::Pokedex {
        user_id: vars.user_id.clone(),
      },
      QueryKey::IsInPokedex {
        user_id: vars.user_id.clone(),
        pokemon_id: vars.pokemon_id,
      },
    ]
  }

  fn apply_optimistic(&self, key: &QueryKey, vars: &ReleaseArgs, current: Option<&Value>) -> Option<Value> {
    match key {
      QueryKey::Pokedex { .. } => {
        let mut entries = decode_entries(current)?;
        let before = entries.len();
        entries.retain(|entry| entry.pokemon_id != vars.pokemon_id);
        if entries.len() == before {
          return None;
        }
        serde_json::to_value(entries).ok()
      }
      QueryKey::IsInPokedex { .. } => Some(Value::Bool(false)),
      _ => None,
    }
  }

  async fn execute(&self, vars: &ReleaseArgs) -> Result<(), GatewayError> {
    self.repository.release_pokemon(vars).await
  }

  fn pending(&self, vars: &ReleaseArgs) -> PendingMutation {
    PendingMutation::Release(vars.clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::connectivity::Connectivity;
  use crate::gateway::memory::MemoryGateway;
  use crate::models::{Collection, EntryId};
  use crate::query::{MutationRunner, Query, QueryClient, QueryOptions};
  use crate::queue::{PendingQueue, CATCH_POKEMON, RELEASE_POKEMON};
  use crate::retry::ImmediateRetryPolicy;
  use crate::store::SqliteStore;
  use serde_json::json;
  use std::sync::Arc;
  use std::time::Duration;

  struct Harness {
    gateway: Arc<MemoryGateway>,
    repository: PokedexRepository,
    client: QueryClient,
    queue: PendingQueue,
    runner: MutationRunner,
  }

  fn harness() -> Harness {
    let gateway = Arc::new(MemoryGateway::new());
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let connectivity = Connectivity::new(true);
    let repository = PokedexRepository::new(gateway.clone(), store.clone(), connectivity.clone());
    let client = QueryClient::new(connectivity.clone());
    let queue = PendingQueue::new(store);
    let runner = MutationRunner::new(client.clone(), queue.clone(), connectivity)
      .with_retry(ImmediateRetryPolicy::none());
    Harness {
      gateway,
      repository,
      client,
      queue,
      runner,
    }
  }

  fn pokedex_key() -> QueryKey {
    QueryKey::Pokedex {
      user_id: "ash".to_string(),
    }
  }

  fn catch_args(pokemon_id: i64) -> CatchArgs {
    CatchArgs {
      user_id: "ash".to_string(),
      pokemon_id,
      nickname: None,
    }
  }

  fn pokedex_query(h: &Harness) -> Query<Vec<PokedexEntry>> {
    let repository = h.repository.clone();
    Query::new(&h.client, pokedex_key(), QueryOptions::default(), move || {
      let repository = repository.clone();
      async move {
        repository
          .fetch_pokedex("ash")
          .await
          .map(|fetched| fetched.data)
          .map_err(|e| e.to_string())
      }
    })
  }

  #[test]
  fn test_catch_does_not_duplicate_cached_entry() {
    let h = harness();
    let mutation = CatchPokemon::new(h.repository.clone());
    let cached = json!([{"id": 1, "user_id": "ash", "pokemon_id": 25}]);

    assert_eq!(mutation.apply_optimistic(&pokedex_key(), &catch_args(25), Some(&cached)), None);

    let added = mutation
      .apply_optimistic(&pokedex_key(), &catch_args(4), Some(&cached))
      .unwrap();
    let entries: Vec<PokedexEntry> = serde_json::from_value(added).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].pokemon_id, 4);
    assert!(entries[0].id.is_temporary());
  }

  #[tokio::test]
  async fn test_catch_is_confirmed_by_refetch() {
    let h = harness();
    let mut query = pokedex_query(&h);
    query.fetch();
    tokio::time::sleep(Duration::from_millis(20)).await;
    query.poll();
    assert_eq!(query.data(), Some(&vec![]));

    let entry = h
      .runner
      .run(&CatchPokemon::new(h.repository.clone()), &catch_args(25))
      .await
      .unwrap();
    assert_eq!(entry.pokemon_id, 25);

    // The invalidation refetches the observed pokedex in the background
    tokio::time::sleep(Duration::from_millis(20)).await;
    query.poll();
    let entries = query.data().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].pokemon_id, 25);
    assert!(matches!(entries[0].id, EntryId::Remote(_)));
    assert_eq!(h.client.get_query_data::<bool>(&QueryKey::IsInPokedex {
      user_id: "ash".to_string(),
      pokemon_id: 25,
    }), Some(true));
  }

  #[tokio::test]
  async fn test_failed_catch_rolls_back_and_queues() {
    let h = harness();
    h.gateway.seed(
      Collection::Pokedex,
      vec![json!({"id": 1, "user_id": "ash", "pokemon_id": 1})],
    );
    let repository = h.repository.clone();
    h.client
      .fetch_query(pokedex_key(), QueryOptions::default(), move || {
        let repository = repository.clone();
        async move {
          repository
            .fetch_pokedex("ash")
            .await
            .map(|fetched| fetched.data)
            .map_err(|e| e.to_string())
        }
      })
      .await
      .unwrap();
    let before = h.client.snapshot(&pokedex_key());

    h.gateway.fail_writes(true);
    let args = CatchArgs {
      nickname: Some("Sparky".to_string()),
      ..catch_args(25)
    };
    let err = h
      .runner
      .run(&CatchPokemon::new(h.repository.clone()), &args)
      .await
      .unwrap_err();

    assert!(err.is_queued());
    assert_eq!(h.client.snapshot(&pokedex_key()), before);

    let pending = h.queue.snapshot();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, CATCH_POKEMON);
    assert_eq!(
      pending[0].payload,
      json!({"userId": "ash", "pokemonId": 25, "nickname": "Sparky"})
    );
    assert_eq!(pending[0].retry_count, 0);
    assert_eq!(pending[0].mutation().unwrap(), PendingMutation::Catch(args));
  }

  #[tokio::test]
  async fn test_release_removes_entry_and_queues_on_failure() {
    let h = harness();
    let cached = vec![
      json!({"id": 1, "user_id": "ash", "pokemon_id": 25}),
      json!({"id": 2, "user_id": "ash", "pokemon_id": 4}),
    ];
    h.gateway.seed(Collection::Pokedex, cached.clone());
    h.client.set_query_data(&pokedex_key(), &cached).unwrap();

    let release = ReleasePokemon::new(h.repository.clone());
    let args = ReleaseArgs {
      user_id: "ash".to_string(),
      pokemon_id: 25,
    };

    let removed = release
      .apply_optimistic(&pokedex_key(), &args, h.client.snapshot(&pokedex_key()).as_ref())
      .unwrap();
    assert_eq!(removed.as_array().map(Vec::len), Some(1));

    h.gateway.fail_writes_for(25);
    assert!(h.runner.run(&release, &args).await.is_err());
    assert_eq!(h.client.get_query_data::<Vec<Value>>(&pokedex_key()), Some(cached));
    assert_eq!(h.queue.snapshot()[0].kind, RELEASE_POKEMON);

    h.gateway.clear_failures();
    h.runner.run(&release, &args).await.unwrap();
    assert_eq!(h.gateway.rows(Collection::Pokedex).len(), 1);
    assert_eq!(
      h.client.get_query_data::<bool>(&QueryKey::IsInPokedex {
        user_id: "ash".to_string(),
        pokemon_id: 25,
      }),
      Some(false)
    );
  }
}
