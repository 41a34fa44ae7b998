//! Domain types shared by the store, gateway, and query layers.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::queue::CatchArgs;
use crate::store::Record;

/// Server-side collections mirrored into the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
  Pokemons,
  Pokedex,
  PokemonStats,
  PokemonTypes,
}

impl Collection {
  /// Table name, identical on the backend and in the local store.
  pub fn table(self) -> &'static str {
    match self {
      Self::Pokemons => "pokemons",
      Self::Pokedex => "pokedex",
      Self::PokemonStats => "pokemon_stats",
      Self::PokemonTypes => "pokemon_types",
    }
  }

  pub fn all() -> [Collection; 4] {
    [
      Self::Pokemons,
      Self::Pokedex,
      Self::PokemonStats,
      Self::PokemonTypes,
    ]
  }
}

impl fmt::Display for Collection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(self.table())
  }
}

/// A scalar used for equality matches, both server-side filters and local lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
  Integer(i64),
  Text(String),
}

impl FieldValue {
  /// Compare against a JSON value the way an SQL equality match would.
  pub fn matches(&self, value: &serde_json::Value) -> bool {
    match self {
      Self::Integer(i) => value.as_i64() == Some(*i),
      Self::Text(s) => value.as_str() == Some(s.as_str()),
    }
  }
}

impl fmt::Display for FieldValue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Integer(i) => write!(f, "{}", i),
      Self::Text(s) => f.write_str(s),
    }
  }
}

impl From<i64> for FieldValue {
  fn from(value: i64) -> Self {
    Self::Integer(value)
  }
}

impl From<&str> for FieldValue {
  fn from(value: &str) -> Self {
    Self::Text(value.to_string())
  }
}

impl From<String> for FieldValue {
  fn from(value: String) -> Self {
    Self::Text(value)
  }
}

impl From<&String> for FieldValue {
  fn from(value: &String) -> Self {
    Self::Text(value.clone())
  }
}

// ============================================================================
// Catalog
// ============================================================================

/// A catalog entry. Authored by the backend only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pokemon {
  pub id: i64,
  pub name: String,
  /// Primary type as stored on the catalog row
  #[serde(rename = "type", default)]
  pub primary_type: Option<String>,
  #[serde(default)]
  pub sprite_url: Option<String>,
  #[serde(default)]
  pub flavor_text: Option<String>,
  #[serde(default)]
  pub created_at: Option<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub stats: Vec<PokemonStat>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub types: Vec<PokemonType>,
}

impl Record for Pokemon {
  fn cache_key(&self) -> String {
    self.id.to_string()
  }

  fn collection() -> Collection {
    Collection::Pokemons
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PokemonStat {
  pub pokemon_id: i64,
  pub stat_name: String,
  pub base_stat: i64,
}

impl Record for PokemonStat {
  fn cache_key(&self) -> String {
    format!("{}:{}", self.pokemon_id, self.stat_name)
  }

  fn collection() -> Collection {
    Collection::PokemonStats
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PokemonType {
  pub pokemon_id: i64,
  pub type_name: String,
  pub slot: i64,
}

impl Record for PokemonType {
  fn cache_key(&self) -> String {
    format!("{}:{}", self.pokemon_id, self.slot)
  }

  fn collection() -> Collection {
    Collection::PokemonTypes
  }
}

/// Catalog fields embedded in joined pokedex reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PokemonSummary {
  pub id: i64,
  pub name: String,
  #[serde(rename = "type", default)]
  pub primary_type: Option<String>,
  #[serde(default)]
  pub sprite_url: Option<String>,
}

// ============================================================================
// Collection entries
// ============================================================================

/// Identifier of a pokedex entry.
///
/// Entries created optimistically carry a temporary id until the backend
/// assigns the permanent one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntryId {
  Remote(i64),
  Temporary(Uuid),
}

impl EntryId {
  pub fn temporary() -> Self {
    Self::Temporary(Uuid::new_v4())
  }

  pub fn is_temporary(&self) -> bool {
    matches!(self, Self::Temporary(_))
  }
}

impl fmt::Display for EntryId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Remote(id) => write!(f, "{}", id),
      Self::Temporary(id) => write!(f, "tmp-{}", id),
    }
  }
}

/// Ownership of a catalog entry by a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PokedexEntry {
  pub id: EntryId,
  pub user_id: String,
  pub pokemon_id: i64,
  #[serde(default)]
  pub nickname: Option<String>,
  #[serde(default)]
  pub caught_at: Option<DateTime<Utc>>,
  /// Joined catalog row, present on reads that embed it
  #[serde(rename = "pokemons", default, skip_serializing_if = "Option::is_none")]
  pub pokemon: Option<PokemonSummary>,
}

impl PokedexEntry {
  /// Placeholder shown in the cache while a catch is unconfirmed.
  pub fn optimistic(args: &CatchArgs) -> Self {
    Self {
      id: EntryId::temporary(),
      user_id: args.user_id.clone(),
      pokemon_id: args.pokemon_id,
      nickname: args.nickname.clone(),
      caught_at: Some(Utc::now()),
      pokemon: None,
    }
  }
}

impl Record for PokedexEntry {
  fn cache_key(&self) -> String {
    self.id.to_string()
  }

  fn collection() -> Collection {
    Collection::Pokedex
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_entry_id_deserializes_remote_and_temporary() {
    let remote: EntryId = serde_json::from_value(json!(42)).unwrap();
    assert_eq!(remote, EntryId::Remote(42));

    let uuid = Uuid::new_v4();
    let temp: EntryId = serde_json::from_value(json!(uuid.to_string())).unwrap();
    assert_eq!(temp, EntryId::Temporary(uuid));
    assert!(temp.is_temporary());
  }

  #[test]
  fn test_pokedex_entry_parses_joined_row() {
    let row = json!({
      "id": 7,
      "user_id": "user-1",
      "pokemon_id": 25,
      "nickname": null,
      "caught_at": "2024-05-01T10:00:00+00:00",
      "pokemons": { "id": 25, "name": "pikachu", "type": "electric", "sprite_url": null }
    });

    let entry: PokedexEntry = serde_json::from_value(row).unwrap();
    assert_eq!(entry.id, EntryId::Remote(7));
    assert_eq!(entry.pokemon.as_ref().unwrap().name, "pikachu");
    assert_eq!(entry.cache_key(), "7");
  }

  #[test]
  fn test_field_value_matches_json() {
    assert!(FieldValue::from(3).matches(&json!(3)));
    assert!(!FieldValue::from(3).matches(&json!("3")));
    assert!(FieldValue::from("ash").matches(&json!("ash")));
  }
}
