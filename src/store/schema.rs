//! Versioned schema for the local store.
//!
//! Migrations are applied in order and tracked with `PRAGMA user_version`.
//! A migration may only add tables or indexes; existing rows are never touched.

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;

/// Version 1: cached collections, pending queue, sync bookkeeping.
const V1: &str = r#"
CREATE TABLE IF NOT EXISTS pokemons (
    key TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    cached_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pokedex (
    key TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    cached_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pending_operations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    enqueued_at TEXT NOT NULL,
    retry_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS sync_metadata (
    key TEXT PRIMARY KEY,
    last_synced_at TEXT NOT NULL,
    version INTEGER NOT NULL
);
"#;

/// Version 2: per-pokemon stats and types.
const V2: &str = r#"
CREATE TABLE IF NOT EXISTS pokemon_stats (
    key TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    cached_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pokemon_types (
    key TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    cached_at TEXT NOT NULL
);
"#;

/// Version 3: persisted query cache.
const V3: &str = r#"
CREATE TABLE IF NOT EXISTS query_snapshots (
    query_key TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

pub(crate) const MIGRATIONS: &[&str] = &[V1, V2, V3];

/// Schema version after all migrations have run.
pub const SCHEMA_VERSION: u32 = MIGRATIONS.len() as u32;

/// Bring the database up to the latest version of `migrations`.
///
/// Returns the resulting schema version.
pub(crate) fn migrate(conn: &mut Connection, migrations: &[&str]) -> Result<u32> {
  let current: u32 = conn
    .query_row("PRAGMA user_version", [], |row| row.get(0))
    .map_err(|e| eyre!("Failed to read schema version: {}", e))?;

  let target = migrations.len() as u32;
  if current >= target {
    return Ok(current);
  }

  let tx = conn
    .transaction()
    .map_err(|e| eyre!("Failed to begin migration: {}", e))?;

  for (index, sql) in migrations.iter().enumerate().skip(current as usize) {
    tx.execute_batch(sql)
      .map_err(|e| eyre!("Failed to apply migration {}: {}", index + 1, e))?;
  }

  // PRAGMA does not accept bound parameters
  tx.execute_batch(&format!("PRAGMA user_version = {}", target))
    .map_err(|e| eyre!("Failed to record schema version: {}", e))?;

  tx.commit()
    .map_err(|e| eyre!("Failed to commit migration: {}", e))?;

  tracing::info!(from = current, to = target, "migrated local store schema");
  Ok(target)
}
