//! SQLite implementation of the local store.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::types::{ToSql, ToSqlOutput};
use rusqlite::{params, params_from_iter, Connection, Transaction};
use serde_json::Value;
use tracing::{debug, error, warn};

use super::record::{Record, Scope, SyncMetadata};
use super::schema::{migrate, MIGRATIONS, SCHEMA_VERSION};
use crate::config;
use crate::models::{Collection, FieldValue};
use crate::query::{DehydratedQuery, QueryKey};
use crate::queue::QueuedOperation;

/// SQLite-backed store for cached collections and the pending queue.
///
/// Every public operation swallows storage errors: failures are logged and
/// reported as `false` or an empty result so callers can keep degrading
/// gracefully.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open (or create) the store at an explicit path.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create store directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open local store at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a throwaway store that lives only as long as the process.
  pub fn open_in_memory() -> Result<Self> {
    let conn =
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory store: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(mut conn: Connection) -> Result<Self> {
    migrate(&mut conn, MIGRATIONS)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    Ok(config::data_dir()?.join("pokedex.db"))
  }

  /// Current schema version as recorded in the database.
  pub fn schema_version(&self) -> u32 {
    self
      .with_conn("schema_version", |conn| {
        conn
          .query_row("PRAGMA user_version", [], |row| row.get(0))
          .map_err(|e| eyre!("Failed to read schema version: {}", e))
      })
      .unwrap_or(0)
  }

  /// Run `op` against the connection, logging and discarding any error.
  fn with_conn<R>(&self, op: &str, f: impl FnOnce(&mut Connection) -> Result<R>) -> Option<R> {
    // A poisoned lock only means another caller panicked mid-operation;
    // SQLite keeps the connection itself consistent.
    let mut conn = match self.conn.lock() {
      Ok(conn) => conn,
      Err(poisoned) => poisoned.into_inner(),
    };

    match f(&mut conn) {
      Ok(value) => Some(value),
      Err(e) => {
        error!(op, error = %e, "local store operation failed");
        None
      }
    }
  }

  // ==========================================================================
  // Cached collections
  // ==========================================================================

  /// Batch upsert records by primary key and stamp the collection's sync metadata.
  pub fn put<T: Record>(&self, records: &[T]) -> bool {
    let collection = T::collection();
    self
      .with_conn("put", |conn| {
        let tx = conn
          .transaction()
          .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
        upsert_records(&tx, collection, records)?;
        touch_sync_metadata(&tx, collection)?;
        tx.commit()
          .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
        Ok(())
      })
      .is_some()
  }

  /// Upsert records, then delete rows inside `scope` that are absent from `records`.
  ///
  /// Afterwards the scoped slice of the collection equals `records`.
  pub fn replace_where<T: Record>(&self, scope: &Scope, records: &[T]) -> bool {
    let collection = T::collection();
    self
      .with_conn("replace_where", |conn| {
        let tx = conn
          .transaction()
          .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

        upsert_records(&tx, collection, records)?;

        let keep: HashSet<String> = records.iter().map(Record::cache_key).collect();
        let stale: Vec<String> = select_keys(&tx, collection, scope)?
          .into_iter()
          .filter(|key| !keep.contains(key))
          .collect();

        let sql = format!("DELETE FROM {} WHERE key = ?", collection.table());
        for key in &stale {
          tx.execute(&sql, params![key])
            .map_err(|e| eyre!("Failed to prune {} row {}: {}", collection, key, e))?;
        }
        if !stale.is_empty() {
          debug!(collection = %collection, pruned = stale.len(), "pruned rows missing from snapshot");
        }

        touch_sync_metadata(&tx, collection)?;
        tx.commit()
          .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
        Ok(())
      })
      .is_some()
  }

  /// All records of a collection in insertion order.
  pub fn get_all<T: Record>(&self) -> Vec<T> {
    self.get_matching(&Scope::all())
  }

  /// Records whose JSON `field` equals `value`.
  pub fn get_where<T: Record>(&self, field: &str, value: impl Into<FieldValue>) -> Vec<T> {
    self.get_matching(&Scope::field(field, value))
  }

  /// Records matching every equality in `scope`.
  pub fn get_matching<T: Record>(&self, scope: &Scope) -> Vec<T> {
    let collection = T::collection();
    self
      .with_conn("get", |conn| {
        let (clause, values) = where_clause(scope)?;
        let sql = format!(
          "SELECT data FROM {}{}{}",
          collection.table(),
          clause,
          order_clause(scope)?
        );
        let mut stmt = conn
          .prepare(&sql)
          .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

        let rows: Vec<String> = stmt
          .query_map(params_from_iter(values.iter()), |row| row.get(0))
          .map_err(|e| eyre!("Failed to query {}: {}", collection, e))?
          .filter_map(|r| r.ok())
          .collect();

        Ok(
          rows
            .into_iter()
            .filter_map(|data| match serde_json::from_str(&data) {
              Ok(record) => Some(record),
              Err(e) => {
                warn!(collection = %collection, error = %e, "skipping unreadable cached row");
                None
              }
            })
            .collect(),
        )
      })
      .unwrap_or_default()
  }

  /// Last successful bulk save for a collection.
  pub fn sync_metadata(&self, collection: Collection) -> Option<SyncMetadata> {
    self
      .with_conn("sync_metadata", |conn| {
        let mut stmt = conn
          .prepare("SELECT key, last_synced_at, version FROM sync_metadata WHERE key = ?")
          .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

        let row: Option<(String, String, u32)> = stmt
          .query_row(params![collection.table()], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
          })
          .ok();

        match row {
          Some((key, synced, version)) => Ok(Some(SyncMetadata {
            key,
            last_synced_at: parse_datetime(&synced)?,
            version,
          })),
          None => Ok(None),
        }
      })
      .flatten()
  }

  // ==========================================================================
  // Pending operations
  // ==========================================================================

  /// Append an operation with `retry_count = 0` and the current timestamp.
  pub fn enqueue_operation(&self, kind: &str, payload: &Value) -> bool {
    self
      .with_conn("enqueue_operation", |conn| {
        let payload =
          serde_json::to_string(payload).map_err(|e| eyre!("Failed to serialize payload: {}", e))?;
        conn
          .execute(
            "INSERT INTO pending_operations (kind, payload, enqueued_at, retry_count)
             VALUES (?, ?, ?, 0)",
            params![kind, payload, Utc::now().to_rfc3339()],
          )
          .map_err(|e| eyre!("Failed to enqueue operation: {}", e))?;
        Ok(())
      })
      .is_some()
  }

  /// Snapshot of the queue in FIFO order.
  pub fn pending_operations(&self) -> Vec<QueuedOperation> {
    self
      .with_conn("pending_operations", |conn| {
        let mut stmt = conn
          .prepare(
            "SELECT id, kind, payload, enqueued_at, retry_count
             FROM pending_operations ORDER BY id",
          )
          .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

        let rows: Vec<(i64, String, String, String, u32)> = stmt
          .query_map([], |row| {
            Ok((
              row.get(0)?,
              row.get(1)?,
              row.get(2)?,
              row.get(3)?,
              row.get(4)?,
            ))
          })
          .map_err(|e| eyre!("Failed to query pending operations: {}", e))?
          .filter_map(|r| r.ok())
          .collect();

        Ok(
          rows
            .into_iter()
            .map(|(id, kind, payload, enqueued_at, retry_count)| QueuedOperation {
              id,
              kind,
              // Keep undecodable payloads so the drain can count them as failures
              payload: serde_json::from_str(&payload).unwrap_or(Value::String(payload)),
              enqueued_at: parse_datetime(&enqueued_at).unwrap_or_else(|e| {
                warn!(id, error = %e, "pending operation has an unreadable timestamp");
                Utc::now()
              }),
              retry_count,
            })
            .collect(),
        )
      })
      .unwrap_or_default()
  }

  /// Persist a new retry count for a queued operation.
  pub fn update_retry_count(&self, id: i64, retry_count: u32) -> bool {
    self
      .with_conn("update_retry_count", |conn| {
        conn
          .execute(
            "UPDATE pending_operations SET retry_count = ? WHERE id = ?",
            params![retry_count, id],
          )
          .map_err(|e| eyre!("Failed to update operation {}: {}", id, e))?;
        Ok(())
      })
      .is_some()
  }

  /// Remove a queued operation. Removing a missing id is not an error.
  pub fn dequeue_operation(&self, id: i64) -> bool {
    self
      .with_conn("dequeue_operation", |conn| {
        conn
          .execute("DELETE FROM pending_operations WHERE id = ?", params![id])
          .map_err(|e| eyre!("Failed to remove operation {}: {}", id, e))?;
        Ok(())
      })
      .is_some()
  }

  pub fn clear_pending_operations(&self) -> bool {
    self
      .with_conn("clear_pending_operations", |conn| {
        conn
          .execute("DELETE FROM pending_operations", [])
          .map_err(|e| eyre!("Failed to clear pending operations: {}", e))?;
        Ok(())
      })
      .is_some()
  }

  /// Delete every row of every table. The schema is kept.
  pub fn clear_all(&self) -> bool {
    self
      .with_conn("clear_all", |conn| {
        let tx = conn
          .transaction()
          .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
        for collection in Collection::all() {
          tx.execute(&format!("DELETE FROM {}", collection.table()), [])
            .map_err(|e| eyre!("Failed to clear {}: {}", collection, e))?;
        }
        for table in ["pending_operations", "sync_metadata", "query_snapshots"] {
          tx.execute(&format!("DELETE FROM {}", table), [])
            .map_err(|e| eyre!("Failed to clear {}: {}", table, e))?;
        }
        tx.commit()
          .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
        Ok(())
      })
      .is_some()
  }

  // ==========================================================================
  // Persisted query cache
  // ==========================================================================

  /// Replace the persisted query cache with `snapshots`.
  pub fn save_query_snapshots(&self, snapshots: &[DehydratedQuery]) -> bool {
    self
      .with_conn("save_query_snapshots", |conn| {
        let tx = conn
          .transaction()
          .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
        tx.execute("DELETE FROM query_snapshots", [])
          .map_err(|e| eyre!("Failed to clear query snapshots: {}", e))?;
        for snapshot in snapshots {
          let key = serde_json::to_string(&snapshot.key)
            .map_err(|e| eyre!("Failed to serialize query key: {}", e))?;
          let data = serde_json::to_string(&snapshot.data)
            .map_err(|e| eyre!("Failed to serialize query data: {}", e))?;
          tx.execute(
            "INSERT OR REPLACE INTO query_snapshots (query_key, data, updated_at) VALUES (?, ?, ?)",
            params![key, data, snapshot.updated_at.to_rfc3339()],
          )
          .map_err(|e| eyre!("Failed to store query snapshot: {}", e))?;
        }
        tx.commit()
          .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
        Ok(())
      })
      .is_some()
  }

  /// Persisted query snapshots no older than `max_age`.
  pub fn load_query_snapshots(&self, max_age: Duration) -> Vec<DehydratedQuery> {
    let cutoff = Utc::now() - max_age;
    self
      .with_conn("load_query_snapshots", |conn| {
        let mut stmt = conn
          .prepare("SELECT query_key, data, updated_at FROM query_snapshots")
          .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

        let rows: Vec<(String, String, String)> = stmt
          .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
          .map_err(|e| eyre!("Failed to query snapshots: {}", e))?
          .filter_map(|r| r.ok())
          .collect();

        Ok(
          rows
            .into_iter()
            .filter_map(|(key, data, updated_at)| {
              let key: QueryKey = serde_json::from_str(&key).ok()?;
              let data: Value = serde_json::from_str(&data).ok()?;
              let updated_at = parse_datetime(&updated_at).ok()?;
              (updated_at >= cutoff).then_some(DehydratedQuery {
                key,
                data,
                updated_at,
              })
            })
            .collect(),
        )
      })
      .unwrap_or_default()
  }
}

impl ToSql for FieldValue {
  fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
    match self {
      FieldValue::Integer(v) => v.to_sql(),
      FieldValue::Text(v) => v.to_sql(),
    }
  }
}

fn upsert_records<T: Record>(tx: &Transaction<'_>, collection: Collection, records: &[T]) -> Result<()> {
  let sql = format!(
    "INSERT INTO {} (key, data, cached_at) VALUES (?, ?, ?)
     ON CONFLICT(key) DO UPDATE SET data = excluded.data, cached_at = excluded.cached_at",
    collection.table()
  );
  let mut stmt = tx
    .prepare(&sql)
    .map_err(|e| eyre!("Failed to prepare upsert: {}", e))?;
  let now = Utc::now().to_rfc3339();

  for record in records {
    let data =
      serde_json::to_string(record).map_err(|e| eyre!("Failed to serialize record: {}", e))?;
    stmt
      .execute(params![record.cache_key(), data, now])
      .map_err(|e| eyre!("Failed to store {} record: {}", collection, e))?;
  }

  Ok(())
}

fn select_keys(tx: &Transaction<'_>, collection: Collection, scope: &Scope) -> Result<Vec<String>> {
  let (clause, values) = where_clause(scope)?;
  let sql = format!("SELECT key FROM {}{}", collection.table(), clause);
  let mut stmt = tx
    .prepare(&sql)
    .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

  let keys = stmt
    .query_map(params_from_iter(values.iter()), |row| row.get(0))
    .map_err(|e| eyre!("Failed to query {} keys: {}", collection, e))?
    .filter_map(|r| r.ok())
    .collect();

  Ok(keys)
}

fn touch_sync_metadata(tx: &Transaction<'_>, collection: Collection) -> Result<()> {
  tx.execute(
    "INSERT OR REPLACE INTO sync_metadata (key, last_synced_at, version) VALUES (?, ?, ?)",
    params![collection.table(), Utc::now().to_rfc3339(), SCHEMA_VERSION],
  )
  .map_err(|e| eyre!("Failed to update sync metadata: {}", e))?;
  Ok(())
}

/// Build a `WHERE` clause over JSON fields, returning the values to bind in order.
fn where_clause(scope: &Scope) -> Result<(String, Vec<&dyn ToSql>)> {
  if scope.is_all() {
    return Ok((String::new(), Vec::new()));
  }

  let mut conditions = Vec::with_capacity(scope.matches.len());
  let mut values: Vec<&dyn ToSql> = Vec::with_capacity(scope.matches.len());

  for (field, value) in &scope.matches {
    conditions.push(format!("json_extract(data, '{}') = ?", json_path(field)?));
    values.push(value);
  }

  Ok((format!(" WHERE {}", conditions.join(" AND ")), values))
}

/// ORDER BY for a scope; rowid breaks ties so equal keys keep insertion order.
fn order_clause(scope: &Scope) -> Result<String> {
  match &scope.order {
    Some((field, ascending)) => Ok(format!(
      " ORDER BY json_extract(data, '{}') {}, rowid",
      json_path(field)?,
      if *ascending { "ASC" } else { "DESC" }
    )),
    None => Ok(" ORDER BY rowid".to_string()),
  }
}

/// JSON path for a field name. Names are limited to `[a-z_]+` so the path
/// can be inlined as a literal.
fn json_path(field: &str) -> Result<String> {
  if field.is_empty() || !field.chars().all(|c| c.is_ascii_lowercase() || c == '_') {
    return Err(eyre!("Invalid field name '{}'", field));
  }
  Ok(format!("$.{}", field))
}

/// Parse an RFC 3339 timestamp written by this store.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
