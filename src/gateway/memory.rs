//! In-memory gateway with scriptable failures, for tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{Filter, GatewayError, RemoteGateway};
use crate::models::Collection;

/// A recorded gateway call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
  List(Collection),
  Insert(Collection, Value),
  Delete(Collection, Filter),
}

#[derive(Default)]
struct State {
  tables: HashMap<Collection, Vec<Value>>,
  next_id: i64,
  unreachable: bool,
  fail_reads: bool,
  fail_writes: bool,
  fail_pokemon_ids: HashSet<i64>,
  calls: Vec<Call>,
}

/// Gateway backed by in-memory tables.
#[derive(Default)]
pub struct MemoryGateway {
  state: Mutex<State>,
}

impl MemoryGateway {
  pub fn new() -> Self {
    Self::default()
  }

  fn state(&self) -> std::sync::MutexGuard<'_, State> {
    match self.state.lock() {
      Ok(state) => state,
      Err(poisoned) => poisoned.into_inner(),
    }
  }

  pub fn seed(&self, collection: Collection, rows: Vec<Value>) {
    self.state().tables.insert(collection, rows);
  }

  pub fn rows(&self, collection: Collection) -> Vec<Value> {
    self
      .state()
      .tables
      .get(&collection)
      .cloned()
      .unwrap_or_default()
  }

  /// Make every call fail with a network error.
  pub fn set_reachable(&self, reachable: bool) {
    self.state().unreachable = !reachable;
  }

  pub fn fail_reads(&self, fail: bool) {
    self.state().fail_reads = fail;
  }

  pub fn fail_writes(&self, fail: bool) {
    self.state().fail_writes = fail;
  }

  /// Fail inserts and deletes that target `pokemon_id`.
  pub fn fail_writes_for(&self, pokemon_id: i64) {
    self.state().fail_pokemon_ids.insert(pokemon_id);
  }

  pub fn clear_failures(&self) {
    let mut state = self.state();
    state.unreachable = false;
    state.fail_reads = false;
    state.fail_writes = false;
    state.fail_pokemon_ids.clear();
  }

  pub fn calls(&self) -> Vec<Call> {
    self.state().calls.clone()
  }

  pub fn call_count(&self) -> usize {
    self.state().calls.len()
  }

  /// Pokemon ids of write calls, in the order they were attempted.
  pub fn write_order(&self) -> Vec<i64> {
    self
      .calls()
      .iter()
      .filter_map(|call| match call {
        Call::Insert(_, row) => row.get("pokemon_id").and_then(Value::as_i64),
        Call::Delete(_, filter) => filter.matches.iter().find_map(|(field, value)| {
          match (field.as_str(), value) {
            ("pokemon_id", crate::models::FieldValue::Integer(id)) => Some(*id),
            _ => None,
          }
        }),
        Call::List(_) => None,
      })
      .collect()
  }
}

fn write_target(row: &Value) -> Option<i64> {
  row.get("pokemon_id").and_then(Value::as_i64)
}

#[async_trait]
impl RemoteGateway for MemoryGateway {
  async fn list(&self, collection: Collection, filter: &Filter) -> Result<Vec<Value>, GatewayError> {
    let mut state = self.state();
    state.calls.push(Call::List(collection));

    if state.unreachable {
      return Err(GatewayError::Network("unreachable".to_string()));
    }
    if state.fail_reads {
      return Err(GatewayError::from_status(503, "unavailable"));
    }

    let mut rows: Vec<Value> = state
      .tables
      .get(&collection)
      .map(|rows| rows.iter().filter(|row| filter.matches(row)).cloned().collect())
      .unwrap_or_default();

    if let Some(order) = &filter.order {
      rows.sort_by(|a, b| {
        let (a, b) = (&a[order.field.as_str()], &b[order.field.as_str()]);
        let ordering = match (a.as_i64(), b.as_i64()) {
          (Some(a), Some(b)) => a.cmp(&b),
          _ => a.as_str().cmp(&b.as_str()),
        };
        if order.ascending {
          ordering
        } else {
          ordering.reverse()
        }
      });
    }

    // Like PostgREST, embedded rows only come back when a select asks for them
    if filter.select.is_none() {
      for row in rows.iter_mut().filter_map(Value::as_object_mut) {
        row.retain(|_, value| !value.is_object());
      }
    }

    Ok(rows)
  }

  async fn insert(&self, collection: Collection, record: Value) -> Result<Value, GatewayError> {
    let mut state = self.state();
    state.calls.push(Call::Insert(collection, record.clone()));

    if state.unreachable {
      return Err(GatewayError::Network("unreachable".to_string()));
    }
    let targeted = write_target(&record).is_some_and(|id| state.fail_pokemon_ids.contains(&id));
    if state.fail_writes || targeted {
      return Err(GatewayError::from_status(500, "insert failed"));
    }

    state.next_id += 1;
    let mut row = record;
    if let Some(fields) = row.as_object_mut() {
      fields
        .entry("id")
        .or_insert_with(|| json!(state.next_id));
    }
    state.tables.entry(collection).or_default().push(row.clone());
    Ok(row)
  }

  async fn delete(&self, collection: Collection, filter: &Filter) -> Result<(), GatewayError> {
    let mut state = self.state();
    state.calls.push(Call::Delete(collection, filter.clone()));

    if state.unreachable {
      return Err(GatewayError::Network("unreachable".to_string()));
    }
    let targeted = filter.matches.iter().any(|(field, value)| {
      field == "pokemon_id"
        && matches!(value, crate::models::FieldValue::Integer(id) if state.fail_pokemon_ids.contains(id))
    });
    if state.fail_writes || targeted {
      return Err(GatewayError::from_status(500, "delete failed"));
    }

    if let Some(rows) = state.tables.get_mut(&collection) {
      rows.retain(|row| !filter.matches(row));
    }
    Ok(())
  }

  async fn ping(&self) -> Result<(), GatewayError> {
    if self.state().unreachable {
      Err(GatewayError::Network("unreachable".to_string()))
    } else {
      Ok(())
    }
  }
}
