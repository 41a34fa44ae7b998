//! Durable on-device storage for offline support.
//!
//! This module mirrors server collections into SQLite and holds the
//! pending-operation queue:
//! - Caches records as JSON keyed by their primary key
//! - Answers full-collection and field-equality reads
//! - Migrates the schema forward without dropping data
//! - Never surfaces storage errors to callers (logs and degrades instead)

mod record;
mod schema;
mod sqlite;

pub use record::{Record, Scope, SyncMetadata};
pub use schema::SCHEMA_VERSION;
pub use sqlite::SqliteStore;
