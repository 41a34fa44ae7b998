//! Offline-first sync and cache-consistency layer for a Pokedex catalog.
//!
//! Reads go through [`repository::PokedexRepository`], which mirrors backend
//! collections into a local SQLite store and falls back to it when offline.
//! Writes run as optimistic mutations on the [`query::QueryClient`]; failed
//! ones are rolled back and queued, and [`sync::SyncEngine`] replays the
//! queue when connectivity returns.

pub mod config;
pub mod connectivity;
pub mod context;
pub mod gateway;
pub mod models;
pub mod mutations;
pub mod query;
pub mod queue;
pub mod repository;
pub mod retry;
pub mod store;
pub mod sync;
