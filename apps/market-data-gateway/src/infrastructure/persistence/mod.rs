//! Persistent cache tier adapters.
//!
//! - `InMemoryCacheStore`: process-local, for tests and the `memory` backend
//! - `SqliteCacheStore`: `sqlx` SQLite, survives restarts
//! - `run_persist_writer`: background task draining the cache's write queue

mod in_memory;
mod sqlite;
mod writer;

pub use in_memory::InMemoryCacheStore;
pub use sqlite::SqliteCacheStore;
pub use writer::run_persist_writer;
