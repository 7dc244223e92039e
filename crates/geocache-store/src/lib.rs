//! geocache-store - Storage backends for the feature cache
//!
//! This crate provides two implementations of the cache backend traits:
//! a SQLite store whose on-disk layout is the `feature` / `feature_index`
//! schema, and an in-memory store for tests and short-lived processes.

mod memory;
mod schema;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

// Re-export schema for testing/migrations
pub use schema::SCHEMA;
