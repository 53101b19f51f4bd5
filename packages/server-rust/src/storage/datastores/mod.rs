//! `HomeStorage` implementations.
//!
//! Provides concrete backends for the [`HomeStorage`](crate::traits::HomeStorage)
//! trait: a YAML file, an `SQLite` database, and an in-memory store.

mod memory;
#[cfg(feature = "sqlite")]
mod sqlite;
mod yaml;

pub use memory::MemoryHomeStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteHomeStorage;
pub use yaml::YamlHomeStorage;
