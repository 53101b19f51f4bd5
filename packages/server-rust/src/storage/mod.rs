//! Storage layer for the home cache.
//!
//! Two layers:
//!
//! - **In-memory** ([`HomeEngine`]): the authoritative `DashMap` every read
//!   is served from
//! - **Durable** ([`HomeStorage`](crate::traits::HomeStorage)): a pluggable
//!   backend from [`datastores`], opened through [`HomeStorageFactory`]
//!
//! Additionally defines [`StorageError`] and the backend configuration types.

pub mod config;
pub mod datastores;
pub mod engine;
pub mod error;
pub mod factory;
mod keys;

pub use config::{
    BackendConfig, PoolConfig, SqliteConfig, YamlConfig, DEFAULT_SQLITE_FILE, DEFAULT_YAML_FILE,
};
pub use engine::HomeEngine;
pub use error::{StorageError, StorageResult};
pub use factory::{open_storage, HomeStorageFactory};
