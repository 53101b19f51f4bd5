//! Factory for opening the configured [`HomeStorage`] backend.
//!
//! [`HomeStorageFactory`] is the one place that maps a [`BackendConfig`] to
//! a concrete backend. Everything downstream holds `Arc<dyn HomeStorage>`.

use std::sync::Arc;

use hearth_core::NameResolver;

use crate::storage::config::BackendConfig;
use crate::storage::datastores::{MemoryHomeStorage, YamlHomeStorage};
#[cfg(feature = "sqlite")]
use crate::storage::datastores::SqliteHomeStorage;
use crate::storage::StorageResult;
use crate::traits::HomeStorage;

/// Opens backends that share one legacy-name resolver.
pub struct HomeStorageFactory {
    names: Arc<dyn NameResolver>,
}

impl HomeStorageFactory {
    #[must_use]
    pub fn new(names: Arc<dyn NameResolver>) -> Self {
        Self { names }
    }

    /// Opens the backend described by `config`.
    ///
    /// # Errors
    ///
    /// Returns the backend's open error, or [`StorageError::Unsupported`]
    /// when `SQLite` is requested but the `sqlite` feature is disabled.
    ///
    /// [`StorageError::Unsupported`]: crate::storage::StorageError::Unsupported
    pub async fn open(&self, config: &BackendConfig) -> StorageResult<Arc<dyn HomeStorage>> {
        let storage: Arc<dyn HomeStorage> = match config {
            BackendConfig::Yaml(yaml) => Arc::new(YamlHomeStorage::open(
                &yaml.data_dir,
                &yaml.file_name,
                Arc::clone(&self.names),
            )?),
            #[cfg(feature = "sqlite")]
            BackendConfig::Sqlite(sqlite) => Arc::new(
                SqliteHomeStorage::open(
                    &sqlite.data_dir,
                    &sqlite.file_name,
                    &sqlite.pool,
                    Arc::clone(&self.names),
                )
                .await?,
            ),
            #[cfg(not(feature = "sqlite"))]
            BackendConfig::Sqlite(_) => {
                return Err(crate::storage::StorageError::Unsupported(
                    "sqlite backend (feature disabled)",
                ))
            }
            BackendConfig::Memory => Arc::new(MemoryHomeStorage::new()),
        };
        tracing::info!(backend = storage.name(), "Opened home storage");
        Ok(storage)
    }
}

/// Opens the backend described by `config` with a one-off factory.
///
/// # Errors
///
/// See [`HomeStorageFactory::open`].
pub async fn open_storage(
    config: &BackendConfig,
    names: Arc<dyn NameResolver>,
) -> StorageResult<Arc<dyn HomeStorage>> {
    HomeStorageFactory::new(names).open(config).await
}
