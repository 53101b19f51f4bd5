use std::collections::HashMap;

use async_trait::async_trait;
use hearth_core::{Home, OwnerId};

use crate::storage::{StorageError, StorageResult};

/// Full mapping of owners to their home, as loaded from or written to storage.
pub type HomeSnapshot = HashMap<OwnerId, Home>;

/// Pluggable persistence backend for the home cache.
/// Implementations: YAML file, `SQLite`, memory (tests and ephemeral servers).
///
/// Used as `Arc<dyn HomeStorage>`; the service never inspects which backend
/// it holds beyond [`supports_per_key`](HomeStorage::supports_per_key).
#[async_trait]
pub trait HomeStorage: Send + Sync {
    /// Short backend label for log fields.
    fn name(&self) -> &'static str;

    /// Load every persisted record.
    ///
    /// Unparseable entries are skipped with a warning. Keys that are not
    /// UUIDs go through the backend's `NameResolver` and come back keyed by
    /// the resolved owner.
    async fn load_all(&self) -> StorageResult<HomeSnapshot>;

    /// Replace the persisted state with `snapshot`.
    ///
    /// Either the whole snapshot becomes durable or the previous state is
    /// left intact. Owners missing from `snapshot` are deleted.
    async fn save_all(&self, snapshot: &HomeSnapshot) -> StorageResult<()>;

    /// Whether [`save_one`](HomeStorage::save_one) and
    /// [`delete_one`](HomeStorage::delete_one) are implemented.
    fn supports_per_key(&self) -> bool {
        false
    }

    /// Upsert a single record.
    async fn save_one(&self, _owner: OwnerId, _home: &Home) -> StorageResult<()> {
        Err(StorageError::Unsupported("save_one"))
    }

    /// Delete a single record. Deleting a missing owner is not an error.
    async fn delete_one(&self, _owner: OwnerId) -> StorageResult<()> {
        Err(StorageError::Unsupported("delete_one"))
    }

    /// Release resources. Idempotent; every other operation issued after
    /// this returns [`StorageError::Closed`].
    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}
