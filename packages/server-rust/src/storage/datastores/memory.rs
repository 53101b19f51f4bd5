//! In-process [`HomeStorage`] implementation.
//!
//! [`MemoryHomeStorage`] keeps the "durable" state in a [`DashMap`] and
//! counts the calls it serves. Useful for tests, benchmarks, and ephemeral
//! servers that do not need homes to survive a restart.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use hearth_core::{Home, OwnerId};
use parking_lot::Mutex;

use crate::storage::{StorageError, StorageResult};
use crate::traits::{HomeSnapshot, HomeStorage};

/// `HomeStorage` held entirely in memory.
///
/// Offers the per-key path when built with [`with_per_key`](MemoryHomeStorage::with_per_key).
/// Saves can be made to fail on demand with
/// [`fail_saves`](MemoryHomeStorage::fail_saves) to exercise retry logic.
#[derive(Debug, Default)]
pub struct MemoryHomeStorage {
    homes: DashMap<OwnerId, Home>,
    last_snapshot: Mutex<Option<HomeSnapshot>>,
    save_all_calls: AtomicU64,
    save_one_calls: AtomicU64,
    delete_one_calls: AtomicU64,
    per_key: bool,
    failing: AtomicBool,
    closed: AtomicBool,
}

impl MemoryHomeStorage {
    /// Creates an empty store that only offers `save_all`.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store that also offers `save_one` / `delete_one`.
    #[must_use]
    pub fn with_per_key() -> Self {
        Self {
            per_key: true,
            ..Self::default()
        }
    }

    /// Creates a store pre-populated with `homes`, as if loaded from disk.
    #[must_use]
    pub fn seeded(homes: HomeSnapshot) -> Self {
        let store = Self::default();
        for (owner, home) in homes {
            store.homes.insert(owner, home);
        }
        store
    }

    /// Makes subsequent writes fail (`true`) or succeed (`false`).
    pub fn fail_saves(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    #[must_use]
    pub fn save_all_calls(&self) -> u64 {
        self.save_all_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn save_one_calls(&self) -> u64 {
        self.save_one_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn delete_one_calls(&self) -> u64 {
        self.delete_one_calls.load(Ordering::SeqCst)
    }

    /// The argument of the most recent successful `save_all`.
    #[must_use]
    pub fn last_snapshot(&self) -> Option<HomeSnapshot> {
        self.last_snapshot.lock().clone()
    }

    /// Current "durable" state.
    #[must_use]
    pub fn persisted(&self) -> HomeSnapshot {
        self.homes
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_writable(&self, op: &str) -> StorageResult<()> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Injected(format!("{op} refused")));
        }
        Ok(())
    }
}

#[async_trait]
impl HomeStorage for MemoryHomeStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn load_all(&self) -> StorageResult<HomeSnapshot> {
        if self.is_closed() {
            return Err(StorageError::Closed);
        }
        Ok(self.persisted())
    }

    async fn save_all(&self, snapshot: &HomeSnapshot) -> StorageResult<()> {
        self.save_all_calls.fetch_add(1, Ordering::SeqCst);
        self.check_writable("save_all")?;
        self.homes.retain(|owner, _| snapshot.contains_key(owner));
        for (owner, home) in snapshot {
            self.homes.insert(*owner, home.clone());
        }
        *self.last_snapshot.lock() = Some(snapshot.clone());
        Ok(())
    }

    fn supports_per_key(&self) -> bool {
        self.per_key
    }

    async fn save_one(&self, owner: OwnerId, home: &Home) -> StorageResult<()> {
        if !self.per_key {
            return Err(StorageError::Unsupported("save_one"));
        }
        self.save_one_calls.fetch_add(1, Ordering::SeqCst);
        self.check_writable("save_one")?;
        self.homes.insert(owner, home.clone());
        Ok(())
    }

    async fn delete_one(&self, owner: OwnerId) -> StorageResult<()> {
        if !self.per_key {
            return Err(StorageError::Unsupported("delete_one"));
        }
        self.delete_one_calls.fetch_add(1, Ordering::SeqCst);
        self.check_writable("delete_one")?;
        self.homes.remove(&owner);
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
