//! In-memory home mapping backed by [`DashMap`].
//!
//! Provides concurrent read/write access without external locking. The
//! service mutates it from the caller's context and snapshots it from flush
//! tasks on the runtime.

use dashmap::DashMap;
use hearth_core::{Home, OwnerId};

use crate::traits::HomeSnapshot;

/// Authoritative in-memory view of every owner's home.
///
/// All operations are lock-free for readers and use fine-grained sharding
/// internally for writers, so hot-path lookups never wait on a flush.
#[derive(Debug, Default)]
pub struct HomeEngine {
    entries: DashMap<OwnerId, Home>,
}

impl HomeEngine {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Insert or replace an owner's home. Returns the previous home if any.
    pub fn put(&self, owner: OwnerId, home: Home) -> Option<Home> {
        self.entries.insert(owner, home)
    }

    #[must_use]
    pub fn get(&self, owner: &OwnerId) -> Option<Home> {
        self.entries.get(owner).map(|h| h.clone())
    }

    pub fn remove(&self, owner: &OwnerId) -> Option<Home> {
        self.entries.remove(owner).map(|(_, h)| h)
    }

    #[must_use]
    pub fn contains_key(&self, owner: &OwnerId) -> bool {
        self.entries.contains_key(owner)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Point-in-time copy of all entries.
    ///
    /// Each shard is read under its own lock, so a concurrent writer to a
    /// different shard may or may not be included; a given owner is always
    /// either its old or its new value, never torn.
    #[must_use]
    pub fn snapshot(&self) -> HomeSnapshot {
        self.entries
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Replace the whole mapping with `homes`.
    ///
    /// Not atomic with respect to concurrent readers: a reader racing the
    /// swap may briefly see a partially filled map.
    pub fn replace_all(&self, homes: HomeSnapshot) {
        self.entries.clear();
        for (owner, home) in homes {
            self.entries.insert(owner, home);
        }
    }
}
