//! Key resolution shared by the persistent backends.
//!
//! Persisted keys are normally hyphenated UUIDs. Older stores keyed homes
//! by player name; those keys are resolved through a [`NameResolver`] and
//! re-keyed in memory, so the next flush rewrites them under the UUID.

use std::collections::HashSet;

use hearth_core::{Home, NameResolver, OwnerId};

use crate::traits::HomeSnapshot;

/// Accumulates decoded records into a [`HomeSnapshot`] while applying the
/// migration and duplicate rules.
///
/// A record stored under a UUID always beats a migrated legacy record for
/// the same owner, regardless of the order they are read in.
pub(crate) struct SnapshotBuilder<'a> {
    backend: &'static str,
    names: &'a dyn NameResolver,
    homes: HomeSnapshot,
    canonical: HashSet<OwnerId>,
    migrated: usize,
    skipped: usize,
}

impl<'a> SnapshotBuilder<'a> {
    pub(crate) fn new(backend: &'static str, names: &'a dyn NameResolver) -> Self {
        Self {
            backend,
            names,
            homes: HomeSnapshot::new(),
            canonical: HashSet::new(),
            migrated: 0,
            skipped: 0,
        }
    }

    /// Records a decoded home under its raw persisted key.
    pub(crate) fn insert(&mut self, raw_key: &str, home: Home) {
        if let Ok(owner) = raw_key.parse::<OwnerId>() {
            if !self.canonical.insert(owner) {
                tracing::warn!(
                    backend = self.backend,
                    key = raw_key,
                    "Duplicate owner key; keeping first record"
                );
                self.skipped += 1;
                return;
            }
            if self.homes.insert(owner, home).is_some() {
                tracing::warn!(
                    backend = self.backend,
                    owner = %owner,
                    "Legacy record shadowed by UUID-keyed record"
                );
                self.migrated -= 1;
                self.skipped += 1;
            }
            return;
        }

        let Some(owner) = self.names.resolve(raw_key) else {
            self.skip(raw_key, "key is neither a UUID nor a resolvable name");
            return;
        };

        if self.homes.contains_key(&owner) {
            tracing::warn!(
                backend = self.backend,
                key = raw_key,
                owner = %owner,
                "Ambiguous legacy record; owner already has a home"
            );
            self.skipped += 1;
            return;
        }

        tracing::info!(
            backend = self.backend,
            from = raw_key,
            to = %owner,
            "Migrating legacy home"
        );
        self.homes.insert(owner, home);
        self.migrated += 1;
    }

    /// Drops a record that could not be decoded.
    pub(crate) fn skip(&mut self, raw_key: &str, reason: &str) {
        tracing::warn!(
            backend = self.backend,
            key = raw_key,
            reason,
            "Skipping unreadable home record"
        );
        self.skipped += 1;
    }

    pub(crate) fn finish(self) -> HomeSnapshot {
        tracing::info!(
            backend = self.backend,
            loaded = self.homes.len(),
            migrated = self.migrated,
            skipped = self.skipped,
            "Loaded homes"
        );
        self.homes
    }
}
