//! Seams between the home store and the embedding game runtime.
//!
//! The store never sees concrete player or world objects. Hosts implement
//! these traits over their own types and hand them to the service.

use std::collections::HashSet;

use md5::{Digest, Md5};
use uuid::Builder;

use crate::types::{Location, OwnerId};

/// An actor that can own a home (a player in the host runtime).
pub trait HomeOwner {
    /// Identity that stays stable across renames and sessions.
    fn stable_identifier(&self) -> OwnerId;

    /// Where the actor currently stands, or `None` if it is not placed in
    /// any world (e.g. mid-login).
    fn current_location(&self) -> Option<Location>;
}

/// Answers whether a world identifier currently resolves in the host.
///
/// Consulted on every write and every read; implementations must be cheap.
pub trait WorldResolver: Send + Sync {
    fn world_exists(&self, world: &str) -> bool;
}

/// Resolver that accepts every world. Used by tooling that has no host.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyWorld;

impl WorldResolver for AnyWorld {
    fn world_exists(&self, _world: &str) -> bool {
        true
    }
}

/// Resolver over a fixed set of world names.
#[derive(Debug, Clone, Default)]
pub struct KnownWorlds {
    worlds: HashSet<String>,
}

impl KnownWorlds {
    #[must_use]
    pub fn new<I, S>(worlds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            worlds: worlds.into_iter().map(Into::into).collect(),
        }
    }
}

impl WorldResolver for KnownWorlds {
    fn world_exists(&self, world: &str) -> bool {
        self.worlds.contains(world)
    }
}

/// Maps a legacy display-name key to a stable owner identity.
///
/// Older stores keyed homes by player name. Backends call this for every
/// persisted key that is not a UUID.
pub trait NameResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<OwnerId>;
}

/// Resolver that never migrates; legacy keys are dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoNameResolver;

impl NameResolver for NoNameResolver {
    fn resolve(&self, _name: &str) -> Option<OwnerId> {
        None
    }
}

/// Resolves names to offline-mode identities.
///
/// The identity is the MD5 digest of `"OfflinePlayer:" + name` with the
/// version 3 and RFC 4122 variant bits set, which is what an offline-mode
/// server assigns to a player who never authenticated.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineNameResolver;

impl OfflineNameResolver {
    const PREFIX: &'static str = "OfflinePlayer:";

    #[must_use]
    pub fn offline_id(name: &str) -> OwnerId {
        let mut hasher = Md5::new();
        hasher.update(Self::PREFIX.as_bytes());
        hasher.update(name.as_bytes());
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&hasher.finalize());
        OwnerId::from_uuid(Builder::from_md5_bytes(bytes).into_uuid())
    }
}

impl NameResolver for OfflineNameResolver {
    fn resolve(&self, name: &str) -> Option<OwnerId> {
        if name.trim().is_empty() {
            return None;
        }
        Some(Self::offline_id(name))
    }
}
