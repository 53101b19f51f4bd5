//! Write-coalescing home cache.
//!
//! Every read and write is served from memory. Mutations arm a debounce
//! timer; when it fires, the accumulated changes are written to the
//! configured [`HomeStorage`] in one go. Bursts of mutations therefore cost
//! one backend write per debounce window.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashSet;
use hearth_core::{Home, HomeOwner, Location, OwnerId, ValidationError, WorldResolver};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info_span, Instrument, Span};

use crate::service::config::{FlushStrategy, HomeServiceConfig};
use crate::storage::{HomeEngine, StorageResult};
use crate::traits::HomeStorage;

// ---------------------------------------------------------------------------
// Flush scheduling
// ---------------------------------------------------------------------------

enum FlushState {
    Clean,
    /// A debounce timer is pending. Only the timer whose `epoch` matches may
    /// start the flush.
    Scheduled { epoch: u64, timer: JoinHandle<()> },
    Flushing,
}

struct Schedule {
    state: FlushState,
    /// Mutations exist that no completed save has captured yet.
    dirty: bool,
    next_epoch: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushTrigger {
    Debounce,
    Explicit,
    Shutdown,
}

/// How a flush reaches the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    /// `save_all` of the whole cache. Only once a load has succeeded.
    Snapshot,
    /// `save_one` / `delete_one` for changed owners.
    PerKey,
    /// Read the durable state, apply changed owners, `save_all` the result.
    /// Used before any load has succeeded so unseen homes are kept.
    Merge,
}

impl WriteMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Snapshot => "snapshot",
            Self::PerKey => "per_key",
            Self::Merge => "merge",
        }
    }
}

impl FlushTrigger {
    fn as_str(self) -> &'static str {
        match self {
            Self::Debounce => "debounce",
            Self::Explicit => "explicit",
            Self::Shutdown => "shutdown",
        }
    }
}

// ---------------------------------------------------------------------------
// HomeService
// ---------------------------------------------------------------------------

/// Cache of every owner's home, persisted asynchronously.
///
/// Lookups and mutations are synchronous and never touch the backend.
/// Persistence runs on the Tokio runtime captured at construction:
///
/// - [`load`](Self::load) fills the cache in the background
/// - mutations schedule a debounced flush
/// - [`flush`](Self::flush) and [`shutdown`](Self::shutdown) write
///   immediately
///
/// Until a load succeeds the cache is not authoritative: flushes write only
/// the owners changed through this service, on top of whatever the backend
/// already holds, and write nothing when no owner changed.
///
/// Cloning is cheap; clones share the same cache.
#[derive(Clone)]
pub struct HomeService {
    inner: Arc<Inner>,
}

struct Inner {
    homes: HomeEngine,
    storage: Arc<dyn HomeStorage>,
    worlds: Arc<dyn WorldResolver>,
    config: HomeServiceConfig,
    per_key: bool,
    /// Owners mutated since the last successful write.
    changed: DashSet<OwnerId>,
    /// Set once a load has succeeded. Until then the cache may be missing
    /// durable homes and is never written as a full snapshot.
    loaded: AtomicBool,
    schedule: Mutex<Schedule>,
    /// Held for the duration of every backend write.
    write_gate: tokio::sync::Mutex<()>,
    loads_in_flight: watch::Sender<usize>,
    closed: AtomicBool,
    runtime: Handle,
}

impl HomeService {
    /// Creates an empty service on the current Tokio runtime.
    ///
    /// Call [`load`](Self::load) to populate it from `storage`.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    #[must_use]
    pub fn new(
        storage: Arc<dyn HomeStorage>,
        worlds: Arc<dyn WorldResolver>,
        config: HomeServiceConfig,
    ) -> Self {
        Self::with_runtime(storage, worlds, config, Handle::current())
    }

    /// Like [`new`](Self::new), with background work spawned on `runtime`.
    #[must_use]
    pub fn with_runtime(
        storage: Arc<dyn HomeStorage>,
        worlds: Arc<dyn WorldResolver>,
        config: HomeServiceConfig,
        runtime: Handle,
    ) -> Self {
        let per_key = match config.flush_strategy {
            FlushStrategy::Snapshot => false,
            FlushStrategy::PerKey if storage.supports_per_key() => true,
            FlushStrategy::PerKey => {
                tracing::warn!(
                    backend = storage.name(),
                    "Backend has no per-key writes; falling back to snapshot flushes"
                );
                false
            }
        };
        let (loads_in_flight, _) = watch::channel(0);

        Self {
            inner: Arc::new(Inner {
                homes: HomeEngine::new(),
                storage,
                worlds,
                config,
                per_key,
                changed: DashSet::new(),
                loaded: AtomicBool::new(false),
                schedule: Mutex::new(Schedule {
                    state: FlushState::Clean,
                    dirty: false,
                    next_epoch: 0,
                }),
                write_gate: tokio::sync::Mutex::new(()),
                loads_in_flight,
                closed: AtomicBool::new(false),
                runtime,
            }),
        }
    }

    /// Starts loading every persisted home in the background.
    ///
    /// The cache is replaced wholesale when the load completes; until then
    /// reads see whatever was there before. Flushes wait for the load so a
    /// partial cache is never written over the durable state. The handle
    /// resolves to the number of homes loaded, or 0 when the backend failed.
    pub fn load(&self) -> JoinHandle<usize> {
        let in_flight = LoadInFlight::begin(Arc::clone(&self.inner));
        self.inner.runtime.spawn(async move { in_flight.inner().reload().await })
    }

    /// Sets `owner`'s home to `location` and schedules a flush.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] and leaves the cache untouched when the
    /// world is blank or unknown to the [`WorldResolver`], or a coordinate
    /// is not finite.
    pub fn set_home(&self, owner: OwnerId, location: &Location) -> Result<(), ValidationError> {
        let home = location.to_home().and_then(|home| {
            if self.inner.worlds.world_exists(home.world()) {
                Ok(home)
            } else {
                Err(ValidationError::UnknownWorld(home.world().to_string()))
            }
        });
        let home = match home {
            Ok(home) => home,
            Err(err) => {
                tracing::debug!(owner = %owner, error = %err, "Rejected home");
                return Err(err);
            }
        };

        self.inner.homes.put(owner, home);
        self.inner.record_change(owner);
        self.inner.schedule_flush();
        Ok(())
    }

    /// Sets the home of `owner` to where it currently stands.
    ///
    /// # Errors
    ///
    /// [`ValidationError::MissingLocation`] when the owner has no location,
    /// otherwise as [`set_home`](Self::set_home).
    pub fn set_home_from(&self, owner: &dyn HomeOwner) -> Result<(), ValidationError> {
        let location = owner
            .current_location()
            .ok_or(ValidationError::MissingLocation)?;
        self.set_home(owner.stable_identifier(), &location)
    }

    /// Returns `owner`'s home, or `None` when there is none or its world is
    /// not currently loaded.
    #[must_use]
    pub fn get_home(&self, owner: OwnerId) -> Option<Location> {
        self.inner
            .homes
            .get(&owner)
            .filter(|home| self.inner.worlds.world_exists(home.world()))
            .as_ref()
            .map(Home::to_location)
    }

    /// Whether `owner` has a home, loaded world or not.
    #[must_use]
    pub fn has_home(&self, owner: OwnerId) -> bool {
        self.inner.homes.contains_key(&owner)
    }

    /// Removes `owner`'s home. Returns whether one existed.
    pub fn delete_home(&self, owner: OwnerId) -> bool {
        if self.inner.homes.remove(&owner).is_none() {
            return false;
        }
        self.inner.record_change(owner);
        self.inner.schedule_flush();
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.homes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.homes.is_empty()
    }

    /// Writes the full snapshot now, or only the changed owners when no load
    /// has succeeded yet.
    ///
    /// Cancels any pending debounce timer and waits for in-flight loads and
    /// saves first.
    ///
    /// # Errors
    ///
    /// Returns the backend error. The cache is untouched and a debounced
    /// retry is scheduled.
    pub async fn flush(&self) -> StorageResult<()> {
        self.inner.flush_now(FlushTrigger::Explicit).await
    }

    /// Flushes and closes the backend. Later calls are no-ops.
    ///
    /// Mutations after shutdown still update the cache but are never
    /// persisted.
    ///
    /// # Errors
    ///
    /// Returns the flush error, or the backend's close error.
    pub async fn shutdown(&self) -> StorageResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::info!(
            backend = self.inner.storage.name(),
            homes = self.inner.homes.len(),
            "Shutting down home service"
        );
        let flushed = self.inner.flush_now(FlushTrigger::Shutdown).await;
        let closed = self.inner.storage.close().await;
        flushed.and(closed)
    }
}

impl Inner {
    fn record_change(&self, owner: OwnerId) {
        self.changed.insert(owner);
    }

    fn schedule_flush(self: &Arc<Self>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut schedule = self.schedule.lock();
        schedule.dirty = true;
        if matches!(schedule.state, FlushState::Clean) {
            self.arm(&mut schedule);
        }
    }

    fn arm(self: &Arc<Self>, schedule: &mut Schedule) {
        schedule.next_epoch += 1;
        let epoch = schedule.next_epoch;
        let debounce = self.config.debounce;
        let inner = Arc::clone(self);
        let timer = self.runtime.spawn(async move {
            tokio::time::sleep(debounce).await;
            inner.run_debounced(epoch).await;
        });
        schedule.state = FlushState::Scheduled { epoch, timer };
    }

    fn cancel_pending(&self) {
        let mut schedule = self.schedule.lock();
        match std::mem::replace(&mut schedule.state, FlushState::Clean) {
            FlushState::Scheduled { timer, .. } => timer.abort(),
            other => schedule.state = other,
        }
    }

    async fn run_debounced(self: Arc<Self>, epoch: u64) {
        {
            let mut schedule = self.schedule.lock();
            match schedule.state {
                FlushState::Scheduled { epoch: current, .. } if current == epoch => {}
                // Superseded or cancelled.
                _ => return,
            }
            schedule.state = FlushState::Flushing;
        }

        self.wait_for_loads().await;
        let failed = {
            let _gate = self.write_gate.lock().await;
            let dirty = std::mem::replace(&mut self.schedule.lock().dirty, false);
            dirty && self.persist(FlushTrigger::Debounce).await.is_err()
        };

        let mut schedule = self.schedule.lock();
        if failed {
            schedule.dirty = true;
        }
        if schedule.dirty && !self.closed.load(Ordering::Acquire) {
            self.arm(&mut schedule);
        } else {
            schedule.state = FlushState::Clean;
        }
    }

    async fn flush_now(self: &Arc<Self>, trigger: FlushTrigger) -> StorageResult<()> {
        self.cancel_pending();
        self.wait_for_loads().await;
        let result = {
            let _gate = self.write_gate.lock().await;
            self.schedule.lock().dirty = false;
            self.persist(trigger).await
        };

        if result.is_err() {
            let mut schedule = self.schedule.lock();
            schedule.dirty = true;
            if matches!(schedule.state, FlushState::Clean) && !self.closed.load(Ordering::Acquire) {
                self.arm(&mut schedule);
            }
        }
        result
    }

    async fn wait_for_loads(&self) {
        let mut loads = self.loads_in_flight.subscribe();
        // The sender lives in `self`, so this only returns once the count is 0.
        let _ = loads.wait_for(|count| *count == 0).await;
    }

    /// Writes to the backend. The caller holds the write gate.
    async fn persist(&self, trigger: FlushTrigger) -> StorageResult<()> {
        let mode = self.write_mode(trigger);
        let span = info_span!(
            "flush",
            backend = self.storage.name(),
            trigger = trigger.as_str(),
            mode = mode.as_str(),
            count = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        async {
            let start = Instant::now();
            let result = match mode {
                WriteMode::Snapshot => self.write_snapshot().await,
                WriteMode::PerKey => self.write_changed().await,
                WriteMode::Merge => self.write_merged().await,
            };
            let span = Span::current();
            record_elapsed(&span, start);

            match result {
                Ok(count) => {
                    span.record("count", count);
                    span.record("outcome", "ok");
                    tracing::debug!(count, "Flushed homes");
                    Ok(())
                }
                Err(err) => {
                    span.record("outcome", "error");
                    tracing::warn!(error = %err, "Home flush failed; will retry");
                    Err(err)
                }
            }
        }
        .instrument(span)
        .await
    }

    fn write_mode(&self, trigger: FlushTrigger) -> WriteMode {
        if self.loaded.load(Ordering::Acquire) {
            if self.per_key && trigger == FlushTrigger::Debounce {
                WriteMode::PerKey
            } else {
                WriteMode::Snapshot
            }
        } else if self.storage.supports_per_key() {
            WriteMode::PerKey
        } else {
            WriteMode::Merge
        }
    }

    async fn write_snapshot(&self) -> StorageResult<usize> {
        // Taken before the snapshot so that every drained owner is in it.
        let pending = self.take_changed();
        let snapshot = self.homes.snapshot();
        match self.storage.save_all(&snapshot).await {
            Ok(()) => Ok(snapshot.len()),
            Err(err) => {
                for owner in pending {
                    self.changed.insert(owner);
                }
                Err(err)
            }
        }
    }

    async fn write_changed(&self) -> StorageResult<usize> {
        let mut written = 0;
        let mut first_error = None;
        for owner in self.take_changed() {
            let result = match self.homes.get(&owner) {
                Some(home) => self.storage.save_one(owner, &home).await,
                None => self.storage.delete_one(owner).await,
            };
            match result {
                Ok(()) => written += 1,
                Err(err) => {
                    self.changed.insert(owner);
                    first_error.get_or_insert(err);
                }
            }
        }
        first_error.map_or(Ok(written), Err)
    }

    /// Applies the changed owners on top of the durable state. Refuses to
    /// write when the durable state cannot be read.
    async fn write_merged(&self) -> StorageResult<usize> {
        let pending = self.take_changed();
        if pending.is_empty() {
            return Ok(0);
        }

        let result: StorageResult<usize> = async {
            let mut merged = self.storage.load_all().await?;
            for owner in &pending {
                match self.homes.get(owner) {
                    Some(home) => {
                        merged.insert(*owner, home);
                    }
                    None => {
                        merged.remove(owner);
                    }
                }
            }
            self.storage.save_all(&merged).await?;
            Ok(pending.len())
        }
        .await;

        if result.is_err() {
            for owner in pending {
                self.changed.insert(owner);
            }
        }
        result
    }

    fn take_changed(&self) -> Vec<OwnerId> {
        let owners: Vec<OwnerId> = self.changed.iter().map(|owner| *owner).collect();
        for owner in &owners {
            self.changed.remove(owner);
        }
        owners
    }

    async fn reload(&self) -> usize {
        let span = info_span!(
            "load",
            backend = self.storage.name(),
            count = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        async {
            let start = Instant::now();
            let result = self.storage.load_all().await;
            let span = Span::current();
            record_elapsed(&span, start);

            match result {
                Ok(homes) => {
                    let count = homes.len();
                    self.homes.replace_all(homes);
                    self.changed.clear();
                    self.loaded.store(true, Ordering::Release);
                    span.record("count", count);
                    span.record("outcome", "ok");
                    tracing::info!(backend = self.storage.name(), count, "Loaded homes");
                    count
                }
                Err(err) => {
                    span.record("outcome", "error");
                    tracing::error!(
                        backend = self.storage.name(),
                        error = %err,
                        "Failed to load homes; continuing with the in-memory state"
                    );
                    0
                }
            }
        }
        .instrument(span)
        .await
    }
}

fn record_elapsed(span: &Span, start: Instant) {
    #[allow(clippy::cast_possible_truncation)]
    let duration_ms = start.elapsed().as_millis() as u64;
    span.record("duration_ms", duration_ms);
}

/// Counts a load as in flight from before it is spawned until it finishes
/// or is dropped.
struct LoadInFlight(Arc<Inner>);

impl LoadInFlight {
    fn begin(inner: Arc<Inner>) -> Self {
        inner.loads_in_flight.send_modify(|count| *count += 1);
        Self(inner)
    }

    fn inner(&self) -> &Inner {
        &self.0
    }
}

impl Drop for LoadInFlight {
    fn drop(&mut self) {
        self.0.loads_in_flight.send_modify(|count| *count -= 1);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use hearth_core::{AnyWorld, Home, KnownWorlds, NoNameResolver};
    use tokio::sync::Notify;
    use tokio::time::sleep;

    use super::*;
    use crate::storage::datastores::{MemoryHomeStorage, YamlHomeStorage};
    use crate::storage::StorageError;
    use crate::traits::HomeSnapshot;

    /// Debounce window plus slack for the flush itself.
    const SETTLE: Duration = Duration::from_millis(2_100);

    fn overworld(x: f64) -> Location {
        Location::new("overworld", x, 64.0, -3.25, 90.0, 0.0)
    }

    fn service(storage: Arc<dyn HomeStorage>) -> HomeService {
        HomeService::new(storage, Arc::new(AnyWorld), HomeServiceConfig::default())
    }

    fn per_key_service(storage: Arc<dyn HomeStorage>) -> HomeService {
        let config = HomeServiceConfig {
            flush_strategy: FlushStrategy::PerKey,
            ..HomeServiceConfig::default()
        };
        HomeService::new(storage, Arc::new(AnyWorld), config)
    }

    /// Memory storage with a slow `save_all` and a gated or failing `load_all`.
    /// Tracks how many `save_all` calls ran at the same time.
    struct ScriptedStorage {
        inner: MemoryHomeStorage,
        save_delay: Duration,
        load_gate: Option<Arc<Notify>>,
        fail_load: AtomicBool,
        saves_running: AtomicUsize,
        max_saves_running: AtomicUsize,
    }

    impl ScriptedStorage {
        fn new(inner: MemoryHomeStorage) -> Self {
            Self {
                inner,
                save_delay: Duration::ZERO,
                load_gate: None,
                fail_load: AtomicBool::new(false),
                saves_running: AtomicUsize::new(0),
                max_saves_running: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl HomeStorage for ScriptedStorage {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn load_all(&self) -> StorageResult<HomeSnapshot> {
            if let Some(gate) = &self.load_gate {
                gate.notified().await;
            }
            if self.fail_load.load(Ordering::SeqCst) {
                return Err(StorageError::Injected("load refused".to_string()));
            }
            self.inner.load_all().await
        }

        async fn save_all(&self, snapshot: &HomeSnapshot) -> StorageResult<()> {
            let running = self.saves_running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_saves_running.fetch_max(running, Ordering::SeqCst);
            sleep(self.save_delay).await;
            let result = self.inner.save_all(snapshot).await;
            self.saves_running.fetch_sub(1, Ordering::SeqCst);
            result
        }

        async fn close(&self) -> StorageResult<()> {
            self.inner.close().await
        }
    }

    struct Player {
        id: OwnerId,
        at: Option<Location>,
    }

    impl HomeOwner for Player {
        fn stable_identifier(&self) -> OwnerId {
            self.id
        }

        fn current_location(&self) -> Option<Location> {
            self.at.clone()
        }
    }

    struct Toggle(AtomicBool);

    impl WorldResolver for Toggle {
        fn world_exists(&self, _world: &str) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn set_home_is_visible_immediately() {
        let storage = Arc::new(MemoryHomeStorage::new());
        let svc = service(storage.clone());
        let owner = OwnerId::random();

        svc.set_home(owner, &overworld(1.0)).unwrap();

        assert_eq!(svc.get_home(owner), Some(overworld(1.0)));
        assert!(svc.has_home(owner));
        assert_eq!(svc.len(), 1);
        assert_eq!(storage.save_all_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn mutations_in_one_window_coalesce_into_one_save() {
        let storage = Arc::new(MemoryHomeStorage::new());
        let svc = service(storage.clone());
        let owners: Vec<OwnerId> = (0..10).map(|_| OwnerId::random()).collect();

        for (x, owner) in (0u32..).zip(&owners) {
            svc.set_home(*owner, &overworld(f64::from(x))).unwrap();
        }
        svc.delete_home(owners[0]);
        sleep(SETTLE).await;

        assert_eq!(storage.save_all_calls(), 1);
        let saved = storage.last_snapshot().unwrap();
        assert_eq!(saved.len(), 9);
        assert!(!saved.contains_key(&owners[0]));
    }

    #[tokio::test(start_paused = true)]
    async fn last_save_matches_the_cache() {
        let storage = Arc::new(MemoryHomeStorage::new());
        let svc = service(storage.clone());
        let (a, b) = (OwnerId::random(), OwnerId::random());

        svc.set_home(a, &overworld(1.0)).unwrap();
        sleep(SETTLE).await;
        svc.set_home(b, &overworld(2.0)).unwrap();
        svc.set_home(a, &overworld(3.0)).unwrap();
        sleep(SETTLE).await;

        assert_eq!(storage.save_all_calls(), 2);
        let expected = HomeSnapshot::from([
            (a, overworld(3.0).to_home().unwrap()),
            (b, overworld(2.0).to_home().unwrap()),
        ]);
        assert_eq!(storage.last_snapshot().unwrap(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_persists_pending_mutation_once() {
        let storage = Arc::new(MemoryHomeStorage::new());
        let svc = service(storage.clone());
        let owner = OwnerId::random();

        svc.set_home(owner, &overworld(1.0)).unwrap();
        svc.shutdown().await.unwrap();

        assert_eq!(storage.save_all_calls(), 1);
        assert!(storage.persisted().contains_key(&owner));
        assert!(storage.is_closed());

        // The aborted debounce timer must not produce a second write.
        sleep(SETTLE * 2).await;
        assert_eq!(storage.save_all_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn second_shutdown_is_a_no_op() {
        let storage = Arc::new(MemoryHomeStorage::new());
        let svc = service(storage.clone());

        svc.set_home(OwnerId::random(), &overworld(1.0)).unwrap();
        svc.shutdown().await.unwrap();
        svc.shutdown().await.unwrap();

        assert_eq!(storage.save_all_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn mutations_after_shutdown_stay_in_memory() {
        let storage = Arc::new(MemoryHomeStorage::new());
        let svc = service(storage.clone());
        svc.shutdown().await.unwrap();

        let owner = OwnerId::random();
        svc.set_home(owner, &overworld(1.0)).unwrap();
        sleep(SETTLE * 2).await;

        assert_eq!(svc.get_home(owner), Some(overworld(1.0)));
        assert_eq!(storage.save_all_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_home_removes_and_persists() {
        let storage = Arc::new(MemoryHomeStorage::new());
        let svc = service(storage.clone());
        let owner = OwnerId::random();

        svc.set_home(owner, &overworld(1.0)).unwrap();
        sleep(SETTLE).await;
        assert!(svc.delete_home(owner));

        assert_eq!(svc.get_home(owner), None);
        assert!(!svc.has_home(owner));
        sleep(SETTLE).await;
        assert_eq!(storage.save_all_calls(), 2);
        assert!(storage.persisted().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deleting_a_missing_home_schedules_nothing() {
        let storage = Arc::new(MemoryHomeStorage::new());
        let svc = service(storage.clone());

        assert!(!svc.delete_home(OwnerId::random()));
        sleep(SETTLE).await;

        assert_eq!(storage.save_all_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn homes_in_unloaded_worlds_are_misses_but_kept() {
        let worlds = Arc::new(Toggle(AtomicBool::new(true)));
        let storage = Arc::new(MemoryHomeStorage::new());
        let svc = HomeService::new(storage.clone(), worlds.clone(), HomeServiceConfig::default());
        let owner = OwnerId::random();
        svc.set_home(owner, &overworld(1.0)).unwrap();

        worlds.0.store(false, Ordering::SeqCst);
        assert_eq!(svc.get_home(owner), None);
        assert!(svc.has_home(owner));
        sleep(SETTLE).await;
        assert!(storage.persisted().contains_key(&owner));

        worlds.0.store(true, Ordering::SeqCst);
        assert_eq!(svc.get_home(owner), Some(overworld(1.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_locations_are_rejected_without_side_effects() {
        let storage = Arc::new(MemoryHomeStorage::new());
        let svc = HomeService::new(
            storage.clone(),
            Arc::new(KnownWorlds::new(["overworld"])),
            HomeServiceConfig::default(),
        );
        let owner = OwnerId::random();

        let nether = Location::new("nether", 0.0, 64.0, 0.0, 0.0, 0.0);
        assert_eq!(
            svc.set_home(owner, &nether),
            Err(ValidationError::UnknownWorld("nether".to_string()))
        );
        let blank = Location::new("  ", 0.0, 64.0, 0.0, 0.0, 0.0);
        assert_eq!(svc.set_home(owner, &blank), Err(ValidationError::EmptyWorld));
        let nan = Location::new("overworld", f64::NAN, 64.0, 0.0, 0.0, 0.0);
        assert_eq!(
            svc.set_home(owner, &nan),
            Err(ValidationError::NonFiniteCoordinate("x"))
        );

        assert!(!svc.has_home(owner));
        sleep(SETTLE).await;
        assert_eq!(storage.save_all_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn set_home_from_uses_the_owner_position() {
        let svc = service(Arc::new(MemoryHomeStorage::new()));
        let player = Player {
            id: OwnerId::random(),
            at: Some(overworld(7.0)),
        };
        svc.set_home_from(&player).unwrap();
        assert_eq!(svc.get_home(player.id), Some(overworld(7.0)));

        let nowhere = Player {
            id: OwnerId::random(),
            at: None,
        };
        assert_eq!(
            svc.set_home_from(&nowhere),
            Err(ValidationError::MissingLocation)
        );
        assert!(!svc.has_home(nowhere.id));
    }

    #[tokio::test(start_paused = true)]
    async fn mutation_during_flush_triggers_another_flush() {
        let storage = Arc::new(ScriptedStorage {
            save_delay: Duration::from_secs(1),
            ..ScriptedStorage::new(MemoryHomeStorage::new())
        });
        let svc = service(storage.clone());
        let (a, b) = (OwnerId::random(), OwnerId::random());

        svc.set_home(a, &overworld(1.0)).unwrap();
        // First save runs from 2s to 3s.
        sleep(Duration::from_millis(2_500)).await;
        assert_eq!(storage.inner.save_all_calls(), 0);
        svc.set_home(b, &overworld(2.0)).unwrap();

        sleep(Duration::from_secs(2)).await;
        assert_eq!(storage.inner.save_all_calls(), 1);
        assert!(!storage.inner.persisted().contains_key(&b));

        // Re-armed at 3s, second save runs from 5s to 6s.
        sleep(Duration::from_secs(3)).await;
        assert_eq!(storage.inner.save_all_calls(), 2);
        assert_eq!(storage.inner.persisted().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_debounced_flush_is_retried() {
        let storage = Arc::new(MemoryHomeStorage::new());
        let svc = service(storage.clone());
        let owner = OwnerId::random();

        storage.fail_saves(true);
        svc.set_home(owner, &overworld(1.0)).unwrap();
        sleep(SETTLE).await;
        assert_eq!(storage.save_all_calls(), 1);
        assert!(storage.persisted().is_empty());

        storage.fail_saves(false);
        sleep(SETTLE).await;
        assert_eq!(storage.save_all_calls(), 2);
        assert!(storage.persisted().contains_key(&owner));
        assert_eq!(svc.get_home(owner), Some(overworld(1.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn flush_writes_now_and_cancels_the_timer() {
        let storage = Arc::new(MemoryHomeStorage::new());
        let svc = service(storage.clone());
        let owner = OwnerId::random();

        svc.set_home(owner, &overworld(1.0)).unwrap();
        svc.flush().await.unwrap();
        assert_eq!(storage.save_all_calls(), 1);
        assert!(storage.persisted().contains_key(&owner));

        sleep(SETTLE * 2).await;
        assert_eq!(storage.save_all_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_flush_returns_error_and_rearms() {
        let storage = Arc::new(MemoryHomeStorage::new());
        let svc = service(storage.clone());
        let owner = OwnerId::random();

        storage.fail_saves(true);
        svc.set_home(owner, &overworld(1.0)).unwrap();
        assert!(matches!(svc.flush().await, Err(StorageError::Injected(_))));
        assert!(svc.has_home(owner));

        storage.fail_saves(false);
        sleep(SETTLE).await;
        assert_eq!(storage.save_all_calls(), 2);
        assert!(storage.persisted().contains_key(&owner));
    }

    #[tokio::test(start_paused = true)]
    async fn per_key_flush_writes_only_changed_owners() {
        let storage = Arc::new(MemoryHomeStorage::with_per_key());
        let svc = per_key_service(storage.clone());
        let (a, b) = (OwnerId::random(), OwnerId::random());

        svc.set_home(a, &overworld(1.0)).unwrap();
        svc.set_home(b, &overworld(2.0)).unwrap();
        svc.set_home(a, &overworld(3.0)).unwrap();
        sleep(SETTLE).await;
        assert_eq!(storage.save_one_calls(), 2);
        assert_eq!(storage.save_all_calls(), 0);

        assert!(svc.delete_home(a));
        sleep(SETTLE).await;
        assert_eq!(storage.delete_one_calls(), 1);
        assert_eq!(storage.save_one_calls(), 2);
        assert_eq!(
            storage.persisted(),
            HomeSnapshot::from([(b, overworld(2.0).to_home().unwrap())])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn per_key_failures_are_requeued() {
        let storage = Arc::new(MemoryHomeStorage::with_per_key());
        let svc = per_key_service(storage.clone());
        let owner = OwnerId::random();

        storage.fail_saves(true);
        svc.set_home(owner, &overworld(1.0)).unwrap();
        sleep(SETTLE).await;
        assert_eq!(storage.save_one_calls(), 1);
        assert!(storage.persisted().is_empty());

        storage.fail_saves(false);
        sleep(SETTLE).await;
        assert_eq!(storage.save_one_calls(), 2);
        assert!(storage.persisted().contains_key(&owner));
    }

    #[tokio::test(start_paused = true)]
    async fn per_key_falls_back_to_snapshots_when_unsupported() {
        let storage = Arc::new(MemoryHomeStorage::new());
        let svc = per_key_service(storage.clone());

        svc.set_home(OwnerId::random(), &overworld(1.0)).unwrap();
        sleep(SETTLE).await;

        assert_eq!(storage.save_all_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_writes_a_full_snapshot_in_per_key_mode() {
        let storage = Arc::new(MemoryHomeStorage::with_per_key());
        let svc = per_key_service(storage.clone());
        svc.load().await.unwrap();

        svc.set_home(OwnerId::random(), &overworld(1.0)).unwrap();
        svc.shutdown().await.unwrap();

        assert_eq!(storage.save_all_calls(), 1);
        assert_eq!(storage.save_one_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn load_fills_the_cache() {
        let (a, b) = (OwnerId::random(), OwnerId::random());
        let storage = Arc::new(MemoryHomeStorage::seeded(HomeSnapshot::from([
            (a, overworld(1.0).to_home().unwrap()),
            (b, overworld(2.0).to_home().unwrap()),
        ])));
        let svc = service(storage.clone());

        assert!(svc.is_empty());
        assert_eq!(svc.load().await.unwrap(), 2);
        assert_eq!(svc.get_home(a), Some(overworld(1.0)));
        assert_eq!(svc.get_home(b), Some(overworld(2.0)));

        // Loading is not a mutation.
        sleep(SETTLE).await;
        assert_eq!(storage.save_all_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn flushes_wait_for_an_in_flight_load() {
        let owner = OwnerId::random();
        let seeded = MemoryHomeStorage::seeded(HomeSnapshot::from([(
            owner,
            Home::new("overworld", 1.0, 2.0, 3.0, 0.0, 0.0),
        )]));
        let gate = Arc::new(Notify::new());
        let storage = Arc::new(ScriptedStorage {
            load_gate: Some(Arc::clone(&gate)),
            ..ScriptedStorage::new(seeded)
        });
        let svc = service(storage.clone());

        let load = svc.load();
        assert!(!svc.has_home(owner));
        svc.set_home(OwnerId::random(), &overworld(5.0)).unwrap();
        sleep(SETTLE * 3).await;
        assert_eq!(storage.inner.save_all_calls(), 0);

        gate.notify_one();
        assert_eq!(load.await.unwrap(), 1);
        sleep(SETTLE).await;

        assert_eq!(storage.inner.save_all_calls(), 1);
        assert!(storage.inner.persisted().contains_key(&owner));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_load_never_overwrites_the_store() {
        let kept = OwnerId::random();
        let storage = Arc::new(ScriptedStorage::new(MemoryHomeStorage::seeded(
            HomeSnapshot::from([(kept, overworld(1.0).to_home().unwrap())]),
        )));
        storage.fail_load.store(true, Ordering::SeqCst);
        let svc = service(storage.clone());
        let owner = OwnerId::random();

        assert_eq!(svc.load().await.unwrap(), 0);
        assert!(svc.is_empty());

        svc.set_home(owner, &overworld(2.0)).unwrap();
        assert!(matches!(svc.flush().await, Err(StorageError::Injected(_))));
        assert_eq!(storage.inner.save_all_calls(), 0);
        assert_eq!(storage.inner.persisted().len(), 1);

        // Once the store is readable again the retry merges the change in.
        storage.fail_load.store(false, Ordering::SeqCst);
        sleep(SETTLE).await;
        let persisted = storage.inner.persisted();
        assert!(persisted.contains_key(&kept));
        assert!(persisted.contains_key(&owner));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_without_load_keeps_unseen_homes() {
        let kept = OwnerId::random();
        let storage = Arc::new(MemoryHomeStorage::seeded(HomeSnapshot::from([(
            kept,
            overworld(1.0).to_home().unwrap(),
        )])));
        let svc = service(storage.clone());

        svc.shutdown().await.unwrap();

        assert_eq!(storage.save_all_calls(), 0);
        assert!(storage.persisted().contains_key(&kept));
    }

    #[tokio::test(start_paused = true)]
    async fn writes_without_load_are_merged_into_the_store() {
        let (kept, gone, added) = (OwnerId::random(), OwnerId::random(), OwnerId::random());
        let storage = Arc::new(MemoryHomeStorage::seeded(HomeSnapshot::from([
            (kept, overworld(1.0).to_home().unwrap()),
            (gone, overworld(2.0).to_home().unwrap()),
        ])));
        let svc = service(storage.clone());

        svc.set_home(gone, &overworld(3.0)).unwrap();
        assert!(svc.delete_home(gone));
        svc.set_home(added, &overworld(4.0)).unwrap();
        svc.shutdown().await.unwrap();

        assert_eq!(storage.save_all_calls(), 1);
        assert_eq!(
            storage.persisted(),
            HomeSnapshot::from([
                (kept, overworld(1.0).to_home().unwrap()),
                (added, overworld(4.0).to_home().unwrap()),
            ])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_flush_waits_for_a_running_debounced_save() {
        let storage = Arc::new(ScriptedStorage {
            save_delay: Duration::from_secs(1),
            ..ScriptedStorage::new(MemoryHomeStorage::new())
        });
        let svc = service(storage.clone());
        let (a, b) = (OwnerId::random(), OwnerId::random());

        svc.set_home(a, &overworld(1.0)).unwrap();
        // The debounced save runs from 2s to 3s.
        sleep(Duration::from_millis(2_500)).await;
        svc.set_home(b, &overworld(2.0)).unwrap();
        svc.flush().await.unwrap();

        assert_eq!(storage.max_saves_running.load(Ordering::SeqCst), 1);
        assert_eq!(storage.inner.save_all_calls(), 2);
        let saved = storage.inner.last_snapshot().unwrap();
        assert!(saved.contains_key(&a));
        assert!(saved.contains_key(&b));

        // The flush captured `b`, so the re-armed timer has nothing to write.
        sleep(SETTLE * 2).await;
        assert_eq!(storage.inner.save_all_calls(), 2);
    }

    #[tokio::test]
    async fn shutdown_without_load_keeps_the_yaml_file() {
        let tmp = tempfile::tempdir().unwrap();
        let owner = OwnerId::random();
        let open = || {
            YamlHomeStorage::open(tmp.path(), "homes.yml", Arc::new(NoNameResolver)).unwrap()
        };
        open()
            .save_all(&HomeSnapshot::from([(owner, overworld(1.0).to_home().unwrap())]))
            .await
            .unwrap();

        service(Arc::new(open())).shutdown().await.unwrap();

        let persisted = open().load_all().await.unwrap();
        assert_eq!(persisted.len(), 1);
        assert!(persisted.contains_key(&owner));
    }

    #[tokio::test]
    async fn unreadable_yaml_file_survives_failed_load_and_shutdown() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("homes.yml");
        let contents = format!(
            "homes:\n  {}:\n    world: overworld\n    x: 1.0\n  broken: [unclosed\n",
            OwnerId::random()
        );
        std::fs::write(&path, &contents).unwrap();
        let storage =
            YamlHomeStorage::open(tmp.path(), "homes.yml", Arc::new(NoNameResolver)).unwrap();
        let svc = service(Arc::new(storage));

        assert_eq!(svc.load().await.unwrap(), 0);
        svc.set_home(OwnerId::random(), &overworld(2.0)).unwrap();
        assert!(matches!(svc.flush().await, Err(StorageError::Yaml(_))));
        assert!(svc.shutdown().await.is_err());

        assert_eq!(std::fs::read_to_string(&path).unwrap(), contents);
    }

    #[tokio::test]
    async fn home_survives_a_restart_on_yaml() {
        let tmp = tempfile::tempdir().unwrap();
        let owner = OwnerId::random();
        let home = Location::new("overworld", 10.5, 64.0, -3.25, 90.0, 0.0);

        let storage =
            YamlHomeStorage::open(tmp.path(), "homes.yml", Arc::new(NoNameResolver)).unwrap();
        let svc = service(Arc::new(storage));
        svc.set_home(owner, &home).unwrap();
        assert_eq!(svc.get_home(owner), Some(home.clone()));
        svc.shutdown().await.unwrap();

        let storage =
            YamlHomeStorage::open(tmp.path(), "homes.yml", Arc::new(NoNameResolver)).unwrap();
        let restarted = service(Arc::new(storage));
        assert_eq!(restarted.load().await.unwrap(), 1);
        assert_eq!(restarted.get_home(owner), Some(home));
    }
}
