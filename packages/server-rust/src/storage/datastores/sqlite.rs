//! `SQLite` [`HomeStorage`] implementation over a pooled `sqlx` connection.
//!
//! One row per owner in the `homes` table. Supports the per-key path, so the
//! service can upsert or delete a single owner without rewriting the table.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hearth_core::{Home, NameResolver, OwnerId};
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{Row, Sqlite};

use crate::storage::config::PoolConfig;
use crate::storage::keys::SnapshotBuilder;
use crate::storage::{StorageError, StorageResult};
use crate::traits::{HomeSnapshot, HomeStorage};

const CREATE_TABLE: &str = r"
    CREATE TABLE IF NOT EXISTS homes (
        uuid TEXT PRIMARY KEY NOT NULL,
        world TEXT NOT NULL,
        x REAL NOT NULL,
        y REAL NOT NULL,
        z REAL NOT NULL,
        yaw REAL NOT NULL,
        pitch REAL NOT NULL,
        updated_at INTEGER DEFAULT (strftime('%s', 'now'))
    )
";

const CREATE_INDEX: &str = "CREATE INDEX IF NOT EXISTS idx_homes_updated ON homes(updated_at)";

const UPSERT: &str = r"
    INSERT INTO homes (uuid, world, x, y, z, yaw, pitch, updated_at)
    VALUES (?, ?, ?, ?, ?, ?, ?, strftime('%s', 'now'))
    ON CONFLICT(uuid) DO UPDATE SET
        world = excluded.world,
        x = excluded.x,
        y = excluded.y,
        z = excluded.z,
        yaw = excluded.yaw,
        pitch = excluded.pitch,
        updated_at = excluded.updated_at
";

const DELETE_ONE: &str = "DELETE FROM homes WHERE uuid = ?";

/// `HomeStorage` backed by an `SQLite` database file.
///
/// The pool is opened by [`open`](SqliteHomeStorage::open) and released by
/// [`close`](HomeStorage::close); every call after that fails with
/// [`StorageError::Closed`].
pub struct SqliteHomeStorage {
    pool: SqlitePool,
    names: Arc<dyn NameResolver>,
}

impl SqliteHomeStorage {
    /// Opens (creating if needed) `file_name` inside `data_dir` and ensures
    /// the schema exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created, the pool cannot
    /// connect, or the schema statements fail.
    pub async fn open(
        data_dir: impl AsRef<Path>,
        file_name: &str,
        pool: &PoolConfig,
        names: Arc<dyn NameResolver>,
    ) -> StorageResult<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;

        let options = SqliteConnectOptions::new()
            .filename(data_dir.join(file_name))
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(pool.acquire_timeout_ms));

        let pool = SqlitePoolOptions::new()
            .max_connections(pool.max_connections)
            .min_connections(pool.min_connections)
            .acquire_timeout(Duration::from_millis(pool.acquire_timeout_ms))
            .idle_timeout(Some(Duration::from_millis(pool.idle_timeout_ms)))
            .max_lifetime(Some(Duration::from_millis(pool.max_lifetime_ms)))
            .connect_with(options)
            .await?;

        sqlx::query(CREATE_TABLE).execute(&pool).await?;
        sqlx::query(CREATE_INDEX).execute(&pool).await?;
        tracing::info!(
            backend = "sqlite",
            path = %data_dir.join(file_name).display(),
            "SQLite home store initialized"
        );

        Ok(Self { pool, names })
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.pool.is_closed() {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }
}

// REAL columns hold f64; angles were widened from f32 on write.
#[allow(clippy::cast_possible_truncation)]
fn decode_row(row: &SqliteRow) -> Result<Home, sqlx::Error> {
    Ok(Home::new(
        row.try_get::<String, _>("world")?,
        row.try_get::<f64, _>("x")?,
        row.try_get::<f64, _>("y")?,
        row.try_get::<f64, _>("z")?,
        row.try_get::<f64, _>("yaw")? as f32,
        row.try_get::<f64, _>("pitch")? as f32,
    ))
}

fn upsert<'q>(owner: &'q str, home: &'q Home) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    sqlx::query(UPSERT)
        .bind(owner)
        .bind(home.world())
        .bind(home.x())
        .bind(home.y())
        .bind(home.z())
        .bind(f64::from(home.yaw()))
        .bind(f64::from(home.pitch()))
}

#[async_trait]
impl HomeStorage for SqliteHomeStorage {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn load_all(&self) -> StorageResult<HomeSnapshot> {
        self.ensure_open()?;
        let rows = sqlx::query("SELECT uuid, world, x, y, z, yaw, pitch FROM homes")
            .fetch_all(&self.pool)
            .await?;

        let mut builder = SnapshotBuilder::new(self.name(), self.names.as_ref());
        for row in &rows {
            let key: String = match row.try_get("uuid") {
                Ok(key) => key,
                Err(err) => {
                    builder.skip("<unreadable>", &err.to_string());
                    continue;
                }
            };
            match decode_row(row) {
                Ok(home) if !home.world().is_empty() => builder.insert(&key, home),
                Ok(_) => builder.skip(&key, "record has no world"),
                Err(err) => builder.skip(&key, &err.to_string()),
            }
        }
        Ok(builder.finish())
    }

    async fn save_all(&self, snapshot: &HomeSnapshot) -> StorageResult<()> {
        self.ensure_open()?;
        let keys: Vec<(String, &Home)> = snapshot
            .iter()
            .map(|(owner, home)| (owner.to_string(), home))
            .collect();
        let keep: HashSet<&str> = keys.iter().map(|(key, _)| key.as_str()).collect();

        let mut tx = self.pool.begin().await?;
        for (key, home) in &keys {
            upsert(key, home).execute(&mut *tx).await?;
        }

        // Every row whose key is not in the snapshot goes, including legacy
        // name-keyed rows that were migrated on load.
        let existing: Vec<String> = sqlx::query_scalar("SELECT uuid FROM homes")
            .fetch_all(&mut *tx)
            .await?;
        let mut deleted = 0_usize;
        for key in existing.iter().filter(|key| !keep.contains(key.as_str())) {
            sqlx::query(DELETE_ONE)
                .bind(key.as_str())
                .execute(&mut *tx)
                .await?;
            deleted += 1;
        }
        tx.commit().await?;

        tracing::debug!(
            backend = self.name(),
            upserted = keys.len(),
            deleted,
            "Saved home snapshot"
        );
        Ok(())
    }

    fn supports_per_key(&self) -> bool {
        true
    }

    async fn save_one(&self, owner: OwnerId, home: &Home) -> StorageResult<()> {
        self.ensure_open()?;
        let key = owner.to_string();
        upsert(&key, home).execute(&self.pool).await?;
        Ok(())
    }

    async fn delete_one(&self, owner: OwnerId) -> StorageResult<()> {
        self.ensure_open()?;
        sqlx::query(DELETE_ONE)
            .bind(owner.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        if !self.pool.is_closed() {
            self.pool.close().await;
            tracing::info!(backend = self.name(), "Database connection pool closed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use hearth_core::{NoNameResolver, OfflineNameResolver};

    use super::*;
    use crate::storage::config::DEFAULT_SQLITE_FILE;

    async fn open(dir: &Path) -> SqliteHomeStorage {
        SqliteHomeStorage::open(
            dir,
            DEFAULT_SQLITE_FILE,
            &PoolConfig::default(),
            Arc::new(OfflineNameResolver),
        )
        .await
        .unwrap()
    }

    fn overworld() -> Home {
        Home::new("overworld", 10.5, 64.0, -3.25, 90.0, 0.0)
    }

    #[tokio::test]
    async fn save_then_load_on_fresh_instance_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let snapshot = HomeSnapshot::from([
            (OwnerId::random(), overworld()),
            (OwnerId::random(), Home::new("the_end", 1e12, -64.0, 0.1, 359.99, -89.5)),
        ]);

        let first = open(tmp.path()).await;
        first.save_all(&snapshot).await.unwrap();
        first.close().await.unwrap();

        let second = open(tmp.path()).await;
        assert_eq!(second.load_all().await.unwrap(), snapshot);
        second.close().await.unwrap();
    }

    #[tokio::test]
    async fn save_all_deletes_rows_outside_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path()).await;
        let a = OwnerId::random();
        let b = OwnerId::random();

        store
            .save_all(&HomeSnapshot::from([(a, overworld()), (b, overworld())]))
            .await
            .unwrap();
        store
            .save_all(&HomeSnapshot::from([(a, overworld())]))
            .await
            .unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key(&a));

        store.save_all(&HomeSnapshot::new()).await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_save_all_keeps_previous_rows() {
        use sqlx::{Connection, SqliteConnection};

        let tmp = tempfile::tempdir().unwrap();
        let store = SqliteHomeStorage::open(
            tmp.path(),
            DEFAULT_SQLITE_FILE,
            &PoolConfig {
                acquire_timeout_ms: 100,
                ..PoolConfig::default()
            },
            Arc::new(NoNameResolver),
        )
        .await
        .unwrap();
        let before = HomeSnapshot::from([(OwnerId::random(), overworld())]);
        store.save_all(&before).await.unwrap();

        let mut locker = SqliteConnection::connect_with(
            &SqliteConnectOptions::new().filename(tmp.path().join(DEFAULT_SQLITE_FILE)),
        )
        .await
        .unwrap();
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut locker)
            .await
            .unwrap();

        let after = HomeSnapshot::from([(OwnerId::random(), overworld())]);
        assert!(matches!(
            store.save_all(&after).await,
            Err(StorageError::Sql(_))
        ));

        sqlx::query("ROLLBACK").execute(&mut locker).await.unwrap();
        locker.close().await.unwrap();
        assert_eq!(store.load_all().await.unwrap(), before);
    }

    #[tokio::test]
    async fn per_key_upsert_and_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path()).await;
        let owner = OwnerId::random();
        assert!(store.supports_per_key());

        store.save_one(owner, &overworld()).await.unwrap();
        let moved = Home::new("nether", 1.0, 2.0, 3.0, 4.0, 5.0);
        store.save_one(owner, &moved).await.unwrap();
        assert_eq!(store.load_all().await.unwrap().get(&owner), Some(&moved));

        store.delete_one(owner).await.unwrap();
        store.delete_one(owner).await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn legacy_rows_migrate_and_are_dropped_on_next_save() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path()).await;
        upsert("Steve", &overworld()).execute(&store.pool).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        let id = OfflineNameResolver::offline_id("Steve");
        assert_eq!(loaded.get(&id), Some(&overworld()));

        store.save_all(&loaded).await.unwrap();
        let keys: Vec<String> = sqlx::query_scalar("SELECT uuid FROM homes")
            .fetch_all(&store.pool)
            .await
            .unwrap();
        assert_eq!(keys, vec![id.to_string()]);
    }

    #[tokio::test]
    async fn unresolvable_rows_are_skipped() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SqliteHomeStorage::open(
            tmp.path(),
            DEFAULT_SQLITE_FILE,
            &PoolConfig::default(),
            Arc::new(NoNameResolver),
        )
        .await
        .unwrap();
        let good = OwnerId::random();
        upsert("not-a-uuid", &overworld()).execute(&store.pool).await.unwrap();
        store.save_one(good, &overworld()).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key(&good));
    }

    #[tokio::test]
    async fn operations_after_close_fail_safely() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open(tmp.path()).await;
        store.close().await.unwrap();
        store.close().await.unwrap();

        assert!(matches!(store.load_all().await, Err(StorageError::Closed)));
        assert!(matches!(
            store.save_all(&HomeSnapshot::new()).await,
            Err(StorageError::Closed)
        ));
        assert!(matches!(
            store.save_one(OwnerId::random(), &overworld()).await,
            Err(StorageError::Closed)
        ));
        assert!(matches!(
            store.delete_one(OwnerId::random()).await,
            Err(StorageError::Closed)
        ));
    }
}
