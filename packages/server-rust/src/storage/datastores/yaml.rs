//! YAML file [`HomeStorage`] implementation.
//!
//! All homes live in one document under a top-level `homes` mapping keyed by
//! owner UUID. Every save serializes a fresh document and swaps it into
//! place with an atomic rename, so a crash mid-write leaves the previous
//! file intact.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hearth_core::{Home, NameResolver};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tempfile::NamedTempFile;

use crate::storage::keys::SnapshotBuilder;
use crate::storage::{StorageError, StorageResult};
use crate::traits::{HomeSnapshot, HomeStorage};

const SECTION: &str = "homes";

/// On-disk shape of one record.
///
/// `world` is required; coordinates and angles default to zero when absent.
#[derive(Debug, Serialize, Deserialize)]
struct YamlHome<W> {
    world: W,
    #[serde(default)]
    x: f64,
    #[serde(default)]
    y: f64,
    #[serde(default)]
    z: f64,
    #[serde(default)]
    yaw: f32,
    #[serde(default)]
    pitch: f32,
}

#[derive(Serialize)]
struct YamlDocument<'a> {
    homes: BTreeMap<String, YamlHome<&'a str>>,
}

/// `HomeStorage` that keeps every home in a single YAML file.
pub struct YamlHomeStorage {
    path: PathBuf,
    names: Arc<dyn NameResolver>,
    closed: AtomicBool,
}

impl YamlHomeStorage {
    /// Opens (creating if needed) `file_name` inside `data_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`] if the directory or file cannot be created.
    pub fn open(
        data_dir: impl AsRef<Path>,
        file_name: &str,
        names: Arc<dyn NameResolver>,
    ) -> StorageResult<Self> {
        let data_dir = data_dir.as_ref();
        std::fs::create_dir_all(data_dir)?;
        let path = data_dir.join(file_name);
        if !path.exists() {
            std::fs::File::create(&path)?;
        }
        Ok(Self {
            path,
            names,
            closed: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    fn decode(&self, text: &str) -> StorageResult<HomeSnapshot> {
        let mut builder = SnapshotBuilder::new(self.name(), self.names.as_ref());
        if text.trim().is_empty() {
            return Ok(builder.finish());
        }

        let root: Value = serde_yaml::from_str(text)?;
        let Some(section) = root.get(SECTION).and_then(Value::as_mapping) else {
            return Ok(builder.finish());
        };

        for (key, value) in section {
            let Some(raw_key) = key_text(key) else {
                builder.skip(&format!("{key:?}"), "key is not a scalar");
                continue;
            };
            match serde_yaml::from_value::<YamlHome<Option<String>>>(value.clone()) {
                Ok(YamlHome {
                    world: Some(world),
                    x,
                    y,
                    z,
                    yaw,
                    pitch,
                }) if !world.is_empty() => {
                    builder.insert(&raw_key, Home::new(world, x, y, z, yaw, pitch));
                }
                Ok(_) => builder.skip(&raw_key, "record has no world"),
                Err(err) => builder.skip(&raw_key, &err.to_string()),
            }
        }

        Ok(builder.finish())
    }
}

fn key_text(key: &Value) -> Option<String> {
    match key {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn encode(snapshot: &HomeSnapshot) -> StorageResult<String> {
    let homes = snapshot
        .iter()
        .map(|(owner, home)| {
            (
                owner.to_string(),
                YamlHome {
                    world: home.world(),
                    x: home.x(),
                    y: home.y(),
                    z: home.z(),
                    yaw: home.yaw(),
                    pitch: home.pitch(),
                },
            )
        })
        .collect();
    Ok(serde_yaml::to_string(&YamlDocument { homes })?)
}

/// Writes `contents` next to `path` and renames it over `path`.
fn write_atomic(path: &Path, contents: &[u8]) -> StorageResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    if let Err(err) = std::fs::File::open(dir).and_then(|handle| handle.sync_all()) {
        tracing::warn!(
            path = %dir.display(),
            error = %err,
            "Failed to sync data directory after rename"
        );
    }
    Ok(())
}

#[async_trait]
impl HomeStorage for YamlHomeStorage {
    fn name(&self) -> &'static str {
        "yaml"
    }

    async fn load_all(&self) -> StorageResult<HomeSnapshot> {
        self.ensure_open()?;
        let path = self.path.clone();
        let text = tokio::task::spawn_blocking(move || match std::fs::read_to_string(&path) {
            Ok(text) => Ok(text),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(err),
        })
        .await??;
        self.decode(&text)
    }

    async fn save_all(&self, snapshot: &HomeSnapshot) -> StorageResult<()> {
        self.ensure_open()?;
        // An empty snapshot still writes `homes: {}` so a stale file is cleared.
        let contents = encode(snapshot)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, contents.as_bytes())).await??;
        tracing::debug!(
            backend = self.name(),
            count = snapshot.len(),
            path = %self.path.display(),
            "Wrote homes file"
        );
        Ok(())
    }

    async fn close(&self) -> StorageResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
