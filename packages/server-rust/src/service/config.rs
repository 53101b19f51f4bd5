use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How debounced flushes write to the backend.
///
/// Once a load has succeeded, explicit
/// [`flush`](crate::service::HomeService::flush) and
/// [`shutdown`](crate::service::HomeService::shutdown) always write the full
/// snapshot regardless of this setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushStrategy {
    /// `save_all` of the whole mapping.
    #[default]
    Snapshot,
    /// `save_one` / `delete_one` for owners changed since the last flush.
    /// Falls back to `Snapshot` when the backend has no per-key path.
    PerKey,
}

/// Tuning for [`HomeService`](crate::service::HomeService).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HomeServiceConfig {
    /// Quiet window after a mutation before the debounced flush runs.
    #[serde(rename = "debounce_ms", with = "duration_ms")]
    pub debounce: Duration,
    pub flush_strategy: FlushStrategy,
}

impl Default for HomeServiceConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(2),
            flush_strategy: FlushStrategy::Snapshot,
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
