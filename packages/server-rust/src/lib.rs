//! Hearth server: write-coalescing home cache with pluggable storage backends.

pub mod logging;
pub mod service;
pub mod storage;
pub mod traits;

pub use service::{FlushStrategy, HomeService, HomeServiceConfig};
pub use storage::{open_storage, BackendConfig, StorageError, StorageResult};
pub use traits::{HomeSnapshot, HomeStorage};
