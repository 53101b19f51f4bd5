use thiserror::Error;

/// Failures surfaced by a [`HomeStorage`](crate::traits::HomeStorage) backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[cfg(feature = "sqlite")]
    #[error("sqlite error: {0}")]
    Sql(#[from] sqlx::Error),
    #[error("storage backend is closed")]
    Closed,
    #[error("operation not supported by this backend: {0}")]
    Unsupported(&'static str),
    #[error("blocking storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("injected failure: {0}")]
    Injected(String),
}

pub type StorageResult<T> = Result<T, StorageError>;
