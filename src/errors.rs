use std::path::PathBuf;

use crate::{
    config::ConfigError, provider::ProviderError, semantic::cache::CacheError,
    semantic::clustering::ClusteringError,
};

#[derive(thiserror::Error, Debug)]
pub enum IndexError {
    #[error("root path does not exist or is not a directory: {}", .0.display())]
    RootNotFound(PathBuf),

    #[error("no index found at {}; run a scan first", .0.display())]
    IndexNotFound(PathBuf),

    #[error("an embedding run is already active for {}", .0.display())]
    AlreadyRunning(PathBuf),

    #[error("index is locked: {0}")]
    Locked(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("embedding cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("clustering error: {0}")]
    Clustering(#[from] ClusteringError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected error: {0:?}")]
    Other(#[from] anyhow::Error),
}

impl IndexError {
    /// Lock contention surfaces as `WouldBlock`; keep it distinct from plain io failures.
    pub fn from_lock(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::WouldBlock {
            IndexError::Locked(err.to_string())
        } else {
            IndexError::Io(err)
        }
    }
}

pub type Result<T, E = IndexError> = std::result::Result<T, E>;
