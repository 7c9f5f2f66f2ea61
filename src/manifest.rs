use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::records::ExtensionFilter;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const MANIFEST_VERSION: u32 = 1;

/// Counters from one scan.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCounts {
    pub added: usize,
    /// Existing paths whose fingerprint changed
    pub modified: usize,
    pub removed: usize,
    pub unchanged: usize,
    /// Files whose content was read and hashed
    pub hashed: usize,
    pub errors: usize,
}

/// Summary document derived from the other index files.
///
/// Rebuilt after every scan, embedding run and clustering run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexManifest {
    pub version: u32,
    /// Canonical index root
    pub root: PathBuf,
    pub extensions: ExtensionFilter,
    pub total_files: usize,
    pub total_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub has_embeddings: bool,
    /// Live embeddings for the active provider and model
    pub embedding_count: usize,
    /// `provider/model` of the active embedding space
    #[serde(default)]
    pub active_space: Option<String>,
    pub has_clusters: bool,
    pub cluster_count: usize,
    #[serde(default)]
    pub last_scan: Option<ScanCounts>,
}

impl IndexManifest {
    pub fn new(root: PathBuf, extensions: ExtensionFilter) -> Self {
        let now = Utc::now();
        IndexManifest {
            version: MANIFEST_VERSION,
            root,
            extensions,
            total_files: 0,
            total_bytes: 0,
            created_at: now,
            updated_at: now,
            has_embeddings: false,
            embedding_count: 0,
            active_space: None,
            has_clusters: false,
            cluster_count: 0,
            last_scan: None,
        }
    }
}
