//! Handle on one index: its root, its storage directory and its settings.
//!
//! Every component receives an [`Index`] explicitly; nothing is global.

use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::config::{Config, ConfigError};
use crate::errorlog::ErrorLog;
use crate::errors::{IndexError, Result};
use crate::manifest::{IndexManifest, ScanCounts, MANIFEST_FILE};
use crate::provider::{BuildContext, Credentials, ProviderConfig};
use crate::records::{ExtensionFilter, LoadedRecords, RecordStore, RecordTable};
use crate::semantic::cache::{CacheError, CacheSnapshot, EmbeddingCache, EmbeddingSpace, CACHE_DIR};
use crate::semantic::clustering::{self, ClusterOutcome};
use crate::storage::{BackendLocal, StorageManager};

pub const STORAGE_DIR_NAME: &str = ".wayfinder_index";
pub const MODELS_DIR: &str = "models";

#[derive(Clone, Debug)]
pub struct Index {
    root: PathBuf,
    dir: PathBuf,
    storage: BackendLocal,
    config: Config,
}

impl Index {
    /// Open or initialize the index for `root`. The storage directory
    /// defaults to `<root>/.wayfinder_index`.
    pub fn create(root: &Path, storage_dir: Option<&Path>) -> Result<Self> {
        if !root.is_dir() {
            return Err(IndexError::RootNotFound(root.to_path_buf()));
        }
        let root = root
            .canonicalize()
            .map_err(|_| IndexError::RootNotFound(root.to_path_buf()))?;

        let dir = match storage_dir {
            Some(dir) => dir.to_path_buf(),
            None => root.join(STORAGE_DIR_NAME),
        };
        let storage = BackendLocal::new(&dir)?;
        // canonical so the scanner can recognize it during the walk
        let dir = dir.canonicalize()?;
        let config = Config::load_with(&dir)?;

        Ok(Index {
            root,
            dir,
            storage,
            config,
        })
    }

    /// Open an existing index. `path` is either the storage directory or the
    /// root it belongs to.
    pub fn open(path: &Path) -> Result<Self> {
        let dir = if path.join(MANIFEST_FILE).is_file() {
            path.to_path_buf()
        } else if path.join(STORAGE_DIR_NAME).join(MANIFEST_FILE).is_file() {
            path.join(STORAGE_DIR_NAME)
        } else {
            return Err(IndexError::IndexNotFound(path.to_path_buf()));
        };
        let dir = dir.canonicalize()?;

        let storage = BackendLocal::new(&dir)?;
        let manifest: IndexManifest = storage
            .read_json(MANIFEST_FILE)?
            .ok_or_else(|| IndexError::IndexNotFound(path.to_path_buf()))?;
        let config = Config::load_with(&dir)?;

        Ok(Index {
            root: manifest.root,
            dir,
            storage,
            config,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Storage directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn storage(&self) -> &BackendLocal {
        &self.storage
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn records(&self) -> RecordStore {
        RecordStore::new(self.storage.clone())
    }

    pub fn load_records(&self) -> Result<LoadedRecords> {
        Ok(self.records().load()?)
    }

    pub fn manifest(&self) -> Result<Option<IndexManifest>> {
        Ok(self.storage.read_json(MANIFEST_FILE)?)
    }

    pub fn error_log(&self) -> ErrorLog {
        ErrorLog::new(self.storage.clone())
    }

    pub fn provider_config(&self) -> Result<ProviderConfig> {
        Ok(ProviderConfig::load(&self.storage)?)
    }

    pub fn credentials(&self) -> Result<Credentials> {
        Ok(Credentials::load(&self.storage)?)
    }

    pub fn build_context(&self) -> BuildContext {
        BuildContext {
            models_dir: self.dir.join(MODELS_DIR),
            max_retries: self.config.embedding.max_retries,
        }
    }

    /// Spaces the configured provider writes into, known without loading a
    /// model. A fallback chain has one per member, primary first.
    pub fn configured_spaces(&self) -> Result<Vec<EmbeddingSpace>> {
        Ok(self.provider_config()?.member_spaces()?)
    }

    /// The space readers compare against: whichever holds vectors for most of
    /// `table`, the earlier space winning ties.
    pub fn preferred_vectors(
        &self,
        spaces: Vec<EmbeddingSpace>,
        table: &RecordTable,
    ) -> Result<(EmbeddingSpace, CacheSnapshot)> {
        let mut best: Option<(EmbeddingSpace, CacheSnapshot)> = None;
        for space in spaces {
            let snapshot = self.load_vectors(space.clone(), table)?;
            let better = match &best {
                Some((_, current)) => snapshot.len() > current.len(),
                None => true,
            };
            if better {
                best = Some((space, snapshot));
            }
        }
        best.ok_or_else(|| ConfigError::Invalid("provider has no embedding space".into()).into())
    }

    /// [`Self::preferred_vectors`] over the configured provider's spaces.
    pub fn active_vectors(&self, table: &RecordTable) -> Result<(EmbeddingSpace, CacheSnapshot)> {
        self.preferred_vectors(self.configured_spaces()?, table)
    }

    pub fn cache_for(&self, space: EmbeddingSpace) -> EmbeddingCache {
        EmbeddingCache::new(&self.dir.join(CACHE_DIR), space)
    }

    /// Vectors of `space` for the fingerprints in `table`. Readers never
    /// repair: an unreadable cache reads as empty until the next run resets it.
    pub fn load_vectors(&self, space: EmbeddingSpace, table: &RecordTable) -> Result<CacheSnapshot> {
        let cache = self.cache_for(space);
        match cache.load_live(&table.fingerprints()) {
            Ok(snapshot) => Ok(snapshot),
            Err(CacheError::Io(e)) => Err(e.into()),
            Err(e) => {
                log::warn!("cache={} unreadable, treating as empty: {e}", cache.space().label());
                Ok(CacheSnapshot {
                    dimensions: cache.space().dimensions,
                    ..Default::default()
                })
            }
        }
    }

    /// Recompute the manifest from records, cache and clusters.
    ///
    /// `scan` carries the filter and counters of a scan that just committed;
    /// other callers keep the stored ones.
    pub fn refresh_manifest(
        &self,
        scan: Option<(&ExtensionFilter, ScanCounts)>,
    ) -> Result<IndexManifest> {
        let previous = match self.manifest() {
            Ok(manifest) => manifest,
            Err(e) => {
                log::warn!("{MANIFEST_FILE} unreadable, rebuilding: {e}");
                None
            }
        };

        let mut manifest = match previous {
            Some(manifest) => manifest,
            None => IndexManifest::new(
                self.root.clone(),
                ExtensionFilter::from_request(None, false, &self.config.scan.extensions),
            ),
        };

        if let Some((extensions, counts)) = scan {
            manifest.extensions = extensions.clone();
            manifest.last_scan = Some(counts);
        }

        let table = self.load_records()?.table;
        manifest.root = self.root.clone();
        manifest.total_files = table.len();
        manifest.total_bytes = table.total_bytes();

        match self.configured_spaces() {
            Ok(spaces) => {
                let (space, snapshot) = self.preferred_vectors(spaces, &table)?;
                manifest.active_space = Some(space.label());
                manifest.embedding_count = snapshot.len();
            }
            Err(e) => {
                log::warn!("provider configuration unusable: {e}");
                manifest.active_space = None;
                manifest.embedding_count = 0;
            }
        }
        manifest.has_embeddings = manifest.embedding_count > 0;

        manifest.cluster_count = match clustering::load_last(&self.storage) {
            Ok(Some(ClusterOutcome::Clustered { clusters, .. })) => clusters.len(),
            Ok(_) => 0,
            Err(e) => {
                log::warn!("last clustering result unreadable: {e}");
                0
            }
        };
        manifest.has_clusters = manifest.cluster_count > 0;
        manifest.updated_at = Utc::now();

        self.storage.write_json(MANIFEST_FILE, &manifest)?;
        Ok(manifest)
    }

    /// True once a scan has written a manifest.
    pub fn is_initialized(&self) -> bool {
        self.storage.exists(MANIFEST_FILE)
    }
}
