//! `IndexService`: the one entry point the CLI and the daemon talk to.
//!
//! Every operation names its index by path (root or storage directory) and
//! opens it fresh, so settings edited on disk apply on the next call.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::backup;
use crate::batch::{runner, BatchProgress, BatchStatus, EmbedOptions, RunRegistry};
use crate::config::ConfigError;
use crate::errorlog::ErrorEntry;
use crate::errors::{IndexError, Result};
use crate::index::Index;
use crate::lock::{FileLock, EMBED_LOCK};
use crate::manifest::MANIFEST_FILE;
use crate::provider::{
    self, describe, Credentials, EmbeddingProvider, ProviderConfig, ProviderView, ValidationReport,
};
use crate::records::RECORDS_FILE;
use crate::scanner::{self, ScanOptions, ScanReport};
use crate::search::{self, SearchRequest, SearchResponse};
use crate::semantic::cache::CacheError;
use crate::semantic::clustering::{self, ClusterOutcome};
use crate::semantic::similarity::{self, DuplicateGroup, MoveProposal};
use crate::semantic::vectors::join;

/// How many missing files a health report lists by name
const MISSING_FILES_SHOWN: usize = 50;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct IndexStats {
    pub total_files: usize,
    pub total_size_bytes: u64,
    /// Files per extension
    pub extensions: BTreeMap<String, usize>,
    pub last_updated: Option<DateTime<Utc>>,
    pub scan_path: PathBuf,
    pub has_embeddings: bool,
    pub embedding_count: usize,
    pub has_clusters: bool,
    pub cluster_count: usize,
    pub active_provider: Option<ProviderView>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TimelineDay {
    /// `YYYY-MM-DD`, UTC
    pub date: String,
    pub count: usize,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Timeline {
    pub days: Vec<TimelineDay>,
    pub total_days: usize,
    pub total_files: usize,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct HealthReport {
    pub healthy: bool,
    pub manifest_readable: bool,
    pub records_readable: bool,
    /// Entries of `files.json` that failed to decode
    pub records_dropped: usize,
    pub cache_readable: bool,
    pub cache_records: usize,
    /// Cache records skipped for a bad checksum or a short tail
    pub corrupt_cache_records: usize,
    pub orphaned_embeddings: usize,
    pub missing_files: usize,
    pub missing_examples: Vec<String>,
    pub stale_progress: bool,
    pub issues: Vec<String>,
}

/// A provider entry plus the secrets it needs, keyed by provider kind
/// (`azure`, `vertex`, `openai`).
#[derive(Clone, Default, serde::Deserialize)]
pub struct ProviderUpdate {
    pub config: ProviderConfig,
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
}

impl std::fmt::Debug for ProviderUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderUpdate")
            .field("config", &self.config)
            .field("secrets", &self.secrets.keys().collect::<Vec<_>>())
            .finish()
    }
}

type ProviderSlot = (ProviderConfig, Credentials, Arc<dyn EmbeddingProvider>);

#[derive(Default)]
pub struct IndexService {
    runs: Arc<RunRegistry>,
    /// Built providers per storage dir, so a local model loads once. Keyed
    /// by configuration and secrets: editing either rebuilds.
    providers: Mutex<HashMap<PathBuf, ProviderSlot>>,
}

impl IndexService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn runs(&self) -> &Arc<RunRegistry> {
        &self.runs
    }

    pub fn open(&self, path: &Path) -> Result<Index> {
        Index::open(path)
    }

    fn provider_for(&self, index: &Index) -> Result<Arc<dyn EmbeddingProvider>> {
        let config = index.provider_config()?;
        let credentials = index.credentials()?;
        let mut providers = self
            .providers
            .lock()
            .map_err(|_| anyhow::anyhow!("provider cache poisoned"))?;

        if let Some((cached, cached_credentials, provider)) = providers.get(index.dir()) {
            if *cached == config && *cached_credentials == credentials {
                return Ok(provider.clone());
            }
        }

        let provider = provider::build(&config, &credentials, &index.build_context())?;
        providers.insert(
            index.dir().to_path_buf(),
            (config, credentials, provider.clone()),
        );
        Ok(provider)
    }

    fn forget_provider(&self, index: &Index) {
        if let Ok(mut providers) = self.providers.lock() {
            providers.remove(index.dir());
        }
    }

    pub fn scan(&self, root: &Path, options: &ScanOptions) -> Result<ScanReport> {
        scanner::scan(root, options)
    }

    /// Start embedding with the configured provider. Returns at once.
    pub fn start_embedding(&self, path: &Path, options: &EmbedOptions) -> Result<BatchProgress> {
        let index = self.open(path)?;
        let provider = self.provider_for(&index)?;
        runner::start(&index, &self.runs, provider, options)
    }

    /// Start embedding with an explicit provider.
    pub fn start_embedding_with(
        &self,
        path: &Path,
        provider: Arc<dyn EmbeddingProvider>,
        options: &EmbedOptions,
    ) -> Result<BatchProgress> {
        let index = self.open(path)?;
        runner::start(&index, &self.runs, provider, options)
    }

    pub fn progress(&self, path: &Path) -> Result<Option<BatchProgress>> {
        runner::progress(&self.open(path)?, &self.runs)
    }

    pub fn cancel_embedding(&self, path: &Path) -> Result<bool> {
        runner::cancel(&self.open(path)?, &self.runs)
    }

    pub fn wait_for_embedding(&self, path: &Path) -> Result<Option<BatchProgress>> {
        runner::wait(&self.open(path)?, &self.runs)
    }

    /// Cluster the embedded files of the active space and persist the result.
    pub fn cluster(&self, path: &Path, k: Option<usize>) -> Result<ClusterOutcome> {
        let index = self.open(path)?;
        let table = index.load_records()?.table;
        let (_, snapshot) = index.active_vectors(&table)?;

        let points: Vec<(String, &[f32])> = join(&table, &snapshot)
            .into_iter()
            .filter_map(|file| file.vector.map(|v| (file.record.path.clone(), v)))
            .collect();

        let outcome = clustering::cluster_points(&points, k, &index.config().clustering)?;
        if let ClusterOutcome::InsufficientData { embedded_files, required } = &outcome {
            log::info!(
                "cluster index={} skipped: {embedded_files} embedded, {required} required",
                index.dir().display()
            );
        }

        clustering::save(index.storage(), &outcome)?;
        index.refresh_manifest(None)?;
        Ok(outcome)
    }

    /// Last persisted clustering result.
    pub fn clusters(&self, path: &Path) -> Result<Option<ClusterOutcome>> {
        let index = self.open(path)?;
        Ok(clustering::load_last(index.storage())?)
    }

    /// Hybrid search. A provider that cannot be built degrades the search to
    /// keyword-only instead of failing it.
    pub fn search(&self, path: &Path, request: &SearchRequest) -> Result<SearchResponse> {
        let index = self.open(path)?;
        let weight = request
            .semantic_weight
            .unwrap_or(index.config().search.semantic_weight);

        let provider = if weight > 0.0 {
            match self.provider_for(&index) {
                Ok(provider) => Some(provider),
                Err(e) => {
                    log::warn!("search: provider unavailable, keyword-only: {e}");
                    None
                }
            }
        } else {
            None
        };

        search::search(&index, provider.as_deref(), request)
    }

    pub fn search_with(
        &self,
        path: &Path,
        provider: Option<&dyn EmbeddingProvider>,
        request: &SearchRequest,
    ) -> Result<SearchResponse> {
        search::search(&self.open(path)?, provider, request)
    }

    pub fn similarity_groups(
        &self,
        path: &Path,
        threshold: Option<f32>,
        pinned: &HashSet<String>,
    ) -> Result<Vec<DuplicateGroup>> {
        let index = self.open(path)?;
        let threshold = threshold.unwrap_or(index.config().similarity.threshold);
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::Invalid(format!(
                "similarity threshold must be within [0, 1], got {threshold}"
            ))
            .into());
        }

        let table = index.load_records()?.table;
        let (_, snapshot) = index.active_vectors(&table)?;
        let files = join(&table, &snapshot);

        let groups = similarity::find_groups(&files, threshold, pinned);
        log::info!(
            "similar index={} files={} threshold={threshold} groups={}",
            index.dir().display(),
            files.len(),
            groups.len()
        );
        Ok(groups)
    }

    /// Advisory archive plan for the candidates of every group.
    pub fn propose_moves(
        &self,
        path: &Path,
        threshold: Option<f32>,
        pinned: &HashSet<String>,
        archive_dir: &Path,
    ) -> Result<Vec<MoveProposal>> {
        let groups = self.similarity_groups(path, threshold, pinned)?;
        Ok(similarity::propose_moves(&groups, archive_dir))
    }

    pub fn get_stats(&self, path: &Path) -> Result<IndexStats> {
        let index = self.open(path)?;
        let manifest = index.manifest()?;
        let table = index.load_records()?.table;

        let mut extensions = BTreeMap::new();
        for record in table.iter() {
            *extensions.entry(record.extension.clone()).or_insert(0) += 1;
        }

        let embedding_count = match index.configured_spaces() {
            Ok(spaces) => index.preferred_vectors(spaces, &table)?.1.len(),
            Err(_) => 0,
        };
        let cluster_count = manifest.as_ref().map_or(0, |m| m.cluster_count);

        let active_provider = match (index.provider_config(), index.credentials()) {
            (Ok(config), Ok(credentials)) => Some(describe(&config, &credentials)),
            _ => None,
        };

        Ok(IndexStats {
            total_files: table.len(),
            total_size_bytes: table.total_bytes(),
            extensions,
            last_updated: manifest.as_ref().map(|m| m.updated_at),
            scan_path: index.root().to_path_buf(),
            has_embeddings: embedding_count > 0,
            embedding_count,
            has_clusters: cluster_count > 0,
            cluster_count,
            active_provider,
        })
    }

    /// The `days` most recent modification days, newest first.
    pub fn timeline(&self, path: &Path, days: usize) -> Result<Timeline> {
        let index = self.open(path)?;
        let table = index.load_records()?.table;

        let mut by_date: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for record in table.iter() {
            let date = record.modified().format("%Y-%m-%d").to_string();
            by_date.entry(date).or_default().push(record.path.clone());
        }

        let days: Vec<TimelineDay> = by_date
            .into_iter()
            .rev()
            .take(days)
            .map(|(date, files)| TimelineDay {
                date,
                count: files.len(),
                files,
            })
            .collect();

        Ok(Timeline {
            total_days: days.len(),
            total_files: table.len(),
            days,
        })
    }

    /// Read-only consistency report. Nothing is repaired here.
    pub fn check_index(&self, path: &Path) -> Result<HealthReport> {
        let index = self.open(path)?;
        let mut report = HealthReport::default();

        match index.manifest() {
            Ok(Some(_)) => report.manifest_readable = true,
            Ok(None) => report.issues.push(format!("{MANIFEST_FILE} is missing")),
            Err(e) => report.issues.push(format!("{MANIFEST_FILE} unreadable: {e}")),
        }

        let table = match index.load_records() {
            Ok(loaded) => {
                report.records_readable = true;
                report.records_dropped = loaded.dropped;
                if loaded.dropped > 0 {
                    report.issues.push(format!(
                        "{} record(s) in {RECORDS_FILE} could not be decoded",
                        loaded.dropped
                    ));
                }
                loaded.table
            }
            Err(e) => {
                report.issues.push(format!("{RECORDS_FILE} unreadable: {e}"));
                Default::default()
            }
        };

        for record in table.iter() {
            if !record.absolute(index.root()).is_file() {
                report.missing_files += 1;
                if report.missing_examples.len() < MISSING_FILES_SHOWN {
                    report.missing_examples.push(record.path.clone());
                }
            }
        }
        if report.missing_files > 0 {
            report.issues.push(format!(
                "{} indexed file(s) no longer exist; rescan to drop them",
                report.missing_files
            ));
        }

        match index.configured_spaces() {
            Ok(spaces) => {
                report.cache_readable = true;
                let fingerprints = table.fingerprints();
                for space in spaces {
                    let cache = index.cache_for(space);
                    match cache.load() {
                        Ok(snapshot) => {
                            report.corrupt_cache_records += snapshot.dropped;
                            let total = snapshot.len();
                            let live = snapshot.retain_live(&fingerprints).len();
                            report.cache_records += live;
                            report.orphaned_embeddings += total - live;
                        }
                        Err(CacheError::Io(e)) => return Err(e.into()),
                        Err(e) => {
                            report.cache_readable = false;
                            report.issues.push(format!(
                                "embedding cache {} unreadable: {e}",
                                cache.space().label()
                            ));
                        }
                    }
                }
            }
            Err(e) => report.issues.push(format!("provider configuration: {e}")),
        }
        if report.corrupt_cache_records > 0 {
            report.issues.push(format!(
                "{} damaged cache record(s) will be re-embedded",
                report.corrupt_cache_records
            ));
        }

        if let Some(progress) = BatchProgress::load(index.storage())? {
            report.stale_progress = progress.status == BatchStatus::Running
                && !self.runs.is_active(index.dir())
                && FileLock::is_free(index.dir(), EMBED_LOCK);
            if report.stale_progress {
                report
                    .issues
                    .push(format!("run {} was interrupted; start embedding to resume", progress.run_id));
            }
        }

        report.healthy = report.issues.is_empty();
        Ok(report)
    }

    pub fn error_log(&self, path: &Path, limit: usize) -> Result<Vec<ErrorEntry>> {
        Ok(self.open(path)?.error_log().recent(limit)?)
    }

    pub fn clear_error_log(&self, path: &Path) -> Result<()> {
        Ok(self.open(path)?.error_log().clear()?)
    }

    pub fn provider_config(&self, path: &Path) -> Result<ProviderView> {
        let index = self.open(path)?;
        Ok(describe(&index.provider_config()?, &index.credentials()?))
    }

    /// Validate and persist a provider entry. Secrets go to the credential
    /// store, never to `provider.yaml`.
    pub fn save_provider_config(&self, path: &Path, update: &ProviderUpdate) -> Result<ProviderView> {
        let index = self.open(path)?;
        let mut credentials = index.credentials()?;

        for member in update.config.members() {
            if let (Some(key), Some(secret)) =
                (member.credential_key(), update.secrets.get(member.kind()))
            {
                credentials.set(key, secret);
            }
        }
        update.config.validate(&credentials)?;

        credentials.save(index.storage())?;
        update.config.save(index.storage())?;
        self.forget_provider(&index);
        index.refresh_manifest(None)?;

        log::info!(
            "provider index={} kind={} model={}",
            index.dir().display(),
            update.config.kind(),
            update.config.model_id()
        );
        Ok(describe(&update.config, &credentials))
    }

    /// Exercise each configured provider with a one-line request.
    pub fn validate_provider(&self, path: &Path) -> Result<Vec<ValidationReport>> {
        let index = self.open(path)?;
        Ok(provider::validate_config(
            &index.provider_config()?,
            &index.credentials()?,
            &index.build_context(),
        ))
    }

    pub fn export_index(&self, path: &Path, output: &Path) -> Result<Vec<String>> {
        let index = self.open(path)?;
        Ok(backup::export_to_file(index.dir(), output)?)
    }

    /// Restore an archive into `storage_dir`. Refused while a run holds it.
    pub fn import_index(&self, archive: &Path, storage_dir: &Path) -> Result<Vec<String>> {
        if self.runs.is_active(storage_dir)
            || (storage_dir.is_dir() && !FileLock::is_free(storage_dir, EMBED_LOCK))
        {
            return Err(IndexError::AlreadyRunning(storage_dir.to_path_buf()));
        }
        Ok(backup::import_index(archive, storage_dir)?)
    }

    /// Cancel every run this process owns and wait for them to stop.
    pub fn shutdown(&self) {
        let cancelled = self.runs.cancel_all();
        if cancelled > 0 {
            log::info!("shutdown: cancelling {cancelled} embedding run(s)");
        }
        self.runs.join_all();
    }
}
