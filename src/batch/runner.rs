//! The embedding worker.
//!
//! One run per index:
//! 1. Compact every cache the provider writes to down to live fingerprints
//! 2. Backlog = unique fingerprints (by path) without a vector in the
//!    provider's primary space
//! 3. Per batch: check cancellation, extract, embed on a bounded pool, append
//!    each vector to the cache of the space that produced it
//! 4. Finish as complete, cancelled or error and refresh the manifest
//!
//! Nothing records which batches were done: a restarted run simply finds a
//! smaller backlog.

use std::collections::HashSet;
use std::sync::Arc;

use rayon::prelude::*;

use super::progress::{BatchProgress, BatchStatus, CancelToken};
use super::registry::{RunHandle, RunRegistry};
use crate::config::ConfigError;
use crate::errorlog::ErrorEntry;
use crate::errors::{IndexError, Result};
use crate::index::Index;
use crate::lock::{FileLock, EMBED_LOCK};
use crate::provider::{EmbeddingProvider, ProviderError};
use crate::records::FileRecord;
use crate::semantic::cache::{CacheError, EmbeddingCache, EmbeddingRecord, EmbeddingSpace};
use crate::semantic::preprocess::extract_payload;

#[derive(Clone, Debug, Default)]
pub struct EmbedOptions {
    /// Embed at most this many files in this run
    pub max_files: Option<usize>,
    pub batch_size: Option<usize>,
}

/// Vectors of one provider call and the space they belong to
type Tagged = (EmbeddingSpace, Vec<Vec<f32>>);

enum Outcome {
    Complete,
    Cancelled,
}

struct Worker {
    index: Index,
    provider: Arc<dyn EmbeddingProvider>,
    /// One per space the provider may write into, preferred first
    caches: Vec<EmbeddingCache>,
    cancel: CancelToken,
    max_files: Option<usize>,
    /// Held until the worker exits
    _lock: FileLock,
}

/// Start a run in the background and return its initial progress.
pub fn start(
    index: &Index,
    registry: &RunRegistry,
    provider: Arc<dyn EmbeddingProvider>,
    options: &EmbedOptions,
) -> Result<BatchProgress> {
    let caches: Vec<EmbeddingCache> = provider
        .spaces()
        .into_iter()
        .map(|space| index.cache_for(space))
        .collect();
    for cache in &caches {
        match cache.check() {
            Ok(()) => {}
            Err(CacheError::DimensionMismatch { expected, got }) => {
                return Err(ConfigError::DimensionMismatch { expected, got }.into())
            }
            // other header damage is repaired by the worker
            Err(CacheError::Io(e)) => return Err(e.into()),
            Err(e) => log::warn!("cache={} will be reset: {e}", cache.space().label()),
        }
    }

    if options.batch_size == Some(0) {
        return Err(ConfigError::Invalid("batch size must be greater than 0".into()).into());
    }
    let settings = &index.config().embedding;
    let batch_size = options
        .batch_size
        .or(settings.batch_size)
        .unwrap_or(provider.max_batch_size() * settings.parallelism)
        .max(1);

    let dir = index.dir().to_path_buf();
    registry.register(&dir, || {
        let lock = FileLock::try_acquire(&dir, EMBED_LOCK).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock {
                IndexError::AlreadyRunning(dir.clone())
            } else {
                IndexError::Io(e)
            }
        })?;

        let cancel = CancelToken::new(&dir);
        cancel.clear();
        provider.begin_run();

        let mut progress = BatchProgress::start(provider.id(), provider.model(), batch_size);
        progress.message = Some("starting".to_string());
        progress.save(index.storage())?;

        log::info!(
            "embed run={} index={} provider={} model={} batch_size={}",
            progress.run_id,
            dir.display(),
            provider.id(),
            provider.model(),
            batch_size
        );

        let worker = Worker {
            index: index.clone(),
            provider: provider.clone(),
            caches,
            cancel: cancel.clone(),
            max_files: options.max_files,
            _lock: lock,
        };
        let initial = progress.clone();
        let thread = std::thread::Builder::new()
            .name("wayfinder-embed".to_string())
            .spawn(move || worker.run(progress))?;

        Ok((RunHandle { cancel, thread }, initial))
    })
}

/// Persisted progress, with an orphaned `running` record shown as paused.
pub fn progress(index: &Index, registry: &RunRegistry) -> Result<Option<BatchProgress>> {
    let progress = match BatchProgress::load(index.storage())? {
        Some(progress) => progress,
        None => return Ok(None),
    };
    Ok(Some(
        progress.reconcile(index.dir(), registry.is_active(index.dir())),
    ))
}

/// Signal the active run. Runs owned by another process are reached through
/// the `cancel.flag` marker.
pub fn cancel(index: &Index, registry: &RunRegistry) -> Result<bool> {
    if registry.cancel(index.dir()) {
        log::info!("embed cancel requested index={}", index.dir().display());
        return Ok(true);
    }

    let foreign_run = matches!(
        BatchProgress::load(index.storage())?,
        Some(BatchProgress {
            status: BatchStatus::Running,
            ..
        })
    ) && !FileLock::is_free(index.dir(), EMBED_LOCK);

    if foreign_run {
        CancelToken::request(index.dir())?;
        log::info!("embed cancel marker written index={}", index.dir().display());
    }
    Ok(foreign_run)
}

/// Block until this process's run for `index` ends. Without one, the
/// persisted progress is returned as is.
pub fn wait(index: &Index, registry: &RunRegistry) -> Result<Option<BatchProgress>> {
    match registry.take(index.dir()) {
        Some(run) => run
            .thread
            .join()
            .map(Some)
            .map_err(|_| IndexError::Other(anyhow::anyhow!("embedding run panicked"))),
        None => progress(index, registry),
    }
}

impl Worker {
    fn run(self, mut progress: BatchProgress) -> BatchProgress {
        let result = self.execute(&mut progress);

        match result {
            Ok(Outcome::Complete) => {
                let message = format!("embedded {} file(s)", progress.embedded_files);
                progress.finish(BatchStatus::Complete, Some(message));
            }
            Ok(Outcome::Cancelled) => {
                progress.finish(BatchStatus::Cancelled, Some("cancelled".to_string()));
            }
            Err(e) => {
                log::error!("embed run={} failed: {e}", progress.run_id);
                progress.finish(BatchStatus::Error, Some(e.to_string()));
            }
        }

        if let Err(e) = progress.save(self.index.storage()) {
            log::error!("failed to persist final progress: {e}");
        }
        if let Err(e) = self.index.refresh_manifest(None) {
            log::warn!("failed to refresh manifest after embedding: {e}");
        }
        self.cancel.clear();

        log::info!(
            "embed run={} status={} processed={}/{} embedded={} failed={}",
            progress.run_id,
            progress.status,
            progress.processed_files,
            progress.total_files,
            progress.embedded_files,
            progress.failed_files
        );
        progress
    }

    fn execute(&self, progress: &mut BatchProgress) -> Result<Outcome> {
        let storage = self.index.storage();
        let settings = &self.index.config().embedding;
        let table = self.index.load_records()?.table;
        let live = table.fingerprints();

        for cache in &self.caches {
            match cache.compact(&live) {
                Ok(_) => {}
                Err(CacheError::Io(e)) => return Err(e.into()),
                Err(e) => {
                    log::warn!("cache={} unreadable, resetting: {e}", cache.space().label());
                    cache.reset()?;
                }
            }
        }
        // runs work toward the primary space; fallback vectors only fill gaps
        let primary = self
            .caches
            .first()
            .ok_or_else(|| ConfigError::Invalid("provider has no embedding space".into()))?;
        let cached = primary.load()?;

        let mut seen = HashSet::new();
        let mut backlog: Vec<&FileRecord> = table
            .iter()
            .filter(|r| !cached.contains(&r.fingerprint) && seen.insert(r.fingerprint))
            .collect();
        if let Some(max) = self.max_files {
            backlog.truncate(max);
        }
        drop(cached);

        progress.total_files = backlog.len();
        progress.total_batches = backlog.len().div_ceil(progress.batch_size);
        progress.message = Some(format!("{} file(s) to embed", backlog.len()));
        progress.save(storage)?;

        if backlog.is_empty() {
            return Ok(Outcome::Complete);
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(settings.parallelism)
            .thread_name(|i| format!("wayfinder-embed-{i}"))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build embedding pool: {e}"))?;

        for (i, batch) in backlog.chunks(progress.batch_size).enumerate() {
            if self.cancel.is_cancelled() {
                log::info!("embed run={} cancelled before batch {}", progress.run_id, i + 1);
                return Ok(Outcome::Cancelled);
            }
            progress.current_batch = i + 1;

            let root = self.index.root();
            let payloads: Vec<_> = pool.install(|| {
                batch
                    .par_iter()
                    .map(|record| {
                        extract_payload(
                            &record.absolute(root),
                            record.name(),
                            &record.extension,
                            settings.max_content_chars,
                        )
                    })
                    .collect()
            });

            let mut failures = vec![];
            for (record, payload) in batch.iter().zip(&payloads) {
                if let Some(error) = &payload.error {
                    progress.push_error(format!("{}: {error}", record.path), settings.max_errors);
                    failures.push(ErrorEntry::new("extract", Some(&record.path), error.clone()));
                }
            }

            let texts: Vec<String> = payloads.into_iter().map(|p| p.text).collect();
            let chunk = self
                .provider
                .max_batch_size()
                .min(texts.len().div_ceil(settings.parallelism))
                .max(1);

            let results: Vec<std::result::Result<Tagged, ProviderError>> = pool.install(|| {
                texts
                    .par_chunks(chunk)
                    .map(|c| self.provider.embed_tagged(c))
                    .collect()
            });

            let mut groups: Vec<(EmbeddingSpace, Vec<EmbeddingRecord>)> = vec![];
            let mut first_error = None;
            let mut failed = 0;
            for (files, result) in batch.chunks(chunk).zip(results) {
                match result {
                    Ok((space, vectors)) => {
                        let records = files
                            .iter()
                            .zip(vectors)
                            .map(|(record, vector)| EmbeddingRecord::new(record.fingerprint, vector));
                        match groups.iter_mut().find(|(s, _)| *s == space) {
                            Some((_, group)) => group.extend(records),
                            None => groups.push((space, records.collect())),
                        }
                    }
                    Err(e) => {
                        failed += files.len();
                        for record in files {
                            progress.push_error(format!("{}: {e}", record.path), settings.max_errors);
                        }
                        failures.push(ErrorEntry::new("embed", None, e.to_string()));
                        first_error.get_or_insert(e);
                    }
                }
            }

            let mut embedded = 0;
            for (space, records) in &groups {
                let cache = self
                    .caches
                    .iter()
                    .find(|c| c.space() == space)
                    .ok_or_else(|| ProviderError::SpaceUnavailable {
                        provider: self.provider.id().to_string(),
                        space: space.label(),
                    })?;
                cache.append(records)?;
                embedded += records.len();
            }
            progress.advance(embedded, failed);
            progress.message = Some(format!(
                "batch {}/{}",
                progress.current_batch, progress.total_batches
            ));
            progress.save(storage)?;

            if !failures.is_empty() {
                if let Err(e) = self.index.error_log().append(failures) {
                    log::warn!("failed to record embedding errors: {e}");
                }
            }

            log::debug!(
                "embed run={} batch={}/{} embedded={} failed={}",
                progress.run_id,
                progress.current_batch,
                progress.total_batches,
                embedded,
                failed
            );

            if let Some(e) = first_error {
                return Err(e.into());
            }
        }

        Ok(Outcome::Complete)
    }
}
