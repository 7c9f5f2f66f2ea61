//! Cross-module scenarios. Every test works in its own temp dir and embeds
//! with the offline hashing provider unless it says otherwise.

mod embedding;
mod providers;
mod search;
mod similarity;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;

use crate::batch::{BatchProgress, CancelToken, EmbedOptions};
use crate::config::Config;
use crate::provider::{EmbeddingProvider, HashingProvider, ProviderConfig, ProviderError};
use crate::scanner::ScanOptions;
use crate::service::{IndexService, ProviderUpdate};

pub const DIMS: usize = 64;

pub struct Fixture {
    pub root: TempDir,
    pub dir: PathBuf,
    pub service: IndexService,
}

impl Fixture {
    pub fn path(&self, relative: &str) -> PathBuf {
        self.root.path().join(relative)
    }

    pub fn rescan(&self) -> crate::scanner::ScanReport {
        self.service
            .scan(self.root.path(), &ScanOptions::default())
            .unwrap()
    }
}

pub fn write_tree(root: &Path, files: &[(&str, &str)]) {
    for (name, content) in files {
        let path = root.join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }
}

/// Scanned index using the hashing provider.
pub fn fixture(files: &[(&str, &str)]) -> Fixture {
    let root = tempfile::tempdir().unwrap();
    write_tree(root.path(), files);

    let service = IndexService::new();
    let report = service
        .scan(root.path(), &ScanOptions::default())
        .unwrap();
    let dir = report.index_path;

    service
        .save_provider_config(
            &dir,
            &ProviderUpdate {
                config: ProviderConfig::Hashing { dimensions: DIMS },
                secrets: BTreeMap::new(),
            },
        )
        .unwrap();

    Fixture { root, dir, service }
}

pub fn set_parallelism(dir: &Path, parallelism: usize) {
    let mut config = Config::load_with(dir).unwrap();
    config.embedding.parallelism = parallelism;
    config.save(dir).unwrap();
}

/// Start a run and block until it ends.
pub fn embed(
    fixture: &Fixture,
    provider: Arc<dyn EmbeddingProvider>,
    options: &EmbedOptions,
) -> BatchProgress {
    fixture
        .service
        .start_embedding_with(&fixture.dir, provider, options)
        .unwrap();
    fixture
        .service
        .wait_for_embedding(&fixture.dir)
        .unwrap()
        .unwrap()
}

/// Hashing provider that records every input and can ask for cancellation
/// after a given number of calls.
pub struct CountingProvider {
    inner: HashingProvider,
    pub calls: AtomicUsize,
    pub inputs: Mutex<Vec<String>>,
    cancel_after: Option<(usize, PathBuf)>,
}

impl CountingProvider {
    pub fn new() -> Self {
        CountingProvider {
            inner: HashingProvider::new(DIMS),
            calls: AtomicUsize::new(0),
            inputs: Mutex::new(vec![]),
            cancel_after: None,
        }
    }

    pub fn cancelling_after(calls: usize, dir: &Path) -> Self {
        CountingProvider {
            cancel_after: Some((calls, dir.to_path_buf())),
            ..Self::new()
        }
    }

    pub fn seen(&self) -> Vec<String> {
        self.inputs.lock().unwrap().clone()
    }
}

impl EmbeddingProvider for CountingProvider {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }

    fn dimensions(&self) -> usize {
        self.inner.dimensions()
    }

    fn max_batch_size(&self) -> usize {
        self.inner.max_batch_size()
    }

    fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.inputs.lock().unwrap().extend(inputs.iter().cloned());
        let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, dir)) = &self.cancel_after {
            if calls == *after {
                CancelToken::request(dir).unwrap();
            }
        }
        self.inner.embed(inputs)
    }
}

/// Serve `router` on an ephemeral local port from a background runtime.
pub fn spawn_server(router: axum::Router) -> std::net::SocketAddr {
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            tx.send(listener.local_addr().unwrap()).unwrap();
            axum::serve(listener, router).await.unwrap();
        });
    });
    rx.recv().unwrap()
}
