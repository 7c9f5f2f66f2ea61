use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::lock::{FileLock, EMBED_LOCK};
use crate::storage::{BackendLocal, StorageManager};

pub const PROGRESS_FILE: &str = "progress.json";
pub const CANCEL_FLAG: &str = "cancel.flag";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Running,
    /// Interrupted run; the next start resumes it
    Paused,
    Complete,
    Cancelled,
    Error,
}

impl BatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Complete | BatchStatus::Cancelled | BatchStatus::Error
        )
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BatchStatus::Running => "running",
            BatchStatus::Paused => "paused",
            BatchStatus::Complete => "complete",
            BatchStatus::Cancelled => "cancelled",
            BatchStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Persisted state of the latest embedding run of an index.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub run_id: String,
    pub provider: String,
    pub model: String,
    pub total_files: usize,
    pub processed_files: usize,
    pub embedded_files: usize,
    pub failed_files: usize,
    pub current_batch: usize,
    pub total_batches: usize,
    pub batch_size: usize,
    pub status: BatchStatus,
    #[serde(default)]
    pub message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl BatchProgress {
    pub fn start(provider: &str, model: &str, batch_size: usize) -> Self {
        let now = Utc::now();
        BatchProgress {
            run_id: rusty_ulid::generate_ulid_string(),
            provider: provider.to_string(),
            model: model.to_string(),
            total_files: 0,
            processed_files: 0,
            embedded_files: 0,
            failed_files: 0,
            current_batch: 0,
            total_batches: 0,
            batch_size,
            status: BatchStatus::Running,
            message: None,
            started_at: now,
            last_updated: now,
            finished_at: None,
            errors: vec![],
        }
    }

    pub fn load(storage: &BackendLocal) -> std::io::Result<Option<Self>> {
        storage.read_json(PROGRESS_FILE)
    }

    pub fn save(&mut self, storage: &BackendLocal) -> std::io::Result<()> {
        self.last_updated = Utc::now();
        storage.write_json(PROGRESS_FILE, self)
    }

    /// Keep the newest `cap` messages.
    pub fn push_error(&mut self, message: String, cap: usize) {
        self.errors.push(message);
        if self.errors.len() > cap {
            self.errors.drain(..self.errors.len() - cap);
        }
    }

    /// Record `processed` more files, clamped to the total.
    pub fn advance(&mut self, embedded: usize, failed: usize) {
        self.embedded_files += embedded;
        self.failed_files += failed;
        self.processed_files = (self.processed_files + embedded + failed).min(self.total_files);
    }

    /// Move to a final status. A run that already ended keeps its status.
    pub fn finish(&mut self, status: BatchStatus, message: Option<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        if message.is_some() {
            self.message = message;
        }
        self.finished_at = Some(Utc::now());
        true
    }

    /// A `running` record nobody is driving any more reads as paused.
    pub fn reconcile(mut self, dir: &Path, live: bool) -> Self {
        if self.status == BatchStatus::Running && !live && FileLock::is_free(dir, EMBED_LOCK) {
            self.status = BatchStatus::Paused;
            self.message = Some("interrupted; resumes on the next start".to_string());
        }
        self
    }
}

/// Cooperative cancellation, observed between batches.
///
/// Set in process through [`CancelToken::cancel`], or from another process by
/// creating `cancel.flag` in the storage directory.
#[derive(Clone, Debug)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    marker: PathBuf,
}

impl CancelToken {
    pub fn new(dir: &Path) -> Self {
        CancelToken {
            flag: Arc::new(AtomicBool::new(false)),
            marker: dir.join(CANCEL_FLAG),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst) || self.marker.exists()
    }

    /// Forget a stale marker left by an earlier request.
    pub fn clear(&self) {
        if self.marker.exists() {
            if let Err(e) = std::fs::remove_file(&self.marker) {
                log::warn!("failed to remove {}: {e}", self.marker.display());
            }
        }
    }

    /// Ask whichever process runs the index in `dir` to stop.
    pub fn request(dir: &Path) -> std::io::Result<()> {
        BackendLocal::new(dir)?.write(CANCEL_FLAG, b"cancel")
    }
}
