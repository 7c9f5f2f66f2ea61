use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread::JoinHandle;

use super::progress::{BatchProgress, CancelToken};
use crate::errors::{IndexError, Result};

/// An embedding run owned by this process.
pub struct RunHandle {
    pub cancel: CancelToken,
    pub thread: JoinHandle<BatchProgress>,
}

/// Active embedding runs of this process, keyed by storage directory.
#[derive(Default)]
pub struct RunRegistry {
    runs: Mutex<HashMap<PathBuf, RunHandle>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn runs(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, RunHandle>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register the run produced by `spawn` unless one is already active for `dir`.
    /// `spawn` is called with the registry locked so two starts cannot interleave.
    pub fn register<T>(
        &self,
        dir: &Path,
        spawn: impl FnOnce() -> Result<(RunHandle, T)>,
    ) -> Result<T> {
        let mut runs = self.runs();
        if let Some(run) = runs.get(dir) {
            if !run.thread.is_finished() {
                return Err(IndexError::AlreadyRunning(dir.to_path_buf()));
            }
        }
        let (handle, value) = spawn()?;
        // a finished run left in the map is replaced without being joined
        runs.insert(dir.to_path_buf(), handle);
        Ok(value)
    }

    pub fn is_active(&self, dir: &Path) -> bool {
        self.runs()
            .get(dir)
            .is_some_and(|run| !run.thread.is_finished())
    }

    /// Signal the run for `dir`. False when none is active here.
    pub fn cancel(&self, dir: &Path) -> bool {
        match self.runs().get(dir) {
            Some(run) if !run.thread.is_finished() => {
                run.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn cancel_all(&self) -> usize {
        let runs = self.runs();
        let mut signalled = 0;
        for run in runs.values().filter(|run| !run.thread.is_finished()) {
            run.cancel.cancel();
            signalled += 1;
        }
        signalled
    }

    /// Remove the run for `dir` so the caller can join it.
    pub fn take(&self, dir: &Path) -> Option<RunHandle> {
        self.runs().remove(dir)
    }

    /// Join every run, e.g. at shutdown.
    pub fn join_all(&self) {
        let runs: Vec<(PathBuf, RunHandle)> = self.runs().drain().collect();
        for (dir, run) in runs {
            if run.thread.join().is_err() {
                log::error!("embedding run for {} panicked", dir.display());
            }
        }
    }
}
