use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

use crate::storage::{BackendLocal, StorageManager};

pub const ERRORS_FILE: &str = "errors.json";
/// Oldest entries are discarded beyond this
pub const MAX_ENTRIES: usize = 1000;

/// Serializes read-modify-write cycles between a scan and an embedding run
/// in the same process.
static WRITE_GUARD: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorEntry {
    pub timestamp: DateTime<Utc>,
    /// `scan`, `extract` or `embed`
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub message: String,
}

impl ErrorEntry {
    pub fn new(operation: &str, path: Option<&str>, message: impl Into<String>) -> Self {
        ErrorEntry {
            timestamp: Utc::now(),
            operation: operation.to_string(),
            path: path.map(str::to_string),
            message: message.into(),
        }
    }
}

/// Persistent, capped log of per-file failures.
#[derive(Clone, Debug)]
pub struct ErrorLog {
    storage: BackendLocal,
}

impl ErrorLog {
    pub fn new(storage: BackendLocal) -> Self {
        ErrorLog { storage }
    }

    fn read_all(&self) -> std::io::Result<Vec<ErrorEntry>> {
        match self.storage.read_json::<Vec<ErrorEntry>>(ERRORS_FILE) {
            Ok(entries) => Ok(entries.unwrap_or_default()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                log::warn!("{ERRORS_FILE} is unreadable, starting a new log: {e}");
                Ok(vec![])
            }
            Err(e) => Err(e),
        }
    }

    pub fn append(&self, entries: Vec<ErrorEntry>) -> std::io::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let _guard = WRITE_GUARD.lock().unwrap_or_else(|e| e.into_inner());

        let mut all = self.read_all()?;
        all.extend(entries);
        if all.len() > MAX_ENTRIES {
            all.drain(..all.len() - MAX_ENTRIES);
        }
        self.storage.write_json(ERRORS_FILE, &all)
    }

    /// Most recent entries first.
    pub fn recent(&self, limit: usize) -> std::io::Result<Vec<ErrorEntry>> {
        let mut all = self.read_all()?;
        all.reverse();
        all.truncate(limit);
        Ok(all)
    }

    pub fn clear(&self) -> std::io::Result<()> {
        let _guard = WRITE_GUARD.lock().unwrap_or_else(|e| e.into_inner());
        if self.storage.exists(ERRORS_FILE) {
            self.storage.delete(ERRORS_FILE)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recent_is_newest_first() {
        let tmp = tempfile::tempdir().unwrap();
        let log = ErrorLog::new(BackendLocal::new(tmp.path()).unwrap());

        log.append(vec![ErrorEntry::new("scan", Some("a.txt"), "denied")])
            .unwrap();
        log.append(vec![ErrorEntry::new("embed", None, "timeout")])
            .unwrap();

        let recent = log.recent(10).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].operation, "embed");
        assert_eq!(recent[1].path.as_deref(), Some("a.txt"));

        assert_eq!(log.recent(1).unwrap().len(), 1);
    }

    #[test]
    fn test_capped() {
        let tmp = tempfile::tempdir().unwrap();
        let log = ErrorLog::new(BackendLocal::new(tmp.path()).unwrap());

        let entries = (0..MAX_ENTRIES + 5)
            .map(|i| ErrorEntry::new("scan", None, format!("e{i}")))
            .collect();
        log.append(entries).unwrap();

        let recent = log.recent(usize::MAX).unwrap();
        assert_eq!(recent.len(), MAX_ENTRIES);
        assert_eq!(recent[0].message, format!("e{}", MAX_ENTRIES + 4));
        assert_eq!(recent.last().unwrap().message, "e5");
    }

    #[test]
    fn test_clear() {
        let tmp = tempfile::tempdir().unwrap();
        let log = ErrorLog::new(BackendLocal::new(tmp.path()).unwrap());
        log.append(vec![ErrorEntry::new("scan", None, "x")]).unwrap();
        log.clear().unwrap();
        assert!(log.recent(10).unwrap().is_empty());
        // clearing an empty log is fine
        log.clear().unwrap();
    }
}
