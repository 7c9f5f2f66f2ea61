//! File Record Store: per-file metadata and content fingerprints.
//!
//! The whole table lives in `files.json` and is replaced atomically on every
//! scan commit. Loading is tolerant: a record that fails to decode is dropped
//! (and picked up again by the next scan) instead of failing the index.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::storage::BackendLocal;

pub const RECORDS_FILE: &str = "files.json";
const RECORDS_VERSION: u32 = 1;
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// SHA-256 of a file's bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub const LEN: usize = 32;

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Fingerprint(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn of_bytes(data: &[u8]) -> Self {
        Fingerprint(Sha256::digest(data).into())
    }

    /// Stream the file through the hasher without loading it whole.
    pub fn of_file(path: &Path) -> std::io::Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; HASH_BUFFER_SIZE];
        loop {
            let read = file.read(&mut buf)?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        Ok(Fingerprint(hasher.finalize().into()))
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 64 || !hex.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
        }
        Some(Fingerprint(bytes))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({}..)", &self.to_hex()[..12])
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Fingerprint::from_hex(&hex)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid fingerprint `{hex}`")))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Path relative to the index root, `/`-separated
    pub path: String,
    pub size: u64,
    /// Last-modified time as unix nanoseconds
    pub mtime_ns: i64,
    pub extension: String,
    pub fingerprint: Fingerprint,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl FileRecord {
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Immediate parent directory name, if the file is not at the root.
    pub fn parent_dir(&self) -> Option<&str> {
        let mut parts = self.path.rsplit('/');
        parts.next();
        parts.next()
    }

    pub fn modified(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_nanos(self.mtime_ns)
    }

    pub fn absolute(&self, root: &Path) -> PathBuf {
        root.join(&self.path)
    }
}

/// Which extensions a scan indexes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "extensions", rename_all = "lowercase")]
pub enum ExtensionFilter {
    All,
    Only(BTreeSet<String>),
}

impl ExtensionFilter {
    /// Build from a request. An explicit list wins over the defaults;
    /// `allow_all` wins over both.
    pub fn from_request(extensions: Option<&[String]>, allow_all: bool, defaults: &[String]) -> Self {
        if allow_all {
            return ExtensionFilter::All;
        }
        let source = extensions.unwrap_or(defaults);
        ExtensionFilter::Only(source.iter().map(|e| normalize_extension(e)).collect())
    }

    pub fn matches(&self, extension: &str) -> bool {
        match self {
            ExtensionFilter::All => true,
            ExtensionFilter::Only(set) => set.contains(extension),
        }
    }
}

pub fn normalize_extension(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_lowercase()
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RecordTable {
    records: BTreeMap<String, FileRecord>,
}

impl RecordTable {
    pub fn get(&self, path: &str) -> Option<&FileRecord> {
        self.records.get(path)
    }

    pub fn insert(&mut self, record: FileRecord) -> Option<FileRecord> {
        self.records.insert(record.path.clone(), record)
    }

    /// Records ordered by path.
    pub fn iter(&self) -> impl Iterator<Item = &FileRecord> {
        self.records.values()
    }

    pub fn paths(&self) -> impl Iterator<Item = &String> {
        self.records.keys()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.records.values().map(|r| r.size).sum()
    }

    pub fn fingerprints(&self) -> HashSet<Fingerprint> {
        self.records.values().map(|r| r.fingerprint).collect()
    }
}

impl FromIterator<FileRecord> for RecordTable {
    fn from_iter<T: IntoIterator<Item = FileRecord>>(iter: T) -> Self {
        RecordTable {
            records: iter.into_iter().map(|r| (r.path.clone(), r)).collect(),
        }
    }
}

#[derive(Deserialize)]
struct RecordsDocument {
    #[allow(dead_code)]
    version: u32,
    records: Vec<serde_json::Value>,
}

#[derive(Serialize)]
struct RecordsDocumentRef<'a> {
    version: u32,
    records: Vec<&'a FileRecord>,
}

#[derive(Debug, Default)]
pub struct LoadedRecords {
    pub table: RecordTable,
    /// Entries that failed to decode
    pub dropped: usize,
}

/// Durable home of the [`RecordTable`].
#[derive(Clone, Debug)]
pub struct RecordStore {
    storage: BackendLocal,
}

impl RecordStore {
    pub fn new(storage: BackendLocal) -> Self {
        RecordStore { storage }
    }

    pub fn load(&self) -> std::io::Result<LoadedRecords> {
        let document: Option<RecordsDocument> = match self.storage.read_json(RECORDS_FILE) {
            Ok(doc) => doc,
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                log::warn!("{RECORDS_FILE} is corrupt, starting from an empty table: {e}");
                return Ok(LoadedRecords {
                    table: RecordTable::default(),
                    dropped: 1,
                });
            }
            Err(e) => return Err(e),
        };

        let Some(document) = document else {
            return Ok(LoadedRecords::default());
        };

        let mut loaded = LoadedRecords::default();
        for value in document.records {
            match serde_json::from_value::<FileRecord>(value) {
                Ok(record) => {
                    loaded.table.insert(record);
                }
                Err(e) => {
                    log::warn!("dropping unreadable file record: {e}");
                    loaded.dropped += 1;
                }
            }
        }

        Ok(loaded)
    }

    /// Replace the stored table in one atomic write.
    pub fn commit(&self, table: &RecordTable) -> std::io::Result<()> {
        let document = RecordsDocumentRef {
            version: RECORDS_VERSION,
            records: table.iter().collect(),
        };
        self.storage.write_json(RECORDS_FILE, &document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageManager;

    fn record(path: &str, content: &[u8]) -> FileRecord {
        let now = Utc::now();
        FileRecord {
            path: path.to_string(),
            size: content.len() as u64,
            mtime_ns: 1_700_000_000_000_000_000,
            extension: "txt".into(),
            fingerprint: Fingerprint::of_bytes(content),
            first_seen: now,
            last_seen: now,
        }
    }

    #[test]
    fn test_fingerprint_hex_roundtrip() {
        let fp = Fingerprint::of_bytes(b"hello");
        assert_eq!(Fingerprint::from_hex(&fp.to_hex()), Some(fp));
        assert_eq!(Fingerprint::from_hex("zz"), None);
    }

    #[test]
    fn test_fingerprint_of_file_matches_bytes() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.txt");
        std::fs::write(&path, b"some content").unwrap();
        assert_eq!(
            Fingerprint::of_file(&path).unwrap(),
            Fingerprint::of_bytes(b"some content")
        );
    }

    #[test]
    fn test_record_name_and_parent() {
        let r = record("docs/notes/plan.md", b"x");
        assert_eq!(r.name(), "plan.md");
        assert_eq!(r.parent_dir(), Some("notes"));

        let top = record("readme.md", b"x");
        assert_eq!(top.parent_dir(), None);
    }

    #[test]
    fn test_extension_filter() {
        let defaults = vec!["md".to_string()];
        let filter = ExtensionFilter::from_request(Some(&[".RS".to_string()]), false, &defaults);
        assert!(filter.matches("rs"));
        assert!(!filter.matches("md"));

        let filter = ExtensionFilter::from_request(None, false, &defaults);
        assert!(filter.matches("md"));

        let filter = ExtensionFilter::from_request(None, true, &defaults);
        assert!(filter.matches("anything"));
    }

    #[test]
    fn test_commit_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let store = RecordStore::new(BackendLocal::new(tmp.path()).unwrap());

        let table: RecordTable = vec![record("a.txt", b"a"), record("b.txt", b"b")]
            .into_iter()
            .collect();
        store.commit(&table).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.dropped, 0);
        assert_eq!(loaded.table, table);
    }

    #[test]
    fn test_corrupt_record_is_dropped() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = BackendLocal::new(tmp.path()).unwrap();
        let store = RecordStore::new(storage.clone());

        let good = serde_json::to_value(record("good.txt", b"g")).unwrap();
        let doc = serde_json::json!({
            "version": 1,
            "records": [good, {"path": "bad.txt", "fingerprint": "nope"}],
        });
        storage
            .write(RECORDS_FILE, doc.to_string().as_bytes())
            .unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.dropped, 1);
        assert_eq!(loaded.table.len(), 1);
        assert!(loaded.table.get("good.txt").is_some());
    }

    #[test]
    fn test_unparsable_table_starts_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = BackendLocal::new(tmp.path()).unwrap();
        storage.write(RECORDS_FILE, b"{{{{").unwrap();

        let loaded = RecordStore::new(storage).load().unwrap();
        assert!(loaded.table.is_empty());
    }
}
