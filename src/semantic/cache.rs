//! Embedding Cache: append-only binary vector files, one per embedding space.
//!
//! File format: embeddings/<space>.bin
//!
//! Header (47 bytes):
//! - version: u8 (1)
//! - space_id: [u8; 32] (SHA256 of "provider\0model")
//! - dimensions: u16 (little-endian)
//! - created_at: i64 (unix seconds, little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Records (repeated, fixed size):
//! - fingerprint: [u8; 32]
//! - generated_at: i64 (unix seconds)
//! - embedding: [f32; dimensions] (little-endian)
//! - checksum: u32 (CRC32 of the record bytes before it)
//!
//! Records are only ever appended. A record whose checksum fails is skipped
//! and a partially written tail is ignored, so a reader sees every record
//! either whole or not at all. Records for fingerprints no longer present in
//! the file table are orphans: readers filter them out and `compact` removes
//! them.

use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::records::Fingerprint;

pub const CACHE_DIR: &str = "embeddings";

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// version(1) + space_id(32) + dimensions(2) + created_at(8) + checksum(4)
const HEADER_SIZE: usize = 47;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("cache file belongs to a different provider/model")]
    SpaceMismatch,

    #[error("Checksum mismatch: cache header is corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// The (provider, model) pair vectors belong to, plus its dimensionality.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EmbeddingSpace {
    pub provider: String,
    pub model: String,
    pub dimensions: usize,
}

impl EmbeddingSpace {
    pub fn new(provider: impl Into<String>, model: impl Into<String>, dimensions: usize) -> Self {
        EmbeddingSpace {
            provider: provider.into(),
            model: model.into(),
            dimensions,
        }
    }

    pub fn space_id(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.provider.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.model.as_bytes());
        hasher.finalize().into()
    }

    pub fn file_name(&self) -> String {
        let hex: String = self.space_id()[..8]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect();
        format!("{hex}.bin")
    }

    pub fn label(&self) -> String {
        format!("{}/{}", self.provider, self.model)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EmbeddingRecord {
    pub fingerprint: Fingerprint,
    pub generated_at: DateTime<Utc>,
    pub vector: Vec<f32>,
}

impl EmbeddingRecord {
    pub fn new(fingerprint: Fingerprint, vector: Vec<f32>) -> Self {
        EmbeddingRecord {
            fingerprint,
            generated_at: Utc::now(),
            vector,
        }
    }
}

/// Consistent view of one cache file at load time.
#[derive(Debug, Default)]
pub struct CacheSnapshot {
    pub dimensions: usize,
    pub records: HashMap<Fingerprint, EmbeddingRecord>,
    /// Records skipped because their checksum failed or they were cut short
    pub dropped: usize,
}

impl CacheSnapshot {
    pub fn vector(&self, fingerprint: &Fingerprint) -> Option<&[f32]> {
        self.records.get(fingerprint).map(|r| r.vector.as_slice())
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.records.contains_key(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop orphans: keep only records whose fingerprint is still live.
    pub fn retain_live(mut self, live: &HashSet<Fingerprint>) -> Self {
        self.records.retain(|fp, _| live.contains(fp));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactReport {
    pub kept: usize,
    pub removed: usize,
}

#[derive(Debug)]
struct Header {
    version: u8,
    space_id: [u8; 32],
    dimensions: u16,
}

pub struct EmbeddingCache {
    path: PathBuf,
    space: EmbeddingSpace,
}

impl EmbeddingCache {
    /// Cache for `space` inside the `embeddings/` directory of an index.
    pub fn new(cache_dir: &Path, space: EmbeddingSpace) -> Self {
        let path = cache_dir.join(space.file_name());
        Self { path, space }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn space(&self) -> &EmbeddingSpace {
        &self.space
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    fn record_size(&self) -> usize {
        Fingerprint::LEN + 8 + self.space.dimensions * 4 + 4
    }

    /// Load every intact record. A missing file is an empty cache.
    pub fn load(&self) -> Result<CacheSnapshot, CacheError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(CacheSnapshot {
                    dimensions: self.space.dimensions,
                    ..Default::default()
                })
            }
            Err(e) => return Err(e.into()),
        };

        let file_len = file.metadata()?.len() as usize;
        if file_len < HEADER_SIZE {
            // header never finished writing; the next append rewrites it
            return Ok(CacheSnapshot {
                dimensions: self.space.dimensions,
                ..Default::default()
            });
        }
        let mut reader = BufReader::new(file);

        let header = read_header(&mut reader)?;
        self.validate_header(&header)?;

        let record_size = self.record_size();
        let body = file_len.saturating_sub(HEADER_SIZE);
        let whole = body / record_size;

        let mut snapshot = CacheSnapshot {
            dimensions: self.space.dimensions,
            records: HashMap::with_capacity(whole),
            dropped: usize::from(body % record_size != 0),
        };

        let mut buf = vec![0u8; record_size];
        for _ in 0..whole {
            reader.read_exact(&mut buf)?;
            match self.decode_record(&buf) {
                Some(record) => {
                    // later appends supersede earlier ones
                    snapshot.records.insert(record.fingerprint, record);
                }
                None => snapshot.dropped += 1,
            }
        }

        if snapshot.dropped > 0 {
            log::warn!(
                "cache={} skipped {} damaged record(s)",
                self.space.label(),
                snapshot.dropped
            );
        }

        Ok(snapshot)
    }

    /// Validate the header alone. A missing or header-less file passes.
    pub fn check(&self) -> Result<(), CacheError> {
        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if (file.metadata()?.len() as usize) < HEADER_SIZE {
            return Ok(());
        }
        let header = read_header(&mut file)?;
        self.validate_header(&header)
    }

    /// Load and drop records whose fingerprint is not in `live`.
    pub fn load_live(&self, live: &HashSet<Fingerprint>) -> Result<CacheSnapshot, CacheError> {
        Ok(self.load()?.retain_live(live))
    }

    /// Append records, creating the file when needed. A torn tail left by an
    /// interrupted append is cut off first so new records stay aligned.
    pub fn append(&self, records: &[EmbeddingRecord]) -> Result<(), CacheError> {
        for record in records {
            if record.vector.len() != self.space.dimensions {
                return Err(CacheError::DimensionMismatch {
                    expected: self.space.dimensions,
                    got: record.vector.len(),
                });
            }
        }
        if records.is_empty() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)?;

        let len = file.metadata()?.len() as usize;
        if len < HEADER_SIZE {
            file.set_len(0)?;
            file.write_all(&self.encode_header())?;
        } else {
            let header = read_header(&mut file)?;
            self.validate_header(&header)?;

            let record_size = self.record_size();
            let body = len - HEADER_SIZE;
            if body % record_size != 0 {
                let aligned = HEADER_SIZE + (body / record_size) * record_size;
                log::warn!(
                    "cache={} truncating partial record at offset {aligned}",
                    self.space.label()
                );
                file.set_len(aligned as u64)?;
            }
        }

        file.seek(SeekFrom::End(0))?;
        let mut writer = BufWriter::new(file);
        for record in records {
            writer.write_all(&self.encode_record(record))?;
        }
        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        file.sync_data()?;

        Ok(())
    }

    /// Rewrite the file keeping only live records, one per fingerprint.
    ///
    /// Uses atomic write: temp file -> fsync -> rename
    pub fn compact(&self, live: &HashSet<Fingerprint>) -> Result<CompactReport, CacheError> {
        if !self.exists() {
            return Ok(CompactReport {
                kept: 0,
                removed: 0,
            });
        }

        let snapshot = self.load()?;
        let total = snapshot.records.len();
        let snapshot = snapshot.retain_live(live);
        let report = CompactReport {
            kept: snapshot.records.len(),
            removed: total - snapshot.records.len(),
        };

        if report.removed == 0 && snapshot.dropped == 0 {
            return Ok(report);
        }

        let temp_path = self.path.with_extension("tmp");
        let result = self.write_all(&temp_path, &snapshot);
        if let Err(e) = result {
            let _ = std::fs::remove_file(&temp_path);
            return Err(e);
        }
        std::fs::rename(&temp_path, &self.path)?;

        log::info!(
            "cache={} compacted kept={} removed={}",
            self.space.label(),
            report.kept,
            report.removed
        );
        Ok(report)
    }

    /// Delete the cache file if it exists.
    pub fn reset(&self) -> Result<(), CacheError> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn write_all(&self, path: &Path, snapshot: &CacheSnapshot) -> Result<(), CacheError> {
        let mut writer = BufWriter::new(File::create(path)?);
        writer.write_all(&self.encode_header())?;

        let mut records: Vec<&EmbeddingRecord> = snapshot.records.values().collect();
        records.sort_by_key(|r| r.fingerprint);
        for record in records {
            writer.write_all(&self.encode_record(record))?;
        }

        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        file.sync_all()?;
        Ok(())
    }

    fn validate_header(&self, header: &Header) -> Result<(), CacheError> {
        if header.version > FORMAT_VERSION {
            return Err(CacheError::VersionMismatch(header.version, FORMAT_VERSION));
        }

        if header.space_id != self.space.space_id() {
            return Err(CacheError::SpaceMismatch);
        }

        if header.dimensions as usize != self.space.dimensions {
            return Err(CacheError::DimensionMismatch {
                expected: self.space.dimensions,
                got: header.dimensions as usize,
            });
        }

        Ok(())
    }

    fn encode_header(&self) -> [u8; HEADER_SIZE] {
        let mut header_bytes = [0u8; HEADER_SIZE];

        header_bytes[0] = FORMAT_VERSION;
        header_bytes[1..33].copy_from_slice(&self.space.space_id());
        header_bytes[33..35].copy_from_slice(&(self.space.dimensions as u16).to_le_bytes());
        header_bytes[35..43].copy_from_slice(&Utc::now().timestamp().to_le_bytes());

        let checksum = crc32fast::hash(&header_bytes[0..43]);
        header_bytes[43..47].copy_from_slice(&checksum.to_le_bytes());

        header_bytes
    }

    fn encode_record(&self, record: &EmbeddingRecord) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.record_size());
        bytes.extend_from_slice(record.fingerprint.as_bytes());
        bytes.extend_from_slice(&record.generated_at.timestamp().to_le_bytes());
        for value in &record.vector {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        let checksum = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&checksum.to_le_bytes());
        bytes
    }

    fn decode_record(&self, bytes: &[u8]) -> Option<EmbeddingRecord> {
        let (body, tail) = bytes.split_at(bytes.len() - 4);
        let stored = u32::from_le_bytes(tail.try_into().ok()?);
        if crc32fast::hash(body) != stored {
            return None;
        }

        let mut fingerprint = [0u8; 32];
        fingerprint.copy_from_slice(&body[..32]);
        let generated_at = i64::from_le_bytes(body[32..40].try_into().ok()?);

        let vector = body[40..]
            .chunks_exact(4)
            .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        Some(EmbeddingRecord {
            fingerprint: Fingerprint::from_bytes(fingerprint),
            generated_at: DateTime::from_timestamp(generated_at, 0).unwrap_or_default(),
            vector,
        })
    }
}

/// Read the header only, for callers that need a file's space before loading it.
fn read_header<R: Read>(reader: &mut R) -> Result<Header, CacheError> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_bytes)?;

    let version = header_bytes[0];
    if version > FORMAT_VERSION {
        return Err(CacheError::VersionMismatch(version, FORMAT_VERSION));
    }

    let stored_checksum = u32::from_le_bytes([
        header_bytes[43],
        header_bytes[44],
        header_bytes[45],
        header_bytes[46],
    ]);
    if stored_checksum != crc32fast::hash(&header_bytes[0..43]) {
        return Err(CacheError::ChecksumMismatch);
    }

    let mut space_id = [0u8; 32];
    space_id.copy_from_slice(&header_bytes[1..33]);

    Ok(Header {
        version,
        space_id,
        dimensions: u16::from_le_bytes([header_bytes[33], header_bytes[34]]),
    })
}
