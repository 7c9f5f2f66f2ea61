use std::io::Write;
use std::path::{Path, PathBuf};

/// Flat key/value file storage for the documents an index keeps on disk.
pub trait StorageManager: Send + Sync {
    fn write(&self, ident: &str, data: &[u8]) -> std::io::Result<()>;
    fn read(&self, ident: &str) -> std::io::Result<Vec<u8>>;
    fn exists(&self, ident: &str) -> bool;
    fn delete(&self, ident: &str) -> std::io::Result<()>;
    fn list(&self) -> Vec<String>;
}

#[derive(Clone, Debug)]
pub struct BackendLocal {
    pub base_dir: PathBuf,
}

impl BackendLocal {
    pub fn new(storage_dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = storage_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&path)?;
        Ok(BackendLocal { base_dir: path })
    }

    pub fn path_of(&self, ident: &str) -> PathBuf {
        self.base_dir.join(ident)
    }

    /// Read and deserialize a JSON document. `Ok(None)` when it does not exist.
    pub fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        ident: &str,
    ) -> std::io::Result<Option<T>> {
        if !self.exists(ident) {
            return Ok(None);
        }
        let bytes = self.read(ident)?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn write_json<T: serde::Serialize>(&self, ident: &str, value: &T) -> std::io::Result<()> {
        let data = serde_json::to_vec_pretty(value)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        self.write(ident, &data)
    }
}

impl StorageManager for BackendLocal {
    fn exists(&self, ident: &str) -> bool {
        std::fs::metadata(self.path_of(ident)).is_ok()
    }

    fn read(&self, ident: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.path_of(ident))
    }

    /// Writes go to a sibling temp file which is synced and renamed over the
    /// target, so readers see either the old or the new document.
    fn write(&self, ident: &str, data: &[u8]) -> std::io::Result<()> {
        let path = self.path_of(ident);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let temp_path = self.base_dir.join(format!(
            ".{}-{}.tmp",
            rusty_ulid::generate_ulid_string(),
            ident.replace('/', "_")
        ));

        let mut file = std::fs::File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&temp_path, &path).inspect_err(|_| {
            let _ = std::fs::remove_file(&temp_path);
        })
    }

    fn delete(&self, ident: &str) -> std::io::Result<()> {
        std::fs::remove_file(self.path_of(ident))
    }

    fn list(&self) -> Vec<String> {
        std::fs::read_dir(&self.base_dir)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .filter_map(|entry| {
                        let path = entry.path();
                        if path.is_file() {
                            path.file_name()
                                .and_then(|name| name.to_str())
                                .map(|s| s.to_string())
                        } else {
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_replaces_atomically() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BackendLocal::new(tmp.path()).unwrap();

        store.write("doc.json", b"first").unwrap();
        store.write("doc.json", b"second").unwrap();

        assert_eq!(store.read("doc.json").unwrap(), b"second");
        // no temp files left behind
        assert_eq!(store.list(), vec!["doc.json".to_string()]);
    }

    #[test]
    fn test_read_json_missing_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BackendLocal::new(tmp.path()).unwrap();
        let value: Option<Vec<u32>> = store.read_json("missing.json").unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn test_read_json_invalid_is_invalid_data() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BackendLocal::new(tmp.path()).unwrap();
        store.write("bad.json", b"{not json").unwrap();
        let err = store.read_json::<Vec<u32>>("bad.json").unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }
}
