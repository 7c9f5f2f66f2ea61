//! Export and import of an index storage directory as a gzip tarball.
//!
//! Secrets, locks, the transient cancel marker and downloaded models never
//! leave the machine; import restores only the whitelisted entries.

use std::fs::File;
use std::io::Write;
use std::path::{Component, Path};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder};

use crate::batch::progress::PROGRESS_FILE;
use crate::config::SETTINGS_FILE;
use crate::errorlog::ERRORS_FILE;
use crate::manifest::MANIFEST_FILE;
use crate::provider::config::PROVIDER_FILE;
use crate::records::RECORDS_FILE;
use crate::semantic::cache::CACHE_DIR;
use crate::semantic::clustering::CLUSTERS_FILE;

const BACKUP_FILES: &[&str] = &[
    MANIFEST_FILE,
    RECORDS_FILE,
    PROGRESS_FILE,
    CLUSTERS_FILE,
    PROVIDER_FILE,
    SETTINGS_FILE,
    ERRORS_FILE,
];
const BACKUP_DIRS: &[&str] = &[CACHE_DIR];

/// Write the exportable parts of `storage_dir` to `writer`. Returns the
/// archived entry names.
pub fn export_index<W: Write>(storage_dir: &Path, writer: W) -> Result<Vec<String>> {
    if !storage_dir.join(MANIFEST_FILE).is_file() {
        anyhow::bail!("No index found in {}", storage_dir.display());
    }

    let encoder = GzEncoder::new(writer, Compression::default());
    let mut archive = Builder::new(encoder);
    let mut entries = vec![];

    for filename in BACKUP_FILES {
        let file_path = storage_dir.join(filename);
        if file_path.is_file() {
            archive
                .append_path_with_name(&file_path, filename)
                .with_context(|| format!("Failed to add {filename} to archive"))?;
            entries.push(filename.to_string());
        }
    }

    for dirname in BACKUP_DIRS {
        let dir_path = storage_dir.join(dirname);
        if dir_path.is_dir() {
            append_dir_recursive(&mut archive, &dir_path, dirname, &mut entries)?;
        }
    }

    let encoder = archive
        .into_inner()
        .context("Failed to finalize tar archive")?;
    encoder.finish().context("Failed to finalize gzip stream")?;

    log::info!(
        "exported index={} entries={}",
        storage_dir.display(),
        entries.len()
    );
    Ok(entries)
}

/// [`export_index`] into a new file at `output`.
pub fn export_to_file(storage_dir: &Path, output: &Path) -> Result<Vec<String>> {
    let file = File::create(output)
        .with_context(|| format!("Failed to create archive at {}", output.display()))?;
    export_index(storage_dir, file)
}

fn append_dir_recursive<W: Write>(
    archive: &mut Builder<W>,
    source_dir: &Path,
    archive_prefix: &str,
    entries: &mut Vec<String>,
) -> Result<()> {
    for entry in std::fs::read_dir(source_dir)
        .with_context(|| format!("Failed to read directory {}", source_dir.display()))?
    {
        let entry = entry?;
        let entry_path = entry.path();
        let archive_path = format!("{archive_prefix}/{}", entry.file_name().to_string_lossy());

        if entry_path.is_dir() {
            append_dir_recursive(archive, &entry_path, &archive_path, entries)?;
        } else if entry_path.extension().is_some_and(|ext| ext == "bin") {
            archive
                .append_path_with_name(&entry_path, &archive_path)
                .with_context(|| format!("Failed to add {} to archive", entry_path.display()))?;
            entries.push(archive_path);
        }
    }
    Ok(())
}

/// Whitelisted entries of `archive_path`, without extracting anything.
pub fn inspect_archive(archive_path: &Path) -> Result<Vec<String>> {
    let file = File::open(archive_path)
        .with_context(|| format!("Failed to open archive at {}", archive_path.display()))?;
    let mut archive = Archive::new(GzDecoder::new(file));

    let mut valid_entries = vec![];
    for entry in archive.entries().context("Failed to read archive entries")? {
        let entry = entry.context("Failed to read archive entry")?;
        let entry_str = entry
            .path()
            .context("Failed to get entry path")?
            .to_string_lossy()
            .to_string();
        if is_whitelisted(&entry_str) {
            valid_entries.push(entry_str);
        }
    }

    if valid_entries.is_empty() {
        anyhow::bail!(
            "Archive does not contain any recognized index files.\n\
             Expected: {:?} or files under {:?}",
            BACKUP_FILES,
            BACKUP_DIRS
        );
    }
    Ok(valid_entries)
}

/// Extract the whitelisted entries of `archive_path` into `storage_dir`,
/// overwriting what is there. Callers confirm beforehand.
pub fn import_index(archive_path: &Path, storage_dir: &Path) -> Result<Vec<String>> {
    // fail before touching the destination
    inspect_archive(archive_path)?;

    std::fs::create_dir_all(storage_dir)
        .with_context(|| format!("Failed to create directory {}", storage_dir.display()))?;

    let file = File::open(archive_path)?;
    let mut archive = Archive::new(GzDecoder::new(file));

    let mut imported = vec![];
    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.to_string_lossy().to_string();

        if !is_whitelisted(&entry_path) {
            log::debug!("import: skipping {entry_path}");
            continue;
        }

        let dest_path = storage_dir.join(&entry_path);
        if let Some(parent) = dest_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        entry
            .unpack(&dest_path)
            .with_context(|| format!("Failed to extract {entry_path}"))?;
        imported.push(entry_path);
    }

    log::info!(
        "imported index={} entries={}",
        storage_dir.display(),
        imported.len()
    );
    Ok(imported)
}

fn is_whitelisted(path: &str) -> bool {
    if BACKUP_FILES.contains(&path) {
        return true;
    }

    let nested = Path::new(path);
    if nested
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return false;
    }

    BACKUP_DIRS.iter().any(|dir| {
        path.strip_prefix(dir)
            .and_then(|rest| rest.strip_prefix('/'))
            .is_some_and(|rest| !rest.is_empty())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    /// Helper: a storage dir with every kind of file an index holds.
    fn populate_storage_dir(dir: &Path) {
        std::fs::write(dir.join(MANIFEST_FILE), "{}").unwrap();
        std::fs::write(dir.join(RECORDS_FILE), "{\"version\":1,\"records\":[]}").unwrap();
        std::fs::write(dir.join(SETTINGS_FILE), "similarity:\n  threshold: 0.8\n").unwrap();
        std::fs::write(dir.join(PROVIDER_FILE), "kind: hashing\n").unwrap();
        std::fs::write(dir.join("credentials.json"), "{\"azure\":\"secret\"}").unwrap();
        std::fs::write(dir.join("embed.lock"), "").unwrap();
        std::fs::write(dir.join("cancel.flag"), "").unwrap();
        std::fs::create_dir_all(dir.join(CACHE_DIR)).unwrap();
        std::fs::write(dir.join(CACHE_DIR).join("abc.bin"), b"vectors").unwrap();
        std::fs::create_dir_all(dir.join("models/bge")).unwrap();
        std::fs::write(dir.join("models/bge/model.onnx"), b"weights").unwrap();
    }

    fn list_archive_entries(archive_path: &Path) -> Vec<String> {
        let file = File::open(archive_path).unwrap();
        let mut archive = Archive::new(GzDecoder::new(file));
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn test_is_whitelisted() {
        assert!(is_whitelisted("manifest.json"));
        assert!(is_whitelisted("files.json"));
        assert!(is_whitelisted("embeddings/abc.bin"));
        assert!(!is_whitelisted("embeddings"));
        assert!(!is_whitelisted("embeddings/"));
        assert!(!is_whitelisted("embeddings/../../etc/passwd"));
        assert!(!is_whitelisted("credentials.json"));
        assert!(!is_whitelisted("models/bge/model.onnx"));
        assert!(!is_whitelisted("scan.lock"));
        assert!(!is_whitelisted("files.json.bak"));
    }

    #[test]
    fn test_export_excludes_secrets_locks_and_models() {
        let store = TempDir::new().unwrap();
        populate_storage_dir(store.path());
        let out = TempDir::new().unwrap();
        let archive_path = out.path().join("index.tar.gz");

        let exported = export_to_file(store.path(), &archive_path).unwrap();

        let entries: HashSet<String> = list_archive_entries(&archive_path).into_iter().collect();
        assert_eq!(entries.len(), exported.len());
        assert!(entries.contains(MANIFEST_FILE));
        assert!(entries.contains(SETTINGS_FILE));
        assert!(entries.contains("embeddings/abc.bin"));
        assert!(!entries.contains("credentials.json"));
        assert!(!entries.contains("embed.lock"));
        assert!(!entries.contains("cancel.flag"));
        assert!(!entries.iter().any(|e| e.starts_with("models")));
    }

    #[test]
    fn test_export_requires_index() {
        let store = TempDir::new().unwrap();
        let result = export_index(store.path(), Vec::new());
        assert!(result.unwrap_err().to_string().contains("No index found"));
    }

    #[test]
    fn test_import_roundtrip() {
        let src = TempDir::new().unwrap();
        populate_storage_dir(src.path());
        let out = TempDir::new().unwrap();
        let archive_path = out.path().join("roundtrip.tar.gz");
        export_to_file(src.path(), &archive_path).unwrap();

        let dst = TempDir::new().unwrap();
        let target = dst.path().join(".wayfinder_index");
        import_index(&archive_path, &target).unwrap();

        assert_eq!(
            std::fs::read_to_string(target.join(SETTINGS_FILE)).unwrap(),
            "similarity:\n  threshold: 0.8\n"
        );
        assert_eq!(
            std::fs::read(target.join(CACHE_DIR).join("abc.bin")).unwrap(),
            b"vectors"
        );
        assert!(!target.join("credentials.json").exists());
    }

    #[test]
    fn test_import_rejects_foreign_archive() {
        let tmp = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        std::fs::write(src.path().join("evil.sh"), "#!/bin/bash").unwrap();

        let archive_path = tmp.path().join("bad.tar.gz");
        let file = File::create(&archive_path).unwrap();
        let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
        builder
            .append_path_with_name(src.path().join("evil.sh"), "evil.sh")
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let dest = TempDir::new().unwrap();
        let result = import_index(&archive_path, dest.path());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("does not contain any recognized"));
        assert!(!dest.path().join("evil.sh").exists());
    }

    #[test]
    fn test_import_skips_non_whitelisted_files() {
        let tmp = TempDir::new().unwrap();
        let src = TempDir::new().unwrap();
        std::fs::write(src.path().join(MANIFEST_FILE), "{}").unwrap();
        std::fs::write(src.path().join("credentials.json"), "{}").unwrap();

        let archive_path = tmp.path().join("mixed.tar.gz");
        let file = File::create(&archive_path).unwrap();
        let mut builder = Builder::new(GzEncoder::new(file, Compression::default()));
        builder
            .append_path_with_name(src.path().join(MANIFEST_FILE), MANIFEST_FILE)
            .unwrap();
        builder
            .append_path_with_name(src.path().join("credentials.json"), "credentials.json")
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let dest = TempDir::new().unwrap();
        let imported = import_index(&archive_path, dest.path()).unwrap();

        assert_eq!(imported, vec![MANIFEST_FILE.to_string()]);
        assert!(!dest.path().join("credentials.json").exists());
    }
}
