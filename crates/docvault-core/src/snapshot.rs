//! Snapshot file helpers: atomic writes, checksums, and the export manifest.
//!
//! An exported snapshot is a pair of files (vector index + metadata
//! database) plus `<index file>.manifest.json` describing both.

use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Manifest format version.
pub const MANIFEST_VERSION: u32 = 1;

/// Describes an exported snapshot pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub manifest_version: u32,
    pub docvault_version: String,
    pub created_at: String,
    pub dimension: usize,
    pub vector_count: u64,
    pub row_count: u64,
    pub tombstone_count: u64,
    pub index_file: String,
    pub index_sha256: String,
    pub metadata_file: String,
    pub metadata_sha256: String,
}

impl SnapshotManifest {
    /// Compare recorded checksums against the files on disk.
    pub fn verify(&self, index_path: &Path, metadata_path: &Path) -> Result<()> {
        let index_sum = sha256_file(index_path)?;
        if index_sum != self.index_sha256 {
            return Err(Error::TransferFailure(format!(
                "checksum mismatch for {} (expected {}, got {index_sum})",
                index_path.display(),
                self.index_sha256
            )));
        }
        let metadata_sum = sha256_file(metadata_path)?;
        if metadata_sum != self.metadata_sha256 {
            return Err(Error::TransferFailure(format!(
                "checksum mismatch for {} (expected {}, got {metadata_sum})",
                metadata_path.display(),
                self.metadata_sha256
            )));
        }
        Ok(())
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        write_atomic(path, json.as_bytes())
    }

    /// Load the manifest at `path`, or `None` when there is none.
    pub fn load_optional(path: &Path) -> Result<Option<Self>> {
        match fs::read_to_string(path) {
            Ok(data) => {
                let manifest = serde_json::from_str(&data).map_err(|e| {
                    Error::TransferFailure(format!("unreadable manifest {}: {e}", path.display()))
                })?;
                Ok(Some(manifest))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::snapshot_io(path, e)),
        }
    }
}

/// `<path>.<suffix>`, keeping the full original file name.
pub fn sibling_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map_or_else(OsString::new, std::ffi::OsStr::to_os_string);
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// Manifest location for an exported index file.
pub fn manifest_path(index_path: &Path) -> PathBuf {
    sibling_with_suffix(index_path, "manifest.json")
}

/// Pre-import backup location for a live file.
pub fn bak_path(path: &Path) -> PathBuf {
    sibling_with_suffix(path, "bak")
}

/// Temp file used while writing `path`.
pub fn temp_path(path: &Path) -> PathBuf {
    sibling_with_suffix(path, "tmp")
}

/// Rewritten index waiting for its metadata commit to be renamed into place.
pub fn staged_path(index_path: &Path) -> PathBuf {
    sibling_with_suffix(index_path, "compact")
}

/// Write `bytes` to a temp sibling, fsync, then rename over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = write_temp(path, bytes)?;
    rename_into_place(&tmp, path)
}

/// Write and fsync `bytes` to the temp sibling of `path`, returning the
/// temp path. The caller renames it into place.
pub fn write_temp(path: &Path, bytes: &[u8]) -> Result<PathBuf> {
    ensure_parent(path)?;
    let tmp = temp_path(path);
    let written = fs::File::create(&tmp).and_then(|mut file| {
        file.write_all(bytes)?;
        file.sync_all()
    });
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(Error::snapshot_io(&tmp, e));
    }
    Ok(tmp)
}

/// Create the parent directory of `path` if needed.
pub fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| Error::snapshot_io(parent, e))?;
        }
    }
    Ok(())
}

/// Whether two paths name the same file. Paths that do not exist yet are
/// compared after canonicalizing their parent directory.
pub fn same_file(a: &Path, b: &Path) -> bool {
    fn resolve(p: &Path) -> PathBuf {
        if let Ok(full) = fs::canonicalize(p) {
            return full;
        }
        match (p.parent(), p.file_name()) {
            (Some(parent), Some(name)) => fs::canonicalize(parent)
                .map_or_else(|_| p.to_path_buf(), |dir| dir.join(name)),
            _ => p.to_path_buf(),
        }
    }
    resolve(a) == resolve(b)
}

/// Rename a finished temp file over its destination.
pub fn rename_into_place(tmp: &Path, dest: &Path) -> Result<()> {
    fs::rename(tmp, dest).map_err(|e| {
        let _ = fs::remove_file(tmp);
        Error::snapshot_io(dest, e)
    })
}

/// Remove `path` if it exists.
pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::snapshot_io(path, e)),
    }
}

/// Hex SHA-256 of a file.
pub fn sha256_file(path: &Path) -> Result<String> {
    let data = fs::read(path).map_err(|e| Error::snapshot_io(path, e))?;
    Ok(sha256_bytes(&data))
}

/// Hex SHA-256 of bytes.
pub fn sha256_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sibling_paths_keep_full_name() {
        let p = Path::new("/data/vectors.dvvi");
        assert_eq!(bak_path(p), PathBuf::from("/data/vectors.dvvi.bak"));
        assert_eq!(temp_path(p), PathBuf::from("/data/vectors.dvvi.tmp"));
        assert_eq!(
            manifest_path(p),
            PathBuf::from("/data/vectors.dvvi.manifest.json")
        );
    }

    #[test]
    fn sha256_known_value() {
        assert_eq!(
            sha256_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn write_atomic_replaces_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.bin");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn manifest_roundtrip_and_verify() {
        let dir = tempfile::tempdir().unwrap();
        let index = dir.path().join("v.dvvi");
        let db = dir.path().join("m.db");
        fs::write(&index, b"index").unwrap();
        fs::write(&db, b"db").unwrap();

        let manifest = SnapshotManifest {
            manifest_version: MANIFEST_VERSION,
            docvault_version: crate::VERSION.to_string(),
            created_at: "2026-01-01T00:00:00Z".to_string(),
            dimension: 4,
            vector_count: 2,
            row_count: 2,
            tombstone_count: 0,
            index_file: "v.dvvi".to_string(),
            index_sha256: sha256_file(&index).unwrap(),
            metadata_file: "m.db".to_string(),
            metadata_sha256: sha256_file(&db).unwrap(),
        };
        let path = manifest_path(&index);
        manifest.write(&path).unwrap();
        let loaded = SnapshotManifest::load_optional(&path).unwrap().unwrap();
        assert_eq!(loaded, manifest);
        loaded.verify(&index, &db).unwrap();

        fs::write(&db, b"tampered").unwrap();
        assert!(matches!(
            loaded.verify(&index, &db),
            Err(Error::TransferFailure(_))
        ));
    }

    #[test]
    fn same_file_resolves_relative_segments() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("a")).unwrap();
        let direct = dir.path().join("a").join("db");
        let indirect = dir.path().join("a").join("..").join("a").join("db");
        assert!(same_file(&direct, &indirect));
        assert!(!same_file(&direct, &dir.path().join("db")));
    }

    #[test]
    fn missing_manifest_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(
            SnapshotManifest::load_optional(&dir.path().join("none.json"))
                .unwrap()
                .is_none()
        );
    }
}
