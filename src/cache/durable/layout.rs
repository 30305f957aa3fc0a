//! On-disk layout of a durable store.
//!
//! ```text
//! <storage>/<sha256(key)>                  payload bytes
//! <storage>/<sha256(key)>.expiry_interval  TTL in seconds (absent = never)
//! <storage>/<sha256(key)>.group_name       group name (absent = ungrouped)
//! <storage>/<sha256(key)>.tmp              payload being written
//! <storage>/metadata.json                  {"size": .., "updated_at": ..}
//! ```
//!
//! Every file is written to a `.tmp` sibling and renamed into place. A store
//! writes sidecars before the payload, so an interrupted store can leave the
//! previous payload paired with the new TTL and group, but never a new
//! payload without its TTL.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::clock::to_chrono;
use crate::error::{CacheError, Result};

pub(crate) const METADATA_FILE: &str = "metadata.json";
pub(crate) const EXPIRY_EXTENSION: &str = "expiry_interval";
pub(crate) const GROUP_EXTENSION: &str = "group_name";
pub(crate) const TEMP_EXTENSION: &str = "tmp";

/// Contents of `metadata.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct Metadata {
    /// Total tracked payload bytes
    pub size: u64,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// File name of the payload for a (trimmed) logical key.
pub(crate) fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn is_payload_name(name: &str) -> bool {
    name.len() == 64 && name.bytes().all(|b| b.is_ascii_hexdigit())
}

/// A payload file and what its sidecars say about it.
#[derive(Debug, Clone)]
pub(crate) struct DiskEntry {
    pub name: String,
    pub size_bytes: u64,
    /// Creation time, or modification time where creation is not recorded
    pub stored_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    /// None = never expires
    pub ttl: Option<Duration>,
    /// Trimmed group, empty when ungrouped
    pub group: String,
}

impl DiskEntry {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.ttl
            .and_then(|ttl| self.stored_at.checked_add_signed(to_chrono(ttl)))
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|expires| now >= expires)
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.group == group.trim()
    }
}

// == Layout ==
#[derive(Debug, Clone)]
pub(crate) struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn payload_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn sidecar_path(&self, name: &str, extension: &str) -> PathBuf {
        self.root.join(format!("{}.{}", name, extension))
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.root.join(METADATA_FILE)
    }

    // == Directory ==
    /// Creates the storage directory, refusing a non-directory in its place.
    pub fn prepare(&self) -> Result<()> {
        match fs::metadata(&self.root) {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(CacheError::InvalidStore(format!(
                "A file exists where the cache directory is needed: {}",
                self.root.display()
            ))),
            Err(e) if e.kind() == ErrorKind::NotFound => fs::create_dir_all(&self.root)
                .map_err(|e| {
                    CacheError::InvalidStore(format!(
                        "Cannot create cache directory {}: {}",
                        self.root.display(),
                        e
                    ))
                }),
            Err(e) => Err(CacheError::InvalidStore(format!(
                "Cannot inspect cache directory {}: {}",
                self.root.display(),
                e
            ))),
        }
    }

    /// Deletes half-written payloads left by an interrupted write.
    pub fn remove_stray_temp_files(&self) -> Result<usize> {
        let mut removed = 0;
        for dir_entry in fs::read_dir(&self.root).map_err(|e| CacheError::io(&self.root, e))? {
            let path = dir_entry.map_err(|e| CacheError::io(&self.root, e))?.path();
            if path.extension().is_some_and(|ext| ext == TEMP_EXTENSION) {
                remove_if_present(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Empties the storage directory.
    pub fn wipe(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(CacheError::io(&self.root, e)),
        }
        fs::create_dir_all(&self.root).map_err(|e| CacheError::io(&self.root, e))
    }

    // == Entries ==
    /// Reads a payload's file times and sidecars. None if there is no payload.
    pub fn inspect(&self, name: &str) -> Result<Option<DiskEntry>> {
        let path = self.payload_path(name);
        let meta = match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => meta,
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(CacheError::io(&path, e)),
        };

        let modified = meta.modified().map_err(|e| CacheError::io(&path, e))?;
        let created = meta.created().unwrap_or(modified);

        Ok(Some(DiskEntry {
            name: name.to_string(),
            size_bytes: meta.len(),
            stored_at: to_utc(created),
            modified_at: to_utc(modified),
            ttl: self.read_ttl(name)?,
            group: self.read_group(name)?,
        }))
    }

    /// Every payload in the directory.
    pub fn scan(&self) -> Result<Vec<DiskEntry>> {
        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(&self.root).map_err(|e| CacheError::io(&self.root, e))? {
            let dir_entry = dir_entry.map_err(|e| CacheError::io(&self.root, e))?;
            let file_name = dir_entry.file_name();
            let Some(name) = file_name.to_str() else {
                continue;
            };
            if !is_payload_name(name) {
                continue;
            }
            if let Some(entry) = self.inspect(name)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    // == Writes ==
    /// Writes the payload through a temp file so readers never see a partial one.
    pub fn write_payload(&self, name: &str, payload: &[u8]) -> Result<()> {
        let temp = self.sidecar_path(name, TEMP_EXTENSION);
        let path = self.payload_path(name);
        fs::write(&temp, payload).map_err(|e| CacheError::io(&temp, e))?;
        fs::rename(&temp, &path).map_err(|e| {
            let _ = fs::remove_file(&temp);
            CacheError::io(&path, e)
        })
    }

    /// Records TTL and group for a payload; a zero TTL or empty group removes
    /// the corresponding sidecar. Each sidecar is replaced atomically.
    pub fn write_sidecars(&self, name: &str, ttl: Duration, group: &str) -> Result<()> {
        let expiry = self.sidecar_path(name, EXPIRY_EXTENSION);
        if ttl.is_zero() {
            remove_if_present(&expiry)?;
        } else {
            replace_file(&expiry, ttl.as_secs_f64().to_string().as_bytes())?;
        }

        let group_path = self.sidecar_path(name, GROUP_EXTENSION);
        let group = group.trim();
        if group.is_empty() {
            remove_if_present(&group_path)?;
        } else {
            replace_file(&group_path, group.as_bytes())?;
        }
        Ok(())
    }

    pub fn read_payload(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.payload_path(name);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CacheError::io(&path, e)),
        }
    }

    /// Deletes a payload and its sidecars. The payload goes first so a
    /// failure never leaves an unaccounted payload behind.
    pub fn remove_entry(&self, name: &str) -> Result<()> {
        remove_if_present(&self.payload_path(name))?;
        for extension in [EXPIRY_EXTENSION, GROUP_EXTENSION] {
            let sidecar = self.sidecar_path(name, extension);
            if let Err(e) = remove_if_present(&sidecar) {
                warn!(error = %e, "Leaving orphaned sidecar behind");
            }
        }
        Ok(())
    }

    // == Metadata ==
    /// The recorded size, or None if the file is missing or unreadable.
    pub fn read_metadata(&self) -> Option<Metadata> {
        let path = self.metadata_path();
        let bytes = fs::read(&path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(metadata) => Some(metadata),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring corrupt cache metadata");
                None
            }
        }
    }

    pub fn write_metadata(&self, metadata: &Metadata) -> Result<()> {
        let path = self.metadata_path();
        let temp = self.root.join(format!("{}.{}", METADATA_FILE, TEMP_EXTENSION));
        let bytes = serde_json::to_vec(metadata)?;
        fs::write(&temp, bytes).map_err(|e| CacheError::io(&temp, e))?;
        fs::rename(&temp, &path).map_err(|e| CacheError::io(&path, e))
    }

    // == Sidecar Reads ==
    fn read_ttl(&self, name: &str) -> Result<Option<Duration>> {
        let path = self.sidecar_path(name, EXPIRY_EXTENSION);
        let Some(text) = read_optional_string(&path)? else {
            return Ok(None);
        };

        match text.trim().parse::<f64>() {
            Ok(secs) if secs > 0.0 && secs.is_finite() => {
                Ok(Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)))
            }
            Ok(secs) if secs == 0.0 => Ok(None),
            _ => {
                // Unreadable TTL: treat the entry as already expired.
                warn!(path = %path.display(), contents = %text, "Invalid expiry interval");
                Ok(Some(Duration::ZERO))
            }
        }
    }

    fn read_group(&self, name: &str) -> Result<String> {
        let path = self.sidecar_path(name, GROUP_EXTENSION);
        Ok(read_optional_string(&path)?
            .map(|group| group.trim().to_string())
            .unwrap_or_default())
    }
}

fn read_optional_string(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CacheError::io(path, e)),
    }
}

/// Writes `<path>.tmp` and renames it over `path`.
fn replace_file(path: &Path, contents: &[u8]) -> Result<()> {
    let mut temp = path.as_os_str().to_owned();
    temp.push(".");
    temp.push(TEMP_EXTENSION);
    let temp = PathBuf::from(temp);

    fs::write(&temp, contents).map_err(|e| CacheError::io(&temp, e))?;
    fs::rename(&temp, path).map_err(|e| {
        let _ = fs::remove_file(&temp);
        CacheError::io(path, e)
    })
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CacheError::io(path, e)),
    }
}

fn to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn layout() -> (TempDir, Layout) {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path().join("store"));
        layout.prepare().unwrap();
        (dir, layout)
    }

    #[test]
    fn test_hash_key_is_stable_hex() {
        let hash = hash_key("avatar");
        assert_eq!(hash.len(), 64);
        assert!(is_payload_name(&hash));
        assert_eq!(hash, hash_key("avatar"));
        assert_ne!(hash, hash_key("avatar2"));
    }

    #[test]
    fn test_prepare_rejects_file() {
        let dir = TempDir::new().unwrap();
        let occupied = dir.path().join("occupied");
        fs::write(&occupied, b"not a dir").unwrap();

        let result = Layout::new(&occupied).prepare();
        assert!(matches!(result, Err(CacheError::InvalidStore(_))));
    }

    #[test]
    fn test_write_and_inspect_entry() {
        let (_dir, layout) = layout();
        let name = hash_key("k");

        layout.write_payload(&name, b"hello").unwrap();
        layout.write_sidecars(&name, Duration::from_secs(90), " photos ").unwrap();

        let entry = layout.inspect(&name).unwrap().unwrap();
        assert_eq!(entry.size_bytes, 5);
        assert_eq!(entry.ttl, Some(Duration::from_secs(90)));
        assert_eq!(entry.group, "photos");
        assert!(!layout.payload_path(&name).with_extension(TEMP_EXTENSION).exists());
        assert_eq!(
            fs::read_to_string(layout.sidecar_path(&name, EXPIRY_EXTENSION)).unwrap(),
            "90"
        );
    }

    #[test]
    fn test_zero_ttl_and_empty_group_clear_sidecars() {
        let (_dir, layout) = layout();
        let name = hash_key("k");

        layout.write_payload(&name, b"v").unwrap();
        layout.write_sidecars(&name, Duration::from_secs(5), "g").unwrap();
        layout.write_sidecars(&name, Duration::ZERO, "").unwrap();

        let entry = layout.inspect(&name).unwrap().unwrap();
        assert_eq!(entry.ttl, None);
        assert_eq!(entry.group, "");
        assert!(!entry.is_expired_at(Utc::now() + chrono::Duration::days(365)));
    }

    #[test]
    fn test_sidecar_rewrite_leaves_no_temp_files() {
        let (_dir, layout) = layout();
        let name = hash_key("k");

        layout.write_sidecars(&name, Duration::from_secs(5), "a").unwrap();
        layout.write_sidecars(&name, Duration::from_secs(7), "b").unwrap();

        assert_eq!(layout.read_ttl(&name).unwrap(), Some(Duration::from_secs(7)));
        assert_eq!(layout.read_group(&name).unwrap(), "b");
        assert_eq!(layout.remove_stray_temp_files().unwrap(), 0);
    }

    #[test]
    fn test_invalid_ttl_counts_as_expired() {
        let (_dir, layout) = layout();
        let name = hash_key("k");

        layout.write_payload(&name, b"v").unwrap();
        fs::write(layout.sidecar_path(&name, EXPIRY_EXTENSION), "soon").unwrap();

        let entry = layout.inspect(&name).unwrap().unwrap();
        assert!(entry.is_expired_at(Utc::now()));
    }

    #[test]
    fn test_scan_skips_sidecars_and_metadata() {
        let (_dir, layout) = layout();
        for key in ["a", "b", "c"] {
            let name = hash_key(key);
            layout.write_payload(&name, key.as_bytes()).unwrap();
            layout.write_sidecars(&name, Duration::from_secs(60), "g").unwrap();
        }
        layout
            .write_metadata(&Metadata {
                size: 3,
                updated_at: None,
            })
            .unwrap();
        fs::write(layout.root().join("README"), b"unrelated").unwrap();

        let entries = layout.scan().unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries.iter().map(|e| e.size_bytes).sum::<u64>(), 3);
    }

    #[test]
    fn test_remove_entry_deletes_sidecars() {
        let (_dir, layout) = layout();
        let name = hash_key("k");
        layout.write_payload(&name, b"v").unwrap();
        layout.write_sidecars(&name, Duration::from_secs(60), "g").unwrap();

        layout.remove_entry(&name).unwrap();
        assert!(layout.inspect(&name).unwrap().is_none());
        assert_eq!(fs::read_dir(layout.root()).unwrap().count(), 0);

        // Absent entries are fine.
        layout.remove_entry(&name).unwrap();
    }

    #[test]
    fn test_metadata_round_trip_and_corruption() {
        let (_dir, layout) = layout();
        assert!(layout.read_metadata().is_none());

        layout
            .write_metadata(&Metadata {
                size: 1234,
                updated_at: Some(Utc::now()),
            })
            .unwrap();
        assert_eq!(layout.read_metadata().unwrap().size, 1234);

        fs::write(layout.metadata_path(), b"{oops").unwrap();
        assert!(layout.read_metadata().is_none());
    }

    #[test]
    fn test_remove_stray_temp_files() {
        let (_dir, layout) = layout();
        let name = hash_key("k");
        fs::write(layout.sidecar_path(&name, TEMP_EXTENSION), b"partial").unwrap();
        layout.write_payload(&hash_key("other"), b"ok").unwrap();

        assert_eq!(layout.remove_stray_temp_files().unwrap(), 1);
        assert_eq!(layout.scan().unwrap().len(), 1);
    }

    #[test]
    fn test_wipe() {
        let (_dir, layout) = layout();
        layout.write_payload(&hash_key("k"), b"v").unwrap();
        layout.wipe().unwrap();
        assert!(layout.root().is_dir());
        assert!(layout.scan().unwrap().is_empty());
    }
}
