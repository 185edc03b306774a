//! A directory of compiled-object artifacts. Entries are keyed by the
//! module-bytes hash and scoped to one code key: objects written by a
//! different toolchain are simply invisible.

use crate::hash::Hash;
use crate::OpenError;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use wavm_runtime_core::backend::ObjectCache;

const VERSION_FILE: &str = "wavm-cache-version";
const VERSION: &str = "1";
const READERS_DIR: &str = "readers";
const MAX_READERS: usize = 64;

/// A reader slot is considered abandoned after this long without being
/// refreshed.
const STALE_READER_AGE: Duration = Duration::from_secs(60 * 60);

/// Representation of a directory that contains compiled object artifacts.
///
/// The cache registers itself as a reader for its whole lifetime; the open
/// fails with [`OpenError::TooManyReaders`] when the directory is already
/// saturated.
#[derive(Debug)]
pub struct FileSystemCache {
    path: PathBuf,
    max_bytes: u64,
    code_key: u64,
    reader_slot: PathBuf,
}

impl FileSystemCache {
    pub(crate) fn open(
        path: &Path,
        max_bytes: u64,
        code_key: u64,
    ) -> Result<Arc<FileSystemCache>, OpenError> {
        let metadata = match fs::metadata(path) {
            Ok(metadata) => metadata,
            Err(_) => return Err(OpenError::DoesNotExist),
        };
        if !metadata.is_dir() {
            return Err(OpenError::NotDirectory);
        }
        if metadata.permissions().readonly() {
            return Err(OpenError::NotAccessible);
        }

        // The version marker distinguishes a cache directory from arbitrary
        // directory contents and from caches written by future formats.
        let version_path = path.join(VERSION_FILE);
        match fs::read_to_string(&version_path) {
            Ok(found) => {
                if found.trim() != VERSION {
                    return Err(OpenError::InvalidDatabase);
                }
            }
            Err(_) => {
                fs::write(&version_path, VERSION).map_err(|_| OpenError::NotAccessible)?;
            }
        }

        let reader_slot = register_reader(path)?;

        Ok(Arc::new(FileSystemCache {
            path: path.to_path_buf(),
            max_bytes,
            code_key,
            reader_slot,
        }))
    }

    fn entry_path(&self, module_hash: &[u8; 32]) -> PathBuf {
        let key = Hash::new(*module_hash);
        self.path
            .join(format!("{}-{:016x}.obj", key.to_string(), self.code_key))
    }

    /// Removes the oldest entries until the directory fits the byte budget.
    fn prune_to_budget(&self) {
        let entries = match fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(_) => return,
        };

        let mut objects: Vec<(PathBuf, u64, SystemTime)> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .path()
                    .extension()
                    .map(|ext| ext == "obj")
                    .unwrap_or(false)
            })
            .filter_map(|entry| {
                let metadata = entry.metadata().ok()?;
                let modified = metadata.modified().ok()?;
                Some((entry.path(), metadata.len(), modified))
            })
            .collect();

        let mut total: u64 = objects.iter().map(|(_, len, _)| len).sum();
        if total <= self.max_bytes {
            return;
        }

        objects.sort_by_key(|(_, _, modified)| *modified);
        for (path, len, _) in objects {
            if total <= self.max_bytes {
                break;
            }
            if fs::remove_file(&path).is_ok() {
                log::debug!("evicted cached object {}", path.display());
                total = total.saturating_sub(len);
            }
        }
    }
}

impl ObjectCache for FileSystemCache {
    fn get(&self, module_hash: &[u8; 32]) -> Option<Vec<u8>> {
        let path = self.entry_path(module_hash);
        match fs::read(&path) {
            Ok(bytes) => Some(bytes),
            Err(_) => None,
        }
    }

    fn put(&self, module_hash: &[u8; 32], object: &[u8]) {
        let path = self.entry_path(module_hash);
        let write = fs::File::create(&path).and_then(|mut file| file.write_all(object));
        if let Err(error) = write {
            log::warn!(
                "failed to store object in cache at {}: {}",
                path.display(),
                error
            );
            return;
        }
        self.prune_to_budget();
    }
}

impl Drop for FileSystemCache {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.reader_slot);
    }
}

fn register_reader(path: &Path) -> Result<PathBuf, OpenError> {
    let readers_dir = path.join(READERS_DIR);
    fs::create_dir_all(&readers_dir).map_err(|_| OpenError::NotAccessible)?;

    let now = SystemTime::now();
    let mut live_readers = 0usize;
    if let Ok(entries) = fs::read_dir(&readers_dir) {
        for entry in entries.filter_map(|entry| entry.ok()) {
            let stale = entry
                .metadata()
                .and_then(|metadata| metadata.modified())
                .map(|modified| {
                    now.duration_since(modified).unwrap_or(Duration::from_secs(0))
                        > STALE_READER_AGE
                })
                .unwrap_or(true);
            if stale {
                let _ = fs::remove_file(entry.path());
            } else {
                live_readers += 1;
            }
        }
    }
    if live_readers >= MAX_READERS {
        return Err(OpenError::TooManyReaders);
    }

    let nanos = now
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_nanos();
    let slot = readers_dir.join(format!("{}-{}", std::process::id(), nanos));
    fs::write(&slot, b"").map_err(|_| OpenError::NotAccessible)?;
    Ok(slot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn objects_round_trip_within_one_code_key() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileSystemCache::open(dir.path(), 1_000_000, 0xA).unwrap();

        let hash = Hash::generate(b"module bytes").to_array();
        assert!(cache.get(&hash).is_none());
        cache.put(&hash, b"object bytes");
        assert_eq!(cache.get(&hash).as_deref(), Some(&b"object bytes"[..]));
    }

    #[test]
    fn objects_of_another_code_key_are_invisible() {
        let dir = tempfile::tempdir().unwrap();
        let hash = Hash::generate(b"module bytes").to_array();

        {
            let old = FileSystemCache::open(dir.path(), 1_000_000, 0xA).unwrap();
            old.put(&hash, b"old toolchain");
        }

        let new = FileSystemCache::open(dir.path(), 1_000_000, 0xB).unwrap();
        assert!(new.get(&hash).is_none());
    }

    #[test]
    fn the_byte_budget_evicts_oldest_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileSystemCache::open(dir.path(), 64, 0xA).unwrap();

        let first = Hash::generate(b"first").to_array();
        let second = Hash::generate(b"second").to_array();
        cache.put(&first, &[0u8; 48]);
        // Keep the modification times strictly ordered.
        std::thread::sleep(Duration::from_millis(20));
        cache.put(&second, &[0u8; 48]);

        // Both together exceed the budget, so the older entry is gone.
        assert!(cache.get(&second).is_some());
        assert!(cache.get(&first).is_none());
    }

    #[test]
    fn a_foreign_version_marker_is_an_invalid_database() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(VERSION_FILE), "999").unwrap();
        match FileSystemCache::open(dir.path(), 1_000_000, 0xA) {
            Err(OpenError::InvalidDatabase) => {}
            other => panic!("expected InvalidDatabase, got {:?}", other.err()),
        }
    }
}
