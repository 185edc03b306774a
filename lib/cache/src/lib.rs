//! The cache crate implements the persistent object cache of the wavm
//! runtime: a directory of compiled-object artifacts keyed by the module
//! bytes hash, scoped to a 64-bit `code key` identifying the exact
//! compilation toolchain. When any ingredient of compilation changes, the
//! code key changes and old entries become invisible.

#![deny(nonstandard_style, unused_mut, unreachable_patterns)]

mod filesystem;
mod hash;

pub use crate::filesystem::FileSystemCache;
pub use crate::hash::Hash;

use std::path::Path;
use std::sync::Arc;
use wavm_runtime_core::backend::{set_global_object_cache, ObjectCache};

/// Why a cache directory could not be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenError {
    /// The path does not exist.
    DoesNotExist,
    /// The path does not refer to a directory.
    NotDirectory,
    /// The path exists but cannot be read or written.
    NotAccessible,
    /// The directory does not hold a valid cache database.
    InvalidDatabase,
    /// The database is already saturated with concurrent readers.
    TooManyReaders,
}

impl std::fmt::Display for OpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let text = match self {
            OpenError::DoesNotExist => "the object cache directory does not exist",
            OpenError::NotDirectory => "the object cache path does not refer to a directory",
            OpenError::NotAccessible => "the object cache path is not accessible",
            OpenError::InvalidDatabase => "the object cache database is not valid",
            OpenError::TooManyReaders => {
                "the object cache database has too many concurrent readers"
            }
        };
        write!(f, "{}", text)
    }
}

impl std::error::Error for OpenError {}

/// Opens the cache directory at `path` with a total byte budget and the
/// caller's code key.
pub fn open(
    path: impl AsRef<Path>,
    max_bytes: u64,
    code_key: u64,
) -> Result<Arc<FileSystemCache>, OpenError> {
    FileSystemCache::open(path.as_ref(), max_bytes, code_key)
}

/// Opens the cache and installs it as the process-wide object cache that
/// backends consult transparently.
pub fn open_and_install(
    path: impl AsRef<Path>,
    max_bytes: u64,
    code_key: u64,
) -> Result<(), OpenError> {
    let cache: Arc<dyn ObjectCache> = open(path, max_bytes, code_key)?;
    if !set_global_object_cache(cache) {
        log::warn!("a process-wide object cache was already installed");
    }
    Ok(())
}
