//! A minimal virtual filesystem seam: the runtime core treats filesystems as
//! an external capability, so the shim only defines the interface it
//! consumes, a host passthrough, and the sandbox wrapper that maps a host
//! directory to the guest's root.

use crate::state::WasiFile;
use std::fs;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// One directory entry as the guest sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// File name inside its directory.
    pub name: String,
    /// Whether the entry is itself a directory.
    pub is_dir: bool,
}

/// The filesystem capability consumed by the syscall layer. Paths are
/// absolute guest paths, `/`-separated.
pub trait FileSystem: Send + Sync {
    /// Opens an existing file for reading.
    fn open_file(&self, path: &str) -> io::Result<Box<dyn WasiFile>>;
    /// Lists a directory.
    fn read_dir(&self, path: &str) -> io::Result<Vec<DirEntry>>;
    /// Whether the path names a directory.
    fn is_dir(&self, path: &str) -> bool;
}

struct HostFile {
    file: fs::File,
}

impl WasiFile for HostFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

/// Direct passthrough to the host filesystem.
pub struct HostFs;

impl FileSystem for HostFs {
    fn open_file(&self, path: &str) -> io::Result<Box<dyn WasiFile>> {
        let file = fs::File::open(path)?;
        Ok(Box::new(HostFile { file }))
    }

    fn read_dir(&self, path: &str) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: entry.file_type().map(|ty| ty.is_dir()).unwrap_or(false),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn is_dir(&self, path: &str) -> bool {
        Path::new(path).is_dir()
    }
}

/// Wraps an inner filesystem so a single directory appears as the guest's
/// root: guest `/` resolves to the mount root, and no path can escape it.
pub struct SandboxFs {
    inner: Arc<dyn FileSystem>,
    root: PathBuf,
}

impl SandboxFs {
    /// Mounts `root` of `inner` as the guest root directory.
    pub fn new(inner: Arc<dyn FileSystem>, root: impl Into<PathBuf>) -> SandboxFs {
        SandboxFs {
            inner,
            root: root.into(),
        }
    }

    /// Resolves an absolute guest path inside the mount root, rejecting any
    /// traversal that would escape it.
    fn resolve(&self, guest_path: &str) -> io::Result<String> {
        let mut resolved = PathBuf::new();
        for component in Path::new(guest_path).components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(name) => resolved.push(name),
                Component::ParentDir => {
                    if !resolved.pop() {
                        return Err(io::Error::new(
                            io::ErrorKind::PermissionDenied,
                            "path escapes the sandbox root",
                        ));
                    }
                }
                Component::Prefix(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "unsupported path prefix",
                    ));
                }
            }
        }
        Ok(self.root.join(resolved).to_string_lossy().into_owned())
    }
}

impl FileSystem for SandboxFs {
    fn open_file(&self, path: &str) -> io::Result<Box<dyn WasiFile>> {
        let host_path = self.resolve(path)?;
        self.inner.open_file(&host_path)
    }

    fn read_dir(&self, path: &str) -> io::Result<Vec<DirEntry>> {
        let host_path = self.resolve(path)?;
        self.inner.read_dir(&host_path)
    }

    fn is_dir(&self, path: &str) -> bool {
        match self.resolve(path) {
            Ok(host_path) => self.inner.is_dir(&host_path),
            Err(_) => false,
        }
    }
}

/// Creates the sandbox wrapper over the host filesystem.
pub fn make_sandbox_fs(root: impl Into<PathBuf>) -> Arc<dyn FileSystem> {
    Arc::new(SandboxFs::new(Arc::new(HostFs), root))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn the_sandbox_maps_guest_root_to_the_mount_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = fs::File::create(dir.path().join("hello.txt")).unwrap();
        file.write_all(b"contents").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let sandbox = make_sandbox_fs(dir.path());
        let entries = sandbox.read_dir("/").unwrap();
        assert_eq!(
            entries,
            vec![
                DirEntry {
                    name: "hello.txt".to_string(),
                    is_dir: false
                },
                DirEntry {
                    name: "sub".to_string(),
                    is_dir: true
                },
            ]
        );

        let mut opened = sandbox.open_file("/hello.txt").unwrap();
        let mut contents = Vec::new();
        let mut buf = [0u8; 16];
        loop {
            let n = opened.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            contents.extend_from_slice(&buf[..n]);
        }
        assert_eq!(contents, b"contents");
    }

    #[test]
    fn the_sandbox_rejects_escapes() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = make_sandbox_fs(dir.path());
        assert!(sandbox.open_file("/../secret").is_err());
        assert!(sandbox.read_dir("/..").is_err());
        // A dotdot that stays inside the root is fine.
        assert!(sandbox.read_dir("/a/..").is_ok());
    }
}
