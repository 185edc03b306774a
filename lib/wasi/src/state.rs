//! Process-local state of the system-interface shim: the argument and
//! environment vectors, the file descriptor table and the endpoints behind
//! it.

use crate::vfs::FileSystem;
use hashbrown::HashMap;
use std::io::{self, Read, SeekFrom, Write};
use std::sync::{Arc, Mutex};

/// A byte-stream endpoint behind a file descriptor.
pub trait WasiFile: Send {
    /// Reads into `buf`, returning the number of bytes read.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    /// Writes `buf`, returning the number of bytes written.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
    /// Repositions the stream.
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64>;
}

/// The host process's standard input.
pub struct HostStdin;

impl WasiFile for HostStdin {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::stdin().read(buf)
    }

    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::Other, "stdin is read-only"))
    }

    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(io::ErrorKind::Other, "stdin is not seekable"))
    }
}

/// The host process's standard output.
pub struct HostStdout;

impl WasiFile for HostStdout {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::Other, "stdout is write-only"))
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = io::stdout().write(buf)?;
        io::stdout().flush()?;
        Ok(written)
    }

    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(io::ErrorKind::Other, "stdout is not seekable"))
    }
}

/// The host process's standard error.
pub struct HostStderr;

impl WasiFile for HostStderr {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::Other, "stderr is write-only"))
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write(buf)
    }

    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(io::ErrorKind::Other, "stderr is not seekable"))
    }
}

/// An in-memory endpoint whose written bytes can be read back by the host.
/// Useful as a captured stdout in tests and embeddings.
#[derive(Clone, Default)]
pub struct WritePipe {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl WritePipe {
    /// Creates an empty pipe.
    pub fn new() -> WritePipe {
        WritePipe::default()
    }

    /// Everything written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.buffer.lock().expect("pipe poisoned").clone()
    }
}

impl WasiFile for WritePipe {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer
            .lock()
            .expect("pipe poisoned")
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(io::ErrorKind::Other, "pipes are not seekable"))
    }
}

/// What a file descriptor refers to.
pub enum FdEntry {
    /// A byte stream.
    File(Box<dyn WasiFile>),
    /// A preopened directory rooted at a guest path.
    PreopenDir {
        /// Absolute guest path of the directory.
        guest_path: String,
    },
    /// An opened directory.
    Dir {
        /// Absolute guest path of the directory.
        guest_path: String,
    },
}

/// The mutable half of a WASI process.
pub struct WasiState {
    /// Guest argv, argv[0] first.
    pub args: Vec<String>,
    /// Guest environment, `KEY=value` strings.
    pub envs: Vec<String>,
    /// The filesystem capability, when one was granted.
    pub fs: Option<Arc<dyn FileSystem>>,
    fds: HashMap<u32, FdEntry>,
    next_fd: u32,
}

impl WasiState {
    pub(crate) fn new(
        args: Vec<String>,
        envs: Vec<String>,
        fs: Option<Arc<dyn FileSystem>>,
        stdin: Box<dyn WasiFile>,
        stdout: Box<dyn WasiFile>,
        stderr: Box<dyn WasiFile>,
    ) -> WasiState {
        let mut fds = HashMap::new();
        fds.insert(0, FdEntry::File(stdin));
        fds.insert(1, FdEntry::File(stdout));
        fds.insert(2, FdEntry::File(stderr));
        let mut next_fd = 3;
        if fs.is_some() {
            fds.insert(
                next_fd,
                FdEntry::PreopenDir {
                    guest_path: "/".to_string(),
                },
            );
            next_fd += 1;
        }
        WasiState {
            args,
            envs,
            fs,
            fds,
            next_fd,
        }
    }

    /// The entry behind `fd`.
    pub fn fd(&mut self, fd: u32) -> Option<&mut FdEntry> {
        self.fds.get_mut(&fd)
    }

    /// Installs a new entry, returning its descriptor.
    pub fn insert_fd(&mut self, entry: FdEntry) -> u32 {
        let fd = self.next_fd;
        self.next_fd += 1;
        self.fds.insert(fd, entry);
        fd
    }

    /// Closes `fd`. Returns false when it was not open.
    pub fn close_fd(&mut self, fd: u32) -> bool {
        self.fds.remove(&fd).is_some()
    }
}
