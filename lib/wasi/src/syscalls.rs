//! The `wasi_unstable` namespace: each export is a host function closing
//! over the owning process. Bodies cover the surface the runtime exercises;
//! everything is reached through the process's file descriptor table and
//! filesystem capability.

use crate::state::FdEntry;
use crate::{SyscallTraceLevel, WasiProcess};
use smallvec::smallvec;
use std::io::SeekFrom;
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use wavm_runtime_core::{
    error::{RuntimeError, RuntimeResult},
    host_function,
    memory::Memory,
    object::{HostFnReturn, Object},
    types::{RawValue, Type},
};

/// WASI errno values used by this shim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Errno {
    /// No error.
    Success = 0,
    /// Permission denied.
    Acces = 2,
    /// Bad file descriptor.
    Badf = 8,
    /// Bad address.
    Fault = 21,
    /// Invalid argument.
    Inval = 28,
    /// I/O error.
    Io = 29,
    /// No such file or directory.
    Noent = 44,
    /// Function not supported.
    Nosys = 52,
    /// Not a directory.
    Notdir = 54,
}

type SyscallResult = Result<(), Errno>;

fn errno_return(errno: Errno) -> RuntimeResult<HostFnReturn> {
    Ok(smallvec![RawValue::from_i32(errno as u16 as i32)])
}

fn dropped_process() -> RuntimeError {
    RuntimeError::User(Box::new("the WASI process was dropped".to_string()))
}

struct GuestMemory {
    memory: Arc<Memory>,
}

impl GuestMemory {
    fn read_bytes(&self, ptr: u32, len: u32) -> Result<Vec<u8>, Errno> {
        self.memory
            .read(ptr as usize, len as usize)
            .map_err(|_| Errno::Fault)
    }

    fn write_bytes(&self, ptr: u32, bytes: &[u8]) -> SyscallResult {
        self.memory
            .write(ptr as usize, bytes)
            .map_err(|_| Errno::Fault)
    }

    fn read_u32(&self, ptr: u32) -> Result<u32, Errno> {
        let bytes = self
            .memory
            .load::<4>(ptr as usize)
            .map_err(|_| Errno::Fault)?;
        Ok(u32::from_le_bytes(bytes))
    }

    fn write_u32(&self, ptr: u32, value: u32) -> SyscallResult {
        self.write_bytes(ptr, &value.to_le_bytes())
    }

    fn write_u64(&self, ptr: u32, value: u64) -> SyscallResult {
        self.write_bytes(ptr, &value.to_le_bytes())
    }

    fn read_string(&self, ptr: u32, len: u32) -> Result<String, Errno> {
        let bytes = self.read_bytes(ptr, len)?;
        String::from_utf8(bytes).map_err(|_| Errno::Inval)
    }
}

macro_rules! process {
    ($weak:expr) => {
        match $weak.upgrade() {
            Some(process) => process,
            None => return Err(dropped_process()),
        }
    };
}

macro_rules! guest_memory {
    ($process:expr) => {
        match $process.memory() {
            Some(memory) => GuestMemory { memory },
            None => return errno_return(Errno::Inval),
        }
    };
}

macro_rules! wasi_try {
    ($e:expr) => {
        match $e {
            Ok(value) => value,
            Err(errno) => return errno_return(errno),
        }
    };
}

fn trace_syscall(process: &WasiProcess, description: &str) {
    match process.trace_level() {
        SyscallTraceLevel::None => {}
        SyscallTraceLevel::Syscalls => {
            log::trace!("SYSCALL: {}", description);
        }
        SyscallTraceLevel::SyscallsWithCallstacks => {
            log::trace!("SYSCALL: {}", description);
            log::trace!("{}", std::backtrace::Backtrace::capture());
        }
    }
}

/// Joins a relative guest path onto the guest path of a directory fd.
fn join_guest_path(base: &str, relative: &str) -> String {
    if relative.starts_with('/') {
        relative.to_string()
    } else if base.ends_with('/') {
        format!("{}{}", base, relative)
    } else {
        format!("{}/{}", base, relative)
    }
}

fn dir_guest_path(entry: &FdEntry) -> Result<String, Errno> {
    match entry {
        FdEntry::PreopenDir { guest_path } | FdEntry::Dir { guest_path } => {
            Ok(guest_path.clone())
        }
        FdEntry::File(_) => Err(Errno::Notdir),
    }
}

/// Builds the `wasi_unstable` namespace over a process.
pub(crate) fn wasi_namespace(process: Weak<WasiProcess>) -> Vec<(String, Object)> {
    use Type::{I32, I64};

    let mut ns = Vec::new();

    {
        let process = process.clone();
        ns.push(host_function!("args_sizes_get", (I32, I32) -> (I32), move |_, args: &[RawValue]| {
            let process = process!(process);
            trace_syscall(&process, "args_sizes_get");
            let memory = guest_memory!(process);
            let state = process.state();
            let buf_size: usize = state.args.iter().map(|arg| arg.len() + 1).sum();
            wasi_try!(memory.write_u32(args[0].as_u32(), state.args.len() as u32));
            wasi_try!(memory.write_u32(args[1].as_u32(), buf_size as u32));
            errno_return(Errno::Success)
        }));
    }

    {
        let process = process.clone();
        ns.push(host_function!("args_get", (I32, I32) -> (I32), move |_, args: &[RawValue]| {
            let process = process!(process);
            trace_syscall(&process, "args_get");
            let memory = guest_memory!(process);
            let state = process.state();
            let mut argv_ptr = args[0].as_u32();
            let mut buf_ptr = args[1].as_u32();
            for arg in &state.args {
                wasi_try!(memory.write_u32(argv_ptr, buf_ptr));
                wasi_try!(memory.write_bytes(buf_ptr, arg.as_bytes()));
                wasi_try!(memory.write_bytes(buf_ptr + arg.len() as u32, &[0]));
                argv_ptr += 4;
                buf_ptr += arg.len() as u32 + 1;
            }
            errno_return(Errno::Success)
        }));
    }

    {
        let process = process.clone();
        ns.push(host_function!("environ_sizes_get", (I32, I32) -> (I32), move |_, args: &[RawValue]| {
            let process = process!(process);
            trace_syscall(&process, "environ_sizes_get");
            let memory = guest_memory!(process);
            let state = process.state();
            let buf_size: usize = state.envs.iter().map(|env| env.len() + 1).sum();
            wasi_try!(memory.write_u32(args[0].as_u32(), state.envs.len() as u32));
            wasi_try!(memory.write_u32(args[1].as_u32(), buf_size as u32));
            errno_return(Errno::Success)
        }));
    }

    {
        let process = process.clone();
        ns.push(host_function!("environ_get", (I32, I32) -> (I32), move |_, args: &[RawValue]| {
            let process = process!(process);
            trace_syscall(&process, "environ_get");
            let memory = guest_memory!(process);
            let state = process.state();
            let mut environ_ptr = args[0].as_u32();
            let mut buf_ptr = args[1].as_u32();
            for env in &state.envs {
                wasi_try!(memory.write_u32(environ_ptr, buf_ptr));
                wasi_try!(memory.write_bytes(buf_ptr, env.as_bytes()));
                wasi_try!(memory.write_bytes(buf_ptr + env.len() as u32, &[0]));
                environ_ptr += 4;
                buf_ptr += env.len() as u32 + 1;
            }
            errno_return(Errno::Success)
        }));
    }

    {
        let process = process.clone();
        ns.push(host_function!("clock_time_get", (I32, I64, I32) -> (I32), move |_, args: &[RawValue]| {
            let process = process!(process);
            trace_syscall(&process, "clock_time_get");
            let memory = guest_memory!(process);
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default();
            wasi_try!(memory.write_u64(args[2].as_u32(), now.as_nanos() as u64));
            errno_return(Errno::Success)
        }));
    }

    {
        let process = process.clone();
        ns.push(host_function!("random_get", (I32, I32) -> (I32), move |_, args: &[RawValue]| {
            use rand::RngCore;
            let process = process!(process);
            trace_syscall(&process, "random_get");
            let memory = guest_memory!(process);
            let mut bytes = vec![0u8; args[1].as_u32() as usize];
            rand::thread_rng().fill_bytes(&mut bytes);
            wasi_try!(memory.write_bytes(args[0].as_u32(), &bytes));
            errno_return(Errno::Success)
        }));
    }

    {
        let process = process.clone();
        ns.push(host_function!("fd_write", (I32, I32, I32, I32) -> (I32), move |_, args: &[RawValue]| {
            let process = process!(process);
            trace_syscall(
                &process,
                &format!("fd_write(fd={}, iovs={})", args[0].as_i32(), args[2].as_i32()),
            );
            let memory = guest_memory!(process);
            let fd = args[0].as_u32();
            let iovs = args[1].as_u32();
            let iovs_len = args[2].as_u32();

            // Gather the io vectors out of guest memory first; the fd table
            // lock is only held for the writes themselves.
            let mut buffers = Vec::with_capacity(iovs_len as usize);
            for index in 0..iovs_len {
                let iov = iovs + index * 8;
                let buf = wasi_try!(memory.read_u32(iov));
                let len = wasi_try!(memory.read_u32(iov + 4));
                buffers.push(wasi_try!(memory.read_bytes(buf, len)));
            }

            let mut state = process.state();
            let entry = match state.fd(fd) {
                Some(FdEntry::File(file)) => file,
                Some(_) => return errno_return(Errno::Inval),
                None => return errno_return(Errno::Badf),
            };
            let mut written = 0u32;
            for buffer in &buffers {
                match entry.write(buffer) {
                    Ok(n) => written += n as u32,
                    Err(_) => return errno_return(Errno::Io),
                }
            }
            drop(state);

            wasi_try!(memory.write_u32(args[3].as_u32(), written));
            errno_return(Errno::Success)
        }));
    }

    {
        let process = process.clone();
        ns.push(host_function!("fd_read", (I32, I32, I32, I32) -> (I32), move |_, args: &[RawValue]| {
            let process = process!(process);
            trace_syscall(
                &process,
                &format!("fd_read(fd={}, iovs={})", args[0].as_i32(), args[2].as_i32()),
            );
            let memory = guest_memory!(process);
            let fd = args[0].as_u32();
            let iovs = args[1].as_u32();
            let iovs_len = args[2].as_u32();

            let mut total_read = 0u32;
            let mut filled: Vec<(u32, Vec<u8>)> = Vec::new();
            {
                let mut state = process.state();
                let entry = match state.fd(fd) {
                    Some(FdEntry::File(file)) => file,
                    Some(_) => return errno_return(Errno::Inval),
                    None => return errno_return(Errno::Badf),
                };
                for index in 0..iovs_len {
                    let iov = iovs + index * 8;
                    let buf = wasi_try!(memory.read_u32(iov));
                    let len = wasi_try!(memory.read_u32(iov + 4));
                    let mut buffer = vec![0u8; len as usize];
                    let read = match entry.read(&mut buffer) {
                        Ok(read) => read,
                        Err(_) => return errno_return(Errno::Io),
                    };
                    buffer.truncate(read);
                    total_read += read as u32;
                    filled.push((buf, buffer));
                    if read < len as usize {
                        break;
                    }
                }
            }
            for (buf, bytes) in filled {
                wasi_try!(memory.write_bytes(buf, &bytes));
            }
            wasi_try!(memory.write_u32(args[3].as_u32(), total_read));
            errno_return(Errno::Success)
        }));
    }

    {
        let process = process.clone();
        ns.push(host_function!("fd_close", (I32) -> (I32), move |_, args: &[RawValue]| {
            let process = process!(process);
            trace_syscall(&process, &format!("fd_close(fd={})", args[0].as_i32()));
            let closed = process.state().close_fd(args[0].as_u32());
            errno_return(if closed { Errno::Success } else { Errno::Badf })
        }));
    }

    {
        let process = process.clone();
        ns.push(host_function!("fd_seek", (I32, I64, I32, I32) -> (I32), move |_, args: &[RawValue]| {
            let process = process!(process);
            trace_syscall(&process, &format!("fd_seek(fd={})", args[0].as_i32()));
            let memory = guest_memory!(process);
            let offset = args[1].as_i64();
            let whence = match args[2].as_i32() {
                0 => SeekFrom::Current(offset),
                1 => SeekFrom::End(offset),
                2 => SeekFrom::Start(offset as u64),
                _ => return errno_return(Errno::Inval),
            };
            let mut state = process.state();
            let new_offset = match state.fd(args[0].as_u32()) {
                Some(FdEntry::File(file)) => match file.seek(whence) {
                    Ok(offset) => offset,
                    Err(_) => return errno_return(Errno::Io),
                },
                Some(_) => return errno_return(Errno::Inval),
                None => return errno_return(Errno::Badf),
            };
            drop(state);
            wasi_try!(memory.write_u64(args[3].as_u32(), new_offset));
            errno_return(Errno::Success)
        }));
    }

    {
        let process = process.clone();
        ns.push(host_function!("fd_fdstat_get", (I32, I32) -> (I32), move |_, args: &[RawValue]| {
            let process = process!(process);
            trace_syscall(&process, &format!("fd_fdstat_get(fd={})", args[0].as_i32()));
            let memory = guest_memory!(process);
            let filetype: u8 = match process.state().fd(args[0].as_u32()) {
                Some(FdEntry::File(_)) => 4,
                Some(FdEntry::PreopenDir { .. }) | Some(FdEntry::Dir { .. }) => 3,
                None => return errno_return(Errno::Badf),
            };
            // fdstat: filetype, flags, rights_base, rights_inheriting.
            let mut stat = [0u8; 24];
            stat[0] = filetype;
            stat[8..16].copy_from_slice(&u64::max_value().to_le_bytes());
            stat[16..24].copy_from_slice(&u64::max_value().to_le_bytes());
            wasi_try!(memory.write_bytes(args[1].as_u32(), &stat));
            errno_return(Errno::Success)
        }));
    }

    {
        let process = process.clone();
        ns.push(host_function!("fd_prestat_get", (I32, I32) -> (I32), move |_, args: &[RawValue]| {
            let process = process!(process);
            trace_syscall(&process, &format!("fd_prestat_get(fd={})", args[0].as_i32()));
            let memory = guest_memory!(process);
            let name_len = match process.state().fd(args[0].as_u32()) {
                Some(FdEntry::PreopenDir { guest_path }) => guest_path.len() as u32,
                Some(_) => return errno_return(Errno::Inval),
                None => return errno_return(Errno::Badf),
            };
            let mut prestat = [0u8; 8];
            prestat[0] = 0; // preopentype::dir
            prestat[4..8].copy_from_slice(&name_len.to_le_bytes());
            wasi_try!(memory.write_bytes(args[1].as_u32(), &prestat));
            errno_return(Errno::Success)
        }));
    }

    {
        let process = process.clone();
        ns.push(host_function!("fd_prestat_dir_name", (I32, I32, I32) -> (I32), move |_, args: &[RawValue]| {
            let process = process!(process);
            trace_syscall(
                &process,
                &format!("fd_prestat_dir_name(fd={})", args[0].as_i32()),
            );
            let memory = guest_memory!(process);
            let guest_path = match process.state().fd(args[0].as_u32()) {
                Some(FdEntry::PreopenDir { guest_path }) => guest_path.clone(),
                Some(_) => return errno_return(Errno::Inval),
                None => return errno_return(Errno::Badf),
            };
            let len = (args[2].as_u32() as usize).min(guest_path.len());
            wasi_try!(memory.write_bytes(args[1].as_u32(), &guest_path.as_bytes()[..len]));
            errno_return(Errno::Success)
        }));
    }

    {
        let process = process.clone();
        ns.push(host_function!(
            "path_open",
            (I32, I32, I32, I32, I32, I64, I64, I32, I32) -> (I32),
            move |_, args: &[RawValue]| {
                let process = process!(process);
                let memory = guest_memory!(process);
                let path = wasi_try!(memory.read_string(args[2].as_u32(), args[3].as_u32()));
                trace_syscall(&process, &format!("path_open(path={:?})", path));

                let mut state = process.state();
                let base = match state.fd(args[0].as_u32()) {
                    Some(entry) => wasi_try!(dir_guest_path(entry)),
                    None => return errno_return(Errno::Badf),
                };
                let fs = match &state.fs {
                    Some(fs) => Arc::clone(fs),
                    None => return errno_return(Errno::Acces),
                };
                let guest_path = join_guest_path(&base, &path);

                let entry = if fs.is_dir(&guest_path) {
                    FdEntry::Dir { guest_path }
                } else {
                    match fs.open_file(&guest_path) {
                        Ok(file) => FdEntry::File(file),
                        Err(_) => return errno_return(Errno::Noent),
                    }
                };
                let fd = state.insert_fd(entry);
                drop(state);

                wasi_try!(memory.write_u32(args[8].as_u32(), fd));
                errno_return(Errno::Success)
            }
        ));
    }

    {
        let process = process.clone();
        ns.push(host_function!("fd_readdir", (I32, I32, I32, I64, I32) -> (I32), move |_, args: &[RawValue]| {
            let process = process!(process);
            trace_syscall(&process, &format!("fd_readdir(fd={})", args[0].as_i32()));
            let memory = guest_memory!(process);
            let buf = args[1].as_u32();
            let buf_len = args[2].as_u32() as usize;
            let cookie = args[3].as_u64();

            let mut state = process.state();
            let guest_path = match state.fd(args[0].as_u32()) {
                Some(entry) => wasi_try!(dir_guest_path(entry)),
                None => return errno_return(Errno::Badf),
            };
            let fs = match &state.fs {
                Some(fs) => Arc::clone(fs),
                None => return errno_return(Errno::Acces),
            };
            drop(state);

            let entries = match fs.read_dir(&guest_path) {
                Ok(entries) => entries,
                Err(_) => return errno_return(Errno::Notdir),
            };

            // Serialize dirents until the buffer is full; a full buffer is
            // how the guest knows to come back with a new cookie.
            let mut packed: Vec<u8> = Vec::with_capacity(buf_len);
            for (index, entry) in entries.iter().enumerate().skip(cookie as usize) {
                let mut dirent = [0u8; 24];
                dirent[0..8].copy_from_slice(&(index as u64 + 1).to_le_bytes());
                dirent[8..16].copy_from_slice(&(index as u64 + 1).to_le_bytes());
                dirent[16..20].copy_from_slice(&(entry.name.len() as u32).to_le_bytes());
                dirent[20] = if entry.is_dir { 3 } else { 4 };
                packed.extend_from_slice(&dirent);
                packed.extend_from_slice(entry.name.as_bytes());
                if packed.len() >= buf_len {
                    packed.truncate(buf_len);
                    break;
                }
            }

            wasi_try!(memory.write_bytes(buf, &packed));
            wasi_try!(memory.write_u32(args[4].as_u32(), packed.len() as u32));
            errno_return(Errno::Success)
        }));
    }

    {
        let process = process.clone();
        ns.push(host_function!("proc_exit", (I32) -> (), move |_, args: &[RawValue]| {
            let exit_code = args[0].as_i32();
            if let Some(process) = process.upgrade() {
                trace_syscall(&process, &format!("proc_exit({})", exit_code));
            }
            Err(RuntimeError::HostExit(exit_code))
        }));
    }

    ns
}
