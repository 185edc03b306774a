//! System-interface ABI shim for the wavm runtime.
//!
//! A [`WasiProcess`] owns the guest-visible process state (argv, environ,
//! file descriptors, the optional filesystem capability) and exposes the
//! `wasi_unstable` namespace as a host-function module in its compartment.
//! The driver links guest modules against it through
//! [`get_process_resolver`].

#![deny(nonstandard_style, unused_mut, unreachable_patterns)]

mod state;
mod syscalls;
pub mod vfs;

pub use crate::state::{HostStderr, HostStdin, HostStdout, WasiFile, WasiState, WritePipe};
pub use crate::vfs::{make_sandbox_fs, DirEntry, FileSystem, HostFs, SandboxFs};

use crate::state::FdEntry;
use std::sync::{Arc, Mutex, MutexGuard};
use wavm_runtime_core::{
    compartment::Compartment,
    instance::InstanceInner,
    linker::Resolver,
    memory::Memory,
    module::ModuleInfo,
    object::Object,
    types::ExternType,
};

/// The namespace this shim provides.
pub const WASI_NAMESPACE: &str = "wasi_unstable";

/// How much of the syscall traffic is logged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SyscallTraceLevel {
    /// No tracing.
    None,
    /// One line per syscall.
    Syscalls,
    /// One line per syscall plus a host callstack.
    SyscallsWithCallstacks,
}

/// A system-interface process: state plus the syscall module instantiated
/// into a compartment.
pub struct WasiProcess {
    state: Mutex<WasiState>,
    memory: Mutex<Option<Arc<Memory>>>,
    trace_level: Mutex<SyscallTraceLevel>,
    syscall_instance: Mutex<Option<Arc<InstanceInner>>>,
}

impl WasiProcess {
    pub(crate) fn state(&self) -> MutexGuard<WasiState> {
        self.state.lock().expect("wasi state poisoned")
    }

    pub(crate) fn memory(&self) -> Option<Arc<Memory>> {
        self.memory.lock().expect("wasi memory poisoned").clone()
    }

    pub(crate) fn trace_level(&self) -> SyscallTraceLevel {
        *self.trace_level.lock().expect("wasi trace level poisoned")
    }

    fn syscall_instance(&self) -> Arc<InstanceInner> {
        self.syscall_instance
            .lock()
            .expect("wasi instance poisoned")
            .as_ref()
            .expect("the syscall module is built at process creation")
            .clone()
    }

    /// Installs an additional file descriptor endpoint, returning its
    /// descriptor number.
    pub fn insert_file(&self, file: Box<dyn WasiFile>) -> u32 {
        self.state().insert_fd(FdEntry::File(file))
    }
}

/// Creates a WASI process inside `compartment`.
///
/// `args` is the full guest argv (argv[0] first); `envs` are `KEY=value`
/// strings; `fs` is the filesystem capability the guest gets, if any, with
/// its root preopened as fd 3.
pub fn create_process(
    compartment: &Arc<Compartment>,
    args: Vec<String>,
    envs: Vec<String>,
    fs: Option<Arc<dyn FileSystem>>,
    stdin: Box<dyn WasiFile>,
    stdout: Box<dyn WasiFile>,
    stderr: Box<dyn WasiFile>,
) -> Arc<WasiProcess> {
    let process = Arc::new(WasiProcess {
        state: Mutex::new(WasiState::new(args, envs, fs, stdin, stdout, stderr)),
        memory: Mutex::new(None),
        trace_level: Mutex::new(SyscallTraceLevel::None),
        syscall_instance: Mutex::new(None),
    });

    let exports = syscalls::wasi_namespace(Arc::downgrade(&process));
    let instance = InstanceInner::from_exports(compartment, "wasiProcess", exports);
    *process
        .syscall_instance
        .lock()
        .expect("wasi instance poisoned") = Some(instance);

    process
}

/// Binds the guest module's exported memory as the process memory the
/// syscalls operate on.
pub fn set_process_memory(process: &WasiProcess, memory: Arc<Memory>) {
    *process.memory.lock().expect("wasi memory poisoned") = Some(memory);
}

/// Sets the syscall trace level of a process.
pub fn set_syscall_trace_level(process: &WasiProcess, level: SyscallTraceLevel) {
    *process.trace_level.lock().expect("wasi trace level poisoned") = level;
}

/// The resolver the driver links WASI modules with: it answers only for the
/// `wasi_unstable` namespace.
pub struct ProcessResolver {
    instance: Arc<InstanceInner>,
}

impl Resolver for ProcessResolver {
    fn resolve(
        &mut self,
        module_name: &str,
        export_name: &str,
        expected: &ExternType,
    ) -> Option<Object> {
        if module_name != WASI_NAMESPACE {
            return None;
        }
        let object = self.instance.get_export(export_name)?;
        if wavm_runtime_core::object::is_a(&object, expected) {
            Some(object)
        } else {
            log::error!(
                "Resolved import {}.{} to a {}, but was expecting {}",
                module_name,
                export_name,
                wavm_runtime_core::object::object_type(&object),
                expected
            );
            None
        }
    }
}

/// The resolver over a process's syscall module.
pub fn get_process_resolver(process: &WasiProcess) -> ProcessResolver {
    ProcessResolver {
        instance: process.syscall_instance(),
    }
}

/// Does the module look like a system-interface module? True iff any
/// function import names the WASI namespace.
pub fn is_wasi_module(info: &ModuleInfo) -> bool {
    info.imports_function_from(WASI_NAMESPACE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wavm_runtime_core::{
        context::Context,
        error::RuntimeError,
        features::FeatureSpec,
        instance::Instance,
        linker::link_module,
        types::Value,
    };

    const HELLO_WAT: &str = r#"(module
        (import "wasi_unstable" "fd_write"
            (func $fd_write (param i32 i32 i32 i32) (result i32)))
        (memory (export "memory") 1)
        (data (i32.const 16) "hello\n")
        (func (export "_start")
            ;; iovec at 0: base 16, length 6
            i32.const 0
            i32.const 16
            i32.store
            i32.const 4
            i32.const 6
            i32.store
            i32.const 1   ;; stdout
            i32.const 0   ;; iovs
            i32.const 1   ;; iovs_len
            i32.const 24  ;; nwritten
            call $fd_write
            drop))"#;

    fn run_start(wat: &str, process: &Arc<WasiProcess>, compartment: &Arc<Compartment>) {
        let wasm = wabt::wat2wasm(wat).unwrap();
        let module = wavm_interp_backend::compile(&wasm, &FeatureSpec::default()).unwrap();
        assert!(is_wasi_module(module.info()));

        let mut resolver = get_process_resolver(process);
        let link = link_module(module.info(), &mut resolver);
        assert!(link.success(), "{:?}", link.missing_imports);

        let instance =
            Instance::new(compartment, &module, &link.resolved_imports, "wasi-test").unwrap();
        let memory = instance
            .get_export("memory")
            .and_then(|object| object.as_memory().cloned())
            .expect("WASM module doesn't export WASI memory");
        set_process_memory(process, memory);

        let ctx = Context::new(compartment);
        instance.call(&ctx, "_start", &[]).unwrap();
    }

    #[test]
    fn fd_write_reaches_the_captured_stdout() {
        let compartment = Compartment::new();
        let stdout = WritePipe::new();
        let process = create_process(
            &compartment,
            vec!["/proc/1/exe".to_string()],
            vec![],
            None,
            Box::new(HostStdin),
            Box::new(stdout.clone()),
            Box::new(HostStderr),
        );
        run_start(HELLO_WAT, &process, &compartment);
        assert_eq!(process_output(&stdout), "hello\n");
    }

    fn process_output(pipe: &WritePipe) -> String {
        String::from_utf8(pipe.contents()).unwrap()
    }

    #[test]
    fn proc_exit_surfaces_as_a_host_exit() {
        let compartment = Compartment::new();
        let process = create_process(
            &compartment,
            vec!["/proc/1/exe".to_string()],
            vec![],
            None,
            Box::new(HostStdin),
            Box::new(WritePipe::new()),
            Box::new(HostStderr),
        );

        let wat = r#"(module
            (import "wasi_unstable" "proc_exit" (func $proc_exit (param i32)))
            (memory (export "memory") 1)
            (func (export "_start")
                i32.const 17
                call $proc_exit))"#;
        let wasm = wabt::wat2wasm(wat).unwrap();
        let module = wavm_interp_backend::compile(&wasm, &FeatureSpec::default()).unwrap();
        let mut resolver = get_process_resolver(&process);
        let link = link_module(module.info(), &mut resolver);
        let instance =
            Instance::new(&compartment, &module, &link.resolved_imports, "exit-test").unwrap();
        let memory = instance
            .get_export("memory")
            .and_then(|object| object.as_memory().cloned())
            .unwrap();
        set_process_memory(&process, memory);

        let ctx = Context::new(&compartment);
        match instance.call(&ctx, "_start", &[]) {
            Err(wavm_runtime_core::error::CallError::Runtime(RuntimeError::HostExit(17))) => {}
            other => panic!("expected a host exit, got {:?}", other.err()),
        }
    }

    #[test]
    fn args_are_visible_to_the_guest() {
        let compartment = Compartment::new();
        let process = create_process(
            &compartment,
            vec!["/proc/1/exe".to_string(), "2".to_string(), "3".to_string()],
            vec!["HOME=/".to_string()],
            None,
            Box::new(HostStdin),
            Box::new(WritePipe::new()),
            Box::new(HostStderr),
        );

        let wat = r#"(module
            (import "wasi_unstable" "args_sizes_get"
                (func $args_sizes_get (param i32 i32) (result i32)))
            (memory (export "memory") 1)
            (func (export "argc") (result i32)
                i32.const 0
                i32.const 4
                call $args_sizes_get
                drop
                i32.const 0
                i32.load))"#;
        let wasm = wabt::wat2wasm(wat).unwrap();
        let module = wavm_interp_backend::compile(&wasm, &FeatureSpec::default()).unwrap();
        let mut resolver = get_process_resolver(&process);
        let link = link_module(module.info(), &mut resolver);
        let instance =
            Instance::new(&compartment, &module, &link.resolved_imports, "args-test").unwrap();
        let memory = instance
            .get_export("memory")
            .and_then(|object| object.as_memory().cloned())
            .unwrap();
        set_process_memory(&process, memory);

        let ctx = Context::new(&compartment);
        assert_eq!(
            instance.call(&ctx, "argc", &[]).unwrap(),
            vec![Value::I32(3)]
        );
    }

    #[test]
    fn the_sandbox_root_is_preopened() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"A").unwrap();

        let compartment = Compartment::new();
        let process = create_process(
            &compartment,
            vec!["/proc/1/exe".to_string()],
            vec![],
            Some(make_sandbox_fs(dir.path())),
            Box::new(HostStdin),
            Box::new(WritePipe::new()),
            Box::new(HostStderr),
        );

        // The preopen occupies fd 3 and reports the guest root.
        let mut state = process.state();
        match state.fd(3) {
            Some(FdEntry::PreopenDir { guest_path }) => assert_eq!(guest_path, "/"),
            _ => panic!("expected fd 3 to be the preopened root"),
        }
        drop(state);

        // The capability only sees the mount root.
        let fs = process.state().fs.as_ref().unwrap().clone();
        let entries = fs.read_dir("/").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a.txt");
    }
}
