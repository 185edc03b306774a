//! Legacy Emscripten ABI shim for the wavm runtime.
//!
//! Emscripten-compiled modules import their memory and table from `env`
//! together with a raft of runtime functions. This shim owns that memory and
//! table, provides the load-bearing subset of the `env`, `global` and
//! `asm2wasm` namespaces, and leaves the long tail to the stub resolver so
//! unresolved imports fail at call time, the way the driver links them.

#![deny(nonstandard_style, unused_mut, unreachable_patterns)]

use smallvec::smallvec;
use std::sync::{Arc, Mutex};
use wavm_runtime_core::{
    compartment::Compartment,
    context::Context,
    error::{CreationError, RuntimeError, Trap},
    global::Global,
    host_function,
    instance::{Instance, InstanceInner},
    memory::Memory,
    module::ModuleInfo,
    object::Object,
    table::Table,
    types::{GlobalType, RawValue, Type, Value},
};

/// Guest address of the word holding the dynamic-allocation top.
const DYNAMICTOP_PTR_ADDRESS: u32 = 16;
/// Base of static data, by Emscripten convention.
const MEMORY_BASE: u32 = 1024;
/// Base of the indirect-call table.
const TABLE_BASE: u32 = 0;
/// Top of the shadow stack.
const STACKTOP: u32 = 64 * 1024;
/// Limit of the shadow stack.
const STACK_MAX: u32 = 256 * 1024;
/// First address handed out to command-line argument injection and the
/// dynamic allocator.
const DYNAMIC_BASE: u32 = 512 * 1024;

/// Does the module look like an Emscripten module? True iff it imports a
/// memory named `env.memory` and at least one function from `env`.
pub fn is_emscripten_module(info: &ModuleInfo) -> bool {
    let imports_env_memory = info
        .imported_memories
        .iter()
        .next()
        .map(|(_, (name, _))| name.namespace == "env" && name.name == "memory")
        .unwrap_or(false);
    imports_env_memory && info.imports_function_from("env")
}

/// The instantiated Emscripten environment: the `env`, `global` and
/// `asm2wasm` namespaces plus the memory and table they own.
pub struct EmscriptenInstance {
    /// The `env` namespace.
    pub env: Arc<InstanceInner>,
    /// The `global` namespace.
    pub global: Arc<InstanceInner>,
    /// The `asm2wasm` namespace.
    pub asm2wasm: Arc<InstanceInner>,
    memory: Arc<Memory>,
    /// Bump pointer for host-side writes into guest memory.
    alloc_top: Mutex<u32>,
}

impl EmscriptenInstance {
    /// The memory the environment owns (the module imports it as
    /// `env.memory`).
    pub fn memory(&self) -> &Arc<Memory> {
        &self.memory
    }

    /// Writes `bytes` into guest memory at the next bump-allocated address.
    fn write_bytes(&self, bytes: &[u8]) -> Result<u32, RuntimeError> {
        let mut top = self.alloc_top.lock().expect("emscripten allocator poisoned");
        let address = (*top + 7) & !7;
        self.memory
            .write(address as usize, bytes)
            .map_err(RuntimeError::from)?;
        *top = address + bytes.len() as u32;
        Ok(address)
    }

    /// Writes the command line into guest memory and produces the
    /// `(argc, argv)` invoke arguments `main` expects.
    pub fn inject_command_args(&self, args: &[String]) -> Result<Vec<Value>, RuntimeError> {
        let mut pointers: Vec<u32> = Vec::with_capacity(args.len() + 1);
        for arg in args {
            let mut bytes = arg.as_bytes().to_vec();
            bytes.push(0);
            pointers.push(self.write_bytes(&bytes)?);
        }
        pointers.push(0);

        let mut pointer_bytes = Vec::with_capacity(pointers.len() * 4);
        for pointer in &pointers {
            pointer_bytes.extend_from_slice(&pointer.to_le_bytes());
        }
        let argv = self.write_bytes(&pointer_bytes)?;

        Ok(vec![Value::I32(args.len() as i32), Value::I32(argv as i32)])
    }

    /// Runs the module's Emscripten global initializers, when it has any.
    pub fn initialize_globals(&self, ctx: &Context, instance: &Instance) {
        for &name in &["__post_instantiate", "___emscripten_environ_constructor"] {
            if let Some(object) = instance.get_export(name) {
                if object.as_function().is_some() {
                    if let Err(error) = instance.call(ctx, name, &[]) {
                        log::warn!("Emscripten initializer {} failed: {}", name, error);
                    }
                }
            }
        }
    }
}

fn immutable_global(ty: Type, value: Value) -> Result<Object, CreationError> {
    Ok(Object::Global(Global::new(
        None,
        GlobalType { mutable: false, ty },
        value,
    )?))
}

/// Instantiates the Emscripten environment for a module, sizing the memory
/// and table from the module's own `env.memory` and `env.table` import
/// declarations. Returns `None` for modules that do not import `env.memory`.
pub fn instantiate(
    compartment: &Arc<Compartment>,
    info: &ModuleInfo,
) -> Result<Option<EmscriptenInstance>, CreationError> {
    if !is_emscripten_module(info) {
        return Ok(None);
    }

    let memory_type = match info.imported_memories.iter().next() {
        Some((_, (_, memory_type))) => *memory_type,
        None => return Ok(None),
    };
    let memory = Memory::new(compartment, memory_type)?;

    let table = match info.imported_tables.iter().next() {
        Some((_, (name, table_type))) if name.namespace == "env" => {
            Some(Table::new(compartment, *table_type)?)
        }
        _ => None,
    };

    // Seed the dynamic-top word.
    memory
        .write(
            DYNAMICTOP_PTR_ADDRESS as usize,
            &DYNAMIC_BASE.to_le_bytes(),
        )
        .map_err(|_| CreationError::UnableToCreateMemory)?;

    let mut env: Vec<(String, Object)> = vec![
        ("memory".to_string(), Object::Memory(Arc::clone(&memory))),
        (
            "memoryBase".to_string(),
            immutable_global(Type::I32, Value::I32(MEMORY_BASE as i32))?,
        ),
        (
            "__memory_base".to_string(),
            immutable_global(Type::I32, Value::I32(MEMORY_BASE as i32))?,
        ),
        (
            "tableBase".to_string(),
            immutable_global(Type::I32, Value::I32(TABLE_BASE as i32))?,
        ),
        (
            "__table_base".to_string(),
            immutable_global(Type::I32, Value::I32(TABLE_BASE as i32))?,
        ),
        (
            "DYNAMICTOP_PTR".to_string(),
            immutable_global(Type::I32, Value::I32(DYNAMICTOP_PTR_ADDRESS as i32))?,
        ),
        (
            "STACKTOP".to_string(),
            immutable_global(Type::I32, Value::I32(STACKTOP as i32))?,
        ),
        (
            "STACK_MAX".to_string(),
            immutable_global(Type::I32, Value::I32(STACK_MAX as i32))?,
        ),
    ];
    if let Some(table) = &table {
        env.push(("table".to_string(), Object::Table(Arc::clone(table))));
    }

    use Type::{F64, I32};

    env.push(host_function!("abort", () -> (), |_, _: &[RawValue]| {
        Err(Trap::CalledAbort.into())
    }));
    env.push(host_function!("_abort", () -> (), |_, _: &[RawValue]| {
        Err(Trap::CalledAbort.into())
    }));
    env.push(host_function!("abortOnCannotGrowMemory", () -> (I32), |_, _: &[RawValue]| {
        Err(Trap::CalledAbort.into())
    }));
    env.push(host_function!("_exit", (I32) -> (), |_, args: &[RawValue]| {
        Err(RuntimeError::HostExit(args[0].as_i32()))
    }));
    env.push(host_function!("exit", (I32) -> (), |_, args: &[RawValue]| {
        Err(RuntimeError::HostExit(args[0].as_i32()))
    }));

    {
        let memory = Arc::clone(&memory);
        env.push(host_function!("getTotalMemory", () -> (I32), move |_, _: &[RawValue]| {
            Ok(smallvec![RawValue::from_i32(memory.size() as i32)])
        }));
    }
    {
        let memory = Arc::clone(&memory);
        env.push(host_function!("_emscripten_memcpy_big", (I32, I32, I32) -> (I32), move |_, args: &[RawValue]| {
            let dest = args[0].as_u32();
            let src = args[1].as_u32();
            let len = args[2].as_u32();
            let bytes = memory
                .read(src as usize, len as usize)
                .map_err(RuntimeError::from)?;
            memory
                .write(dest as usize, &bytes)
                .map_err(RuntimeError::from)?;
            Ok(smallvec![RawValue::from_i32(dest as i32)])
        }));
    }
    {
        let memory = Arc::clone(&memory);
        env.push(host_function!("_emscripten_get_heap_size", () -> (I32), move |_, _: &[RawValue]| {
            Ok(smallvec![RawValue::from_i32(memory.size() as i32)])
        }));
    }

    let env_instance = InstanceInner::from_exports(compartment, "emscripten:env", env);

    let global = vec![
        (
            "NaN".to_string(),
            immutable_global(Type::F64, Value::F64(f64::NAN))?,
        ),
        (
            "Infinity".to_string(),
            immutable_global(Type::F64, Value::F64(f64::INFINITY))?,
        ),
    ];
    let global_instance = InstanceInner::from_exports(compartment, "emscripten:global", global);

    let asm2wasm = vec![
        host_function!("f64-rem", (F64, F64) -> (F64), |_, args: &[RawValue]| {
            Ok(smallvec![RawValue::from_f64(args[0].as_f64() % args[1].as_f64())])
        }),
        host_function!("f64-to-int", (F64) -> (I32), |_, args: &[RawValue]| {
            Ok(smallvec![RawValue::from_i32(args[0].as_f64() as i32)])
        }),
        host_function!("debugger", () -> (), |_, _: &[RawValue]| {
            log::debug!("asm2wasm.debugger");
            Ok(smallvec![])
        }),
    ];
    let asm2wasm_instance =
        InstanceInner::from_exports(compartment, "emscripten:asm2wasm", asm2wasm);

    Ok(Some(EmscriptenInstance {
        env: env_instance,
        global: global_instance,
        asm2wasm: asm2wasm_instance,
        memory,
        alloc_top: Mutex::new(DYNAMIC_BASE),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wavm_runtime_core::{
        features::FeatureSpec,
        linker::{link_module, RootResolver},
        types::Value,
    };

    const EMSCRIPTEN_WAT: &str = r#"(module
        (import "env" "memory" (memory 16))
        (import "env" "_abort" (func $abort))
        (import "env" "missing_syscall" (func $missing (param i32) (result i32)))
        (func (export "_main") (param i32 i32) (result i32)
            i32.const 0))"#;

    fn parsed(wat: &str) -> ModuleInfo {
        let wasm = wabt::wat2wasm(wat).unwrap();
        wavm_runtime_core::parse::read_module(&wasm, &FeatureSpec::default())
            .unwrap()
            .0
    }

    #[test]
    fn detection_follows_the_env_memory_rule() {
        assert!(is_emscripten_module(&parsed(EMSCRIPTEN_WAT)));
        assert!(!is_emscripten_module(&parsed(
            r#"(module (import "env" "f" (func)))"#
        )));
        assert!(!is_emscripten_module(&parsed(
            r#"(module (import "other" "memory" (memory 1)))"#
        )));
    }

    #[test]
    fn the_long_tail_links_through_the_stub_resolver() {
        let compartment = Compartment::new();
        let info = parsed(EMSCRIPTEN_WAT);
        let emscripten = instantiate(&compartment, &info).unwrap().unwrap();

        let mut resolver = RootResolver::new();
        resolver.register("env", Arc::clone(&emscripten.env));
        resolver.register("global", Arc::clone(&emscripten.global));
        resolver.register("asm2wasm", Arc::clone(&emscripten.asm2wasm));

        let link = link_module(&info, &mut resolver);
        assert!(link.success());
    }

    #[test]
    fn stubbed_imports_trap_at_call_time() {
        let compartment = Compartment::new();
        let wasm = wabt::wat2wasm(
            r#"(module
                (import "env" "memory" (memory 16))
                (import "env" "missing_syscall" (func $missing (param i32) (result i32)))
                (func (export "_main") (param i32 i32) (result i32)
                    i32.const 7
                    call $missing))"#,
        )
        .unwrap();
        let module = wavm_interp_backend::compile(&wasm, &FeatureSpec::default()).unwrap();
        let emscripten = instantiate(&compartment, module.info()).unwrap().unwrap();

        let mut resolver = RootResolver::new();
        resolver.register("env", Arc::clone(&emscripten.env));
        let link = link_module(module.info(), &mut resolver);
        assert!(link.success());

        let instance = wavm_runtime_core::instance::Instance::new(
            &compartment,
            &module,
            &link.resolved_imports,
            "em-test",
        )
        .unwrap();
        let ctx = wavm_runtime_core::context::Context::new(&compartment);
        let args = emscripten.inject_command_args(&["test".to_string()]).unwrap();
        match instance.call(&ctx, "_main", &args) {
            Err(wavm_runtime_core::error::CallError::Runtime(RuntimeError::Trap(
                Trap::CalledAbort,
            ))) => {}
            other => panic!("expected the stub to abort, got {:?}", other.err()),
        }
    }

    #[test]
    fn command_args_are_injected_into_guest_memory() {
        let compartment = Compartment::new();
        let info = parsed(EMSCRIPTEN_WAT);
        let emscripten = instantiate(&compartment, &info).unwrap().unwrap();

        let args = vec!["program".to_string(), "one".to_string()];
        let invoke_args = emscripten.inject_command_args(&args).unwrap();
        assert_eq!(invoke_args[0], Value::I32(2));

        let argv = match invoke_args[1] {
            Value::I32(argv) => argv as u32,
            _ => unreachable!(),
        };
        let memory = emscripten.memory();
        let argv0 = u32::from_le_bytes(memory.load::<4>(argv as usize).unwrap());
        let bytes = memory.read(argv0 as usize, 8).unwrap();
        assert_eq!(&bytes[..8], b"program\0");
    }
}
