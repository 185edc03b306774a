//! Interpreter backend for the wavm runtime.
//!
//! This backend lowers validated WebAssembly into flat, directly executable
//! bodies and exposes them through the runtime's backend interface. It has
//! no host-CPU requirements, serializes its compiled form for the object
//! cache and the precompiled-object section, and consults the process-wide
//! object cache transparently when one is installed.

#![deny(nonstandard_style, unused_mut, unreachable_patterns)]

#[macro_use]
extern crate serde_derive;

mod codegen;
mod exec;
mod ops;

use crate::codegen::LoweredFunction;
use crate::exec::InterpModule;
use std::hash::Hasher;
use twox_hash::XxHash64;
use wavm_runtime_core::{
    backend::{global_object_cache, Compiler, ObjectLoadError, Token},
    error::CompileResult,
    features::FeatureSpec,
    module::{ModuleInfo, ModuleInner},
    parse::read_module,
    structures::TypedIndex,
    types::FuncIndex,
    SigRegistry,
};

/// The current version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Serialize, Deserialize)]
struct SerializedModule {
    code_key: u64,
    info: ModuleInfo,
    functions: Vec<LoweredFunction>,
}

pub(crate) fn serialize_module(
    info: &ModuleInfo,
    functions: &[LoweredFunction],
) -> Option<Vec<u8>> {
    let serialized = SerializedModule {
        code_key: code_key(),
        info: info.clone(),
        functions: functions.to_vec(),
    };
    match bincode::serialize(&serialized) {
        Ok(bytes) => Some(bytes),
        Err(error) => {
            log::warn!("failed to serialize module object: {}", error);
            None
        }
    }
}

/// The 64-bit digest of everything that goes into compilation: the backend
/// version and the runtime-core version, hashed component by component. Any
/// change to either makes previously cached objects invisible.
pub fn code_key() -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    for component in VERSION.split('.') {
        hasher.write(component.as_bytes());
    }
    for component in wavm_runtime_core::VERSION.split('.') {
        hasher.write(component.as_bytes());
    }
    hasher.finish()
}

/// Replaces every signature in a deserialized IR with its canonical entry so
/// signature identity checks keep working across the cache boundary.
fn canonicalize_signatures(info: &mut ModuleInfo) {
    for (_, signature) in info.signatures.iter_mut() {
        *signature = SigRegistry.canonicalize(signature);
    }
}

fn decode_object(object: &[u8]) -> Result<ModuleInner, ObjectLoadError> {
    let serialized: SerializedModule = bincode::deserialize(object)
        .map_err(|error| ObjectLoadError::Corrupt(format!("{}", error)))?;
    if serialized.code_key != code_key() {
        return Err(ObjectLoadError::VersionMismatch {
            expected: code_key(),
            found: serialized.code_key,
        });
    }
    let mut info = serialized.info;
    canonicalize_signatures(&mut info);
    Ok(ModuleInner {
        runnable_module: Box::new(InterpModule {
            functions: serialized.functions,
        }),
        info,
    })
}

/// The interpreter compiler backend.
pub struct InterpCompiler;

impl InterpCompiler {
    /// Creates the backend.
    pub fn new() -> Self {
        InterpCompiler
    }
}

impl Default for InterpCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler for InterpCompiler {
    fn compile(
        &self,
        wasm: &[u8],
        features: &FeatureSpec,
        _: Token,
    ) -> CompileResult<ModuleInner> {
        // A cached object for these exact bytes (scoped to this backend's
        // code key) skips lowering entirely.
        let module_hash: [u8; 32] = blake3::hash(wasm).into();
        if let Some(cache) = global_object_cache() {
            if let Some(object) = cache.get(&module_hash) {
                match decode_object(&object) {
                    Ok(module) => {
                        log::debug!("loaded module from the object cache");
                        return Ok(module);
                    }
                    Err(error) => {
                        log::warn!("ignoring cached object: {}", error);
                    }
                }
            }
        }

        let (info, bodies) = read_module(wasm, features)?;

        let num_imported_functions = info.imported_functions.len();
        let mut functions = Vec::with_capacity(bodies.len());
        for (local_index, body) in bodies.iter().enumerate() {
            let func_index = FuncIndex::new(num_imported_functions + local_index);
            functions.push(codegen::lower_function(&info, func_index, body)?);
        }

        if let Some(cache) = global_object_cache() {
            if let Some(object) = serialize_module(&info, &functions) {
                cache.put(&module_hash, &object);
            }
        }

        Ok(ModuleInner {
            runnable_module: Box::new(InterpModule { functions }),
            info,
        })
    }

    unsafe fn from_object(
        &self,
        object: &[u8],
        _: Token,
    ) -> Result<ModuleInner, ObjectLoadError> {
        decode_object(object)
    }

    fn code_key(&self) -> u64 {
        code_key()
    }
}

/// Compiles WebAssembly binary code with this backend.
pub fn compile(
    wasm: &[u8],
    features: &FeatureSpec,
) -> CompileResult<wavm_runtime_core::Module> {
    wavm_runtime_core::compile_with(wasm, features, &InterpCompiler::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use wavm_runtime_core::{
        compartment::Compartment,
        context::Context,
        error::{RuntimeError, Trap},
        instance::Instance,
        linker::{link_module, NullResolver, RootResolver},
        types::Value,
    };

    fn instantiate(wat: &str) -> (std::sync::Arc<Compartment>, Context, Instance) {
        let wasm = wabt::wat2wasm(wat).unwrap();
        let module = compile(&wasm, &FeatureSpec::default()).unwrap();
        let compartment = Compartment::new();
        let link = link_module(module.info(), &mut NullResolver);
        assert!(link.success());
        let instance = Instance::new(&compartment, &module, &link.resolved_imports, "test").unwrap();
        let ctx = Context::new(&compartment);
        (compartment, ctx, instance)
    }

    #[test]
    fn add_two_numbers() {
        let (_compartment, ctx, instance) = instantiate(
            r#"(module
                (func (export "add") (param i32 i32) (result i32)
                    local.get 0
                    local.get 1
                    i32.add))"#,
        );
        let results = instance.call(&ctx, "add", &[Value::I32(2), Value::I32(3)]).unwrap();
        assert_eq!(results, vec![Value::I32(5)]);
    }

    #[test]
    fn division_by_zero_traps_through_the_intrinsics() {
        let (_compartment, ctx, instance) = instantiate(
            r#"(module
                (func (export "div") (param i32 i32) (result i32)
                    local.get 0
                    local.get 1
                    i32.div_s))"#,
        );
        match instance.call(&ctx, "div", &[Value::I32(1), Value::I32(0)]) {
            Err(error) => assert_eq!(
                format!("{}", error),
                "Call error: integer divide by zero or integer overflow"
            ),
            Ok(_) => panic!("expected a trap"),
        }
        match instance.call(
            &ctx,
            "div",
            &[Value::I32(i32::min_value()), Value::I32(-1)],
        ) {
            Err(_) => {}
            Ok(_) => panic!("expected a trap"),
        }
    }

    #[test]
    fn loops_and_branches() {
        let (_compartment, ctx, instance) = instantiate(
            r#"(module
                (func (export "fac") (param i64) (result i64)
                    (local i64)
                    i64.const 1
                    local.set 1
                    block
                        loop
                            local.get 0
                            i64.eqz
                            br_if 1
                            local.get 0
                            local.get 1
                            i64.mul
                            local.set 1
                            local.get 0
                            i64.const 1
                            i64.sub
                            local.set 0
                            br 0
                        end
                    end
                    local.get 1))"#,
        );
        let results = instance.call(&ctx, "fac", &[Value::I64(5)]).unwrap();
        assert_eq!(results, vec![Value::I64(120)]);
    }

    #[test]
    fn if_else_and_select() {
        let (_compartment, ctx, instance) = instantiate(
            r#"(module
                (func (export "pick") (param i32) (result i32)
                    local.get 0
                    if (result i32)
                        i32.const 10
                    else
                        i32.const 20
                    end))"#,
        );
        assert_eq!(
            instance.call(&ctx, "pick", &[Value::I32(1)]).unwrap(),
            vec![Value::I32(10)]
        );
        assert_eq!(
            instance.call(&ctx, "pick", &[Value::I32(0)]).unwrap(),
            vec![Value::I32(20)]
        );
    }

    #[test]
    fn code_after_an_unconditional_transfer_is_skipped() {
        let (_compartment, ctx, instance) = instantiate(
            r#"(module
                (func (export "early") (result i32)
                    block (result i32)
                        i32.const 7
                        br 0
                        i32.const 1
                        i32.add
                    end)
                (func (export "ret") (result i32)
                    i32.const 3
                    return
                    unreachable))"#,
        );
        assert_eq!(
            instance.call(&ctx, "early", &[]).unwrap(),
            vec![Value::I32(7)]
        );
        assert_eq!(
            instance.call(&ctx, "ret", &[]).unwrap(),
            vec![Value::I32(3)]
        );
    }

    #[test]
    fn br_table_dispatch() {
        let (_compartment, ctx, instance) = instantiate(
            r#"(module
                (func (export "classify") (param i32) (result i32)
                    block
                        block
                            block
                                local.get 0
                                br_table 0 1 2
                            end
                            i32.const 100
                            return
                        end
                        i32.const 200
                        return
                    end
                    i32.const 300))"#,
        );
        assert_eq!(
            instance.call(&ctx, "classify", &[Value::I32(0)]).unwrap(),
            vec![Value::I32(100)]
        );
        assert_eq!(
            instance.call(&ctx, "classify", &[Value::I32(1)]).unwrap(),
            vec![Value::I32(200)]
        );
        assert_eq!(
            instance.call(&ctx, "classify", &[Value::I32(7)]).unwrap(),
            vec![Value::I32(300)]
        );
    }

    #[test]
    fn memory_loads_stores_and_grow() {
        let (_compartment, ctx, instance) = instantiate(
            r#"(module
                (memory (export "memory") 1 2)
                (func (export "poke") (param i32 i32)
                    local.get 0
                    local.get 1
                    i32.store)
                (func (export "peek") (param i32) (result i32)
                    local.get 0
                    i32.load)
                (func (export "grow") (param i32) (result i32)
                    local.get 0
                    memory.grow)
                (func (export "size") (result i32)
                    memory.size))"#,
        );
        instance
            .call(&ctx, "poke", &[Value::I32(16), Value::I32(-7)])
            .unwrap();
        assert_eq!(
            instance.call(&ctx, "peek", &[Value::I32(16)]).unwrap(),
            vec![Value::I32(-7)]
        );
        assert_eq!(
            instance.call(&ctx, "size", &[]).unwrap(),
            vec![Value::I32(1)]
        );
        assert_eq!(
            instance.call(&ctx, "grow", &[Value::I32(1)]).unwrap(),
            vec![Value::I32(1)]
        );
        // Past the declared maximum the grow intrinsic reports -1.
        assert_eq!(
            instance.call(&ctx, "grow", &[Value::I32(1)]).unwrap(),
            vec![Value::I32(-1)]
        );
    }

    #[test]
    fn out_of_bounds_access_is_lifted_to_a_trap() {
        let (_compartment, ctx, instance) = instantiate(
            r#"(module
                (memory 1)
                (func (export "peek") (param i32) (result i32)
                    local.get 0
                    i32.load))"#,
        );
        match instance.call(&ctx, "peek", &[Value::I32(65536)]) {
            Err(wavm_runtime_core::error::CallError::Runtime(RuntimeError::Trap(
                Trap::AccessViolation,
            ))) => {}
            other => panic!("expected an access violation, got {:?}", other.err()),
        }
    }

    #[test]
    fn indirect_calls_check_signatures() {
        let (_compartment, ctx, instance) = instantiate(
            r#"(module
                (type $ii (func (param i32) (result i32)))
                (table 3 funcref)
                (elem (i32.const 0) $double $wrong)
                (func $double (param i32) (result i32)
                    local.get 0
                    local.get 0
                    i32.add)
                (func $wrong (param i64) (result i64)
                    local.get 0)
                (func (export "dispatch") (param i32 i32) (result i32)
                    local.get 1
                    local.get 0
                    call_indirect (type $ii)))"#,
        );
        assert_eq!(
            instance
                .call(&ctx, "dispatch", &[Value::I32(0), Value::I32(21)])
                .unwrap(),
            vec![Value::I32(42)]
        );
        // Wrong signature at slot 1.
        match instance.call(&ctx, "dispatch", &[Value::I32(1), Value::I32(21)]) {
            Err(wavm_runtime_core::error::CallError::Runtime(RuntimeError::Trap(
                Trap::IndirectCallSignatureMismatch,
            ))) => {}
            other => panic!("expected a signature mismatch, got {:?}", other.err()),
        }
        // Null element at slot 2.
        match instance.call(&ctx, "dispatch", &[Value::I32(2), Value::I32(21)]) {
            Err(wavm_runtime_core::error::CallError::Runtime(RuntimeError::Trap(
                Trap::UndefinedTableElement,
            ))) => {}
            other => panic!("expected an undefined element, got {:?}", other.err()),
        }
        // Out-of-bounds index.
        match instance.call(&ctx, "dispatch", &[Value::I32(9), Value::I32(21)]) {
            Err(wavm_runtime_core::error::CallError::Runtime(RuntimeError::Trap(
                Trap::UndefinedTableElement,
            ))) => {}
            other => panic!("expected an undefined element, got {:?}", other.err()),
        }
    }

    #[test]
    fn exports_belong_to_the_instance_compartment() {
        let (compartment, _ctx, instance) = instantiate(
            r#"(module
                (memory (export "memory") 1)
                (func (export "f")))"#,
        );
        for &name in &["memory", "f"] {
            let object = instance.get_export(name).unwrap();
            assert_eq!(object.compartment_id(), Some(compartment.id()), "{}", name);
        }
    }

    #[test]
    fn globals_live_in_the_context() {
        let (compartment, ctx, instance) = instantiate(
            r#"(module
                (global $counter (mut i32) (i32.const 0))
                (func (export "bump") (result i32)
                    global.get $counter
                    i32.const 1
                    i32.add
                    global.set $counter
                    global.get $counter))"#,
        );
        assert_eq!(
            instance.call(&ctx, "bump", &[]).unwrap(),
            vec![Value::I32(1)]
        );
        assert_eq!(
            instance.call(&ctx, "bump", &[]).unwrap(),
            vec![Value::I32(2)]
        );

        // A fresh context sees the initial value, not the other context's
        // mutations.
        let other_ctx = Context::new(&compartment);
        assert_eq!(
            instance.call(&other_ctx, "bump", &[]).unwrap(),
            vec![Value::I32(1)]
        );
    }

    #[test]
    fn imported_functions_are_called_through_the_resolver() {
        let wasm = wabt::wat2wasm(
            r#"(module
                (import "env" "mul" (func $mul (param i32 i32) (result i32)))
                (func (export "square") (param i32) (result i32)
                    local.get 0
                    local.get 0
                    call $mul))"#,
        )
        .unwrap();
        let module = compile(&wasm, &FeatureSpec::default()).unwrap();
        let compartment = Compartment::new();

        // Resolve env.mul from another instantiated module.
        let provider_wasm = wabt::wat2wasm(
            r#"(module
                (func (export "mul") (param i32 i32) (result i32)
                    local.get 0
                    local.get 1
                    i32.mul))"#,
        )
        .unwrap();
        let provider_module = compile(&provider_wasm, &FeatureSpec::default()).unwrap();
        let provider_link = link_module(provider_module.info(), &mut NullResolver);
        let provider = Instance::new(
            &compartment,
            &provider_module,
            &provider_link.resolved_imports,
            "provider",
        )
        .unwrap();

        let mut resolver = RootResolver::new();
        resolver.register("env", std::sync::Arc::clone(provider.inner()));
        let link = link_module(module.info(), &mut resolver);
        assert!(link.success());

        let instance =
            Instance::new(&compartment, &module, &link.resolved_imports, "consumer").unwrap();
        let ctx = Context::new(&compartment);
        assert_eq!(
            instance.call(&ctx, "square", &[Value::I32(9)]).unwrap(),
            vec![Value::I32(81)]
        );
    }

    #[test]
    fn float_min_max_follow_ieee_semantics() {
        let (_compartment, ctx, instance) = instantiate(
            r#"(module
                (func (export "min") (param f64 f64) (result f64)
                    local.get 0
                    local.get 1
                    f64.min)
                (func (export "max") (param f64 f64) (result f64)
                    local.get 0
                    local.get 1
                    f64.max))"#,
        );
        let min = instance
            .call(&ctx, "min", &[Value::F64(-0.0), Value::F64(0.0)])
            .unwrap();
        match min[0] {
            Value::F64(x) => assert_eq!(x.to_bits(), (-0.0f64).to_bits()),
            _ => unreachable!(),
        }
        let max = instance
            .call(&ctx, "max", &[Value::F64(-0.0), Value::F64(0.0)])
            .unwrap();
        match max[0] {
            Value::F64(x) => assert_eq!(x.to_bits(), 0.0f64.to_bits()),
            _ => unreachable!(),
        }
        let nan = instance
            .call(&ctx, "min", &[Value::F64(f64::NAN), Value::F64(3.0)])
            .unwrap();
        match nan[0] {
            Value::F64(x) => assert!(x.is_nan()),
            _ => unreachable!(),
        }
    }

    #[test]
    fn serialized_objects_round_trip() {
        let wasm = wabt::wat2wasm(
            r#"(module
                (func (export "answer") (result i32) i32.const 41 i32.const 1 i32.add))"#,
        )
        .unwrap();
        let module = compile(&wasm, &FeatureSpec::default()).unwrap();
        let object = module
            .inner()
            .runnable_module
            .serialize_object(module.info())
            .unwrap();

        let reloaded = unsafe {
            wavm_runtime_core::load_object_with(&object, &InterpCompiler::new()).unwrap()
        };

        let compartment = Compartment::new();
        let link = link_module(reloaded.info(), &mut NullResolver);
        let instance =
            Instance::new(&compartment, &reloaded, &link.resolved_imports, "reloaded").unwrap();
        let ctx = Context::new(&compartment);
        assert_eq!(
            instance.call(&ctx, "answer", &[]).unwrap(),
            vec![Value::I32(42)]
        );
    }

    #[test]
    fn objects_from_another_code_key_are_rejected() {
        let wasm = wabt::wat2wasm(r#"(module (func (export "f")))"#).unwrap();
        let module = compile(&wasm, &FeatureSpec::default()).unwrap();
        let mut object = module
            .inner()
            .runnable_module
            .serialize_object(module.info())
            .unwrap();
        // The code key is the first field of the encoding; flip it.
        object[0] ^= 0xFF;

        match unsafe { wavm_runtime_core::load_object_with(&object, &InterpCompiler::new()) } {
            Err(ObjectLoadError::VersionMismatch { .. }) => {}
            other => panic!("expected a version mismatch, got {:?}", other.err()),
        }
    }

    #[test]
    fn deep_recursion_traps_instead_of_exhausting_the_host_stack() {
        let (_compartment, ctx, instance) = instantiate(
            r#"(module
                (func $spin (export "spin") (param i32) (result i32)
                    local.get 0
                    call $spin))"#,
        );
        match instance.call(&ctx, "spin", &[Value::I32(0)]) {
            Err(wavm_runtime_core::error::CallError::Runtime(RuntimeError::Trap(
                Trap::StackOverflow,
            ))) => {}
            other => panic!("expected a stack overflow, got {:?}", other.err()),
        }
    }
}
