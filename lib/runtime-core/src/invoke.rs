//! The invoke module implements the host-to-wasm call path: arguments are
//! marshalled into the calling context's thunk scratch region, an invoke
//! thunk specialized per `(signature, calling convention)` moves them into
//! the callee and the returns back, and the host reads the returns out of
//! the same scratch region.

use crate::{
    context::Context,
    compartment::MAX_THUNK_ARG_AND_RETURN_BYTES,
    error::{RuntimeError, RuntimeResult, Trap},
    object::{CallingConvention, FuncKind, Function, HostFnReturn},
    types::{FuncSig, RawValue, Type, Value},
};
use hashbrown::HashMap;
use smallvec::SmallVec;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

/// The scratch-region layout of one signature: an offset per value, 8-byte
/// slots for scalars, 16-byte aligned 16-byte slots for `v128`.
#[derive(Debug, Clone)]
struct ScratchLayout {
    slots: Vec<(Type, usize)>,
    num_bytes: usize,
}

impl ScratchLayout {
    fn new(types: &[Type]) -> Result<ScratchLayout, Trap> {
        let mut slots = Vec::with_capacity(types.len());
        let mut offset = 0usize;
        for &ty in types {
            if ty == Type::V128 {
                // Use 16-byte alignment for v128 values.
                offset = (offset + 15) & !15;
            }
            if offset >= MAX_THUNK_ARG_AND_RETURN_BYTES {
                // The invoke uses too much memory for arguments.
                return Err(Trap::OutOfMemory);
            }
            slots.push((ty, offset));
            offset += if ty == Type::V128 { 16 } else { 8 };
        }
        Ok(ScratchLayout {
            slots,
            num_bytes: offset,
        })
    }

    fn write(&self, ctx: &Context, values: &[RawValue]) {
        debug_assert_eq!(values.len(), self.slots.len());
        for ((ty, offset), value) in self.slots.iter().zip(values) {
            let width = if *ty == Type::V128 { 16 } else { 8 };
            let bytes = value.to_le_bytes();
            ctx.runtime_data().write_scratch(*offset, &bytes[..width]);
        }
    }

    fn read(&self, ctx: &Context) -> SmallVec<[RawValue; 1]> {
        self.slots
            .iter()
            .map(|(ty, offset)| {
                let width = if *ty == Type::V128 { 16 } else { 8 };
                let bytes = ctx.runtime_data().read_scratch(*offset, width);
                RawValue::from_bytes(&bytes[..width])
            })
            .collect()
    }
}

/// An invoke thunk: moves arguments from the scratch region into the callee
/// entry point and the returns back into the scratch region.
pub struct InvokeThunk {
    signature: Arc<FuncSig>,
    calling_convention: CallingConvention,
    arg_layout: ScratchLayout,
    ret_layout: ScratchLayout,
}

impl InvokeThunk {
    /// Runs `function` inside `ctx`, marshalling through the scratch region.
    pub fn call(&self, function: &Function, ctx: &Context) -> RuntimeResult<()> {
        debug_assert_eq!(self.calling_convention, function.calling_convention());

        let args = self.arg_layout.read(ctx);
        let mut rets: SmallVec<[RawValue; 1]> =
            SmallVec::from_elem(RawValue::zero(), self.signature.returns().len());

        match function.kind() {
            FuncKind::Host(host_fn) => {
                let returned: HostFnReturn = host_fn(ctx, &args)?;
                debug_assert_eq!(returned.len(), rets.len());
                rets.copy_from_slice(&returned);
            }
            FuncKind::Wasm {
                instance,
                local_index,
            } => {
                let instance = instance
                    .upgrade()
                    .expect("an instance is owned by its compartment for the compartment's whole lifetime");
                instance.module.runnable_module.call_local_function(
                    &instance,
                    ctx,
                    *local_index,
                    &args,
                    &mut rets,
                )?;
            }
        }

        self.ret_layout.write(ctx, &rets);
        Ok(())
    }
}

lazy_static! {
    static ref INVOKE_THUNKS: Mutex<HashMap<(usize, CallingConvention), Arc<InvokeThunk>>> =
        Mutex::new(HashMap::new());
}

/// The memoized invoke thunk for a `(signature, calling convention)` pair.
///
/// Signatures are canonical, so the signature's address identifies it for
/// the process lifetime.
pub fn invoke_thunk(
    signature: &Arc<FuncSig>,
    calling_convention: CallingConvention,
) -> RuntimeResult<Arc<InvokeThunk>> {
    let key = (Arc::as_ptr(signature) as usize, calling_convention);
    let mut thunks = INVOKE_THUNKS.lock().expect("invoke thunk table poisoned");
    if let Some(thunk) = thunks.get(&key) {
        return Ok(Arc::clone(thunk));
    }

    let thunk = Arc::new(InvokeThunk {
        signature: Arc::clone(signature),
        calling_convention,
        arg_layout: ScratchLayout::new(signature.params())?,
        ret_layout: ScratchLayout::new(signature.returns())?,
    });
    thunks.insert(key, Arc::clone(&thunk));
    Ok(thunk)
}

/// Invokes `function` inside `ctx` with untagged arguments the caller
/// guarantees to match the function's signature in arity and types.
///
/// Returns the untagged results read back from the scratch region.
pub fn invoke_function_unchecked(
    ctx: &Context,
    function: &Function,
    arguments: &[RawValue],
) -> RuntimeResult<SmallVec<[RawValue; 1]>> {
    if let Some(owner) = function.compartment_id() {
        debug_assert_eq!(
            owner,
            ctx.compartment().id(),
            "objects never cross compartments"
        );
    }

    let thunk = invoke_thunk(function.signature(), function.calling_convention())?;

    // Copy the arguments into the thunk scratch region of the context
    // runtime data, then dispatch through the thunk, which leaves the
    // returns in the same region.
    thunk.arg_layout.write(ctx, arguments);
    thunk.call(function, ctx)?;
    Ok(thunk.ret_layout.read(ctx))
}

/// Invokes `function` inside `ctx`, validating argument arity and types
/// first and re-tagging the results.
pub fn invoke_function_checked(
    ctx: &Context,
    function: &Function,
    arguments: &[Value],
) -> RuntimeResult<Vec<Value>> {
    let signature = function.signature();
    if !signature.check_param_value_types(arguments) {
        return Err(Trap::InvokeSignatureMismatch.into());
    }

    let untagged: SmallVec<[RawValue; 8]> =
        arguments.iter().map(|value| value.to_raw()).collect();
    let results = invoke_function_unchecked(ctx, function, &untagged)?;

    Ok(signature
        .returns()
        .iter()
        .zip(results)
        .map(|(&ty, raw)| Value::from_raw(ty, raw))
        .collect())
}

/// Direct dispatch used by running code: calls `function` with untagged
/// arguments without marshalling through the scratch region, the way a
/// compiled call instruction reaches its callee. The caller guarantees the
/// arguments match the signature.
pub fn call_direct(
    ctx: &Context,
    function: &Function,
    arguments: &[RawValue],
) -> RuntimeResult<SmallVec<[RawValue; 1]>> {
    match function.kind() {
        FuncKind::Host(host_fn) => host_fn(ctx, arguments),
        FuncKind::Wasm {
            instance,
            local_index,
        } => {
            let instance = instance
                .upgrade()
                .expect("an instance is owned by its compartment for the compartment's whole lifetime");
            let mut rets: SmallVec<[RawValue; 1]> =
                SmallVec::from_elem(RawValue::zero(), function.signature().returns().len());
            instance.module.runnable_module.call_local_function(
                &instance,
                ctx,
                *local_index,
                arguments,
                &mut rets,
            )?;
            Ok(rets)
        }
    }
}

/// Bounds the host's exposure to runtime errors: any [`RuntimeError`] (or
/// guest panic) escaping `run` is handed to `on_exception` instead of
/// propagating.
pub fn catch_runtime_exceptions<R>(
    run: impl FnOnce() -> Result<R, RuntimeError>,
    on_exception: impl FnOnce(RuntimeError) -> R,
) -> R {
    match panic::catch_unwind(AssertUnwindSafe(run)) {
        Ok(Ok(result)) => result,
        Ok(Err(error)) => on_exception(error),
        Err(payload) => on_exception(RuntimeError::User(payload)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compartment::Compartment;
    use crate::object::{CallingConvention, Function};
    use crate::types::FuncSig;
    use crate::SigRegistry;
    use smallvec::smallvec;

    fn add_function() -> Arc<Function> {
        let signature =
            SigRegistry.canonicalize(&FuncSig::new(vec![Type::I32, Type::I32], vec![Type::I32]));
        Function::host(
            signature,
            CallingConvention::Intrinsic,
            "test.add",
            Arc::new(|_, args| {
                let sum = args[0].as_i32().wrapping_add(args[1].as_i32());
                Ok(smallvec![RawValue::from_i32(sum)])
            }),
        )
    }

    #[test]
    fn unchecked_invoke_marshals_through_the_scratch_region() {
        let compartment = Compartment::new();
        let ctx = Context::new(&compartment);
        let add = add_function();

        let results = invoke_function_unchecked(
            &ctx,
            &add,
            &[RawValue::from_i32(2), RawValue::from_i32(3)],
        )
        .unwrap();
        assert_eq!(results[0].as_i32(), 5);

        // The return value is still visible in the scratch region.
        let bytes = ctx.runtime_data().read_scratch(0, 8);
        assert_eq!(RawValue::from_bytes(&bytes[..8]).as_i32(), 5);
    }

    #[test]
    fn repeated_invocation_is_deterministic() {
        let compartment = Compartment::new();
        let ctx = Context::new(&compartment);
        let add = add_function();
        let args = [RawValue::from_i32(41), RawValue::from_i32(1)];

        let first = invoke_function_unchecked(&ctx, &add, &args).unwrap();
        let second = invoke_function_unchecked(&ctx, &add, &args).unwrap();
        assert_eq!(first[0].as_i32(), second[0].as_i32());
    }

    #[test]
    fn checked_invoke_rejects_arity_and_type_mismatches() {
        let compartment = Compartment::new();
        let ctx = Context::new(&compartment);
        let add = add_function();

        match invoke_function_checked(&ctx, &add, &[Value::I32(1)]) {
            Err(RuntimeError::Trap(Trap::InvokeSignatureMismatch)) => {}
            other => panic!("expected a signature mismatch, got {:?}", other),
        }
        match invoke_function_checked(&ctx, &add, &[Value::I32(1), Value::F32(2.0)]) {
            Err(RuntimeError::Trap(Trap::InvokeSignatureMismatch)) => {}
            other => panic!("expected a signature mismatch, got {:?}", other),
        }
        let results = invoke_function_checked(&ctx, &add, &[Value::I32(1), Value::I32(2)]).unwrap();
        assert_eq!(results, vec![Value::I32(3)]);
    }

    #[test]
    fn thunks_are_memoized_per_signature_and_convention() {
        let signature =
            SigRegistry.canonicalize(&FuncSig::new(vec![Type::F64], vec![Type::F64]));
        let a = invoke_thunk(&signature, CallingConvention::Wasm).unwrap();
        let b = invoke_thunk(&signature, CallingConvention::Wasm).unwrap();
        let c = invoke_thunk(&signature, CallingConvention::Intrinsic).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn catch_runtime_exceptions_bounds_errors() {
        let caught = catch_runtime_exceptions(
            || Err(RuntimeError::Trap(Trap::ReachedUnreachable)),
            |error| format!("Runtime exception: {}", error),
        );
        assert_eq!(caught, "Runtime exception: reached unreachable code");
    }
}
