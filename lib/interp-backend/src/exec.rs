//! The execution half of the backend: runs lowered bodies against a module
//! instance and a context. Runtime-library behavior (traps, memory
//! grow/size) is reached through the compartment's intrinsics module, the
//! same entry points a machine-code backend would emit calls to.

use crate::codegen::LoweredFunction;
use crate::ops::Op;
use smallvec::SmallVec;
use std::cell::Cell;
use std::sync::Arc;
use wavm_runtime_core::{
    backend::RunnableModule,
    context::Context,
    error::{RuntimeError, RuntimeResult, Trap},
    instance::InstanceInner,
    intrinsics,
    invoke::call_direct,
    memory::Memory,
    module::ModuleInfo,
    structures::TypedIndex,
    types::{FuncIndex, LocalFuncIndex, RawValue, SigIndex},
    SigRegistry,
};

/// Recursion limit of the evaluator; beyond it the guest gets a stack
/// overflow trap instead of exhausting the host stack.
const MAX_CALL_DEPTH: usize = 1024;

thread_local! {
    static CALL_DEPTH: Cell<usize> = Cell::new(0);
}

struct DepthGuard;

impl DepthGuard {
    fn enter() -> Result<DepthGuard, Trap> {
        CALL_DEPTH.with(|depth| {
            if depth.get() >= MAX_CALL_DEPTH {
                Err(Trap::StackOverflow)
            } else {
                depth.set(depth.get() + 1);
                Ok(DepthGuard)
            }
        })
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        CALL_DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

/// A compiled module as the interpreter backend represents it: one lowered
/// body per local function.
pub struct InterpModule {
    pub(crate) functions: Vec<LoweredFunction>,
}

impl RunnableModule for InterpModule {
    fn call_local_function(
        &self,
        instance: &Arc<InstanceInner>,
        ctx: &Context,
        index: LocalFuncIndex,
        args: &[RawValue],
        rets: &mut [RawValue],
    ) -> RuntimeResult<()> {
        let function = self
            .functions
            .get(index.index())
            .expect("local function indices are validated at compile time");

        let traced_name = if log::log_enabled!(log::Level::Trace) {
            let flat = FuncIndex::new(instance.module.info.imported_functions.len() + index.index());
            instance
                .function_by_index(flat)
                .map(|f| f.debug_name().to_string())
        } else {
            None
        };
        if let Some(name) = &traced_name {
            intrinsics::debug_enter_function(name);
        }

        let results = execute(instance, ctx, function, args);

        if let Some(name) = &traced_name {
            intrinsics::debug_exit_function(name);
        }

        let results = results?;
        debug_assert_eq!(results.len(), rets.len());
        rets.copy_from_slice(&results);
        Ok(())
    }

    fn serialize_object(&self, info: &ModuleInfo) -> Option<Vec<u8>> {
        crate::serialize_module(info, &self.functions)
    }
}

/// Raises a trap through the named intrinsic of the context's compartment.
fn raise_intrinsic_trap(ctx: &Context, name: &str) -> RuntimeError {
    let intrinsics = ctx.compartment().intrinsics();
    let function = intrinsics
        .get_export(name)
        .and_then(|object| object.as_function().cloned())
        .expect("every compartment carries the full intrinsics module");
    match call_direct(ctx, &function, &[]) {
        Err(error) => error,
        Ok(_) => unreachable!("trap intrinsics never return"),
    }
}

fn call_intrinsic(
    ctx: &Context,
    name: &str,
    args: &[RawValue],
) -> RuntimeResult<SmallVec<[RawValue; 1]>> {
    let intrinsics = ctx.compartment().intrinsics();
    let function = intrinsics
        .get_export(name)
        .and_then(|object| object.as_function().cloned())
        .expect("every compartment carries the full intrinsics module");
    call_direct(ctx, &function, args)
}

fn effective_address(base: u32, offset: u32) -> usize {
    base as usize + offset as usize
}

macro_rules! trunc_to_int {
    ($stack:expr, $ctx:expr, $pop:ident, $int:ty, $lower:expr, $upper:expr, $push:ident) => {{
        let value = $stack.pop().expect("stack underflow").$pop();
        let truncated = value.trunc();
        if truncated.is_nan() || truncated >= $upper || truncated < $lower {
            return Err(raise_intrinsic_trap($ctx, "invalidFloatOperationTrap"));
        }
        $stack.push(RawValue::$push(truncated as $int));
    }};
}

fn execute(
    instance: &Arc<InstanceInner>,
    ctx: &Context,
    function: &LoweredFunction,
    args: &[RawValue],
) -> RuntimeResult<SmallVec<[RawValue; 1]>> {
    let _depth = DepthGuard::enter()?;

    let info = &instance.module.info;
    let default_memory: Option<&Arc<Memory>> = instance.memory_by_index(0);

    let mut locals: Vec<RawValue> =
        Vec::with_capacity((function.num_params + function.num_locals) as usize);
    locals.extend_from_slice(args);
    locals.resize(
        (function.num_params + function.num_locals) as usize,
        RawValue::zero(),
    );

    let mut stack: Vec<RawValue> = Vec::with_capacity(16);
    let ops = &function.ops;
    let mut pc = 0usize;

    macro_rules! pop {
        () => {
            stack.pop().expect("stack underflow")
        };
    }
    macro_rules! push {
        ($value:expr) => {
            stack.push($value)
        };
    }
    macro_rules! binop_i32 {
        ($f:expr) => {{
            let b = pop!().as_i32();
            let a = pop!().as_i32();
            push!(RawValue::from_i32($f(a, b)));
        }};
    }
    macro_rules! binop_i64 {
        ($f:expr) => {{
            let b = pop!().as_i64();
            let a = pop!().as_i64();
            push!(RawValue::from_i64($f(a, b)));
        }};
    }
    macro_rules! binop_f32 {
        ($f:expr) => {{
            let b = pop!().as_f32();
            let a = pop!().as_f32();
            push!(RawValue::from_f32($f(a, b)));
        }};
    }
    macro_rules! binop_f64 {
        ($f:expr) => {{
            let b = pop!().as_f64();
            let a = pop!().as_f64();
            push!(RawValue::from_f64($f(a, b)));
        }};
    }
    macro_rules! cmp_i32 {
        ($f:expr) => {{
            let b = pop!().as_i32();
            let a = pop!().as_i32();
            push!(RawValue::from_i32($f(a, b) as i32));
        }};
    }
    macro_rules! cmp_u32 {
        ($f:expr) => {{
            let b = pop!().as_u32();
            let a = pop!().as_u32();
            push!(RawValue::from_i32($f(a, b) as i32));
        }};
    }
    macro_rules! cmp_i64 {
        ($f:expr) => {{
            let b = pop!().as_i64();
            let a = pop!().as_i64();
            push!(RawValue::from_i32($f(a, b) as i32));
        }};
    }
    macro_rules! cmp_u64 {
        ($f:expr) => {{
            let b = pop!().as_u64();
            let a = pop!().as_u64();
            push!(RawValue::from_i32($f(a, b) as i32));
        }};
    }
    macro_rules! cmp_f32 {
        ($f:expr) => {{
            let b = pop!().as_f32();
            let a = pop!().as_f32();
            push!(RawValue::from_i32($f(a, b) as i32));
        }};
    }
    macro_rules! cmp_f64 {
        ($f:expr) => {{
            let b = pop!().as_f64();
            let a = pop!().as_f64();
            push!(RawValue::from_i32($f(a, b) as i32));
        }};
    }
    macro_rules! unop_f32 {
        ($f:expr) => {{
            let a = pop!().as_f32();
            push!(RawValue::from_f32($f(a)));
        }};
    }
    macro_rules! unop_f64 {
        ($f:expr) => {{
            let a = pop!().as_f64();
            push!(RawValue::from_f64($f(a)));
        }};
    }
    macro_rules! memory {
        () => {
            default_memory.expect("memory operators are validated against a declared memory")
        };
    }
    macro_rules! load {
        ($offset:expr, $width:expr, $convert:expr) => {{
            let base = pop!().as_u32();
            let bytes = memory!()
                .load::<{ $width }>(effective_address(base, *$offset))
                .map_err(RuntimeError::from)?;
            push!($convert(bytes));
        }};
    }
    macro_rules! store {
        ($offset:expr, $width:expr, $to_bytes:expr) => {{
            let value = pop!();
            let base = pop!().as_u32();
            let bytes: [u8; $width] = $to_bytes(value);
            memory!()
                .store::<{ $width }>(effective_address(base, *$offset), bytes)
                .map_err(RuntimeError::from)?;
        }};
    }
    macro_rules! take_branch {
        ($target:expr) => {{
            let keep = $target.keep as usize;
            let drop = $target.drop as usize;
            let height = stack.len();
            stack.copy_within(height - keep..height, height - keep - drop);
            stack.truncate(height - drop);
            pc = $target.pc as usize;
            continue;
        }};
    }

    loop {
        let op = ops
            .get(pc)
            .expect("lowered bodies always end in an explicit return");
        pc += 1;
        match op {
            Op::Unreachable => {
                return Err(raise_intrinsic_trap(ctx, "unreachableTrap"));
            }
            Op::Br(target) => take_branch!(target),
            Op::BrIf(target) => {
                if pop!().as_i32() != 0 {
                    take_branch!(target);
                }
            }
            Op::Jump { pc: target_pc } => {
                pc = *target_pc as usize;
            }
            Op::JumpIfZero { pc: target_pc } => {
                if pop!().as_i32() == 0 {
                    pc = *target_pc as usize;
                }
            }
            Op::BrTable { targets, default } => {
                let index = pop!().as_u32() as usize;
                let target = targets.get(index).unwrap_or(default);
                take_branch!(target)
            }
            Op::Return { drop: _, keep } => {
                let keep = *keep as usize;
                let results: SmallVec<[RawValue; 1]> =
                    stack[stack.len() - keep..].iter().copied().collect();
                return Ok(results);
            }
            Op::Call { func_index } => {
                let function = instance
                    .function_by_index(FuncIndex::new(*func_index as usize))
                    .expect("call targets are validated at compile time")
                    .clone();
                let num_params = function.signature().params().len();
                let call_args: SmallVec<[RawValue; 8]> =
                    stack.drain(stack.len() - num_params..).collect();
                let results = call_direct(ctx, &function, &call_args)?;
                stack.extend(results);
            }
            Op::CallIndirect {
                sig_index,
                table_index,
            } => {
                let expected = &info.signatures[SigIndex::new(*sig_index as usize)];
                let table = instance
                    .table_by_index(*table_index as usize)
                    .expect("call_indirect tables are validated at compile time");
                let element_index = pop!().as_u32();

                let element = match table.get(element_index) {
                    Err(_) => {
                        return Err(raise_intrinsic_trap(ctx, "indirectCallIndexOutOfBounds"));
                    }
                    Ok(element) => element,
                };
                let anyfunc = match element {
                    Some(anyfunc) if SigRegistry.is_same(&anyfunc.signature, expected) => anyfunc,
                    _ => {
                        return Err(intrinsics::indirect_call_signature_mismatch(
                            table,
                            element_index,
                            expected,
                        ));
                    }
                };

                let num_params = anyfunc.signature.params().len();
                let call_args: SmallVec<[RawValue; 8]> =
                    stack.drain(stack.len() - num_params..).collect();
                let results = call_direct(ctx, &anyfunc.function, &call_args)?;
                stack.extend(results);
            }

            Op::Drop => {
                pop!();
            }
            Op::Select => {
                let condition = pop!().as_i32();
                let b = pop!();
                let a = pop!();
                push!(if condition != 0 { a } else { b });
            }

            Op::LocalGet { index } => push!(locals[*index as usize]),
            Op::LocalSet { index } => {
                locals[*index as usize] = pop!();
            }
            Op::LocalTee { index } => {
                locals[*index as usize] = *stack.last().expect("stack underflow");
            }
            Op::GlobalGet { index } => {
                let global = instance
                    .global_by_index(*index as usize)
                    .expect("global indices are validated at compile time");
                push!(global.get_raw(ctx));
            }
            Op::GlobalSet { index } => {
                let global = instance
                    .global_by_index(*index as usize)
                    .expect("global indices are validated at compile time");
                global.set_raw(ctx, pop!());
            }

            Op::I32Load { offset } => load!(offset, 4, |b| RawValue::from_i32(i32::from_le_bytes(b))),
            Op::I64Load { offset } => load!(offset, 8, |b| RawValue::from_i64(i64::from_le_bytes(b))),
            Op::F32Load { offset } => load!(offset, 4, |b| RawValue::from_f32(f32::from_le_bytes(b))),
            Op::F64Load { offset } => load!(offset, 8, |b| RawValue::from_f64(f64::from_le_bytes(b))),
            Op::I32Load8S { offset } => load!(offset, 1, |b: [u8; 1]| RawValue::from_i32(b[0] as i8 as i32)),
            Op::I32Load8U { offset } => load!(offset, 1, |b: [u8; 1]| RawValue::from_i32(b[0] as i32)),
            Op::I32Load16S { offset } => load!(offset, 2, |b| RawValue::from_i32(i16::from_le_bytes(b) as i32)),
            Op::I32Load16U { offset } => load!(offset, 2, |b| RawValue::from_i32(u16::from_le_bytes(b) as i32)),
            Op::I64Load8S { offset } => load!(offset, 1, |b: [u8; 1]| RawValue::from_i64(b[0] as i8 as i64)),
            Op::I64Load8U { offset } => load!(offset, 1, |b: [u8; 1]| RawValue::from_i64(b[0] as i64)),
            Op::I64Load16S { offset } => load!(offset, 2, |b| RawValue::from_i64(i16::from_le_bytes(b) as i64)),
            Op::I64Load16U { offset } => load!(offset, 2, |b| RawValue::from_i64(u16::from_le_bytes(b) as i64)),
            Op::I64Load32S { offset } => load!(offset, 4, |b| RawValue::from_i64(i32::from_le_bytes(b) as i64)),
            Op::I64Load32U { offset } => load!(offset, 4, |b| RawValue::from_i64(u32::from_le_bytes(b) as i64)),

            Op::I32Store { offset } => store!(offset, 4, |v: RawValue| v.as_i32().to_le_bytes()),
            Op::I64Store { offset } => store!(offset, 8, |v: RawValue| v.as_i64().to_le_bytes()),
            Op::F32Store { offset } => store!(offset, 4, |v: RawValue| v.as_f32().to_le_bytes()),
            Op::F64Store { offset } => store!(offset, 8, |v: RawValue| v.as_f64().to_le_bytes()),
            Op::I32Store8 { offset } => store!(offset, 1, |v: RawValue| [v.as_i32() as u8]),
            Op::I32Store16 { offset } => store!(offset, 2, |v: RawValue| (v.as_i32() as u16).to_le_bytes()),
            Op::I64Store8 { offset } => store!(offset, 1, |v: RawValue| [v.as_i64() as u8]),
            Op::I64Store16 { offset } => store!(offset, 2, |v: RawValue| (v.as_i64() as u16).to_le_bytes()),
            Op::I64Store32 { offset } => store!(offset, 4, |v: RawValue| (v.as_i64() as u32).to_le_bytes()),

            Op::MemorySize => {
                let memory_id = memory!().id().0 as i64;
                let results =
                    call_intrinsic(ctx, "currentMemory", &[RawValue::from_i64(memory_id)])?;
                push!(results[0]);
            }
            Op::MemoryGrow => {
                let delta = pop!();
                let memory_id = memory!().id().0 as i64;
                let results = call_intrinsic(
                    ctx,
                    "growMemory",
                    &[delta, RawValue::from_i64(memory_id)],
                )?;
                push!(results[0]);
            }

            Op::I32Const(value) => push!(RawValue::from_i32(*value)),
            Op::I64Const(value) => push!(RawValue::from_i64(*value)),
            Op::F32Const(bits) => push!(RawValue::from_f32(f32::from_bits(*bits))),
            Op::F64Const(bits) => push!(RawValue::from_f64(f64::from_bits(*bits))),

            Op::I32Eqz => {
                let a = pop!().as_i32();
                push!(RawValue::from_i32((a == 0) as i32));
            }
            Op::I32Eq => cmp_i32!(|a, b| a == b),
            Op::I32Ne => cmp_i32!(|a, b| a != b),
            Op::I32LtS => cmp_i32!(|a, b| a < b),
            Op::I32LtU => cmp_u32!(|a, b| a < b),
            Op::I32GtS => cmp_i32!(|a, b| a > b),
            Op::I32GtU => cmp_u32!(|a, b| a > b),
            Op::I32LeS => cmp_i32!(|a, b| a <= b),
            Op::I32LeU => cmp_u32!(|a, b| a <= b),
            Op::I32GeS => cmp_i32!(|a, b| a >= b),
            Op::I32GeU => cmp_u32!(|a, b| a >= b),
            Op::I32Clz => {
                let a = pop!().as_i32();
                push!(RawValue::from_i32(a.leading_zeros() as i32));
            }
            Op::I32Ctz => {
                let a = pop!().as_i32();
                push!(RawValue::from_i32(a.trailing_zeros() as i32));
            }
            Op::I32Popcnt => {
                let a = pop!().as_i32();
                push!(RawValue::from_i32(a.count_ones() as i32));
            }
            Op::I32Add => binop_i32!(i32::wrapping_add),
            Op::I32Sub => binop_i32!(i32::wrapping_sub),
            Op::I32Mul => binop_i32!(i32::wrapping_mul),
            Op::I32DivS => {
                let b = pop!().as_i32();
                let a = pop!().as_i32();
                if b == 0 || (a == i32::min_value() && b == -1) {
                    return Err(raise_intrinsic_trap(
                        ctx,
                        "divideByZeroOrIntegerOverflowTrap",
                    ));
                }
                push!(RawValue::from_i32(a.wrapping_div(b)));
            }
            Op::I32DivU => {
                let b = pop!().as_u32();
                let a = pop!().as_u32();
                if b == 0 {
                    return Err(raise_intrinsic_trap(
                        ctx,
                        "divideByZeroOrIntegerOverflowTrap",
                    ));
                }
                push!(RawValue::from_i32((a / b) as i32));
            }
            Op::I32RemS => {
                let b = pop!().as_i32();
                let a = pop!().as_i32();
                if b == 0 {
                    return Err(raise_intrinsic_trap(
                        ctx,
                        "divideByZeroOrIntegerOverflowTrap",
                    ));
                }
                push!(RawValue::from_i32(a.wrapping_rem(b)));
            }
            Op::I32RemU => {
                let b = pop!().as_u32();
                let a = pop!().as_u32();
                if b == 0 {
                    return Err(raise_intrinsic_trap(
                        ctx,
                        "divideByZeroOrIntegerOverflowTrap",
                    ));
                }
                push!(RawValue::from_i32((a % b) as i32));
            }
            Op::I32And => binop_i32!(|a, b| a & b),
            Op::I32Or => binop_i32!(|a, b| a | b),
            Op::I32Xor => binop_i32!(|a, b| a ^ b),
            Op::I32Shl => binop_i32!(|a: i32, b: i32| a.wrapping_shl(b as u32)),
            Op::I32ShrS => binop_i32!(|a: i32, b: i32| a.wrapping_shr(b as u32)),
            Op::I32ShrU => {
                let b = pop!().as_u32();
                let a = pop!().as_u32();
                push!(RawValue::from_i32(a.wrapping_shr(b) as i32));
            }
            Op::I32Rotl => binop_i32!(|a: i32, b: i32| a.rotate_left(b as u32)),
            Op::I32Rotr => binop_i32!(|a: i32, b: i32| a.rotate_right(b as u32)),

            Op::I64Eqz => {
                let a = pop!().as_i64();
                push!(RawValue::from_i32((a == 0) as i32));
            }
            Op::I64Eq => cmp_i64!(|a, b| a == b),
            Op::I64Ne => cmp_i64!(|a, b| a != b),
            Op::I64LtS => cmp_i64!(|a, b| a < b),
            Op::I64LtU => cmp_u64!(|a, b| a < b),
            Op::I64GtS => cmp_i64!(|a, b| a > b),
            Op::I64GtU => cmp_u64!(|a, b| a > b),
            Op::I64LeS => cmp_i64!(|a, b| a <= b),
            Op::I64LeU => cmp_u64!(|a, b| a <= b),
            Op::I64GeS => cmp_i64!(|a, b| a >= b),
            Op::I64GeU => cmp_u64!(|a, b| a >= b),
            Op::I64Clz => {
                let a = pop!().as_i64();
                push!(RawValue::from_i64(a.leading_zeros() as i64));
            }
            Op::I64Ctz => {
                let a = pop!().as_i64();
                push!(RawValue::from_i64(a.trailing_zeros() as i64));
            }
            Op::I64Popcnt => {
                let a = pop!().as_i64();
                push!(RawValue::from_i64(a.count_ones() as i64));
            }
            Op::I64Add => binop_i64!(i64::wrapping_add),
            Op::I64Sub => binop_i64!(i64::wrapping_sub),
            Op::I64Mul => binop_i64!(i64::wrapping_mul),
            Op::I64DivS => {
                let b = pop!().as_i64();
                let a = pop!().as_i64();
                if b == 0 || (a == i64::min_value() && b == -1) {
                    return Err(raise_intrinsic_trap(
                        ctx,
                        "divideByZeroOrIntegerOverflowTrap",
                    ));
                }
                push!(RawValue::from_i64(a.wrapping_div(b)));
            }
            Op::I64DivU => {
                let b = pop!().as_u64();
                let a = pop!().as_u64();
                if b == 0 {
                    return Err(raise_intrinsic_trap(
                        ctx,
                        "divideByZeroOrIntegerOverflowTrap",
                    ));
                }
                push!(RawValue::from_i64((a / b) as i64));
            }
            Op::I64RemS => {
                let b = pop!().as_i64();
                let a = pop!().as_i64();
                if b == 0 {
                    return Err(raise_intrinsic_trap(
                        ctx,
                        "divideByZeroOrIntegerOverflowTrap",
                    ));
                }
                push!(RawValue::from_i64(a.wrapping_rem(b)));
            }
            Op::I64RemU => {
                let b = pop!().as_u64();
                let a = pop!().as_u64();
                if b == 0 {
                    return Err(raise_intrinsic_trap(
                        ctx,
                        "divideByZeroOrIntegerOverflowTrap",
                    ));
                }
                push!(RawValue::from_i64((a % b) as i64));
            }
            Op::I64And => binop_i64!(|a, b| a & b),
            Op::I64Or => binop_i64!(|a, b| a | b),
            Op::I64Xor => binop_i64!(|a, b| a ^ b),
            Op::I64Shl => binop_i64!(|a: i64, b: i64| a.wrapping_shl(b as u32)),
            Op::I64ShrS => binop_i64!(|a: i64, b: i64| a.wrapping_shr(b as u32)),
            Op::I64ShrU => {
                let b = pop!().as_u64();
                let a = pop!().as_u64();
                push!(RawValue::from_i64(a.wrapping_shr(b as u32) as i64));
            }
            Op::I64Rotl => binop_i64!(|a: i64, b: i64| a.rotate_left(b as u32)),
            Op::I64Rotr => binop_i64!(|a: i64, b: i64| a.rotate_right(b as u32)),

            Op::F32Eq => cmp_f32!(|a, b| a == b),
            Op::F32Ne => cmp_f32!(|a, b| a != b),
            Op::F32Lt => cmp_f32!(|a, b| a < b),
            Op::F32Gt => cmp_f32!(|a, b| a > b),
            Op::F32Le => cmp_f32!(|a, b| a <= b),
            Op::F32Ge => cmp_f32!(|a, b| a >= b),
            Op::F32Abs => unop_f32!(f32::abs),
            Op::F32Neg => unop_f32!(|a: f32| -a),
            Op::F32Ceil => unop_f32!(intrinsics::f32_ceil),
            Op::F32Floor => unop_f32!(intrinsics::f32_floor),
            Op::F32Trunc => unop_f32!(intrinsics::f32_trunc),
            Op::F32Nearest => unop_f32!(intrinsics::f32_nearest),
            Op::F32Sqrt => unop_f32!(f32::sqrt),
            Op::F32Add => binop_f32!(|a, b| a + b),
            Op::F32Sub => binop_f32!(|a, b| a - b),
            Op::F32Mul => binop_f32!(|a, b| a * b),
            Op::F32Div => binop_f32!(|a, b| a / b),
            Op::F32Min => binop_f32!(intrinsics::f32_min),
            Op::F32Max => binop_f32!(intrinsics::f32_max),
            Op::F32Copysign => binop_f32!(f32::copysign),

            Op::F64Eq => cmp_f64!(|a, b| a == b),
            Op::F64Ne => cmp_f64!(|a, b| a != b),
            Op::F64Lt => cmp_f64!(|a, b| a < b),
            Op::F64Gt => cmp_f64!(|a, b| a > b),
            Op::F64Le => cmp_f64!(|a, b| a <= b),
            Op::F64Ge => cmp_f64!(|a, b| a >= b),
            Op::F64Abs => unop_f64!(f64::abs),
            Op::F64Neg => unop_f64!(|a: f64| -a),
            Op::F64Ceil => unop_f64!(intrinsics::f64_ceil),
            Op::F64Floor => unop_f64!(intrinsics::f64_floor),
            Op::F64Trunc => unop_f64!(intrinsics::f64_trunc),
            Op::F64Nearest => unop_f64!(intrinsics::f64_nearest),
            Op::F64Sqrt => unop_f64!(f64::sqrt),
            Op::F64Add => binop_f64!(|a, b| a + b),
            Op::F64Sub => binop_f64!(|a, b| a - b),
            Op::F64Mul => binop_f64!(|a, b| a * b),
            Op::F64Div => binop_f64!(|a, b| a / b),
            Op::F64Min => binop_f64!(intrinsics::f64_min),
            Op::F64Max => binop_f64!(intrinsics::f64_max),
            Op::F64Copysign => binop_f64!(f64::copysign),

            Op::I32WrapI64 => {
                let a = pop!().as_i64();
                push!(RawValue::from_i32(a as i32));
            }
            Op::I32TruncF32S => {
                trunc_to_int!(stack, ctx, as_f32, i32, -2147483648.0f32, 2147483648.0f32, from_i32)
            }
            Op::I32TruncF32U => {
                let value = pop!().as_f32();
                let truncated = value.trunc();
                if truncated.is_nan() || truncated >= 4294967296.0f32 || truncated <= -1.0f32 {
                    return Err(raise_intrinsic_trap(ctx, "invalidFloatOperationTrap"));
                }
                push!(RawValue::from_i32(truncated as u32 as i32));
            }
            Op::I32TruncF64S => {
                trunc_to_int!(stack, ctx, as_f64, i32, -2147483648.0f64, 2147483648.0f64, from_i32)
            }
            Op::I32TruncF64U => {
                let value = pop!().as_f64();
                let truncated = value.trunc();
                if truncated.is_nan() || truncated >= 4294967296.0f64 || truncated <= -1.0f64 {
                    return Err(raise_intrinsic_trap(ctx, "invalidFloatOperationTrap"));
                }
                push!(RawValue::from_i32(truncated as u32 as i32));
            }
            Op::I64ExtendI32S => {
                let a = pop!().as_i32();
                push!(RawValue::from_i64(a as i64));
            }
            Op::I64ExtendI32U => {
                let a = pop!().as_u32();
                push!(RawValue::from_i64(a as i64));
            }
            Op::I64TruncF32S => trunc_to_int!(
                stack,
                ctx,
                as_f32,
                i64,
                -9223372036854775808.0f32,
                9223372036854775808.0f32,
                from_i64
            ),
            Op::I64TruncF32U => {
                let value = pop!().as_f32();
                let truncated = value.trunc();
                if truncated.is_nan()
                    || truncated >= 18446744073709551616.0f32
                    || truncated <= -1.0f32
                {
                    return Err(raise_intrinsic_trap(ctx, "invalidFloatOperationTrap"));
                }
                push!(RawValue::from_i64(truncated as u64 as i64));
            }
            Op::I64TruncF64S => trunc_to_int!(
                stack,
                ctx,
                as_f64,
                i64,
                -9223372036854775808.0f64,
                9223372036854775808.0f64,
                from_i64
            ),
            Op::I64TruncF64U => {
                let value = pop!().as_f64();
                let truncated = value.trunc();
                if truncated.is_nan()
                    || truncated >= 18446744073709551616.0f64
                    || truncated <= -1.0f64
                {
                    return Err(raise_intrinsic_trap(ctx, "invalidFloatOperationTrap"));
                }
                push!(RawValue::from_i64(truncated as u64 as i64));
            }
            Op::F32ConvertI32S => {
                let a = pop!().as_i32();
                push!(RawValue::from_f32(a as f32));
            }
            Op::F32ConvertI32U => {
                let a = pop!().as_u32();
                push!(RawValue::from_f32(a as f32));
            }
            Op::F32ConvertI64S => {
                let a = pop!().as_i64();
                push!(RawValue::from_f32(a as f32));
            }
            Op::F32ConvertI64U => {
                let a = pop!().as_u64();
                push!(RawValue::from_f32(a as f32));
            }
            Op::F32DemoteF64 => {
                let a = pop!().as_f64();
                push!(RawValue::from_f32(a as f32));
            }
            Op::F64ConvertI32S => {
                let a = pop!().as_i32();
                push!(RawValue::from_f64(a as f64));
            }
            Op::F64ConvertI32U => {
                let a = pop!().as_u32();
                push!(RawValue::from_f64(a as f64));
            }
            Op::F64ConvertI64S => {
                let a = pop!().as_i64();
                push!(RawValue::from_f64(a as f64));
            }
            Op::F64ConvertI64U => {
                let a = pop!().as_u64();
                push!(RawValue::from_f64(a as f64));
            }
            Op::F64PromoteF32 => {
                let a = pop!().as_f32();
                push!(RawValue::from_f64(a as f64));
            }
            Op::I32ReinterpretF32 => {
                let a = pop!().as_f32();
                push!(RawValue::from_i32(a.to_bits() as i32));
            }
            Op::I64ReinterpretF64 => {
                let a = pop!().as_f64();
                push!(RawValue::from_i64(a.to_bits() as i64));
            }
            Op::F32ReinterpretI32 => {
                let a = pop!().as_u32();
                push!(RawValue::from_f32(f32::from_bits(a)));
            }
            Op::F64ReinterpretI64 => {
                let a = pop!().as_u64();
                push!(RawValue::from_f64(f64::from_bits(a)));
            }

            Op::I32Extend8S => {
                let a = pop!().as_i32();
                push!(RawValue::from_i32(a as i8 as i32));
            }
            Op::I32Extend16S => {
                let a = pop!().as_i32();
                push!(RawValue::from_i32(a as i16 as i32));
            }
            Op::I64Extend8S => {
                let a = pop!().as_i64();
                push!(RawValue::from_i64(a as i8 as i64));
            }
            Op::I64Extend16S => {
                let a = pop!().as_i64();
                push!(RawValue::from_i64(a as i16 as i64));
            }
            Op::I64Extend32S => {
                let a = pop!().as_i64();
                push!(RawValue::from_i64(a as i32 as i64));
            }

            Op::I32TruncSatF32S => {
                let a = pop!().as_f32();
                push!(RawValue::from_i32(a as i32));
            }
            Op::I32TruncSatF32U => {
                let a = pop!().as_f32();
                push!(RawValue::from_i32(a as u32 as i32));
            }
            Op::I32TruncSatF64S => {
                let a = pop!().as_f64();
                push!(RawValue::from_i32(a as i32));
            }
            Op::I32TruncSatF64U => {
                let a = pop!().as_f64();
                push!(RawValue::from_i32(a as u32 as i32));
            }
            Op::I64TruncSatF32S => {
                let a = pop!().as_f32();
                push!(RawValue::from_i64(a as i64));
            }
            Op::I64TruncSatF32U => {
                let a = pop!().as_f32();
                push!(RawValue::from_i64(a as u64 as i64));
            }
            Op::I64TruncSatF64S => {
                let a = pop!().as_f64();
                push!(RawValue::from_i64(a as i64));
            }
            Op::I64TruncSatF64U => {
                let a = pop!().as_f64();
                push!(RawValue::from_i64(a as u64 as i64));
            }
        }
    }
}
