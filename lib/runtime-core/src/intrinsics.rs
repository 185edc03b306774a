//! The intrinsics module provides the runtime-library entry points compiled
//! code calls into: the trap raisers, memory grow/size, and the IEEE-754
//! operations that need explicit NaN handling. One intrinsics instance is
//! created per compartment at compartment creation.

use crate::{
    compartment::{Compartment, MemoryId, TableId},
    context::Context,
    error::{RuntimeError, Trap},
    instance::InstanceInner,
    object::Object,
    table::Table,
    types::{FuncSig, RawValue, Type},
};
use smallvec::smallvec;
use std::cell::Cell;
use std::sync::Arc;

/// Forces the significand's quiet bit on, preserving the rest of the NaN.
pub fn quiet_nan_f32(value: f32) -> f32 {
    f32::from_bits(value.to_bits() | (1 << 22))
}

/// Forces the significand's quiet bit on, preserving the rest of the NaN.
pub fn quiet_nan_f64(value: f64) -> f64 {
    f64::from_bits(value.to_bits() | (1 << 51))
}

macro_rules! float_intrinsics {
    ($ty:ident, $quiet:ident, $min:ident, $max:ident, $ceil:ident, $floor:ident, $trunc:ident, $nearest:ident) => {
        /// If either operand is a NaN it is quieted and returned; equal
        /// operands are distinguished by their bit patterns so that
        /// `min(-0.0, +0.0)` is `-0.0`.
        pub fn $min(left: $ty, right: $ty) -> $ty {
            if left != left {
                $quiet(left)
            } else if right != right {
                $quiet(right)
            } else if left < right {
                left
            } else if right < left {
                right
            } else {
                // The operands are apparently equal; compare their bit
                // patterns to distinguish -0.0 from +0.0 and keep the one
                // whose pattern is greater.
                if left.to_bits() < right.to_bits() {
                    right
                } else {
                    left
                }
            }
        }

        /// If either operand is a NaN it is quieted and returned; equal
        /// operands are distinguished by their bit patterns so that
        /// `max(-0.0, +0.0)` is `+0.0`.
        pub fn $max(left: $ty, right: $ty) -> $ty {
            if left != left {
                $quiet(left)
            } else if right != right {
                $quiet(right)
            } else if left > right {
                left
            } else if right > left {
                right
            } else {
                if left.to_bits() > right.to_bits() {
                    right
                } else {
                    left
                }
            }
        }

        /// Rounds up, returning a quiet NaN for a NaN input.
        pub fn $ceil(value: $ty) -> $ty {
            if value != value {
                $quiet(value)
            } else {
                value.ceil()
            }
        }

        /// Rounds down, returning a quiet NaN for a NaN input.
        pub fn $floor(value: $ty) -> $ty {
            if value != value {
                $quiet(value)
            } else {
                value.floor()
            }
        }

        /// Rounds toward zero, returning a quiet NaN for a NaN input.
        pub fn $trunc(value: $ty) -> $ty {
            if value != value {
                $quiet(value)
            } else {
                value.trunc()
            }
        }

        /// Rounds to nearest, ties to even, returning a quiet NaN for a NaN
        /// input.
        pub fn $nearest(value: $ty) -> $ty {
            if value != value {
                $quiet(value)
            } else {
                let rounded = value.round();
                // `round` breaks ties away from zero; wasm wants ties to
                // even.
                let result = if (value - value.trunc()).abs() == 0.5 && rounded % 2.0 != 0.0 {
                    rounded - value.signum()
                } else {
                    rounded
                };
                if result == 0.0 {
                    result.copysign(value)
                } else {
                    result
                }
            }
        }
    };
}

float_intrinsics!(
    f32,
    quiet_nan_f32,
    f32_min,
    f32_max,
    f32_ceil,
    f32_floor,
    f32_trunc,
    f32_nearest
);
float_intrinsics!(
    f64,
    quiet_nan_f64,
    f64_min,
    f64_max,
    f64_ceil,
    f64_floor,
    f64_trunc,
    f64_nearest
);

thread_local! {
    static DEBUG_INDENT_LEVEL: Cell<usize> = Cell::new(0);
}

/// Logs function entry for the function-tracing hooks, indenting per level.
pub fn debug_enter_function(debug_name: &str) {
    DEBUG_INDENT_LEVEL.with(|level| {
        log::trace!("{}ENTER: {}", "  ".repeat(level.get()), debug_name);
        level.set(level.get() + 1);
    });
}

/// Logs function exit for the function-tracing hooks.
pub fn debug_exit_function(debug_name: &str) {
    DEBUG_INDENT_LEVEL.with(|level| {
        level.set(level.get().saturating_sub(1));
        log::trace!("{}EXIT:  {}", "  ".repeat(level.get()), debug_name);
    });
}

/// Builds the diagnostic and the trap for a failed indirect-call signature
/// check: a null element raises `undefined table element`, anything else
/// `indirect call signature mismatch`.
pub fn indirect_call_signature_mismatch(
    table: &Table,
    index: u32,
    expected: &Arc<FuncSig>,
) -> RuntimeError {
    match table.get(index) {
        Ok(Some(element)) => {
            log::debug!(
                "call_indirect signature mismatch: expected {} at index {} but got {} ({})",
                expected,
                index,
                element.signature,
                element.function.debug_name()
            );
            Trap::IndirectCallSignatureMismatch.into()
        }
        _ => {
            log::debug!(
                "call_indirect signature mismatch: expected {} at index {} but got nullptr",
                expected,
                index
            );
            Trap::UndefinedTableElement.into()
        }
    }
}

/// Grows the identified memory, returning the previous page count or -1.
pub fn grow_memory(ctx: &Context, delta_pages: u32, memory_id: MemoryId) -> i32 {
    let memory = ctx
        .compartment()
        .memory_by_id(memory_id)
        .expect("compiled code only addresses memories of its own compartment");
    memory.grow(delta_pages)
}

/// The identified memory's current page count, clamped to 32 bits.
pub fn current_memory(ctx: &Context, memory_id: MemoryId) -> u32 {
    let memory = ctx
        .compartment()
        .memory_by_id(memory_id)
        .expect("compiled code only addresses memories of its own compartment");
    memory.pages().0.min(u32::max_value())
}

fn intrinsic(
    params: Vec<Type>,
    returns: Vec<Type>,
    name: &str,
    body: impl Fn(&Context, &[RawValue]) -> Result<smallvec::SmallVec<[RawValue; 1]>, RuntimeError>
        + Send
        + Sync
        + 'static,
) -> (String, Object) {
    let signature = crate::SigRegistry.canonicalize(&FuncSig::new(params, returns));
    let debug_name = format!("wavmIntrinsics.{}", name);
    (
        name.to_string(),
        Object::Function(crate::object::Function::host(
            signature,
            crate::object::CallingConvention::Intrinsic,
            &debug_name,
            Arc::new(body),
        )),
    )
}

/// Instantiates the intrinsics module into a compartment. Called once per
/// compartment, at creation.
pub fn instantiate_intrinsics(compartment: &Arc<Compartment>) -> Arc<InstanceInner> {
    use Type::{F32, F64, I32, I64};

    let exports = vec![
        intrinsic(vec![], vec![], "divideByZeroOrIntegerOverflowTrap", |_, _| {
            Err(Trap::IntegerDivideByZeroOrOverflow.into())
        }),
        intrinsic(vec![], vec![], "unreachableTrap", |_, _| {
            Err(Trap::ReachedUnreachable.into())
        }),
        intrinsic(vec![], vec![], "accessViolationTrap", |_, _| {
            Err(Trap::AccessViolation.into())
        }),
        intrinsic(vec![], vec![], "invalidFloatOperationTrap", |_, _| {
            Err(Trap::InvalidFloatOperation.into())
        }),
        intrinsic(
            vec![I32, I64, I64],
            vec![],
            "indirectCallSignatureMismatch",
            |ctx, args| {
                let index = args[0].as_u32();
                let table_id = TableId(args[2].as_u64() as usize);
                let table = ctx
                    .compartment()
                    .table_by_id(table_id)
                    .expect("compiled code only addresses tables of its own compartment");
                match table.get(index) {
                    Ok(Some(_)) => Err(Trap::IndirectCallSignatureMismatch.into()),
                    _ => Err(Trap::UndefinedTableElement.into()),
                }
            },
        ),
        intrinsic(vec![], vec![], "indirectCallIndexOutOfBounds", |_, _| {
            Err(Trap::UndefinedTableElement.into())
        }),
        intrinsic(vec![I32, I64], vec![I32], "growMemory", |ctx, args| {
            let delta_pages = args[0].as_u32();
            let memory_id = MemoryId(args[1].as_u64() as usize);
            Ok(smallvec![RawValue::from_i32(grow_memory(
                ctx,
                delta_pages,
                memory_id
            ))])
        }),
        intrinsic(vec![I64], vec![I32], "currentMemory", |ctx, args| {
            let memory_id = MemoryId(args[0].as_u64() as usize);
            Ok(smallvec![RawValue::from_i32(
                current_memory(ctx, memory_id) as i32
            )])
        }),
        intrinsic(vec![F32, F32], vec![F32], "f32.min", |_, args| {
            Ok(smallvec![RawValue::from_f32(f32_min(
                args[0].as_f32(),
                args[1].as_f32()
            ))])
        }),
        intrinsic(vec![F64, F64], vec![F64], "f64.min", |_, args| {
            Ok(smallvec![RawValue::from_f64(f64_min(
                args[0].as_f64(),
                args[1].as_f64()
            ))])
        }),
        intrinsic(vec![F32, F32], vec![F32], "f32.max", |_, args| {
            Ok(smallvec![RawValue::from_f32(f32_max(
                args[0].as_f32(),
                args[1].as_f32()
            ))])
        }),
        intrinsic(vec![F64, F64], vec![F64], "f64.max", |_, args| {
            Ok(smallvec![RawValue::from_f64(f64_max(
                args[0].as_f64(),
                args[1].as_f64()
            ))])
        }),
        intrinsic(vec![F32], vec![F32], "f32.ceil", |_, args| {
            Ok(smallvec![RawValue::from_f32(f32_ceil(args[0].as_f32()))])
        }),
        intrinsic(vec![F64], vec![F64], "f64.ceil", |_, args| {
            Ok(smallvec![RawValue::from_f64(f64_ceil(args[0].as_f64()))])
        }),
        intrinsic(vec![F32], vec![F32], "f32.floor", |_, args| {
            Ok(smallvec![RawValue::from_f32(f32_floor(args[0].as_f32()))])
        }),
        intrinsic(vec![F64], vec![F64], "f64.floor", |_, args| {
            Ok(smallvec![RawValue::from_f64(f64_floor(args[0].as_f64()))])
        }),
        intrinsic(vec![F32], vec![F32], "f32.trunc", |_, args| {
            Ok(smallvec![RawValue::from_f32(f32_trunc(args[0].as_f32()))])
        }),
        intrinsic(vec![F64], vec![F64], "f64.trunc", |_, args| {
            Ok(smallvec![RawValue::from_f64(f64_trunc(args[0].as_f64()))])
        }),
        intrinsic(vec![F32], vec![F32], "f32.nearest", |_, args| {
            Ok(smallvec![RawValue::from_f32(f32_nearest(args[0].as_f32()))])
        }),
        intrinsic(vec![F64], vec![F64], "f64.nearest", |_, args| {
            Ok(smallvec![RawValue::from_f64(f64_nearest(args[0].as_f64()))])
        }),
        intrinsic(vec![], vec![], "debugBreak", |_, _| {
            log::debug!("================== wavmIntrinsics.debugBreak");
            Ok(smallvec![])
        }),
    ];

    InstanceInner::from_exports(compartment, "wavmIntrinsics", exports)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_max_distinguish_signed_zero() {
        assert_eq!(f32_min(-0.0f32, 0.0f32).to_bits(), (-0.0f32).to_bits());
        assert_eq!(f32_max(-0.0f32, 0.0f32).to_bits(), 0.0f32.to_bits());
        assert_eq!(f64_min(-0.0f64, 0.0f64).to_bits(), (-0.0f64).to_bits());
        assert_eq!(f64_max(-0.0f64, 0.0f64).to_bits(), 0.0f64.to_bits());
    }

    #[test]
    fn nan_operands_come_back_quiet() {
        let signaling = f32::from_bits(0x7f80_0001);
        for x in &[1.0f32, f32::INFINITY, -0.0] {
            let out = f32_min(signaling, *x);
            assert!(out.is_nan());
            assert_ne!(out.to_bits() & (1 << 22), 0);
            let out = f32_max(*x, signaling);
            assert!(out.is_nan());
            assert_ne!(out.to_bits() & (1 << 22), 0);
        }
        assert!(f32_ceil(f32::NAN).is_nan());
        assert!(f64_floor(f64::NAN).is_nan());
        assert!(f64_trunc(f64::NAN).is_nan());
        assert!(f32_nearest(f32::NAN).is_nan());
    }

    #[test]
    fn ordinary_comparisons_are_untouched() {
        assert_eq!(f32_min(1.0, 2.0), 1.0);
        assert_eq!(f32_max(1.0, 2.0), 2.0);
        assert_eq!(f64_min(f64::NEG_INFINITY, 0.0), f64::NEG_INFINITY);
    }

    #[test]
    fn nearest_rounds_ties_to_even() {
        assert_eq!(f64_nearest(2.5), 2.0);
        assert_eq!(f64_nearest(3.5), 4.0);
        assert_eq!(f64_nearest(-2.5), -2.0);
        assert_eq!(f32_nearest(0.5), 0.0);
    }

    #[test]
    fn the_intrinsics_module_is_exported_per_compartment() {
        let compartment = Compartment::new();
        let intrinsics = compartment.intrinsics();
        for &name in &[
            "divideByZeroOrIntegerOverflowTrap",
            "unreachableTrap",
            "growMemory",
            "currentMemory",
            "f64.nearest",
        ] {
            assert!(intrinsics.get_export(name).is_some(), "{}", name);
        }
    }
}
