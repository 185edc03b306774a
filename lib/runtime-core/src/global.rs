//! Global storage cells. Immutable globals carry their value inline and may
//! live outside any compartment; mutable globals reserve a naturally aligned
//! offset in every context's global-data page of their compartment.

use crate::{
    compartment::{Compartment, MAX_GLOBAL_BYTES},
    context::Context,
    error::CreationError,
    types::{GlobalType, RawValue, Type, Value},
};
use std::sync::Arc;

enum GlobalStorage {
    Immutable(RawValue),
    Mutable { offset: usize },
}

/// A global variable instance.
pub struct Global {
    ty: GlobalType,
    compartment_id: Option<u64>,
    storage: GlobalStorage,
}

impl Global {
    /// Creates a global holding `initial_value`.
    ///
    /// Immutable globals may be created without a compartment. Mutable
    /// globals bump-allocate a naturally aligned offset in the compartment's
    /// global arena, write the initial value into the compartment's initial
    /// image and into every live context, and fail with
    /// [`CreationError::GlobalArenaExhausted`] when the arena is full.
    pub fn new(
        compartment: Option<&Arc<Compartment>>,
        ty: GlobalType,
        initial_value: Value,
    ) -> Result<Arc<Global>, CreationError> {
        if initial_value.ty() != ty.ty {
            return Err(CreationError::InvalidDescriptor(format!(
                "initial value of type {} for a global of type {}",
                initial_value.ty(),
                ty.ty
            )));
        }

        if !ty.mutable {
            return Ok(Arc::new(Global {
                ty,
                compartment_id: compartment.map(|c| c.id()),
                storage: GlobalStorage::Immutable(initial_value.to_raw()),
            }));
        }

        let compartment = compartment.ok_or_else(|| {
            CreationError::InvalidDescriptor(
                "a mutable global requires a compartment".to_string(),
            )
        })?;

        let width = ty.ty.byte_width();
        let raw = initial_value.to_raw();
        let bytes = raw.to_le_bytes();

        let mut inner = compartment.lock();

        // Naturally aligned bump allocation.
        let offset = (inner.num_global_bytes + width - 1) & !(width - 1);
        if offset + width > MAX_GLOBAL_BYTES {
            return Err(CreationError::GlobalArenaExhausted);
        }
        inner.num_global_bytes = offset + width;

        // Initialize the value in the image used to seed new contexts, and
        // in every context that already exists.
        inner.initial_context_global_data[offset..offset + width]
            .copy_from_slice(&bytes[..width]);
        for slot in inner.contexts.iter().flatten() {
            slot.write_global(offset, &bytes[..width]);
        }

        Ok(Arc::new(Global {
            ty,
            compartment_id: Some(compartment.id()),
            storage: GlobalStorage::Mutable { offset },
        }))
    }

    /// The type of this global.
    pub fn ty(&self) -> GlobalType {
        self.ty
    }

    /// The compartment this global is bound to, if any.
    pub fn compartment_id(&self) -> Option<u64> {
        self.compartment_id
    }

    /// The arena offset of a mutable global.
    pub fn data_offset(&self) -> Option<usize> {
        match self.storage {
            GlobalStorage::Mutable { offset } => Some(offset),
            GlobalStorage::Immutable(_) => None,
        }
    }

    /// The inline value of an immutable global.
    pub fn immutable_value(&self) -> Option<Value> {
        match self.storage {
            GlobalStorage::Immutable(raw) => Some(Value::from_raw(self.ty.ty, raw)),
            GlobalStorage::Mutable { .. } => None,
        }
    }

    /// Reads the global's value as seen by `ctx`.
    pub fn get(&self, ctx: &Context) -> Value {
        match self.storage {
            GlobalStorage::Immutable(raw) => Value::from_raw(self.ty.ty, raw),
            GlobalStorage::Mutable { offset } => {
                debug_assert_eq!(Some(ctx.compartment().id()), self.compartment_id);
                let width = self.ty.ty.byte_width();
                let bytes = ctx.runtime_data().read_global(offset, width);
                Value::from_raw(self.ty.ty, RawValue::from_bytes(&bytes[..width]))
            }
        }
    }

    /// Writes the global's value in `ctx` and returns the previous value.
    ///
    /// The global must be mutable and `value` must have the global's exact
    /// value type. The swap is not atomic: concurrent wasm writes to the same
    /// global from two contexts are outside any ordering guarantee.
    pub fn set(&self, ctx: &Context, value: Value) -> Value {
        assert!(self.ty.mutable, "cannot set an immutable global");
        assert_eq!(
            value.ty(),
            self.ty.ty,
            "wrong type for setting this global"
        );
        match self.storage {
            GlobalStorage::Immutable(_) => unreachable!("mutable flag checked above"),
            GlobalStorage::Mutable { offset } => {
                debug_assert_eq!(Some(ctx.compartment().id()), self.compartment_id);
                let width = self.ty.ty.byte_width();
                let previous_bytes = ctx.runtime_data().read_global(offset, width);
                let previous =
                    Value::from_raw(self.ty.ty, RawValue::from_bytes(&previous_bytes[..width]));
                let bytes = value.to_raw().to_le_bytes();
                ctx.runtime_data().write_global(offset, &bytes[..width]);
                previous
            }
        }
    }

    /// Raw read used by executing code; the caller is responsible for the
    /// value type.
    pub fn get_raw(&self, ctx: &Context) -> RawValue {
        match self.storage {
            GlobalStorage::Immutable(raw) => raw,
            GlobalStorage::Mutable { offset } => {
                let width = self.ty.ty.byte_width();
                let bytes = ctx.runtime_data().read_global(offset, width);
                RawValue::from_bytes(&bytes[..width])
            }
        }
    }

    /// Raw write used by executing code; only valid for mutable globals.
    pub fn set_raw(&self, ctx: &Context, raw: RawValue) {
        match self.storage {
            GlobalStorage::Immutable(_) => {
                unreachable!("validated wasm never writes an immutable global")
            }
            GlobalStorage::Mutable { offset } => {
                let width = self.ty.ty.byte_width();
                let bytes = raw.to_le_bytes();
                ctx.runtime_data().write_global(offset, &bytes[..width]);
            }
        }
    }
}

impl std::fmt::Debug for Global {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Global")
            .field("ty", &self.ty)
            .field("offset", &self.data_offset())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compartment::Compartment;
    use crate::context::Context;

    fn mutable(ty: Type) -> GlobalType {
        GlobalType { mutable: true, ty }
    }

    #[test]
    fn immutable_globals_need_no_compartment() {
        let global = Global::new(
            None,
            GlobalType {
                mutable: false,
                ty: Type::I32,
            },
            Value::I32(7),
        )
        .unwrap();
        assert_eq!(global.immutable_value(), Some(Value::I32(7)));
    }

    #[test]
    fn mutable_global_offsets_are_naturally_aligned() {
        let compartment = Compartment::new();
        let g32 = Global::new(Some(&compartment), mutable(Type::I32), Value::I32(0)).unwrap();
        let g64 = Global::new(Some(&compartment), mutable(Type::I64), Value::I64(0)).unwrap();
        let g128 =
            Global::new(Some(&compartment), mutable(Type::V128), Value::V128(0)).unwrap();

        for (global, width) in [(&g32, 4), (&g64, 8), (&g128, 16)].iter() {
            let offset = global.data_offset().unwrap();
            assert_eq!(offset % width, 0);
            assert!(offset + width <= MAX_GLOBAL_BYTES);
        }
    }

    #[test]
    fn new_contexts_see_values_written_before_their_creation() {
        let compartment = Compartment::new();
        let early_ctx = Context::new(&compartment);

        let global =
            Global::new(Some(&compartment), mutable(Type::I64), Value::I64(99)).unwrap();

        // Both a context that predates the global and one created after see
        // the initial value.
        let late_ctx = Context::new(&compartment);
        assert_eq!(global.get(&early_ctx), Value::I64(99));
        assert_eq!(global.get(&late_ctx), Value::I64(99));

        // Writes are per-context.
        let previous = global.set(&early_ctx, Value::I64(100));
        assert_eq!(previous, Value::I64(99));
        assert_eq!(global.get(&early_ctx), Value::I64(100));
        assert_eq!(global.get(&late_ctx), Value::I64(99));
    }

    #[test]
    fn the_arena_overflows_cleanly() {
        let compartment = Compartment::new();
        let mut created = 0usize;
        loop {
            match Global::new(Some(&compartment), mutable(Type::I64), Value::I64(0)) {
                Ok(_) => created += 1,
                Err(CreationError::GlobalArenaExhausted) => break,
                Err(other) => panic!("unexpected error: {}", other),
            }
            assert!(created <= MAX_GLOBAL_BYTES / 8);
        }
        assert_eq!(created, MAX_GLOBAL_BYTES / 8);
    }
}
