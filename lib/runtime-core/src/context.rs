//! The context module implements the per-thread execution cursor of a
//! compartment. A context owns the mutable-global storage its wasm code sees
//! plus the thunk argument/return scratch region the invoke path marshals
//! through.
//!
//! A context is not a thread: a thread may use several contexts sequentially,
//! but two threads must not drive the same context concurrently.

use crate::compartment::{Compartment, MAX_GLOBAL_BYTES, MAX_THUNK_ARG_AND_RETURN_BYTES};
use std::sync::{Arc, Mutex};

/// Stable id of a context within its compartment. Dense, never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(pub usize);

/// The per-context runtime data page: the thunk scratch region at a fixed
/// offset and the mutable-global slab behind it.
///
/// Each region is written either by the owning thread between calls or by the
/// compartment (under its mutex) when a new mutable global is initialized;
/// the locks are never held across guest execution.
pub struct ContextRuntimeData {
    context_id: ContextId,
    thunk_arg_and_return_data: Mutex<[u8; MAX_THUNK_ARG_AND_RETURN_BYTES]>,
    global_data: Mutex<Box<[u8; MAX_GLOBAL_BYTES]>>,
}

impl ContextRuntimeData {
    fn new(context_id: ContextId, initial_global_data: &[u8; MAX_GLOBAL_BYTES]) -> Self {
        ContextRuntimeData {
            context_id,
            thunk_arg_and_return_data: Mutex::new([0u8; MAX_THUNK_ARG_AND_RETURN_BYTES]),
            global_data: Mutex::new(Box::new(*initial_global_data)),
        }
    }

    /// The id of the context this runtime data belongs to.
    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    /// Reads `width` bytes of global storage at `offset`.
    pub fn read_global(&self, offset: usize, width: usize) -> [u8; 16] {
        let data = self.global_data.lock().expect("global data poisoned");
        let mut out = [0u8; 16];
        out[..width].copy_from_slice(&data[offset..offset + width]);
        out
    }

    /// Writes `bytes` into global storage at `offset`.
    pub fn write_global(&self, offset: usize, bytes: &[u8]) {
        let mut data = self.global_data.lock().expect("global data poisoned");
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Runs `f` over the whole global-data slab.
    pub fn with_global_data<R>(&self, f: impl FnOnce(&[u8; MAX_GLOBAL_BYTES]) -> R) -> R {
        let data = self.global_data.lock().expect("global data poisoned");
        f(&data)
    }

    fn copy_global_data_from(&self, source: &ContextRuntimeData) {
        let source_data = source.global_data.lock().expect("global data poisoned");
        let mut data = self.global_data.lock().expect("global data poisoned");
        **data = **source_data;
    }

    /// Writes argument bytes into the thunk scratch region.
    pub fn write_scratch(&self, offset: usize, bytes: &[u8]) {
        let mut scratch = self
            .thunk_arg_and_return_data
            .lock()
            .expect("thunk scratch poisoned");
        scratch[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Reads bytes back out of the thunk scratch region.
    pub fn read_scratch(&self, offset: usize, width: usize) -> [u8; 16] {
        let scratch = self
            .thunk_arg_and_return_data
            .lock()
            .expect("thunk scratch poisoned");
        let mut out = [0u8; 16];
        out[..width].copy_from_slice(&scratch[offset..offset + width]);
        out
    }
}

/// An execution cursor inside a compartment.
///
/// Holding a context keeps its compartment alive; the runtime-data slot it
/// occupies is nulled (not compacted) when the context is dropped, so ids
/// remain stable for the compartment's lifetime.
pub struct Context {
    compartment: Arc<Compartment>,
    id: ContextId,
    runtime_data: Arc<ContextRuntimeData>,
}

impl Context {
    /// Creates a context in the compartment, seeding its global data from the
    /// compartment's initial image.
    pub fn new(compartment: &Arc<Compartment>) -> Context {
        let (id, runtime_data) = {
            let mut inner = compartment.lock();
            let id = ContextId(inner.contexts.len());
            let runtime_data = Arc::new(ContextRuntimeData::new(
                id,
                &inner.initial_context_global_data,
            ));
            inner.contexts.push(Some(Arc::clone(&runtime_data)));
            (id, runtime_data)
        };

        Context {
            compartment: Arc::clone(compartment),
            id,
            runtime_data,
        }
    }

    /// Creates a context whose global data is copied from this one rather
    /// than from the compartment's initial image.
    pub fn clone_in_place(&self) -> Context {
        let cloned = Context::new(&self.compartment);
        cloned
            .runtime_data
            .copy_global_data_from(&self.runtime_data);
        cloned
    }

    /// The compartment this context belongs to.
    pub fn compartment(&self) -> &Arc<Compartment> {
        &self.compartment
    }

    /// The context's stable id.
    pub fn id(&self) -> ContextId {
        self.id
    }

    /// The context's runtime data page.
    pub fn runtime_data(&self) -> &Arc<ContextRuntimeData> {
        &self.runtime_data
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let mut inner = self.compartment.lock();
        inner.contexts[self.id.0] = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compartment::Compartment;

    #[test]
    fn runtime_data_reverse_lookup_finds_the_context() {
        let compartment = Compartment::new();
        let ctx = Context::new(&compartment);
        let found = compartment.context_from_runtime_data(ctx.runtime_data());
        assert_eq!(found, Some(ctx.id()));
    }

    #[test]
    fn cloned_contexts_copy_global_data() {
        let compartment = Compartment::new();
        let ctx = Context::new(&compartment);
        ctx.runtime_data().write_global(8, &[0xAB; 4]);

        let clone = ctx.clone_in_place();
        assert_eq!(clone.runtime_data().read_global(8, 4)[..4], [0xAB; 4]);

        // A fresh context is seeded from the initial image instead.
        let fresh = Context::new(&compartment);
        assert_eq!(fresh.runtime_data().read_global(8, 4)[..4], [0u8; 4]);
    }
}
