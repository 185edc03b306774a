//! The compartment module implements the isolated execution domain: a
//! compartment exclusively owns every object created inside it, hands out
//! stable ids for contexts, memories and tables, and carries the shared
//! runtime data new contexts are seeded from.
//!
//! The original fixed virtual-address reservation (one base register, small
//! immediate offsets) is re-expressed as slab vectors of owned allocations
//! indexed by stable ids; the addressing discipline is the id, not the
//! pointer.

use crate::{
    context::{ContextId, ContextRuntimeData},
    instance::InstanceInner,
    intrinsics,
    memory::Memory,
    table::Table,
};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};

/// Size of the per-context thunk argument/return scratch region, in bytes.
pub const MAX_THUNK_ARG_AND_RETURN_BYTES: usize = 256;

/// Capacity of the per-context mutable-global storage, in bytes. Together
/// with the thunk scratch this fills the per-context runtime data page.
pub const MAX_GLOBAL_BYTES: usize = 4096 - MAX_THUNK_ARG_AND_RETURN_BYTES;

/// Stable id of a memory within its compartment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryId(pub usize);

/// Stable id of a table within its compartment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TableId(pub usize);

static NEXT_COMPARTMENT_ID: AtomicU64 = AtomicU64::new(0);

pub(crate) struct CompartmentInner {
    /// Per-context runtime data, indexed by `ContextId`. Slots are nulled
    /// when a context dies, never compacted, so ids stay stable.
    pub(crate) contexts: Vec<Option<Arc<ContextRuntimeData>>>,
    /// Memories, indexed by `MemoryId`.
    pub(crate) memories: Vec<Arc<Memory>>,
    /// Tables, indexed by `TableId`.
    pub(crate) tables: Vec<Arc<Table>>,
    /// Instances created in this compartment; they live exactly as long as
    /// the compartment does.
    pub(crate) instances: Vec<Arc<InstanceInner>>,
    /// The image new contexts seed their global data from.
    pub(crate) initial_context_global_data: Box<[u8; MAX_GLOBAL_BYTES]>,
    /// High-water mark of the mutable-global arena.
    pub(crate) num_global_bytes: usize,
}

/// An isolated WebAssembly execution domain. Objects never cross
/// compartments.
pub struct Compartment {
    id: u64,
    pub(crate) inner: Mutex<CompartmentInner>,
    intrinsics: Mutex<Option<Arc<InstanceInner>>>,
}

impl Compartment {
    /// Creates a fresh, empty compartment with its intrinsics module already
    /// instantiated into it.
    pub fn new() -> Arc<Compartment> {
        let compartment = Arc::new(Compartment {
            id: NEXT_COMPARTMENT_ID.fetch_add(1, Ordering::Relaxed),
            inner: Mutex::new(CompartmentInner {
                contexts: Vec::new(),
                memories: Vec::new(),
                tables: Vec::new(),
                instances: Vec::new(),
                initial_context_global_data: Box::new([0u8; MAX_GLOBAL_BYTES]),
                num_global_bytes: 0,
            }),
            intrinsics: Mutex::new(None),
        });

        let intrinsics_instance = intrinsics::instantiate_intrinsics(&compartment);
        *compartment
            .intrinsics
            .lock()
            .expect("compartment intrinsics poisoned") = Some(intrinsics_instance);

        compartment
    }

    /// The process-unique id of this compartment.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The intrinsics module instantiated into this compartment.
    pub fn intrinsics(&self) -> Arc<InstanceInner> {
        self.intrinsics
            .lock()
            .expect("compartment intrinsics poisoned")
            .as_ref()
            .expect("the intrinsics module is instantiated at compartment creation")
            .clone()
    }

    /// Looks up a memory by its stable id.
    pub fn memory_by_id(&self, id: MemoryId) -> Option<Arc<Memory>> {
        let inner = self.lock();
        inner.memories.get(id.0).cloned()
    }

    /// Looks up a table by its stable id.
    pub fn table_by_id(&self, id: TableId) -> Option<Arc<Table>> {
        let inner = self.lock();
        inner.tables.get(id.0).cloned()
    }

    /// Reverse lookup from a context's runtime data back to its id. Used by
    /// intrinsics whose only argument is the runtime data the compiled code
    /// passes along.
    pub fn context_from_runtime_data(&self, data: &Arc<ContextRuntimeData>) -> Option<ContextId> {
        let inner = self.lock();
        inner.contexts.iter().enumerate().find_map(|(id, slot)| {
            slot.as_ref().and_then(|candidate| {
                if Arc::ptr_eq(candidate, data) {
                    Some(ContextId(id))
                } else {
                    None
                }
            })
        })
    }

    /// The current high-water mark of the mutable-global arena.
    pub fn num_global_bytes(&self) -> usize {
        self.lock().num_global_bytes
    }

    pub(crate) fn lock(&self) -> std::sync::MutexGuard<CompartmentInner> {
        self.inner.lock().expect("compartment mutex poisoned")
    }

    pub(crate) fn register_instance(&self, instance: Arc<InstanceInner>) {
        self.lock().instances.push(instance);
    }
}

/// Attempts to retire a compartment.
///
/// Succeeds iff the given handle is the last one; on failure the handle is
/// surrendered but the compartment stays alive behind the remaining
/// references. Callers treat a failure as a programmer error.
pub fn try_collect_compartment(compartment: Arc<Compartment>) -> bool {
    match Arc::try_unwrap(compartment) {
        Ok(compartment) => {
            drop(compartment);
            true
        }
        Err(remaining) => {
            log::error!(
                "failed to collect compartment {}: {} outstanding references",
                remaining.id(),
                Arc::strong_count(&remaining) - 1
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    #[test]
    fn compartments_have_unique_ids() {
        let a = Compartment::new();
        let b = Compartment::new();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn collect_fails_while_a_context_is_outstanding() {
        let compartment = Compartment::new();
        let ctx = Context::new(&compartment);
        assert!(!try_collect_compartment(compartment.clone()));
        drop(ctx);
        assert!(try_collect_compartment(compartment));
    }

    #[test]
    fn context_ids_are_dense_and_stable() {
        let compartment = Compartment::new();
        let c0 = Context::new(&compartment);
        let c1 = Context::new(&compartment);
        assert_eq!(c0.id().0, 0);
        assert_eq!(c1.id().0, 1);

        // Dropping a context nulls its slot without compacting.
        drop(c0);
        let c2 = Context::new(&compartment);
        assert_eq!(c2.id().0, 2);
        assert_eq!(c1.id().0, 1);
    }
}
