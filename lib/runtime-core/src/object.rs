//! The object module defines the runtime object model: every entity the host
//! and the linker hand around is an [`Object`], a tagged variant over the
//! importable extern kinds plus module instances. Downcasts go through the
//! `as_*` helpers and are only valid after a kind check; [`is_a`] is the
//! single subtype-check entry point.

use crate::{
    context::Context,
    error::RuntimeResult,
    global::Global,
    instance::InstanceInner,
    memory::Memory,
    table::Table,
    types::{ExceptionType, ExternType, FuncSig, LocalFuncIndex, RawValue},
};
use smallvec::SmallVec;
use std::sync::{Arc, Weak};

/// Return values of a host function; almost always zero or one wide.
pub type HostFnReturn = SmallVec<[RawValue; 1]>;

/// The shape of a host function body: called with the invoking context and
/// the untagged arguments, produces untagged results or a runtime error.
pub type HostFn =
    Arc<dyn Fn(&Context, &[RawValue]) -> RuntimeResult<HostFnReturn> + Send + Sync>;

/// How a function entry point expects its context runtime data.
///
/// `Wasm` entries receive the runtime data of their own instance environment;
/// `Intrinsic` entries receive the calling context's runtime data and recover
/// the [`Context`] from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallingConvention {
    /// Compiled WebAssembly code.
    Wasm,
    /// A runtime-library or host ABI function.
    Intrinsic,
}

/// The executable body behind a [`Function`].
#[derive(Clone)]
pub enum FuncKind {
    /// A compiled function owned by a module instance; executed through the
    /// instance's backend module.
    Wasm {
        /// The owning instance. Weak: the instance owns its functions.
        instance: Weak<InstanceInner>,
        /// Index of the body inside the instance's module.
        local_index: LocalFuncIndex,
    },
    /// A host-provided function.
    Host(HostFn),
}

/// A callable function object: a signature, an opaque entry point and the
/// calling convention the entry point expects.
pub struct Function {
    signature: Arc<FuncSig>,
    kind: FuncKind,
    calling_convention: CallingConvention,
    debug_name: String,
    compartment_id: Option<u64>,
}

impl Function {
    /// Creates a host function object.
    pub fn host(
        signature: Arc<FuncSig>,
        calling_convention: CallingConvention,
        debug_name: &str,
        f: HostFn,
    ) -> Arc<Function> {
        Arc::new(Function {
            signature,
            kind: FuncKind::Host(f),
            calling_convention,
            debug_name: debug_name.to_string(),
            compartment_id: None,
        })
    }

    pub(crate) fn wasm(
        signature: Arc<FuncSig>,
        instance: Weak<InstanceInner>,
        local_index: LocalFuncIndex,
        debug_name: String,
        compartment_id: u64,
    ) -> Arc<Function> {
        Arc::new(Function {
            signature,
            kind: FuncKind::Wasm {
                instance,
                local_index,
            },
            calling_convention: CallingConvention::Wasm,
            debug_name,
            compartment_id: Some(compartment_id),
        })
    }

    /// The canonicalized signature of this function.
    pub fn signature(&self) -> &Arc<FuncSig> {
        &self.signature
    }

    /// The calling convention of the entry point.
    pub fn calling_convention(&self) -> CallingConvention {
        self.calling_convention
    }

    /// The name used in diagnostics.
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    pub(crate) fn kind(&self) -> &FuncKind {
        &self.kind
    }

    pub(crate) fn compartment_id(&self) -> Option<u64> {
        self.compartment_id
    }
}

impl std::fmt::Debug for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Function")
            .field("signature", &self.signature)
            .field("calling_convention", &self.calling_convention)
            .field("debug_name", &self.debug_name)
            .finish()
    }
}

/// A tagged-exception type object.
#[derive(Debug)]
pub struct ExceptionTypeInstance {
    /// The parameters carried by exceptions of this type.
    pub params: ExceptionType,
    /// The name used in diagnostics.
    pub debug_name: String,
}

/// Every live runtime entity that can cross the import/export boundary.
///
/// The kind tag is the first discriminator everywhere the original design
/// used polymorphism plus downcasts.
#[derive(Clone)]
pub enum Object {
    /// A function.
    Function(Arc<Function>),
    /// A global.
    Global(Arc<Global>),
    /// A table.
    Table(Arc<Table>),
    /// A linear memory.
    Memory(Arc<Memory>),
    /// An exception type.
    ExceptionType(Arc<ExceptionTypeInstance>),
    /// A module instance.
    Instance(Arc<InstanceInner>),
}

impl Object {
    /// Downcast to a function after a kind check.
    pub fn as_function(&self) -> Option<&Arc<Function>> {
        match self {
            Object::Function(f) => Some(f),
            _ => None,
        }
    }

    /// Downcast to a global after a kind check.
    pub fn as_global(&self) -> Option<&Arc<Global>> {
        match self {
            Object::Global(g) => Some(g),
            _ => None,
        }
    }

    /// Downcast to a table after a kind check.
    pub fn as_table(&self) -> Option<&Arc<Table>> {
        match self {
            Object::Table(t) => Some(t),
            _ => None,
        }
    }

    /// Downcast to a memory after a kind check.
    pub fn as_memory(&self) -> Option<&Arc<Memory>> {
        match self {
            Object::Memory(m) => Some(m),
            _ => None,
        }
    }

    /// Downcast to an exception type after a kind check.
    pub fn as_exception_type(&self) -> Option<&Arc<ExceptionTypeInstance>> {
        match self {
            Object::ExceptionType(e) => Some(e),
            _ => None,
        }
    }

    /// Downcast to a module instance after a kind check.
    pub fn as_instance(&self) -> Option<&Arc<InstanceInner>> {
        match self {
            Object::Instance(i) => Some(i),
            _ => None,
        }
    }

    /// The compartment the object belongs to, if it is compartment-bound.
    /// Immutable globals and host functions may live outside any compartment.
    pub fn compartment_id(&self) -> Option<u64> {
        match self {
            Object::Function(f) => f.compartment_id(),
            Object::Global(g) => g.compartment_id(),
            Object::Table(t) => Some(t.compartment_id()),
            Object::Memory(m) => Some(m.compartment_id()),
            Object::ExceptionType(_) => None,
            Object::Instance(i) => Some(i.compartment_id()),
        }
    }
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Object::Function(func) => write!(f, "Function({})", func.debug_name()),
            Object::Global(g) => write!(f, "Global({})", g.ty()),
            Object::Table(t) => write!(f, "Table({})", t.ty()),
            Object::Memory(m) => write!(f, "Memory({})", m.ty()),
            Object::ExceptionType(e) => write!(f, "ExceptionType({})", e.debug_name),
            Object::Instance(i) => write!(f, "Instance({})", i.debug_name()),
        }
    }
}

/// The precise extern type of a live object.
pub fn object_type(object: &Object) -> ExternType {
    match object {
        Object::Function(f) => ExternType::Function(f.signature().clone()),
        Object::Global(g) => ExternType::Global(g.ty()),
        Object::Table(t) => ExternType::Table(t.ty()),
        Object::Memory(m) => ExternType::Memory(m.ty()),
        Object::ExceptionType(e) => ExternType::ExceptionType(e.params.clone()),
        Object::Instance(_) => ExternType::Instance,
    }
}

/// Does `object` satisfy a request for `ty`?
///
/// Function, global, exception and instance types are invariant; table and
/// memory types obey width-subtyping.
pub fn is_a(object: &Object, ty: &ExternType) -> bool {
    match (object, ty) {
        (Object::Function(f), ExternType::Function(expected)) => {
            **f.signature() == **expected
        }
        (Object::Global(g), ExternType::Global(expected)) => g.ty() == *expected,
        (Object::Table(t), ExternType::Table(expected)) => t.ty().is_subtype_of(expected),
        (Object::Memory(m), ExternType::Memory(expected)) => m.ty().is_subtype_of(expected),
        (Object::ExceptionType(e), ExternType::ExceptionType(expected)) => e.params == *expected,
        (Object::Instance(_), ExternType::Instance) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Type;

    #[test]
    fn kind_mismatches_never_satisfy_is_a() {
        let exception = Object::ExceptionType(Arc::new(ExceptionTypeInstance {
            params: ExceptionType {
                params: vec![Type::I32],
            },
            debug_name: "testException".to_string(),
        }));

        assert!(is_a(
            &exception,
            &ExternType::ExceptionType(ExceptionType {
                params: vec![Type::I32],
            })
        ));
        // Exception types are invariant.
        assert!(!is_a(
            &exception,
            &ExternType::ExceptionType(ExceptionType {
                params: vec![Type::I64],
            })
        ));
        // A kind mismatch is never a subtype.
        assert!(!is_a(
            &exception,
            &ExternType::Function(crate::SigRegistry.canonicalize(
                &crate::types::FuncSig::new(vec![Type::I32], vec![])
            ))
        ));
    }
}
