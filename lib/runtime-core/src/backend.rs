//! The backend module defines the interface between the runtime core and a
//! compiler backend. A backend turns validated WebAssembly into opaque native
//! entry points; the core drives them through [`RunnableModule`] and never
//! looks inside.

use crate::{
    context::Context,
    error::{CompileResult, RuntimeResult},
    features::FeatureSpec,
    instance::InstanceInner,
    module::{ModuleInfo, ModuleInner},
    types::{LocalFuncIndex, RawValue},
};
use std::sync::{Arc, Mutex};

/// This type cannot be constructed from outside the runtime crate: it proves
/// a backend entry point was reached through the runtime.
pub struct Token {
    _private: (),
}

impl Token {
    pub(crate) fn generate() -> Self {
        Self { _private: () }
    }
}

/// A compiler backend.
pub trait Compiler {
    /// Compiles a module from WebAssembly binary format. The `Token` parameter
    /// ensures that this can only be called from inside the runtime.
    fn compile(&self, wasm: &[u8], features: &FeatureSpec, _: Token)
        -> CompileResult<ModuleInner>;

    /// Loads a module from a precompiled object previously produced by
    /// [`RunnableModule::serialize_object`] on the same backend version.
    ///
    /// # Safety
    /// The object bytes are trusted; a tampered object can break the
    /// invariants the compiled code relies on.
    unsafe fn from_object(&self, object: &[u8], _: Token) -> Result<ModuleInner, ObjectLoadError>;

    /// The 64-bit digest identifying everything that went into compilation:
    /// if recompiling a module could produce a different object, the key
    /// differs.
    fn code_key(&self) -> u64;
}

/// The executable half of a compiled module.
///
/// The entry points behind this trait follow the `Wasm` calling convention:
/// they receive the runtime data of the instance environment they were
/// instantiated into.
pub trait RunnableModule: Send + Sync {
    /// Runs the local function `index` of `instance` inside `ctx`.
    ///
    /// `args` and `rets` carry exactly the untagged values of the function's
    /// signature; the invoke thunk has already marshalled them through the
    /// context scratch region.
    fn call_local_function(
        &self,
        instance: &Arc<InstanceInner>,
        ctx: &Context,
        index: LocalFuncIndex,
        args: &[RawValue],
        rets: &mut [RawValue],
    ) -> RuntimeResult<()>;

    /// Serializes this module's object code (together with the IR it was
    /// compiled from) for the object cache and the precompiled-object
    /// section. `None` if the backend cannot serialize.
    fn serialize_object(&self, info: &ModuleInfo) -> Option<Vec<u8>>;
}

/// An error loading a precompiled object.
#[derive(Debug, Clone)]
pub enum ObjectLoadError {
    /// The object was produced by a different backend or runtime version.
    VersionMismatch {
        /// The code key this backend would produce.
        expected: u64,
        /// The code key stored in the object.
        found: u64,
    },
    /// The object bytes could not be decoded.
    Corrupt(String),
}

impl std::fmt::Display for ObjectLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ObjectLoadError::VersionMismatch { expected, found } => write!(
                f,
                "Precompiled object was produced by a different backend version (code key {:#018x}, expected {:#018x})",
                found, expected
            ),
            ObjectLoadError::Corrupt(msg) => {
                write!(f, "Precompiled object is corrupt: {}", msg)
            }
        }
    }
}

impl std::error::Error for ObjectLoadError {}

/// The persistent store a backend may consult before compiling: artifacts
/// keyed by the module-bytes hash, scoped to a single code key.
pub trait ObjectCache: Send + Sync {
    /// Fetches a previously stored object for the given module hash.
    fn get(&self, module_hash: &[u8; 32]) -> Option<Vec<u8>>;
    /// Stores an object under the given module hash. Failures are logged and
    /// swallowed; the cache is an optimization.
    fn put(&self, module_hash: &[u8; 32], object: &[u8]);
}

lazy_static! {
    static ref GLOBAL_OBJECT_CACHE: Mutex<Option<Arc<dyn ObjectCache>>> = Mutex::new(None);
}

/// Installs the process-wide object cache. May be called at most once;
/// returns false (leaving the first handle installed) on later calls.
pub fn set_global_object_cache(cache: Arc<dyn ObjectCache>) -> bool {
    let mut holder = GLOBAL_OBJECT_CACHE.lock().expect("object cache poisoned");
    if holder.is_some() {
        return false;
    }
    *holder = Some(cache);
    true
}

/// The installed process-wide object cache, if any. Backends consult this
/// transparently.
pub fn global_object_cache() -> Option<Arc<dyn ObjectCache>> {
    GLOBAL_OBJECT_CACHE
        .lock()
        .expect("object cache poisoned")
        .clone()
}
