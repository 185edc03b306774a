//! Wavm Runtime Core Library
//!
//! The runtime core library provides the execution substrate shared by all
//! compiler backends: compartments and contexts, the object model, typed
//! global/memory/table storage, the import resolver protocol, module
//! instantiation and the host invoke path.
//!
//! A backend (see the [`backend`] module) turns validated WebAssembly into
//! opaque native entry points; everything else about running a module lives
//! here.

#![deny(nonstandard_style, unused_mut, unreachable_patterns)]

#[macro_use]
extern crate serde_derive;

#[allow(unused_imports)]
#[macro_use]
extern crate lazy_static;

mod macros;
pub mod backend;
pub mod compartment;
pub mod context;
pub mod error;
pub mod features;
pub mod global;
pub mod instance;
pub mod intrinsics;
pub mod invoke;
pub mod linker;
pub mod memory;
pub mod module;
pub mod object;
pub mod parse;
mod sig_registry;
pub mod structures;
pub mod table;
pub mod types;
pub mod units;

use crate::error::CompileResult;
#[doc(inline)]
pub use crate::compartment::Compartment;
#[doc(inline)]
pub use crate::context::Context;
#[doc(inline)]
pub use crate::error::Result;
#[doc(inline)]
pub use crate::instance::Instance;
#[doc(inline)]
pub use crate::module::Module;
#[doc(inline)]
pub use crate::sig_registry::SigRegistry;

use std::sync::Arc;

pub use wasmparser;

/// Compile a [`Module`] from WebAssembly binary code using the provided
/// compiler backend. The returned module is not yet bound to a compartment;
/// instantiate it to run it.
pub fn compile_with(
    wasm: &[u8],
    features: &features::FeatureSpec,
    compiler: &dyn backend::Compiler,
) -> CompileResult<Module> {
    let token = backend::Token::generate();
    compiler
        .compile(wasm, features, token)
        .map(|inner| Module::new(Arc::new(inner)))
}

/// Loads a [`Module`] from a precompiled object previously produced by the
/// same backend version.
///
/// # Safety
/// The object bytes are trusted; see [`backend::Compiler::from_object`].
pub unsafe fn load_object_with(
    object: &[u8],
    compiler: &dyn backend::Compiler,
) -> std::result::Result<Module, backend::ObjectLoadError> {
    let token = backend::Token::generate();
    compiler
        .from_object(object, token)
        .map(|inner| Module::new(Arc::new(inner)))
}

/// Perform validation as defined by the WebAssembly specification. Returns
/// `true` if validation succeeded, `false` if validation failed.
pub fn validate(wasm: &[u8], features: &features::FeatureSpec) -> bool {
    parse::validate_and_report_errors(wasm, features).is_ok()
}

/// The current version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
