//! The error module contains the data structures and helper functions used to
//! implement errors that are produced and returned from the wavm runtime core.
use crate::types::{ExternType, FuncSig, Type};
use std::any::Any;
use std::sync::Arc;

/// Aliases the standard `Result` type as `Result` within this module.
pub type Result<T> = std::result::Result<T, Error>;
/// Result of an attempt to compile the provided WebAssembly module into a `Module`.
pub type CompileResult<T> = std::result::Result<T, CompileError>;
/// Result of an attempt to run code inside a context.
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;
/// Result of an attempt to call an exported WebAssembly function.
pub type CallResult<T> = std::result::Result<T, CallError>;
/// Result of an attempt to resolve a WebAssembly export by name.
pub type ResolveResult<T> = std::result::Result<T, ResolveError>;

/// This is returned when the chosen compiler backend is unable to compile the
/// provided WebAssembly module into a `Module`.
///
/// Comparing two `CompileError`s always evaluates to false.
#[derive(Debug, Clone)]
pub enum CompileError {
    /// A validation error containing an error message.
    ValidationError {
        /// An error message.
        msg: String,
    },
    /// The module uses a feature that is not enabled in its feature spec.
    UnsupportedFeature {
        /// The feature name.
        feature: String,
    },
    /// An internal error containing an error message.
    InternalError {
        /// An error message.
        msg: String,
    },
}

impl PartialEq for CompileError {
    fn eq(&self, _other: &CompileError) -> bool {
        false
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            CompileError::InternalError { msg } => {
                write!(f, "Internal compiler error: \"{}\"", msg)
            }
            CompileError::ValidationError { msg } => write!(f, "Validation error \"{}\"", msg),
            CompileError::UnsupportedFeature { feature } => {
                write!(f, "Unsupported feature \"{}\"", feature)
            }
        }
    }
}

impl std::error::Error for CompileError {}

/// An import that a resolver failed to provide, together with the type the
/// module expected.
#[derive(Debug, Clone)]
pub struct MissingImport {
    /// Module (namespace) name of the import.
    pub module_name: String,
    /// Export (field) name of the import.
    pub export_name: String,
    /// The type the module declared for the import.
    pub ty: ExternType,
}

impl std::fmt::Display for MissingImport {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Missing import: module=\"{}\" export=\"{}\" type=\"{}\"",
            self.module_name, self.export_name, self.ty
        )
    }
}

/// This is returned when the runtime is unable to correctly link the module
/// with the provided imports.
///
/// Comparing two `LinkError`s always evaluates to false.
#[derive(Debug, Clone)]
pub enum LinkError {
    /// An expected import was not provided, or was provided with an
    /// unsatisfiable type.
    MissingImport(MissingImport),
    /// A resolved import does not satisfy the type the module declared at
    /// that import position.
    IncorrectImportType {
        /// Namespace.
        namespace: String,
        /// Name.
        name: String,
        /// Expected.
        expected: String,
        /// Found.
        found: String,
    },
}

impl PartialEq for LinkError {
    fn eq(&self, _other: &LinkError) -> bool {
        false
    }
}

impl std::fmt::Display for LinkError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            LinkError::MissingImport(missing) => write!(f, "{}", missing),
            LinkError::IncorrectImportType {
                namespace,
                name,
                expected,
                found,
            } => write!(
                f,
                "Incorrect import type, namespace: {}, name: {}, expected type: {}, found type: {}",
                namespace, name, expected, found
            ),
        }
    }
}

impl std::error::Error for LinkError {}

/// The reason instantiation of a linked module failed. No module instance is
/// produced and any storage created for it is torn down.
#[derive(Debug, Clone)]
pub enum InstantiationError {
    /// The resolved imports did not match the module's declared imports
    /// position by position.
    ImportMismatch {
        /// The import position.
        index: usize,
        /// What the module declared there.
        expected: String,
        /// What the resolver supplied.
        found: String,
    },
    /// An element segment referenced table slots past the end of the table.
    ElementSegmentOutOfBounds {
        /// First out-of-bounds element offset.
        offset: usize,
        /// Table size at instantiation time.
        table_size: usize,
    },
    /// A data segment referenced memory past the end of the memory.
    DataSegmentOutOfBounds {
        /// First out-of-bounds byte offset.
        offset: usize,
        /// Memory size in bytes at instantiation time.
        memory_size: usize,
    },
    /// A global initializer did not evaluate to the declared type.
    GlobalInitTypeMismatch {
        /// The declared type.
        expected: Type,
        /// The initializer's type.
        found: Type,
    },
    /// Creating a memory, table or global failed.
    Creation(CreationError),
}

impl std::fmt::Display for InstantiationError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            InstantiationError::ImportMismatch {
                index,
                expected,
                found,
            } => write!(
                f,
                "Import {} was expected to be a {} but a {} was provided",
                index, expected, found
            ),
            InstantiationError::ElementSegmentOutOfBounds { offset, table_size } => write!(
                f,
                "Invalid element segment: offset {} is out of bounds for a table of {} elements",
                offset, table_size
            ),
            InstantiationError::DataSegmentOutOfBounds {
                offset,
                memory_size,
            } => write!(
                f,
                "Invalid data segment: offset {} is out of bounds for a memory of {} bytes",
                offset, memory_size
            ),
            InstantiationError::GlobalInitTypeMismatch { expected, found } => write!(
                f,
                "Global initializer type mismatch: expected {}, found {}",
                expected, found
            ),
            InstantiationError::Creation(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for InstantiationError {}

impl From<CreationError> for InstantiationError {
    fn from(err: CreationError) -> Self {
        InstantiationError::Creation(err)
    }
}

/// A typed trap raised by running WebAssembly code or by a runtime intrinsic
/// on its behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    /// Integer division by zero, or `INT_MIN / -1` style overflow.
    IntegerDivideByZeroOrOverflow,
    /// An `unreachable` instruction was executed.
    ReachedUnreachable,
    /// An out-of-bounds memory access.
    AccessViolation,
    /// A float-to-integer conversion with an unrepresentable operand.
    InvalidFloatOperation,
    /// An indirect call through a null table element or past the table end.
    UndefinedTableElement,
    /// An indirect call whose callee signature did not match the expected
    /// signature.
    IndirectCallSignatureMismatch,
    /// The guest exhausted its call stack.
    StackOverflow,
    /// An allocation inside the runtime failed.
    OutOfMemory,
    /// A checked invoke was handed arguments that do not match the callee
    /// signature.
    InvokeSignatureMismatch,
    /// A stub function synthesized for an unresolved import was called.
    CalledAbort,
}

impl std::fmt::Display for Trap {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let text = match self {
            Trap::IntegerDivideByZeroOrOverflow => "integer divide by zero or integer overflow",
            Trap::ReachedUnreachable => "reached unreachable code",
            Trap::AccessViolation => "access violation",
            Trap::InvalidFloatOperation => "invalid floating point operation",
            Trap::UndefinedTableElement => "undefined table element",
            Trap::IndirectCallSignatureMismatch => "indirect call signature mismatch",
            Trap::StackOverflow => "stack overflow",
            Trap::OutOfMemory => "out of memory",
            Trap::InvokeSignatureMismatch => "invoke signature mismatch",
            Trap::CalledAbort => "called abort",
        };
        write!(f, "{}", text)
    }
}

/// The error type produced by running WebAssembly code.
///
/// A guest-initiated exit is the distinguished `HostExit` variant: it carries
/// the exit code and is not a failure.
///
/// Comparing two `RuntimeError`s always evaluates to false.
pub enum RuntimeError {
    /// A typed trap.
    Trap(Trap),
    /// A guest-initiated exit through a host ABI's exit primitive.
    HostExit(i32),
    /// An arbitrary error raised by a host function.
    User(Box<dyn Any + Send>),
}

impl RuntimeError {
    /// The exit code when this error is a guest exit.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            RuntimeError::HostExit(code) => Some(*code),
            _ => None,
        }
    }
}

impl PartialEq for RuntimeError {
    fn eq(&self, _other: &RuntimeError) -> bool {
        false
    }
}

impl std::fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            RuntimeError::Trap(trap) => write!(f, "{}", trap),
            RuntimeError::HostExit(code) => write!(f, "host exit with code {}", code),
            RuntimeError::User(data) => {
                if let Some(s) = data.downcast_ref::<String>() {
                    write!(f, "\"{}\"", s)
                } else if let Some(s) = data.downcast_ref::<&str>() {
                    write!(f, "\"{}\"", s)
                } else {
                    write!(f, "unknown user error")
                }
            }
        }
    }
}

impl std::fmt::Debug for RuntimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl std::error::Error for RuntimeError {}

impl From<Trap> for RuntimeError {
    fn from(trap: Trap) -> Self {
        RuntimeError::Trap(trap)
    }
}

/// This error type is produced by resolving a wasm export given its name.
///
/// Comparing two `ResolveError`s always evaluates to false.
#[derive(Debug, Clone)]
pub enum ResolveError {
    /// Found signature did not match expected signature.
    Signature {
        /// Expected `FuncSig`.
        expected: Arc<FuncSig>,
        /// Found types.
        found: Vec<Type>,
    },
    /// Export not found.
    ExportNotFound {
        /// Name.
        name: String,
    },
    /// Export found with the wrong kind.
    ExportWrongType {
        /// Name.
        name: String,
    },
}

impl PartialEq for ResolveError {
    fn eq(&self, _other: &ResolveError) -> bool {
        false
    }
}

impl std::fmt::Display for ResolveError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ResolveError::ExportNotFound { name } => write!(f, "Export not found: {}", name),
            ResolveError::ExportWrongType { name } => write!(f, "Export wrong type: {}", name),
            ResolveError::Signature { expected, found } => {
                let found = found
                    .iter()
                    .map(|p| p.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(
                    f,
                    "Parameters of type [{}] did not match signature {}",
                    found, expected
                )
            }
        }
    }
}

impl std::error::Error for ResolveError {}

/// This error type is produced by calling a wasm function exported from a
/// module.
///
/// Comparing two `CallError`s always evaluates to false.
pub enum CallError {
    /// An error occurred resolving the function's name or types.
    Resolve(ResolveError),
    /// A runtime error occurred during the function call.
    Runtime(RuntimeError),
}

impl PartialEq for CallError {
    fn eq(&self, _other: &CallError) -> bool {
        false
    }
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            CallError::Resolve(resolve_error) => write!(f, "Call error: {}", resolve_error),
            CallError::Runtime(runtime_error) => write!(f, "Call error: {}", runtime_error),
        }
    }
}

impl std::fmt::Debug for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            CallError::Resolve(resolve_err) => write!(f, "ResolveError: {:?}", resolve_err),
            CallError::Runtime(runtime_err) => write!(f, "RuntimeError: {:?}", runtime_err),
        }
    }
}

impl std::error::Error for CallError {}

/// This error type is produced when creating something, like a `Memory` or a
/// `Table`.
#[derive(Debug, Clone)]
pub enum CreationError {
    /// Unable to create memory error.
    UnableToCreateMemory,
    /// Unable to create table error.
    UnableToCreateTable,
    /// The compartment's mutable-global arena is exhausted.
    GlobalArenaExhausted,
    /// Invalid descriptor error with message.
    InvalidDescriptor(String),
}

impl PartialEq for CreationError {
    fn eq(&self, _other: &CreationError) -> bool {
        false
    }
}

impl std::fmt::Display for CreationError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            CreationError::UnableToCreateMemory => write!(f, "Unable to Create Memory"),
            CreationError::UnableToCreateTable => write!(f, "Unable to Create Table"),
            CreationError::GlobalArenaExhausted => {
                write!(f, "The compartment has no room left for mutable globals")
            }
            CreationError::InvalidDescriptor(msg) => write!(
                f,
                "Unable to create because the supplied descriptor is invalid: \"{}\"",
                msg
            ),
        }
    }
}

impl std::error::Error for CreationError {}

/// The amalgamation of all errors that can occur during the compilation,
/// linking, instantiation, or execution of a WebAssembly module.
///
/// Comparing two `Error`s always evaluates to false.
#[derive(Debug)]
pub enum Error {
    /// Compile error.
    CompileError(CompileError),
    /// Link errors.
    LinkError(Vec<LinkError>),
    /// Instantiation error.
    InstantiationError(InstantiationError),
    /// Runtime error.
    RuntimeError(RuntimeError),
    /// Resolve error.
    ResolveError(ResolveError),
    /// Call error.
    CallError(CallError),
    /// Creation error.
    CreationError(CreationError),
}

impl PartialEq for Error {
    fn eq(&self, _other: &Error) -> bool {
        false
    }
}

impl From<CompileError> for Error {
    fn from(compile_err: CompileError) -> Self {
        Error::CompileError(compile_err)
    }
}

impl From<Vec<LinkError>> for Error {
    fn from(link_errs: Vec<LinkError>) -> Self {
        Error::LinkError(link_errs)
    }
}

impl From<InstantiationError> for Error {
    fn from(err: InstantiationError) -> Self {
        Error::InstantiationError(err)
    }
}

impl From<RuntimeError> for Error {
    fn from(runtime_err: RuntimeError) -> Self {
        Error::RuntimeError(runtime_err)
    }
}

impl From<ResolveError> for Error {
    fn from(resolve_err: ResolveError) -> Self {
        Error::ResolveError(resolve_err)
    }
}

impl From<CallError> for Error {
    fn from(call_err: CallError) -> Self {
        Error::CallError(call_err)
    }
}

impl From<CreationError> for Error {
    fn from(creation_err: CreationError) -> Self {
        Error::CreationError(creation_err)
    }
}

impl From<RuntimeError> for CallError {
    fn from(runtime_err: RuntimeError) -> Self {
        CallError::Runtime(runtime_err)
    }
}

impl From<ResolveError> for CallError {
    fn from(resolve_err: ResolveError) -> Self {
        CallError::Resolve(resolve_err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::CompileError(err) => write!(f, "compile error: {}", err),
            Error::LinkError(errs) => {
                if errs.len() == 1 {
                    write!(f, "link error: {}", errs[0])
                } else {
                    write!(f, "{} link errors:", errs.len())?;
                    for (i, err) in errs.iter().enumerate() {
                        write!(f, " ({} of {}) {}", i + 1, errs.len(), err)?;
                    }
                    Ok(())
                }
            }
            Error::InstantiationError(err) => write!(f, "instantiation error: {}", err),
            Error::RuntimeError(err) => write!(f, "runtime error: {}", err),
            Error::ResolveError(err) => write!(f, "resolve error: {}", err),
            Error::CallError(err) => write!(f, "call error: {}", err),
            Error::CreationError(err) => write!(f, "creation error: {}", err),
        }
    }
}

impl std::error::Error for Error {}

/// An error occurred while growing a memory or table.
#[derive(Debug)]
pub enum GrowError {
    /// Error growing memory.
    MemoryGrowError,
    /// Error growing table.
    TableGrowError,
    /// Max pages were exceeded.
    ExceededMaxPages(PageError),
}

impl std::fmt::Display for GrowError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            GrowError::MemoryGrowError => write!(f, "Unable to grow memory"),
            GrowError::TableGrowError => write!(f, "Unable to grow table"),
            GrowError::ExceededMaxPages(e) => write!(f, "Grow Error: {}", e),
        }
    }
}

impl std::error::Error for GrowError {}

/// A kind of page error.
#[derive(Debug, PartialEq)]
pub enum PageError {
    // left, added, total
    /// Max pages were exceeded error.
    ExceededMaxPages(usize, usize, usize),
}

impl std::fmt::Display for PageError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            PageError::ExceededMaxPages(current, added, total) => write!(
                f,
                "Failed to add pages because would exceed maximum number of pages. Current: {}, Pages added: {}, Total: {}",
                current, added, total
            ),
        }
    }
}
impl std::error::Error for PageError {}

impl From<PageError> for GrowError {
    fn from(err: PageError) -> Self {
        GrowError::ExceededMaxPages(err)
    }
}
