//! The instance module binds a compiled module's imports, creates its local
//! storage, runs segment initialization and installs the export table.
//!
//! Instantiation is all-or-nothing: every element and data segment is bounds
//! checked before any storage is created or written, so a failed
//! instantiation leaks no partial state into the compartment.

use crate::{
    backend::RunnableModule,
    compartment::Compartment,
    context::Context,
    error::{CallError, CallResult, InstantiationError, ResolveError, RuntimeResult},
    global::Global,
    invoke::invoke_function_checked,
    memory::Memory,
    module::{ExportIndex, ModuleInfo, ModuleInner, Module},
    object::{is_a, object_type, Function, Object},
    structures::TypedIndex,
    table::{Anyfunc, Table},
    types::{
        FuncIndex, Initializer, LocalFuncIndex, RawValue, Type, Value,
    },
    units::Bytes,
};
use hashbrown::HashMap;
use std::sync::{Arc, Weak};

/// The body of an instantiated module: resolved imports plus local storage,
/// addressed through flat index spaces (imports first, locals after).
pub struct InstanceInner {
    /// The compiled module this instance was created from.
    pub module: Arc<ModuleInner>,
    compartment: Weak<Compartment>,
    compartment_id: u64,
    debug_name: String,
    functions: Vec<Arc<Function>>,
    memories: Vec<Arc<Memory>>,
    tables: Vec<Arc<Table>>,
    globals: Vec<Arc<Global>>,
    exports: HashMap<String, Object>,
    start_func: Option<Arc<Function>>,
}

impl InstanceInner {
    /// Looks up an export by name. The returned object belongs to the same
    /// compartment as this instance.
    pub fn get_export(&self, name: &str) -> Option<Object> {
        self.exports.get(name).cloned()
    }

    /// The names of every export, for diagnostics.
    pub fn export_names(&self) -> impl Iterator<Item = &str> {
        self.exports.keys().map(|name| name.as_str())
    }

    /// The module's start function, if it declared one. Recorded at
    /// instantiation; the host decides when (and whether) to invoke it.
    pub fn start_function(&self) -> Option<&Arc<Function>> {
        self.start_func.as_ref()
    }

    /// The name given to this instance for diagnostics.
    pub fn debug_name(&self) -> &str {
        &self.debug_name
    }

    /// The id of the owning compartment.
    pub fn compartment_id(&self) -> u64 {
        self.compartment_id
    }

    /// The owning compartment, while it is alive.
    pub fn compartment(&self) -> Option<Arc<Compartment>> {
        self.compartment.upgrade()
    }

    /// The function at a flat function index.
    pub fn function_by_index(&self, index: FuncIndex) -> Option<&Arc<Function>> {
        self.functions.get(index.index())
    }

    /// The memory at a flat memory index.
    pub fn memory_by_index(&self, index: usize) -> Option<&Arc<Memory>> {
        self.memories.get(index)
    }

    /// The table at a flat table index.
    pub fn table_by_index(&self, index: usize) -> Option<&Arc<Table>> {
        self.tables.get(index)
    }

    /// The global at a flat global index.
    pub fn global_by_index(&self, index: usize) -> Option<&Arc<Global>> {
        self.globals.get(index)
    }

    /// Builds a host-function module: an instance whose exports were supplied
    /// directly by the host rather than compiled. Used for the intrinsics
    /// module and the host ABI namespaces.
    pub fn from_exports(
        compartment: &Arc<Compartment>,
        debug_name: &str,
        exports: Vec<(String, Object)>,
    ) -> Arc<InstanceInner> {
        let module = Arc::new(ModuleInner {
            runnable_module: Box::new(HostModuleRunnable),
            info: ModuleInfo::empty(),
        });
        let instance = Arc::new(InstanceInner {
            module,
            compartment: Arc::downgrade(compartment),
            compartment_id: compartment.id(),
            debug_name: debug_name.to_string(),
            functions: Vec::new(),
            memories: Vec::new(),
            tables: Vec::new(),
            globals: Vec::new(),
            exports: exports.into_iter().collect(),
            start_func: None,
        });
        compartment.register_instance(Arc::clone(&instance));
        instance
    }
}

impl std::fmt::Debug for InstanceInner {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("debug_name", &self.debug_name)
            .field("exports", &self.exports.len())
            .finish()
    }
}

struct HostModuleRunnable;

impl RunnableModule for HostModuleRunnable {
    fn call_local_function(
        &self,
        _instance: &Arc<InstanceInner>,
        _ctx: &Context,
        _index: LocalFuncIndex,
        _args: &[RawValue],
        _rets: &mut [RawValue],
    ) -> RuntimeResult<()> {
        unreachable!("host modules have no local function bodies")
    }

    fn serialize_object(&self, _info: &ModuleInfo) -> Option<Vec<u8>> {
        None
    }
}

/// An instantiated WebAssembly module, ready to have its exports invoked
/// inside a [`Context`] of its compartment.
#[derive(Clone)]
pub struct Instance(pub Arc<InstanceInner>);

impl Instance {
    /// Instantiates `module` into `compartment`, binding `resolved_imports`
    /// (in import declaration order) to the module's imports.
    pub fn new(
        compartment: &Arc<Compartment>,
        module: &Module,
        resolved_imports: &[Object],
        debug_name: &str,
    ) -> Result<Instance, InstantiationError> {
        let info = &module.0.info;

        // 1. The resolved imports must match the declared imports position by
        // position, under the subtyping rules (width subtyping for tables and
        // memories, invariance otherwise), and must not cross compartments.
        if resolved_imports.len() != info.import_order.len() {
            return Err(InstantiationError::ImportMismatch {
                index: resolved_imports.len().min(info.import_order.len()),
                expected: format!("{} imports", info.import_order.len()),
                found: format!("{} objects", resolved_imports.len()),
            });
        }

        let mut imported_functions = Vec::new();
        let mut imported_tables = Vec::new();
        let mut imported_memories = Vec::new();
        let mut imported_globals = Vec::new();

        for (index, (decl, object)) in info
            .import_order
            .iter()
            .zip(resolved_imports.iter())
            .enumerate()
        {
            let (_, expected) = info.import_decl(decl);
            if !is_a(object, &expected) {
                return Err(InstantiationError::ImportMismatch {
                    index,
                    expected: expected.to_string(),
                    found: object_type(object).to_string(),
                });
            }
            if let Some(owner) = object.compartment_id() {
                if owner != compartment.id() {
                    return Err(InstantiationError::ImportMismatch {
                        index,
                        expected: format!("an object of compartment {}", compartment.id()),
                        found: format!("an object of compartment {}", owner),
                    });
                }
            }
            match object {
                Object::Function(f) => imported_functions.push(Arc::clone(f)),
                Object::Table(t) => imported_tables.push(Arc::clone(t)),
                Object::Memory(m) => imported_memories.push(Arc::clone(m)),
                Object::Global(g) => imported_globals.push(Arc::clone(g)),
                Object::ExceptionType(_) | Object::Instance(_) => {
                    return Err(InstantiationError::ImportMismatch {
                        index,
                        expected: expected.to_string(),
                        found: object_type(object).to_string(),
                    });
                }
            }
        }

        // 2. Evaluate local global initializers against the imports visible
        // at this point.
        let mut local_global_values = Vec::new();
        for (_, init) in info.globals.iter() {
            let value = eval_initializer(&init.init, &imported_globals)?;
            if value.ty() != init.desc.ty {
                return Err(InstantiationError::GlobalInitTypeMismatch {
                    expected: init.desc.ty,
                    found: value.ty(),
                });
            }
            local_global_values.push(value);
        }

        // 3. Bounds-check every element and data segment before creating any
        // storage, so failure leaks nothing. Local tables and memories start
        // at their declared minimum; imported ones are measured live.
        for initializer in &info.elem_initializers {
            let offset = eval_offset(&initializer.base, &imported_globals)?;
            let table_size = table_size_at_instantiation(
                info,
                initializer.table_index.index(),
                &imported_tables,
            );
            let end = offset + initializer.elements.len();
            if end > table_size {
                return Err(InstantiationError::ElementSegmentOutOfBounds {
                    offset,
                    table_size,
                });
            }
        }
        for initializer in &info.data_initializers {
            let offset = eval_offset(&initializer.base, &imported_globals)?;
            let memory_size = memory_size_at_instantiation(
                info,
                initializer.memory_index.index(),
                &imported_memories,
            );
            let end = offset + initializer.data.len();
            if end > memory_size {
                return Err(InstantiationError::DataSegmentOutOfBounds {
                    offset,
                    memory_size,
                });
            }
        }

        // 4. Create the local storage.
        let mut globals = imported_globals;
        for ((_, init), value) in info.globals.iter().zip(local_global_values) {
            globals.push(Global::new(Some(compartment), init.desc, value)?);
        }

        let mut memories = imported_memories;
        for (_, ty) in info.memories.iter() {
            memories.push(Memory::new(compartment, *ty)?);
        }

        let mut tables = imported_tables;
        for (_, ty) in info.tables.iter() {
            tables.push(Table::new(compartment, *ty)?);
        }

        // 5. Assemble the instance; local function objects hold a back
        // reference to it, so the allocation is cyclic.
        let num_imported_functions = imported_functions.len();
        let module_inner = Arc::clone(&module.0);
        let debug_name_owned = debug_name.to_string();
        let inner = Arc::new_cyclic(|weak: &Weak<InstanceInner>| {
            let mut functions = imported_functions;
            for (local_index, sig_index) in info
                .func_assoc
                .iter()
                .skip(num_imported_functions)
                .map(|(_, sig)| sig)
                .enumerate()
            {
                let signature = Arc::clone(&info.signatures[*sig_index]);
                functions.push(Function::wasm(
                    signature,
                    Weak::clone(weak),
                    LocalFuncIndex::new(local_index),
                    format!("{}:function[{}]", debug_name_owned, local_index),
                    compartment.id(),
                ));
            }

            // 6. Build the export table and record the start function.
            let mut exports = HashMap::new();
            for (name, export_index) in &info.exports {
                let object = match export_index {
                    ExportIndex::Func(idx) => Object::Function(Arc::clone(&functions[idx.index()])),
                    ExportIndex::Memory(idx) => Object::Memory(Arc::clone(&memories[idx.index()])),
                    ExportIndex::Table(idx) => Object::Table(Arc::clone(&tables[idx.index()])),
                    ExportIndex::Global(idx) => Object::Global(Arc::clone(&globals[idx.index()])),
                };
                exports.insert(name.clone(), object);
            }

            let start_func = info
                .start_func
                .map(|func_index| Arc::clone(&functions[func_index.index()]));

            InstanceInner {
                module: module_inner,
                compartment: Arc::downgrade(compartment),
                compartment_id: compartment.id(),
                debug_name: debug_name_owned.clone(),
                functions,
                memories,
                tables,
                globals,
                exports,
                start_func,
            }
        });

        // 7. Apply the pre-checked segments.
        for initializer in &info.elem_initializers {
            let offset = eval_offset(&initializer.base, &inner.globals)
                .expect("segment offsets were evaluated during the bounds check");
            let table = &inner.tables[initializer.table_index.index()];
            for (i, func_index) in initializer.elements.iter().enumerate() {
                let function = Arc::clone(&inner.functions[func_index.index()]);
                let element = Anyfunc {
                    signature: Arc::clone(function.signature()),
                    function,
                };
                table
                    .set((offset + i) as u32, Some(element))
                    .expect("segment bounds were checked before storage was created");
            }
        }
        for initializer in &info.data_initializers {
            let offset = eval_offset(&initializer.base, &inner.globals)
                .expect("segment offsets were evaluated during the bounds check");
            let memory = &inner.memories[initializer.memory_index.index()];
            memory
                .write(offset, &initializer.data)
                .expect("segment bounds were checked before storage was created");
        }

        compartment.register_instance(Arc::clone(&inner));

        log::debug!("instantiated module as \"{}\"", debug_name);

        Ok(Instance(inner))
    }

    /// Looks up an export by name.
    pub fn get_export(&self, name: &str) -> Option<Object> {
        self.0.get_export(name)
    }

    /// The instance body.
    pub fn inner(&self) -> &Arc<InstanceInner> {
        &self.0
    }

    /// Calls an exported function by name with type-checked arguments inside
    /// `ctx`.
    pub fn call(&self, ctx: &Context, name: &str, params: &[Value]) -> CallResult<Vec<Value>> {
        let object = self
            .get_export(name)
            .ok_or_else(|| ResolveError::ExportNotFound {
                name: name.to_string(),
            })
            .map_err(CallError::Resolve)?;
        let function = object
            .as_function()
            .ok_or_else(|| ResolveError::ExportWrongType {
                name: name.to_string(),
            })
            .map_err(CallError::Resolve)?;

        if !function.signature().check_param_value_types(params) {
            return Err(CallError::Resolve(ResolveError::Signature {
                expected: Arc::clone(function.signature()),
                found: params.iter().map(|value| value.ty()).collect(),
            }));
        }

        invoke_function_checked(ctx, function, params).map_err(CallError::Runtime)
    }
}

fn eval_initializer(
    init: &Initializer,
    imported_globals: &[Arc<Global>],
) -> Result<Value, InstantiationError> {
    match init {
        Initializer::Const(value) => Ok(*value),
        Initializer::GetGlobal(index) => {
            let global = imported_globals.get(index.index()).ok_or_else(|| {
                InstantiationError::ImportMismatch {
                    index: index.index(),
                    expected: "an imported global".to_string(),
                    found: "nothing".to_string(),
                }
            })?;
            global.immutable_value().ok_or_else(|| {
                InstantiationError::GlobalInitTypeMismatch {
                    expected: global.ty().ty,
                    found: global.ty().ty,
                }
            })
        }
    }
}

fn eval_offset(
    init: &Initializer,
    globals: &[Arc<Global>],
) -> Result<usize, InstantiationError> {
    match eval_initializer(init, globals)? {
        Value::I32(offset) => Ok(offset as u32 as usize),
        other => Err(InstantiationError::GlobalInitTypeMismatch {
            expected: Type::I32,
            found: other.ty(),
        }),
    }
}

fn table_size_at_instantiation(
    info: &ModuleInfo,
    flat_index: usize,
    imported_tables: &[Arc<Table>],
) -> usize {
    if flat_index < imported_tables.len() {
        imported_tables[flat_index].size() as usize
    } else {
        let local_index = flat_index - imported_tables.len();
        info.tables
            .values()
            .get(local_index)
            .map(|ty| ty.minimum as usize)
            .unwrap_or(0)
    }
}

fn memory_size_at_instantiation(
    info: &ModuleInfo,
    flat_index: usize,
    imported_memories: &[Arc<Memory>],
) -> usize {
    if flat_index < imported_memories.len() {
        imported_memories[flat_index].size()
    } else {
        let local_index = flat_index - imported_memories.len();
        info.memories
            .values()
            .get(local_index)
            .map(|ty| Bytes::from(ty.minimum).0)
            .unwrap_or(0)
    }
}
