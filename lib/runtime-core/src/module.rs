//! The module module contains the compiled-module representation: the IR
//! (`ModuleInfo`) shared by all backends plus the backend's opaque runnable
//! half.

use crate::{
    backend::RunnableModule,
    structures::Map,
    types::{
        ExternType, FuncIndex, FuncSig, GlobalIndex, GlobalInit, GlobalType, ImportedFuncIndex,
        ImportedGlobalIndex, ImportedMemoryIndex, ImportedTableIndex, Initializer,
        LocalGlobalIndex, LocalMemoryIndex, LocalTableIndex, MemoryIndex, MemoryType, SigIndex,
        TableIndex, TableType,
    },
};
use hashbrown::HashMap;
use std::sync::Arc;

/// A compiled module: the IR plus the backend's executable bodies.
#[doc(hidden)]
pub struct ModuleInner {
    /// The backend half: opaque native entry points for each local function.
    pub runnable_module: Box<dyn RunnableModule>,
    /// The IR half.
    pub info: ModuleInfo,
}

/// The validated module IR consumed by the runtime: descriptors, imports in
/// declaration order, initializers, exports and signatures. Everything a
/// backend and the instantiation path need, and nothing about how bodies are
/// executed.
#[derive(Serialize, Deserialize, Clone)]
pub struct ModuleInfo {
    /// Locally defined memories.
    pub memories: Map<LocalMemoryIndex, MemoryType>,
    /// Locally defined globals with their initializers.
    pub globals: Map<LocalGlobalIndex, GlobalInit>,
    /// Locally defined tables.
    pub tables: Map<LocalTableIndex, TableType>,

    /// Imported functions: import name plus declared signature.
    pub imported_functions: Map<ImportedFuncIndex, (ImportName, SigIndex)>,
    /// Imported memories.
    pub imported_memories: Map<ImportedMemoryIndex, (ImportName, MemoryType)>,
    /// Imported tables.
    pub imported_tables: Map<ImportedTableIndex, (ImportName, TableType)>,
    /// Imported globals.
    pub imported_globals: Map<ImportedGlobalIndex, (ImportName, GlobalType)>,

    /// The order in which imports were declared, across all kinds. Resolvers
    /// are consulted in exactly this order.
    pub import_order: Vec<ImportDecl>,

    /// The export table.
    pub exports: HashMap<String, ExportIndex>,

    /// Data segments.
    pub data_initializers: Vec<DataInitializer>,
    /// Element segments.
    pub elem_initializers: Vec<TableInitializer>,

    /// The optional start function. Recorded at instantiation; invoked by the
    /// host, never automatically.
    pub start_func: Option<FuncIndex>,

    /// Signature of every function, imported and local.
    pub func_assoc: Map<FuncIndex, SigIndex>,
    /// The module's deduplicated signature table.
    pub signatures: Map<SigIndex, Arc<FuncSig>>,

    /// User sections, by name.
    pub custom_sections: HashMap<String, Vec<u8>>,
}

impl ModuleInfo {
    /// An empty module IR.
    pub fn empty() -> Self {
        ModuleInfo {
            memories: Map::new(),
            globals: Map::new(),
            tables: Map::new(),
            imported_functions: Map::new(),
            imported_memories: Map::new(),
            imported_tables: Map::new(),
            imported_globals: Map::new(),
            import_order: Vec::new(),
            exports: HashMap::new(),
            data_initializers: Vec::new(),
            elem_initializers: Vec::new(),
            start_func: None,
            func_assoc: Map::new(),
            signatures: Map::new(),
            custom_sections: HashMap::new(),
        }
    }

    /// The name and declared type of the import at a declaration-order
    /// position.
    pub fn import_decl(&self, decl: &ImportDecl) -> (&ImportName, ExternType) {
        match decl {
            ImportDecl::Function(idx) => {
                let (name, sig_index) = &self.imported_functions[*idx];
                (name, ExternType::Function(self.signatures[*sig_index].clone()))
            }
            ImportDecl::Table(idx) => {
                let (name, ty) = &self.imported_tables[*idx];
                (name, ExternType::Table(*ty))
            }
            ImportDecl::Memory(idx) => {
                let (name, ty) = &self.imported_memories[*idx];
                (name, ExternType::Memory(*ty))
            }
            ImportDecl::Global(idx) => {
                let (name, ty) = &self.imported_globals[*idx];
                (name, ExternType::Global(*ty))
            }
        }
    }

    /// Does any function import come from the given namespace?
    pub fn imports_function_from(&self, namespace: &str) -> bool {
        self.imported_functions
            .iter()
            .any(|(_, (name, _))| name.namespace == namespace)
    }
}

/// A compiled WebAssembly module, shareable between instantiations.
#[derive(Clone)]
pub struct Module(#[doc(hidden)] pub Arc<ModuleInner>);

impl Module {
    pub(crate) fn new(inner: Arc<ModuleInner>) -> Self {
        Module(inner)
    }

    /// The module IR.
    pub fn info(&self) -> &ModuleInfo {
        &self.0.info
    }

    /// The inner shared module.
    pub fn inner(&self) -> &Arc<ModuleInner> {
        &self.0
    }
}

/// A fully qualified import name.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ImportName {
    /// The namespace (module name) of the import.
    pub namespace: String,
    /// The field (export name) of the import.
    pub name: String,
}

impl From<(String, String)> for ImportName {
    fn from(n: (String, String)) -> Self {
        ImportName {
            namespace: n.0,
            name: n.1,
        }
    }
}

/// One entry of the declaration-order import table.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportDecl {
    /// A function import.
    Function(ImportedFuncIndex),
    /// A table import.
    Table(ImportedTableIndex),
    /// A memory import.
    Memory(ImportedMemoryIndex),
    /// A global import.
    Global(ImportedGlobalIndex),
}

/// The index an export refers to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportIndex {
    /// An exported function.
    Func(FuncIndex),
    /// An exported memory.
    Memory(MemoryIndex),
    /// An exported global.
    Global(GlobalIndex),
    /// An exported table.
    Table(TableIndex),
}

/// A data initializer for linear memory.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DataInitializer {
    /// The index of the memory to initialize.
    pub memory_index: MemoryIndex,
    /// Either a constant offset or a `get_global`.
    pub base: Initializer,
    /// The initialization data.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// A WebAssembly table initializer.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TableInitializer {
    /// The index of a table to initialize.
    pub table_index: TableIndex,
    /// Either a constant offset or a `get_global`.
    pub base: Initializer,
    /// The function indices to write into the table elements.
    pub elements: Vec<FuncIndex>,
}
