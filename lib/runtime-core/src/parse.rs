//! The parse module is the binary front-end: it validates WebAssembly bytes
//! against a feature spec and reads them into the runtime IR
//! ([`ModuleInfo`]), handing the undecoded function bodies to the backend.

use crate::{
    error::{CompileError, CompileResult},
    features::FeatureSpec,
    module::{DataInitializer, ExportIndex, ImportDecl, ImportName, ModuleInfo, TableInitializer},
    sig_registry::SigRegistry,
    structures::TypedIndex,
    types::{
        ElementType, FuncIndex, FuncSig, GlobalInit, GlobalType, ImportedGlobalIndex, Initializer,
        MemoryType, SigIndex, TableType, Type, Value,
    },
    units::Pages,
};
use wasmparser::{
    DataKind, ElementItem, ElementKind, ExternalKind, FunctionBody, Operator, Parser, Payload,
    TypeRef, ValType, Validator, WasmFeatures,
};

/// The four-byte magic number every binary module starts with.
pub const WASM_MAGIC_NUMBER: [u8; 4] = [0x00, b'a', b's', b'm'];

/// Does the byte buffer look like a binary module rather than text?
pub fn is_wasm_binary(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && bytes[..4] == WASM_MAGIC_NUMBER
}

fn wasm_features(features: &FeatureSpec) -> WasmFeatures {
    WasmFeatures {
        mutable_global: true,
        simd: features.simd,
        threads: features.threads,
        bulk_memory: features.bulk_memory,
        multi_value: features.multi_value,
        reference_types: features.reference_types,
        sign_extension: features.sign_extension,
        saturating_float_to_int: features.saturating_float_to_int,
        tail_call: features.tail_call,
        exceptions: features.exceptions,
        ..WasmFeatures::default()
    }
}

/// Perform validation as defined by the WebAssembly specification, with an
/// error message on failure.
pub fn validate_and_report_errors(
    wasm: &[u8],
    features: &FeatureSpec,
) -> std::result::Result<(), String> {
    let mut validator = Validator::new_with_features(wasm_features(features));
    validator
        .validate_all(wasm)
        .map(|_| ())
        .map_err(|e| format!("{}", e))
}

fn convert_type(ty: ValType) -> CompileResult<Type> {
    Ok(match ty {
        ValType::I32 => Type::I32,
        ValType::I64 => Type::I64,
        ValType::F32 => Type::F32,
        ValType::F64 => Type::F64,
        ValType::V128 => Type::V128,
        ValType::FuncRef => Type::FuncRef,
        ValType::ExternRef => Type::AnyRef,
    })
}

fn convert_table_type(ty: wasmparser::TableType) -> CompileResult<TableType> {
    match ty.element_type {
        ValType::FuncRef => Ok(TableType {
            element: ElementType::Anyfunc,
            minimum: ty.initial,
            maximum: ty.maximum,
        }),
        other => Err(CompileError::ValidationError {
            msg: format!("unsupported table element type {:?}", other),
        }),
    }
}

fn convert_memory_type(ty: wasmparser::MemoryType) -> CompileResult<MemoryType> {
    if ty.memory64 {
        return Err(CompileError::UnsupportedFeature {
            feature: "memory64".to_string(),
        });
    }
    if ty.shared {
        return Err(CompileError::UnsupportedFeature {
            feature: "threads".to_string(),
        });
    }
    Ok(MemoryType {
        minimum: Pages(ty.initial as u32),
        maximum: ty.maximum.map(|max| Pages(max as u32)),
    })
}

fn convert_global_type(ty: wasmparser::GlobalType) -> CompileResult<GlobalType> {
    Ok(GlobalType {
        mutable: ty.mutable,
        ty: convert_type(ty.content_type)?,
    })
}

fn read_initializer(expr: &wasmparser::ConstExpr, info: &ModuleInfo) -> CompileResult<Initializer> {
    let mut reader = expr.get_operators_reader();
    let op = reader.read().map_err(|e| CompileError::ValidationError {
        msg: format!("{}", e),
    })?;
    let initializer = match op {
        Operator::I32Const { value } => Initializer::Const(Value::I32(value)),
        Operator::I64Const { value } => Initializer::Const(Value::I64(value)),
        Operator::F32Const { value } => {
            Initializer::Const(Value::F32(f32::from_bits(value.bits())))
        }
        Operator::F64Const { value } => {
            Initializer::Const(Value::F64(f64::from_bits(value.bits())))
        }
        Operator::V128Const { value } => {
            Initializer::Const(Value::V128(u128::from_le_bytes(*value.bytes())))
        }
        Operator::GlobalGet { global_index } => {
            if (global_index as usize) >= info.imported_globals.len() {
                return Err(CompileError::ValidationError {
                    msg: format!(
                        "initializer references non-imported global {}",
                        global_index
                    ),
                });
            }
            Initializer::GetGlobal(ImportedGlobalIndex::new(global_index as usize))
        }
        other => {
            return Err(CompileError::ValidationError {
                msg: format!("unsupported initializer operator {:?}", other),
            });
        }
    };
    Ok(initializer)
}

/// Validates `wasm` and reads it into [`ModuleInfo`], returning the IR and
/// the undecoded local function bodies in definition order.
pub fn read_module<'a>(
    wasm: &'a [u8],
    features: &FeatureSpec,
) -> CompileResult<(ModuleInfo, Vec<FunctionBody<'a>>)> {
    validate_and_report_errors(wasm, features)
        .map_err(|msg| CompileError::ValidationError { msg })?;

    let mut info = ModuleInfo::empty();
    let mut signatures: Vec<SigIndex> = Vec::new();
    let mut bodies: Vec<FunctionBody<'a>> = Vec::new();

    for payload in Parser::new(0).parse_all(wasm) {
        let payload = payload.map_err(|e| CompileError::ValidationError {
            msg: format!("{}", e),
        })?;
        match payload {
            Payload::TypeSection(reader) => {
                for ty in reader {
                    let ty = ty.map_err(|e| CompileError::ValidationError {
                        msg: format!("{}", e),
                    })?;
                    let func_type = match ty {
                        wasmparser::Type::Func(func_type) => func_type,
                    };
                    let params = func_type
                        .params()
                        .iter()
                        .map(|&t| convert_type(t))
                        .collect::<CompileResult<Vec<Type>>>()?;
                    let returns = func_type
                        .results()
                        .iter()
                        .map(|&t| convert_type(t))
                        .collect::<CompileResult<Vec<Type>>>()?;
                    let sig = SigRegistry.canonicalize(&FuncSig::new(params, returns));
                    info.signatures.push(sig);
                }
            }
            Payload::ImportSection(reader) => {
                for import in reader {
                    let import = import.map_err(|e| CompileError::ValidationError {
                        msg: format!("{}", e),
                    })?;
                    let name = ImportName {
                        namespace: import.module.to_string(),
                        name: import.name.to_string(),
                    };
                    match import.ty {
                        TypeRef::Func(sig) => {
                            let sig_index = SigIndex::new(sig as usize);
                            let idx = info.imported_functions.push((name, sig_index));
                            info.func_assoc.push(sig_index);
                            info.import_order.push(ImportDecl::Function(idx));
                        }
                        TypeRef::Table(ty) => {
                            let idx = info.imported_tables.push((name, convert_table_type(ty)?));
                            info.import_order.push(ImportDecl::Table(idx));
                        }
                        TypeRef::Memory(ty) => {
                            let idx = info
                                .imported_memories
                                .push((name, convert_memory_type(ty)?));
                            info.import_order.push(ImportDecl::Memory(idx));
                        }
                        TypeRef::Global(ty) => {
                            let idx = info
                                .imported_globals
                                .push((name, convert_global_type(ty)?));
                            info.import_order.push(ImportDecl::Global(idx));
                        }
                        TypeRef::Tag(_) => {
                            return Err(CompileError::UnsupportedFeature {
                                feature: "exceptions".to_string(),
                            });
                        }
                    }
                }
            }
            Payload::FunctionSection(reader) => {
                for sig in reader {
                    let sig = sig.map_err(|e| CompileError::ValidationError {
                        msg: format!("{}", e),
                    })?;
                    let sig_index = SigIndex::new(sig as usize);
                    signatures.push(sig_index);
                    info.func_assoc.push(sig_index);
                }
            }
            Payload::TableSection(reader) => {
                for table in reader {
                    let table = table.map_err(|e| CompileError::ValidationError {
                        msg: format!("{}", e),
                    })?;
                    info.tables.push(convert_table_type(table)?);
                }
            }
            Payload::MemorySection(reader) => {
                for memory in reader {
                    let memory = memory.map_err(|e| CompileError::ValidationError {
                        msg: format!("{}", e),
                    })?;
                    info.memories.push(convert_memory_type(memory)?);
                }
            }
            Payload::GlobalSection(reader) => {
                for global in reader {
                    let global = global.map_err(|e| CompileError::ValidationError {
                        msg: format!("{}", e),
                    })?;
                    let desc = convert_global_type(global.ty)?;
                    let init = read_initializer(&global.init_expr, &info)?;
                    info.globals.push(GlobalInit { desc, init });
                }
            }
            Payload::ExportSection(reader) => {
                for export in reader {
                    let export = export.map_err(|e| CompileError::ValidationError {
                        msg: format!("{}", e),
                    })?;
                    let index = export.index as usize;
                    let export_index = match export.kind {
                        ExternalKind::Func => ExportIndex::Func(TypedIndex::new(index)),
                        ExternalKind::Table => ExportIndex::Table(TypedIndex::new(index)),
                        ExternalKind::Memory => ExportIndex::Memory(TypedIndex::new(index)),
                        ExternalKind::Global => ExportIndex::Global(TypedIndex::new(index)),
                        ExternalKind::Tag => {
                            return Err(CompileError::UnsupportedFeature {
                                feature: "exceptions".to_string(),
                            });
                        }
                    };
                    info.exports.insert(export.name.to_string(), export_index);
                }
            }
            Payload::StartSection { func, .. } => {
                info.start_func = Some(FuncIndex::new(func as usize));
            }
            Payload::ElementSection(reader) => {
                for element in reader {
                    let element = element.map_err(|e| CompileError::ValidationError {
                        msg: format!("{}", e),
                    })?;
                    let (table_index, offset_expr) = match element.kind {
                        ElementKind::Active {
                            table_index,
                            offset_expr,
                        } => (table_index, offset_expr),
                        _ => {
                            return Err(CompileError::UnsupportedFeature {
                                feature: "bulk-memory".to_string(),
                            });
                        }
                    };
                    let base = read_initializer(&offset_expr, &info)?;
                    let mut elements = Vec::new();
                    let items_reader =
                        element
                            .items
                            .get_items_reader()
                            .map_err(|e| CompileError::ValidationError {
                                msg: format!("{}", e),
                            })?;
                    for item in items_reader {
                        let item = item.map_err(|e| CompileError::ValidationError {
                            msg: format!("{}", e),
                        })?;
                        match item {
                            ElementItem::Func(func) => {
                                elements.push(FuncIndex::new(func as usize));
                            }
                            ElementItem::Expr(_) => {
                                return Err(CompileError::UnsupportedFeature {
                                    feature: "reference-types".to_string(),
                                });
                            }
                        }
                    }
                    info.elem_initializers.push(TableInitializer {
                        table_index: TypedIndex::new(table_index as usize),
                        base,
                        elements,
                    });
                }
            }
            Payload::DataSection(reader) => {
                for data in reader {
                    let data = data.map_err(|e| CompileError::ValidationError {
                        msg: format!("{}", e),
                    })?;
                    match data.kind {
                        DataKind::Active {
                            memory_index,
                            offset_expr,
                        } => {
                            let base = read_initializer(&offset_expr, &info)?;
                            info.data_initializers.push(DataInitializer {
                                memory_index: TypedIndex::new(memory_index as usize),
                                base,
                                data: data.data.to_vec(),
                            });
                        }
                        DataKind::Passive => {
                            return Err(CompileError::UnsupportedFeature {
                                feature: "bulk-memory".to_string(),
                            });
                        }
                    }
                }
            }
            Payload::CodeSectionEntry(body) => {
                bodies.push(body);
            }
            Payload::CustomSection(reader) => {
                info.custom_sections
                    .insert(reader.name().to_string(), reader.data().to_vec());
            }
            _ => {}
        }
    }

    debug_assert_eq!(signatures.len(), bodies.len());

    Ok((info, bodies))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(wat: &str) -> (ModuleInfo, usize) {
        let wasm = wabt::wat2wasm(wat).unwrap();
        let (info, bodies) = read_module(&wasm, &FeatureSpec::default()).unwrap();
        (info, bodies.len())
    }

    #[test]
    fn reads_imports_in_declaration_order() {
        let (info, _) = parse(
            r#"(module
                (import "env" "f" (func))
                (import "env" "mem" (memory 1))
                (import "env" "g" (global i32)))"#,
        );
        assert_eq!(info.import_order.len(), 3);
        match info.import_order[0] {
            ImportDecl::Function(_) => {}
            _ => panic!("expected the function import first"),
        }
        match info.import_order[1] {
            ImportDecl::Memory(_) => {}
            _ => panic!("expected the memory import second"),
        }
    }

    #[test]
    fn reads_exports_and_bodies() {
        let (info, num_bodies) = parse(
            r#"(module
                (func (export "answer") (result i32) i32.const 42)
                (memory (export "memory") 1))"#,
        );
        assert_eq!(num_bodies, 1);
        assert!(info.exports.contains_key("answer"));
        assert!(info.exports.contains_key("memory"));
    }

    #[test]
    fn rejects_malformed_bytes() {
        assert!(read_module(b"\0asm junk", &FeatureSpec::default()).is_err());
    }
}
