//! The linker module implements the import resolution protocol: a
//! [`Resolver`] is a capability the host supplies to answer
//! `(module, export, expected type)` lookups, and [`link_module`] drives it
//! over a module's import table in declaration order.

use crate::{
    error::{MissingImport, Trap},
    instance::InstanceInner,
    module::ModuleInfo,
    object::{is_a, object_type, CallingConvention, Function, Object},
    types::ExternType,
};
use hashbrown::HashMap;
use std::sync::Arc;

/// A capability for import lookup during linking.
pub trait Resolver {
    /// Resolves `(module_name, export_name)` to an object satisfying
    /// `expected`, or misses with `None`.
    fn resolve(
        &mut self,
        module_name: &str,
        export_name: &str,
        expected: &ExternType,
    ) -> Option<Object>;
}

/// A resolver that always misses. Used for bare modules.
pub struct NullResolver;

impl Resolver for NullResolver {
    fn resolve(&mut self, _: &str, _: &str, _: &ExternType) -> Option<Object> {
        None
    }
}

/// A resolver that synthesizes a stub for every function import: the stub
/// matches the exact signature requested and traps `called abort` when
/// invoked, so link failures surface at call time rather than load time.
///
/// Non-function imports still miss.
pub struct StubResolver {
    stubbed: Vec<(String, String)>,
}

impl StubResolver {
    /// Creates an empty stub resolver.
    pub fn new() -> Self {
        StubResolver {
            stubbed: Vec::new(),
        }
    }

    /// Every import a stub was synthesized for, in resolution order.
    pub fn stubbed_imports(&self) -> &[(String, String)] {
        &self.stubbed
    }
}

impl Default for StubResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver for StubResolver {
    fn resolve(
        &mut self,
        module_name: &str,
        export_name: &str,
        expected: &ExternType,
    ) -> Option<Object> {
        let signature = match expected {
            ExternType::Function(signature) => signature.clone(),
            _ => return None,
        };

        log::debug!(
            "synthesizing stub for unresolved import {}.{} : {}",
            module_name,
            export_name,
            signature
        );
        self.stubbed
            .push((module_name.to_string(), export_name.to_string()));

        let debug_name = format!("stub:{}.{}", module_name, export_name);
        Some(Object::Function(Function::host(
            signature,
            CallingConvention::Intrinsic,
            &debug_name,
            Arc::new(|_, _| Err(Trap::CalledAbort.into())),
        )))
    }
}

/// A resolver over a host-built map from module name to instance. Looks the
/// export up, checks it against the expected type, and falls back to a
/// [`StubResolver`] on miss or mismatch.
pub struct RootResolver {
    /// The name-to-instance map consulted first. Every value is an
    /// [`Object::Instance`].
    pub module_name_to_instance_map: HashMap<String, Object>,
    stub_resolver: StubResolver,
}

impl RootResolver {
    /// Creates a root resolver with an empty map.
    pub fn new() -> Self {
        RootResolver {
            module_name_to_instance_map: HashMap::new(),
            stub_resolver: StubResolver::new(),
        }
    }

    /// Maps `name` to `instance` for subsequent lookups.
    pub fn register(&mut self, name: &str, instance: Arc<InstanceInner>) {
        self.module_name_to_instance_map
            .insert(name.to_string(), Object::Instance(instance));
    }
}

impl Default for RootResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver for RootResolver {
    fn resolve(
        &mut self,
        module_name: &str,
        export_name: &str,
        expected: &ExternType,
    ) -> Option<Object> {
        if let Some(instance) = self
            .module_name_to_instance_map
            .get(module_name)
            .and_then(Object::as_instance)
        {
            if let Some(object) = instance.get_export(export_name) {
                if is_a(&object, expected) {
                    return Some(object);
                }
                log::error!(
                    "Resolved import {}.{} to a {}, but was expecting {}",
                    module_name,
                    export_name,
                    object_type(&object),
                    expected
                );
            }
        }

        self.stub_resolver
            .resolve(module_name, export_name, expected)
    }
}

/// The outcome of linking a module against a resolver.
pub struct LinkResult {
    /// The resolved import objects, in import declaration order. On a failed
    /// link this holds the successfully resolved prefix entries only.
    pub resolved_imports: Vec<Object>,
    /// Each import the resolver missed, with the type the module expected.
    pub missing_imports: Vec<MissingImport>,
}

impl LinkResult {
    /// True iff every import was resolved.
    pub fn success(&self) -> bool {
        self.missing_imports.is_empty()
    }
}

/// Iterates the module's import table in declaration order, consulting the
/// resolver for each entry.
pub fn link_module(info: &ModuleInfo, resolver: &mut dyn Resolver) -> LinkResult {
    let mut resolved_imports = Vec::with_capacity(info.import_order.len());
    let mut missing_imports = Vec::new();

    for decl in &info.import_order {
        let (name, expected) = info.import_decl(decl);
        match resolver.resolve(&name.namespace, &name.name, &expected) {
            Some(object) => resolved_imports.push(object),
            None => missing_imports.push(MissingImport {
                module_name: name.namespace.clone(),
                export_name: name.name.clone(),
                ty: expected,
            }),
        }
    }

    LinkResult {
        resolved_imports,
        missing_imports,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::FeatureSpec;
    use crate::parse::read_module;
    use crate::types::{FuncSig, Type};
    use crate::SigRegistry;

    fn info_for(wat: &str) -> ModuleInfo {
        let wasm = wabt::wat2wasm(wat).unwrap();
        read_module(&wasm, &FeatureSpec::default()).unwrap().0
    }

    #[test]
    fn null_resolver_reports_every_import_missing() {
        let info = info_for(
            r#"(module
                (import "env" "external" (func (param i32)))
                (import "env" "mem" (memory 1)))"#,
        );
        let result = link_module(&info, &mut NullResolver);
        assert!(!result.success());
        assert_eq!(result.missing_imports.len(), 2);
        assert_eq!(
            result.missing_imports[0].to_string(),
            "Missing import: module=\"env\" export=\"external\" type=\"func\""
        );
    }

    #[test]
    fn stub_resolver_synthesizes_exact_signatures() {
        let info = info_for(
            r#"(module (import "env" "external" (func (param i32 i64) (result f64))))"#,
        );
        let mut resolver = StubResolver::new();
        let result = link_module(&info, &mut resolver);
        assert!(result.success());
        assert_eq!(resolver.stubbed_imports().len(), 1);

        let func = result.resolved_imports[0].as_function().unwrap();
        let expected =
            SigRegistry.canonicalize(&FuncSig::new(vec![Type::I32, Type::I64], vec![Type::F64]));
        assert!(SigRegistry.is_same(func.signature(), &expected));
    }

    #[test]
    fn stub_resolver_does_not_stub_memories() {
        let info = info_for(r#"(module (import "env" "mem" (memory 1)))"#);
        let result = link_module(&info, &mut StubResolver::new());
        assert!(!result.success());
    }
}
