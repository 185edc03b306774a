//! The signature registry canonicalizes function signatures process-wide so
//! that signature identity can be checked by pointer comparison. Indirect
//! calls compare the canonical `Arc<FuncSig>` of the table element against
//! the canonical `Arc<FuncSig>` the call site expects.

use crate::types::FuncSig;
use hashbrown::HashMap;
use std::sync::{Arc, RwLock};

lazy_static! {
    static ref GLOBAL_SIG_REGISTRY: RwLock<HashMap<FuncSig, Arc<FuncSig>>> =
        RwLock::new(HashMap::new());
}

/// Process-wide signature registry.
///
/// The unit struct is the handle; all state lives in a process-wide table.
pub struct SigRegistry;

impl SigRegistry {
    /// Returns the canonical shared signature equal to `sig`, interning it on
    /// first sight.
    pub fn canonicalize(&self, sig: &FuncSig) -> Arc<FuncSig> {
        {
            let registry = GLOBAL_SIG_REGISTRY
                .read()
                .expect("signature registry poisoned");
            if let Some(canonical) = registry.get(sig) {
                return Arc::clone(canonical);
            }
        }
        let mut registry = GLOBAL_SIG_REGISTRY
            .write()
            .expect("signature registry poisoned");
        Arc::clone(
            registry
                .entry(sig.clone())
                .or_insert_with(|| Arc::new(sig.clone())),
        )
    }

    /// True iff both signatures are the same canonical entry.
    pub fn is_same(&self, left: &Arc<FuncSig>, right: &Arc<FuncSig>) -> bool {
        Arc::ptr_eq(left, right)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Type;

    #[test]
    fn equal_signatures_canonicalize_to_the_same_arc() {
        let a = SigRegistry.canonicalize(&FuncSig::new(vec![Type::I32], vec![Type::I32]));
        let b = SigRegistry.canonicalize(&FuncSig::new(vec![Type::I32], vec![Type::I32]));
        let c = SigRegistry.canonicalize(&FuncSig::new(vec![Type::I64], vec![Type::I32]));
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
