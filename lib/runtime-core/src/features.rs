//! The feature spec controls which WebAssembly proposals the decoder and the
//! backends accept for a given module.

/// The set of WebAssembly features enabled for a module.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeatureSpec {
    /// 128-bit SIMD values and operations.
    pub simd: bool,
    /// Shared memories and atomic operations.
    pub threads: bool,
    /// Bulk memory operations (`memory.copy` and friends).
    pub bulk_memory: bool,
    /// Multiple results from functions and blocks.
    pub multi_value: bool,
    /// First-class reference types.
    pub reference_types: bool,
    /// Sign-extension operators (`i32.extend8_s` and friends).
    pub sign_extension: bool,
    /// Saturating float-to-int conversion operators.
    pub saturating_float_to_int: bool,
    /// Tail calls.
    pub tail_call: bool,
    /// Tagged exceptions.
    pub exceptions: bool,
}

impl Default for FeatureSpec {
    /// The MVP plus the two universally shipped extensions.
    fn default() -> Self {
        FeatureSpec {
            simd: false,
            threads: false,
            bulk_memory: false,
            multi_value: false,
            reference_types: false,
            sign_extension: true,
            saturating_float_to_int: true,
            tail_call: false,
            exceptions: false,
        }
    }
}

/// All feature names accepted by [`parse_and_set_feature`], with their
/// descriptions, in help-text order.
pub const FEATURES: &[(&str, &str)] = &[
    ("simd", "128-bit SIMD values and operations"),
    ("threads", "shared memories and atomic operations"),
    ("bulk-memory", "bulk memory operations"),
    ("multi-value", "multiple results from functions and blocks"),
    ("reference-types", "first-class reference types"),
    ("sign-extension", "sign-extension operators"),
    (
        "nontrapping-float-to-int",
        "saturating float-to-int conversion operators",
    ),
    ("tail-call", "tail calls"),
    ("exceptions", "tagged exceptions"),
];

/// Toggle the named feature in `spec`. Returns false for an unknown name.
pub fn parse_and_set_feature(name: &str, spec: &mut FeatureSpec, enable: bool) -> bool {
    let flag = match name {
        "simd" => &mut spec.simd,
        "threads" => &mut spec.threads,
        "bulk-memory" => &mut spec.bulk_memory,
        "multi-value" => &mut spec.multi_value,
        "reference-types" => &mut spec.reference_types,
        "sign-extension" => &mut spec.sign_extension,
        "nontrapping-float-to-int" => &mut spec.saturating_float_to_int,
        "tail-call" => &mut spec.tail_call,
        "exceptions" => &mut spec.exceptions,
        _ => return false,
    };
    *flag = enable;
    true
}

/// Help text listing every feature name, one per line.
pub fn feature_list_help_text() -> String {
    let mut out = String::new();
    for (name, description) in FEATURES {
        out.push_str(&format!("  {:<26}{}\n", name, description));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_listed_feature_parses() {
        let mut spec = FeatureSpec::default();
        for (name, _) in FEATURES {
            assert!(parse_and_set_feature(name, &mut spec, true), "{}", name);
        }
        assert!(spec.simd && spec.threads && spec.exceptions);
        assert!(!parse_and_set_feature("no-such-feature", &mut spec, true));
    }
}
