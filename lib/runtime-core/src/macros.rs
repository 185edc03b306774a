/// Builds one named export entry of a host-function namespace: the export
/// name, its signature as `(params) -> (returns)` lists of [`Type`], and the
/// body closure receiving the calling [`Context`] and the raw arguments.
///
/// [`Type`]: crate::types::Type
/// [`Context`]: crate::context::Context
#[macro_export]
macro_rules! host_function {
    ($name:expr, ($($param:expr),*) -> ($($ret:expr),*), $body:expr) => {{
        let signature = $crate::SigRegistry.canonicalize(&$crate::types::FuncSig::new(
            vec![$($param),*],
            vec![$($ret),*],
        ));
        (
            $name.to_string(),
            $crate::object::Object::Function($crate::object::Function::host(
                signature,
                $crate::object::CallingConvention::Intrinsic,
                $name,
                ::std::sync::Arc::new($body),
            )),
        )
    }};
}
