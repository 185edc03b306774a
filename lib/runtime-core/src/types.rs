//! The runtime types module represents the types used within the wasm runtime
//! and helper functions to convert to other representations.

use crate::{module::ModuleInfo, structures::TypedIndex, units::Pages};
use std::{convert::TryFrom, sync::Arc};

/// Represents a WebAssembly value type.
///
/// `None`, `Any` and `NullRef` are sentinels used by type checks; they never
/// tag a stored value.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Type {
    /// The `i32` type.
    I32,
    /// The `i64` type.
    I64,
    /// The `f32` type.
    F32,
    /// The `f64` type.
    F64,
    /// The `v128` type.
    V128,
    /// A function reference.
    FuncRef,
    /// An opaque host reference.
    AnyRef,
    /// The empty sentinel type.
    None,
    /// The universal sentinel type.
    Any,
    /// The type of a null reference constant.
    NullRef,
}

impl Type {
    /// The number of bytes a value of this type occupies in storage.
    pub fn byte_width(self) -> usize {
        match self {
            Type::I32 | Type::F32 => 4,
            Type::I64 | Type::F64 => 8,
            Type::V128 => 16,
            Type::FuncRef | Type::AnyRef | Type::NullRef => std::mem::size_of::<usize>(),
            Type::None | Type::Any => 0,
        }
    }
}

impl std::fmt::Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Type::I32 => "i32",
            Type::I64 => "i64",
            Type::F32 => "f32",
            Type::F64 => "f64",
            Type::V128 => "v128",
            Type::FuncRef => "funcref",
            Type::AnyRef => "anyref",
            Type::None => "none",
            Type::Any => "any",
            Type::NullRef => "nullref",
        };
        write!(f, "{}", name)
    }
}

/// Represents a WebAssembly value.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// The `i32` type.
    I32(i32),
    /// The `i64` type.
    I64(i64),
    /// The `f32` type.
    F32(f32),
    /// The `f64` type.
    F64(f64),
    /// The `v128` type.
    V128(u128),
}

impl Value {
    /// The `Type` of this `Value`.
    pub fn ty(&self) -> Type {
        match self {
            Value::I32(_) => Type::I32,
            Value::I64(_) => Type::I64,
            Value::F32(_) => Type::F32,
            Value::F64(_) => Type::F64,
            Value::V128(_) => Type::V128,
        }
    }

    /// Strip the tag, keeping only the raw storage bits.
    pub fn to_raw(&self) -> RawValue {
        match *self {
            Value::I32(x) => RawValue::from_i32(x),
            Value::I64(x) => RawValue::from_i64(x),
            Value::F32(x) => RawValue::from_f32(x),
            Value::F64(x) => RawValue::from_f64(x),
            Value::V128(x) => RawValue::from_v128(x),
        }
    }

    /// Reattach a tag to raw storage bits.
    pub fn from_raw(ty: Type, raw: RawValue) -> Value {
        match ty {
            Type::I32 => Value::I32(raw.as_i32()),
            Type::I64 => Value::I64(raw.as_i64()),
            Type::F32 => Value::F32(raw.as_f32()),
            Type::F64 => Value::F64(raw.as_f64()),
            Type::V128 => Value::V128(raw.as_v128()),
            _ => panic!("no value representation for sentinel type {}", ty),
        }
    }
}

macro_rules! value_conversions {
    ($native_type:ty, $value_variant:ident) => {
        impl From<$native_type> for Value {
            fn from(n: $native_type) -> Self {
                Self::$value_variant(n)
            }
        }

        impl TryFrom<&Value> for $native_type {
            type Error = &'static str;

            fn try_from(value: &Value) -> Result<Self, Self::Error> {
                match value {
                    Value::$value_variant(value) => Ok(*value),
                    _ => Err("Invalid cast."),
                }
            }
        }
    };
}

value_conversions!(i32, I32);
value_conversions!(i64, I64);
value_conversions!(f32, F32);
value_conversions!(f64, F64);
value_conversions!(u128, V128);

/// An untagged value: sixteen bytes of storage, wide and aligned enough for
/// any storable [`Type`] including `v128`.
///
/// Conversions in and out are explicit and bit-exact; floats round-trip
/// through their IEEE-754 bit patterns so NaN payloads are preserved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct RawValue {
    bits: u128,
}

impl RawValue {
    /// The all-zero raw value.
    pub fn zero() -> Self {
        RawValue { bits: 0 }
    }

    /// Wrap an `i32`.
    pub fn from_i32(x: i32) -> Self {
        RawValue {
            bits: x as u32 as u128,
        }
    }

    /// Wrap an `i64`.
    pub fn from_i64(x: i64) -> Self {
        RawValue {
            bits: x as u64 as u128,
        }
    }

    /// Wrap an `f32` by bit pattern.
    pub fn from_f32(x: f32) -> Self {
        RawValue {
            bits: x.to_bits() as u128,
        }
    }

    /// Wrap an `f64` by bit pattern.
    pub fn from_f64(x: f64) -> Self {
        RawValue {
            bits: x.to_bits() as u128,
        }
    }

    /// Wrap a `v128`.
    pub fn from_v128(x: u128) -> Self {
        RawValue { bits: x }
    }

    /// Read back as `i32`.
    pub fn as_i32(self) -> i32 {
        self.bits as u32 as i32
    }

    /// Read back as `u32`.
    pub fn as_u32(self) -> u32 {
        self.bits as u32
    }

    /// Read back as `i64`.
    pub fn as_i64(self) -> i64 {
        self.bits as u64 as i64
    }

    /// Read back as `u64`.
    pub fn as_u64(self) -> u64 {
        self.bits as u64
    }

    /// Read back as `f32` from the stored bit pattern.
    pub fn as_f32(self) -> f32 {
        f32::from_bits(self.bits as u32)
    }

    /// Read back as `f64` from the stored bit pattern.
    pub fn as_f64(self) -> f64 {
        f64::from_bits(self.bits as u64)
    }

    /// Read back as `v128`.
    pub fn as_v128(self) -> u128 {
        self.bits
    }

    /// The full little-endian byte image of this value; callers slice it to
    /// the width of the type they are storing.
    pub fn to_le_bytes(&self) -> [u8; 16] {
        self.bits.to_le_bytes()
    }

    /// Rebuild a raw value from up to sixteen little-endian bytes.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 16];
        buf[..bytes.len()].copy_from_slice(bytes);
        RawValue {
            bits: u128::from_le_bytes(buf),
        }
    }
}

/// Kinds of element types.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    /// Any wasm function.
    Anyfunc,
}

/// Describes the properties of a table including the element type and the
/// minimum and optional maximum number of elements.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableType {
    /// Type of data stored in this table.
    pub element: ElementType,
    /// The minimum number of elements that must be stored in this table.
    pub minimum: u32,
    /// The maximum number of elements in this table.
    pub maximum: Option<u32>,
}

impl TableType {
    /// Width-subtyping: does a table of type `self` satisfy a request for
    /// `requested`? The minimum must cover the requested minimum and the
    /// maximum (infinite when absent) must not exceed the requested one.
    pub fn is_subtype_of(&self, requested: &TableType) -> bool {
        let requested_max = requested.maximum.unwrap_or(u32::max_value());
        let self_max = self.maximum.unwrap_or(u32::max_value());
        self.element == requested.element
            && self.minimum >= requested.minimum
            && self_max <= requested_max
    }
}

impl std::fmt::Display for TableType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.maximum {
            Some(max) => write!(f, "anyfunc[{}..{}]", self.minimum, max),
            None => write!(f, "anyfunc[{}..]", self.minimum),
        }
    }
}

/// Describes the mutability and value type of a global.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalType {
    /// Mutable flag.
    pub mutable: bool,
    /// Wasm type.
    pub ty: Type,
}

impl std::fmt::Display for GlobalType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.mutable {
            write!(f, "global mut {}", self.ty)
        } else {
            write!(f, "global {}", self.ty)
        }
    }
}

/// A global declaration paired with its initializer.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct GlobalInit {
    /// Global descriptor.
    pub desc: GlobalType,
    /// Global initializer.
    pub init: Initializer,
}

/// A const value initializer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum Initializer {
    /// Corresponds to a `const.*` instruction.
    Const(Value),
    /// Corresponds to a `get_global` instruction referencing an imported
    /// global.
    GetGlobal(ImportedGlobalIndex),
}

/// A wasm linear memory descriptor.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryType {
    /// The minimum number of allowed pages.
    pub minimum: Pages,
    /// The maximum number of allowed pages.
    pub maximum: Option<Pages>,
}

impl MemoryType {
    /// Width-subtyping for memories, as for [`TableType::is_subtype_of`].
    pub fn is_subtype_of(&self, requested: &MemoryType) -> bool {
        let requested_max = requested.maximum.unwrap_or(Pages::max());
        let self_max = self.maximum.unwrap_or(Pages::max());
        self.minimum >= requested.minimum && self_max <= requested_max
    }
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.maximum {
            Some(max) => write!(f, "memory[{}..{}]", self.minimum.0, max.0),
            None => write!(f, "memory[{}..]", self.minimum.0),
        }
    }
}

/// The parameters carried by a tagged exception.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExceptionType {
    /// Parameter types.
    pub params: Vec<Type>,
}

/// The signature of a function that is either implemented in a wasm module or
/// exposed to wasm by the host.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct FuncSig {
    params: Vec<Type>,
    returns: Vec<Type>,
}

impl FuncSig {
    /// Creates a new function signature with the given parameter and return
    /// types.
    pub fn new<Params, Returns>(params: Params, returns: Returns) -> Self
    where
        Params: Into<Vec<Type>>,
        Returns: Into<Vec<Type>>,
    {
        Self {
            params: params.into(),
            returns: returns.into(),
        }
    }

    /// Parameter types.
    pub fn params(&self) -> &[Type] {
        &self.params
    }

    /// Return types.
    pub fn returns(&self) -> &[Type] {
        &self.returns
    }

    /// Returns true if the given values match the parameter types of this
    /// signature exactly.
    pub fn check_param_value_types(&self, params: &[Value]) -> bool {
        self.params.len() == params.len()
            && self
                .params
                .iter()
                .zip(params.iter().map(|val| val.ty()))
                .all(|(t0, ref t1)| t0 == t1)
    }
}

impl std::fmt::Display for FuncSig {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let params = self
            .params
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let returns = self
            .returns
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "[{}] -> [{}]", params, returns)
    }
}

/// The type of an importable or exportable entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternType {
    /// A function signature.
    Function(Arc<FuncSig>),
    /// A global descriptor.
    Global(GlobalType),
    /// A table descriptor.
    Table(TableType),
    /// A linear memory descriptor.
    Memory(MemoryType),
    /// A tagged-exception descriptor.
    ExceptionType(ExceptionType),
    /// A module instance. Instances carry no further descriptor; the kind
    /// itself is the type.
    Instance,
}

impl ExternType {
    /// The short kind token used by link diagnostics.
    pub fn kind_str(&self) -> &'static str {
        match self {
            ExternType::Function(_) => "func",
            ExternType::Global(_) => "global",
            ExternType::Table(_) => "table",
            ExternType::Memory(_) => "memory",
            ExternType::ExceptionType(_) => "exception_type",
            ExternType::Instance => "instance",
        }
    }
}

impl std::fmt::Display for ExternType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.kind_str())
    }
}

/// Trait that represents Local or Import.
pub trait LocalImport {
    /// Local type.
    type Local: TypedIndex;
    /// Import type.
    type Import: TypedIndex;
}

#[rustfmt::skip]
macro_rules! define_map_index {
    ($ty:ident) => {
        /// Typed Index
        #[derive(Serialize, Deserialize)]
        #[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $ty (u32);
        impl TypedIndex for $ty {
            #[doc(hidden)]
            fn new(index: usize) -> Self {
                $ty (index as _)
            }

            #[doc(hidden)]
            fn index(&self) -> usize {
                self.0 as usize
            }
        }
    };
    ($($normal_ty:ident,)* | local: $($local_ty:ident,)* | imported: $($imported_ty:ident,)*) => {
        $(
            define_map_index!($normal_ty);
            define_map_index!($local_ty);
            define_map_index!($imported_ty);

            impl LocalImport for $normal_ty {
                type Local = $local_ty;
                type Import = $imported_ty;
            }
        )*
    };
}

#[rustfmt::skip]
define_map_index![
    FuncIndex, MemoryIndex, TableIndex, GlobalIndex,
    | local: LocalFuncIndex, LocalMemoryIndex, LocalTableIndex, LocalGlobalIndex,
    | imported: ImportedFuncIndex, ImportedMemoryIndex, ImportedTableIndex, ImportedGlobalIndex,
];

#[rustfmt::skip]
macro_rules! define_local_or_import {
    ($ty:ident, $local_ty:ident, $imported_ty:ident, $imports:ident) => {
        impl $ty {
            /// Converts self into `LocalOrImport`.
            pub fn local_or_import(self, info: &ModuleInfo) -> LocalOrImport<$ty> {
                if self.index() < info.$imports.len() {
                    LocalOrImport::Import(<Self as LocalImport>::Import::new(self.index()))
                } else {
                    LocalOrImport::Local(<Self as LocalImport>::Local::new(self.index() - info.$imports.len()))
                }
            }
        }

        impl $local_ty {
            /// Convert up.
            pub fn convert_up(self, info: &ModuleInfo) -> $ty {
                $ty ((self.index() + info.$imports.len()) as u32)
            }
        }

        impl $imported_ty {
            /// Convert up.
            pub fn convert_up(self, _info: &ModuleInfo) -> $ty {
                $ty (self.index() as u32)
            }
        }
    };
    ($(($ty:ident | ($local_ty:ident, $imported_ty:ident): $imports:ident),)*) => {
        $(
            define_local_or_import!($ty, $local_ty, $imported_ty, $imports);
        )*
    };
}

#[rustfmt::skip]
define_local_or_import![
    (FuncIndex | (LocalFuncIndex, ImportedFuncIndex): imported_functions),
    (MemoryIndex | (LocalMemoryIndex, ImportedMemoryIndex): imported_memories),
    (TableIndex | (LocalTableIndex, ImportedTableIndex): imported_tables),
    (GlobalIndex | (LocalGlobalIndex, ImportedGlobalIndex): imported_globals),
];

/// Index for signature.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct SigIndex(u32);
impl TypedIndex for SigIndex {
    #[doc(hidden)]
    fn new(index: usize) -> Self {
        SigIndex(index as _)
    }

    #[doc(hidden)]
    fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Kind of local or import type.
pub enum LocalOrImport<T>
where
    T: LocalImport,
{
    /// Local.
    Local(T::Local),
    /// Import.
    Import(T::Import),
}

impl<T> LocalOrImport<T>
where
    T: LocalImport,
{
    /// Returns `Some` if self is local, `None` if self is an import.
    pub fn local(self) -> Option<T::Local> {
        match self {
            LocalOrImport::Local(local) => Some(local),
            LocalOrImport::Import(_) => None,
        }
    }

    /// Returns `Some` if self is an import, `None` if self is local.
    pub fn import(self) -> Option<T::Import> {
        match self {
            LocalOrImport::Import(import) => Some(import),
            LocalOrImport::Local(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units::Pages;

    #[test]
    fn raw_value_round_trips_bit_exactly() {
        assert_eq!(RawValue::from_i32(-42).as_i32(), -42);
        assert_eq!(RawValue::from_i64(i64::min_value()).as_i64(), i64::min_value());
        assert_eq!(RawValue::from_f32(-16.5).as_f32(), -16.5);
        assert_eq!(RawValue::from_f64(f64::MAX).as_f64(), f64::MAX);
        assert_eq!(
            RawValue::from_v128(0x0123_4567_89ab_cdef_0011_2233_4455_6677).as_v128(),
            0x0123_4567_89ab_cdef_0011_2233_4455_6677
        );

        // NaN payloads survive the trip through raw storage.
        let nan = f32::from_bits(0x7fc0_1234);
        assert_eq!(RawValue::from_f32(nan).as_f32().to_bits(), 0x7fc0_1234);
    }

    #[test]
    fn table_subtyping_is_width_subtyping() {
        let t = |min, max| TableType {
            element: ElementType::Anyfunc,
            minimum: min,
            maximum: max,
        };
        assert!(t(10, Some(20)).is_subtype_of(&t(10, Some(20))));
        assert!(t(15, Some(20)).is_subtype_of(&t(10, Some(20))));
        assert!(t(10, Some(15)).is_subtype_of(&t(10, Some(20))));
        assert!(t(10, Some(20)).is_subtype_of(&t(10, None)));
        assert!(!t(5, Some(20)).is_subtype_of(&t(10, Some(20))));
        assert!(!t(10, None).is_subtype_of(&t(10, Some(20))));
    }

    #[test]
    fn memory_subtyping_is_width_subtyping() {
        let m = |min: u32, max: Option<u32>| MemoryType {
            minimum: Pages(min),
            maximum: max.map(Pages),
        };
        assert!(m(1, Some(4)).is_subtype_of(&m(1, Some(4))));
        assert!(m(2, Some(3)).is_subtype_of(&m(1, Some(4))));
        assert!(!m(0, Some(4)).is_subtype_of(&m(1, Some(4))));
        assert!(!m(1, None).is_subtype_of(&m(1, Some(4))));
        assert!(m(1, Some(4)).is_subtype_of(&m(1, None)));
    }
}
