//! Reference-counted typed arrays for array-valued fields.
//!
//! pvAccess array fields pass whole arrays by reference. [`SharedArray`] is
//! a runtime-tagged contiguous buffer: the element type travels with the
//! data, so an array can be stored in an untyped cell and later viewed
//! through [`SharedArray::as_slice`] without losing its original tag. A
//! mutable array is an ordinary `Vec<T>`; converting it into a
//! `SharedArray` is the freeze point, after which the contents are shared
//! and immutable.

use std::sync::Arc;

use crate::typedesc::TypeCode;
use crate::value::IValue;

/// Runtime element-type tag. The values coincide with the corresponding
/// array [`TypeCode`]s; `Value` stands in for all three compound arrays.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum ArrayType {
    Null = 0xff,
    Bool = 0x08,
    Int8 = 0x28,
    Int16 = 0x29,
    Int32 = 0x2a,
    Int64 = 0x2b,
    UInt8 = 0x2c,
    UInt16 = 0x2d,
    UInt32 = 0x2e,
    UInt64 = 0x2f,
    Float32 = 0x4a,
    Float64 = 0x4b,
    String = 0x68,
    Value = 0x88,
}

impl ArrayType {
    /// The tag matching a scalar-array type code, if there is one.
    pub fn from_code(code: TypeCode) -> Option<ArrayType> {
        Some(match code {
            TypeCode::BoolA => ArrayType::Bool,
            TypeCode::Int8A => ArrayType::Int8,
            TypeCode::Int16A => ArrayType::Int16,
            TypeCode::Int32A => ArrayType::Int32,
            TypeCode::Int64A => ArrayType::Int64,
            TypeCode::UInt8A => ArrayType::UInt8,
            TypeCode::UInt16A => ArrayType::UInt16,
            TypeCode::UInt32A => ArrayType::UInt32,
            TypeCode::UInt64A => ArrayType::UInt64,
            TypeCode::Float32A => ArrayType::Float32,
            TypeCode::Float64A => ArrayType::Float64,
            TypeCode::StringA => ArrayType::String,
            TypeCode::StructA | TypeCode::UnionA | TypeCode::AnyA => ArrayType::Value,
            _ => return None,
        })
    }
}

/// Marker for types which can be the element of a [`SharedArray`].
pub trait ArrayElement: Clone + Sized {
    const ARRAY_TYPE: ArrayType;
    fn wrap(values: Vec<Self>) -> SharedArray;
    fn slice(arr: &SharedArray) -> Option<&[Self]>;
}

/// A reference-counted contiguous array with a runtime element-type tag.
///
/// `Null` is the untyped empty array used to clear array cells.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum SharedArray {
    #[default]
    Null,
    Bool(Arc<[bool]>),
    Int8(Arc<[i8]>),
    Int16(Arc<[i16]>),
    Int32(Arc<[i32]>),
    Int64(Arc<[i64]>),
    UInt8(Arc<[u8]>),
    UInt16(Arc<[u16]>),
    UInt32(Arc<[u32]>),
    UInt64(Arc<[u64]>),
    Float32(Arc<[f32]>),
    Float64(Arc<[f64]>),
    String(Arc<[String]>),
    Value(Arc<[IValue]>),
}

impl SharedArray {
    /// The element type this array was created with.
    pub fn original_type(&self) -> ArrayType {
        match self {
            SharedArray::Null => ArrayType::Null,
            SharedArray::Bool(_) => ArrayType::Bool,
            SharedArray::Int8(_) => ArrayType::Int8,
            SharedArray::Int16(_) => ArrayType::Int16,
            SharedArray::Int32(_) => ArrayType::Int32,
            SharedArray::Int64(_) => ArrayType::Int64,
            SharedArray::UInt8(_) => ArrayType::UInt8,
            SharedArray::UInt16(_) => ArrayType::UInt16,
            SharedArray::UInt32(_) => ArrayType::UInt32,
            SharedArray::UInt64(_) => ArrayType::UInt64,
            SharedArray::Float32(_) => ArrayType::Float32,
            SharedArray::Float64(_) => ArrayType::Float64,
            SharedArray::String(_) => ArrayType::String,
            SharedArray::Value(_) => ArrayType::Value,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SharedArray::Null => 0,
            SharedArray::Bool(v) => v.len(),
            SharedArray::Int8(v) => v.len(),
            SharedArray::Int16(v) => v.len(),
            SharedArray::Int32(v) => v.len(),
            SharedArray::Int64(v) => v.len(),
            SharedArray::UInt8(v) => v.len(),
            SharedArray::UInt16(v) => v.len(),
            SharedArray::UInt32(v) => v.len(),
            SharedArray::UInt64(v) => v.len(),
            SharedArray::Float32(v) => v.len(),
            SharedArray::Float64(v) => v.len(),
            SharedArray::String(v) => v.len(),
            SharedArray::Value(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SharedArray::Null)
    }

    /// Typed view of the elements; `None` when `T` does not match the tag.
    pub fn as_slice<T: ArrayElement>(&self) -> Option<&[T]> {
        T::slice(self)
    }

    pub fn from_vec<T: ArrayElement>(values: Vec<T>) -> SharedArray {
        T::wrap(values)
    }
}

macro_rules! impl_array_element {
    ($typ:ty, $variant:ident) => {
        impl ArrayElement for $typ {
            const ARRAY_TYPE: ArrayType = ArrayType::$variant;
            fn wrap(values: Vec<Self>) -> SharedArray {
                SharedArray::$variant(values.into())
            }
            fn slice(arr: &SharedArray) -> Option<&[Self]> {
                match arr {
                    SharedArray::$variant(v) => Some(v),
                    _ => None,
                }
            }
        }
        impl From<Vec<$typ>> for SharedArray {
            fn from(values: Vec<$typ>) -> SharedArray {
                <$typ as ArrayElement>::wrap(values)
            }
        }
    };
}

impl_array_element!(bool, Bool);
impl_array_element!(i8, Int8);
impl_array_element!(i16, Int16);
impl_array_element!(i32, Int32);
impl_array_element!(i64, Int64);
impl_array_element!(u8, UInt8);
impl_array_element!(u16, UInt16);
impl_array_element!(u32, UInt32);
impl_array_element!(u64, UInt64);
impl_array_element!(f32, Float32);
impl_array_element!(f64, Float64);
impl_array_element!(String, String);
impl_array_element!(IValue, Value);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_travels_with_data() {
        let arr: SharedArray = vec![1u32, 2, 3].into();
        assert_eq!(arr.original_type(), ArrayType::UInt32);
        assert_eq!(arr.len(), 3);
        assert_eq!(arr.as_slice::<u32>(), Some(&[1u32, 2, 3][..]));
        assert_eq!(arr.as_slice::<i32>(), None);

        let cloned = arr.clone();
        assert_eq!(cloned, arr);
    }

    #[test]
    fn null_is_untyped_and_empty() {
        let arr = SharedArray::Null;
        assert!(arr.is_null());
        assert!(arr.is_empty());
        assert_eq!(arr.original_type(), ArrayType::Null);
    }

    #[test]
    fn code_mapping() {
        assert_eq!(ArrayType::from_code(TypeCode::Float64A), Some(ArrayType::Float64));
        assert_eq!(ArrayType::from_code(TypeCode::StructA), Some(ArrayType::Value));
        assert_eq!(ArrayType::from_code(TypeCode::Float64), None);
    }
}
