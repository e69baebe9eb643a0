//! Storage trees and value handles for self-describing structured data.
//!
//! A [`crate::TypeDesc`] describes shape; this module holds the parallel
//! mutable storage. Every descriptor node owns one [`FieldStorage`] cell in
//! a contiguous vector inside a `StructTop`. Handles ([`MValue`] mutable,
//! [`IValue`] immutable) are cursors of `(shared tree, cell index)`;
//! cloning a handle aliases the tree rather than copying it, and the
//! `Arc` reference count on the tree is what gates the O(1)
//! [`MValue::freeze`] / [`IValue::thaw`] exchanges.
//!
//! Each cell also carries a `valid` bit ("mark") which drives the masked
//! partial serialization in [`crate::wire`] and the change-set semantics of
//! [`MValue::assign`].

use std::fmt;
use std::sync::{Arc, Mutex};

use num::NumCast;

use crate::error::Error;
use crate::sharedarray::{ArrayElement, ArrayType, SharedArray};
use crate::typedesc::{FieldDesc, Kind, TypeCode, TypeDesc};

/// Storage class of a cell. All integer widths promote to 64-bit, both
/// float widths to `f64`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StoreType {
    Null,
    Bool,
    Integer,
    UInteger,
    Real,
    String,
    Array,
    Compound,
}

/// Discriminated cell payload.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Store {
    /// Struct anchors and Null fields carry no payload
    Null,
    Bool(bool),
    Integer(i64),
    UInteger(u64),
    Real(f64),
    String(String),
    Array(SharedArray),
    /// Union/Any selection; the empty handle means "no selection"
    Compound(IValue),
}

impl Store {
    pub(crate) fn store_type(&self) -> StoreType {
        match self {
            Store::Null => StoreType::Null,
            Store::Bool(_) => StoreType::Bool,
            Store::Integer(_) => StoreType::Integer,
            Store::UInteger(_) => StoreType::UInteger,
            Store::Real(_) => StoreType::Real,
            Store::String(_) => StoreType::String,
            Store::Array(_) => StoreType::Array,
            Store::Compound(_) => StoreType::Compound,
        }
    }
}

/// One mutable slot, parallel to one descriptor node.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct FieldStorage {
    pub(crate) store: Store,
    pub(crate) valid: bool,
}

fn init_store(desc: &FieldDesc) -> Store {
    if desc.code == TypeCode::Struct || desc.code == TypeCode::Null {
        Store::Null
    } else if desc.code.is_array() {
        Store::Array(SharedArray::Null)
    } else {
        match desc.code.kind() {
            Kind::Bool => Store::Bool(false),
            Kind::Integer => {
                if desc.code.is_unsigned() {
                    Store::UInteger(0)
                } else {
                    Store::Integer(0)
                }
            }
            Kind::Real => Store::Real(0.0),
            Kind::String => Store::String(String::new()),
            Kind::Compound => Store::Compound(IValue::default()),
            Kind::Null => Store::Null,
        }
    }
}

/// Owner of one allocated structure: the shared descriptor plus one storage
/// cell per descriptor node of the subtree rooted at `base`.
#[derive(Debug)]
pub(crate) struct StructTop {
    pub(crate) dtype: Arc<TypeDesc>,
    /// Descriptor index of the root node this allocation covers.
    pub(crate) base: usize,
    pub(crate) cells: Mutex<Vec<FieldStorage>>,
}

impl StructTop {
    fn alloc(dtype: Arc<TypeDesc>, base: usize) -> Arc<StructTop> {
        let size = dtype.node(base).size;
        let cells = (base..base + size)
            .map(|i| FieldStorage {
                store: init_store(dtype.node(i)),
                valid: false,
            })
            .collect();
        Arc::new(StructTop {
            dtype,
            base,
            cells: Mutex::new(cells),
        })
    }

    /// Descriptor node for cell `index`.
    pub(crate) fn desc(&self, index: usize) -> &FieldDesc {
        self.dtype.node(self.base + index)
    }
}

#[derive(Debug, Clone)]
struct Handle {
    top: Arc<StructTop>,
    index: usize,
}

impl Handle {
    fn desc(&self) -> &FieldDesc {
        self.top.desc(self.index)
    }
}

/// Mutable handle into a storage tree. See the module docs.
#[derive(Debug, Clone, Default)]
pub struct MValue {
    inner: Option<Handle>,
}

/// Immutable (read-only) handle into a storage tree.
#[derive(Debug, Clone, Default)]
pub struct IValue {
    inner: Option<Handle>,
}

/// Intermediate value in the storage domain, used by the conversion
/// matrix between cells and user types.
#[derive(Debug, Clone)]
pub enum Transfer {
    Bool(bool),
    Integer(i64),
    UInteger(u64),
    Real(f64),
    String(String),
    Array(SharedArray),
    Compound(IValue),
}

/// Types which can be read out of a value with [`IValue::load`].
pub trait FromValue: Sized {
    /// Storage class this type is narrowed from.
    fn wanted() -> StoreType;
    fn from_transfer(t: Transfer) -> Result<Self, Error>;
}

/// Types which can be written into a value with [`MValue::store`].
pub trait IntoValue {
    fn into_transfer(self) -> Transfer;
}

macro_rules! impl_value_int {
    ($typ:ty, signed) => {
        impl FromValue for $typ {
            fn wanted() -> StoreType {
                StoreType::Integer
            }
            fn from_transfer(t: Transfer) -> Result<Self, Error> {
                match t {
                    Transfer::Integer(v) => NumCast::from(v).ok_or(Error::NoConvert),
                    _ => Err(Error::NoConvert),
                }
            }
        }
        impl IntoValue for $typ {
            fn into_transfer(self) -> Transfer {
                Transfer::Integer(self as i64)
            }
        }
    };
    ($typ:ty, unsigned) => {
        impl FromValue for $typ {
            fn wanted() -> StoreType {
                StoreType::UInteger
            }
            fn from_transfer(t: Transfer) -> Result<Self, Error> {
                match t {
                    Transfer::UInteger(v) => NumCast::from(v).ok_or(Error::NoConvert),
                    _ => Err(Error::NoConvert),
                }
            }
        }
        impl IntoValue for $typ {
            fn into_transfer(self) -> Transfer {
                Transfer::UInteger(self as u64)
            }
        }
    };
}

impl_value_int!(i8, signed);
impl_value_int!(i16, signed);
impl_value_int!(i32, signed);
impl_value_int!(i64, signed);
impl_value_int!(u8, unsigned);
impl_value_int!(u16, unsigned);
impl_value_int!(u32, unsigned);
impl_value_int!(u64, unsigned);

impl FromValue for f64 {
    fn wanted() -> StoreType {
        StoreType::Real
    }
    fn from_transfer(t: Transfer) -> Result<Self, Error> {
        match t {
            Transfer::Real(v) => Ok(v),
            _ => Err(Error::NoConvert),
        }
    }
}
impl IntoValue for f64 {
    fn into_transfer(self) -> Transfer {
        Transfer::Real(self)
    }
}

impl FromValue for f32 {
    fn wanted() -> StoreType {
        StoreType::Real
    }
    fn from_transfer(t: Transfer) -> Result<Self, Error> {
        match t {
            Transfer::Real(v) => Ok(v as f32),
            _ => Err(Error::NoConvert),
        }
    }
}
impl IntoValue for f32 {
    fn into_transfer(self) -> Transfer {
        Transfer::Real(self as f64)
    }
}

impl FromValue for bool {
    fn wanted() -> StoreType {
        StoreType::Bool
    }
    fn from_transfer(t: Transfer) -> Result<Self, Error> {
        match t {
            Transfer::Bool(v) => Ok(v),
            _ => Err(Error::NoConvert),
        }
    }
}
impl IntoValue for bool {
    fn into_transfer(self) -> Transfer {
        Transfer::Bool(self)
    }
}

impl FromValue for String {
    fn wanted() -> StoreType {
        StoreType::String
    }
    fn from_transfer(t: Transfer) -> Result<Self, Error> {
        match t {
            Transfer::String(v) => Ok(v),
            _ => Err(Error::NoConvert),
        }
    }
}
impl IntoValue for String {
    fn into_transfer(self) -> Transfer {
        Transfer::String(self)
    }
}
impl IntoValue for &str {
    fn into_transfer(self) -> Transfer {
        Transfer::String(self.to_string())
    }
}

impl FromValue for IValue {
    fn wanted() -> StoreType {
        StoreType::Compound
    }
    fn from_transfer(t: Transfer) -> Result<Self, Error> {
        match t {
            Transfer::Compound(v) => Ok(v),
            _ => Err(Error::NoConvert),
        }
    }
}
impl IntoValue for IValue {
    fn into_transfer(self) -> Transfer {
        Transfer::Compound(self)
    }
}

impl FromValue for SharedArray {
    fn wanted() -> StoreType {
        StoreType::Array
    }
    fn from_transfer(t: Transfer) -> Result<Self, Error> {
        match t {
            Transfer::Array(v) => Ok(v),
            _ => Err(Error::NoConvert),
        }
    }
}
impl IntoValue for SharedArray {
    fn into_transfer(self) -> Transfer {
        Transfer::Array(self)
    }
}
impl<T: ArrayElement> IntoValue for Vec<T> {
    fn into_transfer(self) -> Transfer {
        Transfer::Array(SharedArray::from_vec(self))
    }
}

/// Base-prefix-aware integer parse: `0x`/`0X` hex, leading `0` octal,
/// decimal otherwise. Mirrors C `strtoll(.., 0)`.
fn parse_i64(s: &str) -> Option<i64> {
    let s = s.trim();
    let (neg, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let mag = parse_u64_digits(digits)?;
    if neg {
        if mag > i64::MAX as u64 + 1 {
            return None;
        }
        Some((mag as i64).wrapping_neg())
    } else {
        i64::try_from(mag).ok()
    }
}

fn parse_u64(s: &str) -> Option<u64> {
    let s = s.trim();
    parse_u64_digits(s.strip_prefix('+').unwrap_or(s))
}

fn parse_u64_digits(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else if s.len() > 1 && s.starts_with('0') {
        u64::from_str_radix(&s[1..], 8).ok()
    } else {
        s.parse().ok()
    }
}

/// Convert a cell payload into the requested storage class.
fn convert_out(store: Store, want: StoreType) -> Result<Transfer, Error> {
    Ok(match (store, want) {
        (Store::Bool(v), StoreType::Bool) => Transfer::Bool(v),
        (Store::Bool(v), StoreType::Integer) => Transfer::Integer(v as i64),
        (Store::Bool(v), StoreType::UInteger) => Transfer::UInteger(v as u64),
        (Store::Bool(v), StoreType::Real) => Transfer::Real(v as u8 as f64),
        (Store::Bool(v), StoreType::String) => {
            Transfer::String(if v { "true" } else { "false" }.to_string())
        }

        (Store::Integer(v), StoreType::Integer) => Transfer::Integer(v),
        (Store::Integer(v), StoreType::UInteger) => Transfer::UInteger(v as u64),
        (Store::Integer(v), StoreType::Real) => Transfer::Real(v as f64),
        (Store::Integer(v), StoreType::Bool) => Transfer::Bool(v != 0),
        (Store::Integer(v), StoreType::String) => Transfer::String(v.to_string()),

        (Store::UInteger(v), StoreType::Integer) => Transfer::Integer(v as i64),
        (Store::UInteger(v), StoreType::UInteger) => Transfer::UInteger(v),
        (Store::UInteger(v), StoreType::Real) => Transfer::Real(v as f64),
        (Store::UInteger(v), StoreType::Bool) => Transfer::Bool(v != 0),
        (Store::UInteger(v), StoreType::String) => Transfer::String(v.to_string()),

        (Store::Real(v), StoreType::Real) => Transfer::Real(v),
        (Store::Real(v), StoreType::Integer) => Transfer::Integer(v as i64),
        (Store::Real(v), StoreType::UInteger) => Transfer::UInteger(v as u64),
        (Store::Real(v), StoreType::Bool) => Transfer::Bool(v != 0.0),
        (Store::Real(v), StoreType::String) => Transfer::String(v.to_string()),

        (Store::String(v), StoreType::String) => Transfer::String(v),
        (Store::String(v), StoreType::Integer) => {
            Transfer::Integer(parse_i64(&v).ok_or(Error::NoConvert)?)
        }
        (Store::String(v), StoreType::UInteger) => {
            Transfer::UInteger(parse_u64(&v).ok_or(Error::NoConvert)?)
        }
        (Store::String(v), StoreType::Real) => {
            Transfer::Real(v.trim().parse().map_err(|_| Error::NoConvert)?)
        }
        (Store::String(v), StoreType::Bool) => Transfer::Bool(match v.as_str() {
            "true" => true,
            "false" => false,
            _ => return Err(Error::NoConvert),
        }),

        (Store::Array(v), StoreType::Array) => Transfer::Array(v),

        (Store::Compound(v), StoreType::Compound) => Transfer::Compound(v),
        (Store::Compound(v), want) => {
            // Automatic dereference of a held selection
            if v.valid() {
                return copy_out(v.inner.as_ref().unwrap(), want);
            }
            return Err(Error::NoConvert);
        }

        _ => return Err(Error::NoConvert),
    })
}

fn copy_out(h: &Handle, want: StoreType) -> Result<Transfer, Error> {
    let store = {
        let cells = h.top.cells.lock().unwrap();
        cells[h.index].store.clone()
    };
    convert_out(store, want)
}

/// Write a transfer value into the cell, converting to the cell's storage
/// class. Marks the cell valid on success.
fn copy_in(h: &Handle, value: Transfer) -> Result<(), Error> {
    let desc_code = h.desc().code;
    let member_desc = h.desc().members.first().cloned();

    let mut cells = h.top.cells.lock().unwrap();
    let cell = &mut cells[h.index];

    let new = match (&cell.store, value) {
        (Store::Bool(_), Transfer::Bool(v)) => Store::Bool(v),
        (Store::Bool(_), Transfer::Integer(v)) => Store::Bool(v != 0),
        (Store::Bool(_), Transfer::UInteger(v)) => Store::Bool(v != 0),
        (Store::Bool(_), Transfer::Real(v)) => Store::Bool(v != 0.0),
        (Store::Bool(_), Transfer::String(v)) => Store::Bool(match v.as_str() {
            "true" => true,
            "false" => false,
            _ => return Err(Error::NoConvert),
        }),

        (Store::Integer(_), Transfer::Integer(v)) => Store::Integer(v),
        (Store::Integer(_), Transfer::UInteger(v)) => Store::Integer(v as i64),
        (Store::Integer(_), Transfer::Real(v)) => Store::Integer(v as i64),
        (Store::Integer(_), Transfer::Bool(v)) => Store::Integer(v as i64),
        (Store::Integer(_), Transfer::String(v)) => {
            Store::Integer(parse_i64(&v).ok_or(Error::NoConvert)?)
        }

        (Store::UInteger(_), Transfer::UInteger(v)) => Store::UInteger(v),
        (Store::UInteger(_), Transfer::Integer(v)) => Store::UInteger(v as u64),
        (Store::UInteger(_), Transfer::Real(v)) => Store::UInteger(v as u64),
        (Store::UInteger(_), Transfer::Bool(v)) => Store::UInteger(v as u64),
        (Store::UInteger(_), Transfer::String(v)) => {
            Store::UInteger(parse_u64(&v).ok_or(Error::NoConvert)?)
        }

        (Store::Real(_), Transfer::Real(v)) => Store::Real(v),
        (Store::Real(_), Transfer::Integer(v)) => Store::Real(v as f64),
        (Store::Real(_), Transfer::UInteger(v)) => Store::Real(v as f64),
        (Store::Real(_), Transfer::Bool(v)) => Store::Real(v as u8 as f64),
        (Store::Real(_), Transfer::String(v)) => {
            Store::Real(v.trim().parse().map_err(|_| Error::NoConvert)?)
        }

        (Store::String(_), Transfer::String(v)) => Store::String(v),
        (Store::String(_), Transfer::Integer(v)) => Store::String(v.to_string()),
        (Store::String(_), Transfer::UInteger(v)) => Store::String(v.to_string()),
        (Store::String(_), Transfer::Real(v)) => Store::String(v.to_string()),
        (Store::String(_), Transfer::Bool(v)) => {
            Store::String(if v { "true" } else { "false" }.to_string())
        }

        (Store::Array(_), Transfer::Array(src)) => {
            if src.is_null() || src.is_empty() {
                // assignment from untyped or empty clears
                Store::Array(SharedArray::Null)
            } else if src.original_type() == ArrayType::Value
                && desc_code.kind() == Kind::Compound
            {
                if desc_code != TypeCode::AnyA {
                    // enforce the member type for struct[] and union[]
                    let member =
                        member_desc.ok_or(Error::NoConvert)?;
                    let elems = src.as_slice::<IValue>().ok_or(Error::NoConvert)?;
                    for elem in elems {
                        if let Some(h) = &elem.inner
                            && !type_matches(&h.top, h.index, &member, 0)
                        {
                            return Err(Error::NoConvert);
                        }
                    }
                }
                Store::Array(src)
            } else if Some(src.original_type()) == ArrayType::from_code(desc_code) {
                // same-typed scalar array, no conversion
                Store::Array(src)
            } else {
                return Err(Error::NoConvert);
            }
        }

        (Store::Compound(_), Transfer::Compound(v)) => {
            if desc_code == TypeCode::Any {
                Store::Compound(v)
            } else {
                // Union selection must match one of the alternatives
                let matched = v.inner.as_ref().is_some_and(|vh| {
                    h.desc()
                        .members
                        .iter()
                        .any(|m| type_matches(&vh.top, vh.index, m, 0))
                });
                if !matched {
                    return Err(Error::NoConvert);
                }
                Store::Compound(v)
            }
        }

        _ => return Err(Error::NoConvert),
    };

    cell.store = new;
    cell.valid = true;
    Ok(())
}

/// Structural comparison of the subtree at (`top`, cell `index`) against
/// the subtree of `dtype` rooted at descriptor index `at`.
fn type_matches(top: &Arc<StructTop>, index: usize, dtype: &Arc<TypeDesc>, at: usize) -> bool {
    let abs = top.base + index;
    if Arc::ptr_eq(&top.dtype, dtype) && abs == at {
        return true;
    }
    crate::typedesc::subtree_matches(&top.dtype, abs, dtype, at)
}

fn eq_handles(a: &Option<Handle>, b: &Option<Handle>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            if !type_matches(&a.top, a.index, &b.top.dtype, b.top.base + b.index) {
                return false;
            }
            let size = a.desc().size;
            let asnap: Vec<FieldStorage> = {
                let cells = a.top.cells.lock().unwrap();
                cells[a.index..a.index + size].to_vec()
            };
            let bsnap: Vec<FieldStorage> = {
                let cells = b.top.cells.lock().unwrap();
                cells[b.index..b.index + size].to_vec()
            };
            asnap == bsnap
        }
        _ => false,
    }
}

impl PartialEq for MValue {
    fn eq(&self, other: &Self) -> bool {
        eq_handles(&self.inner, &other.inner)
    }
}
impl PartialEq for IValue {
    fn eq(&self, other: &Self) -> bool {
        eq_handles(&self.inner, &other.inner)
    }
}
impl PartialEq<IValue> for MValue {
    fn eq(&self, other: &IValue) -> bool {
        eq_handles(&self.inner, &other.inner)
    }
}

fn scan_name(expr: &str, stops: &[char]) -> usize {
    expr.find(|c| stops.contains(&c)).unwrap_or(expr.len())
}

/// Left-to-right traversal of a field expression. Returns `None` (the
/// empty handle) on any syntax error, missing member, or const-ness
/// violation.
fn traverse(mut h: Handle, expr: &str, modify: bool) -> Option<Handle> {
    let mut pos = 0;
    let bytes = expr.as_bytes();

    while pos < expr.len() {
        if bytes[pos] == b'<' {
            // ascend to the enclosing struct, within this allocation
            let up = h.desc().parent_index;
            if up == 0 || h.index < up {
                return None;
            }
            h.index -= up;
            pos += 1;
            continue;
        }

        let code = h.desc().code;
        match code {
            TypeCode::Struct => {
                let mut rest = &expr[pos..];
                if rest.starts_with('.') {
                    rest = &rest[1..];
                    pos += 1;
                }
                let sep = scan_name(rest, &['<', '[', '-']);
                if sep == 0 {
                    return None;
                }
                let rel = *h.desc().mlookup.get(&rest[..sep])?;
                h.index += rel;
                pos += sep;
            }

            TypeCode::Union | TypeCode::Any => {
                if !expr[pos..].starts_with("->") {
                    return None;
                }
                pos += 2;

                if code == TypeCode::Any {
                    // dereference the held value
                    h = deref_compound(&h, modify)?;
                    continue;
                }

                let rest = &expr[pos..];
                let sep = scan_name(rest, &['<', '[', '-', '.']);
                if sep == 0 {
                    return None;
                }
                let mi = *h.desc().mlookup.get(&rest[..sep])?;
                let member = h.desc().members[mi].clone();
                pos += sep;

                let selected = {
                    let cells = h.top.cells.lock().unwrap();
                    match &cells[h.index].store {
                        Store::Compound(v) => v
                            .inner
                            .as_ref()
                            .is_some_and(|vh| type_matches(&vh.top, vh.index, &member, 0)),
                        _ => return None,
                    }
                };

                if selected {
                    h = deref_compound(&h, modify)?;
                } else if modify {
                    // select: fresh member storage, cell becomes marked
                    let fresh = StructTop::alloc(member, 0);
                    let handle = Handle {
                        top: fresh,
                        index: 0,
                    };
                    let mut cells = h.top.cells.lock().unwrap();
                    cells[h.index].store = Store::Compound(IValue {
                        inner: Some(handle.clone()),
                    });
                    cells[h.index].valid = true;
                    drop(cells);
                    h = handle;
                } else {
                    return None;
                }
            }

            TypeCode::StructA | TypeCode::UnionA | TypeCode::AnyA => {
                // element access: frozen elements are immutable-only
                if modify {
                    return None;
                }
                let rest = &expr[pos..];
                if !rest.starts_with('[') {
                    return None;
                }
                let close = rest.find(']')?;
                let idx: usize = rest[1..close].parse().ok()?;
                let elem = {
                    let cells = h.top.cells.lock().unwrap();
                    match &cells[h.index].store {
                        Store::Array(arr) => arr.as_slice::<IValue>()?.get(idx)?.clone(),
                        _ => return None,
                    }
                };
                h = elem.inner?;
                pos += close + 1;
            }

            _ => return None,
        }
    }
    Some(h)
}

/// Descend into the value held by a compound cell. For mutable traversal
/// the held tree must be solely owned by the cell, otherwise descending
/// would subvert the const-ness of a shared subtree.
fn deref_compound(h: &Handle, modify: bool) -> Option<Handle> {
    let cells = h.top.cells.lock().unwrap();
    let held = match &cells[h.index].store {
        Store::Compound(v) => v.inner.as_ref()?,
        _ => return None,
    };
    if modify && Arc::strong_count(&held.top) != 1 {
        return None;
    }
    Some(held.clone())
}

// Operations shared by both handle types

macro_rules! impl_value_common {
    ($typ:ident) => {
        impl $typ {
            /// Does this handle reference any storage?
            pub fn valid(&self) -> bool {
                self.inner.is_some()
            }

            /// Type of the referenced field, or `Null` for the empty handle.
            pub fn type_code(&self) -> TypeCode {
                self.inner
                    .as_ref()
                    .map(|h| h.desc().code)
                    .unwrap_or(TypeCode::Null)
            }

            /// Storage class of the referenced cell.
            pub fn storage_type(&self) -> StoreType {
                match &self.inner {
                    None => StoreType::Null,
                    Some(h) => {
                        let cells = h.top.cells.lock().unwrap();
                        cells[h.index].store.store_type()
                    }
                }
            }

            /// Type ID string (`Struct`/`Union` only).
            pub fn id(&self) -> Option<&str> {
                self.inner.as_ref().map(|h| h.desc().id.as_str())
            }

            /// The descriptor tree this value is an instance of.
            pub fn type_desc(&self) -> Option<Arc<TypeDesc>> {
                self.inner.as_ref().map(|h| {
                    if h.top.base == 0 && h.index == 0 {
                        h.top.dtype.clone()
                    } else {
                        // narrow to the subtree
                        Arc::new(h.top.dtype.extract(h.top.base + h.index))
                    }
                })
            }

            /// Number of storage cells in this subtree.
            pub fn tree_len(&self) -> usize {
                self.inner.as_ref().map(|h| h.desc().size).unwrap_or(0)
            }

            /// Do two handles reference the same storage cell?
            pub fn same_instance(&self, other: &$typ) -> bool {
                match (&self.inner, &other.inner) {
                    (Some(a), Some(b)) => Arc::ptr_eq(&a.top, &b.top) && a.index == b.index,
                    _ => false,
                }
            }

            /// Extract the field as `T`, converting where defined.
            pub fn load<T: FromValue>(&self) -> Result<T, Error> {
                let h = self.inner.as_ref().ok_or(Error::NoField)?;
                T::from_transfer(copy_out(h, T::wanted())?)
            }

            /// Test the valid/changed mark of this cell.
            pub fn is_marked(&self) -> bool {
                match &self.inner {
                    None => false,
                    Some(h) => {
                        let cells = h.top.cells.lock().unwrap();
                        cells[h.index].valid
                    }
                }
            }

            /// Test the mark, optionally considering ancestors within this
            /// allocation and/or any descendant.
            pub fn is_marked_deep(&self, parents: bool, children: bool) -> bool {
                let Some(h) = &self.inner else { return false };
                let cells = h.top.cells.lock().unwrap();
                if cells[h.index].valid {
                    return true;
                }
                if parents {
                    let mut at = h.index;
                    loop {
                        let up = h.top.desc(at).parent_index;
                        if up == 0 || at < up {
                            break;
                        }
                        at -= up;
                        if cells[at].valid {
                            return true;
                        }
                    }
                }
                if children {
                    let size = h.desc().size;
                    if cells[h.index..h.index + size].iter().any(|c| c.valid) {
                        return true;
                    }
                }
                false
            }

            /// Visit every cell of this subtree which is marked, or inside a
            /// marked compound. Indices are relative to this handle. Skips
            /// unmarked subtrees in O(marked-set).
            pub fn for_each_marked<F: FnMut(usize)>(&self, mut f: F) {
                let Some(h) = &self.inner else { return };
                let cells = h.top.cells.lock().unwrap();
                let size = h.desc().size;
                let mut pos = h.index;
                let end = h.index + size;
                while pos < end {
                    if cells[pos].valid {
                        let sub = h.top.desc(pos).size;
                        for i in pos..pos + sub {
                            f(i - h.index);
                        }
                        pos += sub;
                    } else {
                        pos += 1;
                    }
                }
            }

            /// Allocate fresh default-valued storage of the same type.
            pub fn clone_empty(&self) -> MValue {
                match &self.inner {
                    None => MValue::default(),
                    Some(h) => MValue {
                        inner: Some(Handle {
                            top: StructTop::alloc(h.top.dtype.clone(), h.top.base + h.index),
                            index: 0,
                        }),
                    },
                }
            }

            /// Allocate new storage and copy this subtree's values and marks
            /// into it. Compound children continue to share their (frozen)
            /// member trees.
            pub fn deep_clone(&self) -> MValue {
                let ret = self.clone_empty();
                let (Some(src), Some(Handle { top: dst, .. })) = (&self.inner, &ret.inner) else {
                    return ret;
                };
                let snap: Vec<FieldStorage> = {
                    let cells = src.top.cells.lock().unwrap();
                    cells[src.index..src.index + src.desc().size].to_vec()
                };
                *dst.cells.lock().unwrap() = snap;
                ret
            }
        }
    };
}

impl_value_common!(MValue);
impl_value_common!(IValue);

impl MValue {
    /// Instantiate fresh storage for a descriptor. Used by
    /// [`crate::TypeDef::create`] and the wire decoder.
    pub(crate) fn instantiate(dtype: Arc<TypeDesc>) -> MValue {
        MValue {
            inner: Some(Handle {
                top: StructTop::alloc(dtype, 0),
                index: 0,
            }),
        }
    }

    /// Attempt to descend to a sub-field. Returns the empty handle on any
    /// syntax error, missing member, or const-ness violation.
    pub fn field(&self, expr: &str) -> MValue {
        MValue {
            inner: self
                .inner
                .clone()
                .and_then(|h| traverse(h, expr, true)),
        }
    }

    /// Store `v` into this field, converting where defined, and mark it.
    pub fn store<T: IntoValue>(&mut self, v: T) -> Result<(), Error> {
        let h = self.inner.as_ref().ok_or(Error::NoField)?;
        copy_in(h, v.into_transfer())
    }

    /// Shorthand for `self.field(path).store(v)`.
    pub fn update<T: IntoValue>(&mut self, path: &str, v: T) -> Result<(), Error> {
        let mut f = self.field(path);
        if !f.valid() {
            return Err(Error::NoField);
        }
        f.store(v)
    }

    /// Mark this field as valid/changed.
    pub fn mark(&mut self) {
        if let Some(h) = &self.inner {
            h.top.cells.lock().unwrap()[h.index].valid = true;
        }
    }

    /// Remove the mark from this field only.
    pub fn unmark(&mut self) {
        if let Some(h) = &self.inner {
            h.top.cells.lock().unwrap()[h.index].valid = false;
        }
    }

    /// Remove marks, optionally walking ancestors within this allocation
    /// and/or the whole subtree.
    pub fn unmark_deep(&mut self, parents: bool, children: bool) {
        let Some(h) = &self.inner else { return };
        let mut cells = h.top.cells.lock().unwrap();
        cells[h.index].valid = false;
        if children {
            let size = h.desc().size;
            for c in &mut cells[h.index..h.index + size] {
                c.valid = false;
            }
        }
        if parents {
            let mut at = h.index;
            loop {
                let up = h.top.desc(at).parent_index;
                if up == 0 || at < up {
                    break;
                }
                at -= up;
                cells[at].valid = false;
            }
        }
    }

    /// Copy all marked leaves of `other` into this value, marking the
    /// copied cells and leaving the rest untouched. Requires matching
    /// types, except that leaf scalars of the same kind family convert.
    pub fn assign(&mut self, other: &IValue) -> Result<(), Error> {
        let (Some(dst), Some(src)) = (&self.inner, &other.inner) else {
            return Err(Error::NoField);
        };

        if type_matches(&src.top, src.index, &dst.top.dtype, dst.top.base + dst.index) {
            let size = src.desc().size;
            let snap: Vec<FieldStorage> = {
                let cells = src.top.cells.lock().unwrap();
                cells[src.index..src.index + size].to_vec()
            };
            let mut cells = dst.top.cells.lock().unwrap();
            for (off, cell) in snap.into_iter().enumerate() {
                if cell.valid {
                    let d = &mut cells[dst.index + off];
                    d.store = cell.store;
                    d.valid = true;
                }
            }
            return Ok(());
        }

        // Leaf scalars of the same kind family convert
        let (sc, dc) = (src.desc().code, dst.desc().code);
        let scalar = |c: TypeCode| {
            !c.is_array() && !matches!(c.kind(), Kind::Compound | Kind::Null)
        };
        if !(scalar(sc) && scalar(dc) && sc.kind() == dc.kind()) {
            return Err(Error::NoConvert);
        }
        let want = {
            let cells = dst.top.cells.lock().unwrap();
            cells[dst.index].store.store_type()
        };
        let t = copy_out(src, want)?;
        copy_in(dst, t)
    }

    /// Allocate storage for one element of a `StructA`/`UnionA` field.
    pub fn alloc_member(&self) -> Result<MValue, Error> {
        let h = self.inner.as_ref().ok_or(Error::NoField)?;
        if !matches!(h.desc().code, TypeCode::StructA | TypeCode::UnionA) {
            return Err(Error::NoConvert);
        }
        Ok(MValue::instantiate(h.desc().members[0].clone()))
    }

    /// Exchange this mutable handle for an immutable one.
    ///
    /// O(1), but this must be the only handle sharing the tree; otherwise
    /// the exchange fails with [`Error::Aliased`] and the handle is lost.
    pub fn freeze(self) -> Result<IValue, Error> {
        match self.inner {
            None => Ok(IValue::default()),
            Some(h) => {
                if Arc::strong_count(&h.top) != 1 {
                    return Err(Error::Aliased);
                }
                Ok(IValue { inner: Some(h) })
            }
        }
    }
}

impl IValue {
    /// Attempt to descend to a sub-field. Returns the empty handle on any
    /// syntax error or missing member.
    pub fn field(&self, expr: &str) -> IValue {
        IValue {
            inner: self
                .inner
                .clone()
                .and_then(|h| traverse(h, expr, false)),
        }
    }

    /// Exchange this immutable handle for a mutable one: O(1) when solely
    /// owned, otherwise a deep clone.
    pub fn thaw(self) -> MValue {
        match self.inner {
            None => MValue::default(),
            Some(h) => {
                if Arc::strong_count(&h.top) == 1 {
                    MValue { inner: Some(h) }
                } else {
                    IValue { inner: Some(h) }.deep_clone()
                }
            }
        }
    }
}

// Crate-internal access for the wire codec

impl MValue {
    pub(crate) fn parts(&self) -> Option<(&Arc<StructTop>, usize)> {
        self.inner.as_ref().map(|h| (&h.top, h.index))
    }
}

impl IValue {
    pub(crate) fn parts(&self) -> Option<(&Arc<StructTop>, usize)> {
        self.inner.as_ref().map(|h| (&h.top, h.index))
    }
}

fn fmt_value(
    f: &mut fmt::Formatter<'_>,
    top: &Arc<StructTop>,
    index: usize,
    name: &str,
    level: usize,
) -> fmt::Result {
    let pad = "    ".repeat(level);
    let desc = top.desc(index);
    let store = {
        let cells = top.cells.lock().unwrap();
        cells[index].store.clone()
    };
    let label = |f: &mut fmt::Formatter<'_>| -> fmt::Result {
        write!(f, "{pad}{}", desc.code)?;
        if !desc.id.is_empty() {
            write!(f, " \"{}\"", desc.id)?;
        }
        Ok(())
    };
    match store {
        Store::Null if desc.code == TypeCode::Struct => {
            label(f)?;
            writeln!(f, " {{")?;
            for (child, rel) in &desc.miter {
                fmt_value(f, top, index + rel, child, level + 1)?;
            }
            write!(f, "{pad}}}")?;
            if name.is_empty() {
                writeln!(f)
            } else {
                writeln!(f, " {name}")
            }
        }
        Store::Compound(v) => {
            label(f)?;
            writeln!(f, " {name}")?;
            match &v.inner {
                None => writeln!(f, "{pad}    null"),
                Some(h) => fmt_value(f, &h.top, h.index, "", level + 1),
            }
        }
        Store::Array(SharedArray::Value(arr)) => {
            label(f)?;
            writeln!(f, " {name} [")?;
            for elem in arr.iter() {
                match &elem.inner {
                    None => writeln!(f, "{pad}    null")?,
                    Some(h) => fmt_value(f, &h.top, h.index, "", level + 1)?,
                }
            }
            writeln!(f, "{pad}]")
        }
        other => {
            label(f)?;
            if !name.is_empty() {
                write!(f, " {name}")?;
            }
            match other {
                Store::Null => writeln!(f),
                Store::Bool(v) => writeln!(f, " = {v}"),
                Store::Integer(v) => writeln!(f, " = {v}"),
                Store::UInteger(v) => writeln!(f, " = {v}"),
                Store::Real(v) => writeln!(f, " = {v}"),
                Store::String(v) => writeln!(f, " = \"{v}\""),
                Store::Array(arr) => writeln!(f, " = {{{}}}", arr.len()),
                Store::Compound(_) => unreachable!(),
            }
        }
    }
}

impl fmt::Display for MValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            None => writeln!(f, "null"),
            Some(h) => fmt_value(f, &h.top, h.index, "", 0),
        }
    }
}

impl fmt::Display for IValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            None => writeln!(f, "null"),
            Some(h) => fmt_value(f, &h.top, h.index, "", 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typedesc::{Member, TypeDef};

    fn simple_def() -> TypeDef {
        TypeDef::structure(
            "simple_t",
            vec![
                Member::new(TypeCode::Float64A, "value"),
                Member::with_id(
                    TypeCode::Struct,
                    "timeStamp",
                    "time_t",
                    vec![
                        Member::new(TypeCode::UInt64, "secondsPastEpoch"),
                        Member::new(TypeCode::UInt32, "nanoseconds"),
                    ],
                ),
                Member::compound(
                    TypeCode::Struct,
                    "arbitrary",
                    vec![Member::compound(
                        TypeCode::StructA,
                        "sarr",
                        vec![Member::new(TypeCode::UInt32, "value")],
                    )],
                ),
                Member::new(TypeCode::Any, "any"),
                Member::new(TypeCode::AnyA, "anya"),
                Member::compound(
                    TypeCode::Union,
                    "choice",
                    vec![
                        Member::new(TypeCode::Float32, "a"),
                        Member::new(TypeCode::String, "b"),
                    ],
                ),
                Member::compound(
                    TypeCode::UnionA,
                    "achoice",
                    vec![
                        Member::new(TypeCode::String, "x"),
                        Member::new(TypeCode::String, "y"),
                    ],
                ),
            ],
        )
    }

    fn scalar_struct() -> TypeDef {
        TypeDef::structure(
            "simple_t",
            vec![
                Member::new(TypeCode::Float64, "value"),
                Member::compound(
                    TypeCode::Struct,
                    "alarm",
                    vec![
                        Member::new(TypeCode::Int32, "severity"),
                        Member::new(TypeCode::Int32, "status"),
                        Member::new(TypeCode::String, "message"),
                    ],
                ),
            ],
        )
    }

    #[test]
    fn basic_store_load() {
        let top = scalar_struct().create().unwrap();

        let missing = top.field("missing");
        assert!(!missing.valid());
        assert!(!missing.is_marked());
        assert!(matches!(missing.load::<f64>(), Err(Error::NoField)));

        let mut val = top.field("value");
        assert!(val.valid());
        assert!(!val.is_marked());
        val.store(4.2).unwrap();
        assert_eq!(val.load::<f64>().unwrap(), 4.2);
        assert!(val.is_marked());

        // numeric cross-conversions
        assert_eq!(val.load::<i32>().unwrap(), 4);
        assert_eq!(val.load::<String>().unwrap(), "4.2");

        let mut msg = top.field("alarm.message");
        msg.store("hello").unwrap();
        assert_eq!(top.field("alarm").field("message").load::<String>().unwrap(), "hello");
    }

    #[test]
    fn string_parsing_conversions() {
        let mut val = TypeDef::structure(
            "s",
            vec![
                Member::new(TypeCode::Int32, "i"),
                Member::new(TypeCode::UInt32, "u"),
                Member::new(TypeCode::Float64, "f"),
                Member::new(TypeCode::Bool, "b"),
                Member::new(TypeCode::String, "s"),
            ],
        )
        .create()
        .unwrap();

        val.update("i", "0x1A").unwrap();
        assert_eq!(val.field("i").load::<i32>().unwrap(), 26);
        val.update("i", "017").unwrap();
        assert_eq!(val.field("i").load::<i32>().unwrap(), 15);
        val.update("i", "-12").unwrap();
        assert_eq!(val.field("i").load::<i32>().unwrap(), -12);
        assert!(matches!(val.update("i", "pickle"), Err(Error::NoConvert)));

        assert!(matches!(val.update("u", "-1"), Err(Error::NoConvert)));
        val.update("u", "42").unwrap();
        assert_eq!(val.field("u").load::<u32>().unwrap(), 42);

        val.update("f", "2.5").unwrap();
        assert_eq!(val.field("f").load::<f64>().unwrap(), 2.5);

        val.update("b", "true").unwrap();
        assert!(val.field("b").load::<bool>().unwrap());
        assert_eq!(val.field("b").load::<String>().unwrap(), "true");
        // only the exact spellings convert
        assert!(matches!(val.update("b", "flase"), Err(Error::NoConvert)));
        assert!(matches!(val.update("b", "True"), Err(Error::NoConvert)));

        val.update("s", 42u32).unwrap();
        assert_eq!(val.field("s").load::<String>().unwrap(), "42");
        assert_eq!(val.field("s").load::<u64>().unwrap(), 42);
    }

    #[test]
    fn narrowing_is_checked() {
        let mut val = TypeDef::structure("s", vec![Member::new(TypeCode::Int64, "v")])
            .create()
            .unwrap();
        val.update("v", 300i64).unwrap();
        assert!(matches!(val.field("v").load::<i8>(), Err(Error::NoConvert)));
        assert_eq!(val.field("v").load::<i16>().unwrap(), 300);
    }

    #[test]
    fn array_cells() {
        let mut val = simple_def().create().unwrap();

        assert!(matches!(
            val.field("value").load::<f64>(),
            Err(Error::NoConvert)
        ));

        val.update("value", vec![1.0f64, 2.0]).unwrap();
        let arr: SharedArray = val.field("value").load().unwrap();
        assert_eq!(arr.as_slice::<f64>(), Some(&[1.0, 2.0][..]));

        // wrong element type is rejected without conversion
        assert!(matches!(
            val.update("value", vec![1.0f32]),
            Err(Error::NoConvert)
        ));

        // untyped clears
        val.update("value", SharedArray::Null).unwrap();
        assert!(val.field("value").load::<SharedArray>().unwrap().is_null());
    }

    #[test]
    fn struct_array_members() {
        let mut val = simple_def().create().unwrap();
        let fld = val.field("arbitrary.sarr");

        let mut e0 = fld.alloc_member().unwrap();
        e0.update("value", 0xdeadbeefu32).unwrap();
        let mut e1 = fld.alloc_member().unwrap();
        e1.update("value", 0x1badfaceu32).unwrap();
        let elems = vec![e0.freeze().unwrap(), e1.freeze().unwrap(), IValue::default()];
        val.update("arbitrary.sarr", elems).unwrap();

        let snap = val.deep_clone().freeze().unwrap();
        assert_eq!(
            snap.field("arbitrary.sarr[0]value").load::<u32>().unwrap(),
            0xdeadbeef
        );
        assert_eq!(
            snap.field("arbitrary.sarr[1].value").load::<u32>().unwrap(),
            0x1badface
        );
        assert_eq!(snap.field("arbitrary.sarr[2]").type_code(), TypeCode::Null);
        assert_eq!(snap.field("arbitrary.sarr[9]").type_code(), TypeCode::Null);

        // enforced element type
        let stranger = TypeDef::structure("q", vec![Member::new(TypeCode::Int8, "z")])
            .create()
            .unwrap()
            .freeze()
            .unwrap();
        assert!(matches!(
            val.update("arbitrary.sarr", vec![stranger]),
            Err(Error::NoConvert)
        ));
    }

    #[test]
    fn union_selection() {
        let mut val = simple_def().create().unwrap();

        val.update("choice->b", "test").unwrap();
        assert!(val.field("choice").is_marked());
        // automatic dereference on read
        assert_eq!(val.field("choice").load::<String>().unwrap(), "test");
        assert_eq!(val.field("choice->b").load::<String>().unwrap(), "test");

        // re-select the other member
        val.update("choice->a", 1.5f32).unwrap();
        assert_eq!(val.field("choice").load::<f64>().unwrap(), 1.5);

        // an immutable view refuses the unselected member
        let snap = val.deep_clone().freeze().unwrap();
        assert!(!snap.field("choice->b").valid());
        assert_eq!(snap.field("choice->a").load::<f32>().unwrap(), 1.5);
    }

    #[test]
    fn any_holds_arbitrary_values() {
        let mut val = simple_def().create().unwrap();

        let mut v = TypeDef::scalar(TypeCode::UInt32).create().unwrap();
        v.store(42u32).unwrap();
        val.field("any").store(v.freeze().unwrap()).unwrap();

        let snap = val.deep_clone().freeze().unwrap();
        assert_eq!(snap.field("any").load::<u64>().unwrap(), 42);
        assert_eq!(snap.field("any->").load::<u32>().unwrap(), 42);
    }

    #[test]
    fn traversal_parent_ascent() {
        let top = scalar_struct().create().unwrap();

        assert!(!top.field("<").valid());
        let back = top.field("value<");
        assert!(back.same_instance(&top));

        let sevr1 = top.field("alarm.severity");
        let sevr2 = top.field("value<alarm.status<severity");
        assert!(sevr1.same_instance(&sevr2));
    }

    #[test]
    fn mark_idempotence() {
        let top = scalar_struct().create().unwrap();
        let mut v = top.field("value");
        v.mark();
        v.mark();
        assert!(v.is_marked());
        v.unmark();
        assert!(!v.is_marked());
    }

    #[test]
    fn mark_deep_queries() {
        let mut top = scalar_struct().create().unwrap();
        top.update("alarm.severity", 3i32).unwrap();
        assert!(!top.field("alarm.status").is_marked_deep(true, true));
        assert!(top.field("alarm").is_marked_deep(true, true));
        assert!(!top.field("alarm").is_marked_deep(true, false));
    }

    #[test]
    fn marked_iteration_covers_subtrees() {
        let mut top = scalar_struct().create().unwrap();
        let count = |v: &MValue| {
            let mut n = 0;
            v.for_each_marked(|_| n += 1);
            n
        };
        assert_eq!(count(&top), 0);

        top.field("alarm.status").mark();
        assert_eq!(count(&top), 1);

        top.field("alarm.status").unmark();
        top.field("alarm").mark();
        // a marked struct covers its whole subtree
        assert_eq!(count(&top), 4);

        top.field("alarm").unmark();
        top.field("value").mark();
        top.field("alarm.status").mark();
        top.field("alarm.message").mark();
        assert_eq!(count(&top), 3);
    }

    #[test]
    fn unmark_walks_parents_and_children() {
        let mut top = scalar_struct().create().unwrap();
        top.update("alarm.severity", 1i32).unwrap();
        top.field("alarm").mark();
        top.mark();

        top.field("alarm.severity").unmark_deep(true, false);
        assert!(!top.field("alarm").is_marked());
        assert!(!top.is_marked());

        top.field("alarm").mark();
        top.update("alarm.severity", 1i32).unwrap();
        top.field("alarm").unmark_deep(false, true);
        assert!(!top.field("alarm.severity").is_marked());
    }

    #[test]
    fn clone_freeze_thaw_roundtrip() {
        let mut m = scalar_struct().create().unwrap();
        m.update("value", 6.25).unwrap();
        m.update("alarm.message", "boo").unwrap();
        m.field("alarm").mark();

        let back = m.deep_clone().freeze().unwrap().thaw();
        assert_eq!(back, m);
    }

    #[test]
    fn freeze_requires_sole_ownership() {
        let m = scalar_struct().create().unwrap();
        let alias = m.clone();
        assert!(matches!(m.freeze(), Err(Error::Aliased)));
        drop(alias);

        let m2 = scalar_struct().create().unwrap();
        let frozen = m2.freeze().unwrap();
        // shared immutable thaw deep-clones
        let keep = frozen.clone();
        let thawed = frozen.thaw();
        assert_eq!(thawed, keep.clone().thaw());
        assert!(!thawed.same_instance(&keep.thaw()));
    }

    #[test]
    fn assign_copies_marked_leaves() {
        let def = scalar_struct();
        let mut src = def.create().unwrap();
        src.update("value", 1.5).unwrap();
        src.update("alarm.severity", 3i32).unwrap();

        let mut dst = def.create().unwrap();
        dst.update("alarm.message", "keep me").unwrap();
        dst.assign(&src.freeze().unwrap()).unwrap();

        assert_eq!(dst.field("value").load::<f64>().unwrap(), 1.5);
        assert_eq!(dst.field("alarm.severity").load::<i32>().unwrap(), 3);
        // unmarked source leaves leave the destination untouched
        assert_eq!(dst.field("alarm.message").load::<String>().unwrap(), "keep me");
    }

    #[test]
    fn assign_scalar_conversion() {
        let a = TypeDef::structure("s", vec![Member::new(TypeCode::Int64, "v")])
            .create()
            .unwrap();
        let mut b = TypeDef::scalar(TypeCode::UInt32).create().unwrap();
        b.store(7u32).unwrap();
        let b = b.freeze().unwrap();

        let mut dst = a.field("v");
        dst.assign(&b).unwrap();
        assert_eq!(dst.load::<i64>().unwrap(), 7);

        // different kind families refuse
        let mut s = TypeDef::scalar(TypeCode::String).create().unwrap();
        s.store("nope").unwrap();
        assert!(matches!(
            a.field("v").assign(&s.freeze().unwrap()),
            Err(Error::NoConvert)
        ));
    }

    #[test]
    fn mutable_traversal_of_shared_member_is_refused() {
        let mut val = simple_def().create().unwrap();
        val.update("choice->b", "test").unwrap();

        // keep a second reference to the member tree
        let held: IValue = val.field("choice").load().unwrap();
        assert!(!val.field("choice->b").valid());
        drop(held);
        // solely owned again: thaw-in-place allowed
        assert!(val.field("choice->b").valid());
    }

    #[test]
    fn display_scalar_struct() {
        let mut val = scalar_struct().create().unwrap();
        val.update("value", 4.2).unwrap();
        let shown = val.to_string();
        assert!(shown.starts_with("struct \"simple_t\" {\n"));
        assert!(shown.contains("    double value = 4.2\n"));
        assert!(shown.contains("} alarm"));
    }
}
