//! Wire serialization of type descriptions and values.
//!
//! pvAccess selects byte order per message (a flag bit in the frame
//! header), so every primitive read/write here is parameterized by
//! endianness rather than fixed at compile time. Lengths use the protocol's
//! three-tier size encoding, and type descriptions are deduplicated per
//! connection direction through a 16-bit cache id
//! (`0xFD` declare / `0xFE` reference / `0xFF` null / inline otherwise).
//!
//! The functions here operate on complete message bodies; reassembly of
//! segmented frames happens in [`crate::messages`] before any of this code
//! runs, so a decode failure can never leave a half-consumed stream.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::Error;
use crate::sharedarray::SharedArray;
use crate::typedesc::{Member, TypeCode, TypeDesc};
use crate::value::{FieldStorage, IValue, MValue, Store, StructTop};

/// Endian-parameterized writer over a [`BytesMut`].
pub struct TxBuf<'a> {
    out: &'a mut BytesMut,
    be: bool,
}

impl<'a> TxBuf<'a> {
    pub fn new(out: &'a mut BytesMut, be: bool) -> TxBuf<'a> {
        TxBuf { out, be }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.out.put_u8(v);
    }
    pub fn put_i8(&mut self, v: i8) {
        self.out.put_i8(v);
    }

    /// Variable-length size: `<254` in one byte, then 4-byte, then 8-byte.
    pub fn put_size(&mut self, n: usize) {
        if n < 254 {
            self.put_u8(n as u8);
        } else if n <= u32::MAX as usize {
            self.put_u8(254);
            self.put_u32(n as u32);
        } else {
            self.put_u8(255);
            self.put_u64(n as u64);
        }
    }

    /// A size or the null selector (`0xFF`).
    pub fn put_selector(&mut self, v: Option<usize>) {
        match v {
            None => self.put_u8(0xff),
            Some(n) => self.put_size(n),
        }
    }

    pub fn put_string(&mut self, s: &str) {
        self.put_size(s.len());
        self.out.put_slice(s.as_bytes());
    }
}

macro_rules! tx_primitive {
    ($name:ident, $typ:ty, $be:ident, $le:ident) => {
        impl<'a> TxBuf<'a> {
            pub fn $name(&mut self, v: $typ) {
                if self.be {
                    self.out.$be(v);
                } else {
                    self.out.$le(v);
                }
            }
        }
    };
}

tx_primitive!(put_u16, u16, put_u16, put_u16_le);
tx_primitive!(put_u32, u32, put_u32, put_u32_le);
tx_primitive!(put_u64, u64, put_u64, put_u64_le);
tx_primitive!(put_i16, i16, put_i16, put_i16_le);
tx_primitive!(put_i32, i32, put_i32, put_i32_le);
tx_primitive!(put_i64, i64, put_i64, put_i64_le);
tx_primitive!(put_f32, f32, put_f32, put_f32_le);
tx_primitive!(put_f64, f64, put_f64, put_f64_le);

/// Endian-parameterized reader over a byte slice. Every accessor is
/// bounds-checked and fails with [`Error::Protocol`] rather than panicking.
#[derive(Clone, Copy)]
pub struct RxBuf<'a> {
    input: &'a [u8],
    be: bool,
}

impl<'a> RxBuf<'a> {
    pub fn new(input: &'a [u8], be: bool) -> RxBuf<'a> {
        RxBuf { input, be }
    }

    pub fn remaining(&self) -> usize {
        self.input.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }

    fn need(&self, n: usize) -> Result<(), Error> {
        if self.input.len() < n {
            Err(Error::Protocol("message body truncated"))
        } else {
            Ok(())
        }
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        self.need(n)?;
        let (head, rest) = self.input.split_at(n);
        self.input = rest;
        Ok(head)
    }

    pub fn get_u8(&mut self) -> Result<u8, Error> {
        self.need(1)?;
        Ok(self.input.get_u8())
    }

    pub fn get_i8(&mut self) -> Result<i8, Error> {
        self.need(1)?;
        Ok(self.input.get_i8())
    }

    pub fn get_size(&mut self) -> Result<usize, Error> {
        match self.get_u8()? {
            254 => Ok(self.get_u32()? as usize),
            255 => {
                let v = self.get_u64()?;
                usize::try_from(v).map_err(|_| Error::Protocol("size out of range"))
            }
            b => Ok(b as usize),
        }
    }

    /// A size or the null selector (`0xFF`).
    pub fn get_selector(&mut self) -> Result<Option<usize>, Error> {
        match self.get_u8()? {
            0xff => Ok(None),
            254 => Ok(Some(self.get_u32()? as usize)),
            b => Ok(Some(b as usize)),
        }
    }

    pub fn get_string(&mut self) -> Result<String, Error> {
        let n = self.get_size()?;
        let raw = self.take(n)?;
        String::from_utf8(raw.to_vec()).map_err(|_| Error::Protocol("invalid utf-8 in string"))
    }
}

macro_rules! rx_primitive {
    ($name:ident, $typ:ty, $width:expr, $be:ident, $le:ident) => {
        impl<'a> RxBuf<'a> {
            pub fn $name(&mut self) -> Result<$typ, Error> {
                self.need($width)?;
                Ok(if self.be {
                    self.input.$be()
                } else {
                    self.input.$le()
                })
            }
        }
    };
}

rx_primitive!(get_u16, u16, 2, get_u16, get_u16_le);
rx_primitive!(get_u32, u32, 4, get_u32, get_u32_le);
rx_primitive!(get_u64, u64, 8, get_u64, get_u64_le);
rx_primitive!(get_i16, i16, 2, get_i16, get_i16_le);
rx_primitive!(get_i32, i32, 4, get_i32, get_i32_le);
rx_primitive!(get_i64, i64, 8, get_i64, get_i64_le);
rx_primitive!(get_f32, f32, 4, get_f32, get_f32_le);
rx_primitive!(get_f64, f64, 8, get_f64, get_f64_le);

/// Bit set addressing storage cells: bit `i` lives at byte `i/8`, bit
/// `i%8`. Serialized as a byte count followed by the bytes, trailing
/// zero bytes trimmed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BitMask {
    bytes: Vec<u8>,
}

impl BitMask {
    pub fn with_bits(nbits: usize) -> BitMask {
        BitMask {
            bytes: vec![0; nbits.div_ceil(8)],
        }
    }

    pub fn set(&mut self, i: usize) {
        if i / 8 >= self.bytes.len() {
            self.bytes.resize(i / 8 + 1, 0);
        }
        self.bytes[i / 8] |= 1 << (i % 8);
    }

    pub fn get(&self, i: usize) -> bool {
        self.bytes
            .get(i / 8)
            .is_some_and(|b| b & (1 << (i % 8)) != 0)
    }

    pub fn highest_set(&self) -> Option<usize> {
        for (i, b) in self.bytes.iter().enumerate().rev() {
            if *b != 0 {
                return Some(i * 8 + (7 - b.leading_zeros() as usize));
            }
        }
        None
    }

    pub fn to_wire(&self, buf: &mut TxBuf) {
        let used = self
            .bytes
            .iter()
            .rposition(|b| *b != 0)
            .map(|i| i + 1)
            .unwrap_or(0);
        buf.put_size(used);
        for b in &self.bytes[..used] {
            buf.put_u8(*b);
        }
    }

    pub fn from_wire(rx: &mut RxBuf) -> Result<BitMask, Error> {
        let n = rx.get_size()?;
        Ok(BitMask {
            bytes: rx.take(n)?.to_vec(),
        })
    }
}

/// Send-side per-connection-direction type cache. Keyed by the structural
/// hash, with mandatory equality verification on every hit.
#[derive(Debug, Default)]
pub struct TypeCache {
    entries: HashMap<u64, Vec<(u16, Arc<TypeDesc>)>>,
    next_id: u16,
}

impl TypeCache {
    fn lookup(&self, dtype: &Arc<TypeDesc>) -> Option<u16> {
        self.entries.get(&dtype.hash())?.iter().find_map(|(id, t)| {
            (Arc::ptr_eq(t, dtype) || t == dtype).then_some(*id)
        })
    }

    fn assign(&mut self, dtype: &Arc<TypeDesc>) -> u16 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.entries
            .entry(dtype.hash())
            .or_default()
            .push((id, dtype.clone()));
        id
    }
}

/// Receive-side cache: populated on `0xFD`, read on `0xFE`. Lookups return
/// the identical [`Arc`] every time.
#[derive(Debug, Default)]
pub struct TypeStore {
    entries: HashMap<u16, Arc<TypeDesc>>,
}

impl TypeStore {
    pub fn insert(&mut self, id: u16, dtype: Arc<TypeDesc>) {
        self.entries.insert(id, dtype);
    }

    pub fn get(&self, id: u16) -> Option<Arc<TypeDesc>> {
        self.entries.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// -------- type description --------

fn encode_inline(buf: &mut TxBuf, dtype: &TypeDesc, index: usize) {
    let node = dtype.node(index);
    buf.put_u8(node.code as u8);
    match node.code {
        TypeCode::Struct | TypeCode::Union => {
            buf.put_string(&node.id);
            buf.put_size(node.miter.len());
            for (name, off) in &node.miter {
                buf.put_string(name);
                if node.code == TypeCode::Struct {
                    encode_inline(buf, dtype, index + off);
                } else {
                    encode_inline(buf, &node.members[*off], 0);
                }
            }
        }
        TypeCode::StructA | TypeCode::UnionA => {
            encode_inline(buf, &node.members[0], 0);
        }
        _ => {}
    }
}

/// Emit a type description, deduplicating through `cache` when provided:
/// the first use of a type declares it (`0xFD id <inline>`), later uses
/// reference it (`0xFE id`).
pub fn to_wire_type(buf: &mut TxBuf, dtype: &Arc<TypeDesc>, cache: Option<&mut TypeCache>) {
    match cache {
        None => encode_inline(buf, dtype, 0),
        Some(cache) => {
            if let Some(id) = cache.lookup(dtype) {
                buf.put_u8(0xfe);
                buf.put_u16(id);
            } else {
                let id = cache.assign(dtype);
                buf.put_u8(0xfd);
                buf.put_u16(id);
                encode_inline(buf, dtype, 0);
            }
        }
    }
}

/// Rebuild a [`Member`] tree from a cached descriptor so it can be spliced
/// into an enclosing inline declaration.
fn desc_to_member(name: &str, dtype: &TypeDesc, index: usize) -> Member {
    let node = dtype.node(index);
    let mut m = Member::new(node.code, name);
    m.id = node.id.clone();
    match node.code {
        TypeCode::Struct => {
            for (child, off) in &node.miter {
                m.children.push(desc_to_member(child, dtype, index + off));
            }
        }
        TypeCode::Union => {
            for (child, mi) in &node.miter {
                m.children.push(desc_to_member(child, &node.members[*mi], 0));
            }
        }
        TypeCode::StructA | TypeCode::UnionA => {
            let elem = &node.members[0];
            m.id = elem.root().id.clone();
            let inner = desc_to_member(name, elem, 0);
            m.children = inner.children;
        }
        _ => {}
    }
    m
}

/// Decode one member, accepting the full selector grammar (`0xFF`, `0xFE`,
/// `0xFD`, inline) at any nesting depth.
fn decode_member(
    rx: &mut RxBuf,
    store: &mut TypeStore,
    name: &str,
    depth: usize,
) -> Result<Option<Member>, Error> {
    if depth > 64 {
        return Err(Error::Protocol("type description too deeply nested"));
    }
    match rx.get_u8()? {
        0xff => Ok(None),
        0xfe => {
            let id = rx.get_u16()?;
            let cached = store
                .get(id)
                .ok_or(Error::Protocol("reference to unknown cached type"))?;
            Ok(Some(desc_to_member(name, &cached, 0)))
        }
        0xfd => {
            let id = rx.get_u16()?;
            let m = decode_inline_member(rx, store, name, None, depth)?;
            store.insert(id, Arc::new(TypeDesc::from_member(&m)?));
            Ok(Some(m))
        }
        code => Ok(Some(decode_inline_member(
            rx,
            store,
            name,
            Some(code),
            depth,
        )?)),
    }
}

fn decode_inline_member(
    rx: &mut RxBuf,
    store: &mut TypeStore,
    name: &str,
    code: Option<u8>,
    depth: usize,
) -> Result<Member, Error> {
    let code = match code {
        Some(c) => c,
        None => rx.get_u8()?,
    };
    let code = TypeCode::try_from(code)?;
    let mut m = Member::new(code, name);
    match code {
        TypeCode::Struct | TypeCode::Union => {
            m.id = rx.get_string()?;
            let count = rx.get_size()?;
            for _ in 0..count {
                let child_name = rx.get_string()?;
                let child = decode_member(rx, store, &child_name, depth + 1)?
                    .ok_or(Error::Protocol("null type for structure member"))?;
                m.children.push(child);
            }
        }
        TypeCode::StructA | TypeCode::UnionA => {
            let elem = decode_member(rx, store, "", depth + 1)?
                .ok_or(Error::Protocol("null element type for compound array"))?;
            if elem.code != code.scalar_of()? {
                return Err(Error::Protocol("compound array element type mismatch"));
            }
            m.id = elem.id;
            m.children = elem.children;
        }
        _ => {}
    }
    Ok(m)
}

/// Decode a type description; `None` for the `0xFF` null type.
pub fn from_wire_type(
    rx: &mut RxBuf,
    store: &mut TypeStore,
) -> Result<Option<Arc<TypeDesc>>, Error> {
    // Peek the selector so cache references return the cached Arc itself
    // rather than an equal copy.
    let saved = *rx;
    match rx.get_u8()? {
        0xff => Ok(None),
        0xfe => {
            let id = rx.get_u16()?;
            store
                .get(id)
                .map(Some)
                .ok_or(Error::Protocol("reference to unknown cached type"))
        }
        0xfd => {
            let id = rx.get_u16()?;
            let m = decode_inline_member(rx, store, "", None, 0)?;
            let dtype = Arc::new(TypeDesc::from_member(&m)?);
            store.insert(id, dtype.clone());
            Ok(Some(dtype))
        }
        _ => {
            *rx = saved;
            let m = decode_member(rx, store, "", 0)?;
            match m {
                None => Ok(None),
                Some(m) => Ok(Some(Arc::new(TypeDesc::from_member(&m)?))),
            }
        }
    }
}

// -------- values --------

fn snapshot(top: &StructTop) -> Vec<FieldStorage> {
    top.cells.lock().unwrap().clone()
}

fn encode_scalar(buf: &mut TxBuf, code: TypeCode, store: &Store) -> Result<(), Error> {
    match (code, store) {
        (TypeCode::Bool, Store::Bool(v)) => buf.put_u8(*v as u8),
        (TypeCode::Int8, Store::Integer(v)) => buf.put_i8(*v as i8),
        (TypeCode::Int16, Store::Integer(v)) => buf.put_i16(*v as i16),
        (TypeCode::Int32, Store::Integer(v)) => buf.put_i32(*v as i32),
        (TypeCode::Int64, Store::Integer(v)) => buf.put_i64(*v),
        (TypeCode::UInt8, Store::UInteger(v)) => buf.put_u8(*v as u8),
        (TypeCode::UInt16, Store::UInteger(v)) => buf.put_u16(*v as u16),
        (TypeCode::UInt32, Store::UInteger(v)) => buf.put_u32(*v as u32),
        (TypeCode::UInt64, Store::UInteger(v)) => buf.put_u64(*v),
        (TypeCode::Float32, Store::Real(v)) => buf.put_f32(*v as f32),
        (TypeCode::Float64, Store::Real(v)) => buf.put_f64(*v),
        (TypeCode::String, Store::String(v)) => buf.put_string(v),
        _ => return Err(Error::Protocol("storage does not match descriptor")),
    }
    Ok(())
}

fn decode_scalar(rx: &mut RxBuf, code: TypeCode) -> Result<Store, Error> {
    Ok(match code {
        TypeCode::Bool => Store::Bool(rx.get_u8()? != 0),
        TypeCode::Int8 => Store::Integer(rx.get_i8()? as i64),
        TypeCode::Int16 => Store::Integer(rx.get_i16()? as i64),
        TypeCode::Int32 => Store::Integer(rx.get_i32()? as i64),
        TypeCode::Int64 => Store::Integer(rx.get_i64()?),
        TypeCode::UInt8 => Store::UInteger(rx.get_u8()? as u64),
        TypeCode::UInt16 => Store::UInteger(rx.get_u16()? as u64),
        TypeCode::UInt32 => Store::UInteger(rx.get_u32()? as u64),
        TypeCode::UInt64 => Store::UInteger(rx.get_u64()?),
        TypeCode::Float32 => Store::Real(rx.get_f32()? as f64),
        TypeCode::Float64 => Store::Real(rx.get_f64()?),
        TypeCode::String => Store::String(rx.get_string()?),
        _ => return Err(Error::Protocol("not a scalar type code")),
    })
}

fn encode_scalar_array(buf: &mut TxBuf, code: TypeCode, arr: &SharedArray) -> Result<(), Error> {
    buf.put_size(arr.len());
    if arr.is_null() {
        return Ok(());
    }
    match (code, arr) {
        (TypeCode::BoolA, SharedArray::Bool(v)) => v.iter().for_each(|x| buf.put_u8(*x as u8)),
        (TypeCode::Int8A, SharedArray::Int8(v)) => v.iter().for_each(|x| buf.put_i8(*x)),
        (TypeCode::Int16A, SharedArray::Int16(v)) => v.iter().for_each(|x| buf.put_i16(*x)),
        (TypeCode::Int32A, SharedArray::Int32(v)) => v.iter().for_each(|x| buf.put_i32(*x)),
        (TypeCode::Int64A, SharedArray::Int64(v)) => v.iter().for_each(|x| buf.put_i64(*x)),
        (TypeCode::UInt8A, SharedArray::UInt8(v)) => v.iter().for_each(|x| buf.put_u8(*x)),
        (TypeCode::UInt16A, SharedArray::UInt16(v)) => v.iter().for_each(|x| buf.put_u16(*x)),
        (TypeCode::UInt32A, SharedArray::UInt32(v)) => v.iter().for_each(|x| buf.put_u32(*x)),
        (TypeCode::UInt64A, SharedArray::UInt64(v)) => v.iter().for_each(|x| buf.put_u64(*x)),
        (TypeCode::Float32A, SharedArray::Float32(v)) => v.iter().for_each(|x| buf.put_f32(*x)),
        (TypeCode::Float64A, SharedArray::Float64(v)) => v.iter().for_each(|x| buf.put_f64(*x)),
        (TypeCode::StringA, SharedArray::String(v)) => v.iter().for_each(|x| buf.put_string(x)),
        _ => return Err(Error::Protocol("array storage does not match descriptor")),
    }
    Ok(())
}

fn decode_scalar_array(rx: &mut RxBuf, code: TypeCode, count: usize) -> Result<SharedArray, Error> {
    macro_rules! gather {
        ($get:ident) => {{
            let mut v = Vec::with_capacity(count.min(0x10000));
            for _ in 0..count {
                v.push(rx.$get()?);
            }
            SharedArray::from_vec(v)
        }};
        ($get:ident, $conv:expr) => {{
            let mut v = Vec::with_capacity(count.min(0x10000));
            for _ in 0..count {
                v.push($conv(rx.$get()?));
            }
            SharedArray::from_vec(v)
        }};
    }
    Ok(match code {
        TypeCode::BoolA => gather!(get_u8, |x: u8| x != 0),
        TypeCode::Int8A => gather!(get_i8),
        TypeCode::Int16A => gather!(get_i16),
        TypeCode::Int32A => gather!(get_i32),
        TypeCode::Int64A => gather!(get_i64),
        TypeCode::UInt8A => gather!(get_u8),
        TypeCode::UInt16A => gather!(get_u16),
        TypeCode::UInt32A => gather!(get_u32),
        TypeCode::UInt64A => gather!(get_u64),
        TypeCode::Float32A => gather!(get_f32),
        TypeCode::Float64A => gather!(get_f64),
        TypeCode::StringA => gather!(get_string),
        _ => return Err(Error::Protocol("not a scalar array type code")),
    })
}

/// Serialize the full subtree of one node, depth-first in `miter` order.
fn encode_node(
    buf: &mut TxBuf,
    dtype: &TypeDesc,
    abs: usize,
    cells: &[FieldStorage],
    cells_base: usize,
) -> Result<(), Error> {
    let node = dtype.node(abs);
    let cell = &cells[abs - cells_base];
    match node.code {
        TypeCode::Struct => {
            for (_, off) in &node.miter {
                encode_node(buf, dtype, abs + off, cells, cells_base)?;
            }
        }
        TypeCode::Union => {
            let Store::Compound(held) = &cell.store else {
                return Err(Error::Protocol("storage does not match descriptor"));
            };
            match held.parts() {
                None => buf.put_selector(None),
                Some((htop, hidx)) => {
                    let mi = node
                        .members
                        .iter()
                        .position(|m| {
                            Arc::ptr_eq(m, &htop.dtype)
                                || crate::typedesc::subtree_matches(
                                    &htop.dtype,
                                    htop.base + hidx,
                                    m,
                                    0,
                                )
                        })
                        .ok_or(Error::Protocol("union selection not a member"))?;
                    buf.put_selector(Some(mi));
                    encode_tree(buf, held)?;
                }
            }
        }
        TypeCode::Any => {
            let Store::Compound(held) = &cell.store else {
                return Err(Error::Protocol("storage does not match descriptor"));
            };
            match held.parts() {
                None => buf.put_u8(0xff),
                Some((htop, hidx)) => {
                    let htype = Arc::new(htop.dtype.extract(htop.base + hidx));
                    encode_inline(buf, &htype, 0);
                    encode_tree(buf, held)?;
                }
            }
        }
        TypeCode::StructA | TypeCode::UnionA | TypeCode::AnyA => {
            let Store::Array(arr) = &cell.store else {
                return Err(Error::Protocol("storage does not match descriptor"));
            };
            if arr.is_null() {
                buf.put_size(0);
            } else {
                let elems = arr
                    .as_slice::<IValue>()
                    .ok_or(Error::Protocol("array storage does not match descriptor"))?;
                buf.put_size(elems.len());
                for elem in elems {
                    match elem.parts() {
                        None => buf.put_u8(0),
                        Some((etop, eidx)) => {
                            buf.put_u8(1);
                            if node.code == TypeCode::AnyA {
                                let etype = Arc::new(etop.dtype.extract(etop.base + eidx));
                                encode_inline(buf, &etype, 0);
                            }
                            encode_tree(buf, elem)?;
                        }
                    }
                }
            }
        }
        code if code.is_array() => {
            let Store::Array(arr) = &cell.store else {
                return Err(Error::Protocol("storage does not match descriptor"));
            };
            encode_scalar_array(buf, code, arr)?;
        }
        code => encode_scalar(buf, code, &cell.store)?,
    }
    Ok(())
}

/// Serialize a whole held value (union member, any payload, array element).
fn encode_tree(buf: &mut TxBuf, val: &IValue) -> Result<(), Error> {
    let (top, idx) = val.parts().ok_or(Error::Protocol("incomplete value"))?;
    let snap = snapshot(top);
    encode_node(buf, &top.dtype, top.base + idx, &snap, top.base)
}

/// Serialize every field of `val`, depth-first.
pub fn to_wire_full(buf: &mut TxBuf, val: &IValue) -> Result<(), Error> {
    encode_tree(buf, val)
}

/// Serialize the valid-bit mask of `val` followed by only the marked
/// cells. A marked compound covers its whole subtree.
pub fn to_wire_valid(buf: &mut TxBuf, val: &IValue) -> Result<(), Error> {
    let (top, idx) = val.parts().ok_or(Error::Protocol("incomplete value"))?;
    let snap = snapshot(top);
    let base = top.base + idx;
    let size = top.dtype.node(base).size;

    let mut mask = BitMask::with_bits(size);
    for i in 0..size {
        if snap[base - top.base + i].valid {
            mask.set(i);
        }
    }
    mask.to_wire(buf);

    let mut pos = 0;
    while pos < size {
        if mask.get(pos) {
            let sub = top.dtype.node(base + pos).size;
            encode_node(buf, &top.dtype, base + pos, &snap, top.base)?;
            pos += sub;
        } else {
            pos += 1;
        }
    }
    Ok(())
}

/// Decode one subtree into the cells of `top`, marking decoded cells.
fn decode_node(
    rx: &mut RxBuf,
    store: &mut TypeStore,
    top: &Arc<StructTop>,
    abs: usize,
    cells: &mut [FieldStorage],
) -> Result<(), Error> {
    let node = top.dtype.node(abs);
    match node.code {
        TypeCode::Struct => {
            cells[abs - top.base].valid = true;
            for (_, off) in &node.miter {
                decode_node(rx, store, top, abs + off, cells)?;
            }
            return Ok(());
        }
        TypeCode::Union => {
            let held = match rx.get_selector()? {
                None => IValue::default(),
                Some(mi) => {
                    let member = node
                        .members
                        .get(mi)
                        .ok_or(Error::Protocol("union selector out of range"))?
                        .clone();
                    decode_tree(rx, store, member)?
                }
            };
            let cell = &mut cells[abs - top.base];
            cell.store = Store::Compound(held);
            cell.valid = true;
        }
        TypeCode::Any => {
            let held = match from_wire_type(rx, store)? {
                None => IValue::default(),
                Some(dtype) => decode_tree(rx, store, dtype)?,
            };
            let cell = &mut cells[abs - top.base];
            cell.store = Store::Compound(held);
            cell.valid = true;
        }
        TypeCode::StructA | TypeCode::UnionA | TypeCode::AnyA => {
            let count = rx.get_size()?;
            let mut elems = Vec::with_capacity(count.min(0x10000));
            for _ in 0..count {
                match rx.get_u8()? {
                    0 => elems.push(IValue::default()),
                    1 => {
                        let etype = if node.code == TypeCode::AnyA {
                            match from_wire_type(rx, store)? {
                                None => {
                                    elems.push(IValue::default());
                                    continue;
                                }
                                Some(t) => t,
                            }
                        } else {
                            node.members[0].clone()
                        };
                        elems.push(decode_tree(rx, store, etype)?);
                    }
                    _ => return Err(Error::Protocol("invalid array element flag")),
                }
            }
            let cell = &mut cells[abs - top.base];
            cell.store = Store::Array(SharedArray::from_vec(elems));
            cell.valid = true;
        }
        code if code.is_array() => {
            let count = rx.get_size()?;
            let arr = decode_scalar_array(rx, code, count)?;
            let cell = &mut cells[abs - top.base];
            cell.store = Store::Array(arr);
            cell.valid = true;
        }
        code => {
            let cell = &mut cells[abs - top.base];
            cell.store = decode_scalar(rx, code)?;
            cell.valid = true;
        }
    }
    Ok(())
}

/// Decode a freshly allocated value of `dtype` from the stream.
fn decode_tree(
    rx: &mut RxBuf,
    store: &mut TypeStore,
    dtype: Arc<TypeDesc>,
) -> Result<IValue, Error> {
    let val = MValue::instantiate(dtype);
    {
        let (top, idx) = val.parts().ok_or(Error::Protocol("incomplete value"))?;
        let top = top.clone();
        let mut cells = top.cells.lock().unwrap();
        decode_node(rx, store, &top, idx, &mut cells)?;
    }
    val.freeze()
}

/// Deserialize a full value into `val`, marking every decoded cell.
pub fn from_wire_full(
    rx: &mut RxBuf,
    store: &mut TypeStore,
    val: &mut MValue,
) -> Result<(), Error> {
    let (top, idx) = val.parts().ok_or(Error::Protocol("incomplete value"))?;
    let top = top.clone();
    let abs = top.base + idx;
    let mut cells = top.cells.lock().unwrap();
    decode_node(rx, store, &top, abs, &mut cells)
}

/// Deserialize a bit mask and the masked cells into `val`. Cells outside
/// the mask keep their previous contents and marks.
pub fn from_wire_valid(
    rx: &mut RxBuf,
    store: &mut TypeStore,
    val: &mut MValue,
) -> Result<(), Error> {
    let (top, idx) = val.parts().ok_or(Error::Protocol("incomplete value"))?;
    let top = top.clone();
    let base = top.base + idx;
    let size = top.dtype.node(base).size;

    let mask = BitMask::from_wire(rx)?;
    if let Some(high) = mask.highest_set()
        && high >= size
    {
        return Err(Error::Protocol("valid mask exceeds structure size"));
    }

    let mut cells = top.cells.lock().unwrap();
    let mut pos = 0;
    while pos < size {
        if mask.get(pos) {
            let sub = top.dtype.node(base + pos).size;
            decode_node(rx, store, &top, base + pos, &mut cells)?;
            pos += sub;
        } else {
            pos += 1;
        }
    }
    Ok(())
}

/// Deserialize a type description followed by a full value of that type
/// (the pvRequest shape). The null type yields the empty handle.
pub fn from_wire_type_value(rx: &mut RxBuf, store: &mut TypeStore) -> Result<MValue, Error> {
    match from_wire_type(rx, store)? {
        None => Ok(MValue::default()),
        Some(dtype) => {
            let mut val = MValue::instantiate(dtype);
            from_wire_full(rx, store, &mut val)?;
            Ok(val)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nt::NTScalar;
    use crate::typedesc::TypeDef;

    fn encode(be: bool, f: impl FnOnce(&mut TxBuf) -> Result<(), Error>) -> Vec<u8> {
        let mut out = BytesMut::new();
        let mut buf = TxBuf::new(&mut out, be);
        f(&mut buf).unwrap();
        out.to_vec()
    }

    fn frozen(val: &MValue) -> IValue {
        val.deep_clone().freeze().unwrap()
    }

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

    #[test]
    fn size_encoding() {
        let bytes = encode(true, |b| {
            b.put_size(7);
            b.put_size(253);
            b.put_size(254);
            b.put_size(0x12345678);
            Ok(())
        });
        assert_eq!(
            bytes,
            vec![7, 253, 254, 0, 0, 0, 254, 254, 0x12, 0x34, 0x56, 0x78]
        );

        let mut rx = RxBuf::new(&bytes, true);
        assert_eq!(rx.get_size().unwrap(), 7);
        assert_eq!(rx.get_size().unwrap(), 253);
        assert_eq!(rx.get_size().unwrap(), 254);
        assert_eq!(rx.get_size().unwrap(), 0x12345678);
        assert!(rx.is_empty());
    }

    #[test]
    fn bitmask_ops() {
        let mut mask = BitMask::with_bits(10);
        assert_eq!(mask.highest_set(), None);
        mask.set(1);
        mask.set(9);
        assert!(mask.get(1) && mask.get(9));
        assert!(!mask.get(2) && !mask.get(64));
        assert_eq!(mask.highest_set(), Some(9));

        let bytes = encode(true, |b| {
            mask.to_wire(b);
            Ok(())
        });
        assert_eq!(bytes, vec![0x02, 0x02, 0x02]);

        let mut rx = RxBuf::new(&bytes, true);
        let back = BitMask::from_wire(&mut rx).unwrap();
        assert_eq!(back, mask);
    }

    #[test]
    fn full_serialize_default_ntscalar() {
        let val = frozen(&NTScalar::new(TypeCode::UInt32).create().unwrap());
        let bytes = encode(true, |b| to_wire_full(b, &val));
        assert_eq!(bytes, vec![0u8; 29]);
    }

    #[test]
    fn masked_serialize_ntscalar() {
        let mut val = NTScalar::new(TypeCode::UInt32).create().unwrap();

        let bytes = encode(true, |b| to_wire_valid(b, &frozen(&val)));
        assert_eq!(bytes, b"\x00");

        val.update("value", 0xdeadbeefu32).unwrap();
        let bytes = encode(true, |b| to_wire_valid(b, &frozen(&val)));
        assert_eq!(bytes, b"\x01\x02\xde\xad\xbe\xef");

        val.field("value").unmark();
        let bytes = encode(true, |b| to_wire_valid(b, &frozen(&val)));
        assert_eq!(bytes, b"\x00");

        val.update("timeStamp.nanoseconds", 0xabi32).unwrap();
        val.update("alarm.message", "hello world").unwrap();
        let bytes = encode(true, |b| to_wire_valid(b, &frozen(&val)));
        assert_eq!(bytes, b"\x02\x20\x01\x0bhello world\x00\x00\x00\xab");
    }

    #[test]
    fn masked_deserialize_ntscalar() {
        let mut store = TypeStore::default();

        let mut val = NTScalar::new(TypeCode::UInt32).create().unwrap();
        let mut rx = RxBuf::new(b"\x00", true);
        from_wire_valid(&mut rx, &mut store, &mut val).unwrap();
        assert!(rx.is_empty());
        assert!(!val.field("value").is_marked());

        let mut val = NTScalar::new(TypeCode::UInt32).create().unwrap();
        let mut rx = RxBuf::new(b"\x01\x02\xde\xad\xbe\xef", true);
        from_wire_valid(&mut rx, &mut store, &mut val).unwrap();
        assert!(rx.is_empty());
        assert!(val.field("value").is_marked());
        assert!(!val.field("timeStamp.nanoseconds").is_marked());
        assert_eq!(val.field("value").load::<u32>().unwrap(), 0xdeadbeef);

        let mut val = NTScalar::new(TypeCode::UInt32).create().unwrap();
        let mut rx = RxBuf::new(b"\x02\x20\x01\x0bhello world\x00\x00\x00\xab", true);
        from_wire_valid(&mut rx, &mut store, &mut val).unwrap();
        assert!(rx.is_empty());
        assert!(!val.field("value").is_marked());
        assert!(val.field("timeStamp.nanoseconds").is_marked());
        assert!(val.field("alarm.message").is_marked());
        assert_eq!(val.field("value").load::<u32>().unwrap(), 0);
        assert_eq!(val.field("timeStamp.nanoseconds").load::<u32>().unwrap(), 0xab);
        assert_eq!(
            val.field("alarm.message").load::<String>().unwrap(),
            "hello world"
        );
    }

    #[test]
    fn mask_exceeding_tree_is_fatal() {
        let mut store = TypeStore::default();
        let mut val = NTScalar::new(TypeCode::UInt32).create().unwrap();
        // bit 10 of a 10-cell structure
        let mut rx = RxBuf::new(b"\x02\x00\x04", true);
        assert!(matches!(
            from_wire_valid(&mut rx, &mut store, &mut val),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn masked_struct_array() {
        let mut val = simple_def().create().unwrap();
        let fld = val.field("arbitrary.sarr");
        let mut e0 = fld.alloc_member().unwrap();
        e0.update("value", 0xdeadbeefu32).unwrap();
        let mut e1 = fld.alloc_member().unwrap();
        e1.update("value", 0x1badfaceu32).unwrap();
        val.update(
            "arbitrary.sarr",
            vec![e0.freeze().unwrap(), e1.freeze().unwrap(), IValue::default()],
        )
        .unwrap();

        let expect: &[u8] = b"\x01\x40\x03\x01\xde\xad\xbe\xef\x01\x1b\xad\xfa\xce\x00";
        let bytes = encode(true, |b| to_wire_valid(b, &frozen(&val)));
        assert_eq!(bytes, expect);

        let mut store = TypeStore::default();
        let mut back = simple_def().create().unwrap();
        let mut rx = RxBuf::new(expect, true);
        from_wire_valid(&mut rx, &mut store, &mut back).unwrap();
        assert!(rx.is_empty());
        assert!(!back.field("value").is_marked());
        assert!(back.field("arbitrary.sarr").is_marked());
        let snap = back.deep_clone().freeze().unwrap();
        assert_eq!(
            snap.field("arbitrary.sarr[0]value").load::<u32>().unwrap(),
            0xdeadbeef
        );
        assert_eq!(
            snap.field("arbitrary.sarr[1]value").load::<u32>().unwrap(),
            0x1badface
        );
        assert_eq!(snap.field("arbitrary.sarr[2]value").type_code(), TypeCode::Null);
    }

    #[test]
    fn masked_union() {
        let mut val = simple_def().create().unwrap();
        val.update("choice->b", "test").unwrap();
        assert!(val.field("choice").is_marked());

        let expect: &[u8] = b"\x02\x00\x02\x01\x04test";
        let bytes = encode(true, |b| to_wire_valid(b, &frozen(&val)));
        assert_eq!(bytes, expect);

        let mut store = TypeStore::default();
        let mut back = simple_def().create().unwrap();
        let mut rx = RxBuf::new(expect, true);
        from_wire_valid(&mut rx, &mut store, &mut back).unwrap();
        assert!(rx.is_empty());
        assert!(back.field("choice").is_marked());
        assert_eq!(back.field("choice").load::<String>().unwrap(), "test");
    }

    #[test]
    fn masked_union_array() {
        let mut val = simple_def().create().unwrap();
        let fld = val.field("achoice");
        let mut e0 = fld.alloc_member().unwrap();
        e0.update("->x", "theX").unwrap();
        let mut e1 = fld.alloc_member().unwrap();
        e1.update("->y", "theY").unwrap();
        val.update(
            "achoice",
            vec![e0.freeze().unwrap(), e1.freeze().unwrap(), IValue::default()],
        )
        .unwrap();

        let expect: &[u8] = b"\x02\x00\x04\x03\x01\x00\x04theX\x01\x01\x04theY\x00";
        let bytes = encode(true, |b| to_wire_valid(b, &frozen(&val)));
        assert_eq!(bytes, expect);

        let mut store = TypeStore::default();
        let mut back = simple_def().create().unwrap();
        let mut rx = RxBuf::new(expect, true);
        from_wire_valid(&mut rx, &mut store, &mut back).unwrap();
        assert!(rx.is_empty());
        assert!(back.field("achoice").is_marked());
        let snap = back.deep_clone().freeze().unwrap();
        assert_eq!(snap.field("achoice[0]").load::<String>().unwrap(), "theX");
        assert_eq!(snap.field("achoice[1]").load::<String>().unwrap(), "theY");
        assert_eq!(snap.field("achoice[2]").type_code(), TypeCode::Null);
    }

    #[test]
    fn masked_any() {
        let mut val = simple_def().create().unwrap();
        let mut held = TypeDef::scalar(TypeCode::UInt32).create().unwrap();
        held.store(0x600df00du32).unwrap();
        val.field("any").store(held.freeze().unwrap()).unwrap();

        let expect: &[u8] = b"\x01\x80\x26\x60\x0d\xf0\x0d";
        let bytes = encode(true, |b| to_wire_valid(b, &frozen(&val)));
        assert_eq!(bytes, expect);

        let mut store = TypeStore::default();
        let mut back = simple_def().create().unwrap();
        let mut rx = RxBuf::new(expect, true);
        from_wire_valid(&mut rx, &mut store, &mut back).unwrap();
        assert!(rx.is_empty());
        assert!(back.field("any").is_marked());
        assert_eq!(back.field("any").load::<u32>().unwrap(), 0x600df00d);
    }

    #[test]
    fn masked_any_unset() {
        let mut val = simple_def().create().unwrap();
        val.field("any").mark();

        let expect: &[u8] = b"\x01\x80\xff";
        let bytes = encode(true, |b| to_wire_valid(b, &frozen(&val)));
        assert_eq!(bytes, expect);

        let mut store = TypeStore::default();
        let mut back = simple_def().create().unwrap();
        let mut rx = RxBuf::new(expect, true);
        from_wire_valid(&mut rx, &mut store, &mut back).unwrap();
        assert!(rx.is_empty());
        assert!(back.field("any").is_marked());
        assert!(matches!(
            back.field("any").load::<u32>(),
            Err(Error::NoConvert)
        ));
    }

    #[test]
    fn masked_any_array() {
        let mut val = simple_def().create().unwrap();
        let mut e0 = TypeDef::scalar(TypeCode::UInt32).create().unwrap();
        e0.store(0x7bu32).unwrap();
        let mut e1 = TypeDef::structure("", vec![Member::new(TypeCode::String, "q")])
            .create()
            .unwrap();
        e1.update("q", "theq").unwrap();
        val.update(
            "anya",
            vec![e0.freeze().unwrap(), e1.freeze().unwrap(), IValue::default()],
        )
        .unwrap();

        let expect: &[u8] =
            b"\x02\x00\x01\x03\x01\x26\x00\x00\x00\x7b\x01\x80\x00\x01\x01q\x60\x04theq\x00";
        let bytes = encode(true, |b| to_wire_valid(b, &frozen(&val)));
        assert_eq!(bytes, expect);

        let mut store = TypeStore::default();
        let mut back = simple_def().create().unwrap();
        let mut rx = RxBuf::new(expect, true);
        from_wire_valid(&mut rx, &mut store, &mut back).unwrap();
        assert!(rx.is_empty());
        assert!(back.field("anya").is_marked());
        let snap = back.deep_clone().freeze().unwrap();
        assert_eq!(snap.field("anya[0]").load::<u32>().unwrap(), 0x7b);
        assert_eq!(snap.field("anya[1]q").load::<String>().unwrap(), "theq");
        assert_eq!(snap.field("anya[2]").type_code(), TypeCode::Null);
    }

    #[test]
    fn full_roundtrip_is_stable() {
        for be in [true, false] {
            let mut val = simple_def().create().unwrap();
            val.update("value", vec![1.0f64, 2.0]).unwrap();
            val.update("timeStamp.secondsPastEpoch", 0x123456789abcdef0u64)
                .unwrap();
            val.update("choice->a", 4.0f32).unwrap();
            let val = val.freeze().unwrap();

            let bytes = encode(be, |b| to_wire_full(b, &val));

            let mut store = TypeStore::default();
            let mut back = simple_def().create().unwrap();
            let mut rx = RxBuf::new(&bytes, be);
            from_wire_full(&mut rx, &mut store, &mut back).unwrap();
            assert!(rx.is_empty());

            assert_eq!(
                back.field("timeStamp.secondsPastEpoch").load::<u64>().unwrap(),
                0x123456789abcdef0
            );
            assert_eq!(
                back.field("value")
                    .load::<SharedArray>()
                    .unwrap()
                    .as_slice::<f64>(),
                Some(&[1.0, 2.0][..])
            );

            let again = encode(be, |b| to_wire_full(b, &back.freeze().unwrap()));
            assert_eq!(bytes, again);
        }
    }

    #[test]
    fn type_cache_declares_then_references() {
        let dtype = NTScalar::new(TypeCode::Int32).build().build().unwrap();
        let mut cache = TypeCache::default();

        let first = encode(true, |b| {
            to_wire_type(b, &dtype, Some(&mut cache));
            Ok(())
        });
        assert_eq!(first[0], 0xfd);
        assert_eq!(&first[1..3], &[0x00, 0x00]);

        let second = encode(true, |b| {
            to_wire_type(b, &dtype, Some(&mut cache));
            Ok(())
        });
        assert_eq!(second, vec![0xfe, 0x00, 0x00]);

        // structurally equal but separately built descriptors hit the cache
        let rebuilt = NTScalar::new(TypeCode::Int32).build().build().unwrap();
        let third = encode(true, |b| {
            to_wire_type(b, &rebuilt, Some(&mut cache));
            Ok(())
        });
        assert_eq!(third, vec![0xfe, 0x00, 0x00]);

        // a different type gets a fresh id
        let other = TypeDef::scalar(TypeCode::Float64).build().unwrap();
        let fourth = encode(true, |b| {
            to_wire_type(b, &other, Some(&mut cache));
            Ok(())
        });
        assert_eq!(fourth[0], 0xfd);
        assert_eq!(&fourth[1..3], &[0x00, 0x01]);

        // decoding: the reference resolves to the identical Arc
        let mut store = TypeStore::default();
        let mut rx = RxBuf::new(&first, true);
        let a = from_wire_type(&mut rx, &mut store).unwrap().unwrap();
        assert!(rx.is_empty());
        assert_eq!(*a, *dtype);

        let mut rx = RxBuf::new(&second, true);
        let b = from_wire_type(&mut rx, &mut store).unwrap().unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        // reference to an id never declared is fatal
        let mut rx = RxBuf::new(&[0xfe, 0x12, 0x34], true);
        assert!(matches!(
            from_wire_type(&mut rx, &mut store),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn without_cache_types_are_inline() {
        let dtype = TypeDef::scalar(TypeCode::UInt32).build().unwrap();
        let bytes = encode(true, |b| {
            to_wire_type(b, &dtype, None);
            Ok(())
        });
        assert_eq!(bytes, vec![0x26]);
    }

    #[test]
    fn nested_cache_declarations_decode() {
        // A pvRequest captured from a peer which declares every nested
        // struct in its cache, little-endian.
        let input: &[u8] = b"\xfd\x02\x00\x80\x00\x01\x06\x72\x65\x63\x6f\x72\x64\xfd\x03\x00\x80\x00\
\x01\x08\x5f\x6f\x70\x74\x69\x6f\x6e\x73\xfd\x04\x00\x80\x00\x02\x09\x71\
\x75\x65\x75\x65\x53\x69\x7a\x65\x60\x08\x70\x69\x70\x65\x6c\x69\x6e\x65\
\x60\x01\x34\x04\x74\x72\x75\x65";

        let mut store = TypeStore::default();
        let mut rx = RxBuf::new(input, false);
        let val = from_wire_type_value(&mut rx, &mut store).unwrap();
        assert!(rx.is_empty());
        assert_eq!(store.len(), 3);
        assert_eq!(
            val.field("record._options.pipeline").load::<String>().unwrap(),
            "true"
        );
        assert_eq!(
            val.field("record._options.queueSize").load::<String>().unwrap(),
            "4"
        );
    }
}
