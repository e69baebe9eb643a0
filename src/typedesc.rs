//! Self-describing type descriptors for pvAccess structured values.
//!
//! A [`TypeDesc`] is a flat, depth-first array of [`FieldDesc`] nodes
//! describing one (possibly nested) structure. All offsets stored in a node
//! point forward within the same array, so a descriptor can be walked
//! without ever jumping back. Members of a `Union` and the element types of
//! `StructA`/`UnionA` live in their own [`TypeDesc`] trees, because their
//! storage is allocated separately from the enclosing structure.
//!
//! Descriptors are built either programmatically through [`TypeDef`] and
//! [`Member`], or from the wire (see [`crate::wire`]).

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use crate::error::Error;

/// Groups of related type codes, from the top three bits of the code.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum Kind {
    Bool = 0x00,
    Integer = 0x20,
    Real = 0x40,
    String = 0x60,
    Compound = 0x80,
    Null = 0xe0,
}

/// A complete single-byte pvAccess type code.
///
/// Bit 0x08 marks the array form, bit 0x04 marks unsigned integers, and the
/// low two bits of the scalar codes give `log2(size in bytes)`.
#[allow(non_camel_case_types)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TypeCode {
    Bool = 0x00,
    BoolA = 0x08,
    Int8 = 0x20,
    Int16 = 0x21,
    Int32 = 0x22,
    Int64 = 0x23,
    UInt8 = 0x24,
    UInt16 = 0x25,
    UInt32 = 0x26,
    UInt64 = 0x27,
    Int8A = 0x28,
    Int16A = 0x29,
    Int32A = 0x2a,
    Int64A = 0x2b,
    UInt8A = 0x2c,
    UInt16A = 0x2d,
    UInt32A = 0x2e,
    UInt64A = 0x2f,
    Float32 = 0x42,
    Float64 = 0x43,
    Float32A = 0x4a,
    Float64A = 0x4b,
    String = 0x60,
    StringA = 0x68,
    Struct = 0x80,
    Union = 0x81,
    Any = 0x82,
    StructA = 0x88,
    UnionA = 0x89,
    AnyA = 0x8a,
    Null = 0xff,
}

impl TryFrom<u8> for TypeCode {
    type Error = Error;
    fn try_from(value: u8) -> Result<Self, Error> {
        use TypeCode::*;
        Ok(match value {
            0x00 => Bool,
            0x08 => BoolA,
            0x20 => Int8,
            0x21 => Int16,
            0x22 => Int32,
            0x23 => Int64,
            0x24 => UInt8,
            0x25 => UInt16,
            0x26 => UInt32,
            0x27 => UInt64,
            0x28 => Int8A,
            0x29 => Int16A,
            0x2a => Int32A,
            0x2b => Int64A,
            0x2c => UInt8A,
            0x2d => UInt16A,
            0x2e => UInt32A,
            0x2f => UInt64A,
            0x42 => Float32,
            0x43 => Float64,
            0x4a => Float32A,
            0x4b => Float64A,
            0x60 => String,
            0x68 => StringA,
            0x80 => Struct,
            0x81 => Union,
            0x82 => Any,
            0x88 => StructA,
            0x89 => UnionA,
            0x8a => AnyA,
            0xff => Null,
            _ => return Err(Error::Protocol("unknown type code")),
        })
    }
}

impl TypeCode {
    pub fn kind(self) -> Kind {
        match (self as u8) & 0xe0 {
            0x00 => Kind::Bool,
            0x20 => Kind::Integer,
            0x40 => Kind::Real,
            0x60 => Kind::String,
            0x80 => Kind::Compound,
            _ => Kind::Null,
        }
    }

    pub fn is_array(self) -> bool {
        self != TypeCode::Null && (self as u8) & 0x08 != 0
    }

    /// Only meaningful for `Kind::Integer`.
    pub fn is_unsigned(self) -> bool {
        (self as u8) & 0x04 != 0
    }

    /// Width in bytes of the scalar representation (Bool/Integer/Real).
    pub fn width(self) -> usize {
        1usize << ((self as u8) & 0x03)
    }

    /// The array form of a scalar code.
    pub fn array_of(self) -> Result<TypeCode, Error> {
        TypeCode::try_from((self as u8) | 0x08)
    }

    /// The scalar form of an array code.
    pub fn scalar_of(self) -> Result<TypeCode, Error> {
        TypeCode::try_from((self as u8) & !0x08)
    }

    pub fn name(self) -> &'static str {
        use TypeCode::*;
        match self {
            Bool => "bool",
            BoolA => "bool[]",
            Int8 => "int8_t",
            Int16 => "int16_t",
            Int32 => "int32_t",
            Int64 => "int64_t",
            UInt8 => "uint8_t",
            UInt16 => "uint16_t",
            UInt32 => "uint32_t",
            UInt64 => "uint64_t",
            Int8A => "int8_t[]",
            Int16A => "int16_t[]",
            Int32A => "int32_t[]",
            Int64A => "int64_t[]",
            UInt8A => "uint8_t[]",
            UInt16A => "uint16_t[]",
            UInt32A => "uint32_t[]",
            UInt64A => "uint64_t[]",
            Float32 => "float",
            Float64 => "double",
            Float32A => "float[]",
            Float64A => "double[]",
            String => "string",
            StringA => "string[]",
            Struct => "struct",
            Union => "union",
            Any => "any",
            StructA => "struct[]",
            UnionA => "union[]",
            AnyA => "any[]",
            Null => "null",
        }
    }
}

impl fmt::Display for TypeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One member of a structure or union under construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub code: TypeCode,
    pub name: String,
    pub id: String,
    pub children: Vec<Member>,
}

impl Member {
    /// A non-compound member.
    pub fn new(code: TypeCode, name: &str) -> Member {
        Member {
            code,
            name: name.to_string(),
            id: String::new(),
            children: Vec::new(),
        }
    }

    /// A compound member without a type id.
    pub fn compound(code: TypeCode, name: &str, children: Vec<Member>) -> Member {
        Member {
            code,
            name: name.to_string(),
            id: String::new(),
            children,
        }
    }

    /// A compound member carrying a type id string.
    pub fn with_id(code: TypeCode, name: &str, id: &str, children: Vec<Member>) -> Member {
        Member {
            code,
            name: name.to_string(),
            id: id.to_string(),
            children,
        }
    }

    pub fn add_child(&mut self, member: Member) {
        self.children.push(member);
    }
}

/// Define a new type, then instantiate it.
///
/// ```
/// use pvars::{Member, TypeCode, TypeDef};
///
/// let def = TypeDef::structure(
///     "simple_t",
///     vec![
///         Member::new(TypeCode::Int32, "value"),
///         Member::compound(
///             TypeCode::Struct,
///             "alarm",
///             vec![Member::new(TypeCode::Int32, "severity")],
///         ),
///     ],
/// );
/// let val = def.create().unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct TypeDef {
    top: Member,
}

impl TypeDef {
    /// Definition of a single scalar (or scalar-array) field.
    pub fn scalar(code: TypeCode) -> TypeDef {
        TypeDef {
            top: Member::new(code, ""),
        }
    }

    /// Definition of a top-level `Struct` with the given id and members.
    pub fn structure(id: &str, members: Vec<Member>) -> TypeDef {
        TypeDef {
            top: Member::with_id(TypeCode::Struct, "", id, members),
        }
    }

    /// Definition of a top-level `Union` with the given id and members.
    pub fn union(id: &str, members: Vec<Member>) -> TypeDef {
        TypeDef {
            top: Member::with_id(TypeCode::Union, "", id, members),
        }
    }

    /// Definition rooted at an arbitrary member.
    pub fn from_member(top: Member) -> TypeDef {
        TypeDef { top }
    }

    /// Append additional members to a `Struct`/`Union` definition.
    pub fn extend(&mut self, members: Vec<Member>) {
        self.top.children.extend(members);
    }

    /// Flatten the definition into an immutable descriptor tree.
    pub fn build(&self) -> Result<Arc<TypeDesc>, Error> {
        TypeDesc::from_member(&self.top).map(Arc::new)
    }

    /// Instantiate fresh, default-valued storage for this definition.
    pub fn create(&self) -> Result<crate::value::MValue, Error> {
        Ok(crate::value::MValue::instantiate(self.build()?))
    }
}

/// An immutable node in the flat depth-first descriptor array.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDesc {
    pub code: TypeCode,
    /// Type identifier string; only meaningful for `Struct`/`Union`.
    pub id: String,
    /// For `Struct`: member path (possibly dotted) to forward offset within
    /// the same flat array. For `Union`: member name to index in `members`.
    pub mlookup: BTreeMap<String, usize>,
    /// Direct children in declaration (and serialization) order, with the
    /// same offsets as `mlookup`.
    pub miter: Vec<(String, usize)>,
    /// `Union` alternatives, or the single element type of a
    /// `StructA`/`UnionA`.
    pub members: Vec<Arc<TypeDesc>>,
    /// Distance back to the enclosing `Struct` node; 0 at the root.
    pub parent_index: usize,
    /// Number of descriptor nodes in this subtree, inclusive.
    pub size: usize,
    /// Structural hash: `code ^ id ^ Σ(memberName ^ childHash)`. Collisions
    /// are possible; always confirm with a structural compare.
    pub hash: u64,
}

impl FieldDesc {
    fn leaf(code: TypeCode, id: String) -> FieldDesc {
        FieldDesc {
            code,
            id,
            mlookup: BTreeMap::new(),
            miter: Vec::new(),
            members: Vec::new(),
            parent_index: 0,
            size: 1,
            hash: 0,
        }
    }
}

fn hash_str(s: &str) -> u64 {
    let mut h = std::collections::hash_map::DefaultHasher::new();
    s.hash(&mut h);
    h.finish()
}

/// A complete flattened type: the unit shared between values, the wire
/// codec's type caches, and channel prototypes.
#[derive(Debug, Clone, PartialEq)]
pub struct TypeDesc {
    nodes: Vec<FieldDesc>,
}

impl TypeDesc {
    pub(crate) fn from_member(top: &Member) -> Result<TypeDesc, Error> {
        let mut nodes = Vec::new();
        flatten_into(top, &mut nodes)?;
        Ok(TypeDesc { nodes })
    }

    pub fn root(&self) -> &FieldDesc {
        &self.nodes[0]
    }

    pub fn node(&self, index: usize) -> &FieldDesc {
        &self.nodes[index]
    }

    pub fn get(&self, index: usize) -> Option<&FieldDesc> {
        self.nodes.get(index)
    }

    /// Total number of descriptor nodes (== number of storage cells).
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn hash(&self) -> u64 {
        self.root().hash
    }

    /// The node slice covering the subtree rooted at `base`.
    pub(crate) fn subtree(&self, base: usize) -> &[FieldDesc] {
        &self.nodes[base..base + self.nodes[base].size]
    }

    /// Copy the subtree rooted at `base` out into its own descriptor tree.
    pub(crate) fn extract(&self, base: usize) -> TypeDesc {
        let mut nodes = self.subtree(base).to_vec();
        nodes[0].parent_index = 0;
        TypeDesc { nodes }
    }

    /// Name of the descendant at `index` relative to the struct at `base`,
    /// in dotted form.
    pub fn name_of(&self, base: usize, index: usize) -> Option<&str> {
        let rel = index.checked_sub(base)?;
        self.nodes[base]
            .mlookup
            .iter()
            .find(|(_, off)| **off == rel)
            .map(|(name, _)| name.as_str())
    }
}

/// Structural comparison of two subtrees, disregarding where each root
/// sits inside its enclosing tree.
pub(crate) fn subtree_matches(a: &TypeDesc, abase: usize, b: &TypeDesc, bbase: usize) -> bool {
    let sa = a.subtree(abase);
    let sb = b.subtree(bbase);
    sa.len() == sb.len()
        && sa.iter().zip(sb.iter()).enumerate().all(|(i, (x, y))| {
            if i == 0 {
                x.code == y.code
                    && x.id == y.id
                    && x.mlookup == y.mlookup
                    && x.miter == y.miter
                    && x.members == y.members
            } else {
                x == y
            }
        })
}

fn flatten_into(m: &Member, nodes: &mut Vec<FieldDesc>) -> Result<usize, Error> {
    let my = nodes.len();
    nodes.push(FieldDesc::leaf(m.code, m.id.clone()));

    let mut mlookup = BTreeMap::new();
    let mut miter = Vec::new();
    let mut members: Vec<Arc<TypeDesc>> = Vec::new();
    let mut hash = (m.code as u8 as u64) ^ hash_str(&m.id);

    match m.code {
        TypeCode::Struct => {
            for child in &m.children {
                let child_abs = flatten_into(child, nodes)?;
                let rel = child_abs - my;
                nodes[child_abs].parent_index = rel;
                hash ^= hash_str(&child.name) ^ nodes[child_abs].hash;
                miter.push((child.name.clone(), rel));
                mlookup.insert(child.name.clone(), rel);
                // Nested structs contribute dotted transitive keys.
                if nodes[child_abs].code == TypeCode::Struct {
                    let sub: Vec<(String, usize)> = nodes[child_abs]
                        .mlookup
                        .iter()
                        .map(|(k, v)| (k.clone(), *v))
                        .collect();
                    for (k, v) in sub {
                        mlookup.insert(format!("{}.{}", child.name, k), rel + v);
                    }
                }
            }
        }
        TypeCode::Union => {
            if m.children.is_empty() {
                return Err(Error::Protocol("union with no members"));
            }
            for (i, child) in m.children.iter().enumerate() {
                let sub = Arc::new(TypeDesc::from_member(child)?);
                hash ^= hash_str(&child.name) ^ sub.hash();
                miter.push((child.name.clone(), i));
                mlookup.insert(child.name.clone(), i);
                members.push(sub);
            }
        }
        TypeCode::StructA | TypeCode::UnionA => {
            // The single element type, carrying this member's id/children.
            let elem = Member {
                code: m.code.scalar_of()?,
                name: String::new(),
                id: m.id.clone(),
                children: m.children.clone(),
            };
            let sub = Arc::new(TypeDesc::from_member(&elem)?);
            hash ^= sub.hash();
            members.push(sub);
        }
        _ => {
            if !m.children.is_empty() {
                return Err(Error::Protocol("scalar member with children"));
            }
        }
    }

    let size = nodes.len() - my;
    let node = &mut nodes[my];
    node.mlookup = mlookup;
    node.miter = miter;
    node.members = members;
    node.size = size;
    node.hash = hash;
    Ok(my)
}

fn fmt_node(
    desc: &TypeDesc,
    index: usize,
    name: &str,
    level: usize,
    f: &mut fmt::Formatter<'_>,
) -> fmt::Result {
    let pad = "    ".repeat(level);
    let node = desc.node(index);
    match node.code {
        TypeCode::Struct | TypeCode::Union => {
            write!(f, "{pad}{}", node.code)?;
            if !node.id.is_empty() {
                write!(f, " \"{}\"", node.id)?;
            }
            writeln!(f, " {{")?;
            if node.code == TypeCode::Struct {
                for (child, rel) in &node.miter {
                    fmt_node(desc, index + rel, child, level + 1, f)?;
                }
            } else {
                for (child, mi) in &node.miter {
                    fmt_node(&node.members[*mi], 0, child, level + 1, f)?;
                }
            }
            write!(f, "{pad}}}")?;
        }
        TypeCode::StructA | TypeCode::UnionA => {
            writeln!(f, "{pad}{} {{", node.code)?;
            let elem = &node.members[0];
            if elem.root().code == TypeCode::Struct {
                for (child, rel) in &elem.root().miter {
                    fmt_node(elem, *rel, child, level + 1, f)?;
                }
            } else {
                for (child, mi) in &elem.root().miter {
                    fmt_node(&elem.root().members[*mi], 0, child, level + 1, f)?;
                }
            }
            write!(f, "{pad}}}")?;
        }
        _ => write!(f, "{pad}{}", node.code)?,
    }
    if name.is_empty() {
        writeln!(f)
    } else {
        writeln!(f, " {name}")
    }
}

impl fmt::Display for TypeDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_node(self, 0, "", 0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn type_code_bits() {
        assert_eq!(TypeCode::UInt32.kind(), Kind::Integer);
        assert!(TypeCode::UInt32.is_unsigned());
        assert!(!TypeCode::Int32.is_unsigned());
        assert!(TypeCode::Float64A.is_array());
        assert_eq!(TypeCode::Float64A.scalar_of().unwrap(), TypeCode::Float64);
        assert_eq!(TypeCode::Int16.array_of().unwrap(), TypeCode::Int16A);
        assert_eq!(TypeCode::Int64.width(), 8);
        assert_eq!(TypeCode::UInt16.width(), 2);
        assert_eq!(TypeCode::Struct.kind(), Kind::Compound);
        assert_eq!(TypeCode::try_from(0x26).unwrap(), TypeCode::UInt32);
        assert!(TypeCode::try_from(0x0b).is_err());
    }

    #[test]
    fn flat_layout() {
        let desc = simple_def().build().unwrap();

        // One node per field, depth first.
        assert_eq!(desc.len(), 11);
        assert_eq!(desc.root().size, 11);
        assert_eq!(desc.node(1).code, TypeCode::Float64A);
        assert_eq!(desc.node(2).code, TypeCode::Struct);
        assert_eq!(desc.node(2).id, "time_t");
        assert_eq!(desc.node(2).size, 3);
        assert_eq!(desc.node(4).code, TypeCode::UInt32);
        assert_eq!(desc.node(6).code, TypeCode::StructA);
        assert_eq!(desc.node(9).code, TypeCode::Union);

        // Forward offsets, dotted keys resolve transitively.
        let root = desc.root();
        assert_eq!(root.mlookup["value"], 1);
        assert_eq!(root.mlookup["timeStamp"], 2);
        assert_eq!(root.mlookup["timeStamp.secondsPastEpoch"], 3);
        assert_eq!(root.mlookup["timeStamp.nanoseconds"], 4);
        assert_eq!(root.mlookup["arbitrary.sarr"], 6);
        assert_eq!(root.mlookup["achoice"], 10);

        // Back-patched parent offsets.
        assert_eq!(desc.node(3).parent_index, 1);
        assert_eq!(desc.node(4).parent_index, 2);
        assert_eq!(desc.node(10).parent_index, 10);

        // Union members and array elements are separate trees.
        assert_eq!(desc.node(9).members.len(), 2);
        assert_eq!(desc.node(9).mlookup["b"], 1);
        assert_eq!(desc.node(9).size, 1);
        let sarr = &desc.node(6).members[0];
        assert_eq!(sarr.root().code, TypeCode::Struct);
        assert_eq!(sarr.len(), 2);
    }

    #[test]
    fn structural_hash_and_equality() {
        let a = simple_def().build().unwrap();
        let b = simple_def().build().unwrap();
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a, b);

        let mut other = simple_def();
        other.extend(vec![Member::new(TypeCode::Int8, "extra")]);
        let c = other.build().unwrap();
        assert_ne!(a.hash(), c.hash());
        assert_ne!(*a, *c);

        // Same shape, different member name.
        let d = TypeDef::structure("s", vec![Member::new(TypeCode::Int32, "x")])
            .build()
            .unwrap();
        let e = TypeDef::structure("s", vec![Member::new(TypeCode::Int32, "y")])
            .build()
            .unwrap();
        assert_ne!(d, e);
    }

    #[test]
    fn name_of_descendants() {
        let desc = simple_def().build().unwrap();
        assert_eq!(desc.name_of(0, 1), Some("value"));
        assert_eq!(desc.name_of(0, 4), Some("timeStamp.nanoseconds"));
        assert_eq!(desc.name_of(2, 3), Some("secondsPastEpoch"));
        assert_eq!(desc.name_of(2, 1), None);
    }

    #[test]
    fn display_renders_nesting() {
        let desc = TypeDef::structure(
            "simple_t",
            vec![
                Member::new(TypeCode::Float64, "value"),
                Member::with_id(
                    TypeCode::Struct,
                    "timeStamp",
                    "time_t",
                    vec![Member::new(TypeCode::UInt64, "secondsPastEpoch")],
                ),
            ],
        )
        .build()
        .unwrap();
        let shown = desc.to_string();
        assert_eq!(
            shown,
            "struct \"simple_t\" {\n    double value\n    struct \"time_t\" {\n        uint64_t secondsPastEpoch\n    } timeStamp\n}\n"
        );
    }
}
