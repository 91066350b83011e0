//! Decoded TL values.

use std::fmt;

/// Fixed-width unsigned integer stored as `N` big-endian bytes.
///
/// Used for the `int128`, `int256` and `int512` wire types (nonces and
/// key-exchange numbers). The bytes travel verbatim, so no arithmetic is
/// needed to round-trip them.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LargeInt<const N: usize>(pub [u8; N]);

pub type Int128 = LargeInt<16>;
pub type Int256 = LargeInt<32>;
pub type Int512 = LargeInt<64>;

impl<const N: usize> LargeInt<N> {
    pub const BITS: u32 = (N * 8) as u32;

    pub fn from_be_bytes(bytes: [u8; N]) -> Self {
        Self(bytes)
    }

    /// Build from a big-endian slice no wider than `N`, left-padding with zeros.
    pub fn from_be_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() > N {
            return None;
        }
        let mut out = [0u8; N];
        out[N - bytes.len()..].copy_from_slice(bytes);
        Some(Self(out))
    }

    pub fn to_be_bytes(&self) -> [u8; N] {
        self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s.trim_start_matches("0x")).ok()?;
        Self::from_be_slice(&bytes)
    }
}

impl Int128 {
    pub fn from_u128(value: u128) -> Self {
        Self(value.to_be_bytes())
    }

    pub fn to_u128(&self) -> u128 {
        u128::from_be_bytes(self.0)
    }
}

impl<const N: usize> Default for LargeInt<N> {
    fn default() -> Self {
        Self([0u8; N])
    }
}

impl<const N: usize> fmt::Debug for LargeInt<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Int{}(0x{})", N * 8, self.to_hex())
    }
}

/// Declared element type of a vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementKind {
    Int,
    Long,
    Double,
    Int128,
    Int256,
    Int512,
    String,
    Bytes,
    Bool,
    /// Anything else: a boxed object read through the registry.
    Object,
}

impl ElementKind {
    /// Map a TL type name to its element kind. Unknown names are objects.
    pub fn from_type_name(name: &str) -> Self {
        match name {
            "int" => ElementKind::Int,
            "long" => ElementKind::Long,
            "double" => ElementKind::Double,
            "int128" => ElementKind::Int128,
            "int256" => ElementKind::Int256,
            "int512" => ElementKind::Int512,
            "string" => ElementKind::String,
            "bytes" => ElementKind::Bytes,
            "Bool" | "bool" => ElementKind::Bool,
            _ => ElementKind::Object,
        }
    }

    pub fn type_name(self) -> &'static str {
        match self {
            ElementKind::Int => "int",
            ElementKind::Long => "long",
            ElementKind::Double => "double",
            ElementKind::Int128 => "int128",
            ElementKind::Int256 => "int256",
            ElementKind::Int512 => "int512",
            ElementKind::String => "string",
            ElementKind::Bytes => "bytes",
            ElementKind::Bool => "Bool",
            ElementKind::Object => "Object",
        }
    }
}

/// A boxed TL object: constructor id, predicate name and named fields in
/// wire order.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    pub id: u32,
    pub name: String,
    pub fields: Vec<(String, Value)>,
}

impl Object {
    pub fn new(id: u32, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            fields: Vec::new(),
        }
    }

    /// Builder-style field append.
    pub fn with(mut self, field: impl Into<String>, value: Value) -> Self {
        self.set(field, value);
        self
    }

    /// Insert or replace a field, keeping the original position on replace.
    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        let field = field.into();
        match self.fields.iter_mut().find(|(name, _)| *name == field) {
            Some(slot) => slot.1 = value,
            None => self.fields.push((field, value)),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, value)| value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(u8),
    Int(i32),
    Long(i64),
    Double(f64),
    Int128(Int128),
    Int256(Int256),
    Int512(Int512),
    Bytes(Vec<u8>),
    String(String),
    Bool(bool),
    Vector { kind: ElementKind, items: Vec<Value> },
    Object(Object),
}

impl Value {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Byte(_) => "byte",
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Double(_) => "double",
            Value::Int128(_) => "int128",
            Value::Int256(_) => "int256",
            Value::Int512(_) => "int512",
            Value::Bytes(_) => "bytes",
            Value::String(_) => "string",
            Value::Bool(_) => "Bool",
            Value::Vector { .. } => "Vector",
            Value::Object(_) => "Object",
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) => Some(v),
            Value::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_vector(&self) -> Option<&[Value]> {
        match self {
            Value::Vector { items, .. } => Some(items),
            _ => None,
        }
    }
}

impl From<Object> for Value {
    fn from(object: Object) -> Self {
        Value::Object(object)
    }
}
