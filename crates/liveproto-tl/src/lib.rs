//! LiveProto TL -- Type-Language wire codec and constructor registry.
//!
//! Little-endian fixed-width scalars, length-prefixed byte strings padded to
//! 4 bytes, and composite values prefixed by a 4-byte constructor id.
//! Constructor ids outside the built-in set are resolved through a
//! [`Registry`] passed into every object read/write.

pub mod binary;
pub mod registry;
pub mod schema;
pub mod value;

pub use binary::{Binary, Mark, WriteMark};
pub use registry::{Constructor, ConstructorDef, Param, ParamKind, Registry, SchemaConstructor};
pub use schema::Schema;
pub use value::{ElementKind, Int128, Int256, Int512, LargeInt, Object, Value};

/// `vector#1cb5c415`
pub const VECTOR_ID: u32 = 0x1cb5_c415;

/// `boolTrue#997275b5 = Bool`
pub const BOOL_TRUE_ID: u32 = 0x9972_75b5;

/// `boolFalse#bc799737 = Bool`
pub const BOOL_FALSE_ID: u32 = 0xbc79_9737;

/// `true#3fedd339 = True`
pub const TRUE_ID: u32 = 0x3fed_d339;

/// Byte strings of this length or longer use the 4-byte length header.
pub const LONG_BYTES_MARKER: u8 = 0xfe;

/// Largest byte string the 3-byte length header can describe.
pub const MAX_BYTES_LEN: usize = (1 << 24) - 1;

#[derive(Debug, thiserror::Error)]
pub enum TlError {
    #[error("unexpected end of buffer: needed {needed} bytes, {available} available")]
    UnexpectedEof { needed: usize, available: usize },
    #[error("the constructor id of the vector is wrong: {found:#010x}")]
    InvalidVector { found: u32 },
    #[error("unknown constructor id {id:#010x}")]
    UnknownConstructor { id: u32 },
    #[error("unsupported integer width: {0} bits")]
    UnsupportedWidth(u32),
    #[error("value does not fit in {bits} bits")]
    IntegerOverflow { bits: u32 },
    #[error("byte string too long: {len} bytes (max {max})")]
    BytesTooLong { len: usize, max: usize },
    #[error("invalid utf-8 in string: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),
    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("missing field `{field}` for constructor {constructor}")]
    MissingField { constructor: String, field: String },
    #[error("mark at offset {mark} was released (history starts at {base})")]
    StaleMark { mark: u64, base: u64 },
    #[error("schema parse error on line {line}: {reason}")]
    Schema { line: usize, reason: String },
}

impl TlError {
    /// Whether the error means the peer sent bytes that violate the protocol,
    /// as opposed to a local misuse of the codec API.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            TlError::UnexpectedEof { .. }
                | TlError::InvalidVector { .. }
                | TlError::UnknownConstructor { .. }
                | TlError::InvalidUtf8(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TlError>;
