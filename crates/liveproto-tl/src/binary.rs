//! Byte cursor for the TL wire format.
//!
//! One buffer serves both directions: writes append to the tail, reads
//! consume from the head. Every public read is atomic (a failed read leaves
//! the cursor where it was) and every public read/write remembers where it
//! started, so the most recent one can be taken back with [`Binary::undo_read`]
//! or [`Binary::undo_write`]. Longer look-ahead uses [`Binary::mark`] and
//! [`Binary::rewind`]; [`Binary::commit`] releases consumed bytes.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::registry::Registry;
use crate::value::{ElementKind, LargeInt, Object, Value};
use crate::{
    Result, TlError, BOOL_FALSE_ID, BOOL_TRUE_ID, LONG_BYTES_MARKER, MAX_BYTES_LEN, TRUE_ID,
    VECTOR_ID,
};

/// Saved read position. Valid until a [`Binary::commit`] releases the bytes
/// before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Mark(u64);

/// Saved write length, for truncating everything written after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct WriteMark(u64);

#[derive(Default)]
pub struct Binary {
    data: BytesMut,
    /// Read offset into `data`.
    pos: usize,
    /// Absolute stream offset of `data[0]`.
    base: u64,
    /// Once drained, reads start over from the retained history.
    repeating: bool,
    last_read: Option<usize>,
    last_write: Option<usize>,
}

/// Zero bytes needed to bring `n` up to a multiple of 4.
fn padding(n: usize) -> usize {
    (4 - n % 4) % 4
}

impl Binary {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cursor that replays its history once drained (streaming contexts
    /// that re-read the same frame).
    pub fn repeating() -> Self {
        Self {
            repeating: true,
            ..Self::default()
        }
    }

    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> Self {
        let mut binary = Self::new();
        binary.data.extend_from_slice(bytes.as_ref());
        binary
    }

    pub fn is_repeating(&self) -> bool {
        self.repeating
    }

    /// Absolute read offset (bytes consumed since creation).
    pub fn position(&self) -> u64 {
        self.base + self.pos as u64
    }

    /// Absolute write offset (bytes written since creation).
    pub fn written(&self) -> u64 {
        self.base + self.data.len() as u64
    }

    /// Unread bytes.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn unread(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.unread().to_vec()
    }

    /// Consume the cursor, returning the unread bytes.
    pub fn into_bytes(mut self) -> Bytes {
        self.data.advance(self.pos);
        self.data.freeze()
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    pub fn mark(&self) -> Mark {
        Mark(self.position())
    }

    pub fn rewind(&mut self, mark: Mark) -> Result<()> {
        let end = self.written();
        if mark.0 < self.base || mark.0 > end {
            return Err(TlError::StaleMark {
                mark: mark.0,
                base: self.base,
            });
        }
        self.pos = (mark.0 - self.base) as usize;
        self.last_read = None;
        Ok(())
    }

    pub fn write_mark(&self) -> WriteMark {
        WriteMark(self.written())
    }

    /// Drop everything written after `mark`.
    pub fn truncate(&mut self, mark: WriteMark) -> Result<()> {
        if mark.0 < self.base {
            return Err(TlError::StaleMark {
                mark: mark.0,
                base: self.base,
            });
        }
        let len = ((mark.0 - self.base) as usize).min(self.data.len());
        self.truncate_to(len);
        Ok(())
    }

    /// Put the most recent top-level read back onto the unread buffer.
    pub fn undo_read(&mut self) -> &mut Self {
        if let Some(start) = self.last_read.take() {
            self.pos = start.min(self.data.len());
        }
        self
    }

    /// Remove the most recent top-level write from the output.
    pub fn undo_write(&mut self) -> &mut Self {
        if let Some(start) = self.last_write.take() {
            self.truncate_to(start);
        }
        self
    }

    /// Release consumed bytes. Marks taken before this point become stale,
    /// and a repeating cursor replays only from here on.
    pub fn commit(&mut self) {
        let consumed = self.pos;
        self.data.advance(consumed);
        self.base += consumed as u64;
        self.pos = 0;
        self.last_read = None;
        self.last_write = self.last_write.and_then(|w| w.checked_sub(consumed));
    }

    /// Skip forward to an absolute read offset. Offsets behind the cursor are
    /// ignored; use [`Binary::rewind`] to move back.
    pub fn set_position(&mut self, position: u64) -> Result<()> {
        let current = self.position();
        if position > current {
            self.take((position - current) as usize)?;
        }
        Ok(())
    }

    /// Constructor id of the next object, without consuming it.
    pub fn peek_constructor(&self) -> Result<u32> {
        let unread = self.unread();
        if unread.len() < 4 {
            return Err(TlError::UnexpectedEof {
                needed: 4,
                available: unread.len(),
            });
        }
        Ok(u32::from_le_bytes([unread[0], unread[1], unread[2], unread[3]]))
    }

    /// Name of the pending object, or its hex id when the registry does not
    /// know it.
    pub fn describe(&self, registry: &Registry) -> String {
        match self.peek_constructor() {
            Ok(id) => registry
                .get(id)
                .map(|c| c.name().to_string())
                .unwrap_or_else(|| format!("{id:#010x}")),
            Err(_) => String::from("<empty>"),
        }
    }

    fn truncate_to(&mut self, len: usize) {
        self.data.truncate(len);
        self.pos = self.pos.min(len);
        self.last_read = self.last_read.filter(|r| *r <= len);
        self.last_write = self.last_write.filter(|w| *w < len);
    }

    fn take(&mut self, n: usize) -> Result<&[u8]> {
        let available = self.remaining();
        if n > available {
            return Err(TlError::UnexpectedEof {
                needed: n,
                available,
            });
        }
        let start = self.pos;
        self.pos += n;
        if self.repeating && self.pos == self.data.len() {
            self.pos = 0;
        }
        Ok(&self.data[start..start + n])
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn tracked_read<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let start = self.pos;
        let previous = self.last_read;
        match f(self) {
            Ok(value) => {
                self.last_read = Some(start);
                Ok(value)
            }
            Err(e) => {
                self.pos = start;
                self.last_read = previous;
                Err(e)
            }
        }
    }

    fn tracked_write(&mut self, f: impl FnOnce(&mut Self) -> Result<()>) -> Result<&mut Self> {
        let start = self.data.len();
        let previous = self.last_write;
        match f(self) {
            Ok(()) => {
                self.last_write = Some(start);
                Ok(self)
            }
            Err(e) => {
                self.truncate_to(start);
                // A failed write is not undoable; the one before it still is.
                self.last_write = previous;
                Err(e)
            }
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn read_byte(&mut self) -> Result<u8> {
        self.tracked_read(|b| Ok(b.take_array::<1>()?[0]))
    }

    pub fn read_int(&mut self) -> Result<i32> {
        self.tracked_read(|b| Ok(i32::from_le_bytes(b.take_array()?)))
    }

    /// Unsigned form of [`Binary::read_int`], used for constructor ids.
    pub fn read_uint(&mut self) -> Result<u32> {
        self.tracked_read(|b| Ok(u32::from_le_bytes(b.take_array()?)))
    }

    pub fn read_long(&mut self) -> Result<i64> {
        self.tracked_read(|b| Ok(i64::from_le_bytes(b.take_array()?)))
    }

    pub fn read_double(&mut self) -> Result<f64> {
        self.tracked_read(|b| Ok(f64::from_le_bytes(b.take_array()?)))
    }

    pub fn read_large<const N: usize>(&mut self) -> Result<LargeInt<N>> {
        self.tracked_read(|b| Ok(LargeInt(b.take_array()?)))
    }

    /// Read a 128, 256 or 512-bit integer.
    pub fn read_large_int(&mut self, bits: u32) -> Result<Value> {
        match bits {
            128 => self.read_large::<16>().map(Value::Int128),
            256 => self.read_large::<32>().map(Value::Int256),
            512 => self.read_large::<64>().map(Value::Int512),
            other => Err(TlError::UnsupportedWidth(other)),
        }
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        self.tracked_read(|b| {
            let first = b.take_array::<1>()?[0];
            let (len, header) = if first == LONG_BYTES_MARKER {
                let l = b.take_array::<3>()?;
                (u32::from_le_bytes([l[0], l[1], l[2], 0]) as usize, 4)
            } else {
                (first as usize, 1)
            };
            let data = b.take(len)?.to_vec();
            b.take(padding(header + len))?;
            Ok(data)
        })
    }

    pub fn read_string(&mut self) -> Result<String> {
        self.tracked_read(|b| Ok(String::from_utf8(b.read_bytes()?)?))
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        self.tracked_read(|b| Ok(b.read_uint()? != BOOL_FALSE_ID))
    }

    /// Check the vector constructor id and return the element count.
    pub fn read_vector_header(&mut self) -> Result<usize> {
        self.tracked_read(|b| {
            let found = b.read_uint()?;
            if found != VECTOR_ID {
                return Err(TlError::InvalidVector { found });
            }
            Ok(b.read_uint()? as usize)
        })
    }

    pub fn read_vector(&mut self, kind: ElementKind, registry: &Registry) -> Result<Vec<Value>> {
        self.tracked_read(|b| {
            let count = b.read_vector_header()?;
            b.read_elements(count, kind, registry)
        })
    }

    fn read_elements(
        &mut self,
        count: usize,
        kind: ElementKind,
        registry: &Registry,
    ) -> Result<Vec<Value>> {
        // A hostile count must not drive the allocation; every element is at
        // least one byte on the wire.
        let mut items = Vec::with_capacity(count.min(self.remaining()));
        for _ in 0..count {
            items.push(self.read_element(kind, registry)?);
        }
        Ok(items)
    }

    /// Read one value of a declared kind.
    pub fn read_element(&mut self, kind: ElementKind, registry: &Registry) -> Result<Value> {
        match kind {
            ElementKind::Int => self.read_int().map(Value::Int),
            ElementKind::Long => self.read_long().map(Value::Long),
            ElementKind::Double => self.read_double().map(Value::Double),
            ElementKind::Int128 => self.read_large_int(128),
            ElementKind::Int256 => self.read_large_int(256),
            ElementKind::Int512 => self.read_large_int(512),
            ElementKind::String => self.read_string().map(Value::String),
            ElementKind::Bytes => self.read_bytes().map(Value::Bytes),
            ElementKind::Bool => self.read_bool().map(Value::Bool),
            ElementKind::Object => self.read_object(registry),
        }
    }

    /// Read a boxed value. Bool sentinels and generic vectors are decoded
    /// directly; every other constructor goes through the registry.
    pub fn read_object(&mut self, registry: &Registry) -> Result<Value> {
        self.tracked_read(|b| {
            let id = b.read_uint()?;
            match id {
                BOOL_TRUE_ID | TRUE_ID => Ok(Value::Bool(true)),
                BOOL_FALSE_ID => Ok(Value::Bool(false)),
                VECTOR_ID => {
                    let count = b.read_uint()? as usize;
                    let items = b.read_elements(count, ElementKind::Object, registry)?;
                    Ok(Value::Vector {
                        kind: ElementKind::Object,
                        items,
                    })
                }
                _ => {
                    let constructor = registry.resolve(id)?;
                    tracing::trace!(id, name = constructor.name(), "decode object");
                    constructor.decode(b, registry).map(Value::Object)
                }
            }
        })
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    pub fn write_byte(&mut self, value: u8) -> &mut Self {
        let start = self.data.len();
        self.data.put_u8(value);
        self.last_write = Some(start);
        self
    }

    pub fn write_int(&mut self, value: i32) -> &mut Self {
        let start = self.data.len();
        self.data.put_i32_le(value);
        self.last_write = Some(start);
        self
    }

    pub fn write_uint(&mut self, value: u32) -> &mut Self {
        let start = self.data.len();
        self.data.put_u32_le(value);
        self.last_write = Some(start);
        self
    }

    pub fn write_long(&mut self, value: i64) -> &mut Self {
        let start = self.data.len();
        self.data.put_i64_le(value);
        self.last_write = Some(start);
        self
    }

    pub fn write_double(&mut self, value: f64) -> &mut Self {
        let start = self.data.len();
        self.data.put_f64_le(value);
        self.last_write = Some(start);
        self
    }

    pub fn write_large<const N: usize>(&mut self, value: &LargeInt<N>) -> &mut Self {
        let start = self.data.len();
        self.data.put_slice(value.as_bytes());
        self.last_write = Some(start);
        self
    }

    /// Write a big-endian unsigned integer as a `bits`-wide field. Shorter
    /// inputs are left-padded with zeros.
    pub fn write_large_int(&mut self, value: &[u8], bits: u32) -> Result<&mut Self> {
        if !matches!(bits, 128 | 256 | 512) {
            return Err(TlError::UnsupportedWidth(bits));
        }
        let width = (bits / 8) as usize;
        let significant = value.iter().skip_while(|b| **b == 0).count();
        if significant > width {
            return Err(TlError::IntegerOverflow { bits });
        }
        let digits = &value[value.len() - significant..];
        self.tracked_write(|b| {
            b.data.put_bytes(0, width - digits.len());
            b.data.put_slice(digits);
            Ok(())
        })
    }

    pub fn write_bytes(&mut self, data: &[u8]) -> Result<&mut Self> {
        let len = data.len();
        if len > MAX_BYTES_LEN {
            return Err(TlError::BytesTooLong {
                len,
                max: MAX_BYTES_LEN,
            });
        }
        self.tracked_write(|b| {
            let header = if len < LONG_BYTES_MARKER as usize {
                b.data.put_u8(len as u8);
                1
            } else {
                b.data.put_u8(LONG_BYTES_MARKER);
                b.data.put_slice(&(len as u32).to_le_bytes()[..3]);
                4
            };
            b.data.put_slice(data);
            b.data.put_bytes(0, padding(header + len));
            Ok(())
        })
    }

    pub fn write_string(&mut self, value: &str) -> Result<&mut Self> {
        self.write_bytes(value.as_bytes())
    }

    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.write_uint(if value { BOOL_TRUE_ID } else { BOOL_FALSE_ID })
    }

    pub fn write_vector(
        &mut self,
        kind: ElementKind,
        items: &[Value],
        registry: &Registry,
    ) -> Result<&mut Self> {
        self.tracked_write(|b| {
            b.write_uint(VECTOR_ID);
            b.write_uint(items.len() as u32);
            for item in items {
                b.write_element(kind, item, registry)?;
            }
            Ok(())
        })
    }

    /// Write one value, checking it matches the declared kind.
    pub fn write_element(
        &mut self,
        kind: ElementKind,
        value: &Value,
        registry: &Registry,
    ) -> Result<&mut Self> {
        let mismatch = || TlError::TypeMismatch {
            expected: kind.type_name(),
            found: value.kind_name(),
        };
        match (kind, value) {
            (ElementKind::Int, Value::Int(v)) => Ok(self.write_int(*v)),
            (ElementKind::Long, Value::Long(v)) => Ok(self.write_long(*v)),
            (ElementKind::Double, Value::Double(v)) => Ok(self.write_double(*v)),
            (ElementKind::Int128, Value::Int128(v)) => Ok(self.write_large(v)),
            (ElementKind::Int256, Value::Int256(v)) => Ok(self.write_large(v)),
            (ElementKind::Int512, Value::Int512(v)) => Ok(self.write_large(v)),
            (ElementKind::String, Value::String(v)) => self.write_string(v),
            (ElementKind::Bytes | ElementKind::String, Value::Bytes(v)) => self.write_bytes(v),
            (ElementKind::Bool, Value::Bool(v)) => Ok(self.write_bool(*v)),
            (ElementKind::Object, _) => self.write_boxed(value, registry),
            _ => Err(mismatch()),
        }
    }

    /// Write any value in its natural encoding: scalars bare, everything
    /// else boxed.
    pub fn write_value(&mut self, value: &Value, registry: &Registry) -> Result<&mut Self> {
        match value {
            Value::Byte(v) => Ok(self.write_byte(*v)),
            Value::Int(v) => Ok(self.write_int(*v)),
            Value::Long(v) => Ok(self.write_long(*v)),
            Value::Double(v) => Ok(self.write_double(*v)),
            Value::Int128(v) => Ok(self.write_large(v)),
            Value::Int256(v) => Ok(self.write_large(v)),
            Value::Int512(v) => Ok(self.write_large(v)),
            Value::Bytes(v) => self.write_bytes(v),
            Value::String(v) => self.write_string(v),
            Value::Bool(_) | Value::Vector { .. } | Value::Object(_) => {
                self.write_boxed(value, registry)
            }
        }
    }

    fn write_boxed(&mut self, value: &Value, registry: &Registry) -> Result<&mut Self> {
        match value {
            Value::Bool(v) => Ok(self.write_bool(*v)),
            Value::Vector { kind, items } => self.write_vector(*kind, items, registry),
            Value::Object(object) => self.write_object(object, registry),
            other => Err(TlError::TypeMismatch {
                expected: "Object",
                found: other.kind_name(),
            }),
        }
    }

    pub fn write_object(&mut self, object: &Object, registry: &Registry) -> Result<&mut Self> {
        let constructor = registry.resolve(object.id)?;
        self.tracked_write(|b| {
            b.write_uint(object.id);
            constructor.encode(object, b, registry)
        })
    }
}

impl From<Vec<u8>> for Binary {
    fn from(bytes: Vec<u8>) -> Self {
        Self {
            data: BytesMut::from(&bytes[..]),
            ..Self::default()
        }
    }
}

impl From<&[u8]> for Binary {
    fn from(bytes: &[u8]) -> Self {
        Self::from_bytes(bytes)
    }
}

impl fmt::Debug for Binary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binary")
            .field("position", &self.position())
            .field("repeating", &self.repeating)
            .field("unread", &hex::encode(self.unread()))
            .finish()
    }
}
