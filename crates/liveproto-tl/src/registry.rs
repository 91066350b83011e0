//! Constructor registry: numeric id -> decoder/encoder.
//!
//! The protocol's type catalog is data, not code. A [`Registry`] is filled
//! either from parsed schema text ([`crate::Schema`]) or by registering
//! hand-written [`Constructor`] impls, and is passed explicitly into every
//! object read/write on a [`Binary`].

use std::collections::HashMap;
use std::fmt;

use crate::binary::Binary;
use crate::value::{ElementKind, Object, Value};
use crate::{Result, TlError, VECTOR_ID};

/// Decoder/encoder pair for one constructor id.
///
/// `decode` runs after the 4-byte id has been consumed; `encode` runs after
/// it has been written.
pub trait Constructor: Send + Sync {
    fn id(&self) -> u32;
    fn name(&self) -> &str;
    fn result_type(&self) -> &str {
        "Object"
    }
    fn decode(&self, reader: &mut Binary, registry: &Registry) -> Result<Object>;
    fn encode(&self, object: &Object, writer: &mut Binary, registry: &Registry) -> Result<()>;
}

/// Parameter type in a schema definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamKind {
    Scalar(ElementKind),
    /// `#`: a 32-bit flags word.
    Flags,
    /// `flags.N?T`: present only when bit `N` of `flags_field` is set.
    Conditional {
        flags_field: String,
        bit: u8,
        inner: Box<ParamKind>,
    },
    /// `true`: carries no payload, only meaningful under a flag bit.
    True,
    /// `Vector<T>`: boxed vector.
    Vector(Box<ParamKind>),
    /// `vector<T>`: bare vector (count without the constructor id).
    BareVector(Box<ParamKind>),
    /// Any other boxed type, read through the registry.
    Object(String),
}

impl ParamKind {
    fn element_kind(&self) -> ElementKind {
        match self {
            ParamKind::Scalar(kind) => *kind,
            _ => ElementKind::Object,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub kind: ParamKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstructorDef {
    pub id: u32,
    pub predicate: String,
    pub params: Vec<Param>,
    pub result_type: String,
    pub is_function: bool,
}

/// Constructor driven entirely by its schema definition.
#[derive(Debug, Clone)]
pub struct SchemaConstructor {
    def: ConstructorDef,
}

impl SchemaConstructor {
    pub fn new(def: ConstructorDef) -> Self {
        Self { def }
    }

    pub fn def(&self) -> &ConstructorDef {
        &self.def
    }

    fn flag_set(&self, object: &Object, flags_field: &str, bit: u8) -> Result<bool> {
        let flags = object
            .get(flags_field)
            .and_then(Value::as_int)
            .ok_or_else(|| self.missing(flags_field))?;
        Ok((flags as u32) & (1 << bit) != 0)
    }

    fn missing(&self, field: &str) -> TlError {
        TlError::MissingField {
            constructor: self.def.predicate.clone(),
            field: field.to_string(),
        }
    }

    /// Flags word for `flags_field`, derived from which conditional fields
    /// are present. Bits with no conditional field keep the stored value.
    fn compute_flags(&self, object: &Object, flags_field: &str) -> u32 {
        let mut flags = object.get(flags_field).and_then(Value::as_int).unwrap_or(0) as u32;
        for param in &self.def.params {
            if let ParamKind::Conditional {
                flags_field: field,
                bit,
                inner,
            } = &param.kind
            {
                if field != flags_field {
                    continue;
                }
                let present = match (inner.as_ref(), object.get(&param.name)) {
                    (ParamKind::True, Some(value)) => value.as_bool().unwrap_or(false),
                    (_, Some(_)) => true,
                    (_, None) => false,
                };
                if present {
                    flags |= 1 << bit;
                } else {
                    flags &= !(1 << bit);
                }
            }
        }
        flags
    }
}

fn read_param(kind: &ParamKind, reader: &mut Binary, registry: &Registry) -> Result<Value> {
    match kind {
        ParamKind::Scalar(element) => reader.read_element(*element, registry),
        ParamKind::Flags => reader.read_uint().map(|v| Value::Int(v as i32)),
        ParamKind::True => Ok(Value::Bool(true)),
        ParamKind::Conditional { inner, .. } => read_param(inner, reader, registry),
        ParamKind::Vector(inner) => {
            let count = reader.read_vector_header()?;
            read_items(count, inner, reader, registry)
        }
        ParamKind::BareVector(inner) => {
            let count = reader.read_uint()? as usize;
            read_items(count, inner, reader, registry)
        }
        ParamKind::Object(_) => reader.read_object(registry),
    }
}

fn read_items(
    count: usize,
    inner: &ParamKind,
    reader: &mut Binary,
    registry: &Registry,
) -> Result<Value> {
    let mut items = Vec::with_capacity(count.min(reader.remaining()));
    for _ in 0..count {
        items.push(read_param(inner, reader, registry)?);
    }
    Ok(Value::Vector {
        kind: inner.element_kind(),
        items,
    })
}

fn write_param(
    kind: &ParamKind,
    value: &Value,
    writer: &mut Binary,
    registry: &Registry,
) -> Result<()> {
    match kind {
        ParamKind::Scalar(element) => {
            writer.write_element(*element, value, registry)?;
        }
        ParamKind::Flags => {
            let flags = value.as_int().ok_or(TlError::TypeMismatch {
                expected: "#",
                found: value.kind_name(),
            })?;
            writer.write_int(flags);
        }
        ParamKind::True => {}
        ParamKind::Conditional { inner, .. } => write_param(inner, value, writer, registry)?,
        ParamKind::Vector(inner) | ParamKind::BareVector(inner) => {
            let items = value.as_vector().ok_or(TlError::TypeMismatch {
                expected: "Vector",
                found: value.kind_name(),
            })?;
            if matches!(kind, ParamKind::Vector(_)) {
                writer.write_uint(VECTOR_ID);
            }
            writer.write_uint(items.len() as u32);
            for item in items {
                write_param(inner, item, writer, registry)?;
            }
        }
        ParamKind::Object(_) => {
            writer.write_element(ElementKind::Object, value, registry)?;
        }
    }
    Ok(())
}

impl Constructor for SchemaConstructor {
    fn id(&self) -> u32 {
        self.def.id
    }

    fn name(&self) -> &str {
        &self.def.predicate
    }

    fn result_type(&self) -> &str {
        &self.def.result_type
    }

    fn decode(&self, reader: &mut Binary, registry: &Registry) -> Result<Object> {
        let mut object = Object::new(self.def.id, self.def.predicate.clone());
        for param in &self.def.params {
            if let ParamKind::Conditional {
                flags_field, bit, ..
            } = &param.kind
            {
                if !self.flag_set(&object, flags_field, *bit)? {
                    continue;
                }
            }
            let value = read_param(&param.kind, reader, registry)?;
            object.fields.push((param.name.clone(), value));
        }
        Ok(object)
    }

    fn encode(&self, object: &Object, writer: &mut Binary, registry: &Registry) -> Result<()> {
        for param in &self.def.params {
            match &param.kind {
                ParamKind::Flags => {
                    let flags = self.compute_flags(object, &param.name);
                    writer.write_uint(flags);
                }
                ParamKind::Conditional { .. } => {
                    if let Some(value) = object.get(&param.name) {
                        write_param(&param.kind, value, writer, registry)?;
                    }
                }
                kind => {
                    let value = object
                        .get(&param.name)
                        .ok_or_else(|| self.missing(&param.name))?;
                    write_param(kind, value, writer, registry)?;
                }
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct Registry {
    constructors: HashMap<u32, Box<dyn Constructor>>,
    layer: Option<u32>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor, returning the one it replaced.
    pub fn register(&mut self, constructor: impl Constructor + 'static) -> Option<Box<dyn Constructor>> {
        self.constructors
            .insert(constructor.id(), Box::new(constructor))
    }

    pub fn register_def(&mut self, def: ConstructorDef) -> Option<Box<dyn Constructor>> {
        self.register(SchemaConstructor::new(def))
    }

    pub fn resolve(&self, id: u32) -> Result<&dyn Constructor> {
        self.get(id).ok_or(TlError::UnknownConstructor { id })
    }

    pub fn get(&self, id: u32) -> Option<&dyn Constructor> {
        self.constructors.get(&id).map(|c| c.as_ref())
    }

    pub fn by_name(&self, name: &str) -> Option<&dyn Constructor> {
        self.constructors
            .values()
            .find(|c| c.name() == name)
            .map(|c| c.as_ref())
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }

    /// Schema layer the registry was built from, if known.
    pub fn layer(&self) -> Option<u32> {
        self.layer
    }

    pub fn set_layer(&mut self, layer: Option<u32>) {
        self.layer = layer;
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("layer", &self.layer)
            .field("constructors", &self.constructors.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// `peer#9db1bc6d flags:# id:long verified:flags.0?true title:flags.1?string = Peer;`
    fn peer_def() -> ConstructorDef {
        ConstructorDef {
            id: 0x9db1_bc6d,
            predicate: "peer".into(),
            params: vec![
                Param {
                    name: "flags".into(),
                    kind: ParamKind::Flags,
                },
                Param {
                    name: "id".into(),
                    kind: ParamKind::Scalar(ElementKind::Long),
                },
                Param {
                    name: "verified".into(),
                    kind: ParamKind::Conditional {
                        flags_field: "flags".into(),
                        bit: 0,
                        inner: Box::new(ParamKind::True),
                    },
                },
                Param {
                    name: "title".into(),
                    kind: ParamKind::Conditional {
                        flags_field: "flags".into(),
                        bit: 1,
                        inner: Box::new(ParamKind::Scalar(ElementKind::String)),
                    },
                },
            ],
            result_type: "Peer".into(),
            is_function: false,
        }
    }

    /// `peers#11111111 list:Vector<Peer> ids:vector<int> = Peers;`
    fn peers_def() -> ConstructorDef {
        ConstructorDef {
            id: 0x1111_1111,
            predicate: "peers".into(),
            params: vec![
                Param {
                    name: "list".into(),
                    kind: ParamKind::Vector(Box::new(ParamKind::Object("Peer".into()))),
                },
                Param {
                    name: "ids".into(),
                    kind: ParamKind::BareVector(Box::new(ParamKind::Scalar(ElementKind::Int))),
                },
            ],
            result_type: "Peers".into(),
            is_function: false,
        }
    }

    fn registry() -> Registry {
        let mut reg = Registry::new();
        reg.register_def(peer_def());
        reg.register_def(peers_def());
        reg
    }

    #[test]
    fn test_resolve_known_and_unknown() {
        let reg = registry();
        assert_eq!(reg.resolve(0x9db1_bc6d).unwrap().name(), "peer");
        assert_eq!(reg.by_name("peers").unwrap().result_type(), "Peers");
        assert!(matches!(
            reg.resolve(42),
            Err(TlError::UnknownConstructor { id: 42 })
        ));
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_flags_computed_from_present_fields() {
        let reg = registry();
        let peer = Object::new(0x9db1_bc6d, "peer")
            .with("id", Value::Long(77))
            .with("title", Value::String("news".into()));

        let mut b = Binary::new();
        b.write_object(&peer, &reg).unwrap();
        // id + flags + long + string("news" -> 1 + 4 + 3 padding)
        assert_eq!(b.remaining(), 4 + 4 + 8 + 8);

        let Value::Object(decoded) = b.read_object(&reg).unwrap() else {
            panic!("expected object");
        };
        assert_eq!(decoded.get("flags"), Some(&Value::Int(0b10)));
        assert_eq!(decoded.get("id"), Some(&Value::Long(77)));
        assert_eq!(decoded.get("verified"), None);
        assert_eq!(decoded.get("title"), Some(&Value::String("news".into())));
    }

    #[test]
    fn test_true_flag_has_no_payload() {
        let reg = registry();
        let peer = Object::new(0x9db1_bc6d, "peer")
            .with("id", Value::Long(1))
            .with("verified", Value::Bool(true));
        let mut b = Binary::new();
        b.write_object(&peer, &reg).unwrap();
        assert_eq!(b.remaining(), 4 + 4 + 8);

        let Value::Object(decoded) = b.read_object(&reg).unwrap() else {
            panic!("expected object");
        };
        assert_eq!(decoded.get("verified"), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_nested_vectors_roundtrip() {
        let reg = registry();
        let peer = Object::new(0x9db1_bc6d, "peer")
            .with("flags", Value::Int(0))
            .with("id", Value::Long(5));
        let peers = Object::new(0x1111_1111, "peers")
            .with(
                "list",
                Value::Vector {
                    kind: ElementKind::Object,
                    items: vec![Value::Object(peer.clone()), Value::Object(peer)],
                },
            )
            .with(
                "ids",
                Value::Vector {
                    kind: ElementKind::Int,
                    items: vec![Value::Int(1), Value::Int(2)],
                },
            );

        let mut b = Binary::new();
        b.write_object(&peers, &reg).unwrap();
        let decoded = b.read_object(&reg).unwrap();
        assert_eq!(decoded, Value::Object(peers));
        assert!(b.is_empty());
    }

    #[test]
    fn test_missing_required_field() {
        let reg = registry();
        let peer = Object::new(0x9db1_bc6d, "peer");
        let mut b = Binary::new();
        let err = b.write_object(&peer, &reg).unwrap_err();
        assert!(matches!(err, TlError::MissingField { .. }));
        assert!(b.is_empty());
    }

    #[test]
    fn test_register_replaces() {
        let mut reg = registry();
        let mut def = peer_def();
        def.predicate = "peerV2".into();
        assert!(reg.register_def(def).is_some());
        assert_eq!(reg.resolve(0x9db1_bc6d).unwrap().name(), "peerV2");
    }
}
