//! TL schema text parser.
//!
//! Accepts the usual one-definition-per-line format:
//!
//! ```text
//! // LAYER 158
//! user#d3bc4b7a flags:# id:long first_name:flags.1?string = User;
//! ---functions---
//! help.getConfig#c4f9186b = Config;
//! ```
//!
//! Builtin lines without an explicit `#id` (`int ? = Int;`, `vector ...`) are
//! skipped. Generic parameters in braces are ignored.

use std::str::FromStr;

use crate::registry::{ConstructorDef, Param, ParamKind, Registry};
use crate::value::ElementKind;
use crate::{Result, TlError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schema {
    pub layer: Option<u32>,
    pub constructors: Vec<ConstructorDef>,
    pub functions: Vec<ConstructorDef>,
}

impl Schema {
    pub fn parse(text: &str) -> Result<Self> {
        let mut schema = Schema::default();
        let mut in_functions = false;

        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(comment) = line.strip_prefix("//") {
                if let Some(layer) = comment.trim().strip_prefix("LAYER") {
                    schema.layer = layer.trim().parse().ok();
                }
                continue;
            }
            match line {
                "---functions---" => {
                    in_functions = true;
                    continue;
                }
                "---types---" => {
                    in_functions = false;
                    continue;
                }
                _ => {}
            }

            let Some(mut def) = parse_definition(line)
                .map_err(|reason| TlError::Schema {
                    line: line_no,
                    reason,
                })?
            else {
                continue;
            };
            def.is_function = in_functions;
            if in_functions {
                schema.functions.push(def);
            } else {
                schema.constructors.push(def);
            }
        }

        tracing::debug!(
            layer = ?schema.layer,
            constructors = schema.constructors.len(),
            functions = schema.functions.len(),
            "parsed TL schema"
        );
        Ok(schema)
    }

    /// Registry over every constructor and function in the schema.
    pub fn to_registry(&self) -> Registry {
        let mut registry = Registry::new();
        registry.set_layer(self.layer);
        for def in self.constructors.iter().chain(self.functions.iter()) {
            registry.register_def(def.clone());
        }
        registry
    }
}

impl FromStr for Schema {
    type Err = TlError;

    fn from_str(s: &str) -> Result<Self> {
        Schema::parse(s)
    }
}

/// `Ok(None)` for lines that define no numbered constructor.
fn parse_definition(line: &str) -> std::result::Result<Option<ConstructorDef>, String> {
    let body = line.trim_end_matches(';').trim();
    let (lhs, rhs) = body
        .split_once('=')
        .ok_or_else(|| "missing '=' before result type".to_string())?;

    let mut tokens = lhs.split_whitespace();
    let head = tokens.next().ok_or_else(|| "empty definition".to_string())?;
    let Some((predicate, hex_id)) = head.split_once('#') else {
        return Ok(None);
    };
    let id = u32::from_str_radix(hex_id, 16).map_err(|e| format!("bad constructor id {hex_id:?}: {e}"))?;

    let mut params = Vec::new();
    for token in tokens {
        if token.starts_with('{') || token == "?" {
            continue;
        }
        let (name, ty) = token
            .split_once(':')
            .ok_or_else(|| format!("parameter {token:?} has no type"))?;
        params.push(Param {
            name: name.to_string(),
            kind: parse_kind(ty)?,
        });
    }

    Ok(Some(ConstructorDef {
        id,
        predicate: predicate.to_string(),
        params,
        result_type: rhs.trim().to_string(),
        is_function: false,
    }))
}

fn parse_kind(ty: &str) -> std::result::Result<ParamKind, String> {
    if ty == "#" {
        return Ok(ParamKind::Flags);
    }
    if let Some((condition, inner)) = ty.split_once('?') {
        let (flags_field, bit) = condition
            .split_once('.')
            .ok_or_else(|| format!("bad flag condition {condition:?}"))?;
        let bit: u8 = bit
            .parse()
            .ok()
            .filter(|b| *b < 32)
            .ok_or_else(|| format!("bad flag bit in {condition:?}"))?;
        return Ok(ParamKind::Conditional {
            flags_field: flags_field.to_string(),
            bit,
            inner: Box::new(parse_kind(inner)?),
        });
    }
    if let Some(inner) = ty.strip_prefix("Vector<").and_then(|t| t.strip_suffix('>')) {
        return Ok(ParamKind::Vector(Box::new(parse_kind(inner)?)));
    }
    if let Some(inner) = ty.strip_prefix("vector<").and_then(|t| t.strip_suffix('>')) {
        return Ok(ParamKind::BareVector(Box::new(parse_kind(inner)?)));
    }
    if ty == "true" {
        return Ok(ParamKind::True);
    }
    if let Some(generic) = ty.strip_prefix('!') {
        return Ok(ParamKind::Object(generic.to_string()));
    }
    Ok(match ElementKind::from_type_name(ty) {
        ElementKind::Object => ParamKind::Object(ty.to_string()),
        scalar => ParamKind::Scalar(scalar),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::Binary;
    use crate::value::{Object, Value};

    const SAMPLE: &str = r#"
// Core types
int ? = Int;
vector {t:Type} # [ t ] = Vector t;

// LAYER 158
boolFalse#bc799737 = Bool;
userEmpty#d3bc4b7a id:long = User;
user#83314fca flags:# bot:flags.14?true id:long first_name:flags.1?string photos:Vector<long> = User;
---functions---
invokeWithLayer#da9b0d0d {X:Type} layer:int query:!X = X;
users.getUsers#0d91a548 id:Vector<InputUser> = Vector<User>;
"#;

    #[test]
    fn test_parse_sample() {
        let schema: Schema = SAMPLE.parse().unwrap();
        assert_eq!(schema.layer, Some(158));
        assert_eq!(schema.constructors.len(), 3);
        assert_eq!(schema.functions.len(), 2);

        let user = &schema.constructors[2];
        assert_eq!(user.id, 0x8331_4fca);
        assert_eq!(user.result_type, "User");
        assert_eq!(user.params[0].kind, ParamKind::Flags);
        assert_eq!(
            user.params[1].kind,
            ParamKind::Conditional {
                flags_field: "flags".into(),
                bit: 14,
                inner: Box::new(ParamKind::True)
            }
        );
        assert_eq!(
            user.params[4].kind,
            ParamKind::Vector(Box::new(ParamKind::Scalar(ElementKind::Long)))
        );

        let invoke = &schema.functions[0];
        assert!(invoke.is_function);
        assert_eq!(invoke.params.len(), 2);
        assert_eq!(invoke.params[1].kind, ParamKind::Object("X".into()));
    }

    #[test]
    fn test_registry_from_schema_decodes() {
        let registry = Schema::parse(SAMPLE).unwrap().to_registry();
        assert_eq!(registry.layer(), Some(158));

        let user = Object::new(0x8331_4fca, "user")
            .with("bot", Value::Bool(true))
            .with("id", Value::Long(1000))
            .with("first_name", Value::String("Ada".into()))
            .with(
                "photos",
                Value::Vector {
                    kind: ElementKind::Long,
                    items: vec![Value::Long(1)],
                },
            );

        let mut b = Binary::new();
        b.write_object(&user, &registry).unwrap();
        assert_eq!(b.describe(&registry), "user");

        let decoded = b.read_object(&registry).unwrap();
        let decoded = decoded.as_object().unwrap();
        assert_eq!(
            decoded.get("flags"),
            Some(&Value::Int((1 << 14) | (1 << 1)))
        );
        assert_eq!(decoded.get("first_name").and_then(Value::as_str), Some("Ada"));
    }

    #[test]
    fn test_bad_lines_report_line_number() {
        let err = Schema::parse("ok#1 = T;\nbroken#zz = T;").unwrap_err();
        match err {
            TlError::Schema { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected {other:?}"),
        }
        assert!(Schema::parse("x#1 a = T;").is_err());
        assert!(Schema::parse("x#1 a:flags.40?int = T;").is_err());
        assert!(Schema::parse("x#1 a:int").is_err());
    }
}
