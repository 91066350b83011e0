//! LiveProto Storage -- pluggable persistence for session state.
//!
//! Every backend stores one row per session identifier and one column per
//! session field. Columns are created on first write, typed from the value
//! being written (schema-on-write). The check-then-add-column-then-write
//! sequence runs under a lock owned by the adapter instance.

use std::collections::BTreeMap;
use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub mod file;
#[cfg(feature = "mysql")]
pub mod mysql;
pub mod sqlite;
pub mod text;

pub use file::FileAdapter;
#[cfg(feature = "mysql")]
pub use mysql::{MysqlAdapter, MysqlConfig};
pub use sqlite::SqliteAdapter;
pub use text::TextAdapter;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[cfg(feature = "mysql")]
    #[error("mysql error: {0}")]
    Mysql(#[from] ::mysql::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid identifier {0:?}")]
    InvalidIdentifier(String),
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    #[error("lock poisoned")]
    LockPoisoned,
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// One stored row: column name -> scalar.
pub type Record = BTreeMap<String, ColumnValue>;

/// Scalar value as stored in one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ColumnValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    /// Text produced by [`marshal`]; stored as large text.
    Marshalled(String),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    /// Backends without a native boolean hand back integers or strings.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ColumnValue::Bool(v) => Some(*v),
            ColumnValue::Integer(v) => Some(*v != 0),
            ColumnValue::Text(s) => match s.as_str() {
                "1" | "true" => Some(true),
                "0" | "false" | "" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ColumnValue::Integer(v) => Some(*v),
            ColumnValue::Bool(v) => Some(*v as i64),
            ColumnValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ColumnValue::Real(v) => Some(*v),
            ColumnValue::Integer(v) => Some(*v as f64),
            ColumnValue::Text(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            ColumnValue::Text(s) | ColumnValue::Marshalled(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for ColumnValue {
    fn from(v: bool) -> Self {
        ColumnValue::Bool(v)
    }
}

impl From<i64> for ColumnValue {
    fn from(v: i64) -> Self {
        ColumnValue::Integer(v)
    }
}

impl From<i32> for ColumnValue {
    fn from(v: i32) -> Self {
        ColumnValue::Integer(v as i64)
    }
}

impl From<f64> for ColumnValue {
    fn from(v: f64) -> Self {
        ColumnValue::Real(v)
    }
}

impl From<String> for ColumnValue {
    fn from(v: String) -> Self {
        ColumnValue::Text(v)
    }
}

impl From<&str> for ColumnValue {
    fn from(v: &str) -> Self {
        ColumnValue::Text(v.to_string())
    }
}

impl<T: Into<ColumnValue>> From<Option<T>> for ColumnValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(ColumnValue::Null, Into::into)
    }
}

/// Declared type of a column, chosen at first write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    Boolean,
    BigInt,
    Real,
    Varchar,
    Text,
    LongText,
}

/// Strings up to this many bytes fit a `VARCHAR(255)` column.
pub const VARCHAR_LIMIT: usize = 255;

/// Strings up to this many bytes fit a `TEXT` column.
pub const TEXT_LIMIT: usize = 65_535;

impl ColumnType {
    /// Infer the column type from the runtime kind of a value.
    pub fn infer(value: &ColumnValue) -> Self {
        match value {
            ColumnValue::Bool(_) => ColumnType::Boolean,
            ColumnValue::Integer(_) => ColumnType::BigInt,
            ColumnValue::Real(_) => ColumnType::Real,
            ColumnValue::Marshalled(_) => ColumnType::LongText,
            ColumnValue::Null => ColumnType::Text,
            ColumnValue::Text(s) if s.len() <= VARCHAR_LIMIT => ColumnType::Varchar,
            ColumnValue::Text(s) if s.len() <= TEXT_LIMIT => ColumnType::Text,
            ColumnValue::Text(_) => ColumnType::LongText,
        }
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::BigInt => "BIGINT",
            ColumnType::Real => "REAL",
            ColumnType::Varchar => "VARCHAR(255)",
            ColumnType::Text => "TEXT",
            ColumnType::LongText => "LONGTEXT",
        }
    }

    /// Map a declared SQL type back, for columns discovered on open.
    pub fn from_declared(declared: &str) -> Self {
        let upper = declared.to_ascii_uppercase();
        if upper.starts_with("BOOL") || upper.starts_with("TINYINT(1)") {
            ColumnType::Boolean
        } else if upper.contains("INT") {
            ColumnType::BigInt
        } else if upper.contains("REAL") || upper.contains("DOUBLE") || upper.contains("FLOAT") {
            ColumnType::Real
        } else if upper.starts_with("VARCHAR") {
            ColumnType::Varchar
        } else if upper.starts_with("LONGTEXT") {
            ColumnType::LongText
        } else {
            ColumnType::Text
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Column metadata owned by an adapter: name -> declared type.
pub type ColumnMap = BTreeMap<String, ColumnType>;

/// Persistence contract shared by every session backend.
pub trait StorageAdapter: Send + Sync {
    /// Backend name for logs.
    fn kind(&self) -> &'static str;

    /// Make sure a row exists for `session_id`. Returns `true` when the row
    /// was created (or holds no data yet), meaning the caller must bootstrap.
    fn init(&self, session_id: &str) -> Result<bool>;

    /// Every non-key column of the session row.
    fn get(&self, session_id: &str) -> Result<Option<Record>>;

    /// Add the column if missing, then upsert the value.
    fn set(&self, session_id: &str, column: &str, value: &ColumnValue, ty: ColumnType)
        -> Result<()>;

    /// Clear one field of the session row.
    fn delete(&self, session_id: &str, column: &str) -> Result<()>;

    /// Whether the column exists and holds a value for this session.
    fn exists(&self, session_id: &str, column: &str) -> Result<bool>;

    /// Known columns and their declared types.
    fn columns(&self) -> Result<ColumnMap>;

    /// Durable peer table support, when the backend has one.
    fn peers(&self) -> Option<&dyn PeerStore> {
        None
    }
}

/// Peer cache tables: one row per peer keyed by its integer `id`, columns
/// added on write like the session table.
pub trait PeerStore: Send + Sync {
    /// Create the table if needed. Returns `true` when it was created.
    fn init_peers(&self, table: &str) -> Result<bool>;
    fn set_peer(&self, table: &str, row: &Record) -> Result<()>;
    fn get_peer(&self, table: &str, column: &str, value: &ColumnValue) -> Result<Option<Record>>;
    fn delete_peer(&self, table: &str, column: &str, value: &ColumnValue) -> Result<bool>;
}

/// Serialize a structured value for a text column (JSON, then base64).
pub fn marshal<T: Serialize + ?Sized>(value: &T) -> Result<ColumnValue> {
    let json = serde_json::to_vec(value)?;
    Ok(ColumnValue::Marshalled(BASE64.encode(json)))
}

/// Inverse of [`marshal`].
pub fn unmarshal<T: DeserializeOwned>(value: &ColumnValue) -> Result<T> {
    let text = value
        .as_text()
        .ok_or_else(|| StorageError::InvalidRecord(format!("expected marshalled text, got {value:?}")))?;
    let json = BASE64.decode(text)?;
    Ok(serde_json::from_slice(&json)?)
}

/// Reject identifiers that cannot be column or table names.
pub(crate) fn check_identifier(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidIdentifier(name.to_string()))
    }
}

/// `id` of a peer row, which must be present and integral.
pub(crate) fn peer_key(row: &Record) -> Result<i64> {
    row.get("id")
        .and_then(ColumnValue::as_i64)
        .ok_or_else(|| StorageError::InvalidRecord("peer row without integer `id`".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_types() {
        assert_eq!(ColumnType::infer(&true.into()), ColumnType::Boolean);
        assert_eq!(ColumnType::infer(&7i64.into()), ColumnType::BigInt);
        assert_eq!(ColumnType::infer(&0.5.into()), ColumnType::Real);
        assert_eq!(ColumnType::infer(&ColumnValue::Null), ColumnType::Text);
        assert_eq!(ColumnType::infer(&"short".into()), ColumnType::Varchar);
        assert_eq!(
            ColumnType::infer(&ColumnValue::Text("x".repeat(300))),
            ColumnType::Text
        );
        assert_eq!(
            ColumnType::infer(&ColumnValue::Text("x".repeat(70_000))),
            ColumnType::LongText
        );
        assert_eq!(
            ColumnType::infer(&marshal(&vec![1, 2]).unwrap()),
            ColumnType::LongText
        );
    }

    #[test]
    fn test_declared_roundtrip() {
        for ty in [
            ColumnType::Boolean,
            ColumnType::BigInt,
            ColumnType::Real,
            ColumnType::Varchar,
            ColumnType::Text,
            ColumnType::LongText,
        ] {
            assert_eq!(ColumnType::from_declared(ty.as_sql()), ty);
        }
        assert_eq!(ColumnType::from_declared("tinyint(1)"), ColumnType::Boolean);
        assert_eq!(ColumnType::from_declared("double"), ColumnType::Real);
    }

    #[test]
    fn test_marshal_roundtrip() {
        let tokens: Vec<Vec<u8>> = vec![vec![1, 2, 3], vec![]];
        let value = marshal(&tokens).unwrap();
        let back: Vec<Vec<u8>> = unmarshal(&value).unwrap();
        assert_eq!(back, tokens);

        // Text read back from a backend unmarshals the same way.
        let plain = ColumnValue::Text(value.as_text().unwrap().to_string());
        let back: Vec<Vec<u8>> = unmarshal(&plain).unwrap();
        assert_eq!(back, tokens);
    }

    #[test]
    fn test_unmarshal_rejects_scalars() {
        let err = unmarshal::<Vec<u8>>(&ColumnValue::Integer(1)).unwrap_err();
        assert!(matches!(err, StorageError::InvalidRecord(_)));
    }

    #[test]
    fn test_bool_coercions() {
        assert_eq!(ColumnValue::Integer(1).as_bool(), Some(true));
        assert_eq!(ColumnValue::Text("0".into()).as_bool(), Some(false));
        assert_eq!(ColumnValue::Real(1.0).as_bool(), None);
    }

    #[test]
    fn test_column_value_json_untagged() {
        let record: Record = [
            ("a".to_string(), ColumnValue::Integer(3)),
            ("b".to_string(), ColumnValue::Real(2.5)),
            ("c".to_string(), ColumnValue::Null),
            ("d".to_string(), ColumnValue::Bool(true)),
        ]
        .into_iter()
        .collect();
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"a":3,"b":2.5,"c":null,"d":true}"#);
        let back: Record = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn test_identifiers() {
        assert!(check_identifier("auth_key").is_ok());
        assert!(check_identifier("peers_my.session").is_ok());
        assert!(check_identifier("").is_err());
        assert!(check_identifier("a\"; DROP TABLE x").is_err());
    }
}
