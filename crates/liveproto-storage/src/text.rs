//! Inline backend: the whole session travels as one base64 string.

use std::sync::{Mutex, MutexGuard};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::file::Document;
use crate::{
    ColumnMap, ColumnType, ColumnValue, PeerStore, Record, Result, StorageAdapter, StorageError,
};

/// Row key used for sessions carried inline.
pub const INLINE_SESSION_ID: &str = "session";

/// In-memory document, imported from and exported to base64 JSON.
pub struct TextAdapter {
    doc: Mutex<Document>,
}

impl TextAdapter {
    pub fn empty() -> Self {
        Self {
            doc: Mutex::new(Document::default()),
        }
    }

    /// Decode a string produced by [`TextAdapter::export`]. Surrounding
    /// whitespace is ignored; an empty string is an empty session.
    pub fn decode(encoded: &str) -> Result<Self> {
        let encoded = encoded.trim();
        if encoded.is_empty() {
            return Ok(Self::empty());
        }
        let json = BASE64.decode(encoded)?;
        let doc: Document = serde_json::from_slice(&json)?;
        tracing::debug!(rows = doc.rows.len(), "text: decoded inline session");
        Ok(Self {
            doc: Mutex::new(doc),
        })
    }

    /// Build an inline string from a single record.
    pub fn encode_record(record: &Record) -> Result<String> {
        let adapter = Self::empty();
        for (column, value) in record {
            adapter.set(INLINE_SESSION_ID, column, value, ColumnType::infer(value))?;
        }
        adapter.export()
    }

    pub fn export(&self) -> Result<String> {
        let json = serde_json::to_vec(&*self.doc()?)?;
        Ok(BASE64.encode(json))
    }

    fn doc(&self) -> Result<MutexGuard<'_, Document>> {
        self.doc.lock().map_err(|_| StorageError::LockPoisoned)
    }
}

impl StorageAdapter for TextAdapter {
    fn kind(&self) -> &'static str {
        "text"
    }

    fn init(&self, session_id: &str) -> Result<bool> {
        Ok(self.doc()?.init(session_id))
    }

    fn get(&self, session_id: &str) -> Result<Option<Record>> {
        Ok(self.doc()?.rows.get(session_id).cloned())
    }

    fn set(
        &self,
        session_id: &str,
        column: &str,
        value: &ColumnValue,
        ty: ColumnType,
    ) -> Result<()> {
        self.doc()?.set(session_id, column, value, ty)?;
        Ok(())
    }

    fn delete(&self, session_id: &str, column: &str) -> Result<()> {
        self.doc()?.delete(session_id, column);
        Ok(())
    }

    fn exists(&self, session_id: &str, column: &str) -> Result<bool> {
        Ok(self.doc()?.exists(session_id, column))
    }

    fn columns(&self) -> Result<ColumnMap> {
        Ok(self.doc()?.columns.clone())
    }

    fn peers(&self) -> Option<&dyn PeerStore> {
        Some(self)
    }
}

impl PeerStore for TextAdapter {
    fn init_peers(&self, table: &str) -> Result<bool> {
        self.doc()?.init_peers(table)
    }

    fn set_peer(&self, table: &str, row: &Record) -> Result<()> {
        self.doc()?.set_peer(table, row)
    }

    fn get_peer(&self, table: &str, column: &str, value: &ColumnValue) -> Result<Option<Record>> {
        Ok(self.doc()?.get_peer(table, column, value))
    }

    fn delete_peer(&self, table: &str, column: &str, value: &ColumnValue) -> Result<bool> {
        Ok(self.doc()?.delete_peer(table, column, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_then_decode() {
        let adapter = TextAdapter::empty();
        assert!(adapter.init(INLINE_SESSION_ID).unwrap());
        adapter
            .set(INLINE_SESSION_ID, "dc", &5i64.into(), ColumnType::BigInt)
            .unwrap();
        let encoded = adapter.export().unwrap();
        assert!(encoded.is_ascii());

        let loaded = TextAdapter::decode(&format!("  {encoded}\n")).unwrap();
        assert!(!loaded.init(INLINE_SESSION_ID).unwrap());
        let record = loaded.get(INLINE_SESSION_ID).unwrap().unwrap();
        assert_eq!(record["dc"], ColumnValue::Integer(5));
        assert_eq!(loaded.columns().unwrap()["dc"], ColumnType::BigInt);
    }

    #[test]
    fn test_encode_record() {
        let record: Record = [
            ("ip".to_string(), ColumnValue::Text("91.108.56.180".into())),
            ("port".to_string(), ColumnValue::Integer(443)),
        ]
        .into_iter()
        .collect();
        let encoded = TextAdapter::encode_record(&record).unwrap();
        let loaded = TextAdapter::decode(&encoded).unwrap();
        assert_eq!(loaded.get(INLINE_SESSION_ID).unwrap(), Some(record));
    }

    #[test]
    fn test_empty_string_is_fresh_session() {
        let adapter = TextAdapter::decode("").unwrap();
        assert!(adapter.init(INLINE_SESSION_ID).unwrap());
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            TextAdapter::decode("not base64!!"),
            Err(StorageError::Base64(_))
        ));
        let not_json = BASE64.encode(b"[1,2");
        assert!(matches!(
            TextAdapter::decode(&not_json),
            Err(StorageError::Json(_))
        ));
    }
}
