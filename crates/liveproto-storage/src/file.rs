//! Single-file JSON backend (`<name>.session`).
//!
//! The whole document is rewritten on every `set`, through a temp file and a
//! rename so a crash never leaves a half-written session.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::{
    check_identifier, peer_key, ColumnMap, ColumnType, ColumnValue, PeerStore, Record, Result,
    StorageAdapter, StorageError,
};

/// Extension appended to the session name.
pub const SESSION_EXTENSION: &str = "session";

/// Everything a session file or inline string holds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub columns: ColumnMap,
    #[serde(default)]
    pub rows: BTreeMap<String, Record>,
    /// Peer tables: table -> peer id -> row.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub peers: BTreeMap<String, BTreeMap<i64, Record>>,
}

impl Document {
    /// `true` when the row was absent or empty.
    pub(crate) fn init(&mut self, session_id: &str) -> bool {
        let row = self.rows.entry(session_id.to_string()).or_default();
        row.values().all(ColumnValue::is_null)
    }

    pub(crate) fn set(
        &mut self,
        session_id: &str,
        column: &str,
        value: &ColumnValue,
        ty: ColumnType,
    ) -> Result<bool> {
        check_identifier(column)?;
        let added = !self.columns.contains_key(column);
        if added {
            self.columns.insert(column.to_string(), ty);
        }
        self.rows
            .entry(session_id.to_string())
            .or_default()
            .insert(column.to_string(), value.clone());
        Ok(added)
    }

    pub(crate) fn delete(&mut self, session_id: &str, column: &str) -> bool {
        match self.rows.get_mut(session_id).and_then(|row| row.get_mut(column)) {
            Some(value) if !value.is_null() => {
                *value = ColumnValue::Null;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn exists(&self, session_id: &str, column: &str) -> bool {
        self.rows
            .get(session_id)
            .and_then(|row| row.get(column))
            .is_some_and(|value| !value.is_null())
    }

    pub(crate) fn init_peers(&mut self, table: &str) -> Result<bool> {
        check_identifier(table)?;
        if self.peers.contains_key(table) {
            return Ok(false);
        }
        self.peers.insert(table.to_string(), BTreeMap::new());
        Ok(true)
    }

    pub(crate) fn set_peer(&mut self, table: &str, row: &Record) -> Result<()> {
        check_identifier(table)?;
        let id = peer_key(row)?;
        let entry = self
            .peers
            .entry(table.to_string())
            .or_default()
            .entry(id)
            .or_default();
        for (name, value) in row {
            check_identifier(name)?;
            entry.insert(name.clone(), value.clone());
        }
        Ok(())
    }

    pub(crate) fn get_peer(&self, table: &str, column: &str, value: &ColumnValue) -> Option<Record> {
        let rows = self.peers.get(table)?;
        if column == "id" {
            return value.as_i64().and_then(|id| rows.get(&id)).cloned();
        }
        rows.values()
            .find(|row| row.get(column) == Some(value))
            .cloned()
    }

    pub(crate) fn delete_peer(&mut self, table: &str, column: &str, value: &ColumnValue) -> bool {
        let Some(rows) = self.peers.get_mut(table) else {
            return false;
        };
        let before = rows.len();
        rows.retain(|id, row| {
            let hit = if column == "id" {
                value.as_i64() == Some(*id)
            } else {
                row.get(column) == Some(value)
            };
            !hit
        });
        rows.len() != before
    }
}

/// JSON document on disk.
pub struct FileAdapter {
    path: PathBuf,
    doc: Mutex<Document>,
}

impl FileAdapter {
    /// Open `<dir>/<name>.session`, creating nothing until the first write.
    pub fn open_named(dir: &Path, name: &str) -> Result<Self> {
        let file_name = if name.ends_with(&format!(".{SESSION_EXTENSION}")) {
            name.to_string()
        } else {
            format!("{name}.{SESSION_EXTENSION}")
        };
        Self::open(&dir.join(file_name))
    }

    pub fn open(path: &Path) -> Result<Self> {
        let doc = match std::fs::read(path) {
            Ok(bytes) if bytes.is_empty() => Document::default(),
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Document::default(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = %path.display(), rows = doc.rows.len(), "file: opened session store");
        Ok(Self {
            path: path.to_path_buf(),
            doc: Mutex::new(doc),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn doc(&self) -> Result<MutexGuard<'_, Document>> {
        self.doc.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Write the document next to the target, then rename over it.
    fn flush(&self, doc: &Document) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension(format!("{SESSION_EXTENSION}.tmp"));
        std::fs::write(&tmp, serde_json::to_vec_pretty(doc)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl StorageAdapter for FileAdapter {
    fn kind(&self) -> &'static str {
        "file"
    }

    fn init(&self, session_id: &str) -> Result<bool> {
        let mut doc = self.doc()?;
        let existed = doc.rows.contains_key(session_id);
        let created = doc.init(session_id);
        if !existed {
            self.flush(&doc)?;
        }
        Ok(created)
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
        let mut doc = self.doc()?;
        if doc.set(session_id, column, value, ty)? {
            tracing::info!(column, ty = %ty, "file: added column");
        }
        self.flush(&doc)
    }

    fn delete(&self, session_id: &str, column: &str) -> Result<()> {
        let mut doc = self.doc()?;
        if doc.delete(session_id, column) {
            self.flush(&doc)?;
        }
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

impl PeerStore for FileAdapter {
    fn init_peers(&self, table: &str) -> Result<bool> {
        let mut doc = self.doc()?;
        let created = doc.init_peers(table)?;
        if created {
            self.flush(&doc)?;
        }
        Ok(created)
    }

    fn set_peer(&self, table: &str, row: &Record) -> Result<()> {
        let mut doc = self.doc()?;
        doc.set_peer(table, row)?;
        self.flush(&doc)
    }

    fn get_peer(&self, table: &str, column: &str, value: &ColumnValue) -> Result<Option<Record>> {
        Ok(self.doc()?.get_peer(table, column, value))
    }

    fn delete_peer(&self, table: &str, column: &str, value: &ColumnValue) -> Result<bool> {
        let mut doc = self.doc()?;
        let removed = doc.delete_peer(table, column, value);
        if removed {
            self.flush(&doc)?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_path() {
        let dir = tempfile::tempdir().unwrap();
        let a = FileAdapter::open_named(dir.path(), "bot").unwrap();
        assert_eq!(a.path(), dir.path().join("bot.session"));
        let b = FileAdapter::open_named(dir.path(), "bot.session").unwrap();
        assert_eq!(b.path(), dir.path().join("bot.session"));
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("main.session");
        {
            let adapter = FileAdapter::open(&path).unwrap();
            assert!(adapter.init("main").unwrap());
            adapter
                .set("main", "dc", &2i64.into(), ColumnType::BigInt)
                .unwrap();
            adapter
                .set("main", "ip", &"149.154.167.51".into(), ColumnType::Varchar)
                .unwrap();
        }
        let adapter = FileAdapter::open(&path).unwrap();
        assert!(!adapter.init("main").unwrap());
        let record = adapter.get("main").unwrap().unwrap();
        assert_eq!(record["dc"], ColumnValue::Integer(2));
        assert_eq!(record["ip"].as_text(), Some("149.154.167.51"));
        assert_eq!(adapter.columns().unwrap()["ip"], ColumnType::Varchar);
        assert!(!dir.path().join("main.session.tmp").exists());
    }

    #[test]
    fn test_first_column_type_sticks() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = FileAdapter::open(&dir.path().join("s.session")).unwrap();
        adapter.init("main").unwrap();
        adapter
            .set("main", "salt", &1i64.into(), ColumnType::BigInt)
            .unwrap();
        adapter
            .set("main", "salt", &"x".into(), ColumnType::Varchar)
            .unwrap();
        assert_eq!(adapter.columns().unwrap()["salt"], ColumnType::BigInt);
    }

    #[test]
    fn test_delete_and_exists() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = FileAdapter::open(&dir.path().join("s.session")).unwrap();
        adapter.init("main").unwrap();
        adapter
            .set("main", "api_hash", &"abc".into(), ColumnType::Varchar)
            .unwrap();
        assert!(adapter.exists("main", "api_hash").unwrap());
        adapter.delete("main", "api_hash").unwrap();
        assert!(!adapter.exists("main", "api_hash").unwrap());
        assert!(!adapter.exists("other", "api_hash").unwrap());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.session");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(FileAdapter::open(&path), Err(StorageError::Json(_))));
    }

    #[test]
    fn test_peers() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = FileAdapter::open(&dir.path().join("s.session")).unwrap();
        assert!(adapter.init_peers("peers_main").unwrap());
        assert!(!adapter.init_peers("peers_main").unwrap());
        let row: Record = [
            ("id".to_string(), ColumnValue::Integer(7)),
            ("username".to_string(), ColumnValue::Text("alice".into())),
        ]
        .into_iter()
        .collect();
        adapter.set_peer("peers_main", &row).unwrap();
        assert_eq!(
            adapter
                .get_peer("peers_main", "username", &"alice".into())
                .unwrap(),
            Some(row.clone())
        );
        assert_eq!(
            adapter.get_peer("peers_main", "id", &7i64.into()).unwrap(),
            Some(row)
        );
        assert!(adapter
            .delete_peer("peers_main", "username", &"alice".into())
            .unwrap());
        assert!(!adapter
            .delete_peer("peers_main", "username", &"alice".into())
            .unwrap());
    }
}
