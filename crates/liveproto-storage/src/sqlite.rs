//! Embedded SQLite backend.
//!
//! One `sessions` table keyed by `session_id`; peer caches live in their own
//! tables keyed by integer `id`. WAL mode + busy_timeout so a second process
//! can read while we write.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, ToSql};

use crate::{
    check_identifier, peer_key, ColumnMap, ColumnType, ColumnValue, PeerStore, Record, Result,
    StorageAdapter, StorageError,
};

const SESSION_TABLE: &str = "sessions";
const KEY_COLUMN: &str = "session_id";
const PEER_KEY_COLUMN: &str = "id";

/// Primary key of `table`; never reported as a data column.
fn key_column(table: &str) -> &'static str {
    if table == SESSION_TABLE {
        KEY_COLUMN
    } else {
        PEER_KEY_COLUMN
    }
}

impl ToSql for ColumnValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            ColumnValue::Null => ToSqlOutput::Owned(SqlValue::Null),
            ColumnValue::Bool(v) => ToSqlOutput::Owned(SqlValue::Integer(*v as i64)),
            ColumnValue::Integer(v) => ToSqlOutput::Owned(SqlValue::Integer(*v)),
            ColumnValue::Real(v) => ToSqlOutput::Owned(SqlValue::Real(*v)),
            ColumnValue::Text(s) | ColumnValue::Marshalled(s) => {
                ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes()))
            }
        })
    }
}

fn from_sql_ref(value: ValueRef<'_>) -> ColumnValue {
    match value {
        ValueRef::Null => ColumnValue::Null,
        ValueRef::Integer(v) => ColumnValue::Integer(v),
        ValueRef::Real(v) => ColumnValue::Real(v),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            ColumnValue::Text(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

fn quote(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// SQLite-backed session store.
/// Connection wrapped in Mutex for Send + Sync (rusqlite Connection is !Sync).
pub struct SqliteAdapter {
    conn: Mutex<Connection>,
    /// Session table columns. Held across check-alter-write in `set`.
    columns: Mutex<ColumnMap>,
    /// Peer table columns, per table.
    peer_columns: Mutex<HashMap<String, ColumnMap>>,
    db_path: PathBuf,
}

impl SqliteAdapter {
    fn db(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    fn schema(&self) -> Result<MutexGuard<'_, ColumnMap>> {
        self.columns.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Open (or create) the database at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )?;
        Self::with_connection(conn, db_path.to_path_buf())
    }

    /// In-memory database (tests, throwaway sessions).
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, PathBuf::from(":memory:"))
    }

    fn with_connection(conn: Connection, db_path: PathBuf) -> Result<Self> {
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} ({} TEXT PRIMARY KEY NOT NULL);",
            quote(SESSION_TABLE),
            quote(KEY_COLUMN)
        ))?;
        let columns = table_columns(&conn, SESSION_TABLE)?;
        tracing::debug!(path = %db_path.display(), columns = columns.len(), "sqlite: opened session store");
        Ok(Self {
            conn: Mutex::new(conn),
            columns: Mutex::new(columns),
            peer_columns: Mutex::new(HashMap::new()),
            db_path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }
}

/// Non-key columns of a table, from `PRAGMA table_info`.
fn table_columns(conn: &Connection, table: &str) -> Result<ColumnMap> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote(table)))?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(1)?, row.get::<_, String>(2)?))
    })?;
    let mut columns = ColumnMap::new();
    for row in rows {
        let (name, declared) = row?;
        if name != key_column(table) {
            columns.insert(name, ColumnType::from_declared(&declared));
        }
    }
    Ok(columns)
}

/// Add `column` to `table` unless the cached map already has it. A column
/// added behind our back (another process) is picked up instead of failing.
fn ensure_column(
    conn: &Connection,
    columns: &mut ColumnMap,
    table: &str,
    column: &str,
    ty: ColumnType,
) -> Result<()> {
    if columns.contains_key(column) {
        return Ok(());
    }
    let sql = format!(
        "ALTER TABLE {} ADD COLUMN {} {}",
        quote(table),
        quote(column),
        ty.as_sql()
    );
    if let Err(e) = conn.execute_batch(&sql) {
        *columns = table_columns(conn, table)?;
        if columns.contains_key(column) {
            return Ok(());
        }
        return Err(e.into());
    }
    tracing::info!(table, column, ty = %ty, "sqlite: added column");
    columns.insert(column.to_string(), ty);
    Ok(())
}

fn read_row(row: &rusqlite::Row<'_>, names: &[String], skip: &str) -> rusqlite::Result<Record> {
    let mut record = Record::new();
    for (i, name) in names.iter().enumerate() {
        if name == skip {
            continue;
        }
        record.insert(name.clone(), from_sql_ref(row.get_ref(i)?));
    }
    Ok(record)
}

impl StorageAdapter for SqliteAdapter {
    fn kind(&self) -> &'static str {
        "sqlite"
    }

    fn init(&self, session_id: &str) -> Result<bool> {
        let conn = self.db()?;
        let inserted = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO {} ({}) VALUES (?1)",
                quote(SESSION_TABLE),
                quote(KEY_COLUMN)
            ),
            params![session_id],
        )?;
        if inserted > 0 {
            return Ok(true);
        }
        drop(conn);
        // A row with no populated field was never bootstrapped.
        let populated = self
            .get(session_id)?
            .is_some_and(|record| record.values().any(|v| !v.is_null()));
        Ok(!populated)
    }

    fn get(&self, session_id: &str) -> Result<Option<Record>> {
        let conn = self.db()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM {} WHERE {} = ?1",
            quote(SESSION_TABLE),
            quote(KEY_COLUMN)
        ))?;
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let record = stmt
            .query_row(params![session_id], |row| read_row(row, &names, KEY_COLUMN))
            .optional()?;
        Ok(record)
    }

    fn set(
        &self,
        session_id: &str,
        column: &str,
        value: &ColumnValue,
        ty: ColumnType,
    ) -> Result<()> {
        check_identifier(column)?;
        let mut columns = self.schema()?;
        let conn = self.db()?;
        ensure_column(&conn, &mut columns, SESSION_TABLE, column, ty)?;
        conn.execute(
            &format!(
                "INSERT INTO {table} ({key}, {col}) VALUES (?1, ?2)
                 ON CONFLICT({key}) DO UPDATE SET {col} = excluded.{col}",
                table = quote(SESSION_TABLE),
                key = quote(KEY_COLUMN),
                col = quote(column)
            ),
            params![session_id, value],
        )?;
        Ok(())
    }

    fn delete(&self, session_id: &str, column: &str) -> Result<()> {
        let columns = self.schema()?;
        if !columns.contains_key(column) {
            return Ok(());
        }
        let conn = self.db()?;
        conn.execute(
            &format!(
                "UPDATE {} SET {} = NULL WHERE {} = ?1",
                quote(SESSION_TABLE),
                quote(column),
                quote(KEY_COLUMN)
            ),
            params![session_id],
        )?;
        Ok(())
    }

    fn exists(&self, session_id: &str, column: &str) -> Result<bool> {
        let columns = self.schema()?;
        if !columns.contains_key(column) {
            return Ok(false);
        }
        let conn = self.db()?;
        let present: Option<bool> = conn
            .query_row(
                &format!(
                    "SELECT {} IS NOT NULL FROM {} WHERE {} = ?1",
                    quote(column),
                    quote(SESSION_TABLE),
                    quote(KEY_COLUMN)
                ),
                params![session_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(present.unwrap_or(false))
    }

    fn columns(&self) -> Result<ColumnMap> {
        Ok(self.schema()?.clone())
    }

    fn peers(&self) -> Option<&dyn PeerStore> {
        Some(self)
    }
}

impl PeerStore for SqliteAdapter {
    fn init_peers(&self, table: &str) -> Result<bool> {
        check_identifier(table)?;
        let mut peer_columns = self
            .peer_columns
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?;
        let conn = self.db()?;
        let existed: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get(0),
        )?;
        if !existed {
            conn.execute_batch(&format!(
                "CREATE TABLE {} (\"id\" INTEGER PRIMARY KEY NOT NULL);",
                quote(table)
            ))?;
            tracing::info!(table, "sqlite: created peer table");
        }
        peer_columns.insert(table.to_string(), table_columns(&conn, table)?);
        Ok(!existed)
    }

    fn set_peer(&self, table: &str, row: &Record) -> Result<()> {
        check_identifier(table)?;
        let id = peer_key(row)?;
        let mut peer_columns = self
            .peer_columns
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?;
        let conn = self.db()?;
        if !peer_columns.contains_key(table) {
            peer_columns.insert(table.to_string(), table_columns(&conn, table)?);
        }
        let columns = peer_columns
            .get_mut(table)
            .ok_or_else(|| StorageError::InvalidRecord(format!("unknown peer table {table}")))?;

        let fields: Vec<(&String, &ColumnValue)> =
            row.iter().filter(|(name, _)| name.as_str() != "id").collect();
        for (name, value) in &fields {
            check_identifier(name)?;
            ensure_column(&conn, columns, table, name, ColumnType::infer(value))?;
        }

        let mut names = vec![quote("id")];
        names.extend(fields.iter().map(|(name, _)| quote(name)));
        let placeholders: Vec<String> = (1..=names.len()).map(|i| format!("?{i}")).collect();
        let updates: Vec<String> = fields
            .iter()
            .map(|(name, _)| format!("{0} = excluded.{0}", quote(name)))
            .collect();
        let sql = if updates.is_empty() {
            format!(
                "INSERT OR IGNORE INTO {} ({}) VALUES ({})",
                quote(table),
                names.join(", "),
                placeholders.join(", ")
            )
        } else {
            format!(
                "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT(\"id\") DO UPDATE SET {}",
                quote(table),
                names.join(", "),
                placeholders.join(", "),
                updates.join(", ")
            )
        };

        let key = ColumnValue::Integer(id);
        let values = std::iter::once(&key).chain(fields.iter().map(|(_, value)| *value));
        conn.execute(&sql, params_from_iter(values))?;
        Ok(())
    }

    fn get_peer(&self, table: &str, column: &str, value: &ColumnValue) -> Result<Option<Record>> {
        check_identifier(table)?;
        let conn = self.db()?;
        let known = column == "id" || table_columns(&conn, table)?.contains_key(column);
        if !known {
            return Ok(None);
        }
        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM {} WHERE {} = ?1 LIMIT 1",
            quote(table),
            quote(column)
        ))?;
        let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
        let record = stmt
            .query_row(params![value], |row| read_row(row, &names, ""))
            .optional()?;
        Ok(record)
    }

    fn delete_peer(&self, table: &str, column: &str, value: &ColumnValue) -> Result<bool> {
        check_identifier(table)?;
        check_identifier(column)?;
        let conn = self.db()?;
        let changes = conn.execute(
            &format!("DELETE FROM {} WHERE {} = ?1", quote(table), quote(column)),
            params![value],
        )?;
        Ok(changes > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_db() -> (tempfile::TempDir, SqliteAdapter) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("session.db");
        let adapter = SqliteAdapter::open(&db_path).unwrap();
        (dir, adapter)
    }

    fn set(adapter: &SqliteAdapter, column: &str, value: ColumnValue) {
        let ty = ColumnType::infer(&value);
        adapter.set("main", column, &value, ty).unwrap();
    }

    #[test]
    fn test_init_reports_creation() {
        let (_dir, adapter) = test_db();
        assert!(adapter.init("main").unwrap());
        // Row exists but was never populated.
        assert!(adapter.init("main").unwrap());
        set(&adapter, "dc", 2i64.into());
        assert!(!adapter.init("main").unwrap());
    }

    #[test]
    fn test_set_get_roundtrip() {
        let (_dir, adapter) = test_db();
        adapter.init("main").unwrap();
        set(&adapter, "dc", 4i64.into());
        set(&adapter, "ip", "149.154.167.91".into());
        set(&adapter, "ipv6", false.into());
        set(&adapter, "ratio", 0.75.into());

        let record = adapter.get("main").unwrap().unwrap();
        assert_eq!(record["dc"], ColumnValue::Integer(4));
        assert_eq!(record["ip"].as_text(), Some("149.154.167.91"));
        assert_eq!(record["ipv6"].as_bool(), Some(false));
        assert_eq!(record["ratio"], ColumnValue::Real(0.75));
        assert!(!record.contains_key(KEY_COLUMN));
        assert!(adapter.get("other").unwrap().is_none());
    }

    #[test]
    fn test_schema_on_write_adds_one_typed_column() {
        let (_dir, adapter) = test_db();
        adapter.init("main").unwrap();
        assert!(adapter.columns().unwrap().is_empty());

        set(&adapter, "salt", 99i64.into());
        set(&adapter, "salt", 100i64.into());
        let columns = adapter.columns().unwrap();
        assert_eq!(columns.len(), 1);
        assert_eq!(columns["salt"], ColumnType::BigInt);

        set(&adapter, "authorized", true.into());
        let columns = adapter.columns().unwrap();
        assert_eq!(columns.len(), 2);
        assert_eq!(columns["authorized"], ColumnType::Boolean);
    }

    #[test]
    fn test_columns_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.db");
        {
            let adapter = SqliteAdapter::open(&path).unwrap();
            adapter.init("main").unwrap();
            set(&adapter, "port", 443i64.into());
        }
        let adapter = SqliteAdapter::open(&path).unwrap();
        assert_eq!(adapter.columns().unwrap()["port"], ColumnType::BigInt);
        assert!(!adapter.init("main").unwrap());
    }

    #[test]
    fn test_session_id_column_writable_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.db");
        {
            let adapter = SqliteAdapter::open(&path).unwrap();
            adapter.init("main").unwrap();
            set(&adapter, "id", 7i64.into());
        }
        let adapter = SqliteAdapter::open(&path).unwrap();
        assert_eq!(adapter.columns().unwrap()["id"], ColumnType::BigInt);
        set(&adapter, "id", 4242i64.into());
        let record = adapter.get("main").unwrap().unwrap();
        assert_eq!(record["id"], ColumnValue::Integer(4242));
        assert!(adapter.exists("main", "id").unwrap());
    }

    #[test]
    fn test_two_handles_same_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.db");
        let a = SqliteAdapter::open(&path).unwrap();
        let b = SqliteAdapter::open(&path).unwrap();
        a.init("main").unwrap();
        a.set("main", "salt", &1i64.into(), ColumnType::BigInt)
            .unwrap();
        // `b` still thinks the column is missing; the failed ALTER is absorbed.
        b.set("main", "salt", &2i64.into(), ColumnType::BigInt)
            .unwrap();
        assert_eq!(a.get("main").unwrap().unwrap()["salt"], ColumnValue::Integer(2));
    }

    #[test]
    fn test_concurrent_set_new_columns() {
        let (_dir, adapter) = test_db();
        adapter.init("main").unwrap();
        let adapter = Arc::new(adapter);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let adapter = Arc::clone(&adapter);
                std::thread::spawn(move || {
                    adapter
                        .set("main", "shared", &ColumnValue::Integer(i), ColumnType::BigInt)
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(adapter.columns().unwrap().len(), 1);
    }

    #[test]
    fn test_delete_and_exists() {
        let (_dir, adapter) = test_db();
        adapter.init("main").unwrap();
        assert!(!adapter.exists("main", "salt").unwrap());
        set(&adapter, "salt", 5i64.into());
        assert!(adapter.exists("main", "salt").unwrap());
        adapter.delete("main", "salt").unwrap();
        assert!(!adapter.exists("main", "salt").unwrap());
        // Column stays; only the value is cleared.
        assert!(adapter.columns().unwrap().contains_key("salt"));
        adapter.delete("main", "never_written").unwrap();
    }

    #[test]
    fn test_rows_are_per_session() {
        let (_dir, adapter) = test_db();
        adapter.init("a").unwrap();
        adapter.init("b").unwrap();
        adapter
            .set("a", "dc", &1i64.into(), ColumnType::BigInt)
            .unwrap();
        adapter
            .set("b", "dc", &3i64.into(), ColumnType::BigInt)
            .unwrap();
        assert_eq!(adapter.get("a").unwrap().unwrap()["dc"], ColumnValue::Integer(1));
        assert_eq!(adapter.get("b").unwrap().unwrap()["dc"], ColumnValue::Integer(3));
    }

    #[test]
    fn test_bad_column_name_rejected() {
        let (_dir, adapter) = test_db();
        let err = adapter
            .set("main", "x\" TEXT; --", &ColumnValue::Null, ColumnType::Text)
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidIdentifier(_)));
    }

    #[test]
    fn test_peer_store() {
        let (_dir, adapter) = test_db();
        let peers = adapter.peers().unwrap();
        assert!(peers.init_peers("peers_main").unwrap());
        assert!(!peers.init_peers("peers_main").unwrap());

        let row: Record = [
            ("id".to_string(), ColumnValue::Integer(1001)),
            ("access_hash".to_string(), ColumnValue::Integer(-5)),
            ("username".to_string(), ColumnValue::Text("durov".into())),
        ]
        .into_iter()
        .collect();
        peers.set_peer("peers_main", &row).unwrap();

        let found = peers
            .get_peer("peers_main", "username", &"durov".into())
            .unwrap()
            .unwrap();
        assert_eq!(found["access_hash"], ColumnValue::Integer(-5));
        assert_eq!(found["id"], ColumnValue::Integer(1001));

        // Upsert keeps one row per id.
        let mut updated = row.clone();
        updated.insert("access_hash".into(), ColumnValue::Integer(6));
        peers.set_peer("peers_main", &updated).unwrap();
        let found = peers
            .get_peer("peers_main", "id", &1001i64.into())
            .unwrap()
            .unwrap();
        assert_eq!(found["access_hash"], ColumnValue::Integer(6));

        assert!(peers
            .get_peer("peers_main", "phone", &"1".into())
            .unwrap()
            .is_none());
        assert!(peers
            .delete_peer("peers_main", "id", &1001i64.into())
            .unwrap());
        assert!(peers
            .get_peer("peers_main", "id", &1001i64.into())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_peer_row_requires_id() {
        let (_dir, adapter) = test_db();
        adapter.init_peers("peers_main").unwrap();
        let row: Record = [("username".to_string(), ColumnValue::Text("x".into()))]
            .into_iter()
            .collect();
        assert!(matches!(
            adapter.set_peer("peers_main", &row),
            Err(StorageError::InvalidRecord(_))
        ));
    }
}
