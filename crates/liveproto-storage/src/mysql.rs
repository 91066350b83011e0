//! MySQL backend (feature `mysql`).
//!
//! Same layout as the SQLite backend: `sessions` keyed by `session_id`, peer
//! tables keyed by `id`. Identifiers are backtick-quoted.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use ::mysql::prelude::Queryable;
use ::mysql::{OptsBuilder, Params, Pool, PooledConn, Row, Value as SqlValue};

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
const DEFAULT_PORT: u16 = 3306;

/// Connection settings. `server` is `host` or `host:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MysqlConfig {
    pub server: String,
    pub username: String,
    pub password: String,
    pub database: String,
}

impl MysqlConfig {
    fn host_port(&self) -> (String, u16) {
        match self.server.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') || host.ends_with(']') => {
                match port.parse() {
                    Ok(port) => (host.trim_matches(['[', ']']).to_string(), port),
                    Err(_) => (self.server.clone(), DEFAULT_PORT),
                }
            }
            _ => (self.server.clone(), DEFAULT_PORT),
        }
    }

    fn opts(&self) -> OptsBuilder {
        let (host, port) = self.host_port();
        OptsBuilder::new()
            .ip_or_hostname(Some(host))
            .tcp_port(port)
            .user(Some(self.username.clone()))
            .pass(Some(self.password.clone()))
            .db_name(Some(self.database.clone()))
    }
}

fn quote(identifier: &str) -> String {
    format!("`{}`", identifier.replace('`', "``"))
}

fn to_sql(value: &ColumnValue) -> SqlValue {
    match value {
        ColumnValue::Null => SqlValue::NULL,
        ColumnValue::Bool(v) => SqlValue::Int(*v as i64),
        ColumnValue::Integer(v) => SqlValue::Int(*v),
        ColumnValue::Real(v) => SqlValue::Double(*v),
        ColumnValue::Text(s) | ColumnValue::Marshalled(s) => SqlValue::Bytes(s.clone().into_bytes()),
    }
}

fn from_sql(value: SqlValue) -> ColumnValue {
    match value {
        SqlValue::NULL => ColumnValue::Null,
        SqlValue::Int(v) => ColumnValue::Integer(v),
        SqlValue::UInt(v) => ColumnValue::Integer(v as i64),
        SqlValue::Float(v) => ColumnValue::Real(v as f64),
        SqlValue::Double(v) => ColumnValue::Real(v),
        SqlValue::Bytes(bytes) => ColumnValue::Text(String::from_utf8_lossy(&bytes).into_owned()),
        other => ColumnValue::Text(other.as_sql(true)),
    }
}

fn read_row(row: Row, skip: &str) -> Record {
    let columns = row.columns();
    let values = row.unwrap();
    columns
        .iter()
        .zip(values)
        .filter(|(column, _)| column.name_str() != skip)
        .map(|(column, value)| (column.name_str().into_owned(), from_sql(value)))
        .collect()
}

/// MySQL-backed session store over a connection pool.
pub struct MysqlAdapter {
    pool: Pool,
    columns: Mutex<ColumnMap>,
    peer_columns: Mutex<HashMap<String, ColumnMap>>,
}

impl MysqlAdapter {
    pub fn connect(config: &MysqlConfig) -> Result<Self> {
        let pool = Pool::new(config.opts())?;
        let mut conn = pool.get_conn()?;
        conn.query_drop(format!(
            "CREATE TABLE IF NOT EXISTS {} ({} VARCHAR(255) NOT NULL PRIMARY KEY) DEFAULT CHARSET = utf8mb4",
            quote(SESSION_TABLE),
            quote(KEY_COLUMN)
        ))?;
        let columns = table_columns(&mut conn, SESSION_TABLE)?;
        tracing::debug!(server = %config.server, database = %config.database, columns = columns.len(), "mysql: connected");
        Ok(Self {
            pool,
            columns: Mutex::new(columns),
            peer_columns: Mutex::new(HashMap::new()),
        })
    }

    fn conn(&self) -> Result<PooledConn> {
        Ok(self.pool.get_conn()?)
    }

    fn schema(&self) -> Result<MutexGuard<'_, ColumnMap>> {
        self.columns.lock().map_err(|_| StorageError::LockPoisoned)
    }
}

fn table_columns(conn: &mut PooledConn, table: &str) -> Result<ColumnMap> {
    let rows: Vec<Row> = conn.query(format!("SHOW COLUMNS FROM {}", quote(table)))?;
    let mut columns = ColumnMap::new();
    for row in rows {
        let name: Option<String> = row.get("Field");
        let declared: Option<String> = row.get("Type");
        if let Some(name) = name {
            if name != key_column(table) {
                columns.insert(name, ColumnType::from_declared(&declared.unwrap_or_default()));
            }
        }
    }
    Ok(columns)
}

fn ensure_column(
    conn: &mut PooledConn,
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
    if let Err(e) = conn.query_drop(sql) {
        *columns = table_columns(conn, table)?;
        if columns.contains_key(column) {
            return Ok(());
        }
        return Err(e.into());
    }
    tracing::info!(table, column, ty = %ty, "mysql: added column");
    columns.insert(column.to_string(), ty);
    Ok(())
}

impl StorageAdapter for MysqlAdapter {
    fn kind(&self) -> &'static str {
        "mysql"
    }

    fn init(&self, session_id: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        conn.exec_drop(
            format!(
                "INSERT IGNORE INTO {} ({}) VALUES (?)",
                quote(SESSION_TABLE),
                quote(KEY_COLUMN)
            ),
            (session_id,),
        )?;
        if conn.affected_rows() > 0 {
            return Ok(true);
        }
        drop(conn);
        let populated = self
            .get(session_id)?
            .is_some_and(|record| record.values().any(|v| !v.is_null()));
        Ok(!populated)
    }

    fn get(&self, session_id: &str) -> Result<Option<Record>> {
        let mut conn = self.conn()?;
        let row: Option<Row> = conn.exec_first(
            format!(
                "SELECT * FROM {} WHERE {} = ?",
                quote(SESSION_TABLE),
                quote(KEY_COLUMN)
            ),
            (session_id,),
        )?;
        Ok(row.map(|row| read_row(row, KEY_COLUMN)))
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
        let mut conn = self.conn()?;
        ensure_column(&mut conn, &mut columns, SESSION_TABLE, column, ty)?;
        conn.exec_drop(
            format!(
                "INSERT INTO {table} ({key}, {col}) VALUES (?, ?) ON DUPLICATE KEY UPDATE {col} = VALUES({col})",
                table = quote(SESSION_TABLE),
                key = quote(KEY_COLUMN),
                col = quote(column)
            ),
            Params::Positional(vec![SqlValue::from(session_id), to_sql(value)]),
        )?;
        Ok(())
    }

    fn delete(&self, session_id: &str, column: &str) -> Result<()> {
        let columns = self.schema()?;
        if !columns.contains_key(column) {
            return Ok(());
        }
        let mut conn = self.conn()?;
        conn.exec_drop(
            format!(
                "UPDATE {} SET {} = NULL WHERE {} = ?",
                quote(SESSION_TABLE),
                quote(column),
                quote(KEY_COLUMN)
            ),
            (session_id,),
        )?;
        Ok(())
    }

    fn exists(&self, session_id: &str, column: &str) -> Result<bool> {
        let columns = self.schema()?;
        if !columns.contains_key(column) {
            return Ok(false);
        }
        let mut conn = self.conn()?;
        let present: Option<i64> = conn.exec_first(
            format!(
                "SELECT {} IS NOT NULL FROM {} WHERE {} = ?",
                quote(column),
                quote(SESSION_TABLE),
                quote(KEY_COLUMN)
            ),
            (session_id,),
        )?;
        Ok(present == Some(1))
    }

    fn columns(&self) -> Result<ColumnMap> {
        Ok(self.schema()?.clone())
    }

    fn peers(&self) -> Option<&dyn PeerStore> {
        Some(self)
    }
}

impl PeerStore for MysqlAdapter {
    fn init_peers(&self, table: &str) -> Result<bool> {
        check_identifier(table)?;
        let mut peer_columns = self
            .peer_columns
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?;
        let mut conn = self.conn()?;
        let existing: Option<String> =
            conn.exec_first("SHOW TABLES LIKE ?", (table,))?;
        let created = existing.is_none();
        if created {
            conn.query_drop(format!(
                "CREATE TABLE IF NOT EXISTS {} (`id` BIGINT NOT NULL PRIMARY KEY) DEFAULT CHARSET = utf8mb4",
                quote(table)
            ))?;
            tracing::info!(table, "mysql: created peer table");
        }
        let columns = table_columns(&mut conn, table)?;
        peer_columns.insert(table.to_string(), columns);
        Ok(created)
    }

    fn set_peer(&self, table: &str, row: &Record) -> Result<()> {
        check_identifier(table)?;
        let id = peer_key(row)?;
        let mut peer_columns = self
            .peer_columns
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?;
        let mut conn = self.conn()?;
        if !peer_columns.contains_key(table) {
            let columns = table_columns(&mut conn, table)?;
            peer_columns.insert(table.to_string(), columns);
        }
        let columns = peer_columns
            .get_mut(table)
            .ok_or_else(|| StorageError::InvalidRecord(format!("unknown peer table {table}")))?;

        let fields: Vec<(&String, &ColumnValue)> =
            row.iter().filter(|(name, _)| name.as_str() != "id").collect();
        for (name, value) in &fields {
            check_identifier(name)?;
            ensure_column(&mut conn, columns, table, name, ColumnType::infer(value))?;
        }

        let mut names = vec![quote("id")];
        names.extend(fields.iter().map(|(name, _)| quote(name)));
        let placeholders = vec!["?"; names.len()].join(", ");
        let updates: Vec<String> = names
            .iter()
            .map(|name| format!("{name} = VALUES({name})"))
            .collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON DUPLICATE KEY UPDATE {}",
            quote(table),
            names.join(", "),
            placeholders,
            updates.join(", ")
        );
        let mut values = vec![SqlValue::Int(id)];
        values.extend(fields.iter().map(|(_, value)| to_sql(value)));
        conn.exec_drop(sql, Params::Positional(values))?;
        Ok(())
    }

    fn get_peer(&self, table: &str, column: &str, value: &ColumnValue) -> Result<Option<Record>> {
        check_identifier(table)?;
        check_identifier(column)?;
        let mut conn = self.conn()?;
        let known = column == "id" || table_columns(&mut conn, table)?.contains_key(column);
        if !known {
            return Ok(None);
        }
        let row: Option<Row> = conn.exec_first(
            format!(
                "SELECT * FROM {} WHERE {} = ? LIMIT 1",
                quote(table),
                quote(column)
            ),
            Params::Positional(vec![to_sql(value)]),
        )?;
        Ok(row.map(|row| read_row(row, "")))
    }

    fn delete_peer(&self, table: &str, column: &str, value: &ColumnValue) -> Result<bool> {
        check_identifier(table)?;
        check_identifier(column)?;
        let mut conn = self.conn()?;
        conn.exec_drop(
            format!("DELETE FROM {} WHERE {} = ?", quote(table), quote(column)),
            Params::Positional(vec![to_sql(value)]),
        )?;
        Ok(conn.affected_rows() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(server: &str) -> MysqlConfig {
        MysqlConfig {
            server: server.into(),
            username: "root".into(),
            password: "secret".into(),
            database: "liveproto".into(),
        }
    }

    #[test]
    fn test_host_port() {
        assert_eq!(config("localhost").host_port(), ("localhost".into(), 3306));
        assert_eq!(config("db.local:3307").host_port(), ("db.local".into(), 3307));
        assert_eq!(config("[::1]:3308").host_port(), ("::1".into(), 3308));
        assert_eq!(config("::1").host_port(), ("::1".into(), 3306));
    }

    #[test]
    fn test_value_mapping() {
        assert_eq!(to_sql(&ColumnValue::Bool(true)), SqlValue::Int(1));
        assert_eq!(from_sql(SqlValue::NULL), ColumnValue::Null);
        assert_eq!(from_sql(SqlValue::UInt(9)), ColumnValue::Integer(9));
        assert_eq!(
            from_sql(SqlValue::Bytes(b"abc".to_vec())),
            ColumnValue::Text("abc".into())
        );
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("a`b"), "`a``b`");
    }
}
