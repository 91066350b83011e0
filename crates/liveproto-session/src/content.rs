//! Session content: everything persisted for one client session, plus the
//! message-id, sequence and clock-offset arithmetic that mutates it.
//!
//! Message ids are `(server_unix_time << 32)` with the low two bits clear and
//! must strictly increase. Sequence numbers are `2n + 1` for content-related
//! messages (which advance `n`) and `2n` otherwise.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use liveproto_storage::{marshal, unmarshal, ColumnValue, Record};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::datacenter::Datacenter;
use crate::error::{Error, Result};

/// Login progress of the account bound to a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthStep {
    #[default]
    NeedAuthentication,
    NeedCode,
    NeedPassword,
    NeedSignup,
    Authorized,
}

impl AuthStep {
    pub fn as_str(self) -> &'static str {
        match self {
            AuthStep::NeedAuthentication => "NEED_AUTHENTICATION",
            AuthStep::NeedCode => "NEED_CODE",
            AuthStep::NeedPassword => "NEED_PASSWORD",
            AuthStep::NeedSignup => "NEED_SIGNUP",
            AuthStep::Authorized => "AUTHORIZED",
        }
    }
}

impl fmt::Display for AuthStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthStep {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "NEED_AUTHENTICATION" => AuthStep::NeedAuthentication,
            "NEED_CODE" => AuthStep::NeedCode,
            "NEED_PASSWORD" => AuthStep::NeedPassword,
            "NEED_SIGNUP" => AuthStep::NeedSignup,
            "AUTHORIZED" => AuthStep::Authorized,
            other => return Err(Error::corrupt("step", format!("unknown step {other:?}"))),
        })
    }
}

/// Update-state counters (`updates.state`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateState {
    pub pts: i32,
    pub qts: i32,
    pub date: i32,
    pub seq: i32,
}

impl Default for UpdateState {
    fn default() -> Self {
        Self {
            pts: 1,
            qts: -1,
            date: 1,
            seq: 0,
        }
    }
}

/// Opaque authorization key material. Debug output never shows the bytes.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthKey(Vec<u8>);

impl AuthKey {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthKey({} bytes)", self.0.len())
    }
}

/// In-memory peer rows for one session, keyed by peer id. Mirrors the
/// durable peer table named `table` when the backend has one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerCache {
    table: String,
    #[serde(default)]
    rows: BTreeMap<i64, Record>,
}

impl PeerCache {
    pub fn new(session_name: Option<&str>) -> Self {
        let suffix: String = session_name
            .unwrap_or("memory")
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .take(48)
            .collect();
        Self {
            table: format!("peers_{suffix}"),
            rows: BTreeMap::new(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Cache a row; returns its id, or `None` when the row has no integer `id`.
    pub fn insert(&mut self, row: Record) -> Option<i64> {
        let id = row.get("id").and_then(ColumnValue::as_i64)?;
        self.rows.entry(id).or_default().extend(row);
        Some(id)
    }

    pub fn get(&self, id: i64) -> Option<&Record> {
        self.rows.get(&id)
    }

    pub fn find(&self, column: &str, value: &ColumnValue) -> Option<&Record> {
        if column == "id" {
            return value.as_i64().and_then(|id| self.rows.get(&id));
        }
        self.rows.values().find(|row| row.get(column) == Some(value))
    }

    pub fn remove(&mut self, id: i64) -> Option<Record> {
        self.rows.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Largest stored sequence whose next odd number still fits in a `u32`.
const MAX_SEQUENCE: u32 = (u32::MAX - 1) / 2;

/// Largest stored message id that can still be bumped by 4.
const MAX_MSG_ID: i64 = i64::MAX - 4;

/// Clock offsets beyond a 32-bit second count cannot come from a server id.
const MAX_TIME_OFFSET: u64 = u32::MAX as u64;

/// Column names, in persistence order.
pub const FIELDS: [&str; 17] = [
    "id",
    "api_id",
    "api_hash",
    "dc",
    "ip",
    "port",
    "ipv6",
    "test_mode",
    "auth_key",
    "salt",
    "sequence",
    "time_offset",
    "last_msg_id",
    "logout_tokens",
    "peers",
    "state",
    "step",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionContent {
    pub id: i64,
    pub api_id: i64,
    pub api_hash: Option<String>,
    pub dc: u32,
    pub ip: String,
    pub port: u16,
    pub ipv6: bool,
    pub test_mode: bool,
    pub auth_key: AuthKey,
    pub salt: i64,
    pub sequence: u32,
    pub time_offset: i64,
    pub last_msg_id: i64,
    pub logout_tokens: Vec<Vec<u8>>,
    pub peers: PeerCache,
    pub state: UpdateState,
    pub step: AuthStep,
}

impl SessionContent {
    /// Fresh content bound to `dc`.
    pub fn generate(dc: &Datacenter, prefer_ipv6: bool, session_name: Option<&str>) -> Self {
        Self {
            id: 0,
            api_id: 0,
            api_hash: None,
            dc: dc.id,
            ip: dc.address(prefer_ipv6).to_string(),
            port: dc.port,
            ipv6: prefer_ipv6,
            test_mode: false,
            auth_key: AuthKey::default(),
            salt: 0,
            sequence: 0,
            time_offset: 0,
            last_msg_id: 0,
            logout_tokens: Vec::new(),
            peers: PeerCache::new(session_name),
            state: UpdateState::default(),
            step: AuthStep::NeedAuthentication,
        }
    }

    /// Local time corrected by the learned server offset.
    pub fn server_time(&self, now: i64) -> i64 {
        now.saturating_add(self.time_offset)
    }

    pub fn new_msg_id(&mut self, now: i64) -> i64 {
        let candidate = (self.server_time(now) << 32) & !0x3;
        let msg_id = if candidate <= self.last_msg_id {
            self.last_msg_id.saturating_add(4)
        } else {
            candidate
        };
        self.last_msg_id = msg_id;
        msg_id
    }

    /// Learn the clock offset from a server-issued message id. Returns
    /// `true` when the offset changed, in which case `last_msg_id` restarts.
    pub fn update_time_offset(&mut self, server_msg_id: i64, now: i64) -> bool {
        let offset = (server_msg_id >> 32) - now;
        if offset == self.time_offset {
            return false;
        }
        tracing::debug!(old = self.time_offset, new = offset, "time offset corrected");
        self.time_offset = offset;
        self.last_msg_id = 0;
        true
    }

    pub fn generate_sequence(&mut self, content_related: bool) -> u32 {
        if content_related {
            let seq = self.sequence.saturating_mul(2).saturating_add(1);
            self.sequence = self.sequence.saturating_add(1);
            seq
        } else {
            self.sequence.saturating_mul(2)
        }
    }

    /// New identity with fresh message counters.
    pub fn reset(&mut self, id: i64) {
        self.id = id;
        self.sequence = 0;
        self.last_msg_id = 0;
    }

    pub fn to_record(&self) -> Result<Record> {
        let mut record = Record::new();
        record.insert("id".into(), self.id.into());
        record.insert("api_id".into(), self.api_id.into());
        record.insert("api_hash".into(), self.api_hash.clone().into());
        record.insert("dc".into(), i64::from(self.dc).into());
        record.insert("ip".into(), self.ip.clone().into());
        record.insert("port".into(), i64::from(self.port).into());
        record.insert("ipv6".into(), self.ipv6.into());
        record.insert("test_mode".into(), self.test_mode.into());
        record.insert("auth_key".into(), marshal(&self.auth_key)?);
        record.insert("salt".into(), self.salt.into());
        record.insert("sequence".into(), i64::from(self.sequence).into());
        record.insert("time_offset".into(), self.time_offset.into());
        record.insert("last_msg_id".into(), self.last_msg_id.into());
        record.insert("logout_tokens".into(), marshal(&self.logout_tokens)?);
        record.insert("peers".into(), marshal(&self.peers)?);
        record.insert("state".into(), marshal(&self.state)?);
        record.insert("step".into(), self.step.as_str().into());
        Ok(record)
    }

    /// Rebuild content from a stored row. Missing counters fall back to
    /// their generated defaults; missing endpoint fields are corruption.
    pub fn from_record(record: &Record, session_name: Option<&str>) -> Result<Self> {
        let port = required_int(record, "port")?;
        let dc = required_int(record, "dc")?;
        Ok(Self {
            id: int_or(record, "id", 0)?,
            api_id: int_or(record, "api_id", 0)?,
            api_hash: match present(record, "api_hash") {
                Some(value) => Some(text(value, "api_hash")?.to_string()),
                None => None,
            },
            dc: u32::try_from(dc).map_err(|_| Error::corrupt("dc", format!("{dc} out of range")))?,
            ip: match present(record, "ip") {
                Some(value) => text(value, "ip")?.to_string(),
                None => return Err(Error::corrupt("ip", "missing")),
            },
            port: u16::try_from(port)
                .map_err(|_| Error::corrupt("port", format!("{port} out of range")))?,
            ipv6: bool_or(record, "ipv6", false)?,
            test_mode: bool_or(record, "test_mode", false)?,
            auth_key: structured_or_default(record, "auth_key")?,
            salt: int_or(record, "salt", 0)?,
            sequence: {
                let sequence = int_or(record, "sequence", 0)?;
                u32::try_from(sequence)
                    .ok()
                    .filter(|&seq| seq <= MAX_SEQUENCE)
                    .ok_or_else(|| Error::corrupt("sequence", format!("{sequence} out of range")))?
            },
            time_offset: {
                let offset = int_or(record, "time_offset", 0)?;
                if offset.unsigned_abs() > MAX_TIME_OFFSET {
                    return Err(Error::corrupt("time_offset", format!("{offset} out of range")));
                }
                offset
            },
            last_msg_id: {
                let last = int_or(record, "last_msg_id", 0)?;
                if last > MAX_MSG_ID {
                    return Err(Error::corrupt("last_msg_id", format!("{last} out of range")));
                }
                last
            },
            logout_tokens: structured_or_default(record, "logout_tokens")?,
            peers: match present(record, "peers") {
                Some(value) => unmarshal(value).map_err(|e| Error::corrupt("peers", e.to_string()))?,
                None => PeerCache::new(session_name),
            },
            state: structured_or_default(record, "state")?,
            step: match present(record, "step") {
                Some(value) => text(value, "step")?.parse()?,
                None => AuthStep::default(),
            },
        })
    }
}

fn present<'a>(record: &'a Record, field: &str) -> Option<&'a ColumnValue> {
    record.get(field).filter(|value| !value.is_null())
}

fn text<'a>(value: &'a ColumnValue, field: &str) -> Result<&'a str> {
    value
        .as_text()
        .ok_or_else(|| Error::corrupt(field, format!("expected text, found {value:?}")))
}

fn int_or(record: &Record, field: &str, default: i64) -> Result<i64> {
    match present(record, field) {
        Some(value) => value
            .as_i64()
            .ok_or_else(|| Error::corrupt(field, format!("expected integer, found {value:?}"))),
        None => Ok(default),
    }
}

fn bool_or(record: &Record, field: &str, default: bool) -> Result<bool> {
    match present(record, field) {
        Some(value) => value
            .as_bool()
            .ok_or_else(|| Error::corrupt(field, format!("expected boolean, found {value:?}"))),
        None => Ok(default),
    }
}

fn required_int(record: &Record, field: &str) -> Result<i64> {
    match present(record, field) {
        Some(_) => int_or(record, field, 0),
        None => Err(Error::corrupt(field, "missing")),
    }
}

fn structured_or_default<T: DeserializeOwned + Default>(record: &Record, field: &str) -> Result<T> {
    match present(record, field) {
        Some(value) => unmarshal(value).map_err(|e| Error::corrupt(field, e.to_string())),
        None => Ok(T::default()),
    }
}
