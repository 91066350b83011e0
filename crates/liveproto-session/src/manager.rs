//! Session manager -- owns one session's content and its storage backend.
//!
//! Lifecycle:
//!   Unloaded → Generated (fresh, nothing stored yet)
//!   Unloaded → Loaded (read back from the backend)
//!   Generated | Loaded → Persisted (after a save; re-entered on every save)

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use liveproto_storage::{
    ColumnType, ColumnValue, FileAdapter, Record, SqliteAdapter, StorageAdapter, TextAdapter,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{expand_tilde, SessionSettings, StorageMode};
use crate::content::SessionContent;
use crate::datacenter;
use crate::error::{Error, Result};

/// Time source for message ids and the save cadence.
pub trait Clock: Send + Sync {
    /// Time since the Unix epoch.
    fn now(&self) -> Duration;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicU64,
}

impl ManualClock {
    pub fn at_secs(secs: u64) -> Self {
        Self {
            millis: AtomicU64::new(secs * 1000),
        }
    }

    pub fn set(&self, now: Duration) {
        self.millis.store(now.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.millis.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.millis.load(Ordering::SeqCst))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    Unloaded,
    Generated,
    Loaded,
    Persisted,
}

/// Outcome of one best-effort save.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveReport {
    pub written: usize,
    /// Columns whose write failed; the rest were still attempted.
    pub failed: Vec<String>,
}

impl SaveReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

pub struct SessionManager {
    settings: SessionSettings,
    state: ManagerState,
    content: Option<SessionContent>,
    adapter: Option<Box<dyn StorageAdapter>>,
    /// Row key inside the backend.
    session_id: String,
    clock: Arc<dyn Clock>,
    rng: StdRng,
    dirty: bool,
    last_save: Option<Duration>,
}

impl SessionManager {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            settings,
            state: ManagerState::Unloaded,
            content: None,
            adapter: None,
            session_id: String::new(),
            clock: Arc::new(SystemClock),
            rng: StdRng::from_entropy(),
            dirty: false,
            last_save: None,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Deterministic datacenter choice and session ids.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Use this backend instead of opening one from `session.mode`.
    pub fn with_adapter(mut self, adapter: Box<dyn StorageAdapter>) -> Self {
        self.adapter = Some(adapter);
        self
    }

    pub fn state(&self) -> ManagerState {
        self.state
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn content(&self) -> Option<&SessionContent> {
        self.content.as_ref()
    }

    /// Mutable access; marks the session for the next save.
    pub fn content_mut(&mut self) -> Result<&mut SessionContent> {
        self.dirty = true;
        self.content.as_mut().ok_or(Error::NotLoaded)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn backend(&self) -> Option<&'static str> {
        self.adapter.as_ref().map(|adapter| adapter.kind())
    }

    fn now_secs(&self) -> i64 {
        self.clock.now().as_secs() as i64
    }

    fn name(&self) -> Option<&str> {
        self.settings.session.name.as_deref()
    }

    fn generate(&mut self) -> Result<SessionContent> {
        let dc = &self.settings.datacenter;
        let chosen = datacenter::select(dc.dc, dc.test_mode, &mut self.rng)?;
        let mut content = SessionContent::generate(&chosen, dc.ipv6, self.name());
        content.test_mode = dc.test_mode;
        content.api_id = self.settings.api.api_id;
        content.api_hash = self.settings.api.api_hash.clone();
        tracing::info!(dc = chosen.id, ip = %content.ip, port = content.port, "generated new session");
        Ok(content)
    }

    fn open_adapter(&self, mode: StorageMode, name: &str) -> Result<Box<dyn StorageAdapter>> {
        let storage = &self.settings.storage;
        Ok(match mode {
            StorageMode::File => {
                let dir = expand_tilde(&storage.directory);
                Box::new(FileAdapter::open_named(&dir, name)?)
            }
            StorageMode::Sqlite => Box::new(SqliteAdapter::open(&storage.sqlite_path(name))?),
            StorageMode::Mysql => self.open_mysql()?,
            StorageMode::Text => Box::new(TextAdapter::decode(name)?),
        })
    }

    #[cfg(feature = "mysql")]
    fn open_mysql(&self) -> Result<Box<dyn StorageAdapter>> {
        let storage = &self.settings.storage;
        storage.validate_mysql()?;
        let config = liveproto_storage::MysqlConfig {
            server: storage.server.clone(),
            username: storage.username.clone(),
            password: storage.password.clone(),
            database: storage.database_name().to_string(),
        };
        Ok(Box::new(liveproto_storage::MysqlAdapter::connect(&config)?))
    }

    #[cfg(not(feature = "mysql"))]
    fn open_mysql(&self) -> Result<Box<dyn StorageAdapter>> {
        self.settings.storage.validate_mysql()?;
        Err(Error::Configuration(
            "mysql storage requested but this build lacks the `mysql` feature".into(),
        ))
    }

    /// Load the session, generating and persisting a fresh one when the
    /// backend has nothing stored. Any failure here is fatal.
    pub fn load(&mut self) -> Result<&SessionContent> {
        if self.content.is_none() {
            self.bootstrap()?;
        }
        self.content.as_ref().ok_or(Error::NotLoaded)
    }

    fn bootstrap(&mut self) -> Result<()> {
        let Some(name) = self.settings.session.name.clone() else {
            let content = self.generate()?;
            self.content = Some(content);
            self.state = ManagerState::Generated;
            return Ok(());
        };

        let mode = self.settings.storage_mode()?;
        if self.adapter.is_none() {
            self.adapter = Some(self.open_adapter(mode, &name)?);
        }
        self.session_id = match mode {
            StorageMode::Text => liveproto_storage::text::INLINE_SESSION_ID.to_string(),
            _ => name.clone(),
        };

        let adapter = self.adapter.as_ref().ok_or(Error::NotLoaded)?;
        let created = adapter.init(&self.session_id)?;
        let content = if created {
            None
        } else {
            let record = adapter
                .get(&self.session_id)?
                .ok_or_else(|| Error::corrupt("session_id", "row vanished after init"))?;
            Some(SessionContent::from_record(&record, Some(&name))?)
        };
        if let Some(peers) = adapter.peers() {
            let table = match &content {
                Some(content) => content.peers.table().to_string(),
                None => crate::content::PeerCache::new(Some(&name)).table().to_string(),
            };
            peers.init_peers(&table)?;
        }

        match content {
            Some(content) => {
                tracing::info!(backend = adapter.kind(), dc = content.dc, "loaded session");
                self.content = Some(content);
                self.state = ManagerState::Loaded;
            }
            None => {
                let content = self.generate()?;
                self.content = Some(content);
                self.state = ManagerState::Generated;
                self.persist_strict()?;
            }
        }
        Ok(())
    }

    /// Bootstrap write: any failed column aborts the load.
    fn persist_strict(&mut self) -> Result<()> {
        let (adapter, content) = match (&self.adapter, &self.content) {
            (Some(adapter), Some(content)) => (adapter, content),
            _ => return Err(Error::NotLoaded),
        };
        for (column, value) in content.to_record()? {
            adapter.set(&self.session_id, &column, &value, ColumnType::infer(&value))?;
        }
        self.mark_saved();
        Ok(())
    }

    fn mark_saved(&mut self) {
        self.dirty = false;
        self.last_save = Some(self.clock.now());
        self.state = ManagerState::Persisted;
    }

    /// Write every field. A failing column is logged and skipped; the
    /// others are still written and the session stays dirty. Anonymous
    /// sessions have nothing to write.
    pub fn save(&mut self) -> Result<SaveReport> {
        let content = self.content.as_ref().ok_or(Error::NotLoaded)?;
        let Some(adapter) = self.adapter.as_ref() else {
            return Ok(SaveReport::default());
        };
        let mut report = SaveReport::default();
        for (column, value) in content.to_record()? {
            match adapter.set(&self.session_id, &column, &value, ColumnType::infer(&value)) {
                Ok(()) => report.written += 1,
                Err(e) => {
                    tracing::warn!(backend = adapter.kind(), column = %column, error = %e, "failed to save session field");
                    report.failed.push(column);
                }
            }
        }
        tracing::debug!(written = report.written, failed = report.failed.len(), "session saved");
        if report.is_complete() {
            self.mark_saved();
        } else {
            // Failed columns stay pending for the next `save_if_due`.
            self.dirty = true;
        }
        Ok(report)
    }

    /// Save when there are unsaved changes and `save_interval_secs` has
    /// passed since the last save.
    pub fn save_if_due(&mut self) -> Result<Option<SaveReport>> {
        if !self.dirty || self.adapter.is_none() {
            return Ok(None);
        }
        let interval = Duration::from_secs_f64(self.settings.session.save_interval_secs.max(0.0));
        if let Some(last) = self.last_save {
            if self.clock.now().saturating_sub(last) < interval {
                return Ok(None);
            }
        }
        self.save().map(Some)
    }

    pub fn new_msg_id(&mut self) -> Result<i64> {
        let now = self.now_secs();
        Ok(self.content_mut()?.new_msg_id(now))
    }

    pub fn generate_sequence(&mut self, content_related: bool) -> Result<u32> {
        Ok(self.content_mut()?.generate_sequence(content_related))
    }

    pub fn update_time_offset(&mut self, server_msg_id: i64) -> Result<bool> {
        let now = self.now_secs();
        Ok(self.content_mut()?.update_time_offset(server_msg_id, now))
    }

    pub fn server_time(&self) -> Result<i64> {
        let content = self.content.as_ref().ok_or(Error::NotLoaded)?;
        Ok(content.server_time(self.now_secs()))
    }

    /// New identity (random when `id` is `None`) with fresh counters.
    pub fn reset(&mut self, id: Option<i64>) -> Result<()> {
        let id = id.unwrap_or_else(|| self.rng.gen());
        self.content_mut()?.reset(id);
        Ok(())
    }

    /// Independent in-memory copy with a fresh random identity. The fork
    /// never writes back to this session's backend.
    pub fn fork(&mut self) -> Result<SessionManager> {
        let mut content = self.content.clone().ok_or(Error::NotLoaded)?;
        content.reset(self.rng.gen());
        let mut settings = self.settings.clone();
        settings.session.name = None;
        Ok(SessionManager {
            settings,
            state: ManagerState::Generated,
            content: Some(content),
            adapter: None,
            session_id: String::new(),
            clock: Arc::clone(&self.clock),
            rng: StdRng::from_rng(&mut self.rng).unwrap_or_else(|_| StdRng::from_entropy()),
            dirty: false,
            last_save: None,
        })
    }

    /// Portable string for `mode = "text"` (the string is the session name).
    /// Identity and counters are reset in the exported copy.
    pub fn export_string(&self) -> Result<String> {
        let mut content = self.content.clone().ok_or(Error::NotLoaded)?;
        content.reset(0);
        Ok(TextAdapter::encode_record(&content.to_record()?)?)
    }

    /// Cache a peer row and write it through to the backend's peer table.
    pub fn remember_peer(&mut self, row: Record) -> Result<i64> {
        let table = {
            let content = self.content_mut()?;
            content.peers.table().to_string()
        };
        let content = self.content.as_mut().ok_or(Error::NotLoaded)?;
        let id = content
            .peers
            .insert(row)
            .ok_or_else(|| Error::corrupt("id", "peer row without integer id"))?;
        let Some(peers) = self.adapter.as_ref().and_then(|adapter| adapter.peers()) else {
            return Ok(id);
        };
        if let Some(cached) = content.peers.get(id) {
            if let Err(e) = peers.set_peer(&table, cached) {
                tracing::warn!(table = %table, peer = id, error = %e, "failed to store peer");
            }
        }
        Ok(id)
    }

    /// Look a peer up in the cache, then in the backend's peer table.
    pub fn find_peer(&mut self, column: &str, value: &ColumnValue) -> Result<Option<Record>> {
        let content = self.content.as_mut().ok_or(Error::NotLoaded)?;
        if let Some(row) = content.peers.find(column, value) {
            return Ok(Some(row.clone()));
        }
        let Some(peers) = self.adapter.as_ref().and_then(|adapter| adapter.peers()) else {
            return Ok(None);
        };
        let found = peers.get_peer(content.peers.table(), column, value)?;
        if let Some(row) = &found {
            content.peers.insert(row.clone());
        }
        Ok(found)
    }
}
