//! Session settings.
//! Parsed from ~/.liveproto/session.toml.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub datacenter: DatacenterSection,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub api: ApiSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSection {
    /// Session name. `None` keeps the session in memory only. In `text`
    /// mode this is the exported session string itself.
    pub name: Option<String>,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_save_interval")]
    pub save_interval_secs: f64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            name: None,
            mode: default_mode(),
            save_interval_secs: default_save_interval(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatacenterSection {
    /// 0 picks a datacenter at random.
    #[serde(default)]
    pub dc: u32,
    #[serde(default)]
    pub test_mode: bool,
    #[serde(default)]
    pub ipv6: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    /// Where `.session` and `.db` files live.
    #[serde(default = "default_directory")]
    pub directory: String,
    /// Database name (MySQL) or file stem (SQLite). Falls back to `username`.
    #[serde(default)]
    pub database: String,
    #[serde(default = "default_server")]
    pub server: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            database: String::new(),
            server: default_server(),
            username: String::new(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiSection {
    #[serde(default)]
    pub api_id: i64,
    pub api_hash: Option<String>,
}

fn default_mode() -> String {
    "sqlite".into()
}
fn default_save_interval() -> f64 {
    3.0
}
fn default_directory() -> String {
    ".".into()
}
fn default_server() -> String {
    "localhost".into()
}

/// Backend selected by `session.mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// `string` or `file`: one JSON document per session.
    File,
    Sqlite,
    Mysql,
    /// The session name carries the whole encoded session.
    Text,
}

impl FromStr for StorageMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "string" | "file" => Ok(StorageMode::File),
            "sqlite" => Ok(StorageMode::Sqlite),
            "mysql" => Ok(StorageMode::Mysql),
            "text" => Ok(StorageMode::Text),
            other => Err(Error::Configuration(format!(
                "invalid storage mode {other:?}: expected one of string, file, sqlite, mysql, text"
            ))),
        }
    }
}

impl StorageSection {
    /// `database`, or `username` when no database is named.
    pub fn database_name(&self) -> &str {
        if self.database.is_empty() {
            &self.username
        } else {
            &self.database
        }
    }

    /// SQLite file for a named session.
    pub fn sqlite_path(&self, session_name: &str) -> PathBuf {
        let stem = match self.database_name() {
            "" => session_name,
            db => db,
        };
        expand_tilde(&self.directory).join(format!("{stem}.db"))
    }

    /// Every MySQL connection parameter must be set.
    pub fn validate_mysql(&self) -> Result<()> {
        for (field, value) in [
            ("server", self.server.as_str()),
            ("username", self.username.as_str()),
            ("password", self.password.as_str()),
            ("database", self.database_name()),
        ] {
            if value.is_empty() {
                return Err(Error::Configuration(format!(
                    "{field} parameter for mysql database is empty"
                )));
            }
        }
        Ok(())
    }
}

impl SessionSettings {
    /// Load settings from file, or defaults if missing.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| Error::Configuration(format!("{}: {e}", path.display())))?;
            let settings: SessionSettings = toml::from_str(&content)
                .map_err(|e| Error::Configuration(format!("{}: {e}", path.display())))?;
            Ok(settings)
        } else {
            Ok(Self::default())
        }
    }

    pub fn storage_mode(&self) -> Result<StorageMode> {
        self.session.mode.parse()
    }

    /// Anonymous in-memory session.
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>, mode: &str) -> Self {
        let mut settings = Self::default();
        settings.session.name = Some(name.into());
        settings.session.mode = mode.to_string();
        settings
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME").map(PathBuf::from) {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = SessionSettings::default();
        assert_eq!(settings.session.mode, "sqlite");
        assert_eq!(settings.session.save_interval_secs, 3.0);
        assert_eq!(settings.datacenter.dc, 0);
        assert_eq!(settings.storage.server, "localhost");
        assert!(settings.session.name.is_none());
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
[session]
name = "main"
mode = "MySQL"
save_interval_secs = 10

[datacenter]
dc = 2
ipv6 = true

[storage]
server = "db.local:3306"
username = "liveproto"
password = "hunter2"

[api]
api_id = 12345
api_hash = "0123456789abcdef"
"#;
        let settings: SessionSettings = toml::from_str(toml_str).unwrap();
        assert_eq!(settings.session.name.as_deref(), Some("main"));
        assert_eq!(settings.storage_mode().unwrap(), StorageMode::Mysql);
        assert_eq!(settings.session.save_interval_secs, 10.0);
        assert!(settings.datacenter.ipv6);
        assert!(!settings.datacenter.test_mode);
        assert_eq!(settings.storage.database_name(), "liveproto");
        assert!(settings.storage.validate_mysql().is_ok());
        assert_eq!(settings.api.api_id, 12345);
    }

    #[test]
    fn test_storage_modes() {
        assert_eq!("string".parse::<StorageMode>().unwrap(), StorageMode::File);
        assert_eq!("file".parse::<StorageMode>().unwrap(), StorageMode::File);
        assert_eq!("SQLite".parse::<StorageMode>().unwrap(), StorageMode::Sqlite);
        assert_eq!("text".parse::<StorageMode>().unwrap(), StorageMode::Text);
        assert!(matches!(
            "postgres".parse::<StorageMode>(),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_mysql_validation_names_missing_field() {
        let mut storage = StorageSection {
            username: "root".into(),
            ..StorageSection::default()
        };
        match storage.validate_mysql() {
            Err(Error::Configuration(msg)) => assert!(msg.contains("password")),
            other => panic!("unexpected {other:?}"),
        }
        storage.password = "pw".into();
        storage.server.clear();
        match storage.validate_mysql() {
            Err(Error::Configuration(msg)) => assert!(msg.starts_with("server")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_sqlite_path() {
        let mut storage = StorageSection {
            directory: "/var/lib/liveproto".into(),
            ..StorageSection::default()
        };
        assert_eq!(
            storage.sqlite_path("bot"),
            PathBuf::from("/var/lib/liveproto/bot.db")
        );
        storage.database = "shared".into();
        assert_eq!(
            storage.sqlite_path("bot"),
            PathBuf::from("/var/lib/liveproto/shared.db")
        );
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = SessionSettings::load_or_default(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(settings.session.mode, "sqlite");

        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[session\n").unwrap();
        assert!(matches!(
            SessionSettings::load_or_default(&path),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_serialise_default() {
        let toml_str = toml::to_string_pretty(&SessionSettings::default()).unwrap();
        assert!(toml_str.contains("[session]"));
        assert!(toml_str.contains("save_interval_secs"));
    }
}
