//! LiveProto Session -- persistent client session state.
//!
//! Owns the key material, datacenter binding, clock offset, message-id and
//! sequence counters and the peer cache of one session, and moves them in and
//! out of a [`liveproto_storage::StorageAdapter`].

pub mod config;
pub mod content;
pub mod datacenter;
pub mod error;
pub mod manager;

pub use config::{SessionSettings, StorageMode};
pub use content::{AuthKey, AuthStep, PeerCache, SessionContent, UpdateState};
pub use datacenter::Datacenter;
pub use error::{Error, Result};
pub use manager::{Clock, ManagerState, ManualClock, SaveReport, SessionManager, SystemClock};
