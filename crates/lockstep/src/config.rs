//! Node configuration.
//!
//! Every struct here derives `serde` with `#[serde(default)]`, so a JSON
//! file only has to name the values it changes:
//!
//! ```json
//! {
//!     "server_name": "Friday night",
//!     "password": "hunter2",
//!     "sync": { "frame_freq": 1, "command_delay": 2 },
//!     "timeouts": { "download_secs": 60 }
//! }
//! ```
//!
//! Loaded configs go through `validated()`, which clamps unsafe values and
//! logs each change at `warn`.

use std::path::Path;
use std::time::Duration;

use lockstep_protocol::{CompanyId, MAX_CLIENT_NAME_LEN, MAX_REVISION_LEN, MAX_SERVER_NAME_LEN};
use lockstep_sync::{SyncConfig, TransferConfig};
use lockstep_tick::FrameClockConfig;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::LockstepError;

/// Revision string both sides compare during the join.
pub const DEFAULT_REVISION: &str = concat!("lockstep-", env!("CARGO_PKG_VERSION"));

// ---------------------------------------------------------------------------
// TimeoutConfig
// ---------------------------------------------------------------------------

/// How long a connection may sit in one phase, in seconds.
///
/// A value of `0` disables that timeout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// From accept until encryption is enabled.
    pub auth_secs: u64,
    /// From encryption until the map is requested.
    pub join_secs: u64,
    /// From the map request until the client confirms the load.
    pub download_secs: u64,
    /// Silence tolerated from a synchronized peer.
    pub idle_secs: u64,
    /// How often clients waiting for a map slot hear their position again.
    pub wait_notice_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            auth_secs: 60,
            join_secs: 15,
            download_secs: 30,
            idle_secs: 60,
            wait_notice_secs: 2,
        }
    }
}

impl TimeoutConfig {
    pub fn auth(&self) -> Option<Duration> {
        secs(self.auth_secs)
    }

    pub fn join(&self) -> Option<Duration> {
        secs(self.join_secs)
    }

    pub fn download(&self) -> Option<Duration> {
        secs(self.download_secs)
    }

    pub fn idle(&self) -> Option<Duration> {
        secs(self.idle_secs)
    }

    /// `None` sends a position only when it changes.
    pub fn wait_notice(&self) -> Option<Duration> {
        secs(self.wait_notice_secs)
    }
}

fn secs(value: u64) -> Option<Duration> {
    (value > 0).then(|| Duration::from_secs(value))
}

// ---------------------------------------------------------------------------
// ServerConfig
// ---------------------------------------------------------------------------

/// Settings for a [`GameServer`](crate::GameServer).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub server_name: String,
    /// Clients must join with exactly this revision.
    pub revision: String,
    /// Shared join password. `None` runs key exchange only.
    pub password: Option<String>,
    /// Remote clients admitted at once (the host does not count).
    pub max_clients: u8,
    pub max_companies: u8,
    pub max_spectators: u8,
    /// Hex-encoded client public keys refused at authentication.
    pub banned: Vec<String>,
    /// Remote console password. `None` refuses every rcon request.
    pub rcon_password: Option<String>,
    pub sync: SyncConfig,
    pub transfer: TransferConfig,
    pub timeouts: TimeoutConfig,
    pub clock: FrameClockConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: "Lockstep server".to_string(),
            revision: DEFAULT_REVISION.to_string(),
            password: None,
            max_clients: 25,
            max_companies: 15,
            max_spectators: 15,
            banned: Vec::new(),
            rcon_password: None,
            sync: SyncConfig::default(),
            transfer: TransferConfig::default(),
            timeouts: TimeoutConfig::default(),
            clock: FrameClockConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Parses a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, LockstepError> {
        let config: Self = serde_json::from_str(json)?;
        Ok(config.validated())
    }

    /// Reads and parses a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LockstepError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Clamps out-of-range values, including the nested sections.
    pub fn validated(mut self) -> Self {
        self.server_name = truncate("server_name", self.server_name, MAX_SERVER_NAME_LEN);
        self.revision = truncate("revision", self.revision, MAX_REVISION_LEN);
        if self.max_clients == 0 {
            warn!("max_clients is 0, nobody could join; using 1");
            self.max_clients = 1;
        }
        if self.password.as_deref() == Some("") {
            self.password = None;
        }
        if self.rcon_password.as_deref() == Some("") {
            warn!("empty rcon_password disables the remote console");
            self.rcon_password = None;
        }
        for key in &mut self.banned {
            key.make_ascii_lowercase();
        }
        self.sync = self.sync.validated();
        self.transfer = self.transfer.validated();
        self.clock = self.clock.validated();
        self
    }
}

// ---------------------------------------------------------------------------
// ClientConfig
// ---------------------------------------------------------------------------

/// Settings for a [`GameClient`](crate::GameClient).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub name: String,
    /// Company requested in the join.
    pub company: CompanyId,
    pub revision: String,
    pub password: Option<String>,
    /// Frames between unsolicited acks.
    pub ack_interval: u32,
    /// Largest map the client agrees to download.
    pub max_map_size: u32,
    /// Silence from the server tolerated before giving up, in seconds.
    pub timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: "Player".to_string(),
            company: CompanyId::SPECTATOR,
            revision: DEFAULT_REVISION.to_string(),
            password: None,
            ack_interval: SyncConfig::default().ack_interval,
            max_map_size: TransferConfig::default().max_map_size,
            timeout_secs: 60,
        }
    }
}

impl ClientConfig {
    pub fn from_json_str(json: &str) -> Result<Self, LockstepError> {
        let config: Self = serde_json::from_str(json)?;
        Ok(config.validated())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, LockstepError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validated(mut self) -> Self {
        self.name = truncate("name", self.name, MAX_CLIENT_NAME_LEN);
        self.revision = truncate("revision", self.revision, MAX_REVISION_LEN);
        if self.ack_interval == 0 {
            warn!("ack_interval is 0, using 1");
            self.ack_interval = 1;
        }
        if self.password.as_deref() == Some("") {
            self.password = None;
        }
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        secs(self.timeout_secs)
    }
}

/// Cuts `value` to at most `limit` bytes on a character boundary.
fn truncate(field: &'static str, mut value: String, limit: usize) -> String {
    if value.len() <= limit {
        return value;
    }
    let mut end = limit;
    while !value.is_char_boundary(end) {
        end -= 1;
    }
    warn!(field, len = value.len(), limit, "value too long, truncating");
    value.truncate(end);
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_partial_json_keeps_defaults() {
        let config = ServerConfig::from_json_str(
            r#"{ "server_name": "Test", "sync": { "command_delay": 4 } }"#,
        )
        .unwrap();
        assert_eq!(config.server_name, "Test");
        assert_eq!(config.sync.command_delay, 4);
        assert_eq!(config.sync.sync_freq, SyncConfig::default().sync_freq);
        assert_eq!(config.timeouts, TimeoutConfig::default());
        assert_eq!(config.revision, DEFAULT_REVISION);
    }

    #[test]
    fn test_server_config_invalid_json_returns_parse_error() {
        let err = ServerConfig::from_json_str("{ nope").unwrap_err();
        assert!(matches!(err, LockstepError::ConfigParse(_)));
    }

    #[test]
    fn test_server_config_load_missing_file_returns_io_error() {
        let err = ServerConfig::load("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, LockstepError::ConfigIo(_)));
    }

    #[test]
    fn test_server_config_validated_clamps_values() {
        let config = ServerConfig {
            server_name: "x".repeat(200),
            max_clients: 0,
            password: Some(String::new()),
            banned: vec!["ABCDEF".to_string()],
            ..ServerConfig::default()
        }
        .validated();
        assert_eq!(config.server_name.len(), MAX_SERVER_NAME_LEN);
        assert_eq!(config.max_clients, 1);
        assert_eq!(config.password, None);
        assert_eq!(config.banned, vec!["abcdef".to_string()]);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let cut = truncate("name", "ééééé".to_string(), 5);
        assert_eq!(cut, "éé");
    }

    #[test]
    fn test_timeout_zero_disables() {
        let timeouts = TimeoutConfig {
            idle_secs: 0,
            ..TimeoutConfig::default()
        };
        assert_eq!(timeouts.idle(), None);
        assert_eq!(timeouts.auth(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_client_config_from_json() {
        let config =
            ClientConfig::from_json_str(r#"{ "name": "alice", "ack_interval": 0 }"#).unwrap();
        assert_eq!(config.name, "alice");
        assert_eq!(config.ack_interval, 1);
        assert_eq!(config.company, CompanyId::SPECTATOR);
    }
}
