//! Daemon configuration.
//!
//! Loaded from a TOML file, then overridden from the environment:
//!
//! ```toml
//! socket_path = "/run/netprobe.sock"
//! excluded_kernel_versions = ["5.5.1"]
//! introspection_port = 7777
//!
//! [tracker]
//! buffer_capacity = 20000
//! client_timeout_secs = 60
//!
//! [source]
//! kind = "jsonl"
//! path = "/run/netprobe/events.fifo"
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gate::{KernelVersion, DEFAULT_MIN_KERNEL};

/// Default socket path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/netprobe.sock";

/// Environment variable overriding `socket_path`
pub const SOCKET_ENV: &str = "NETPROBE_SOCKET";

/// Environment variable overriding `log_level`
pub const LOG_ENV: &str = "NETPROBE_LOG";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {error}")]
    Read { path: PathBuf, error: String },

    #[error("failed to parse config {path}: {error}")]
    Parse { path: PathBuf, error: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

// ============================================================================
// Tracker Settings
// ============================================================================

/// Limits and timers for the tracking engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Maximum closed connections retained for delivery
    pub buffer_capacity: usize,
    /// Maximum active connections tracked at once
    pub max_connections: usize,
    /// Maximum registered polling clients
    pub max_clients: usize,
    /// Clients that do not poll for this long are forgotten
    pub client_timeout_secs: u64,
    /// Active connections with no event for this long are dropped
    pub idle_connection_timeout_secs: u64,
    /// Period of the expiry / rate sampling tick
    pub maintenance_interval_secs: u64,
    /// Bound of the ingestion queue between sources and the tracker
    pub event_queue_capacity: usize,
    /// Bound of the query/command queue
    pub command_queue_capacity: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 10_000,
            max_connections: 65_536,
            max_clients: 32,
            client_timeout_secs: 120,
            idle_connection_timeout_secs: 600,
            maintenance_interval_secs: 2,
            event_queue_capacity: 4096,
            command_queue_capacity: 100,
        }
    }
}

impl TrackerConfig {
    pub fn client_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.client_timeout_secs).unwrap_or(i64::MAX))
    }

    pub fn idle_connection_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            i64::try_from(self.idle_connection_timeout_secs).unwrap_or(i64::MAX),
        )
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    /// Rejects settings that would make the tracker unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("tracker.buffer_capacity", self.buffer_capacity as u64),
            ("tracker.max_connections", self.max_connections as u64),
            ("tracker.max_clients", self.max_clients as u64),
            ("tracker.client_timeout_secs", self.client_timeout_secs),
            (
                "tracker.idle_connection_timeout_secs",
                self.idle_connection_timeout_secs,
            ),
            (
                "tracker.maintenance_interval_secs",
                self.maintenance_interval_secs,
            ),
            ("tracker.event_queue_capacity", self.event_queue_capacity as u64),
            (
                "tracker.command_queue_capacity",
                self.command_queue_capacity as u64,
            ),
        ];

        match positive.iter().find(|(_, value)| *value == 0) {
            Some((name, _)) => Err(ConfigError::Invalid(format!("{name} must be greater than 0"))),
            None => Ok(()),
        }
    }
}

// ============================================================================
// Source Settings
// ============================================================================

/// Which event source feeds the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Poll `/proc/net/tcp{,6}`
    #[default]
    Procnet,
    /// Read JSON lines from a file or FIFO
    Jsonl,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub poll_interval_ms: u64,
    /// How often still-established sockets are re-announced to the tracker.
    /// Must stay below `tracker.idle_connection_timeout_secs`.
    pub refresh_interval_secs: u64,
    pub path: Option<PathBuf>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Procnet,
            poll_interval_ms: 1000,
            refresh_interval_secs: 60,
            path: None,
        }
    }
}

impl SourceConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

// ============================================================================
// Daemon Settings
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub log_level: String,
    pub excluded_kernel_versions: Vec<String>,
    pub min_kernel_version: String,
    pub heartbeat_interval_secs: u64,
    /// Localhost TCP port serving tracker stats, disabled when unset
    pub introspection_port: Option<u16>,
    pub tracker: TrackerConfig,
    pub source: SourceConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            log_level: "info".to_string(),
            excluded_kernel_versions: Vec::new(),
            min_kernel_version: DEFAULT_MIN_KERNEL.to_string(),
            heartbeat_interval_secs: 15,
            introspection_port: None,
            tracker: TrackerConfig::default(),
            source: SourceConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Default config file location, if a config directory exists.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("netprobe").join("netprobed.toml"))
    }

    /// Parses a TOML document.
    pub fn from_toml(path: &Path, contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })
    }

    /// Reads and parses a config file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        Self::from_toml(path, &contents)
    }

    /// Loads configuration the way the daemon does at startup.
    ///
    /// An explicit path must exist. Without one, the default location is
    /// used when present, otherwise built-in defaults. Environment overrides
    /// are applied last.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };

        config.apply_env_overrides(|key| env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Applies environment overrides using the given lookup.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(socket) = lookup(SOCKET_ENV).filter(|s| !s.is_empty()) {
            self.socket_path = PathBuf::from(socket);
        }
        if let Some(level) = lookup(LOG_ENV).filter(|s| !s.is_empty()) {
            self.log_level = level;
        }
    }

    pub fn min_kernel(&self) -> Result<KernelVersion, ConfigError> {
        self.min_kernel_version
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("min_kernel_version {e}")))
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tracker.validate()?;
        self.min_kernel()?;

        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "heartbeat_interval_secs must be greater than 0".to_string(),
            ));
        }

        match self.source.kind {
            SourceKind::Procnet if self.source.poll_interval_ms == 0 => Err(ConfigError::Invalid(
                "source.poll_interval_ms must be greater than 0".to_string(),
            )),
            SourceKind::Procnet
                if self.source.refresh_interval_secs == 0
                    || self.source.refresh_interval_secs
                        >= self.tracker.idle_connection_timeout_secs =>
            {
                Err(ConfigError::Invalid(format!(
                    "source.refresh_interval_secs must be between 1 and {} \
                     (tracker.idle_connection_timeout_secs)",
                    self.tracker.idle_connection_timeout_secs.saturating_sub(1)
                )))
            }
            SourceKind::Jsonl if self.source.path.is_none() => Err(ConfigError::Invalid(
                "source.path is required for the jsonl source".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = DaemonConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.socket_path, PathBuf::from(DEFAULT_SOCKET_PATH));
        assert_eq!(config.min_kernel().unwrap(), DEFAULT_MIN_KERNEL);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = DaemonConfig::from_toml(
            Path::new("test.toml"),
            r#"
            socket_path = "/run/np.sock"
            excluded_kernel_versions = ["5.5.1"]

            [tracker]
            buffer_capacity = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.socket_path, PathBuf::from("/run/np.sock"));
        assert_eq!(config.excluded_kernel_versions, vec!["5.5.1".to_string()]);
        assert_eq!(config.tracker.buffer_capacity, 2);
        assert_eq!(config.tracker.max_clients, TrackerConfig::default().max_clients);
        assert_eq!(config.source.kind, SourceKind::Procnet);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[source]\nkind = \"jsonl\"\npath = \"/tmp/events\"").unwrap();

        let config = DaemonConfig::from_file(file.path()).unwrap();
        assert_eq!(config.source.kind, SourceKind::Jsonl);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = DaemonConfig::from_file(Path::new("/nonexistent/netprobed.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_bad_toml_is_parse_error() {
        let err = DaemonConfig::from_toml(Path::new("x.toml"), "socket_path = [").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let mut config = DaemonConfig::default();
        config.tracker.buffer_capacity = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("buffer_capacity"));
    }

    #[test]
    fn test_jsonl_requires_path() {
        let mut config = DaemonConfig::default();
        config.source.kind = SourceKind::Jsonl;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_refresh_must_beat_idle_timeout() {
        let mut config = DaemonConfig::default();
        config.tracker.idle_connection_timeout_secs = 30;
        config.source.refresh_interval_secs = 30;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("refresh_interval_secs"));

        config.source.refresh_interval_secs = 10;
        assert!(config.validate().is_ok());

        config.source.refresh_interval_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = DaemonConfig::default();
        config.apply_env_overrides(|key| match key {
            SOCKET_ENV => Some("/run/other.sock".to_string()),
            LOG_ENV => Some("debug".to_string()),
            _ => None,
        });
        assert_eq!(config.socket_path, PathBuf::from("/run/other.sock"));
        assert_eq!(config.log_level, "debug");
    }
}
