//! Configuration system for the `ChatSync` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/chatsync/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use chatsync_proto::message::UserId;

use crate::connection::{MIN_CHANNEL_CAPACITY, ReconnectPolicy};
use crate::session::Identity;
use crate::sync::SyncConfig;
use crate::sync::reconciler::{EchoMatch, ReconcileConfig};
use crate::transport::ws::WsBackend;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// The server URL is not a `ws://` or `wss://` URL.
    #[error("invalid server url {url:?}: {reason}")]
    InvalidUrl {
        /// The configured value.
        url: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A setting is out of its allowed range.
    #[error("invalid setting `{field}`: {reason}")]
    Invalid {
        /// Name of the setting.
        field: &'static str,
        /// Why the value is refused.
        reason: String,
    },

    /// A setting required to connect is not set anywhere.
    #[error("missing required setting `{0}` (pass it on the command line or in the config file)")]
    Missing(&'static str),
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    network: NetworkFileConfig,
    reconnect: ReconnectFileConfig,
    sync: SyncFileConfig,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    server_url: Option<String>,
    user_id: Option<String>,
    token: Option<String>,
    connect_timeout_secs: Option<u64>,
    handshake_timeout_secs: Option<u64>,
    channel_capacity: Option<usize>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    base_delay_ms: Option<u64>,
    factor: Option<u32>,
    max_delay_secs: Option<u64>,
}

/// `[sync]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SyncFileConfig {
    pending_timeout_secs: Option<u64>,
    echo_match: Option<EchoMatchSetting>,
    echo_window_secs: Option<u64>,
    typing_timeout_secs: Option<u64>,
    sweep_interval_ms: Option<u64>,
    event_buffer: Option<usize>,
    timestamp_format: Option<String>,
}

/// Spelling of [`EchoMatch`] in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
enum EchoMatchSetting {
    Fifo,
    Nearest,
}

impl From<EchoMatchSetting> for EchoMatch {
    fn from(setting: EchoMatchSetting) -> Self {
        match setting {
            EchoMatchSetting::Fifo => Self::Fifo,
            EchoMatchSetting::Nearest => Self::NearestTimestamp,
        }
    }
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Clone)]
pub struct ClientConfig {
    // -- Network --
    /// Backend WebSocket URL.
    pub server_url: Option<String>,
    /// User to log in as.
    pub user_id: Option<String>,
    /// Credential for `user_id`.
    pub token: Option<String>,
    /// Timeout for opening the WebSocket connection.
    pub connect_timeout: Duration,
    /// Timeout for the authentication handshake.
    pub handshake_timeout: Duration,
    /// Capacity of the connection feed and outbound queue.
    pub channel_capacity: usize,

    // -- Reconnect --
    /// Reconnect backoff schedule.
    pub reconnect: ReconnectPolicy,

    // -- Sync --
    /// Time a send may stay pending while connected.
    pub pending_timeout: Duration,
    /// Tie-break among identical pending sends.
    pub echo_match: EchoMatch,
    /// Maximum clock distance between a send and its echo.
    pub echo_window: Duration,
    /// Lifetime of a typing indicator.
    pub typing_timeout: Duration,
    /// Interval of the timeout sweep.
    pub sweep_interval: Duration,
    /// Capacity of the sync event channel.
    pub event_buffer: usize,
    /// Timestamp display format string (chrono).
    pub timestamp_format: String,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("server_url", &self.server_url)
            .field("user_id", &self.user_id)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("connect_timeout", &self.connect_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("channel_capacity", &self.channel_capacity)
            .field("reconnect", &self.reconnect)
            .field("pending_timeout", &self.pending_timeout)
            .field("echo_match", &self.echo_match)
            .field("echo_window", &self.echo_window)
            .field("typing_timeout", &self.typing_timeout)
            .field("sweep_interval", &self.sweep_interval)
            .field("event_buffer", &self.event_buffer)
            .field("timestamp_format", &self.timestamp_format)
            .finish()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        let sync = SyncConfig::default();
        Self {
            server_url: None,
            user_id: None,
            token: None,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            channel_capacity: sync.channel_capacity,
            reconnect: sync.reconnect,
            pending_timeout: sync.reconcile.pending_timeout,
            echo_match: sync.reconcile.echo_match,
            echo_window: sync.reconcile.echo_window,
            typing_timeout: sync.typing_timeout,
            sweep_interval: sync.sweep_interval,
            event_buffer: sync.event_buffer,
            timestamp_format: "%H:%M".to_string(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an
    /// error. Otherwise the default path (`~/.config/chatsync/config.toml`)
    /// is tried and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed,
    /// or if a resolved setting is out of range.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        let config = Self::resolve(cli, &file);
        config.validate()?;
        Ok(config)
    }

    /// Check the settings that cannot be clamped silently.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_capacity < MIN_CHANNEL_CAPACITY {
            return Err(ConfigError::Invalid {
                field: "channel_capacity",
                reason: format!(
                    "{} is below the minimum of {MIN_CHANNEL_CAPACITY}",
                    self.channel_capacity
                ),
            });
        }
        if self.reconnect.base_delay.is_zero() {
            return Err(ConfigError::Invalid {
                field: "base_delay_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let network = &file.network;
        let reconnect = &file.reconnect;
        let sync = &file.sync;

        Self {
            server_url: cli
                .server_url
                .clone()
                .or_else(|| network.server_url.clone()),
            user_id: cli.user_id.clone().or_else(|| network.user_id.clone()),
            token: cli.token.clone().or_else(|| network.token.clone()),
            connect_timeout: network
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            handshake_timeout: network
                .handshake_timeout_secs
                .map_or(defaults.handshake_timeout, Duration::from_secs),
            channel_capacity: network
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
            reconnect: ReconnectPolicy {
                base_delay: reconnect
                    .base_delay_ms
                    .map_or(defaults.reconnect.base_delay, Duration::from_millis),
                factor: reconnect.factor.unwrap_or(defaults.reconnect.factor),
                max_delay: reconnect
                    .max_delay_secs
                    .map_or(defaults.reconnect.max_delay, Duration::from_secs),
            },
            pending_timeout: sync
                .pending_timeout_secs
                .map_or(defaults.pending_timeout, Duration::from_secs),
            echo_match: sync.echo_match.map_or(defaults.echo_match, EchoMatch::from),
            echo_window: sync
                .echo_window_secs
                .map_or(defaults.echo_window, Duration::from_secs),
            typing_timeout: sync
                .typing_timeout_secs
                .map_or(defaults.typing_timeout, Duration::from_secs),
            sweep_interval: sync
                .sweep_interval_ms
                .map_or(defaults.sweep_interval, Duration::from_millis),
            event_buffer: sync.event_buffer.unwrap_or(defaults.event_buffer),
            timestamp_format: cli
                .timestamp_format
                .clone()
                .or_else(|| sync.timestamp_format.clone())
                .unwrap_or(defaults.timestamp_format),
        }
    }

    /// Build the [`SyncConfig`] for a session.
    #[must_use]
    pub const fn to_sync_config(&self) -> SyncConfig {
        SyncConfig {
            reconcile: ReconcileConfig {
                pending_timeout: self.pending_timeout,
                echo_match: self.echo_match,
                echo_window: self.echo_window,
            },
            reconnect: self.reconnect,
            typing_timeout: self.typing_timeout,
            sweep_interval: self.sweep_interval,
            event_buffer: self.event_buffer,
            channel_capacity: self.channel_capacity,
        }
    }

    /// Build the WebSocket backend.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] if no server URL is configured and
    /// [`ConfigError::InvalidUrl`] if it is not a WebSocket URL.
    pub fn backend(&self) -> Result<WsBackend, ConfigError> {
        let raw = self
            .server_url
            .as_deref()
            .ok_or(ConfigError::Missing("server_url"))?;
        let invalid = |reason: String| ConfigError::InvalidUrl {
            url: raw.to_string(),
            reason,
        };
        let url = url::Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(invalid(format!("unsupported scheme `{}`", url.scheme())));
        }
        Ok(WsBackend::new(raw).with_timeouts(self.connect_timeout, self.handshake_timeout))
    }

    /// Build the login identity.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] if the user id or token is not set.
    pub fn identity(&self) -> Result<Identity, ConfigError> {
        let user_id = self
            .user_id
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or(ConfigError::Missing("user_id"))?;
        let token = self.token.clone().ok_or(ConfigError::Missing("token"))?;
        Ok(Identity::new(UserId::new(user_id), token))
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Headless real-time chat synchronization client")]
pub struct CliArgs {
    /// WebSocket URL of the backend.
    #[arg(long, env = "CHATSYNC_SERVER_URL")]
    pub server_url: Option<String>,

    /// User to log in as.
    #[arg(long, env = "CHATSYNC_USER")]
    pub user_id: Option<String>,

    /// Credential for the user.
    #[arg(long, env = "CHATSYNC_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Path to config file (default: `~/.config/chatsync/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Timestamp display format (chrono format string).
    #[arg(long)]
    pub timestamp_format: Option<String>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "CHATSYNC_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/chatsync.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }

    let Some(config_dir) = dirs::config_dir() else {
        // No config dir available; use defaults.
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("chatsync").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
