//! Backend settings.
//!
//! Each setting comes from the first source that sets it: command line
//! (including the `CHATSYNC_BACKEND_*` environment variables clap reads),
//! then `chatsync-backend/config.toml` under the user config directory,
//! then the built-in value. The merged result is checked before the server
//! sees it, so a typo in the credential table fails at startup instead of
//! locking users out at login.

use std::collections::HashMap;
use std::net::{AddrParseError, SocketAddr};
use std::path::{Path, PathBuf};

/// Default listen address.
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:9000";

/// Default inbound frame limit in bytes.
const DEFAULT_MAX_PAYLOAD_SIZE: usize = 96 * 1024;

/// Default number of records per history answer.
const DEFAULT_HISTORY_LIMIT: usize = 500;

/// Why the backend settings could not be assembled.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The settings file exists but could not be read, or an explicit
    /// `--config` path does not exist.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// File that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The settings file is not valid TOML for this schema.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// The listen address is not an `ip:port` pair.
    #[error("invalid bind address {value:?}: {source}")]
    BindAddr {
        /// The configured value.
        value: String,
        /// Parser error.
        source: AddrParseError,
    },

    /// A size limit was set to zero.
    #[error("`{0}` must be greater than zero")]
    ZeroLimit(&'static str),

    /// The `[tokens]` table is present but lists nobody.
    #[error("[tokens] is empty; remove it to accept any token or list at least one user")]
    NoCredentials,

    /// A `[tokens]` entry has a blank user id or token.
    #[error("[tokens] entry for {user:?} is unusable: {reason}")]
    BadCredential {
        /// User id as written in the file.
        user: String,
        /// What is wrong with it.
        reason: &'static str,
    },
}

/// Contents of the settings file. Every key may be left out.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileLayer {
    server: ServerSection,
    /// User id to accepted token.
    tokens: Option<HashMap<String, String>>,
}

/// `[server]` table.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ServerSection {
    bind_addr: Option<String>,
    max_payload_size: Option<usize>,
    history_limit: Option<usize>,
}

/// Command line of the backend binary.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "ChatSync reference backend")]
pub struct BackendCliArgs {
    /// Listen address as `ip:port`.
    #[arg(short, long, env = "CHATSYNC_BACKEND_ADDR")]
    pub bind: Option<String>,

    /// Settings file (default: `~/.config/chatsync-backend/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Largest inbound frame in bytes.
    #[arg(long)]
    pub max_payload_size: Option<usize>,

    /// Most records returned per history request.
    #[arg(long)]
    pub history_limit: Option<usize>,

    /// Log filter used when `RUST_LOG` is unset.
    #[arg(long, default_value = "info", env = "CHATSYNC_BACKEND_LOG")]
    pub log_level: String,
}

/// Checked backend settings.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    /// Listen address.
    pub bind_addr: SocketAddr,
    /// Largest inbound frame in bytes.
    pub max_payload_size: usize,
    /// Most records per history answer.
    pub history_limit: usize,
    /// Accepted token per user; `None` accepts any non-empty token.
    pub tokens: Option<HashMap<String, String>>,
    /// Log filter string.
    pub log_level: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            history_limit: DEFAULT_HISTORY_LIMIT,
            tokens: None,
            log_level: "info".to_string(),
        }
    }
}

impl BackendConfig {
    /// Read the settings file named by `cli` (or the default one) and merge
    /// it under the command line.
    ///
    /// A missing default file counts as empty; a missing explicit file does
    /// not.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed, or if
    /// the merged settings are out of range.
    pub fn load(cli: &BackendCliArgs) -> Result<Self, ConfigError> {
        let layer = read_layer(cli.config.as_deref())?;
        Self::merge(cli, layer)
    }

    /// Overlay `cli` on `layer`, fill the gaps with defaults and check the result.
    fn merge(cli: &BackendCliArgs, layer: FileLayer) -> Result<Self, ConfigError> {
        let FileLayer { server, tokens } = layer;

        let bind = cli
            .bind
            .clone()
            .or(server.bind_addr)
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind
            .parse()
            .map_err(|source| ConfigError::BindAddr { value: bind, source })?;

        let max_payload_size = positive(
            "max_payload_size",
            cli.max_payload_size.or(server.max_payload_size),
            DEFAULT_MAX_PAYLOAD_SIZE,
        )?;
        let history_limit = positive(
            "history_limit",
            cli.history_limit.or(server.history_limit),
            DEFAULT_HISTORY_LIMIT,
        )?;

        if let Some(tokens) = &tokens {
            check_credentials(tokens)?;
        }

        Ok(Self {
            bind_addr,
            max_payload_size,
            history_limit,
            tokens,
            log_level: cli.log_level.clone(),
        })
    }
}

fn positive(name: &'static str, value: Option<usize>, default: usize) -> Result<usize, ConfigError> {
    match value.unwrap_or(default) {
        0 => Err(ConfigError::ZeroLimit(name)),
        n => Ok(n),
    }
}

fn check_credentials(tokens: &HashMap<String, String>) -> Result<(), ConfigError> {
    if tokens.is_empty() {
        return Err(ConfigError::NoCredentials);
    }
    for (user, token) in tokens {
        let reason = if user.trim().is_empty() {
            "user id is blank"
        } else if user.trim() != user {
            "user id has surrounding whitespace"
        } else if token.is_empty() {
            "token is empty"
        } else {
            continue;
        };
        return Err(ConfigError::BadCredential {
            user: user.clone(),
            reason,
        });
    }
    Ok(())
}

fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("chatsync-backend").join("config.toml"))
}

fn read_layer(explicit: Option<&Path>) -> Result<FileLayer, ConfigError> {
    let (path, required) = match explicit {
        Some(path) => (path.to_path_buf(), true),
        None => match default_path() {
            Some(path) => (path, false),
            None => return Ok(FileLayer::default()),
        },
    };
    match std::fs::read_to_string(&path) {
        Ok(text) => Ok(toml::from_str(&text)?),
        Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no backend config file");
            Ok(FileLayer::default())
        }
        Err(source) => Err(ConfigError::ReadFile { path, source }),
    }
}
