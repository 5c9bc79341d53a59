//! Communicator configuration.
//!
//! Values come from, in increasing priority: built-in defaults, a TOML file,
//! and `TDL_*` environment variables.
//!
//! ```toml
//! server_name = "trace_daemon"
//! socket_dir = "/run/user/1000"
//! send_timeout_ms = 500
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;

/// Logical name the daemon publishes its request endpoint under.
pub const DEFAULT_SERVER_NAME: &str = "trace_daemon";

/// Deadline for one request/reply exchange.
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 500;

pub const ENV_SERVER_NAME: &str = "TDL_SERVER_NAME";
pub const ENV_SOCKET_DIR: &str = "TDL_SOCKET_DIR";
pub const ENV_SEND_TIMEOUT_MS: &str = "TDL_SEND_TIMEOUT_MS";

/// Settings for a [`DaemonCommunicator`](crate::DaemonCommunicator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunicatorConfig {
    /// Logical name of the daemon's request endpoint.
    pub server_name: String,

    /// Directory holding the daemon's socket (Unix transport only).
    pub socket_dir: PathBuf,

    /// Per-exchange deadline in milliseconds.
    pub send_timeout_ms: u64,
}

impl Default for CommunicatorConfig {
    fn default() -> Self {
        Self {
            server_name: DEFAULT_SERVER_NAME.to_string(),
            socket_dir: default_socket_dir(),
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
        }
    }
}

impl CommunicatorConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    /// `<config dir>/tdl/config.toml`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("tdl").join("config.toml"))
    }

    /// Loads the configuration and applies environment overrides.
    ///
    /// An explicit `path` must exist. Without one, the default location is
    /// tried and a missing file means built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) => match Self::from_file(&path) {
                    Err(ConfigError::Io { source, .. })
                        if source.kind() == io::ErrorKind::NotFound =>
                    {
                        debug!(path = %path.display(), "No config file, using defaults");
                        Self::default()
                    }
                    other => other?,
                },
                None => Self::default(),
            },
        };

        config.with_overrides(|name| std::env::var(name).ok())
    }

    /// Reads a TOML file; missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies `TDL_*` overrides looked up through `lookup`.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(name) = lookup(ENV_SERVER_NAME) {
            self.server_name = name;
        }
        if let Some(dir) = lookup(ENV_SOCKET_DIR) {
            self.socket_dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup(ENV_SEND_TIMEOUT_MS) {
            self.send_timeout_ms = raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                variable: ENV_SEND_TIMEOUT_MS,
                value: raw.clone(),
            })?;
        }
        Ok(self)
    }
}

fn default_socket_dir() -> PathBuf {
    dirs::runtime_dir().unwrap_or_else(|| PathBuf::from("/tmp"))
}
