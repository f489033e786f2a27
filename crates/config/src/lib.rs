//! Moonbridge configuration: a small RON file naming the Klippy socket and
//! the bridge's timing knobs.
//!
//! ```ron
//! (
//!     klippy_uds_address: "/tmp/klippy_uds",
//!     connect_poll_ms: 250,
//!     init_retry_ms: 250,
//!     pending_log_secs: 60,
//! )
//! ```
//!
//! Every field is optional.

use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use klippy_bridge::BridgeConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

mod error;

pub use error::{Error, excerpt_at};

/// Parsed configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Path of the Klippy API socket.
    pub klippy_uds_address: PathBuf,
    /// Socket polling interval while disconnected, in milliseconds.
    pub connect_poll_ms: u64,
    /// Handshake retry interval, in milliseconds.
    pub init_retry_ms: u64,
    /// Log a still-pending request every this many seconds.
    pub pending_log_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let bridge = BridgeConfig::default();
        Self {
            klippy_uds_address: bridge.socket_path,
            connect_poll_ms: bridge.connect_poll_interval.as_millis() as u64,
            init_retry_ms: bridge.init_retry_interval.as_millis() as u64,
            pending_log_secs: bridge.pending_log_interval.as_secs(),
        }
    }
}

impl Config {
    /// Replace the socket path when `socket` is given.
    pub fn with_socket(mut self, socket: Option<PathBuf>) -> Self {
        if let Some(s) = socket {
            self.klippy_uds_address = s;
        }
        self
    }

    /// Reject values the bridge cannot run with.
    pub fn validate(&self, path: Option<&Path>) -> Result<(), Error> {
        let invalid = |field: &'static str, message: &str| Error::Validation {
            path: path.map(Path::to_path_buf),
            field,
            message: message.to_string(),
        };
        if self.klippy_uds_address.as_os_str().is_empty() {
            return Err(invalid("klippy_uds_address", "must not be empty"));
        }
        for (field, value) in [
            ("connect_poll_ms", self.connect_poll_ms),
            ("init_retry_ms", self.init_retry_ms),
            ("pending_log_secs", self.pending_log_secs),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be greater than zero"));
            }
        }
        Ok(())
    }

    /// Bridge settings described by this configuration.
    pub fn bridge(&self) -> BridgeConfig {
        BridgeConfig {
            connect_poll_interval: Duration::from_millis(self.connect_poll_ms),
            init_retry_interval: Duration::from_millis(self.init_retry_ms),
            pending_log_interval: Duration::from_secs(self.pending_log_secs),
            ..BridgeConfig::new(&self.klippy_uds_address)
        }
    }
}

/// Determine the preferred user config path (`~/.moonbridge/config.ron`).
pub fn default_config_path() -> PathBuf {
    let mut p = PathBuf::from(env::var_os("HOME").unwrap_or_default());
    p.push(".moonbridge");
    p.push("config.ron");
    p
}

/// Resolve the effective config path.
///
/// Policy:
/// 1) Use `explicit` when provided, whether or not it exists.
/// 2) Else use `~/.moonbridge/config.ron` when it exists.
/// 3) Else `None`: run on defaults.
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let preferred = default_config_path();
    preferred.exists().then_some(preferred)
}

/// Parse and validate configuration text.
pub fn load_from_str(source: &str, path: Option<&Path>) -> Result<Config, Error> {
    let config: Config = ron::from_str(source).map_err(|e| {
        let line = e.span.start.line;
        let col = e.span.start.col;
        Error::Parse {
            path: path.map(Path::to_path_buf),
            line,
            col,
            message: e.code.to_string(),
            excerpt: excerpt_at(source, line, col),
        }
    })?;
    config.validate(path)?;
    Ok(config)
}

/// Read, parse and validate the file at `path`.
pub fn load_from_path(path: &Path) -> Result<Config, Error> {
    let source = fs::read_to_string(path).map_err(|e| Error::Read {
        path: Some(path.to_path_buf()),
        message: e.to_string(),
    })?;
    load_from_str(&source, Some(path))
}

/// Load the effective configuration: `explicit` or the default file if
/// present, defaults otherwise.
pub fn load(explicit: Option<&Path>) -> Result<(Config, Option<PathBuf>), Error> {
    match resolve_config_path(explicit) {
        Some(path) => {
            debug!(path = %path.display(), "loading config");
            Ok((load_from_path(&path)?, Some(path)))
        }
        None => {
            debug!("no config file; using defaults");
            Ok((Config::default(), None))
        }
    }
}
