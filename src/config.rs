//! Server and client configuration.
//!
//! Both structs deserialize from JSON with every field optional except the
//! socket path; durations are written as integer milliseconds. Environment
//! variables (`MSGSOCK_*`) override file values.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default read and write deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
/// Default per-connection byte budget (32 MiB).
pub const DEFAULT_MAX_MESSAGE_SIZE: u64 = 32 * 1024 * 1024;
/// Default permission mode applied to the socket file.
pub const DEFAULT_SOCKET_MODE: u32 = 0o666;
/// Default delay between client reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Configuration for a [`Server`](crate::Server).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Filesystem path of the Unix domain socket.
    pub socket_path: PathBuf,
    /// Permission bits applied to the socket file after binding.
    #[serde(default = "default_socket_mode")]
    pub socket_mode: u32,
    /// Deadline for each read from a client; zero disables it.
    #[serde(default = "default_timeout", with = "duration_ms", rename = "read_timeout_ms")]
    pub read_timeout: Duration,
    /// Deadline for each write to a client; zero disables it.
    #[serde(default = "default_timeout", with = "duration_ms", rename = "write_timeout_ms")]
    pub write_timeout: Duration,
    /// Maximum bytes a single connection may deliver.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: u64,
}

impl ServerConfig {
    /// Defaults for a server listening on `socket_path`.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            socket_mode: DEFAULT_SOCKET_MODE,
            read_timeout: DEFAULT_TIMEOUT,
            write_timeout: DEFAULT_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Load from a JSON file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: Self = read_json(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Override fields from `MSGSOCK_*` environment variables.
    ///
    /// Values that fail to parse are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("MSGSOCK_SOCKET_PATH") {
            self.socket_path = PathBuf::from(path);
        }

        if let Ok(mode) = std::env::var("MSGSOCK_SOCKET_MODE") {
            if let Ok(mode) = u32::from_str_radix(mode.trim_start_matches("0o"), 8) {
                self.socket_mode = mode;
            }
        }

        if let Some(timeout) = env_millis("MSGSOCK_READ_TIMEOUT_MS") {
            self.read_timeout = timeout;
        }

        if let Some(timeout) = env_millis("MSGSOCK_WRITE_TIMEOUT_MS") {
            self.write_timeout = timeout;
        }

        if let Some(size) = env_parse::<u64>("MSGSOCK_MAX_MESSAGE_SIZE") {
            self.max_message_size = size;
        }
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<()> {
        validate_common(&self.socket_path, self.max_message_size)
    }
}

/// Configuration for a [`Client`](crate::Client).
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    /// Filesystem path of the server's Unix domain socket.
    pub socket_path: PathBuf,
    /// Deadline for each read from the server; zero disables it.
    #[serde(default = "default_timeout", with = "duration_ms", rename = "read_timeout_ms")]
    pub read_timeout: Duration,
    /// Deadline for each write to the server; zero disables it.
    #[serde(default = "default_timeout", with = "duration_ms", rename = "write_timeout_ms")]
    pub write_timeout: Duration,
    /// Maximum bytes a single connection may deliver.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: u64,
    /// Reconnect automatically when the connection is lost.
    #[serde(default = "default_reconnect")]
    pub reconnect: bool,
    /// Delay between reconnect attempts.
    #[serde(
        default = "default_reconnect_delay",
        with = "duration_ms",
        rename = "reconnect_delay_ms"
    )]
    pub reconnect_delay: Duration,
}

impl ClientConfig {
    /// Defaults for a client dialing `socket_path`.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            read_timeout: DEFAULT_TIMEOUT,
            write_timeout: DEFAULT_TIMEOUT,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            reconnect: true,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    /// Load from a JSON file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: Self = read_json(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Override fields from `MSGSOCK_*` environment variables.
    ///
    /// Values that fail to parse are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("MSGSOCK_SOCKET_PATH") {
            self.socket_path = PathBuf::from(path);
        }

        if let Some(timeout) = env_millis("MSGSOCK_READ_TIMEOUT_MS") {
            self.read_timeout = timeout;
        }

        if let Some(timeout) = env_millis("MSGSOCK_WRITE_TIMEOUT_MS") {
            self.write_timeout = timeout;
        }

        if let Some(size) = env_parse::<u64>("MSGSOCK_MAX_MESSAGE_SIZE") {
            self.max_message_size = size;
        }

        if let Some(reconnect) = env_parse::<bool>("MSGSOCK_RECONNECT") {
            self.reconnect = reconnect;
        }

        if let Some(delay) = env_millis("MSGSOCK_RECONNECT_DELAY_MS") {
            self.reconnect_delay = delay;
        }
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<()> {
        validate_common(&self.socket_path, self.max_message_size)
    }
}

fn validate_common(socket_path: &Path, max_message_size: u64) -> Result<()> {
    if socket_path.as_os_str().is_empty() {
        return Err(Error::Config("socket path is empty".into()));
    }
    if max_message_size == 0 {
        return Err(Error::Config("max_message_size must be greater than zero".into()));
    }
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content)
        .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

fn env_millis(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_millis)
}

fn default_socket_mode() -> u32 {
    DEFAULT_SOCKET_MODE
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_max_message_size() -> u64 {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_reconnect() -> bool {
    true
}

fn default_reconnect_delay() -> Duration {
    DEFAULT_RECONNECT_DELAY
}

/// Serialize a `Duration` as whole milliseconds.
mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(
        value: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
