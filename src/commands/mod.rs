//! Demo subcommands.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use msgsock::{ClientConfig, ServerConfig};

pub mod chat;
pub mod pingpong;

/// Socket selection shared by every subcommand.
pub struct SocketOptions {
    pub config: Option<PathBuf>,
    pub socket: Option<PathBuf>,
}

impl SocketOptions {
    /// File config (if given), then `MSGSOCK_*` env vars, then `--socket`.
    pub fn server_config(&self, default_path: &str) -> Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::load(path).with_context(|| config_error(path))?,
            None => {
                let mut config = ServerConfig::new(default_path);
                config.apply_env_overrides();
                config
            }
        };
        if let Some(socket) = &self.socket {
            config.socket_path.clone_from(socket);
        }
        Ok(config)
    }

    /// Client counterpart of [`server_config`](Self::server_config).
    pub fn client_config(&self, default_path: &str) -> Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => ClientConfig::load(path).with_context(|| config_error(path))?,
            None => {
                let mut config = ClientConfig::new(default_path);
                config.apply_env_overrides();
                config
            }
        };
        if let Some(socket) = &self.socket {
            config.socket_path.clone_from(socket);
        }
        Ok(config)
    }
}

fn config_error(path: &Path) -> String {
    format!("Failed to load config from {}", path.display())
}
