use crate::command::CommandArgs;
use crate::error::Error;
use common::CommonConfig;
use protocol::SessionId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::read_to_string;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "./resources/gateway.toml";

fn default_max_peer_connections() -> usize {
    64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsListenerConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub listen_address: SocketAddr,
    pub tls: Option<TlsListenerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub id: SessionId,
    pub client_password: String,
    pub server_password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub listeners: Vec<ListenerConfig>,
    pub sessions: Vec<SessionConfig>,
    /// Cap on concurrently connected tunnel peers across all listeners.
    #[serde(default = "default_max_peer_connections")]
    pub max_peer_connections: usize,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let content = read_to_string(path).map_err(|e| {
            Error::Config(format!(
                "fail to read configuration file {}: {e}",
                path.display()
            ))
        })?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.listeners.is_empty() {
            return Err(Error::Config("at least one listener is required".into()));
        }
        if self.sessions.is_empty() {
            return Err(Error::Config("at least one session is required".into()));
        }
        let mut seen = HashSet::new();
        for session in &self.sessions {
            if !seen.insert(session.id) {
                return Err(Error::Config(format!(
                    "session id [{}] configured twice",
                    session.id
                )));
            }
        }
        Ok(())
    }

    pub fn merge_command_args(&mut self, command: &CommandArgs) {
        if let Some(worker_threads) = command.worker_threads {
            self.common.worker_threads = worker_threads;
        }
        if let Some(log_directory) = &command.log_directory {
            self.common.log_directory = log_directory.clone();
        }
        if let Some(max_log_level) = &command.max_log_level {
            self.common.max_log_level = max_log_level.clone();
        }
    }
}
