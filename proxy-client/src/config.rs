use crate::command::CommandArgs;
use crate::error::Error;
use common::CommonConfig;
use common::handshake::GatewayEndpoint;
use common::tls::TlsClientSettings;
use protocol::{SessionId, TargetAddr};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::read_to_string;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "./resources/client.toml";

fn default_reconnect_initial_delay_ms() -> u64 {
    3_000
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub gateway_host: String,
    pub gateway_port: u16,
    #[serde(default)]
    pub use_tls: bool,
    pub tls_ca_file: Option<PathBuf>,
    pub tls_server_name: Option<String>,
    pub session_id: SessionId,
    pub password: String,
    /// Targets this client is willing to dial for the partner. Absent
    /// means everything is allowed.
    pub allowlist: Option<Vec<TargetAddr>>,
    #[serde(default = "default_reconnect_initial_delay_ms")]
    pub reconnect_initial_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
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
        if self.gateway_host.is_empty() {
            return Err(Error::Config("gateway_host must not be empty".into()));
        }
        Ok(())
    }

    pub fn gateway_endpoint(&self) -> GatewayEndpoint {
        GatewayEndpoint {
            host: self.gateway_host.clone(),
            port: self.gateway_port,
            use_tls: self.use_tls,
            tls: TlsClientSettings {
                ca_file: self.tls_ca_file.clone(),
                server_name: self.tls_server_name.clone(),
            },
        }
    }

    /// Literal (host, port) pairs for the per-request check.
    pub fn allowlist_set(&self) -> Option<HashSet<(String, u16)>> {
        self.allowlist.as_ref().map(|entries| {
            entries
                .iter()
                .map(|target| (target.host.clone(), target.port))
                .collect()
        })
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
