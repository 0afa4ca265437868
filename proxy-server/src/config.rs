use crate::command::CommandArgs;
use crate::error::Error;
use common::CommonConfig;
use common::handshake::GatewayEndpoint;
use common::tls::TlsClientSettings;
use protocol::{SessionId, TargetAddr};
use serde::{Deserialize, Serialize};
use std::fs::read_to_string;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_FILE: &str = "./resources/server.toml";

fn default_reconnect_initial_delay_ms() -> u64 {
    3_000
}

fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}

/// One local listener and the target the partner should dial for every
/// connection accepted on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Binding {
    /// Defaults to all interfaces.
    pub listen_ip: Option<IpAddr>,
    pub listen_port: u16,
    pub target_host: String,
    pub target_port: u16,
}

impl Binding {
    pub fn listen_addr(&self) -> SocketAddr {
        let ip = self
            .listen_ip
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        SocketAddr::new(ip, self.listen_port)
    }

    pub fn target(&self) -> TargetAddr {
        TargetAddr::new(self.target_host.clone(), self.target_port)
    }
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
    pub bindings: Vec<Binding>,
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
        if self.bindings.is_empty() {
            return Err(Error::Config("at least one binding is required".into()));
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
