use crate::connection::TunnelSettings;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

fn default_worker_threads() -> usize {
    4
}

fn default_log_directory() -> PathBuf {
    PathBuf::from("./logs")
}

fn default_max_log_level() -> String {
    "info".to_string()
}

fn default_ping_interval() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    120
}

/// Settings every role shares, flattened into each role's own
/// configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonConfig {
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default = "default_log_directory")]
    pub log_directory: PathBuf,
    pub log_name_prefix: String,
    #[serde(default = "default_max_log_level")]
    pub max_log_level: String,
    /// Keep-alive cadence on tunnel connections, in seconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    /// Tunnel dies after this much inbound silence, in seconds.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

impl CommonConfig {
    pub fn tunnel_settings(&self) -> TunnelSettings {
        TunnelSettings {
            ping_interval: Duration::from_secs(self.ping_interval),
            idle_timeout: Duration::from_secs(self.idle_timeout),
            ..TunnelSettings::default()
        }
    }
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            log_directory: default_log_directory(),
            log_name_prefix: "revtun".to_string(),
            max_log_level: default_max_log_level(),
            ping_interval: default_ping_interval(),
            idle_timeout: default_idle_timeout(),
        }
    }
}
