use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// A dialable endpoint named by host literal and port.
///
/// The host is kept as the literal string it was configured or received
/// with; allowlist matching compares these literals, no resolution happens
/// before the dial itself.
#[derive(Debug, Clone, Serialize, Deserialize, Hash, Eq, PartialEq)]
pub struct TargetAddr {
    pub host: String,
    pub port: u16,
}

impl TargetAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Display for TargetAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}
