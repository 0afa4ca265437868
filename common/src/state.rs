use std::fmt::{Display, Formatter};

/// Lifecycle of a proxy role, published through a `tokio::sync::watch`
/// channel so embedders and the process surface can follow along.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleState {
    Connecting,
    Authenticating,
    WaitingForPartner,
    Active,
    Reconnecting,
    /// The gateway rejected our credentials. Terminal; no reconnect.
    FailedAuth,
    /// Shut down on request or evicted by a newer peer. Terminal.
    Disconnected,
}

impl RoleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RoleState::FailedAuth | RoleState::Disconnected)
    }
}

impl Display for RoleState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RoleState::Connecting => "connecting",
            RoleState::Authenticating => "authenticating",
            RoleState::WaitingForPartner => "waiting-for-partner",
            RoleState::Active => "active",
            RoleState::Reconnecting => "reconnecting",
            RoleState::FailedAuth => "failed-auth",
            RoleState::Disconnected => "disconnected",
        };
        write!(f, "{name}")
    }
}
