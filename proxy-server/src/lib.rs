pub mod command;
pub mod config;
pub mod error;
mod listener;
mod tunnel;

pub use config::{Binding, Config};
pub use error::Error;

use common::RoleState;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Running proxy-server instance.
pub struct ServerHandle {
    state: watch::Receiver<RoleState>,
    listeners: watch::Receiver<Vec<SocketAddr>>,
    cancel: CancellationToken,
    task: JoinHandle<RoleState>,
}

impl ServerHandle {
    /// Follow the role through its lifecycle
    /// (connecting/active/reconnecting/...).
    pub fn state(&self) -> watch::Receiver<RoleState> {
        self.state.clone()
    }

    /// Addresses of the currently open local listeners; empty outside the
    /// Active state. Port 0 bindings resolve to real ports here.
    pub fn listeners(&self) -> watch::Receiver<Vec<SocketAddr>> {
        self.listeners.clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait for the supervisor to finish and return its terminal state.
    pub async fn join(&mut self) -> RoleState {
        (&mut self.task).await.unwrap_or(RoleState::Disconnected)
    }
}

/// Spawn the supervisor for one configured proxy-server. The connection
/// itself is established (and re-established) inside the loop.
pub fn start(config: Config, cancel: CancellationToken) -> ServerHandle {
    let (state_tx, state_rx) = watch::channel(RoleState::Connecting);
    let (listeners_tx, listeners_rx) = watch::channel(Vec::new());
    let task = tokio::spawn(tunnel::supervise(
        Arc::new(config),
        state_tx,
        listeners_tx,
        cancel.clone(),
    ));
    ServerHandle {
        state: state_rx,
        listeners: listeners_rx,
        cancel,
        task,
    }
}
