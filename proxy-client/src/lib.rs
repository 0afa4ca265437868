pub mod command;
pub mod config;
pub mod error;
mod tunnel;

pub use config::Config;
pub use error::Error;

use common::RoleState;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Running proxy-client instance.
pub struct ClientHandle {
    state: watch::Receiver<RoleState>,
    cancel: CancellationToken,
    task: JoinHandle<RoleState>,
}

impl ClientHandle {
    /// Follow the role through its lifecycle
    /// (connecting/active/reconnecting/...).
    pub fn state(&self) -> watch::Receiver<RoleState> {
        self.state.clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait for the supervisor to finish and return its terminal state.
    pub async fn join(&mut self) -> RoleState {
        (&mut self.task).await.unwrap_or(RoleState::Disconnected)
    }
}

/// Spawn the supervisor for one configured proxy-client. The connection
/// itself is established (and re-established) inside the loop.
pub fn start(config: Config, cancel: CancellationToken) -> ClientHandle {
    let (state_tx, state_rx) = watch::channel(RoleState::Connecting);
    let task = tokio::spawn(tunnel::supervise(
        Arc::new(config),
        state_tx,
        cancel.clone(),
    ));
    ClientHandle {
        state: state_rx,
        cancel,
        task,
    }
}
