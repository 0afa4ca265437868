use crate::config::{Binding, Config};
use common::{Error as CommonError, Multiplexer, TunnelSender};
use protocol::TargetAddr;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// The local listeners of one Active period. Closed as a unit when the
/// partner leaves or the tunnel dies.
pub(crate) struct ListenerSet {
    local_addrs: Vec<SocketAddr>,
    cancel: CancellationToken,
}

impl ListenerSet {
    pub(crate) fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub(crate) fn close(self) {
        self.cancel.cancel();
    }
}

/// Bind every configured listener and start accepting. Accepted sockets
/// become proxied flows through the multiplexer.
pub(crate) async fn open_all(
    config: &Arc<Config>,
    mux: &Arc<Multiplexer>,
    sender: &TunnelSender,
) -> Result<ListenerSet, CommonError> {
    let cancel = sender.closed_token().child_token();
    let mut local_addrs = Vec::with_capacity(config.bindings.len());
    for binding in &config.bindings {
        let listener = TcpListener::bind(binding.listen_addr()).await?;
        let local_addr = listener.local_addr()?;
        info!(
            "Listening on [{local_addr}], forwarding to [{}]",
            binding.target()
        );
        local_addrs.push(local_addr);
        tokio::spawn(accept_loop(
            listener,
            binding.clone(),
            Arc::clone(mux),
            cancel.clone(),
        ));
    }
    Ok(ListenerSet {
        local_addrs,
        cancel,
    })
}

async fn accept_loop(
    listener: TcpListener,
    binding: Binding,
    mux: Arc<Multiplexer>,
    cancel: CancellationToken,
) {
    let target: TargetAddr = binding.target();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Listener for [{target}] closing");
                return;
            }
            accepted = listener.accept() => {
                let (socket, peer_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Fail to accept local connection: {e}");
                        continue;
                    }
                };
                match mux.accept_flow(socket, &target).await {
                    Ok(id) => debug!("Accepted [{peer_addr}] as flow [{id}] toward [{target}]"),
                    Err(e) => {
                        debug!("Tunnel gone while opening a flow: {e}");
                        return;
                    }
                }
            }
        }
    }
}
