pub mod command;
pub mod config;
pub mod error;
pub mod peer;
pub mod session;

pub use config::{Config, ListenerConfig, SessionConfig, TlsListenerConfig};
pub use error::Error;
pub use session::SessionRegistry;

use common::tls::{TlsAcceptor, accept_tls, build_acceptor};
use common::{MaybeTlsStream, TunnelSettings};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Running gateway instance. Dropping the handle does not stop it; cancel
/// the token handed to [`start`] (or call [`GatewayHandle::shutdown`]).
pub struct GatewayHandle {
    local_addrs: Vec<SocketAddr>,
    cancel: CancellationToken,
}

impl GatewayHandle {
    /// Addresses the gateway actually bound, in listener config order.
    /// Port 0 in the config resolves to a real port here.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Bind every configured listener and start accepting tunnel peers.
pub async fn start(config: Config, cancel: CancellationToken) -> Result<GatewayHandle, Error> {
    config.validate()?;
    let registry = Arc::new(SessionRegistry::new(&config.sessions));
    let settings = config.common.tunnel_settings();
    let peer_permits = Arc::new(Semaphore::new(config.max_peer_connections));

    let mut local_addrs = Vec::with_capacity(config.listeners.len());
    for listener_config in &config.listeners {
        let listener = TcpListener::bind(listener_config.listen_address).await?;
        let local_addr = listener.local_addr()?;
        info!(
            "Gateway listening on [{local_addr}]{}",
            if listener_config.tls.is_some() {
                " with TLS"
            } else {
                ""
            }
        );
        local_addrs.push(local_addr);

        let acceptor = match &listener_config.tls {
            Some(tls) => Some(build_acceptor(&tls.cert_file, &tls.key_file).await?),
            None => None,
        };
        tokio::spawn(accept_loop(
            listener,
            acceptor,
            Arc::clone(&registry),
            settings.clone(),
            Arc::clone(&peer_permits),
            cancel.clone(),
        ));
    }

    Ok(GatewayHandle {
        local_addrs,
        cancel,
    })
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    registry: Arc<SessionRegistry>,
    settings: TunnelSettings,
    peer_permits: Arc<Semaphore>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Gateway listener stopping");
                return;
            }
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!("Fail to accept incoming connection: {e}");
                        continue;
                    }
                };
                let permit = match Arc::clone(&peer_permits).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                debug!("Accepted tunnel peer from [{peer_addr}]");
                let acceptor = acceptor.clone();
                let registry = Arc::clone(&registry);
                let settings = settings.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let stream = match acceptor {
                        Some(acceptor) => match accept_tls(&acceptor, stream).await {
                            Ok(stream) => stream,
                            Err(e) => {
                                debug!("TLS handshake with [{peer_addr}] failed: {e}");
                                drop(permit);
                                return;
                            }
                        },
                        None => MaybeTlsStream::Plain(stream),
                    };
                    if let Err(e) =
                        peer::handle_peer(stream, peer_addr, registry, settings, cancel).await
                    {
                        debug!("Peer [{peer_addr}] closed: {e}");
                    }
                    drop(permit);
                });
            }
        }
    }
}
