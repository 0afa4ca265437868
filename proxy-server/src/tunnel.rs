use crate::config::Config;
use crate::listener;
use common::{
    Backoff, CloseMode, DRAIN_DEADLINE, Error as CommonError, FlowConfig, Multiplexer, RoleState,
    TunnelReceiver, TunnelSender, handshake,
};
use protocol::{CloseReason, Message, Role};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why one tunnel attempt ended without an error.
enum TunnelExit {
    /// External shutdown request; the goodbye has been said.
    Shutdown,
    /// A newer proxy-server took over our session slot.
    Evicted,
}

/// Connect-authenticate-serve loop with reconnect backoff. Runs until a
/// terminal state is reached and returns it.
pub(crate) async fn supervise(
    config: Arc<Config>,
    state_tx: watch::Sender<RoleState>,
    listeners_tx: watch::Sender<Vec<SocketAddr>>,
    cancel: CancellationToken,
) -> RoleState {
    let endpoint = config.gateway_endpoint();
    let mut backoff = Backoff::new(
        Duration::from_millis(config.reconnect_initial_delay_ms),
        Duration::from_millis(config.reconnect_max_delay_ms),
    );
    loop {
        let attempt = run_tunnel(
            &config,
            &endpoint,
            &state_tx,
            &listeners_tx,
            &mut backoff,
            &cancel,
        )
        .await;
        let _ = listeners_tx.send(Vec::new());
        match attempt {
            Ok(TunnelExit::Shutdown) | Ok(TunnelExit::Evicted) => {
                let _ = state_tx.send(RoleState::Disconnected);
                return RoleState::Disconnected;
            }
            Err(CommonError::AuthFailed) => {
                warn!("Gateway rejected our credentials, giving up");
                let _ = state_tx.send(RoleState::FailedAuth);
                return RoleState::FailedAuth;
            }
            Err(e) => {
                debug!("Tunnel attempt failed: {e}");
            }
        }
        if cancel.is_cancelled() {
            let _ = state_tx.send(RoleState::Disconnected);
            return RoleState::Disconnected;
        }
        let _ = state_tx.send(RoleState::Reconnecting);
        let delay = backoff.next_delay();
        debug!("Reconnecting to the gateway in {delay:?}");
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = state_tx.send(RoleState::Disconnected);
                return RoleState::Disconnected;
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn run_tunnel(
    config: &Arc<Config>,
    endpoint: &handshake::GatewayEndpoint,
    state_tx: &watch::Sender<RoleState>,
    listeners_tx: &watch::Sender<Vec<SocketAddr>>,
    backoff: &mut Backoff,
    cancel: &CancellationToken,
) -> Result<TunnelExit, CommonError> {
    let _ = state_tx.send(RoleState::Connecting);
    let stream = handshake::connect_stream(endpoint).await?;

    let _ = state_tx.send(RoleState::Authenticating);
    // Deliberately not a child of the role token: an external shutdown
    // must leave the connection alive long enough for the goodbye.
    let tunnel_cancel = CancellationToken::new();
    let (sender, mut receiver) = handshake::authenticate(
        stream,
        endpoint.address(),
        config.session_id,
        Role::Server,
        config.password.as_bytes(),
        config.common.tunnel_settings(),
        tunnel_cancel.clone(),
    )
    .await?;
    backoff.reset();

    // Targets are announced right away; listeners wait for the partner.
    sender
        .send(Message::OpenSession {
            targets: config.bindings.iter().map(|b| b.target()).collect(),
        })
        .await?;
    let _ = state_tx.send(RoleState::WaitingForPartner);

    let mux = Multiplexer::new(
        sender.clone(),
        FlowConfig::default(),
        tunnel_cancel.child_token(),
    );
    let mut listeners: Option<listener::ListenerSet> = None;

    let result = event_loop(
        config,
        state_tx,
        listeners_tx,
        &sender,
        &mut receiver,
        &mux,
        &mut listeners,
        cancel,
    )
    .await;

    if let Some(set) = listeners.take() {
        set.close();
    }
    mux.shutdown_all();
    match &result {
        Ok(TunnelExit::Shutdown) => {
            graceful_goodbye(&sender, &mut receiver).await;
        }
        _ => {
            sender.close(CloseMode::Abortive).await;
        }
    }
    tunnel_cancel.cancel();
    result
}

#[allow(clippy::too_many_arguments)]
async fn event_loop(
    config: &Arc<Config>,
    state_tx: &watch::Sender<RoleState>,
    listeners_tx: &watch::Sender<Vec<SocketAddr>>,
    sender: &TunnelSender,
    receiver: &mut TunnelReceiver,
    mux: &Arc<Multiplexer>,
    listeners: &mut Option<listener::ListenerSet>,
    cancel: &CancellationToken,
) -> Result<TunnelExit, CommonError> {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return Ok(TunnelExit::Shutdown),
            message = receiver.recv() => message?,
        };
        let Some(message) = message else {
            return Err(CommonError::TunnelClosed);
        };
        match message {
            Message::PartnerJoined => {
                if listeners.is_none() {
                    info!("Partner joined, opening local listeners");
                    let set = listener::open_all(config, mux, sender).await?;
                    let _ = listeners_tx.send(set.local_addrs().to_vec());
                    *listeners = Some(set);
                }
                let _ = state_tx.send(RoleState::Active);
            }
            Message::PartnerLeft => {
                info!("Partner left, closing local listeners and flows");
                if let Some(set) = listeners.take() {
                    set.close();
                }
                let _ = listeners_tx.send(Vec::new());
                mux.shutdown_all();
                let _ = state_tx.send(RoleState::WaitingForPartner);
            }
            Message::ConnectionOpened { id } => mux.connection_opened(id),
            Message::Data { id, payload } => mux.deliver(id, payload),
            Message::WindowUpdate { id, credit } => mux.window_update(id, credit),
            Message::CloseConnection { id, reason } => mux.remote_close(id, reason),
            Message::GoAway { code } => {
                return match code {
                    CloseReason::GatewayClose => {
                        info!("Evicted: a newer proxy-server took over the session");
                        Ok(TunnelExit::Evicted)
                    }
                    code => {
                        debug!("Gateway said goodbye ({code})");
                        Err(CommonError::TunnelClosed)
                    }
                };
            }
            other => {
                debug!("Ignoring unexpected {} on the server tunnel", other.kind());
            }
        }
    }
}

/// Orderly farewell: `GoAway`, drain the send queue, half-close, then give
/// the gateway a moment to finish its side.
async fn graceful_goodbye(sender: &TunnelSender, receiver: &mut TunnelReceiver) {
    let _ = sender
        .send(Message::GoAway {
            code: CloseReason::Ok,
        })
        .await;
    sender.close(CloseMode::Graceful).await;
    let drain = async {
        while let Ok(Some(_)) = receiver.recv().await {}
    };
    let _ = tokio::time::timeout(DRAIN_DEADLINE, drain).await;
}
