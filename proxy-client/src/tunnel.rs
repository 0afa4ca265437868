use crate::config::Config;
use common::{
    Backoff, CloseMode, DRAIN_DEADLINE, Error as CommonError, FlowConfig, Multiplexer, RoleState,
    TunnelReceiver, TunnelSender, handshake,
};
use protocol::{CloseReason, Message, Role};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

enum TunnelExit {
    Shutdown,
    Evicted,
}

/// Connect-authenticate-serve loop with reconnect backoff. Runs until a
/// terminal state is reached and returns it.
pub(crate) async fn supervise(
    config: Arc<Config>,
    state_tx: watch::Sender<RoleState>,
    cancel: CancellationToken,
) -> RoleState {
    let endpoint = config.gateway_endpoint();
    let allowlist = config.allowlist_set();
    let mut backoff = Backoff::new(
        Duration::from_millis(config.reconnect_initial_delay_ms),
        Duration::from_millis(config.reconnect_max_delay_ms),
    );
    loop {
        let attempt = run_tunnel(
            &config,
            &endpoint,
            allowlist.as_ref(),
            &state_tx,
            &mut backoff,
            &cancel,
        )
        .await;
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
    allowlist: Option<&HashSet<(String, u16)>>,
    state_tx: &watch::Sender<RoleState>,
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
        Role::Client,
        config.password.as_bytes(),
        config.common.tunnel_settings(),
        tunnel_cancel.clone(),
    )
    .await?;
    backoff.reset();
    let _ = state_tx.send(RoleState::WaitingForPartner);

    let mux = Multiplexer::new(
        sender.clone(),
        FlowConfig::default(),
        tunnel_cancel.child_token(),
    );

    let result = event_loop(allowlist, state_tx, &sender, &mut receiver, &mux, cancel).await;

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

async fn event_loop(
    allowlist: Option<&HashSet<(String, u16)>>,
    state_tx: &watch::Sender<RoleState>,
    sender: &TunnelSender,
    receiver: &mut TunnelReceiver,
    mux: &Arc<Multiplexer>,
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
                info!("Partner joined");
                let _ = state_tx.send(RoleState::Active);
            }
            Message::PartnerLeft => {
                info!("Partner left, closing all flows");
                mux.shutdown_all();
                let _ = state_tx.send(RoleState::WaitingForPartner);
            }
            Message::OpenSession { targets } => {
                // Informational: the partner announces what it intends to
                // have us dial. The allowlist stays authoritative.
                info!(
                    "Partner session opened with {} forward target(s)",
                    targets.len()
                );
            }
            Message::OpenConnection { id, host, port } => {
                if allowed(allowlist, &host, port) {
                    mux.open_flow(id, host, port);
                } else {
                    info!("Refusing forbidden target [{host}:{port}] for flow [{id}]");
                    sender
                        .send(Message::CloseConnection {
                            id,
                            reason: CloseReason::Forbidden,
                        })
                        .await?;
                }
            }
            Message::Data { id, payload } => mux.deliver(id, payload),
            Message::WindowUpdate { id, credit } => mux.window_update(id, credit),
            Message::CloseConnection { id, reason } => mux.remote_close(id, reason),
            Message::GoAway { code } => {
                return match code {
                    CloseReason::GatewayClose => {
                        info!("Evicted: a newer proxy-client took over the session");
                        Ok(TunnelExit::Evicted)
                    }
                    code => {
                        debug!("Gateway said goodbye ({code})");
                        Err(CommonError::TunnelClosed)
                    }
                };
            }
            other => {
                debug!("Ignoring unexpected {} on the client tunnel", other.kind());
            }
        }
    }
}

fn allowed(allowlist: Option<&HashSet<(String, u16)>>, host: &str, port: u16) -> bool {
    match allowlist {
        None => true,
        Some(set) => set.contains(&(host.to_string(), port)),
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
