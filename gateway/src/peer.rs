use crate::session::{ForwardError, SessionRegistry};
use common::{
    AUTH_TIMEOUT, CloseMode, Error as CommonError, MaybeTlsStream, TunnelConnection,
    TunnelReceiver, TunnelSender, TunnelSettings,
};
use protocol::{CloseReason, Message, Role, SessionId};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Drive one accepted gateway connection: authenticate it, park it in its
/// session slot, then forward frames until either side goes away.
pub async fn handle_peer(
    stream: MaybeTlsStream,
    peer_addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    settings: TunnelSettings,
    cancel: CancellationToken,
) -> Result<(), CommonError> {
    let conn_cancel = cancel.child_token();
    let (sender, mut receiver) = TunnelConnection::start(
        stream,
        settings,
        peer_addr.to_string(),
        conn_cancel.clone(),
    );

    let (session_id, role) = match authenticate(&registry, &sender, &mut receiver, peer_addr).await
    {
        Ok(identity) => identity,
        Err(e) => {
            // Graceful so a queued AuthFailed still reaches the peer.
            sender.close(CloseMode::Graceful).await;
            return Err(e);
        }
    };

    let joined = match registry.join(session_id, role, sender.clone()).await {
        Ok(joined) => joined,
        Err(e) => {
            warn!("Peer [{peer_addr}] could not join session [{session_id}]: {e}");
            sender.close(CloseMode::Abortive).await;
            return Ok(());
        }
    };
    info!("Peer [{peer_addr}] joined session [{session_id}] as {role}");

    let outcome = forward_loop(
        &registry,
        session_id,
        role,
        joined.epoch,
        &sender,
        &mut receiver,
        &conn_cancel,
    )
    .await;
    registry.leave(session_id, role, joined.epoch).await;
    debug!("Peer [{peer_addr}] connection finished: {outcome:?}");
    Ok(())
}

/// Why the forward loop stopped; purely for the logs.
#[derive(Debug)]
enum LoopEnd {
    PeerClosed,
    PeerGoAway,
    Evicted,
    Overflow,
    ProtocolError,
    Cancelled,
}

async fn authenticate(
    registry: &SessionRegistry,
    sender: &TunnelSender,
    receiver: &mut TunnelReceiver,
    peer_addr: SocketAddr,
) -> Result<(SessionId, Role), CommonError> {
    let first = tokio::time::timeout(AUTH_TIMEOUT, receiver.recv()).await;
    let (session_id, role, password) = match first {
        Ok(Ok(Some(Message::Authenticate {
            session_id,
            role,
            password,
        }))) => (session_id, role, password),
        Ok(Ok(Some(other))) => {
            warn!("Peer [{peer_addr}] sent {} before authenticating", other.kind());
            let _ = sender.send(Message::AuthFailed).await;
            return Err(CommonError::AuthFailed);
        }
        Ok(Ok(None)) => return Err(CommonError::TunnelClosed),
        Ok(Err(e)) => return Err(e),
        Err(_) => {
            debug!("Peer [{peer_addr}] did not authenticate within {AUTH_TIMEOUT:?}");
            let _ = sender.send(Message::AuthFailed).await;
            return Err(CommonError::AuthFailed);
        }
    };

    if !registry.authenticate(session_id, role, &password) {
        info!("Peer [{peer_addr}] failed authentication for session [{session_id}] as {role}");
        let _ = sender.send(Message::AuthFailed).await;
        return Err(CommonError::AuthFailed);
    }
    sender.send(Message::AuthOk).await?;
    Ok((session_id, role))
}

async fn forward_loop(
    registry: &SessionRegistry,
    session_id: SessionId,
    role: Role,
    epoch: u64,
    sender: &TunnelSender,
    receiver: &mut TunnelReceiver,
    cancel: &CancellationToken,
) -> LoopEnd {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return LoopEnd::Cancelled,
            message = receiver.recv() => message,
        };
        let message = match message {
            Ok(Some(message)) => message,
            Ok(None) => return LoopEnd::PeerClosed,
            Err(e) => {
                debug!("Session [{session_id}] {role} connection error: {e}");
                return LoopEnd::ProtocolError;
            }
        };
        match message {
            Message::Authenticate { .. } => {
                // One shot per connection; a second attempt is hostile.
                warn!("Session [{session_id}] {role} re-authenticated mid-session");
                sender.close(CloseMode::Abortive).await;
                return LoopEnd::ProtocolError;
            }
            Message::GoAway { code } => {
                debug!("Session [{session_id}] {role} said goodbye ({code})");
                return LoopEnd::PeerGoAway;
            }
            message => {
                // Everything else moves to the partner verbatim; the
                // gateway enforces no connection-id semantics.
                let frame = message.encode();
                match registry.forward(session_id, role, epoch, frame).await {
                    Ok(_) => {}
                    Err(ForwardError::Stale) => return LoopEnd::Evicted,
                    Err(ForwardError::Overflow(toward)) => {
                        warn!(
                            "Session [{session_id}] {role} overflowed the buffer toward {toward}"
                        );
                        let _ = sender
                            .send(Message::GoAway {
                                code: CloseReason::Overflow,
                            })
                            .await;
                        sender.close(CloseMode::Graceful).await;
                        return LoopEnd::Overflow;
                    }
                    Err(ForwardError::UnknownSession(_)) => return LoopEnd::ProtocolError,
                }
            }
        }
    }
}
