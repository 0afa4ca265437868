use crate::connection::TunnelSender;
use crate::mux::FlowConfig;
use bytes::Bytes;
use protocol::{CloseReason, FlowId, Message};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Remaining bytes this side may put on the tunnel for one flow.
/// Credited by peer `WindowUpdate`s, debited before every `Data` send.
pub(crate) struct SendWindow {
    available: Mutex<i32>,
    credited: Notify,
}

impl SendWindow {
    pub(crate) fn new(initial: u32) -> Self {
        Self {
            available: Mutex::new(initial as i32),
            credited: Notify::new(),
        }
    }

    pub(crate) fn credit(&self, amount: u32) {
        let mut available = self
            .available
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *available = available.saturating_add(amount as i32);
        drop(available);
        self.credited.notify_one();
    }

    /// Take up to `want` bytes of window, waiting until at least one byte
    /// is available. The window never goes negative.
    pub(crate) async fn reserve(&self, want: usize) -> usize {
        loop {
            {
                let mut available = self
                    .available
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                if *available > 0 {
                    let take = want.min(*available as usize);
                    *available -= take as i32;
                    return take;
                }
            }
            self.credited.notified().await;
        }
    }

    /// Hand back window reserved but not used (short socket read).
    pub(crate) fn release(&self, amount: usize) {
        if amount > 0 {
            self.credit(amount as u32);
        }
    }

    #[cfg(test)]
    pub(crate) fn available(&self) -> i32 {
        *self
            .available
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Inbound events routed from the tunnel to one flow's socket-writer.
pub(crate) enum FlowEvent {
    Data(Bytes),
    /// Peer sent `CloseConnection` for this flow. Ordered after all of its
    /// `Data`, so draining the queue first honours the half-close rules.
    RemoteClosed(CloseReason),
}

/// State shared between the two pump tasks of one flow.
pub(crate) struct FlowShared {
    pub(crate) id: FlowId,
    pub(crate) window: SendWindow,
    pub(crate) close_sent: AtomicBool,
    pub(crate) cancel: CancellationToken,
}

impl FlowShared {
    /// Send our `CloseConnection` for this flow, at most once.
    pub(crate) async fn send_close(&self, tunnel: &TunnelSender, reason: CloseReason) {
        if self.close_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = tunnel
            .send(Message::CloseConnection {
                id: self.id,
                reason,
            })
            .await;
    }
}

/// Run both pump tasks for an established flow until the flow is done in
/// both directions, then return. The caller removes the flow from the
/// multiplexer table afterwards.
pub(crate) async fn run_flow(
    socket: TcpStream,
    shared: Arc<FlowShared>,
    events: mpsc::UnboundedReceiver<FlowEvent>,
    opened_gate: Option<oneshot::Receiver<()>>,
    tunnel: TunnelSender,
    config: FlowConfig,
) {
    let (read_half, write_half) = socket.into_split();
    let reader = tokio::spawn(socket_reader(
        read_half,
        Arc::clone(&shared),
        opened_gate,
        tunnel.clone(),
        config,
    ));
    let writer = tokio::spawn(socket_writer(
        write_half,
        Arc::clone(&shared),
        events,
        tunnel,
        config,
    ));
    let _ = tokio::join!(reader, writer);
    trace!("Flow [{}] finished in both directions", shared.id);
}

/// Local socket -> tunnel. Reads at most `min(max_chunk, send_window)` at
/// a time and suspends while the window is exhausted.
async fn socket_reader(
    mut read_half: OwnedReadHalf,
    shared: Arc<FlowShared>,
    opened_gate: Option<oneshot::Receiver<()>>,
    tunnel: TunnelSender,
    config: FlowConfig,
) {
    if let Some(gate) = opened_gate {
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            opened = gate => {
                if opened.is_err() {
                    // Flow torn down before the peer confirmed it.
                    return;
                }
            }
        }
    }

    let mut buf = vec![0u8; config.max_chunk];
    loop {
        let reserved = tokio::select! {
            _ = shared.cancel.cancelled() => return,
            reserved = shared.window.reserve(config.max_chunk) => reserved,
        };
        let read = tokio::select! {
            _ = shared.cancel.cancelled() => {
                shared.window.release(reserved);
                return;
            }
            read = read_half.read(&mut buf[..reserved]) => read,
        };
        match read {
            Ok(0) => {
                shared.window.release(reserved);
                debug!("Flow [{}] local read side reached EOF", shared.id);
                shared.send_close(&tunnel, CloseReason::Ok).await;
                return;
            }
            Ok(n) => {
                shared.window.release(reserved - n);
                if shared.close_sent.load(Ordering::SeqCst) {
                    // Our CloseConnection already went out; nothing more
                    // may reference this id in that direction.
                    return;
                }
                let payload = Bytes::copy_from_slice(&buf[..n]);
                if tunnel
                    .send(Message::Data {
                        id: shared.id,
                        payload,
                    })
                    .await
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                shared.window.release(reserved);
                debug!("Flow [{}] local read failed: {e}", shared.id);
                shared.send_close(&tunnel, CloseReason::Abort).await;
                shared.cancel.cancel();
                return;
            }
        }
    }
}

/// Tunnel -> local socket. Applies `Data` in arrival order and credits the
/// peer once at least half the initial window has been consumed.
async fn socket_writer(
    mut write_half: OwnedWriteHalf,
    shared: Arc<FlowShared>,
    mut events: mpsc::UnboundedReceiver<FlowEvent>,
    tunnel: TunnelSender,
    config: FlowConfig,
) {
    let threshold = (config.initial_window / 2).max(1);
    let mut consumed: u32 = 0;
    loop {
        let event = tokio::select! {
            _ = shared.cancel.cancelled() => return,
            event = events.recv() => event,
        };
        match event {
            Some(FlowEvent::Data(payload)) => {
                let len = payload.len() as u32;
                if let Err(e) = write_half.write_all(&payload).await {
                    debug!("Flow [{}] local write failed: {e}", shared.id);
                    shared.send_close(&tunnel, CloseReason::Abort).await;
                    shared.cancel.cancel();
                    return;
                }
                consumed = consumed.saturating_add(len);
                if consumed >= threshold {
                    if tunnel
                        .send(Message::WindowUpdate {
                            id: shared.id,
                            credit: consumed,
                        })
                        .await
                        .is_err()
                    {
                        return;
                    }
                    consumed = 0;
                }
            }
            Some(FlowEvent::RemoteClosed(CloseReason::Ok)) => {
                // Peer's origin socket hit EOF: no more data will arrive.
                // Propagate the half-close and leave the other direction
                // running.
                let _ = write_half.shutdown().await;
                return;
            }
            Some(FlowEvent::RemoteClosed(reason)) => {
                debug!("Flow [{}] aborted by peer: {reason}", shared.id);
                shared.cancel.cancel();
                return;
            }
            None => return,
        }
    }
}
