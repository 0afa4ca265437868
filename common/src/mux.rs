use crate::DIAL_TIMEOUT;
use crate::connection::TunnelSender;
use crate::error::Error;
use crate::flow::{FlowEvent, FlowShared, SendWindow, run_flow};
use bytes::Bytes;
use protocol::{CloseReason, FlowId, INITIAL_WINDOW, MAX_CHUNK, Message, TargetAddr};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Per-flow tuning, shared by every flow of one tunnel.
#[derive(Debug, Clone, Copy)]
pub struct FlowConfig {
    pub initial_window: u32,
    pub max_chunk: usize,
    pub dial_timeout: Duration,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            initial_window: INITIAL_WINDOW,
            max_chunk: MAX_CHUNK,
            dial_timeout: DIAL_TIMEOUT,
        }
    }
}

struct FlowEntry {
    events: mpsc::UnboundedSender<FlowEvent>,
    shared: Arc<FlowShared>,
    opened: Option<oneshot::Sender<()>>,
}

/// Interleaves every proxied flow of one tunnel. Owns the
/// `connection_id -> flow` table; flow pump tasks carry only their id, the
/// tunnel sender, and their shared window state. Nothing awaits while the
/// table lock is held.
pub struct Multiplexer {
    flows: Mutex<HashMap<FlowId, FlowEntry>>,
    next_id: AtomicU64,
    tunnel: TunnelSender,
    config: FlowConfig,
    cancel: CancellationToken,
}

impl Multiplexer {
    /// `cancel` scopes every flow of this tunnel; cancelling it aborts all
    /// of them without touching the tunnel connection itself.
    pub fn new(tunnel: TunnelSender, config: FlowConfig, cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            flows: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            tunnel,
            config,
            cancel,
        })
    }

    fn lock_flows(&self) -> MutexGuard<'_, HashMap<FlowId, FlowEntry>> {
        self.flows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Proxy-server side: a local listener accepted `socket`. Registers the
    /// flow in `opening` state, asks the peer to dial `target`, and starts
    /// pumping once `ConnectionOpened` comes back.
    pub async fn accept_flow(
        self: &Arc<Self>,
        socket: TcpStream,
        target: &TargetAddr,
    ) -> Result<FlowId, Error> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (opened_tx, opened_rx) = oneshot::channel();
        let (shared, events) = self.register(id, Some(opened_tx));
        let mux = Arc::clone(self);
        let tunnel = self.tunnel.clone();
        let config = self.config;
        tokio::spawn(async move {
            run_flow(socket, shared, events, Some(opened_rx), tunnel, config).await;
            mux.remove(id);
        });
        self.tunnel
            .send(Message::OpenConnection {
                id,
                host: target.host.clone(),
                port: target.port,
            })
            .await?;
        Ok(id)
    }

    /// Proxy-client side: the peer asked us to dial `host:port` for flow
    /// `id`. The dial runs in its own task so a slow target never stalls
    /// the tunnel event loop.
    pub fn open_flow(self: &Arc<Self>, id: FlowId, host: String, port: u16) {
        let (shared, events) = self.register(id, None);
        let mux = Arc::clone(self);
        let tunnel = self.tunnel.clone();
        tokio::spawn(async move {
            let target = format!("{host}:{port}");
            let dial = tokio::time::timeout(
                mux.config.dial_timeout,
                TcpStream::connect((host.as_str(), port)),
            );
            let socket = tokio::select! {
                _ = shared.cancel.cancelled() => {
                    mux.remove(id);
                    return;
                }
                dialed = dial => match dialed {
                    Ok(Ok(socket)) => socket,
                    Ok(Err(e)) => {
                        debug!("Flow [{id}] fail to dial [{target}]: {e}");
                        shared.send_close(&tunnel, CloseReason::Unreachable).await;
                        mux.remove(id);
                        return;
                    }
                    Err(_) => {
                        debug!("Flow [{id}] dial to [{target}] timed out");
                        shared.send_close(&tunnel, CloseReason::Unreachable).await;
                        mux.remove(id);
                        return;
                    }
                },
            };
            if tunnel.send(Message::ConnectionOpened { id }).await.is_err() {
                mux.remove(id);
                return;
            }
            debug!("Flow [{id}] opened to [{target}]");
            run_flow(socket, shared, events, None, tunnel, mux.config).await;
            mux.remove(id);
        });
    }

    /// Peer confirmed a flow we originated with `accept_flow`.
    pub fn connection_opened(&self, id: FlowId) {
        let opened = {
            let mut flows = self.lock_flows();
            flows.get_mut(&id).and_then(|entry| entry.opened.take())
        };
        match opened {
            Some(gate) => {
                let _ = gate.send(());
            }
            None => debug!("ConnectionOpened for unknown flow [{id}], dropped"),
        }
    }

    /// Route a `Data` chunk to its flow. Chunks for ids we no longer know
    /// are dropped; with `CloseConnection` ordered last per direction this
    /// only happens after an abortive close.
    pub fn deliver(&self, id: FlowId, payload: Bytes) {
        let events = {
            let flows = self.lock_flows();
            flows.get(&id).map(|entry| entry.events.clone())
        };
        match events {
            Some(events) => {
                let _ = events.send(FlowEvent::Data(payload));
            }
            None => debug!("Data for unknown flow [{id}], dropped"),
        }
    }

    /// Apply a peer window update to the flow's send window.
    pub fn window_update(&self, id: FlowId, credit: u32) {
        let shared = {
            let flows = self.lock_flows();
            flows.get(&id).map(|entry| Arc::clone(&entry.shared))
        };
        match shared {
            Some(shared) => shared.window.credit(credit),
            None => debug!("WindowUpdate for unknown flow [{id}], dropped"),
        }
    }

    /// Peer closed its direction of a flow. `Ok` is a half-close that
    /// drains queued data first; anything else aborts the flow now.
    pub fn remote_close(&self, id: FlowId, reason: CloseReason) {
        let entry = {
            let flows = self.lock_flows();
            flows
                .get(&id)
                .map(|entry| (entry.events.clone(), Arc::clone(&entry.shared)))
        };
        let Some((events, shared)) = entry else {
            debug!("CloseConnection for unknown flow [{id}], dropped");
            return;
        };
        let _ = events.send(FlowEvent::RemoteClosed(reason));
        if reason != CloseReason::Ok {
            shared.cancel.cancel();
        }
    }

    /// Tear every flow down abortively. Used when the partner leaves or
    /// the tunnel itself dies.
    pub fn shutdown_all(&self) {
        let drained: Vec<(FlowId, FlowEntry)> = {
            let mut flows = self.lock_flows();
            flows.drain().collect()
        };
        if !drained.is_empty() {
            debug!("Tearing down {} active flows", drained.len());
        }
        for (_, entry) in drained {
            entry.shared.cancel.cancel();
        }
    }

    pub fn active_flows(&self) -> usize {
        self.lock_flows().len()
    }

    fn register(
        &self,
        id: FlowId,
        opened: Option<oneshot::Sender<()>>,
    ) -> (Arc<FlowShared>, mpsc::UnboundedReceiver<FlowEvent>) {
        let shared = Arc::new(FlowShared {
            id,
            window: SendWindow::new(self.config.initial_window),
            close_sent: AtomicBool::new(false),
            cancel: self.cancel.child_token(),
        });
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let entry = FlowEntry {
            events: events_tx,
            shared: Arc::clone(&shared),
            opened,
        };
        if self.lock_flows().insert(id, entry).is_some() {
            warn!("Flow id [{id}] reused while still active");
        }
        (shared, events_rx)
    }

    fn remove(&self, id: FlowId) {
        if self.lock_flows().remove(&id).is_some() {
            debug!("Flow [{id}] removed");
        }
    }
}
