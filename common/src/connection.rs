use crate::codec::FrameCodec;
use crate::error::Error;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{MAX_FRAME_SIZE, Message};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Tuning knobs for one framed tunnel connection.
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    pub max_frame_size: usize,
    /// A keep-alive ping goes out after this much outbound silence.
    pub ping_interval: Duration,
    /// The connection dies when nothing arrives for this long.
    pub idle_timeout: Duration,
    /// When set, `send` returns as soon as the frame is queued; otherwise
    /// it waits until the writer has handed the frame to the stream.
    pub use_send_queue: bool,
    pub send_queue_depth: usize,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
            use_send_queue: true,
            send_queue_depth: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    /// Drain the send queue, shut the write side down, let the peer finish.
    Graceful,
    /// Drop the stream on the floor right away.
    Abortive,
}

enum WriterCommand {
    Frame {
        bytes: Bytes,
        flushed: Option<oneshot::Sender<()>>,
    },
    Close,
}

/// Sending half of a framed tunnel connection. Clonable; frames from
/// concurrent tasks are serialised by the queue and never interleave on
/// the wire.
#[derive(Clone)]
pub struct TunnelSender {
    commands: mpsc::Sender<WriterCommand>,
    use_send_queue: bool,
    cancel: CancellationToken,
}

impl TunnelSender {
    pub async fn send(&self, message: Message) -> Result<(), Error> {
        self.send_frame(message.encode()).await
    }

    /// Enqueue an already-encoded frame. Used by the gateway to forward
    /// peer frames without re-interpreting them.
    pub async fn send_frame(&self, bytes: Bytes) -> Result<(), Error> {
        if self.use_send_queue {
            self.commands
                .send(WriterCommand::Frame {
                    bytes,
                    flushed: None,
                })
                .await
                .map_err(|_| Error::TunnelClosed)
        } else {
            let (flushed_tx, flushed_rx) = oneshot::channel();
            self.commands
                .send(WriterCommand::Frame {
                    bytes,
                    flushed: Some(flushed_tx),
                })
                .await
                .map_err(|_| Error::TunnelClosed)?;
            flushed_rx.await.map_err(|_| Error::TunnelClosed)
        }
    }

    /// Ask the writer to close the connection. Graceful mode drains the
    /// queue first; abortive mode cancels both halves immediately.
    pub async fn close(&self, mode: CloseMode) {
        if mode == CloseMode::Abortive {
            self.cancel.cancel();
            return;
        }
        let _ = self.commands.send(WriterCommand::Close).await;
    }

    /// Token covering the lifetime of this connection; cancelled once
    /// either half shuts down.
    pub fn closed_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Receiving half of a framed tunnel connection.
pub struct TunnelReceiver {
    inbound: mpsc::Receiver<Result<Message, Error>>,
}

impl TunnelReceiver {
    /// Next decoded message. `Ok(None)` is a clean end of stream; errors
    /// carry the reason the connection is no longer usable.
    pub async fn recv(&mut self) -> Result<Option<Message>, Error> {
        match self.inbound.recv().await {
            None => Ok(None),
            Some(Ok(message)) => Ok(Some(message)),
            Some(Err(e)) => Err(e),
        }
    }
}

/// Framed connection over any bidirectional byte stream. Owns the stream;
/// the reader and writer tasks it spawns are the only code touching it.
pub struct TunnelConnection;

impl TunnelConnection {
    pub fn start<S>(
        stream: S,
        settings: TunnelSettings,
        peer: String,
        cancel: CancellationToken,
    ) -> (TunnelSender, TunnelReceiver)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let framed = Framed::new(stream, FrameCodec::new(settings.max_frame_size));
        let (sink, source) = framed.split();
        let (command_tx, command_rx) = mpsc::channel(settings.send_queue_depth.max(1));
        let (inbound_tx, inbound_rx) = mpsc::channel(32);

        tokio::spawn(run_writer(
            sink,
            command_rx,
            settings.ping_interval,
            peer.clone(),
            cancel.clone(),
        ));
        tokio::spawn(run_reader(
            source,
            inbound_tx,
            settings.idle_timeout,
            peer,
            cancel.clone(),
        ));

        (
            TunnelSender {
                commands: command_tx,
                use_send_queue: settings.use_send_queue,
                cancel,
            },
            TunnelReceiver {
                inbound: inbound_rx,
            },
        )
    }
}

async fn run_writer<S>(
    mut sink: SplitSink<Framed<S, FrameCodec>, Bytes>,
    mut commands: mpsc::Receiver<WriterCommand>,
    ping_interval: Duration,
    peer: String,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut last_write = Instant::now();
    loop {
        let ping_at = last_write + ping_interval;
        tokio::select! {
            _ = cancel.cancelled() => {
                // Abortive: the stream is dropped with whatever was queued.
                return;
            }
            command = commands.recv() => match command {
                Some(WriterCommand::Frame { bytes, flushed }) => {
                    if let Err(e) = sink.send(bytes).await {
                        warn!("Fail to write frame to [{peer}]: {e}");
                        cancel.cancel();
                        return;
                    }
                    last_write = Instant::now();
                    if let Some(flushed) = flushed {
                        let _ = flushed.send(());
                    }
                }
                Some(WriterCommand::Close) | None => {
                    // Send-side shutdown: flush what is queued in the sink
                    // and propagate EOF. Queued commands behind the close
                    // are dropped.
                    if let Err(e) = sink.close().await {
                        debug!("Fail to shut down write side of [{peer}]: {e}");
                    }
                    return;
                }
            },
            _ = tokio::time::sleep_until(ping_at) => {
                trace!("Send keep-alive ping to [{peer}]");
                if let Err(e) = sink.send(Bytes::new()).await {
                    warn!("Fail to send ping to [{peer}]: {e}");
                    cancel.cancel();
                    return;
                }
                last_write = Instant::now();
            }
        }
    }
}

async fn run_reader<S>(
    mut source: SplitStream<Framed<S, FrameCodec>>,
    inbound: mpsc::Sender<Result<Message, Error>>,
    idle_timeout: Duration,
    peer: String,
    cancel: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return,
            next = tokio::time::timeout(idle_timeout, source.next()) => next,
        };
        match frame {
            Err(_) => {
                debug!("Connection to [{peer}] idle for {idle_timeout:?}, closing");
                let _ = inbound.send(Err(Error::IdleTimeout(idle_timeout))).await;
                cancel.cancel();
                return;
            }
            Ok(None) => {
                debug!("Peer [{peer}] closed the connection");
                cancel.cancel();
                return;
            }
            Ok(Some(Err(e))) => {
                debug!("Fail to read frame from [{peer}]: {e}");
                let _ = inbound.send(Err(e)).await;
                cancel.cancel();
                return;
            }
            Ok(Some(Ok(frame))) => {
                if frame.is_empty() {
                    trace!("Keep-alive ping from [{peer}]");
                    continue;
                }
                match Message::decode(&frame) {
                    Ok(message) => {
                        if let Message::Unknown { opcode, .. } = &message {
                            // Surfaced as-is: proxy state machines drop it,
                            // the gateway forwards it verbatim.
                            debug!("Unknown opcode {opcode:#04x} from [{peer}]");
                        }
                        if inbound.send(Ok(message)).await.is_err() {
                            // Receiver dropped; nobody cares anymore.
                            return;
                        }
                    }
                    Err(e) => {
                        warn!("Malformed message from [{peer}]: {e}");
                        let _ = inbound.send(Err(Error::Protocol(e))).await;
                        cancel.cancel();
                        return;
                    }
                }
            }
        }
    }
}
