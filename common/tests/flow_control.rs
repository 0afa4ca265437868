//! Multiplexer and flow-pump behaviour over an in-memory tunnel: one side
//! is a real `Multiplexer` fed by a dispatch loop, the other a hand-driven
//! peer speaking the typed protocol.

use bytes::Bytes;
use common::{
    FlowConfig, Multiplexer, TunnelConnection, TunnelReceiver, TunnelSender, TunnelSettings,
};
use protocol::{CloseReason, FlowId, Message, TargetAddr};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

struct Rig {
    mux: Arc<Multiplexer>,
    peer_tx: TunnelSender,
    peer_rx: TunnelReceiver,
    _cancel: CancellationToken,
}

fn rig(flow_config: FlowConfig) -> Rig {
    let (near, far) = tokio::io::duplex(256 * 1024);
    let cancel = CancellationToken::new();
    let (mux_tx, mut mux_rx) = TunnelConnection::start(
        near,
        TunnelSettings::default(),
        "mux-side".to_string(),
        cancel.child_token(),
    );
    let (peer_tx, peer_rx) = TunnelConnection::start(
        far,
        TunnelSettings::default(),
        "peer-side".to_string(),
        cancel.child_token(),
    );
    let mux = Multiplexer::new(mux_tx, flow_config, cancel.child_token());

    // The same dispatch a role event loop performs.
    let dispatch_mux = Arc::clone(&mux);
    tokio::spawn(async move {
        loop {
            match mux_rx.recv().await {
                Ok(Some(Message::Data { id, payload })) => dispatch_mux.deliver(id, payload),
                Ok(Some(Message::WindowUpdate { id, credit })) => {
                    dispatch_mux.window_update(id, credit)
                }
                Ok(Some(Message::CloseConnection { id, reason })) => {
                    dispatch_mux.remote_close(id, reason)
                }
                Ok(Some(Message::ConnectionOpened { id })) => dispatch_mux.connection_opened(id),
                Ok(Some(Message::OpenConnection { id, host, port })) => {
                    dispatch_mux.open_flow(id, host, port)
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => return,
            }
        }
    });

    Rig {
        mux,
        peer_tx,
        peer_rx,
        _cancel: cancel,
    }
}

/// A local socket pair: the returned client end is driven by the test,
/// the accepted end is handed to the multiplexer.
async fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("local_addr failed");
    let client = TcpStream::connect(addr).await.expect("connect failed");
    let (accepted, _) = listener.accept().await.expect("accept failed");
    (client, accepted)
}

async fn recv_message(rx: &mut TunnelReceiver) -> Message {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("peer timed out")
        .expect("tunnel error")
        .expect("tunnel closed")
}

/// Collect `Data` payload bytes for `id` until `total` arrived.
async fn recv_data_total(rx: &mut TunnelReceiver, id: FlowId, total: usize) -> Vec<u8> {
    let mut collected = Vec::with_capacity(total);
    while collected.len() < total {
        match recv_message(rx).await {
            Message::Data {
                id: got_id,
                payload,
            } => {
                assert_eq!(got_id, id);
                collected.extend_from_slice(&payload);
            }
            other => panic!("expected Data, got {other:?}"),
        }
    }
    assert_eq!(collected.len(), total, "flow overran its window");
    collected
}

#[tokio::test]
async fn accepted_flow_waits_for_connection_opened() {
    let rig = rig(FlowConfig::default());
    let mut peer_rx = rig.peer_rx;
    let (mut client, accepted) = socket_pair().await;

    let target = TargetAddr::new("10.0.0.1", 4000);
    let id = rig
        .mux
        .accept_flow(accepted, &target)
        .await
        .expect("accept_flow failed");

    match recv_message(&mut peer_rx).await {
        Message::OpenConnection {
            id: got_id,
            host,
            port,
        } => {
            assert_eq!(got_id, id);
            assert_eq!(host, "10.0.0.1");
            assert_eq!(port, 4000);
        }
        other => panic!("expected OpenConnection, got {other:?}"),
    }

    // Data written before the peer confirms must stay local.
    client.write_all(b"early").await.expect("write failed");
    assert!(
        timeout(Duration::from_millis(200), peer_rx.recv())
            .await
            .is_err(),
        "data leaked before ConnectionOpened"
    );

    rig.peer_tx
        .send(Message::ConnectionOpened { id })
        .await
        .expect("send failed");
    let collected = recv_data_total(&mut peer_rx, id, 5).await;
    assert_eq!(collected, b"early");
}

#[tokio::test]
async fn window_starvation_and_refill() {
    let rig = rig(FlowConfig {
        initial_window: 1024,
        ..FlowConfig::default()
    });
    let mut peer_rx = rig.peer_rx;
    let (mut client, accepted) = socket_pair().await;

    let id = rig
        .mux
        .accept_flow(accepted, &TargetAddr::new("127.0.0.1", 9))
        .await
        .expect("accept_flow failed");
    let _ = recv_message(&mut peer_rx).await; // OpenConnection
    rig.peer_tx
        .send(Message::ConnectionOpened { id })
        .await
        .expect("send failed");

    let body = vec![0x5Au8; 10 * 1024];
    client.write_all(&body).await.expect("write failed");

    let mut received = 0usize;
    // Exactly one window's worth per credit grant, ten times over.
    for _ in 0..10 {
        let chunk = recv_data_total(&mut peer_rx, id, 1024).await;
        assert!(chunk.iter().all(|byte| *byte == 0x5A));
        received += chunk.len();
        // The window is exhausted: nothing may arrive until we credit it.
        assert!(
            timeout(Duration::from_millis(150), peer_rx.recv())
                .await
                .is_err(),
            "flow sent past its window"
        );
        rig.peer_tx
            .send(Message::WindowUpdate { id, credit: 1024 })
            .await
            .expect("send failed");
    }
    assert_eq!(received, body.len());
}

#[tokio::test]
async fn half_close_keeps_the_other_direction_alive() {
    let rig = rig(FlowConfig::default());
    let mut peer_rx = rig.peer_rx;
    let (mut client, accepted) = socket_pair().await;

    let id = rig
        .mux
        .accept_flow(accepted, &TargetAddr::new("127.0.0.1", 9))
        .await
        .expect("accept_flow failed");
    let _ = recv_message(&mut peer_rx).await;
    rig.peer_tx
        .send(Message::ConnectionOpened { id })
        .await
        .expect("send failed");

    // 100 bytes, then a local half-close.
    client.write_all(&[1u8; 100]).await.expect("write failed");
    client.shutdown().await.expect("shutdown failed");

    let collected = recv_data_total(&mut peer_rx, id, 100).await;
    assert_eq!(collected.len(), 100);
    match recv_message(&mut peer_rx).await {
        Message::CloseConnection {
            id: got_id,
            reason: CloseReason::Ok,
        } => assert_eq!(got_id, id),
        other => panic!("expected graceful CloseConnection, got {other:?}"),
    }

    // The peer-to-local direction still works after the half-close.
    rig.peer_tx
        .send(Message::Data {
            id,
            payload: Bytes::from_static(b"reply"),
        })
        .await
        .expect("send failed");
    let mut reply = [0u8; 5];
    client.read_exact(&mut reply).await.expect("read failed");
    assert_eq!(&reply, b"reply");

    // Peer finishes its direction: the local socket sees EOF and the flow
    // is reaped.
    rig.peer_tx
        .send(Message::CloseConnection {
            id,
            reason: CloseReason::Ok,
        })
        .await
        .expect("send failed");
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.expect("read failed");
    assert!(rest.is_empty());
    timeout(Duration::from_secs(2), async {
        while rig.mux.active_flows() != 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("flow not removed after both directions closed");
}

#[tokio::test]
async fn randomized_credits_never_let_the_sender_overrun() {
    let initial_window = 2048u32;
    let rig = rig(FlowConfig {
        initial_window,
        ..FlowConfig::default()
    });
    let mut peer_rx = rig.peer_rx;
    let (mut client, accepted) = socket_pair().await;

    let id = rig
        .mux
        .accept_flow(accepted, &TargetAddr::new("127.0.0.1", 9))
        .await
        .expect("accept_flow failed");
    let _ = recv_message(&mut peer_rx).await;
    rig.peer_tx
        .send(Message::ConnectionOpened { id })
        .await
        .expect("send failed");

    let total = 64 * 1024usize;
    tokio::spawn(async move {
        let body = vec![7u8; total];
        let _ = client.write_all(&body).await;
        let _ = client.shutdown().await;
    });

    let mut granted = initial_window as usize;
    let mut received = 0usize;
    loop {
        match recv_message(&mut peer_rx).await {
            Message::Data { payload, .. } => {
                received += payload.len();
                assert!(
                    received <= granted,
                    "received {received} with only {granted} granted"
                );
                // Credit back a random amount, sometimes nothing for a
                // while, so the sender keeps stalling and resuming.
                let credit = rand::rng().random_range(0..=2048u32);
                if credit > 0 {
                    granted += credit as usize;
                    rig.peer_tx
                        .send(Message::WindowUpdate { id, credit })
                        .await
                        .expect("send failed");
                }
            }
            Message::CloseConnection { .. } => break,
            other => panic!("unexpected message {other:?}"),
        }
    }
    assert_eq!(received, total);
}

#[tokio::test]
async fn flows_share_the_tunnel_fairly() {
    const FLOWS: usize = 3;
    const OBSERVED: usize = 1024 * 1024;

    let rig = rig(FlowConfig::default());
    let mut peer_rx = rig.peer_rx;

    let mut ids = Vec::new();
    let mut writers = Vec::new();
    for _ in 0..FLOWS {
        let (client, accepted) = socket_pair().await;
        let id = rig
            .mux
            .accept_flow(accepted, &TargetAddr::new("127.0.0.1", 9))
            .await
            .expect("accept_flow failed");
        let _ = recv_message(&mut peer_rx).await;
        ids.push(id);
        writers.push(client);
    }
    for &id in &ids {
        rig.peer_tx
            .send(Message::ConnectionOpened { id })
            .await
            .expect("send failed");
    }

    // Each flow offers an unbounded stream.
    let writer_cancel = CancellationToken::new();
    for mut client in writers {
        let cancel = writer_cancel.clone();
        tokio::spawn(async move {
            let chunk = vec![0u8; 8 * 1024];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    written = client.write_all(&chunk) => {
                        if written.is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }

    // Skip the start-up transient, then account a 1 MiB window of tunnel
    // output. Credits are returned immediately so no flow starves on its
    // window.
    let mut per_flow = std::collections::HashMap::new();
    let mut seen = 0usize;
    let warmup = 128 * 1024usize;
    while seen < warmup + OBSERVED {
        match recv_message(&mut peer_rx).await {
            Message::Data { id, payload } => {
                seen += payload.len();
                if seen > warmup {
                    *per_flow.entry(id).or_insert(0usize) += payload.len();
                }
                rig.peer_tx
                    .send(Message::WindowUpdate {
                        id,
                        credit: payload.len() as u32,
                    })
                    .await
                    .expect("send failed");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
    writer_cancel.cancel();

    let total: usize = per_flow.values().sum();
    for &id in &ids {
        let share = *per_flow.get(&id).unwrap_or(&0) as f64 / total as f64;
        let ideal = 1.0 / FLOWS as f64;
        assert!(
            (share - ideal).abs() <= 0.1,
            "flow {id} got share {share:.3}, expected {ideal:.3} +/- 0.1"
        );
    }
}

#[tokio::test]
async fn open_flow_dials_and_echoes() {
    let rig = rig(FlowConfig::default());
    let mut peer_rx = rig.peer_rx;

    // Local echo target.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let echo_addr = listener.local_addr().expect("local_addr failed");
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept failed");
        let (mut read, mut write) = socket.split();
        let _ = tokio::io::copy(&mut read, &mut write).await;
    });

    rig.peer_tx
        .send(Message::OpenConnection {
            id: 7,
            host: echo_addr.ip().to_string(),
            port: echo_addr.port(),
        })
        .await
        .expect("send failed");
    match recv_message(&mut peer_rx).await {
        Message::ConnectionOpened { id } => assert_eq!(id, 7),
        other => panic!("expected ConnectionOpened, got {other:?}"),
    }

    rig.peer_tx
        .send(Message::Data {
            id: 7,
            payload: Bytes::from_static(b"ping"),
        })
        .await
        .expect("send failed");
    let echoed = recv_data_total(&mut peer_rx, 7, 4).await;
    assert_eq!(echoed, b"ping");
}

#[tokio::test]
async fn open_flow_to_dead_target_reports_unreachable() {
    let rig = rig(FlowConfig::default());
    let mut peer_rx = rig.peer_rx;

    // Grab a port and close it again so the dial is refused.
    let dead_port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
        listener.local_addr().expect("local_addr failed").port()
    };

    rig.peer_tx
        .send(Message::OpenConnection {
            id: 9,
            host: "127.0.0.1".to_string(),
            port: dead_port,
        })
        .await
        .expect("send failed");
    match recv_message(&mut peer_rx).await {
        Message::CloseConnection {
            id,
            reason: CloseReason::Unreachable,
        } => assert_eq!(id, 9),
        other => panic!("expected unreachable CloseConnection, got {other:?}"),
    }
    assert_eq!(rig.mux.active_flows(), 0);
}

#[tokio::test]
async fn stray_flow_ids_are_ignored() {
    let rig = rig(FlowConfig::default());
    rig.peer_tx
        .send(Message::Data {
            id: 404,
            payload: Bytes::from_static(b"stray"),
        })
        .await
        .expect("send failed");
    rig.peer_tx
        .send(Message::WindowUpdate {
            id: 404,
            credit: 1024,
        })
        .await
        .expect("send failed");
    rig.peer_tx
        .send(Message::CloseConnection {
            id: 404,
            reason: CloseReason::Abort,
        })
        .await
        .expect("send failed");
    // The tunnel survives strays.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(rig.mux.active_flows(), 0);
}
