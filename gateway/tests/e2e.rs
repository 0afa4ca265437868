//! Whole-system scenarios: a real gateway, proxy-server, and proxy-client
//! wired over loopback TCP, everything bound to ephemeral ports.

use bytes::Bytes;
use common::{
    CommonConfig, RoleState, TunnelConnection, TunnelReceiver, TunnelSettings,
};
use gateway::config::{Config as GatewayConfig, ListenerConfig, SessionConfig, TlsListenerConfig};
use protocol::{Message, Role, TargetAddr};
use proxy_client::config::Config as ClientConfig;
use proxy_server::config::{Binding, Config as ServerConfig};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const SESSION: i32 = 1;
const CLIENT_PW: &str = "c";
const SERVER_PW: &str = "s";

fn gateway_config(listen: SocketAddr) -> GatewayConfig {
    GatewayConfig {
        common: CommonConfig::default(),
        listeners: vec![ListenerConfig {
            listen_address: listen,
            tls: None,
        }],
        sessions: vec![SessionConfig {
            id: SESSION,
            client_password: CLIENT_PW.to_string(),
            server_password: SERVER_PW.to_string(),
        }],
        max_peer_connections: 16,
    }
}

fn server_config(gateway: SocketAddr, bindings: Vec<Binding>) -> ServerConfig {
    ServerConfig {
        common: CommonConfig::default(),
        gateway_host: gateway.ip().to_string(),
        gateway_port: gateway.port(),
        use_tls: false,
        tls_ca_file: None,
        tls_server_name: None,
        session_id: SESSION,
        password: SERVER_PW.to_string(),
        bindings,
        reconnect_initial_delay_ms: 100,
        reconnect_max_delay_ms: 500,
    }
}

fn client_config(gateway: SocketAddr, allowlist: Option<Vec<TargetAddr>>) -> ClientConfig {
    ClientConfig {
        common: CommonConfig::default(),
        gateway_host: gateway.ip().to_string(),
        gateway_port: gateway.port(),
        use_tls: false,
        tls_ca_file: None,
        tls_server_name: None,
        session_id: SESSION,
        password: CLIENT_PW.to_string(),
        allowlist,
        reconnect_initial_delay_ms: 100,
        reconnect_max_delay_ms: 500,
    }
}

fn loopback_binding(target: SocketAddr) -> Binding {
    Binding {
        listen_ip: Some("127.0.0.1".parse().unwrap()),
        listen_port: 0,
        target_host: target.ip().to_string(),
        target_port: target.port(),
    }
}

/// Echo server accepting any number of connections.
async fn spawn_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut read, mut write) = socket.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });
    addr
}

async fn wait_for_state(rx: &mut watch::Receiver<RoleState>, want: RoleState) {
    timeout(Duration::from_secs(10), async {
        loop {
            if *rx.borrow_and_update() == want {
                return;
            }
            rx.changed().await.expect("state channel closed");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("state never reached {want}"));
}

async fn wait_for_listeners(rx: &mut watch::Receiver<Vec<SocketAddr>>) -> Vec<SocketAddr> {
    timeout(Duration::from_secs(10), async {
        loop {
            let current = rx.borrow_and_update().clone();
            if !current.is_empty() {
                return current;
            }
            rx.changed().await.expect("listener channel closed");
        }
    })
    .await
    .expect("listeners never opened")
}

/// Echo `payload` through the first exposed listener, retrying while the
/// listener set settles (it is rebound when the partner churns).
async fn echo_through(rx: &mut watch::Receiver<Vec<SocketAddr>>, payload: &[u8]) -> Vec<u8> {
    timeout(Duration::from_secs(10), async {
        loop {
            let addrs = {
                let current = rx.borrow_and_update().clone();
                if current.is_empty() {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
                current
            };
            if let Ok(mut socket) = TcpStream::connect(addrs[0]).await {
                if socket.write_all(payload).await.is_ok() {
                    let mut reply = vec![0u8; payload.len()];
                    if let Ok(Ok(_)) =
                        timeout(Duration::from_secs(1), socket.read_exact(&mut reply)).await
                    {
                        return reply;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("echo through the tunnel failed")
}

/// Next message on a hand-driven tunnel peer.
async fn recv_raw(rx: &mut TunnelReceiver) -> Message {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("peer timed out")
        .expect("tunnel error")
        .expect("tunnel closed")
}

struct Stack {
    cancel: CancellationToken,
    gateway_addr: SocketAddr,
}

async fn start_gateway(cancel: &CancellationToken) -> Stack {
    let handle = gateway::start(
        gateway_config("127.0.0.1:0".parse().unwrap()),
        cancel.child_token(),
    )
    .await
    .expect("gateway start failed");
    Stack {
        cancel: cancel.clone(),
        gateway_addr: handle.local_addrs()[0],
    }
}

#[tokio::test]
async fn s1_echo_round_trip() {
    let cancel = CancellationToken::new();
    let stack = start_gateway(&cancel).await;
    let echo = spawn_echo().await;

    let server = proxy_server::start(
        server_config(stack.gateway_addr, vec![loopback_binding(echo)]),
        cancel.child_token(),
    );
    let client = proxy_client::start(
        client_config(stack.gateway_addr, None),
        cancel.child_token(),
    );

    let mut server_state = server.state();
    let mut client_state = client.state();
    wait_for_state(&mut server_state, RoleState::Active).await;
    wait_for_state(&mut client_state, RoleState::Active).await;

    let mut listeners = server.listeners();
    let addrs = wait_for_listeners(&mut listeners).await;
    let mut socket = TcpStream::connect(addrs[0]).await.expect("connect failed");
    socket.write_all(b"hello").await.expect("write failed");
    let mut reply = [0u8; 5];
    timeout(Duration::from_secs(1), socket.read_exact(&mut reply))
        .await
        .expect("no echo within 1s")
        .expect("read failed");
    assert_eq!(&reply, b"hello");

    stack.cancel.cancel();
}

#[tokio::test]
async fn s2_forbidden_target_is_refused_and_the_tunnel_stays_healthy() {
    let cancel = CancellationToken::new();
    let stack = start_gateway(&cancel).await;
    let echo = spawn_echo().await;

    // Listener 0 forwards to a target outside the allowlist, listener 1 to
    // the allowed echo service.
    let forbidden_target: SocketAddr = "127.0.0.1:9".parse().unwrap();
    let server = proxy_server::start(
        server_config(
            stack.gateway_addr,
            vec![loopback_binding(forbidden_target), loopback_binding(echo)],
        ),
        cancel.child_token(),
    );
    let client = proxy_client::start(
        client_config(
            stack.gateway_addr,
            Some(vec![TargetAddr::new(echo.ip().to_string(), echo.port())]),
        ),
        cancel.child_token(),
    );

    let mut client_state = client.state();
    wait_for_state(&mut client_state, RoleState::Active).await;
    let mut listeners = server.listeners();
    let addrs = wait_for_listeners(&mut listeners).await;

    // The listener accepts, then the flow is refused: the local socket is
    // promptly reset or closed without ever carrying a reply.
    let mut refused = TcpStream::connect(addrs[0]).await.expect("connect failed");
    refused.write_all(b"doomed").await.expect("write failed");
    let mut sink = Vec::new();
    match timeout(Duration::from_secs(3), refused.read_to_end(&mut sink)).await {
        Ok(Ok(read)) => assert_eq!(read, 0),
        Ok(Err(_)) => {} // RST
        Err(_) => panic!("forbidden flow was not closed promptly"),
    }

    // The tunnel survived: the allowed listener still echoes.
    let mut allowed = TcpStream::connect(addrs[1]).await.expect("connect failed");
    allowed.write_all(b"ping").await.expect("write failed");
    let mut reply = [0u8; 4];
    timeout(Duration::from_secs(1), allowed.read_exact(&mut reply))
        .await
        .expect("tunnel unhealthy after refusal")
        .expect("read failed");
    assert_eq!(&reply, b"ping");

    stack.cancel.cancel();
}

#[tokio::test]
async fn s3_server_waits_in_reconnecting_until_the_gateway_appears() {
    let cancel = CancellationToken::new();
    let echo = spawn_echo().await;

    // Reserve a port for the gateway, then leave it closed for now.
    let parked = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gateway_addr = parked.local_addr().unwrap();
    drop(parked);

    let server = proxy_server::start(
        server_config(gateway_addr, vec![loopback_binding(echo)]),
        cancel.child_token(),
    );
    let mut server_state = server.state();
    wait_for_state(&mut server_state, RoleState::Reconnecting).await;
    assert!(
        server.listeners().borrow().is_empty(),
        "listeners must stay closed without a gateway"
    );

    // Gateway shows up late, then the partner joins.
    let handle = gateway::start(
        gateway_config(gateway_addr),
        cancel.child_token(),
    )
    .await
    .expect("gateway start failed");
    let _client = proxy_client::start(
        client_config(gateway_addr, None),
        cancel.child_token(),
    );

    wait_for_state(&mut server_state, RoleState::Active).await;
    let mut listeners = server.listeners();
    let addrs = timeout(Duration::from_secs(2), wait_for_listeners(&mut listeners))
        .await
        .expect("listeners not open within 2s of the partner joining");
    assert_eq!(addrs.len(), 1);

    handle.shutdown();
    cancel.cancel();
}

#[tokio::test]
async fn a_second_client_evicts_the_first() {
    let cancel = CancellationToken::new();
    let stack = start_gateway(&cancel).await;
    let echo = spawn_echo().await;

    let server = proxy_server::start(
        server_config(stack.gateway_addr, vec![loopback_binding(echo)]),
        cancel.child_token(),
    );
    let mut first = proxy_client::start(
        client_config(stack.gateway_addr, None),
        cancel.child_token(),
    );
    let mut first_state = first.state();
    wait_for_state(&mut first_state, RoleState::Active).await;

    let second = proxy_client::start(
        client_config(stack.gateway_addr, None),
        cancel.child_token(),
    );
    let mut second_state = second.state();

    // The incumbent observes the goodbye and stops for good; the newcomer
    // takes over.
    let evicted_state = timeout(Duration::from_secs(10), first.join())
        .await
        .expect("evicted client never stopped");
    assert_eq!(evicted_state, RoleState::Disconnected);
    wait_for_state(&mut second_state, RoleState::Active).await;

    // The session works end to end through the new client. The listener
    // set may still be rebinding after the partner churn.
    let mut listeners = server.listeners();
    let reply = echo_through(&mut listeners, b"again").await;
    assert_eq!(&reply, b"again");

    stack.cancel.cancel();
}

#[tokio::test]
async fn unknown_opcodes_are_forwarded_verbatim_between_slots() {
    let cancel = CancellationToken::new();
    let stack = start_gateway(&cancel).await;

    // Two hand-driven tunnel peers, no proxy machinery in the way.
    let server_stream = TcpStream::connect(stack.gateway_addr)
        .await
        .expect("connect failed");
    let (server_tx, mut server_rx) = TunnelConnection::start(
        server_stream,
        TunnelSettings::default(),
        "server-peer".to_string(),
        cancel.child_token(),
    );
    server_tx
        .send(Message::Authenticate {
            session_id: SESSION,
            role: Role::Server,
            password: SERVER_PW.as_bytes().to_vec(),
        })
        .await
        .expect("send failed");
    assert_eq!(recv_raw(&mut server_rx).await, Message::AuthOk);

    let client_stream = TcpStream::connect(stack.gateway_addr)
        .await
        .expect("connect failed");
    let (client_tx, mut client_rx) = TunnelConnection::start(
        client_stream,
        TunnelSettings::default(),
        "client-peer".to_string(),
        cancel.child_token(),
    );
    client_tx
        .send(Message::Authenticate {
            session_id: SESSION,
            role: Role::Client,
            password: CLIENT_PW.as_bytes().to_vec(),
        })
        .await
        .expect("send failed");
    assert_eq!(recv_raw(&mut client_rx).await, Message::AuthOk);
    assert_eq!(recv_raw(&mut client_rx).await, Message::PartnerJoined);
    assert_eq!(recv_raw(&mut server_rx).await, Message::PartnerJoined);

    // A frame with an opcode from the future crosses the gateway untouched,
    // payload bytes and all.
    let future_frame = Bytes::from_static(&[0xEE, 9, 8, 7, 6]);
    client_tx
        .send_frame(future_frame.clone())
        .await
        .expect("send failed");
    match recv_raw(&mut server_rx).await {
        Message::Unknown { opcode, frame } => {
            assert_eq!(opcode, 0xEE);
            assert_eq!(frame, future_frame);
        }
        other => panic!("expected the unknown frame, got {other:?}"),
    }

    stack.cancel.cancel();
}

#[tokio::test]
async fn wrong_password_is_terminal() {
    let cancel = CancellationToken::new();
    let stack = start_gateway(&cancel).await;

    let mut config = client_config(stack.gateway_addr, None);
    config.password = "not-the-password".to_string();
    let mut client = proxy_client::start(config, cancel.child_token());
    let final_state = timeout(Duration::from_secs(10), client.join())
        .await
        .expect("client never gave up");
    assert_eq!(final_state, RoleState::FailedAuth);

    stack.cancel.cancel();
}

#[tokio::test]
async fn server_shutdown_notifies_the_partner() {
    let cancel = CancellationToken::new();
    let stack = start_gateway(&cancel).await;
    let echo = spawn_echo().await;

    let server_cancel = cancel.child_token();
    let mut server = proxy_server::start(
        server_config(stack.gateway_addr, vec![loopback_binding(echo)]),
        server_cancel.clone(),
    );
    let client = proxy_client::start(
        client_config(stack.gateway_addr, None),
        cancel.child_token(),
    );
    let mut client_state = client.state();
    wait_for_state(&mut client_state, RoleState::Active).await;

    server_cancel.cancel();
    let final_state = timeout(Duration::from_secs(5), server.join())
        .await
        .expect("server never stopped");
    assert_eq!(final_state, RoleState::Disconnected);
    wait_for_state(&mut client_state, RoleState::WaitingForPartner).await;

    stack.cancel.cancel();
}

#[tokio::test]
async fn tls_tunnel_round_trip() {
    let cancel = CancellationToken::new();
    let echo = spawn_echo().await;

    // Self-signed certificate for localhost; the proxies trust exactly it.
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .expect("certificate generation failed");
    let dir = std::env::temp_dir().join(format!("revtun-tls-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).expect("tempdir failed");
    let cert_file = dir.join("gateway-cert.pem");
    let key_file = dir.join("gateway-key.pem");
    std::fs::write(&cert_file, certified.cert.pem()).expect("write cert failed");
    std::fs::write(&key_file, certified.key_pair.serialize_pem()).expect("write key failed");

    let mut gw_config = gateway_config("127.0.0.1:0".parse().unwrap());
    gw_config.listeners[0].tls = Some(TlsListenerConfig {
        cert_file: cert_file.clone(),
        key_file,
    });
    let handle = gateway::start(gw_config, cancel.child_token())
        .await
        .expect("gateway start failed");
    let gateway_addr = handle.local_addrs()[0];

    let mut server_cfg = server_config(gateway_addr, vec![loopback_binding(echo)]);
    server_cfg.use_tls = true;
    server_cfg.tls_ca_file = Some(cert_file.clone());
    server_cfg.tls_server_name = Some("localhost".to_string());
    let server = proxy_server::start(server_cfg, cancel.child_token());

    let mut client_cfg = client_config(gateway_addr, None);
    client_cfg.use_tls = true;
    client_cfg.tls_ca_file = Some(cert_file);
    client_cfg.tls_server_name = Some("localhost".to_string());
    let client = proxy_client::start(client_cfg, cancel.child_token());

    let mut client_state = client.state();
    wait_for_state(&mut client_state, RoleState::Active).await;
    let mut listeners = server.listeners();
    let addrs = wait_for_listeners(&mut listeners).await;

    let mut socket = TcpStream::connect(addrs[0]).await.expect("connect failed");
    socket.write_all(b"secret").await.expect("write failed");
    let mut reply = [0u8; 6];
    timeout(Duration::from_secs(2), socket.read_exact(&mut reply))
        .await
        .expect("no echo over TLS")
        .expect("read failed");
    assert_eq!(&reply, b"secret");

    cancel.cancel();
    let _ = std::fs::remove_dir_all(dir);
}
