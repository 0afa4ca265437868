use crate::connection::{CloseMode, TunnelConnection, TunnelReceiver, TunnelSender, TunnelSettings};
use crate::error::Error;
use crate::tls::{MaybeTlsStream, TlsClientSettings, connect_tls};
use crate::{AUTH_TIMEOUT, DIAL_TIMEOUT};
use protocol::{Message, Role, SessionId};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Where and how a proxy role reaches its gateway.
#[derive(Debug, Clone)]
pub struct GatewayEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub tls: TlsClientSettings,
}

impl GatewayEndpoint {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Dial the gateway and wrap the stream if TLS is on.
pub async fn connect_stream(endpoint: &GatewayEndpoint) -> Result<MaybeTlsStream, Error> {
    let gateway = endpoint.address();
    debug!("Connecting to gateway [{gateway}]");
    let tcp = tokio::time::timeout(
        DIAL_TIMEOUT,
        TcpStream::connect((endpoint.host.as_str(), endpoint.port)),
    )
    .await
    .map_err(|_| Error::ConnectTimeout(gateway, DIAL_TIMEOUT))??;

    if endpoint.use_tls {
        connect_tls(tcp, &endpoint.host, &endpoint.tls).await
    } else {
        Ok(MaybeTlsStream::Plain(tcp))
    }
}

/// Run the authentication exchange over an established gateway stream.
/// Returns the tunnel once `AuthOk` came back.
pub async fn authenticate(
    stream: MaybeTlsStream,
    gateway: String,
    session_id: SessionId,
    role: Role,
    password: &[u8],
    settings: TunnelSettings,
    cancel: CancellationToken,
) -> Result<(TunnelSender, TunnelReceiver), Error> {
    let (sender, mut receiver) = TunnelConnection::start(stream, settings, gateway.clone(), cancel);
    sender
        .send(Message::Authenticate {
            session_id,
            role,
            password: password.to_vec(),
        })
        .await?;

    let reply = match tokio::time::timeout(AUTH_TIMEOUT, receiver.recv()).await {
        Ok(received) => received,
        Err(_) => Err(Error::ConnectTimeout(gateway.clone(), AUTH_TIMEOUT)),
    };
    let outcome = match reply {
        Ok(Some(Message::AuthOk)) => {
            info!("Authenticated to gateway [{gateway}] for session [{session_id}] as {role}");
            return Ok((sender, receiver));
        }
        Ok(Some(Message::AuthFailed)) => Err(Error::AuthFailed),
        Ok(Some(other)) => Err(Error::UnexpectedMessage {
            phase: "authentication",
            kind: other.kind(),
        }),
        Ok(None) => Err(Error::TunnelClosed),
        Err(e) => Err(e),
    };
    // A connection that did not authenticate is useless; do not leave its
    // tasks lingering until the idle timeout.
    sender.close(CloseMode::Abortive).await;
    outcome
}
