use crate::error::Error;
use std::io::{BufReader, Error as StdIoError};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::pin;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
pub use tokio_rustls::TlsAcceptor;
use tokio_rustls::{TlsConnector, TlsStream};
use tracing::debug;

/// TLS knobs for the proxy side of a tunnel.
#[derive(Debug, Clone, Default)]
pub struct TlsClientSettings {
    /// Trust only this PEM bundle instead of the platform store. The usual
    /// setup for gateways running on self-signed certificates.
    pub ca_file: Option<PathBuf>,
    /// Certificate name to verify; defaults to the gateway host.
    pub server_name: Option<String>,
}

/// The outer tunnel stream: raw TCP, or TCP under rustls. The framed
/// connection layer is generic over `AsyncRead + AsyncWrite` and never
/// learns which one it got.
pub enum MaybeTlsStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for MaybeTlsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => {
                pin!(stream);
                stream.poll_read(cx, buf)
            }
            MaybeTlsStream::Tls(stream) => {
                pin!(stream);
                stream.poll_read(cx, buf)
            }
        }
    }
}

impl AsyncWrite for MaybeTlsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, StdIoError>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => {
                pin!(stream);
                stream.poll_write(cx, buf)
            }
            MaybeTlsStream::Tls(stream) => {
                pin!(stream);
                stream.poll_write(cx, buf)
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), StdIoError>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => {
                pin!(stream);
                stream.poll_flush(cx)
            }
            MaybeTlsStream::Tls(stream) => {
                pin!(stream);
                stream.poll_flush(cx)
            }
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), StdIoError>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(stream) => {
                pin!(stream);
                stream.poll_shutdown(cx)
            }
            MaybeTlsStream::Tls(stream) => {
                pin!(stream);
                stream.poll_shutdown(cx)
            }
        }
    }
}

/// Wrap an established TCP stream in a client-side TLS handshake.
pub async fn connect_tls(
    tcp: TcpStream,
    host: &str,
    settings: &TlsClientSettings,
) -> Result<MaybeTlsStream, Error> {
    let mut roots = RootCertStore::empty();
    match &settings.ca_file {
        Some(ca_file) => {
            let pem = fs::read(ca_file).await?;
            for cert in rustls_pemfile::certs(&mut BufReader::new(pem.as_slice())) {
                roots.add(cert?)?;
            }
        }
        None => {
            let loaded = rustls_native_certs::load_native_certs();
            for error in &loaded.errors {
                debug!("Skipping unreadable platform trust anchor: {error}");
            }
            for cert in loaded.certs {
                roots.add(cert)?;
            }
        }
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let name = settings.server_name.as_deref().unwrap_or(host);
    let server_name = ServerName::try_from(name.to_string())
        .map_err(|_| Error::Config(format!("invalid TLS server name: {name}")))?;
    let connector = TlsConnector::from(Arc::new(config));
    let stream = connector.connect(server_name, tcp).await?;
    Ok(MaybeTlsStream::Tls(Box::new(stream.into())))
}

/// Build the acceptor for a TLS-terminating gateway listener from PEM
/// cert chain and private key files.
pub async fn build_acceptor(cert_file: &Path, key_file: &Path) -> Result<TlsAcceptor, Error> {
    let cert_pem = fs::read(cert_file).await?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_slice()))
        .collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(Error::Config(format!(
            "no certificates found in {}",
            cert_file.display()
        )));
    }
    let key_pem = fs::read(key_file).await?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem.as_slice()))?
        .ok_or_else(|| Error::Config(format!("no private key found in {}", key_file.display())))?;
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Server-side handshake over a just-accepted TCP stream.
pub async fn accept_tls(acceptor: &TlsAcceptor, tcp: TcpStream) -> Result<MaybeTlsStream, Error> {
    let stream = acceptor.accept(tcp).await?;
    Ok(MaybeTlsStream::Tls(Box::new(stream.into())))
}
