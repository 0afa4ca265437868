use std::time::Duration;
use thiserror::Error;
use tracing::metadata::ParseLevelError;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Protocol(#[from] protocol::Error),
    #[error("Inbound frame of {0} bytes exceeds the frame size limit")]
    FrameOversize(usize),
    #[error("Outbound frame of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(usize),
    #[error("No inbound frame within {0:?}")]
    IdleTimeout(Duration),
    #[error("Gateway rejected authentication")]
    AuthFailed,
    #[error("Tunnel closed")]
    TunnelClosed,
    #[error("Connect to [{0}] timed out after {1:?}")]
    ConnectTimeout(String, Duration),
    #[error("Unexpected message during {phase}: {kind}")]
    UnexpectedMessage {
        phase: &'static str,
        kind: &'static str,
    },
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Tls(#[from] tokio_rustls::rustls::Error),
    #[error(transparent)]
    ParseLevel(#[from] ParseLevelError),
}

impl Error {
    /// Terminal errors stop the supervisor instead of triggering the
    /// reconnect loop.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::AuthFailed | Error::Config(_))
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Io(e) => e,
            other => std::io::Error::other(format!("{other:?}")),
        }
    }
}
