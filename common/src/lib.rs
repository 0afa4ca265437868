pub mod backoff;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
mod flow;
pub mod handshake;
pub mod log;
pub mod mux;
pub mod runtime;
pub mod state;
pub mod tls;

pub use backoff::Backoff;
pub use codec::FrameCodec;
pub use config::CommonConfig;
pub use connection::{CloseMode, TunnelConnection, TunnelReceiver, TunnelSender, TunnelSettings};
pub use error::Error;
pub use handshake::GatewayEndpoint;
pub use log::init_log;
pub use mux::{FlowConfig, Multiplexer};
pub use runtime::build_runtime;
pub use state::RoleState;
pub use tls::MaybeTlsStream;

use std::time::Duration;

/// A just-accepted gateway peer must authenticate within this long.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(5);
/// How long a proxy-client gets to dial a requested target.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Inbound frames still pending after a graceful shutdown are drained for
/// at most this long before the stream is dropped.
pub const DRAIN_DEADLINE: Duration = Duration::from_secs(2);
