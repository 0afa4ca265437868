mod error;
mod message;
mod target;

pub use error::*;
pub use message::*;
pub use target::*;

/// Hard cap on a single wire frame, declared length included.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;
/// Per-direction flow-control window granted to a freshly opened flow.
pub const INITIAL_WINDOW: u32 = 384 * 1024;
/// Largest single `Data` chunk a flow may put on the tunnel.
pub const MAX_CHUNK: usize = 16 * 1024;

/// Session identifier assigned by gateway configuration.
pub type SessionId = i32;
/// Identifier of one proxied flow, allocated by the originating proxy-server.
pub type FlowId = u64;
