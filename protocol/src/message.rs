use crate::error::Error;
use crate::target::TargetAddr;
use crate::{FlowId, SessionId};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt::{Display, Formatter};

const OP_AUTHENTICATE: u8 = 0x01;
const OP_AUTH_OK: u8 = 0x02;
const OP_AUTH_FAILED: u8 = 0x03;
const OP_PARTNER_JOINED: u8 = 0x04;
const OP_PARTNER_LEFT: u8 = 0x05;
const OP_OPEN_SESSION: u8 = 0x06;
const OP_OPEN_CONNECTION: u8 = 0x10;
const OP_CONNECTION_OPENED: u8 = 0x11;
const OP_CLOSE_CONNECTION: u8 = 0x12;
const OP_DATA: u8 = 0x13;
const OP_WINDOW_UPDATE: u8 = 0x14;
const OP_GO_AWAY: u8 = 0x1F;

/// Which side of a session a peer authenticates as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn as_u8(self) -> u8 {
        match self {
            Role::Client => 0,
            Role::Server => 1,
        }
    }

    pub fn from_u8(tag: u8) -> Result<Self, Error> {
        match tag {
            0 => Ok(Role::Client),
            1 => Ok(Role::Server),
            other => Err(Error::InvalidRole(other)),
        }
    }

    /// The opposite slot of the same session.
    pub fn partner(self) -> Self {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}

/// Why a flow or tunnel is going down. Stable one-byte wire values;
/// unassigned values survive a decode/encode round trip via `Other`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Ok,
    Abort,
    Unreachable,
    Forbidden,
    Overflow,
    GatewayClose,
    Other(u8),
}

impl CloseReason {
    pub fn as_u8(self) -> u8 {
        match self {
            CloseReason::Ok => 0,
            CloseReason::Abort => 1,
            CloseReason::Unreachable => 2,
            CloseReason::Forbidden => 3,
            CloseReason::Overflow => 4,
            CloseReason::GatewayClose => 5,
            CloseReason::Other(value) => value,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => CloseReason::Ok,
            1 => CloseReason::Abort,
            2 => CloseReason::Unreachable,
            3 => CloseReason::Forbidden,
            4 => CloseReason::Overflow,
            5 => CloseReason::GatewayClose,
            other => CloseReason::Other(other),
        }
    }
}

impl Display for CloseReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Ok => write!(f, "ok"),
            CloseReason::Abort => write!(f, "abort"),
            CloseReason::Unreachable => write!(f, "unreachable"),
            CloseReason::Forbidden => write!(f, "forbidden"),
            CloseReason::Overflow => write!(f, "overflow"),
            CloseReason::GatewayClose => write!(f, "gateway-close"),
            CloseReason::Other(value) => write!(f, "other({value})"),
        }
    }
}

/// One typed tunnel message. The first payload byte of every non-ping
/// frame is the opcode; all integers are big-endian and variable-length
/// fields carry a `u32` byte-count prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Authenticate {
        session_id: SessionId,
        role: Role,
        password: Vec<u8>,
    },
    AuthOk,
    AuthFailed,
    PartnerJoined,
    PartnerLeft,
    OpenSession {
        targets: Vec<TargetAddr>,
    },
    OpenConnection {
        id: FlowId,
        host: String,
        port: u16,
    },
    ConnectionOpened {
        id: FlowId,
    },
    CloseConnection {
        id: FlowId,
        reason: CloseReason,
    },
    Data {
        id: FlowId,
        payload: Bytes,
    },
    WindowUpdate {
        id: FlowId,
        credit: u32,
    },
    GoAway {
        code: CloseReason,
    },
    /// An opcode this build does not know. Carries the whole frame payload
    /// (opcode byte included) so it re-encodes byte for byte: proxy state
    /// machines ignore it, the gateway forwards it untouched.
    Unknown {
        opcode: u8,
        frame: Bytes,
    },
}

impl Message {
    /// Serialize into a frame payload ready for the length-prefixed framing
    /// layer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        match self {
            Message::Authenticate {
                session_id,
                role,
                password,
            } => {
                buf.put_u8(OP_AUTHENTICATE);
                buf.put_i32(*session_id);
                buf.put_u8(role.as_u8());
                buf.put_u32(password.len() as u32);
                buf.put_slice(password);
            }
            Message::AuthOk => buf.put_u8(OP_AUTH_OK),
            Message::AuthFailed => buf.put_u8(OP_AUTH_FAILED),
            Message::PartnerJoined => buf.put_u8(OP_PARTNER_JOINED),
            Message::PartnerLeft => buf.put_u8(OP_PARTNER_LEFT),
            Message::OpenSession { targets } => {
                buf.put_u8(OP_OPEN_SESSION);
                for target in targets {
                    buf.put_u32(target.host.len() as u32);
                    buf.put_slice(target.host.as_bytes());
                    buf.put_u16(target.port);
                }
            }
            Message::OpenConnection { id, host, port } => {
                buf.put_u8(OP_OPEN_CONNECTION);
                buf.put_u64(*id);
                buf.put_u32(host.len() as u32);
                buf.put_slice(host.as_bytes());
                buf.put_u16(*port);
            }
            Message::ConnectionOpened { id } => {
                buf.put_u8(OP_CONNECTION_OPENED);
                buf.put_u64(*id);
            }
            Message::CloseConnection { id, reason } => {
                buf.put_u8(OP_CLOSE_CONNECTION);
                buf.put_u64(*id);
                buf.put_u8(reason.as_u8());
            }
            Message::Data { id, payload } => {
                buf.put_u8(OP_DATA);
                buf.put_u64(*id);
                buf.put_slice(payload);
            }
            Message::WindowUpdate { id, credit } => {
                buf.put_u8(OP_WINDOW_UPDATE);
                buf.put_u64(*id);
                buf.put_u32(*credit);
            }
            Message::GoAway { code } => {
                buf.put_u8(OP_GO_AWAY);
                buf.put_u8(code.as_u8());
            }
            Message::Unknown { frame, .. } => buf.put_slice(frame),
        }
        buf.freeze()
    }

    fn encoded_len(&self) -> usize {
        1 + match self {
            Message::Authenticate { password, .. } => 4 + 1 + 4 + password.len(),
            Message::OpenSession { targets } => targets
                .iter()
                .map(|target| 4 + target.host.len() + 2)
                .sum(),
            Message::OpenConnection { host, .. } => 8 + 4 + host.len() + 2,
            Message::ConnectionOpened { .. } => 8,
            Message::CloseConnection { .. } => 8 + 1,
            Message::Data { payload, .. } => 8 + payload.len(),
            Message::WindowUpdate { .. } => 8 + 4,
            Message::GoAway { .. } => 1,
            Message::Unknown { frame, .. } => frame.len().saturating_sub(1),
            _ => 0,
        }
    }

    /// Parse one frame payload. Unassigned opcodes come back as
    /// [`Message::Unknown`]; structural damage inside a known opcode is an
    /// error and must tear the connection down.
    pub fn decode(frame: &[u8]) -> Result<Message, Error> {
        let mut reader = Reader::new(frame);
        let opcode = reader.u8().map_err(|_| Error::EmptyFrame)?;
        let message = match opcode {
            OP_AUTHENTICATE => {
                let session_id = reader.i32()?;
                let role = Role::from_u8(reader.u8()?)?;
                let password = reader.prefixed()?.to_vec();
                Message::Authenticate {
                    session_id,
                    role,
                    password,
                }
            }
            OP_AUTH_OK => Message::AuthOk,
            OP_AUTH_FAILED => Message::AuthFailed,
            OP_PARTNER_JOINED => Message::PartnerJoined,
            OP_PARTNER_LEFT => Message::PartnerLeft,
            OP_OPEN_SESSION => {
                let mut targets = Vec::new();
                while reader.remaining() > 0 {
                    let host = String::from_utf8(reader.prefixed()?.to_vec())?;
                    let port = reader.u16()?;
                    targets.push(TargetAddr { host, port });
                }
                Message::OpenSession { targets }
            }
            OP_OPEN_CONNECTION => {
                let id = reader.u64()?;
                let host = String::from_utf8(reader.prefixed()?.to_vec())?;
                let port = reader.u16()?;
                Message::OpenConnection { id, host, port }
            }
            OP_CONNECTION_OPENED => Message::ConnectionOpened { id: reader.u64()? },
            OP_CLOSE_CONNECTION => {
                let id = reader.u64()?;
                let reason = CloseReason::from_u8(reader.u8()?);
                Message::CloseConnection { id, reason }
            }
            OP_DATA => {
                let id = reader.u64()?;
                let payload = Bytes::copy_from_slice(reader.rest());
                Message::Data { id, payload }
            }
            OP_WINDOW_UPDATE => {
                let id = reader.u64()?;
                let credit = reader.u32()?;
                Message::WindowUpdate { id, credit }
            }
            OP_GO_AWAY => Message::GoAway {
                code: CloseReason::from_u8(reader.u8()?),
            },
            other => Message::Unknown {
                opcode: other,
                frame: Bytes::copy_from_slice(frame),
            },
        };
        Ok(message)
    }

    /// Short tag for log lines, without dragging payload bytes along.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Authenticate { .. } => "Authenticate",
            Message::AuthOk => "AuthOk",
            Message::AuthFailed => "AuthFailed",
            Message::PartnerJoined => "PartnerJoined",
            Message::PartnerLeft => "PartnerLeft",
            Message::OpenSession { .. } => "OpenSession",
            Message::OpenConnection { .. } => "OpenConnection",
            Message::ConnectionOpened { .. } => "ConnectionOpened",
            Message::CloseConnection { .. } => "CloseConnection",
            Message::Data { .. } => "Data",
            Message::WindowUpdate { .. } => "WindowUpdate",
            Message::GoAway { .. } => "GoAway",
            Message::Unknown { .. } => "Unknown",
        }
    }
}

/// Bounds-checked cursor over one frame payload.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.buf.len() < n {
            return Err(Error::Truncated);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }

    fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, Error> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32, Error> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn i32(&mut self) -> Result<i32, Error> {
        Ok(self.u32()? as i32)
    }

    fn u64(&mut self) -> Result<u64, Error> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(raw))
    }

    /// A `u32`-length-prefixed byte run. The declared length must fit
    /// inside what is left of the frame.
    fn prefixed(&mut self) -> Result<&'a [u8], Error> {
        let len = self.u32()? as usize;
        if len > self.buf.len() {
            return Err(Error::LengthOverrun);
        }
        self.take(len)
    }
}
