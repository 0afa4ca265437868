use crate::config::SessionConfig;
use bytes::Bytes;
use common::{CloseMode, DRAIN_DEADLINE, TunnelSender};
use constant_time_eq::constant_time_eq;
use dashmap::DashMap;
use protocol::{CloseReason, Message, Role, SessionId};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Frames headed for an empty slot are held up to this many bytes before
/// the sending peer is cut off.
pub const PEER_BUFFER: usize = 1024 * 1024;

/// Result of pushing one frame toward the partner slot.
#[derive(Debug, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// Frame handed to the partner connection.
    Sent,
    /// Partner absent; frame parked in the peer buffer.
    Queued,
}

#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("Peer buffer overflow toward the {0} slot")]
    Overflow(Role),
    /// The caller no longer occupies its slot; a newer connection took it.
    #[error("Slot taken over by a newer connection")]
    Stale,
    #[error("Unknown session [{0}]")]
    UnknownSession(SessionId),
}

/// What `join` tells the fresh occupant about the session.
pub struct Joined {
    pub epoch: u64,
    pub partner_present: bool,
}

struct PeerSlot {
    epoch: u64,
    sender: TunnelSender,
}

#[derive(Default)]
struct PendingQueue {
    frames: VecDeque<Bytes>,
    bytes: usize,
}

impl PendingQueue {
    fn push(&mut self, frame: Bytes) -> bool {
        if self.bytes + frame.len() > PEER_BUFFER {
            return false;
        }
        self.bytes += frame.len();
        self.frames.push_back(frame);
        true
    }

    fn drain(&mut self) -> Vec<Bytes> {
        self.bytes = 0;
        self.frames.drain(..).collect()
    }

    fn clear(&mut self) {
        self.bytes = 0;
        self.frames.clear();
    }
}

#[derive(Default)]
struct Slots {
    client: Option<PeerSlot>,
    server: Option<PeerSlot>,
    /// Frames from the server parked while the client slot is empty, and
    /// vice versa.
    pending_to_client: PendingQueue,
    pending_to_server: PendingQueue,
}

impl Slots {
    fn slot(&mut self, role: Role) -> &mut Option<PeerSlot> {
        match role {
            Role::Client => &mut self.client,
            Role::Server => &mut self.server,
        }
    }

    fn pending_to(&mut self, role: Role) -> &mut PendingQueue {
        match role {
            Role::Client => &mut self.pending_to_client,
            Role::Server => &mut self.pending_to_server,
        }
    }
}

struct Session {
    client_password: Vec<u8>,
    server_password: Vec<u8>,
    slots: Mutex<Slots>,
}

impl Session {
    fn lock_slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// All statically provisioned sessions of one gateway. Pairs at most one
/// authenticated client with at most one authenticated server per session
/// and shuttles frames between them.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Session>,
    epochs: AtomicU64,
}

impl SessionRegistry {
    pub fn new(configs: &[SessionConfig]) -> Self {
        let sessions = DashMap::new();
        for config in configs {
            sessions.insert(
                config.id,
                Session {
                    client_password: config.client_password.as_bytes().to_vec(),
                    server_password: config.server_password.as_bytes().to_vec(),
                    slots: Mutex::new(Slots::default()),
                },
            );
        }
        Self {
            sessions,
            epochs: AtomicU64::new(1),
        }
    }

    /// Constant-time password check for one role of one session.
    pub fn authenticate(&self, session_id: SessionId, role: Role, password: &[u8]) -> bool {
        let Some(session) = self.sessions.get(&session_id) else {
            return false;
        };
        let expected = match role {
            Role::Client => &session.client_password,
            Role::Server => &session.server_password,
        };
        constant_time_eq(expected, password)
    }

    /// Put an authenticated peer into its slot, evicting any incumbent.
    /// Sends the join-time notifications: `PartnerJoined` to both ends
    /// when the pair is complete, parked frames to the newcomer, and the
    /// eviction goodbye to a displaced incumbent.
    pub async fn join(
        &self,
        session_id: SessionId,
        role: Role,
        sender: TunnelSender,
    ) -> Result<Joined, ForwardError> {
        let epoch = self.epochs.fetch_add(1, Ordering::Relaxed);
        let (evicted, partner, parked) = {
            let session = self
                .sessions
                .get(&session_id)
                .ok_or(ForwardError::UnknownSession(session_id))?;
            let mut slots = session.lock_slots();
            let evicted = slots.slot(role).replace(PeerSlot {
                epoch,
                sender: sender.clone(),
            });
            if evicted.is_some() {
                // Whatever the incumbent had in flight toward the partner
                // is dropped with it.
                slots.pending_to(role.partner()).clear();
            }
            let partner = slots
                .slot(role.partner())
                .as_ref()
                .map(|slot| slot.sender.clone());
            let parked = if partner.is_some() {
                slots.pending_to(role).drain()
            } else {
                Vec::new()
            };
            (evicted, partner, parked)
        };

        let was_evicted = evicted.is_some();
        if let Some(incumbent) = evicted {
            info!("Session [{session_id}] {role} slot taken over, evicting the incumbent");
            evict(incumbent.sender).await;
        }

        let partner_present = partner.is_some();
        if let Some(partner_sender) = partner {
            if was_evicted {
                // The partner's flow state referred to the old occupant.
                // A leave/join pair makes it reset before pairing with the
                // new peer.
                let _ = partner_sender.send(Message::PartnerLeft).await;
            }
            let _ = partner_sender.send(Message::PartnerJoined).await;
            let _ = sender.send(Message::PartnerJoined).await;
            for frame in parked {
                let _ = sender.send_frame(frame).await;
            }
        }
        debug!("Session [{session_id}] {role} joined (partner present: {partner_present})");
        Ok(Joined {
            epoch,
            partner_present,
        })
    }

    /// Move one frame toward the partner slot, or park it.
    pub async fn forward(
        &self,
        session_id: SessionId,
        role: Role,
        epoch: u64,
        frame: Bytes,
    ) -> Result<ForwardOutcome, ForwardError> {
        let partner = {
            let session = self
                .sessions
                .get(&session_id)
                .ok_or(ForwardError::UnknownSession(session_id))?;
            let mut slots = session.lock_slots();
            let still_occupant = slots
                .slot(role)
                .as_ref()
                .is_some_and(|slot| slot.epoch == epoch);
            if !still_occupant {
                return Err(ForwardError::Stale);
            }
            match slots.slot(role.partner()).as_ref() {
                Some(slot) => Some(slot.sender.clone()),
                None => {
                    if !slots.pending_to(role.partner()).push(frame) {
                        return Err(ForwardError::Overflow(role.partner()));
                    }
                    return Ok(ForwardOutcome::Queued);
                }
            }
        };
        match partner {
            Some(sender) => {
                // A dead partner connection is its own task's problem;
                // dropping the frame here mirrors what its socket would do.
                let _ = sender.send_frame(frame).await;
                Ok(ForwardOutcome::Sent)
            }
            None => Ok(ForwardOutcome::Queued),
        }
    }

    /// Release a slot on disconnect. A stale epoch means the slot was
    /// already taken over and there is nothing left to do.
    pub async fn leave(&self, session_id: SessionId, role: Role, epoch: u64) {
        let partner = {
            let Some(session) = self.sessions.get(&session_id) else {
                return;
            };
            let mut slots = session.lock_slots();
            let still_occupant = slots
                .slot(role)
                .as_ref()
                .is_some_and(|slot| slot.epoch == epoch);
            if !still_occupant {
                return;
            }
            *slots.slot(role) = None;
            // Frames this peer parked for an absent partner die with it.
            slots.pending_to(role.partner()).clear();
            slots
                .slot(role.partner())
                .as_ref()
                .map(|slot| slot.sender.clone())
        };
        debug!("Session [{session_id}] {role} left");
        if let Some(partner_sender) = partner {
            let _ = partner_sender.send(Message::PartnerLeft).await;
        }
    }
}

/// Say goodbye to an evicted connection: `GoAway`, then a graceful close.
/// A connection too far gone to drain within the deadline is cut off.
async fn evict(sender: TunnelSender) {
    let goodbye = async {
        let _ = sender
            .send(Message::GoAway {
                code: CloseReason::GatewayClose,
            })
            .await;
        sender.close(CloseMode::Graceful).await;
    };
    if tokio::time::timeout(DRAIN_DEADLINE, goodbye).await.is_err() {
        warn!("Evicted peer did not drain in time, closing abortively");
        sender.close(CloseMode::Abortive).await;
    }
}
