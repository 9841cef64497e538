//! Session protocol over one open channel: handshake (name + full history), live messages,
//! read receipts and kill.
//!
//! Every frame handler is idempotent; duplicates across reconnects are expected.

use crate::identity::{Role, RoomId};
use crate::message_log::{MessageLog, MessageStore, StoreError};
use crate::protocol::{Frame, Message, MessageStatus};

/// Host-assigned handle for a transport channel.
pub type ChannelId = u64;

/// Which side dialed the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrigin {
    /// We dialed the peer.
    Outbound,
    /// The peer dialed us.
    Inbound,
}

/// What both ends know about a channel once its hello exchange is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    pub origin: ChannelOrigin,
    /// Role the dialer claimed in its hello.
    pub dialer: Role,
    /// Random value picked by the dialer and echoed by the acceptor.
    pub nonce: u64,
}

impl ChannelInfo {
    /// Preference between two channels to the same peer; lower wins. Channels dialed by the
    /// secondary come first, then the lower nonce. Built only from what both ends share.
    pub fn rank(&self) -> (bool, u64) {
        (self.dialer != Role::Secondary, self.nonce)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Channel reported open; handshake not sent yet.
    Opening,
    /// Our name and history are out; waiting for the peer's history.
    Handshaking,
    /// Peer history merged.
    Active,
    Closed,
}

/// State change the facade must reflect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    PeerName(String),
    /// A new peer message was stored; append it to the view.
    Received(Message),
    /// History merged; republish the whole sorted list.
    HistoryMerged,
    /// These ids are now read in the store.
    MarkedRead(Vec<String>),
    /// Peer asked to wipe the room.
    Killed,
}

/// Output of handling one frame.
#[derive(Debug, Default)]
pub struct Reaction {
    pub replies: Vec<Frame>,
    pub events: Vec<SessionEvent>,
}

/// One channel's protocol state.
#[derive(Debug)]
pub struct Session {
    channel: ChannelId,
    info: ChannelInfo,
    phase: SessionPhase,
}

impl Session {
    pub fn new(channel: ChannelId, info: ChannelInfo) -> Self {
        Self {
            channel,
            info,
            phase: SessionPhase::Opening,
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn info(&self) -> ChannelInfo {
        self.info
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Handshake frames for a freshly opened channel: our name, then our full log for the room.
    pub fn open<S: MessageStore>(
        &mut self,
        my_name: &str,
        log: &MessageLog<S>,
        room: &RoomId,
    ) -> Result<Vec<Frame>, StoreError> {
        let history = log.list_by_room(room)?;
        tracing::debug!(channel = self.channel, messages = history.len(), "handshake");
        self.phase = SessionPhase::Handshaking;
        Ok(vec![
            Frame::NameSync {
                name: my_name.to_string(),
            },
            Frame::HistorySync { payload: history },
        ])
    }

    pub fn close(&mut self) {
        self.phase = SessionPhase::Closed;
    }

    /// Apply one inbound frame to the log and work out replies and view changes.
    pub fn on_frame<S: MessageStore>(
        &mut self,
        frame: Frame,
        log: &mut MessageLog<S>,
        room: &RoomId,
    ) -> Result<Reaction, StoreError> {
        let mut out = Reaction::default();
        match frame {
            Frame::NameSync { name } => {
                out.events.push(SessionEvent::PeerName(name));
            }
            Frame::Msg { payload } => {
                let id = payload.id.clone();
                let local = payload.received(room);
                if log.upsert_if_absent(&local)? {
                    out.events.push(SessionEvent::Received(local));
                }
                out.replies.push(Frame::ReadReceipt { id });
            }
            Frame::HistorySync { payload } => {
                let mut confirmed = Vec::with_capacity(payload.len());
                let mut inserted = 0usize;
                for remote in payload {
                    let id = remote.id.clone();
                    if log.upsert_if_absent(&remote.received(room))? {
                        inserted += 1;
                    }
                    if !id.is_empty() && log.contains(&id)? {
                        confirmed.push(id);
                    }
                }
                tracing::debug!(
                    channel = self.channel,
                    inserted,
                    confirmed = confirmed.len(),
                    "history merged"
                );
                if !confirmed.is_empty() {
                    out.replies.push(Frame::BulkReadReceipt { ids: confirmed });
                }
                out.events.push(SessionEvent::HistoryMerged);
                if self.phase == SessionPhase::Handshaking {
                    self.phase = SessionPhase::Active;
                }
            }
            Frame::ReadReceipt { id } => {
                let marked = mark_read(log, std::iter::once(id))?;
                if !marked.is_empty() {
                    out.events.push(SessionEvent::MarkedRead(marked));
                }
            }
            Frame::BulkReadReceipt { ids } => {
                let marked = mark_read(log, ids)?;
                if !marked.is_empty() {
                    out.events.push(SessionEvent::MarkedRead(marked));
                }
            }
            Frame::KillSignal => {
                let wiped = log.delete_all_for_room(room)?;
                tracing::info!(channel = self.channel, wiped, "kill-signal received");
                out.events.push(SessionEvent::Killed);
                self.phase = SessionPhase::Closed;
            }
        }
        Ok(out)
    }
}

/// Mark each known id read. Unknown or already-read ids are skipped. Returns the ids that changed.
fn mark_read<S: MessageStore>(
    log: &mut MessageLog<S>,
    ids: impl IntoIterator<Item = String>,
) -> Result<Vec<String>, StoreError> {
    let mut changed = Vec::new();
    for id in ids {
        if log.update_status(&id, MessageStatus::Read)? {
            changed.push(id);
        }
    }
    Ok(changed)
}
