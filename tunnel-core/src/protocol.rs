//! Tunnel wire protocol: chat message record and channel frame types.

use serde::{Deserialize, Serialize};

use crate::identity::RoomId;

/// Current protocol version. Sent in the channel handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// Who originated a message, from the point of view of the store holding the copy.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    Me,
    Peer,
}

/// Delivery status. Only ever moves `Sent -> Read`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sent,
    Read,
}

/// A chat message. `id` is shared by both participants' copies and is the dedup key.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub room_id: RoomId,
    pub content: String,
    pub sender: SenderRole,
    /// Milliseconds since the Unix epoch, set by the originator.
    pub timestamp: i64,
    pub status: MessageStatus,
}

impl Message {
    /// New outbound message with a fresh id.
    pub fn outgoing(room_id: RoomId, content: impl Into<String>, timestamp: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            room_id,
            content: content.into(),
            sender: SenderRole::Me,
            timestamp,
            status: MessageStatus::Sent,
        }
    }

    /// Local copy of a message received from the peer: bound to our room, peer-owned, read on receipt.
    pub fn received(self, room_id: &RoomId) -> Self {
        Self {
            room_id: room_id.clone(),
            sender: SenderRole::Peer,
            status: MessageStatus::Read,
            ..self
        }
    }
}

/// All channel frames. Encoded as JSON objects tagged by `type`; framing is length-prefix (see wire module).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Frame {
    /// Announce our display name.
    NameSync { name: String },
    /// A single new message.
    Msg { payload: Message },
    /// Full snapshot of the sender's log for the room.
    HistorySync { payload: Vec<Message> },
    /// Ack a single message.
    ReadReceipt { id: String },
    /// Ack every message confirmed present after a history-sync.
    BulkReadReceipt { ids: Vec<String> },
    /// Wipe the room on both sides and log out.
    KillSignal,
}

impl Frame {
    /// Frame type name as it appears on the wire. For logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::NameSync { .. } => "name-sync",
            Frame::Msg { .. } => "msg",
            Frame::HistorySync { .. } => "history-sync",
            Frame::ReadReceipt { .. } => "read-receipt",
            Frame::BulkReadReceipt { .. } => "bulk-read-receipt",
            Frame::KillSignal => "kill-signal",
        }
    }
}
