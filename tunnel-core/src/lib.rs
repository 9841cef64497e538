//! Tunnel two-party chat protocol reference implementation.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod identity;
pub mod message_log;
pub mod protocol;
pub mod rendezvous;
pub mod session;
pub mod wire;

pub use identity::{derive_endpoint_identities, derive_room_id, Profile, Role, RoomId};
pub use message_log::{MemoryStore, MessageLog, MessageStore, StoreError, RETENTION_TTL_MS};
pub use protocol::{Frame, Message, MessageStatus, SenderRole, PROTOCOL_VERSION};
pub use rendezvous::{RegisterError, RoleResolver, TICK};
pub use session::{ChannelId, ChannelInfo, ChannelOrigin};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError};
pub use self::core::{Action, ChatCore, ChatEvent, ConnectionStatus, JoinError, SessionConfig};

pub mod core;
