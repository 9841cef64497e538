//! Host-driven API: ChatCore receives events from the host, returns actions.
//!
//! One `ChatCore` is one joined room. It owns the role resolver, the current session and the
//! message log, and exposes the state the presentation layer reads.

use crate::identity::{self, IdentityError, Role, RoomId};
use crate::message_log::{self, MessageLog, MessageStore, StoreError};
use crate::protocol::{Frame, Message, MessageStatus};
use crate::rendezvous::{RegisterError, RendezvousAction, RoleResolver};
use crate::session::{ChannelId, ChannelInfo, Reaction, Session, SessionEvent};
use crate::wire;

/// Peer display name until the peer announces one.
pub const PEER_NAME_PLACEHOLDER: &str = "Waiting...";

/// Explicit per-join configuration. The room secret lives here and nowhere else in the core.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub room_secret: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Online,
    Offline,
}

/// Notification for the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEvent {
    StatusChanged(ConnectionStatus),
    /// `messages()` changed.
    MessagesChanged,
    PeerNameChanged(String),
    /// Room torn down by kill or logout; host returns to the pre-join state.
    LoggedOut,
}

/// Action for host to perform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Register { identity: String },
    Release { identity: String },
    Connect { target: String },
    /// Write an encoded frame (length prefix included) to a channel.
    Send { channel: ChannelId, bytes: Vec<u8> },
    Close { channel: ChannelId },
    /// Drop the remembered room secret.
    ForgetRoom,
    Notify(ChatEvent),
}

impl From<RendezvousAction> for Action {
    fn from(a: RendezvousAction) -> Self {
        match a {
            RendezvousAction::Register { identity } => Action::Register { identity },
            RendezvousAction::Release { identity } => Action::Release { identity },
            RendezvousAction::Connect { target } => Action::Connect { target },
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Main coordinator for one room. Host passes events; core returns actions.
pub struct ChatCore<S> {
    room: RoomId,
    log: MessageLog<S>,
    resolver: RoleResolver,
    session: Option<Session>,
    my_name: String,
    peer_name: String,
    messages: Vec<Message>,
    logged_out: bool,
}

impl<S: MessageStore> ChatCore<S> {
    /// Join a room: derive its id, run the retention sweep, load history and profile, and start
    /// claiming the primary identity.
    pub fn join(
        config: &SessionConfig,
        store: S,
        now_ms: i64,
    ) -> Result<(Self, Vec<Action>), JoinError> {
        let room = identity::derive_room_id(&config.room_secret)?;
        let mut log = MessageLog::new(store);
        let messages = log.activate(&room, now_ms)?;
        let profile = log.profile_or_generate()?;
        tracing::info!(%room, name = %profile.name, history = messages.len(), "joined room");
        let mut core = Self {
            resolver: RoleResolver::new(room.clone()),
            room,
            log,
            session: None,
            my_name: profile.name,
            peer_name: PEER_NAME_PLACEHOLDER.to_string(),
            messages,
            logged_out: false,
        };
        let actions = core.resolver.start().into_iter().map(Action::from).collect();
        Ok((core, actions))
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room
    }

    pub fn role(&self) -> Option<Role> {
        self.resolver.role()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        if self.session.is_some() {
            ConnectionStatus::Online
        } else {
            ConnectionStatus::Offline
        }
    }

    /// Live view: the room's messages ordered by timestamp.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn peer_display_name(&self) -> &str {
        &self.peer_name
    }

    pub fn my_display_name(&self) -> &str {
        &self.my_name
    }

    pub fn is_logged_out(&self) -> bool {
        self.logged_out
    }

    pub fn log(&self) -> &MessageLog<S> {
        &self.log
    }

    /// Channel of the current session, if any.
    pub fn current_channel(&self) -> Option<ChannelId> {
        self.session.as_ref().map(Session::channel)
    }

    /// Periodic tick; drives claim fallback, backoff and reconnect attempts.
    pub fn tick(&mut self) -> Vec<Action> {
        self.resolver.tick().into_iter().map(Action::from).collect()
    }

    pub fn on_registered(&mut self, identity: &str) -> Vec<Action> {
        self.resolver
            .on_registered(identity)
            .into_iter()
            .map(Action::from)
            .collect()
    }

    pub fn on_register_failed(&mut self, err: &RegisterError) -> Vec<Action> {
        self.resolver
            .on_register_failed(err)
            .into_iter()
            .map(Action::from)
            .collect()
    }

    pub fn on_signalling_lost(&mut self) -> Vec<Action> {
        self.resolver
            .on_signalling_lost()
            .into_iter()
            .map(Action::from)
            .collect()
    }

    /// A channel to the peer opened, in either direction.
    ///
    /// If a session already runs on another channel, the one with the lower [`ChannelInfo::rank`]
    /// wins and equal ranks keep the current one. Both ends see the same info for a channel, so
    /// they keep the same channel whatever order the opens arrive in.
    pub fn on_channel_open(&mut self, channel: ChannelId, info: ChannelInfo) -> Vec<Action> {
        if self.logged_out {
            return vec![Action::Close { channel }];
        }
        let mut actions = Vec::new();
        if let Some(current) = &self.session {
            if current.channel() == channel {
                return actions;
            }
            if info.rank() >= current.info().rank() {
                tracing::debug!(channel, kept = current.channel(), "closing duplicate channel");
                return vec![Action::Close { channel }];
            }
            tracing::debug!(channel, dropped = current.channel(), "replacing channel");
            actions.push(Action::Close {
                channel: current.channel(),
            });
        }

        let was_online = self.session.is_some();
        let mut session = Session::new(channel, info);
        match session.open(&self.my_name, &self.log, &self.room) {
            Ok(frames) => {
                for f in &frames {
                    push_send(&mut actions, channel, f);
                }
            }
            Err(e) => tracing::warn!(channel, error = %e, "could not load history for handshake"),
        }
        tracing::info!(channel, origin = ?info.origin, dialer = ?info.dialer, "session open");
        self.session = Some(session);
        self.resolver.set_connected(true);
        if !was_online {
            actions.push(Action::Notify(ChatEvent::StatusChanged(ConnectionStatus::Online)));
        }
        actions
    }

    /// Payload of one frame (length prefix already stripped) arrived on a channel.
    pub fn on_channel_data(&mut self, channel: ChannelId, payload: &[u8]) -> Vec<Action> {
        if self.current_channel() != Some(channel) {
            tracing::debug!(channel, "data on inactive channel ignored");
            return vec![];
        }
        let frame: Frame = match wire::decode_payload(payload) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(channel, error = %e, "dropping malformed frame");
                return vec![];
            }
        };
        self.on_frame(channel, frame)
    }

    /// Channel closed or errored.
    pub fn on_channel_closed(&mut self, channel: ChannelId) -> Vec<Action> {
        if self.current_channel() != Some(channel) {
            return vec![];
        }
        if let Some(mut s) = self.session.take() {
            s.close();
        }
        tracing::info!(channel, "session closed");
        self.resolver.set_connected(false);
        vec![Action::Notify(ChatEvent::StatusChanged(ConnectionStatus::Offline))]
    }

    /// Store and publish a new message; transmit it if a session is up. Offline messages reach the
    /// peer through the next history-sync.
    pub fn send_message(&mut self, content: &str, now_ms: i64) -> Result<Vec<Action>, StoreError> {
        if self.logged_out || content.trim().is_empty() {
            return Ok(vec![]);
        }
        let msg = Message::outgoing(self.room.clone(), content, now_ms);
        self.log.append(&msg)?;
        let mut actions = Vec::new();
        if let Some(channel) = self.current_channel() {
            push_send(&mut actions, channel, &Frame::Msg { payload: msg.clone() });
        }
        message_log::insert_sorted(&mut self.messages, msg);
        actions.push(Action::Notify(ChatEvent::MessagesChanged));
        Ok(actions)
    }

    /// Wipe the room locally, tell the peer (best effort), forget the secret and tear down.
    pub fn end_session(&mut self) -> Vec<Action> {
        if self.logged_out {
            return vec![];
        }
        let mut actions = Vec::new();
        if let Some(channel) = self.current_channel() {
            push_send(&mut actions, channel, &Frame::KillSignal);
        }
        self.wipe_room();
        actions.extend(self.teardown());
        actions
    }

    /// Leave the room and forget the secret, keeping the history.
    pub fn log_out(&mut self) -> Vec<Action> {
        if self.logged_out {
            return vec![];
        }
        self.teardown()
    }

    /// Stop all activity for this room (release claim, close channel) without forgetting the
    /// secret. Used before switching rooms or exiting.
    pub fn leave(&mut self) -> Vec<Action> {
        let mut actions = Vec::new();
        if let Some(s) = self.session.take() {
            actions.push(Action::Close {
                channel: s.channel(),
            });
        }
        actions.extend(self.resolver.shutdown().into_iter().map(Action::from));
        actions
    }

    fn on_frame(&mut self, channel: ChannelId, frame: Frame) -> Vec<Action> {
        tracing::debug!(channel, kind = frame.kind(), "frame");
        let Some(session) = self.session.as_mut() else {
            return vec![];
        };
        let reaction = match session.on_frame(frame, &mut self.log, &self.room) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(channel, error = %e, "store error while handling frame");
                return vec![];
            }
        };
        self.apply(channel, reaction)
    }

    fn apply(&mut self, channel: ChannelId, reaction: Reaction) -> Vec<Action> {
        let mut actions = Vec::new();
        for f in &reaction.replies {
            push_send(&mut actions, channel, f);
        }
        for event in reaction.events {
            match event {
                SessionEvent::PeerName(name) => {
                    if self.peer_name != name {
                        self.peer_name = name.clone();
                        actions.push(Action::Notify(ChatEvent::PeerNameChanged(name)));
                    }
                }
                SessionEvent::Received(msg) => {
                    message_log::insert_sorted(&mut self.messages, msg);
                    actions.push(Action::Notify(ChatEvent::MessagesChanged));
                }
                SessionEvent::HistoryMerged => {
                    match self.log.list_by_room(&self.room) {
                        Ok(list) => self.messages = list,
                        Err(e) => tracing::warn!(error = %e, "could not reload messages"),
                    }
                    actions.push(Action::Notify(ChatEvent::MessagesChanged));
                }
                SessionEvent::MarkedRead(ids) => {
                    for m in self.messages.iter_mut().filter(|m| ids.contains(&m.id)) {
                        m.status = MessageStatus::Read;
                    }
                    actions.push(Action::Notify(ChatEvent::MessagesChanged));
                }
                SessionEvent::Killed => {
                    self.messages.clear();
                    actions.push(Action::Notify(ChatEvent::MessagesChanged));
                    actions.extend(self.teardown());
                }
            }
        }
        actions
    }

    fn wipe_room(&mut self) {
        match self.log.delete_all_for_room(&self.room) {
            Ok(n) => tracing::info!(room = %self.room, wiped = n, "room wiped"),
            Err(e) => tracing::warn!(error = %e, "could not wipe room"),
        }
        self.messages.clear();
    }

    fn teardown(&mut self) -> Vec<Action> {
        let was_online = self.session.is_some();
        let mut actions = self.leave();
        if was_online {
            actions.push(Action::Notify(ChatEvent::StatusChanged(ConnectionStatus::Offline)));
        }
        actions.push(Action::ForgetRoom);
        self.logged_out = true;
        actions.push(Action::Notify(ChatEvent::LoggedOut));
        actions
    }
}

fn push_send(actions: &mut Vec<Action>, channel: ChannelId, frame: &Frame) {
    match wire::encode_frame(frame) {
        Ok(bytes) => actions.push(Action::Send { channel, bytes }),
        Err(e) => {
            tracing::warn!(channel, kind = frame.kind(), error = %e, "could not encode frame")
        }
    }
}
