//! Message log: durable per-room record with id dedup, status updates and retention.
//!
//! The log is generic over a [`MessageStore`] so the host chooses the backend; [`MemoryStore`]
//! ships here for tests and hosts without persistence.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::identity::{Profile, RoomId};
use crate::protocol::{Message, MessageStatus};

/// Messages older than this (relative to room activation) are purged.
pub const RETENTION_TTL_MS: i64 = 20 * 60 * 60 * 1000;

/// Error from a store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("corrupt record {id}: {reason}")]
    Corrupt { id: String, reason: String },
}

/// Keyed store the log runs on. Each call must be atomic on its own; callers never batch.
pub trait MessageStore {
    /// Insert unless a message with the same id exists. Returns whether it was inserted.
    fn insert_if_absent(&mut self, msg: &Message) -> Result<bool, StoreError>;
    fn get(&self, id: &str) -> Result<Option<Message>, StoreError>;
    /// All messages of a room, ordered by timestamp ascending.
    fn list_by_room(&self, room: &RoomId) -> Result<Vec<Message>, StoreError>;
    /// Set status of an existing message. Returns false if the id is unknown.
    fn set_status(&mut self, id: &str, status: MessageStatus) -> Result<bool, StoreError>;
    fn delete_room(&mut self, room: &RoomId) -> Result<usize, StoreError>;
    /// Delete messages of every room with timestamp strictly below `cutoff`.
    fn delete_older_than(&mut self, cutoff: i64) -> Result<usize, StoreError>;
    fn load_profile(&self) -> Result<Option<Profile>, StoreError>;
    fn save_profile(&mut self, profile: &Profile) -> Result<(), StoreError>;
}

/// In-memory store. Not durable.
#[derive(Debug, Default)]
pub struct MemoryStore {
    messages: HashMap<String, Message>,
    profile: Option<Profile>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageStore for MemoryStore {
    fn insert_if_absent(&mut self, msg: &Message) -> Result<bool, StoreError> {
        if self.messages.contains_key(&msg.id) {
            return Ok(false);
        }
        self.messages.insert(msg.id.clone(), msg.clone());
        Ok(true)
    }

    fn get(&self, id: &str) -> Result<Option<Message>, StoreError> {
        Ok(self.messages.get(id).cloned())
    }

    fn list_by_room(&self, room: &RoomId) -> Result<Vec<Message>, StoreError> {
        let mut out: Vec<Message> = self
            .messages
            .values()
            .filter(|m| &m.room_id == room)
            .cloned()
            .collect();
        sort_messages(&mut out);
        Ok(out)
    }

    fn set_status(&mut self, id: &str, status: MessageStatus) -> Result<bool, StoreError> {
        match self.messages.get_mut(id) {
            Some(m) => {
                m.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete_room(&mut self, room: &RoomId) -> Result<usize, StoreError> {
        let before = self.messages.len();
        self.messages.retain(|_, m| &m.room_id != room);
        Ok(before - self.messages.len())
    }

    fn delete_older_than(&mut self, cutoff: i64) -> Result<usize, StoreError> {
        let before = self.messages.len();
        self.messages.retain(|_, m| m.timestamp >= cutoff);
        Ok(before - self.messages.len())
    }

    fn load_profile(&self) -> Result<Option<Profile>, StoreError> {
        Ok(self.profile.clone())
    }

    fn save_profile(&mut self, profile: &Profile) -> Result<(), StoreError> {
        self.profile = Some(profile.clone());
        Ok(())
    }
}

fn order(a: &Message, b: &Message) -> Ordering {
    a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id))
}

/// Order used everywhere a message list is shown or compared: timestamp, then id.
pub fn sort_messages(messages: &mut [Message]) {
    messages.sort_by(order);
}

/// Insert into an already sorted list, keeping `sort_messages` order.
pub fn insert_sorted(messages: &mut Vec<Message>, msg: Message) {
    let at = messages.partition_point(|m| order(m, &msg) != Ordering::Greater);
    messages.insert(at, msg);
}

/// Local message log on top of a store.
pub struct MessageLog<S> {
    store: S,
}

impl<S: MessageStore> MessageLog<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Record a locally originated message.
    pub fn append(&mut self, msg: &Message) -> Result<(), StoreError> {
        if !self.store.insert_if_absent(msg)? {
            tracing::debug!(id = %msg.id, "append: id already present");
        }
        Ok(())
    }

    /// Insert unless present. Never overwrites the existing copy. Returns whether it was inserted.
    pub fn upsert_if_absent(&mut self, msg: &Message) -> Result<bool, StoreError> {
        self.store.insert_if_absent(msg)
    }

    pub fn get(&self, id: &str) -> Result<Option<Message>, StoreError> {
        self.store.get(id)
    }

    pub fn contains(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.store.get(id)?.is_some())
    }

    /// Messages of a room ordered by timestamp ascending.
    pub fn list_by_room(&self, room: &RoomId) -> Result<Vec<Message>, StoreError> {
        let mut out = self.store.list_by_room(room)?;
        sort_messages(&mut out);
        Ok(out)
    }

    /// Update status. No-op when the id is unknown or the update would move `Read` back to `Sent`.
    /// Returns whether the stored status changed.
    pub fn update_status(&mut self, id: &str, status: MessageStatus) -> Result<bool, StoreError> {
        match self.store.get(id)? {
            Some(existing) if existing.status < status => self.store.set_status(id, status),
            _ => Ok(false),
        }
    }

    pub fn delete_all_for_room(&mut self, room: &RoomId) -> Result<usize, StoreError> {
        self.store.delete_room(room)
    }

    /// Global retention sweep: delete every message with timestamp below `cutoff`.
    pub fn purge_older_than(&mut self, cutoff: i64) -> Result<usize, StoreError> {
        self.store.delete_older_than(cutoff)
    }

    /// Room activation: apply the retention sweep relative to `now_ms`, then load the room.
    pub fn activate(&mut self, room: &RoomId, now_ms: i64) -> Result<Vec<Message>, StoreError> {
        let purged = self.purge_older_than(now_ms.saturating_sub(RETENTION_TTL_MS))?;
        if purged > 0 {
            tracing::info!(purged, "retention sweep");
        }
        self.list_by_room(room)
    }

    /// Stored profile, or a freshly generated one that is persisted first.
    pub fn profile_or_generate(&mut self) -> Result<Profile, StoreError> {
        if let Some(p) = self.store.load_profile()? {
            return Ok(p);
        }
        let p = Profile::generate();
        self.store.save_profile(&p)?;
        Ok(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::derive_room_id;
    use crate::protocol::SenderRole;

    fn msg(room: &RoomId, id: &str, ts: i64) -> Message {
        Message {
            id: id.into(),
            room_id: room.clone(),
            content: format!("content {id}"),
            sender: SenderRole::Me,
            timestamp: ts,
            status: MessageStatus::Sent,
        }
    }

    #[test]
    fn upsert_never_overwrites() {
        let room = derive_room_id("alpha").unwrap();
        let mut log = MessageLog::new(MemoryStore::new());
        assert!(log.upsert_if_absent(&msg(&room, "m1", 1)).unwrap());
        let mut dup = msg(&room, "m1", 99);
        dup.content = "other".into();
        assert!(!log.upsert_if_absent(&dup).unwrap());
        let stored = log.get("m1").unwrap().unwrap();
        assert_eq!(stored.content, "content m1");
        assert_eq!(stored.timestamp, 1);
    }

    #[test]
    fn list_sorted_and_partitioned() {
        let a = derive_room_id("alpha").unwrap();
        let b = derive_room_id("beta").unwrap();
        let mut log = MessageLog::new(MemoryStore::new());
        log.append(&msg(&a, "m3", 30)).unwrap();
        log.append(&msg(&a, "m1", 10)).unwrap();
        log.append(&msg(&b, "x1", 5)).unwrap();
        log.append(&msg(&a, "m2", 20)).unwrap();
        let ids: Vec<String> = log.list_by_room(&a).unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, ["m1", "m2", "m3"]);
        assert_eq!(log.list_by_room(&b).unwrap().len(), 1);
    }

    #[test]
    fn insert_sorted_places_skewed_timestamps() {
        let room = derive_room_id("alpha").unwrap();
        let mut view = vec![msg(&room, "a", 10), msg(&room, "c", 30)];
        insert_sorted(&mut view, msg(&room, "b", 20));
        insert_sorted(&mut view, msg(&room, "z", 5));
        insert_sorted(&mut view, msg(&room, "d", 30));
        insert_sorted(&mut view, msg(&room, "e", 99));
        let ids: Vec<&str> = view.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["z", "a", "b", "c", "d", "e"]);
    }

    #[test]
    fn status_never_regresses() {
        let room = derive_room_id("alpha").unwrap();
        let mut log = MessageLog::new(MemoryStore::new());
        log.append(&msg(&room, "m1", 1)).unwrap();
        assert!(log.update_status("m1", MessageStatus::Read).unwrap());
        assert!(!log.update_status("m1", MessageStatus::Read).unwrap());
        assert!(!log.update_status("m1", MessageStatus::Sent).unwrap());
        assert_eq!(log.get("m1").unwrap().unwrap().status, MessageStatus::Read);
    }

    #[test]
    fn update_unknown_is_noop() {
        let mut log = MessageLog::new(MemoryStore::new());
        assert!(!log.update_status("nope", MessageStatus::Read).unwrap());
    }

    #[test]
    fn delete_room_keeps_other_rooms() {
        let a = derive_room_id("alpha").unwrap();
        let b = derive_room_id("beta").unwrap();
        let mut log = MessageLog::new(MemoryStore::new());
        log.append(&msg(&a, "m1", 1)).unwrap();
        log.append(&msg(&a, "m2", 2)).unwrap();
        log.append(&msg(&b, "x1", 3)).unwrap();
        assert_eq!(log.delete_all_for_room(&a).unwrap(), 2);
        assert!(log.list_by_room(&a).unwrap().is_empty());
        assert!(log.contains("x1").unwrap());
    }

    #[test]
    fn retention_boundary() {
        let a = derive_room_id("alpha").unwrap();
        let b = derive_room_id("beta").unwrap();
        let now = 100 * RETENTION_TTL_MS;
        let cutoff = now - RETENTION_TTL_MS;
        let mut log = MessageLog::new(MemoryStore::new());
        log.append(&msg(&a, "old", cutoff - 1)).unwrap();
        log.append(&msg(&a, "edge", cutoff)).unwrap();
        log.append(&msg(&a, "fresh", now)).unwrap();
        log.append(&msg(&b, "other-old", cutoff - 500)).unwrap();
        let listed: Vec<String> = log
            .activate(&a, now)
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(listed, ["edge", "fresh"]);
        // sweep is global
        assert!(!log.contains("other-old").unwrap());
    }

    #[test]
    fn profile_generated_once() {
        let mut log = MessageLog::new(MemoryStore::new());
        let first = log.profile_or_generate().unwrap();
        let second = log.profile_or_generate().unwrap();
        assert_eq!(first, second);
    }
}
