//! SQLite store: messages, profile, and the remembered room secret.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use tunnel_core::identity::{Profile, RoomId};
use tunnel_core::message_log::{MessageStore, StoreError};
use tunnel_core::protocol::{Message, MessageStatus, SenderRole};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
    id        TEXT PRIMARY KEY,
    room_id   TEXT NOT NULL,
    content   TEXT NOT NULL,
    sender    TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    status    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS messages_room ON messages (room_id);
CREATE INDEX IF NOT EXISTS messages_timestamp ON messages (timestamp);
CREATE TABLE IF NOT EXISTS profiles (
    id   TEXT PRIMARY KEY,
    name TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS settings (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

const LAST_ROOM_KEY: &str = "last_room_secret";

const COLUMNS: &str = "id, room_id, content, sender, timestamp, status";

type Row = (String, String, String, String, i64, String);

pub struct SqliteStore {
    conn: Connection,
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(Box::new(e))
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| StoreError::Backend(Box::new(e)))?;
        }
        Self::init(Connection::open(path).map_err(backend)?)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(backend)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(backend)?;
        Ok(Self { conn })
    }

    pub fn remember_room_secret(&self, secret: &str) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![LAST_ROOM_KEY, secret],
            )
            .map_err(backend)?;
        Ok(())
    }

    pub fn last_room_secret(&self) -> Result<Option<String>, StoreError> {
        self.conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![LAST_ROOM_KEY],
                |r| r.get(0),
            )
            .optional()
            .map_err(backend)
    }

    pub fn forget_room_secret(&self) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM settings WHERE key = ?1", params![LAST_ROOM_KEY])
            .map_err(backend)?;
        Ok(())
    }
}

fn read_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Row> {
    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?))
}

fn to_message(row: Row) -> Result<Message, StoreError> {
    let (id, room_id, content, sender, timestamp, status) = row;
    let corrupt = |reason: String| StoreError::Corrupt {
        id: id.clone(),
        reason,
    };
    let room_id = RoomId::parse(&room_id).ok_or_else(|| corrupt(format!("room id {room_id:?}")))?;
    let sender = match sender.as_str() {
        "me" => SenderRole::Me,
        "peer" => SenderRole::Peer,
        other => return Err(corrupt(format!("sender {other:?}"))),
    };
    let status = match status.as_str() {
        "sent" => MessageStatus::Sent,
        "read" => MessageStatus::Read,
        other => return Err(corrupt(format!("status {other:?}"))),
    };
    Ok(Message {
        id,
        room_id,
        content,
        sender,
        timestamp,
        status,
    })
}

fn sender_str(s: SenderRole) -> &'static str {
    match s {
        SenderRole::Me => "me",
        SenderRole::Peer => "peer",
    }
}

fn status_str(s: MessageStatus) -> &'static str {
    match s {
        MessageStatus::Sent => "sent",
        MessageStatus::Read => "read",
    }
}

impl MessageStore for SqliteStore {
    fn insert_if_absent(&mut self, msg: &Message) -> Result<bool, StoreError> {
        let n = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO messages (id, room_id, content, sender, timestamp, status)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    msg.id,
                    msg.room_id.as_str(),
                    msg.content,
                    sender_str(msg.sender),
                    msg.timestamp,
                    status_str(msg.status),
                ],
            )
            .map_err(backend)?;
        Ok(n == 1)
    }

    fn get(&self, id: &str) -> Result<Option<Message>, StoreError> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
                read_row,
            )
            .optional()
            .map_err(backend)?;
        row.map(to_message).transpose()
    }

    fn list_by_room(&self, room: &RoomId) -> Result<Vec<Message>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached(&format!(
                "SELECT {COLUMNS} FROM messages WHERE room_id = ?1 ORDER BY timestamp ASC, id ASC"
            ))
            .map_err(backend)?;
        let rows = stmt
            .query_map(params![room.as_str()], read_row)
            .map_err(backend)?
            .collect::<rusqlite::Result<Vec<Row>>>()
            .map_err(backend)?;
        rows.into_iter().map(to_message).collect()
    }

    fn set_status(&mut self, id: &str, status: MessageStatus) -> Result<bool, StoreError> {
        let n = self
            .conn
            .execute(
                "UPDATE messages SET status = ?2 WHERE id = ?1",
                params![id, status_str(status)],
            )
            .map_err(backend)?;
        Ok(n > 0)
    }

    fn delete_room(&mut self, room: &RoomId) -> Result<usize, StoreError> {
        self.conn
            .execute("DELETE FROM messages WHERE room_id = ?1", params![room.as_str()])
            .map_err(backend)
    }

    fn delete_older_than(&mut self, cutoff: i64) -> Result<usize, StoreError> {
        self.conn
            .execute("DELETE FROM messages WHERE timestamp < ?1", params![cutoff])
            .map_err(backend)
    }

    fn load_profile(&self) -> Result<Option<Profile>, StoreError> {
        self.conn
            .query_row(
                "SELECT id, name FROM profiles WHERE id = ?1",
                params![Profile::SELF_ID],
                |r| {
                    Ok(Profile {
                        id: r.get(0)?,
                        name: r.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(backend)
    }

    fn save_profile(&mut self, profile: &Profile) -> Result<(), StoreError> {
        self.conn
            .execute(
                "INSERT INTO profiles (id, name) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET name = excluded.name",
                params![profile.id, profile.name],
            )
            .map_err(backend)?;
        Ok(())
    }
}
