//! Room identity: room ID from the shared secret, the two endpoint identities, display names.

use std::fmt;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Length of the room ID in hex characters (48 bits of the digest).
pub const ROOM_ID_LEN: usize = 12;

/// Prefix of every endpoint identity registered with the signalling service.
const IDENTITY_PREFIX: &str = "room-";

/// Display names handed out to new profiles.
pub const NAME_POOL: [&str; 6] = [
    "Iron Knight",
    "Shadow Bat",
    "Steel Flash",
    "Mystic Witch",
    "Aqua Guard",
    "Storm Rider",
];

/// Room ID: truncated hex SHA-256 of the room secret. Used as partition key and in endpoint identities.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    /// Accept a stored room ID. Must look like a derived one.
    pub fn parse(s: &str) -> Option<RoomId> {
        (s.len() == ROOM_ID_LEN && s.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')))
            .then(|| RoomId(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Identity string for a role in this room.
    pub fn endpoint(&self, role: Role) -> String {
        format!("{IDENTITY_PREFIX}{}-{}", self.0, role.tag())
    }

    /// Map an identity string back to its role, if it belongs to this room.
    pub fn role_of(&self, identity: &str) -> Option<Role> {
        [Role::Primary, Role::Secondary]
            .into_iter()
            .find(|role| self.endpoint(*role) == identity)
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which of the two endpoint identities a participant holds.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Role {
    Primary,
    Secondary,
}

impl Role {
    /// The role the peer must hold.
    pub fn other(self) -> Role {
        match self {
            Role::Primary => Role::Secondary,
            Role::Secondary => Role::Primary,
        }
    }

    fn tag(self) -> &'static str {
        match self {
            Role::Primary => "A",
            Role::Secondary => "B",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("room secret is empty")]
    EmptySecret,
}

/// Derive the room ID from the shared secret. Deterministic; empty (or whitespace-only) secret is rejected.
pub fn derive_room_id(secret: &str) -> Result<RoomId, IdentityError> {
    if secret.trim().is_empty() {
        return Err(IdentityError::EmptySecret);
    }
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    let digest = hasher.finalize();
    let hex: String = digest
        .iter()
        .take(ROOM_ID_LEN / 2)
        .map(|b| format!("{b:02x}"))
        .collect();
    Ok(RoomId(hex))
}

/// The (primary, secondary) endpoint identities for a room.
pub fn derive_endpoint_identities(room: &RoomId) -> (String, String) {
    (room.endpoint(Role::Primary), room.endpoint(Role::Secondary))
}

/// Local profile. Generated once, persisted, announced to the peer via name-sync.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub name: String,
}

impl Profile {
    /// Key under which the local profile is stored.
    pub const SELF_ID: &'static str = "me";

    /// New profile with a random name from the pool.
    pub fn generate() -> Self {
        let name = NAME_POOL
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or(NAME_POOL[0]);
        Self {
            id: Self::SELF_ID.to_string(),
            name: name.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn room_id_deterministic() {
        let a = derive_room_id("alpha").unwrap();
        let b = derive_room_id("alpha").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), ROOM_ID_LEN);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn room_id_matches_sha256_prefix() {
        // sha256("abc") = ba7816bf8f01cfea...
        assert_eq!(derive_room_id("abc").unwrap().as_str(), "ba7816bf8f01");
    }

    #[test]
    fn room_id_no_collisions_in_corpus() {
        let ids: HashSet<RoomId> = (0..5000)
            .map(|i| derive_room_id(&format!("secret-{i}")).unwrap())
            .collect();
        assert_eq!(ids.len(), 5000);
    }

    #[test]
    fn parse_accepts_only_derived_shape() {
        let room = derive_room_id("alpha").unwrap();
        assert_eq!(RoomId::parse(room.as_str()), Some(room));
        assert_eq!(RoomId::parse("xyz"), None);
        assert_eq!(RoomId::parse("ABCDEF012345"), None);
    }

    #[test]
    fn empty_secret_rejected() {
        assert_eq!(derive_room_id(""), Err(IdentityError::EmptySecret));
        assert_eq!(derive_room_id("   "), Err(IdentityError::EmptySecret));
    }

    #[test]
    fn endpoint_identities() {
        let room = derive_room_id("alpha").unwrap();
        let (primary, secondary) = derive_endpoint_identities(&room);
        assert_eq!(primary, format!("room-{}-A", room));
        assert_eq!(secondary, format!("room-{}-B", room));
        assert_eq!(room.role_of(&primary), Some(Role::Primary));
        assert_eq!(room.role_of(&secondary), Some(Role::Secondary));
        let other = derive_room_id("beta").unwrap();
        assert_eq!(other.role_of(&primary), None);
    }

    #[test]
    fn generated_profile_uses_pool() {
        let p = Profile::generate();
        assert_eq!(p.id, Profile::SELF_ID);
        assert!(NAME_POOL.contains(&p.name.as_str()));
    }
}
