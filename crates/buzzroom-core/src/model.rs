//! Shared data model for room coordination.
//!
//! These records mirror the persisted shapes under `rooms/{code}/...`.
//! Everything serializes through serde to the store's JSON values; absent
//! optional fields are omitted so records stay minimal on the wire.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Participant identity token, unique within a room.
///
/// Issued by an external identity provider and always passed in
/// explicitly — the coordination core never reads ambient identity state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(String);

impl Uid {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Short human-entered room code, normalized to uppercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomCode(String);

impl RoomCode {
    /// Letters used for generated codes. No vowels, so codes never spell
    /// anything, and no easily-confused glyphs.
    const ALPHABET: &'static [u8] = b"BCDFGHJKLMNPQRSTVWXZ";

    pub fn new(raw: impl AsRef<str>) -> Self {
        Self(raw.as_ref().trim().to_ascii_uppercase())
    }

    /// Generate a random code of `len` characters.
    pub fn generate(rng: &mut impl Rng, len: usize) -> Self {
        let code: String = (0..len)
            .map(|_| {
                let i = rng.random_range(0..Self::ALPHABET.len());
                char::from(Self::ALPHABET[i])
            })
            .collect();
        Self(code)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Group identifier for group-based sub-games.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Room lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Lobby,
    Playing,
    Ended,
}

/// Participant connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Active,
    Disconnected,
    Left,
}

/// Room open/closed status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Open,
    Closed,
}

/// One participant record (`rooms/{code}/players/{uid}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub uid: Uid,
    pub name: String,
    #[serde(default)]
    pub score: i64,
    #[serde(default = "default_status")]
    pub status: ConnectionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disconnected_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_at: Option<i64>,
    /// Lockout deadline (store-clock ms) after a wrong answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_until: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<GroupId>,
    pub joined_at: i64,
}

fn default_status() -> ConnectionStatus {
    ConnectionStatus::Active
}

impl Participant {
    pub fn new(uid: Uid, name: impl Into<String>, joined_at: i64) -> Self {
        Self {
            uid,
            name: name.into(),
            score: 0,
            status: ConnectionStatus::Active,
            disconnected_at: None,
            left_at: None,
            blocked_until: None,
            group: None,
            joined_at,
        }
    }

    pub fn with_group(mut self, group: GroupId) -> Self {
        self.group = Some(group);
        self
    }

    /// Whether a lock attempt by this participant is currently locked out.
    pub fn is_blocked_at(&self, now_ms: i64) -> bool {
        self.blocked_until.is_some_and(|until| until > now_ms)
    }
}

/// Room metadata (`rooms/{code}/meta`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMeta {
    pub code: RoomCode,
    pub owner_uid: Uid,
    pub owner_name: String,
    pub created_at: i64,
    pub expires_at: i64,
    #[serde(default = "default_room_status")]
    pub status: RoomStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<i64>,
}

fn default_room_status() -> RoomStatus {
    RoomStatus::Open
}

impl RoomMeta {
    pub fn is_open(&self) -> bool {
        self.status == RoomStatus::Open
    }
}

/// The arbitration lock fields, nested in [`GameState`].
///
/// At most one holder at any instant; set by the winning `try_acquire`
/// transaction and cleared only by the round-advance/validation path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LockState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub holder_uid: Option<Uid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acquired_at: Option<i64>,
    /// Holder acted before the round content was revealed.
    #[serde(default)]
    pub anticipated: bool,
    #[serde(default)]
    pub banner: String,
}

impl LockState {
    pub fn is_held(&self) -> bool {
        self.holder_uid.is_some()
    }
}

/// Shared game state (`rooms/{code}/state`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameState {
    pub phase: Phase,
    #[serde(default)]
    pub lock: LockState,
    /// Whether the current round's content is revealed (contention open).
    #[serde(default)]
    pub revealed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<crate::rotation::RotationSchedule>,
    #[serde(default)]
    pub current_round: usize,
}

impl GameState {
    /// Fresh pre-game state.
    pub fn lobby() -> Self {
        Self {
            phase: Phase::Lobby,
            lock: LockState::default(),
            revealed: false,
            rotation: None,
            current_round: 0,
        }
    }
}

/// Heartbeat presence record (`rooms/{code}/presence/{uid}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub online: bool,
    pub last_seen: i64,
    pub last_heartbeat: i64,
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn participant_round_trips_with_minimal_fields() {
        let raw = json!({
            "uid": "u1",
            "name": "ana",
            "joined_at": 1000,
        });
        let p: Participant = serde_json::from_value(raw).unwrap();
        assert_eq!(p.score, 0);
        assert_eq!(p.status, ConnectionStatus::Active);
        assert!(p.disconnected_at.is_none());

        let back = serde_json::to_value(&p).unwrap();
        assert!(back.get("disconnected_at").is_none());
        assert!(back.get("blocked_until").is_none());
    }

    #[test]
    fn status_strings_match_store_shape() {
        assert_eq!(
            serde_json::to_value(ConnectionStatus::Disconnected).unwrap(),
            json!("disconnected")
        );
        assert_eq!(serde_json::to_value(Phase::Lobby).unwrap(), json!("lobby"));
        assert_eq!(
            serde_json::to_value(RoomStatus::Closed).unwrap(),
            json!("closed")
        );
    }

    #[test]
    fn generated_codes_are_uppercase_and_sized() {
        let mut rng = rand::rng();
        for _ in 0..32 {
            let code = RoomCode::generate(&mut rng, 4);
            assert_eq!(code.as_str().len(), 4);
            assert!(code.as_str().chars().all(|c| c.is_ascii_uppercase()));
        }
    }

    #[test]
    fn blocked_until_comparison() {
        let mut p = Participant::new(Uid::new("u1"), "ana", 0);
        assert!(!p.is_blocked_at(1_000));
        p.blocked_until = Some(2_000);
        assert!(p.is_blocked_at(1_999));
        assert!(!p.is_blocked_at(2_000));
    }
}
