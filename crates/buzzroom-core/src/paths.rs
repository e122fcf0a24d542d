//! Canonical store paths for a room.
//!
//! Layout: `rooms/{code}/meta`, `rooms/{code}/state`,
//! `rooms/{code}/players/{uid}`, `rooms/{code}/presence/{uid}`.

use buzzroom_store::StorePath;

use crate::model::{RoomCode, Uid};

const ROOMS: &str = "rooms";

/// `rooms/{code}` — the whole room subtree (guard transactions run here).
pub fn room_root(code: &RoomCode) -> StorePath {
    StorePath::new(ROOMS).child(code.as_str())
}

/// `rooms/{code}/meta`
pub fn room_meta(code: &RoomCode) -> StorePath {
    room_root(code).child("meta")
}

/// `rooms/{code}/state`
pub fn room_state(code: &RoomCode) -> StorePath {
    room_root(code).child("state")
}

/// `rooms/{code}/players`
pub fn players(code: &RoomCode) -> StorePath {
    room_root(code).child("players")
}

/// `rooms/{code}/players/{uid}`
pub fn player(code: &RoomCode, uid: &Uid) -> StorePath {
    players(code).child(uid.as_str())
}

/// `rooms/{code}/presence/{uid}`
pub fn presence(code: &RoomCode, uid: &Uid) -> StorePath {
    room_root(code).child("presence").child(uid.as_str())
}
