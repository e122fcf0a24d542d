//! Error types for the coordination layer.
//!
//! Taxonomy: transient store failures wrap [`StoreError`]; permission
//! rejections are a distinct variant so callers redirect instead of
//! retrying; invariant violations (bad schedule input) refuse the
//! operation synchronously. Losing a race is *not* an error anywhere in
//! this crate — those are ordinary return values.

use thiserror::Error;

use buzzroom_store::StoreError;

use crate::model::{RoomCode, Uid};

/// Result type alias using [`CoordError`].
pub type Result<T> = std::result::Result<T, CoordError>;

/// Errors surfaced by coordination operations.
#[derive(Debug, Error)]
pub enum CoordError {
    /// The room is closed or no longer exists.
    #[error("Room {0} is closed or gone")]
    RoomGone(RoomCode),

    /// The store rejected a write this participant is not allowed to make
    /// (e.g. rejoin after removal). Not retryable.
    #[error("Participant {uid} rejected by room {code}")]
    Rejected { code: RoomCode, uid: Uid },

    /// Too few groups to build a paired rotation.
    #[error("Not enough groups for paired rotation: need {needed}, got {got}")]
    NotEnoughGroups { needed: usize, got: usize },

    /// Too few actors to build a single-resource rotation.
    #[error("Not enough actors for rotation: need {needed}, got {got}")]
    NotEnoughActors { needed: usize, got: usize },

    /// A stored schedule failed validation on read.
    #[error("Malformed rotation schedule: {0}")]
    InvalidSchedule(String),

    /// Configuration load/parse failure.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A stored record failed to deserialize.
    #[error("Malformed record at {path}: {source}")]
    BadRecord {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}
