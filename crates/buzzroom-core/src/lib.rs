//! Room realtime coordination layer.
//!
//! Keeps a multiplayer room's shared state consistent while participants
//! connect, disconnect, reconnect, and contend for the same resources:
//! exactly-one-winner buzzer arbitration, phase-aware disconnect handling,
//! an owner grace-period monitor that closes abandoned rooms, fair rotation
//! scheduling, and a one-shot auto-rejoin guard. Everything goes through
//! the [`buzzroom_store::Store`] seam; game outcomes are always decided
//! from settled store values, never from optimistic local echoes.
//!
//! [`room::RoomHandle`] is the entry point; the component modules are
//! public for hosts that compose them differently.

pub mod buzzer;
pub mod clock;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod model;
pub mod monitor;
pub mod paths;
pub mod presence;
pub mod rejoin;
pub mod room;
pub mod rotation;
pub mod tracing_init;

pub use buzzer::{BuzzOutcome, Buzzer, LockView};
pub use clock::ServerClock;
pub use config::CoordConfig;
pub use error::{CoordError, Result};
pub use lifecycle::ConnectionLifecycle;
pub use model::{
    ConnectionStatus, GameState, GroupId, Participant, Phase, PresenceRecord, RoomCode, RoomMeta,
    RoomStatus, Uid,
};
pub use monitor::{OwnerMonitor, OwnerPresence, remaining_ms};
pub use presence::{PresenceBeacon, PresenceStatus, classify};
pub use rejoin::{RejoinGuard, RejoinOutcome};
pub use room::{GameMode, RoomEvent, RoomHandle};
pub use rotation::{RotationSchedule, RoundAssignment};
pub use tracing_init::init_tracing;
