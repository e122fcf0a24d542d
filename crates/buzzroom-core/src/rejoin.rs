//! Auto-rejoin guard.
//!
//! Repairs the one legitimate gap in lobby bookkeeping: a participant whose
//! record was removed by their own disconnect action (page reload, brief
//! drop) but whose connection came back while the room is still in lobby.
//! The guard fires at most once per construction, so a participant the
//! owner deliberately removed is not silently re-added in a loop — their
//! next attempt goes through the normal join flow where the store's rules
//! can reject it.

use tracing::info;

use buzzroom_store::{Store, StoreError, TxDecision};

use crate::error::{CoordError, Result};
use crate::model::{Participant, Phase, RoomCode, RoomMeta, Uid};
use crate::paths;

/// How a rejoin attempt settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejoinOutcome {
    /// Gate not met (wrong phase, owner, or already fired). Nothing read
    /// or written.
    NotApplicable,
    /// Room meta is absent or closed; the caller should leave.
    RoomGone,
    /// A record was already present; nothing written.
    AlreadyPresent,
    /// The record was re-created from the factory.
    Rejoined,
}

/// One-shot rejoin guard for a single participant connection.
pub struct RejoinGuard<S: Store> {
    store: S,
    code: RoomCode,
    uid: Uid,
    fired: bool,
}

impl<S: Store> RejoinGuard<S> {
    pub fn new(store: S, code: RoomCode, uid: Uid) -> Self {
        Self {
            store,
            code,
            uid,
            fired: false,
        }
    }

    /// Ensure this participant's record exists, re-creating it from
    /// `factory` when it is missing.
    ///
    /// Only applies in lobby and never for the owner (the owner's record is
    /// never removed by a disconnect). The presence check and the repair
    /// are one transaction, so a surviving record is never overwritten.
    pub async fn ensure_present<F>(
        &mut self,
        phase: Phase,
        is_owner: bool,
        factory: F,
    ) -> Result<RejoinOutcome>
    where
        F: FnOnce() -> Participant,
    {
        if self.fired || is_owner || phase != Phase::Lobby {
            return Ok(RejoinOutcome::NotApplicable);
        }
        self.fired = true;

        let meta_path = paths::room_meta(&self.code);
        let meta = match self.store.read(&meta_path).await? {
            Some(raw) => serde_json::from_value::<RoomMeta>(raw).map_err(|source| {
                CoordError::BadRecord {
                    path: meta_path.to_string(),
                    source,
                }
            })?,
            None => return Ok(RejoinOutcome::RoomGone),
        };
        if !meta.is_open() {
            return Ok(RejoinOutcome::RoomGone);
        }

        let record = serde_json::to_value(factory()).map_err(StoreError::from)?;
        let player_path = paths::player(&self.code, &self.uid);
        let mut wrote = false;
        let result = self
            .store
            .transaction(&player_path, |current| match current {
                Some(existing) if !existing.is_null() => {
                    wrote = false;
                    TxDecision::Keep
                }
                _ => {
                    wrote = true;
                    TxDecision::Set(record.clone())
                }
            })
            .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(StoreError::PermissionDenied { .. }) => {
                return Err(CoordError::Rejected {
                    code: self.code.clone(),
                    uid: self.uid.clone(),
                });
            }
            Err(other) => return Err(other.into()),
        };

        if outcome.committed && wrote {
            info!(code = %self.code, uid = %self.uid, "re-created lobby record after reconnect");
            Ok(RejoinOutcome::Rejoined)
        } else {
            Ok(RejoinOutcome::AlreadyPresent)
        }
    }
}
