//! Connection lifecycle management.
//!
//! Each live participant connection owns one `ConnectionLifecycle` that
//! keeps exactly one disconnect action armed at the store, appropriate for
//! the current phase. The action is what the room observes when the
//! connection drops without a goodbye; voluntary departure goes through
//! [`ConnectionLifecycle::leave`] which writes the terminal state itself.
//!
//! Phase policy:
//! - lobby, non-owner: remove the player record (lobbies show only people
//!   who can actually start the game),
//! - playing, non-owner: mark `status=disconnected` with a server-stamped
//!   `disconnected_at` (scores and seats survive a reconnect),
//! - owner, lobby or playing: always mark, never remove — the grace-period
//!   monitor needs the owner's record to observe the disconnection,
//! - ended: nothing stays armed.

use serde_json::{Map, Value, json};
use tracing::warn;

use buzzroom_store::{DisconnectAction, DisconnectHandle, Store, StorePath, server_timestamp};

use crate::error::Result;
use crate::model::{Phase, RoomCode, Uid};
use crate::paths;

pub struct ConnectionLifecycle<S: Store> {
    store: S,
    player_path: StorePath,
    uid: Uid,
    is_owner: bool,
    phase: Phase,
    handle: Option<DisconnectHandle>,
}

impl<S: Store> ConnectionLifecycle<S> {
    pub fn new(store: S, code: &RoomCode, uid: Uid, is_owner: bool) -> Self {
        Self {
            store,
            player_path: paths::player(code, &uid),
            uid,
            is_owner,
            phase: Phase::Lobby,
            handle: None,
        }
    }

    pub fn uid(&self) -> &Uid {
        &self.uid
    }

    fn action_for(&self, phase: Phase) -> Option<DisconnectAction> {
        match (self.is_owner, phase) {
            (_, Phase::Ended) => None,
            (true, _) | (false, Phase::Playing) => Some(DisconnectAction::Update(mark_fields(
                "disconnected",
                "disconnected_at",
            ))),
            (false, Phase::Lobby) => Some(DisconnectAction::Remove),
        }
    }

    /// (Re-)arm the disconnect action for `phase`, withdrawing whatever was
    /// armed before. Registration failures are logged and swallowed; the
    /// connection outlives a flaky registration.
    pub async fn arm(&mut self, phase: Phase) {
        self.phase = phase;
        if let Some(handle) = self.handle.take()
            && let Err(error) = handle.cancel().await
        {
            warn!(uid = %self.uid, %error, "failed to cancel stale disconnect action");
        }
        let Some(action) = self.action_for(phase) else {
            return;
        };
        match self.store.on_disconnect(&self.player_path, action).await {
            Ok(handle) => self.handle = Some(handle),
            Err(error) => {
                warn!(uid = %self.uid, %error, "failed to arm disconnect action");
            }
        }
    }

    /// Proactively restore `status=active` after a reconnect, clearing the
    /// disconnection markers, then re-arm for the current phase.
    pub async fn mark_active(&mut self) -> Result<()> {
        let mut fields = Map::new();
        fields.insert("status".into(), json!("active"));
        fields.insert("disconnected_at".into(), Value::Null);
        fields.insert("left_at".into(), Value::Null);
        self.store.update(&self.player_path, fields).await?;
        self.arm(self.phase).await;
        Ok(())
    }

    /// Voluntary departure: withdraw the pending action and write the
    /// terminal state for the current phase explicitly.
    pub async fn leave(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take()
            && let Err(error) = handle.cancel().await
        {
            warn!(uid = %self.uid, %error, "failed to cancel disconnect action on leave");
        }
        match self.phase {
            Phase::Lobby => self.store.remove(&self.player_path).await?,
            Phase::Playing => {
                self.store
                    .update(&self.player_path, mark_fields("left", "left_at"))
                    .await?;
            }
            Phase::Ended => {}
        }
        Ok(())
    }
}

fn mark_fields(status: &str, stamp_key: &str) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("status".into(), json!(status));
    fields.insert(stamp_key.into(), server_timestamp());
    fields
}
