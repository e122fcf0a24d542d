//! Arbitration lock ("buzzer").
//!
//! Exactly one participant may hold the lock per round, no matter how many
//! press at once. Acquisition is a transaction on the shared game state;
//! the win/loss decision is made from the value that transaction actually
//! settled with, never from an optimistic local echo. [`LockView`] exists
//! for display projections only and is deliberately a different type, so a
//! view snapshot cannot be fed back into game-outcome code paths.

use serde_json::Value;
use tracing::debug;

use buzzroom_store::{Store, TxDecision};

use crate::clock::ServerClock;
use crate::error::{CoordError, Result};
use crate::model::{GameState, Participant, Phase, RoomCode, Uid};
use crate::paths;

/// Settled result of a lock attempt. Every variant is an ordinary value;
/// losing a race is not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuzzOutcome {
    /// This participant holds the lock for the round.
    Won {
        /// The press landed before the round content was revealed.
        anticipated: bool,
    },
    /// Someone else already holds it.
    Lost { holder: Uid },
    /// The participant's wrong-answer lockout has not elapsed.
    Blocked { until_ms: i64 },
    /// The room's state is gone or no longer accepting presses.
    RoomGone,
}

/// Optimistic lock snapshot for display (banner, "who buzzed" highlight).
///
/// Never a basis for scoring or release decisions.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LockView {
    pub holder_uid: Option<Uid>,
    pub acquired_at: Option<i64>,
    pub anticipated: bool,
    pub banner: String,
}

impl LockView {
    /// Project a view out of a raw game-state value, tolerating partial
    /// records (a half-written state renders as "no lock").
    pub fn from_state_value(value: &Value) -> Self {
        serde_json::from_value::<GameState>(value.clone())
            .map(|state| Self {
                holder_uid: state.lock.holder_uid,
                acquired_at: state.lock.acquired_at,
                anticipated: state.lock.anticipated,
                banner: state.lock.banner,
            })
            .unwrap_or_default()
    }
}

pub struct Buzzer<S: Store> {
    store: S,
    code: RoomCode,
    clock: ServerClock,
}

impl<S: Store> Buzzer<S> {
    pub fn new(store: S, code: RoomCode, clock: ServerClock) -> Self {
        Self { store, code, clock }
    }

    /// Attempt to take the lock for `uid`.
    ///
    /// The lockout check happens before any state mutation; a blocked
    /// participant's press never reaches the transaction. The transaction
    /// keeps the state unchanged when a holder is already set, so the
    /// holder is immutable until [`Self::release`].
    pub async fn try_acquire(&self, uid: &Uid, display_name: &str) -> Result<BuzzOutcome> {
        let now = self.clock.now_ms();

        let player_path = paths::player(&self.code, uid);
        if let Some(raw) = self.store.read(&player_path).await? {
            let participant: Participant =
                serde_json::from_value(raw).map_err(|source| CoordError::BadRecord {
                    path: player_path.to_string(),
                    source,
                })?;
            if participant.is_blocked_at(now) {
                let until_ms = participant.blocked_until.unwrap_or(now);
                debug!(uid = %uid, until_ms, "press rejected by lockout");
                return Ok(BuzzOutcome::Blocked { until_ms });
            }
        }

        let state_path = paths::room_state(&self.code);
        let banner = format!("{display_name} buzzed in");
        // A settled holder equal to `uid` is not enough to call this press
        // a win: the holder pressing again sees themselves in the settled
        // value too. The closure records whether *this* run claimed.
        let mut claimed = false;
        let outcome = self
            .store
            .transaction(&state_path, |current| {
                claimed = false;
                let Some(raw) = current.filter(|v| !v.is_null()) else {
                    return TxDecision::Abort;
                };
                let Ok(mut state) = serde_json::from_value::<GameState>(raw.clone()) else {
                    return TxDecision::Abort;
                };
                if state.phase != Phase::Playing {
                    return TxDecision::Abort;
                }
                if state.lock.is_held() {
                    return TxDecision::Keep;
                }
                claimed = true;
                state.lock.holder_uid = Some(uid.clone());
                state.lock.acquired_at = Some(now);
                state.lock.anticipated = !state.revealed;
                state.lock.banner = banner.clone();
                match serde_json::to_value(&state) {
                    Ok(v) => TxDecision::Set(v),
                    Err(_) => TxDecision::Abort,
                }
            })
            .await?;

        if !outcome.committed {
            return Ok(BuzzOutcome::RoomGone);
        }
        // Decide from the settled value only.
        let settled: GameState = match outcome.value {
            Some(raw) => serde_json::from_value(raw).map_err(|source| CoordError::BadRecord {
                path: state_path.to_string(),
                source,
            })?,
            None => return Ok(BuzzOutcome::RoomGone),
        };
        match settled.lock.holder_uid {
            Some(holder) if claimed && holder == *uid => Ok(BuzzOutcome::Won {
                anticipated: settled.lock.anticipated,
            }),
            Some(holder) => Ok(BuzzOutcome::Lost { holder }),
            None => Ok(BuzzOutcome::RoomGone),
        }
    }

    /// Clear the lock fields. Called only by the round-advance/validation
    /// path, never by contenders.
    pub async fn release(&self) -> Result<()> {
        let mut fields = serde_json::Map::new();
        fields.insert("lock/holder_uid".into(), Value::Null);
        fields.insert("lock/acquired_at".into(), Value::Null);
        fields.insert("lock/anticipated".into(), Value::Bool(false));
        fields.insert("lock/banner".into(), Value::String(String::new()));
        self.store
            .update(&paths::room_state(&self.code), fields)
            .await?;
        Ok(())
    }
}
