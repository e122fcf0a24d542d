//! Owner grace-period monitor.
//!
//! Every participant runs one of these so the room does not depend on any
//! single client surviving: whoever crosses the grace deadline first issues
//! the close, and the close itself is a guarded transaction over the room
//! subtree, so racing closers and a returning owner settle consistently.
//! Already-closed commits are no-ops, which is what makes N monitors safe.

use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use buzzroom_store::{Store, TxDecision, server_timestamp, set_value_at, value_at};

use crate::clock::ServerClock;
use crate::error::Result;
use crate::model::{RoomCode, Uid};
use crate::paths;

/// What the monitor currently believes about the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnerPresence {
    Present,
    /// Disconnected since `since_ms` (store clock); the room closes when
    /// the grace period elapses.
    Disconnected { since_ms: i64 },
    /// Terminal. The room is closed or gone.
    Closed,
}

/// Display countdown: milliseconds left before the room closes, clamped at
/// zero. `None` while the owner is present; display only, never a basis
/// for the close decision.
pub fn remaining_ms(presence: OwnerPresence, grace: Duration, now_ms: i64) -> Option<i64> {
    match presence {
        OwnerPresence::Disconnected { since_ms } => {
            let deadline = since_ms.saturating_add(grace_ms(grace));
            Some(deadline.saturating_sub(now_ms).max(0))
        }
        OwnerPresence::Present => None,
        OwnerPresence::Closed => Some(0),
    }
}

fn grace_ms(grace: Duration) -> i64 {
    i64::try_from(grace.as_millis()).unwrap_or(i64::MAX)
}

/// Re-attempt interval after a close past the deadline failed to settle.
/// Without it, a transient store error would leave the monitor waiting on
/// subscription changes that may never come.
const CLOSE_RETRY: Duration = Duration::from_millis(250);

pub struct OwnerMonitor {
    rx: watch::Receiver<OwnerPresence>,
    task: JoinHandle<()>,
}

impl OwnerMonitor {
    /// Start watching the owner of `code`.
    pub async fn spawn<S: Store>(
        store: S,
        code: RoomCode,
        owner_uid: Uid,
        grace: Duration,
        clock: ServerClock,
    ) -> Result<Self> {
        let mut meta_sub = store.subscribe(&paths::room_meta(&code)).await?;
        let mut player_sub = store.subscribe(&paths::player(&code, &owner_uid)).await?;

        let initial = assess(meta_sub.current().as_ref(), player_sub.current().as_ref());
        let (tx, rx) = watch::channel(initial);
        let grace_ms = grace_ms(grace);

        let task = tokio::spawn(async move {
            loop {
                let view = assess(meta_sub.current().as_ref(), player_sub.current().as_ref());
                let changed = tx.send_if_modified(|cur| {
                    if *cur == view {
                        false
                    } else {
                        *cur = view;
                        true
                    }
                });
                if changed {
                    debug!(code = %code, ?view, "owner presence changed");
                }
                if view == OwnerPresence::Closed {
                    break;
                }

                let mut deadline_in: Option<Duration> = None;
                if let OwnerPresence::Disconnected { since_ms } = view {
                    let deadline = since_ms.saturating_add(grace_ms);
                    let now = clock.now_ms();
                    if now >= deadline {
                        match close_room(&store, &code, &owner_uid, grace_ms, &clock).await {
                            Ok(true) => {
                                info!(code = %code, "room closed after owner grace expired");
                                let _ = tx.send(OwnerPresence::Closed);
                                break;
                            }
                            // Owner came back (or meta vanished); the next
                            // subscription change re-assesses.
                            Ok(false) => {}
                            Err(error) => {
                                warn!(code = %code, %error, "guarded close failed");
                                deadline_in = Some(CLOSE_RETRY);
                            }
                        }
                    } else {
                        deadline_in = Some(Duration::from_millis(
                            u64::try_from(deadline - now).unwrap_or(0),
                        ));
                    }
                }

                let sleep_for = deadline_in.unwrap_or(Duration::from_secs(3600));
                tokio::select! {
                    res = meta_sub.changed() => {
                        if res.is_err() {
                            break;
                        }
                    }
                    res = player_sub.changed() => {
                        if res.is_err() {
                            break;
                        }
                    }
                    () = tokio::time::sleep(sleep_for), if deadline_in.is_some() => {}
                }
            }
        });

        Ok(Self { rx, task })
    }

    /// Latest assessment.
    pub fn presence(&self) -> OwnerPresence {
        *self.rx.borrow()
    }

    /// A receiver for `tokio::select!` loops; `Closed` is the last value.
    pub fn watch(&self) -> watch::Receiver<OwnerPresence> {
        self.rx.clone()
    }

    pub fn stop(self) {
        self.task.abort();
    }
}

fn assess(meta: Option<&Value>, player: Option<&Value>) -> OwnerPresence {
    let Some(meta) = meta.filter(|v| !v.is_null()) else {
        return OwnerPresence::Closed;
    };
    if meta.get("status").and_then(Value::as_str) == Some("closed") {
        return OwnerPresence::Closed;
    }
    let Some(player) = player else {
        return OwnerPresence::Present;
    };
    if player.get("status").and_then(Value::as_str) == Some("disconnected")
        && let Some(since_ms) = player.get("disconnected_at").and_then(Value::as_i64)
    {
        return OwnerPresence::Disconnected { since_ms };
    }
    OwnerPresence::Present
}

/// Commit the close iff the owner is still disconnected and the grace has
/// elapsed by store time. Returns whether the room is closed afterwards
/// (including "was already closed").
async fn close_room<S: Store>(
    store: &S,
    code: &RoomCode,
    owner_uid: &Uid,
    grace_ms: i64,
    clock: &ServerClock,
) -> Result<bool> {
    let root = paths::room_root(code);
    let status_rel = format!("players/{owner_uid}/status");
    let since_rel = format!("players/{owner_uid}/disconnected_at");

    let outcome = store
        .transaction(&root, |current| {
            let Some(tree) = current.filter(|v| !v.is_null()) else {
                return TxDecision::Abort;
            };
            if value_at(tree, "meta/status").and_then(Value::as_str) == Some("closed") {
                return TxDecision::Keep;
            }
            if value_at(tree, &status_rel).and_then(Value::as_str) != Some("disconnected") {
                return TxDecision::Abort;
            }
            let Some(since_ms) = value_at(tree, &since_rel).and_then(Value::as_i64) else {
                return TxDecision::Abort;
            };
            if clock.now_ms() < since_ms.saturating_add(grace_ms) {
                return TxDecision::Abort;
            }
            let mut next = tree.clone();
            set_value_at(&mut next, "meta/status", json!("closed"));
            set_value_at(&mut next, "meta/closed_at", server_timestamp());
            TxDecision::Set(next)
        })
        .await?;
    Ok(outcome.committed)
}
