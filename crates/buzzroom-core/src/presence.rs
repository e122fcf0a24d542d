//! Heartbeat presence.
//!
//! Each connection publishes a presence record under
//! `rooms/{code}/presence/{uid}` and refreshes it on an interval. The
//! offline disconnect action is armed *before* the online record is
//! written, so there is no window where a record claims online with nothing
//! pending to retract it.
//!
//! Observers never trust `online` alone: they classify from heartbeat age,
//! which also covers the client that went away without the store noticing.

use std::time::Duration;

use serde_json::{Map, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use buzzroom_store::{DisconnectAction, DisconnectHandle, Store, StorePath, server_timestamp};

use crate::error::Result;
use crate::model::{PresenceRecord, RoomCode, Uid};
use crate::paths;

/// Observer-side presence classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceStatus {
    Online,
    /// Heartbeat is late but within the uncertainty band; the connection
    /// may just be on a slow network.
    Uncertain,
    Offline,
}

/// Classify a presence record by heartbeat age at `now_ms` (store clock).
///
/// Late heartbeats get an uncertainty band of 1.5x the threshold before
/// they count as offline.
pub fn classify(record: &PresenceRecord, now_ms: i64, stale_threshold: Duration) -> PresenceStatus {
    if !record.online {
        return PresenceStatus::Offline;
    }
    let age = now_ms.saturating_sub(record.last_heartbeat);
    let threshold = i64::try_from(stale_threshold.as_millis()).unwrap_or(i64::MAX);
    if age < threshold {
        PresenceStatus::Online
    } else if age.saturating_mul(2) < threshold.saturating_mul(3) {
        PresenceStatus::Uncertain
    } else {
        PresenceStatus::Offline
    }
}

/// One connection's presence publisher.
pub struct PresenceBeacon<S: Store> {
    store: S,
    path: StorePath,
    handle: Option<DisconnectHandle>,
}

impl<S: Store> PresenceBeacon<S> {
    pub fn new(store: S, code: &RoomCode, uid: &Uid) -> Self {
        Self {
            path: paths::presence(code, uid),
            store,
            handle: None,
        }
    }

    pub fn path(&self) -> &StorePath {
        &self.path
    }

    /// Arm the offline action, then write the online record.
    pub async fn publish(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take()
            && let Err(error) = handle.cancel().await
        {
            warn!(path = %self.path, %error, "failed to cancel stale presence action");
        }
        let offline = json!({
            "online": false,
            "last_seen": server_timestamp(),
            "last_heartbeat": server_timestamp(),
        });
        self.handle = Some(
            self.store
                .on_disconnect(&self.path, DisconnectAction::Write(offline))
                .await?,
        );
        let online = json!({
            "online": true,
            "last_seen": server_timestamp(),
            "last_heartbeat": server_timestamp(),
        });
        self.store.write(&self.path, online).await?;
        Ok(())
    }

    /// Refresh the heartbeat. Failures are logged at debug and swallowed:
    /// losing connectivity is the expected cause, and the armed offline
    /// action is the authoritative answer to that.
    pub async fn beat(&self) {
        let mut fields = Map::new();
        fields.insert("last_heartbeat".into(), server_timestamp());
        fields.insert("last_seen".into(), server_timestamp());
        if let Err(error) = self.store.update(&self.path, fields).await {
            debug!(path = %self.path, %error, "heartbeat write failed");
        }
    }

    /// Explicit goodbye: withdraw the pending action and delete the record.
    pub async fn retire(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take()
            && let Err(error) = handle.cancel().await
        {
            warn!(path = %self.path, %error, "failed to cancel presence action on retire");
        }
        self.store.remove(&self.path).await?;
        Ok(())
    }
}

/// Drive a beacon's heartbeat on `interval` until `shutdown` flips true.
pub fn spawn_heartbeat<S: Store>(
    beacon: PresenceBeacon<S>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<PresenceBeacon<S>> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick fires immediately; skip it, publish already wrote.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => beacon.beat().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(path = %beacon.path, "heartbeat task stopped");
        beacon
    })
}
