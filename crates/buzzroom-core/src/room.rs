//! Room-level operations.
//!
//! A [`RoomHandle`] is one participant's live attachment to a room: it owns
//! the connection lifecycle, the presence beacon and its heartbeat task,
//! the owner monitor, and a background watcher that turns confirmed store
//! changes into [`RoomEvent`]s. Owner-only operations check `is_owner`
//! locally as a courtesy; the store's rules are the real enforcement.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{Map, Value, json};
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use buzzroom_store::{Store, Subscription, TxDecision, server_timestamp};

use crate::buzzer::{BuzzOutcome, Buzzer, LockView};
use crate::clock::ServerClock;
use crate::config::CoordConfig;
use crate::error::{CoordError, Result};
use crate::lifecycle::ConnectionLifecycle;
use crate::model::{
    GameState, GroupId, Participant, Phase, RoomCode, RoomMeta, RoomStatus, Uid,
};
use crate::monitor::{OwnerMonitor, OwnerPresence};
use crate::paths;
use crate::presence::{PresenceBeacon, spawn_heartbeat};
use crate::rejoin::{RejoinGuard, RejoinOutcome};
use crate::rotation::{self, RotationSchedule, RoundAssignment};

/// Redirect-worthy things that happened to the room underneath us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomEvent {
    /// The room was closed (explicitly or by grace expiry).
    Closed,
    /// Our own record vanished without us leaving: the owner removed us.
    Kicked,
    PhaseChanged(Phase),
}

/// How the rotation schedule should be built at game start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameMode {
    /// One shared resource rotating through every participant.
    Single { rounds_per_actor: usize },
    /// Ordered group pairs.
    Paired { questions_per_group: usize },
}

const CODE_ATTEMPTS: usize = 16;
const EVENT_CAPACITY: usize = 32;

pub struct RoomHandle<S: Store + Clone> {
    store: S,
    code: RoomCode,
    uid: Uid,
    name: String,
    is_owner: bool,
    config: CoordConfig,
    clock: ServerClock,
    buzzer: Buzzer<S>,
    lifecycle: Arc<Mutex<ConnectionLifecycle<S>>>,
    rejoin: RejoinGuard<S>,
    monitor: Option<OwnerMonitor>,
    events_tx: broadcast::Sender<RoomEvent>,
    voluntary: Arc<AtomicBool>,
    heartbeat_stop: watch::Sender<bool>,
    // The heartbeat task hands the beacon back on shutdown so a voluntary
    // departure can retire the presence record instead of leaving it online.
    heartbeat: Option<JoinHandle<PresenceBeacon<S>>>,
    watcher: Option<JoinHandle<()>>,
}

impl<S: Store + Clone> RoomHandle<S> {
    /// Create a room and attach as its owner.
    ///
    /// The meta, the fresh lobby state, and the owner's own participant
    /// record land in one write, so no observer ever sees a room without
    /// its owner.
    pub async fn create(
        store: S,
        config: CoordConfig,
        clock: ServerClock,
        owner_uid: Uid,
        owner_name: impl Into<String>,
    ) -> Result<Self> {
        let owner_name = owner_name.into();
        let now = clock.now_ms();

        let mut code = None;
        for attempt in 0..CODE_ATTEMPTS {
            let candidate = RoomCode::generate(&mut rand::rng(), config.rooms.code_length);
            let meta = RoomMeta {
                code: candidate.clone(),
                owner_uid: owner_uid.clone(),
                owner_name: owner_name.clone(),
                created_at: now,
                expires_at: now.saturating_add(
                    i64::try_from(config.rooms.ttl_ms).unwrap_or(i64::MAX),
                ),
                status: RoomStatus::Open,
                closed_at: None,
            };
            let owner_record = Participant::new(owner_uid.clone(), owner_name.clone(), now);
            let tree = json!({
                "meta": serde_json::to_value(&meta).map_err(buzzroom_store::StoreError::from)?,
                "state": serde_json::to_value(GameState::lobby())
                    .map_err(buzzroom_store::StoreError::from)?,
                "players": {
                    owner_uid.as_str(): serde_json::to_value(&owner_record)
                        .map_err(buzzroom_store::StoreError::from)?,
                },
            });
            let outcome = store
                .transaction(&paths::room_root(&candidate), |current| match current {
                    Some(existing) if !existing.is_null() => TxDecision::Abort,
                    _ => TxDecision::Set(tree.clone()),
                })
                .await?;
            if outcome.committed {
                code = Some(candidate);
                break;
            }
            debug!(attempt, "room code collision, regenerating");
        }
        let Some(code) = code else {
            return Err(CoordError::Config(format!(
                "could not find a free room code in {CODE_ATTEMPTS} attempts"
            )));
        };
        info!(code = %code, owner = %owner_uid, "room created");

        Self::attach(store, config, clock, code, owner_uid, owner_name, true, Phase::Lobby).await
    }

    /// Join an existing room, or reattach to one we already have a record
    /// in (scores and seats survive a reconnect).
    pub async fn join(
        store: S,
        config: CoordConfig,
        clock: ServerClock,
        code: RoomCode,
        uid: Uid,
        name: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        let meta = read_meta(&store, &code).await?.ok_or_else(|| {
            CoordError::RoomGone(code.clone())
        })?;
        if !meta.is_open() {
            return Err(CoordError::RoomGone(code.clone()));
        }
        let is_owner = meta.owner_uid == uid;
        let phase = read_phase(&store, &code).await?.unwrap_or(Phase::Lobby);

        let record = Participant::new(uid.clone(), name.clone(), clock.now_ms());
        let raw = serde_json::to_value(&record).map_err(buzzroom_store::StoreError::from)?;
        let player_path = paths::player(&code, &uid);
        let mut existed = false;
        let outcome = store
            .transaction(&player_path, |current| match current {
                Some(existing) if !existing.is_null() => {
                    existed = true;
                    TxDecision::Keep
                }
                _ if phase == Phase::Lobby || is_owner => {
                    existed = false;
                    TxDecision::Set(raw.clone())
                }
                // No record and the game already started: nothing to
                // reattach to.
                _ => TxDecision::Abort,
            })
            .await
            .map_err(|error| match error {
                buzzroom_store::StoreError::PermissionDenied { .. } => CoordError::Rejected {
                    code: code.clone(),
                    uid: uid.clone(),
                },
                other => other.into(),
            })?;
        if !outcome.committed {
            return Err(CoordError::RoomGone(code.clone()));
        }

        let mut handle =
            Self::attach(store, config, clock, code, uid, name, is_owner, phase).await?;
        if existed {
            handle.lifecycle.lock().await.mark_active().await?;
        }
        Ok(handle)
    }

    #[allow(clippy::too_many_arguments)]
    async fn attach(
        store: S,
        config: CoordConfig,
        clock: ServerClock,
        code: RoomCode,
        uid: Uid,
        name: String,
        is_owner: bool,
        phase: Phase,
    ) -> Result<Self> {
        let mut lifecycle =
            ConnectionLifecycle::new(store.clone(), &code, uid.clone(), is_owner);
        lifecycle.arm(phase).await;
        let lifecycle = Arc::new(Mutex::new(lifecycle));

        let mut beacon = PresenceBeacon::new(store.clone(), &code, &uid);
        beacon.publish().await?;
        let (heartbeat_stop, stop_rx) = watch::channel(false);
        let heartbeat = spawn_heartbeat(beacon, config.heartbeat_interval(), stop_rx);

        let meta = read_meta(&store, &code)
            .await?
            .ok_or_else(|| CoordError::RoomGone(code.clone()))?;
        let monitor = OwnerMonitor::spawn(
            store.clone(),
            code.clone(),
            meta.owner_uid.clone(),
            config.owner_grace(),
            clock.clone(),
        )
        .await?;

        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let voluntary = Arc::new(AtomicBool::new(false));
        let watcher = spawn_room_watcher(
            store.clone(),
            code.clone(),
            uid.clone(),
            is_owner,
            phase,
            Arc::clone(&lifecycle),
            events_tx.clone(),
            Arc::clone(&voluntary),
        )
        .await?;

        Ok(Self {
            buzzer: Buzzer::new(store.clone(), code.clone(), clock.clone()),
            rejoin: RejoinGuard::new(store.clone(), code.clone(), uid.clone()),
            store,
            code,
            uid,
            name,
            is_owner,
            config,
            clock,
            lifecycle,
            monitor: Some(monitor),
            events_tx,
            voluntary,
            heartbeat_stop,
            heartbeat: Some(heartbeat),
            watcher: Some(watcher),
        })
    }

    pub fn code(&self) -> &RoomCode {
        &self.code
    }

    pub fn uid(&self) -> &Uid {
        &self.uid
    }

    pub fn is_owner(&self) -> bool {
        self.is_owner
    }

    /// Subscribe to redirect-worthy room events.
    pub fn events(&self) -> broadcast::Receiver<RoomEvent> {
        self.events_tx.subscribe()
    }

    /// Latest owner-presence assessment (display countdowns hang off this).
    pub fn owner_presence(&self) -> OwnerPresence {
        self.monitor
            .as_ref()
            .map_or(OwnerPresence::Closed, OwnerMonitor::presence)
    }

    pub fn owner_presence_watch(&self) -> Option<watch::Receiver<OwnerPresence>> {
        self.monitor.as_ref().map(OwnerMonitor::watch)
    }

    /// Repair our lobby record after a reconnect. One-shot; see
    /// [`RejoinGuard`].
    pub async fn ensure_rejoined(&mut self) -> Result<RejoinOutcome> {
        let phase = read_phase(&self.store, &self.code)
            .await?
            .unwrap_or(Phase::Lobby);
        let record = Participant::new(self.uid.clone(), self.name.clone(), self.clock.now_ms());
        let outcome = self
            .rejoin
            .ensure_present(phase, self.is_owner, || record)
            .await?;
        if outcome == RejoinOutcome::Rejoined {
            self.lifecycle.lock().await.arm(phase).await;
        }
        Ok(outcome)
    }

    /// Press the buzzer.
    pub async fn buzz(&self) -> Result<BuzzOutcome> {
        self.buzzer.try_acquire(&self.uid, &self.name).await
    }

    /// Clear the lock without advancing (owner, mid-round correction).
    pub async fn release_lock(&self) -> Result<()> {
        self.require_owner()?;
        self.buzzer.release().await
    }

    /// Open the contention window for the current round.
    pub async fn reveal(&self) -> Result<()> {
        self.require_owner()?;
        let mut fields = Map::new();
        fields.insert("revealed".into(), json!(true));
        self.store
            .update(&paths::room_state(&self.code), fields)
            .await?;
        Ok(())
    }

    /// Build the rotation and start the game.
    ///
    /// Schedule, phase flip, and lock reset land in one state write;
    /// malformed rosters refuse synchronously before anything is written.
    pub async fn start_game(&self, mode: GameMode) -> Result<()> {
        self.require_owner()?;
        let roster = self.participants().await?;
        let schedule = match mode {
            GameMode::Single { rounds_per_actor } => {
                let actors: Vec<Uid> = roster.iter().map(|p| p.uid.clone()).collect();
                rotation::single_rotation(&actors, rounds_per_actor, &mut rand::rng())?
            }
            GameMode::Paired { questions_per_group } => {
                let mut groups: Vec<GroupId> =
                    roster.iter().filter_map(|p| p.group.clone()).collect();
                groups.sort();
                groups.dedup();
                rotation::paired_rounds(&groups, questions_per_group, &mut rand::rng())?
            }
        };

        let state = GameState {
            phase: Phase::Playing,
            rotation: Some(schedule),
            ..GameState::lobby()
        };
        self.store
            .write(
                &paths::room_state(&self.code),
                serde_json::to_value(&state).map_err(buzzroom_store::StoreError::from)?,
            )
            .await?;
        self.lifecycle.lock().await.arm(Phase::Playing).await;
        info!(code = %self.code, "game started");
        Ok(())
    }

    /// Advance the round cursor, clearing the lock in the same commit.
    /// Flips the phase to ended when the schedule is exhausted. Returns
    /// the phase after the advance.
    pub async fn advance_round(&self) -> Result<Phase> {
        self.require_owner()?;
        let state_path = paths::room_state(&self.code);
        let outcome = self
            .store
            .transaction(&state_path, |current| {
                let Some(raw) = current.filter(|v| !v.is_null()) else {
                    return TxDecision::Abort;
                };
                let Ok(mut state) = serde_json::from_value::<GameState>(raw.clone()) else {
                    return TxDecision::Abort;
                };
                if state.phase != Phase::Playing {
                    return TxDecision::Keep;
                }
                let total = state.rotation.as_ref().map_or(0, RotationSchedule::len);
                state.lock = Default::default();
                state.revealed = false;
                if state.current_round + 1 >= total {
                    state.phase = Phase::Ended;
                } else {
                    state.current_round += 1;
                }
                match serde_json::to_value(&state) {
                    Ok(v) => TxDecision::Set(v),
                    Err(_) => TxDecision::Abort,
                }
            })
            .await?;
        if !outcome.committed {
            return Err(CoordError::RoomGone(self.code.clone()));
        }
        let settled: GameState = outcome
            .value
            .map(serde_json::from_value)
            .transpose()
            .map_err(|source| CoordError::BadRecord {
                path: state_path.to_string(),
                source,
            })?
            .ok_or_else(|| CoordError::RoomGone(self.code.clone()))?;
        Ok(settled.phase)
    }

    /// Award points to the settled lock holder (or any participant the
    /// owner validates).
    pub async fn award(&self, uid: &Uid) -> Result<()> {
        self.require_owner()?;
        let points = self.config.buzzer.correct_points;
        self.adjust_score(uid, |p| {
            p.score += points;
        })
        .await
    }

    /// Penalize a wrong answer: deduct points (floored at zero) and start
    /// the lockout window.
    pub async fn penalize(&self, uid: &Uid) -> Result<()> {
        self.require_owner()?;
        let penalty = self.config.buzzer.wrong_penalty;
        let until = self
            .clock
            .now_ms()
            .saturating_add(i64::try_from(self.config.buzzer.lockout_ms).unwrap_or(i64::MAX));
        self.adjust_score(uid, |p| {
            p.score = (p.score - penalty).max(0);
            p.blocked_until = Some(until);
        })
        .await
    }

    async fn adjust_score(
        &self,
        uid: &Uid,
        mutate: impl Fn(&mut Participant) + Send + Sync,
    ) -> Result<()> {
        let player_path = paths::player(&self.code, uid);
        let outcome = self
            .store
            .transaction(&player_path, |current| {
                let Some(raw) = current.filter(|v| !v.is_null()) else {
                    return TxDecision::Abort;
                };
                let Ok(mut participant) = serde_json::from_value::<Participant>(raw.clone())
                else {
                    return TxDecision::Abort;
                };
                mutate(&mut participant);
                match serde_json::to_value(&participant) {
                    Ok(v) => TxDecision::Set(v),
                    Err(_) => TxDecision::Abort,
                }
            })
            .await?;
        if !outcome.committed {
            return Err(CoordError::RoomGone(self.code.clone()));
        }
        Ok(())
    }

    /// Assign a participant to a group (lobby bookkeeping, owner only).
    pub async fn assign_group(&self, uid: &Uid, group: GroupId) -> Result<()> {
        self.require_owner()?;
        let mut fields = Map::new();
        fields.insert("group".into(), json!(group.as_str()));
        self.store
            .update(&paths::player(&self.code, uid), fields)
            .await?;
        Ok(())
    }

    /// Remove a participant (owner only). Their watcher surfaces this as
    /// [`RoomEvent::Kicked`].
    pub async fn kick(&self, uid: &Uid) -> Result<()> {
        self.require_owner()?;
        self.store.remove(&paths::player(&self.code, uid)).await?;
        info!(code = %self.code, uid = %uid, "participant removed");
        Ok(())
    }

    /// Current roster, sorted by join time.
    pub async fn participants(&self) -> Result<Vec<Participant>> {
        let raw = self.store.read(&paths::players(&self.code)).await?;
        let mut roster = parse_roster(raw.as_ref());
        roster.sort_by_key(|p| p.joined_at);
        Ok(roster)
    }

    /// Live roster subscription (raw; parse with [`parse_roster`]).
    pub async fn watch_players(&self) -> Result<Subscription> {
        Ok(self.store.subscribe(&paths::players(&self.code)).await?)
    }

    /// Optimistic lock snapshot, display only.
    pub async fn lock_view(&self) -> Result<LockView> {
        let raw = self.store.read(&paths::room_state(&self.code)).await?;
        Ok(raw.as_ref().map(LockView::from_state_value).unwrap_or_default())
    }

    /// Who acts in the current round, per the settled schedule.
    pub async fn current_assignment(&self) -> Result<Option<RoundAssignment>> {
        let Some(raw) = self.store.read(&paths::room_state(&self.code)).await? else {
            return Ok(None);
        };
        let state: GameState =
            serde_json::from_value(raw).map_err(|source| CoordError::BadRecord {
                path: paths::room_state(&self.code).to_string(),
                source,
            })?;
        if state.phase != Phase::Playing {
            return Ok(None);
        }
        Ok(state
            .rotation
            .as_ref()
            .and_then(|schedule| schedule.assignment(state.current_round)))
    }

    /// Voluntary departure. The handle is inert afterwards.
    ///
    /// An owner leaving takes the room with them: there is nobody left to
    /// wait out a grace period for, and an open room without an owner
    /// record would sit there until its TTL.
    pub async fn leave(&mut self) -> Result<()> {
        self.voluntary.store(true, Ordering::SeqCst);
        self.retire_presence().await;
        self.lifecycle.lock().await.leave().await?;
        if self.is_owner {
            self.mark_closed().await?;
        }
        self.shutdown();
        Ok(())
    }

    /// Owner closes the room for everyone. Idempotent.
    pub async fn close_room(&mut self) -> Result<()> {
        self.require_owner()?;
        self.voluntary.store(true, Ordering::SeqCst);
        self.retire_presence().await;
        self.mark_closed().await?;
        self.shutdown();
        Ok(())
    }

    async fn mark_closed(&self) -> Result<()> {
        let mut fields = Map::new();
        fields.insert("status".into(), json!("closed"));
        fields.insert("closed_at".into(), server_timestamp());
        self.store
            .update(&paths::room_meta(&self.code), fields)
            .await?;
        info!(code = %self.code, "room closed by owner");
        Ok(())
    }

    /// Stop the heartbeat and reclaim the beacon to say an explicit
    /// goodbye. Best effort; the armed offline action covers failures.
    async fn retire_presence(&mut self) {
        let _ = self.heartbeat_stop.send(true);
        if let Some(task) = self.heartbeat.take() {
            match task.await {
                Ok(mut beacon) => {
                    if let Err(error) = beacon.retire().await {
                        warn!(code = %self.code, %error, "presence retire failed");
                    }
                }
                Err(error) => warn!(code = %self.code, %error, "heartbeat task panicked"),
            }
        }
    }

    fn require_owner(&self) -> Result<()> {
        if self.is_owner {
            Ok(())
        } else {
            Err(CoordError::Rejected {
                code: self.code.clone(),
                uid: self.uid.clone(),
            })
        }
    }

    fn shutdown(&mut self) {
        let _ = self.heartbeat_stop.send(true);
        if let Some(monitor) = self.monitor.take() {
            monitor.stop();
        }
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
        if let Some(task) = self.watcher.take() {
            task.abort();
        }
    }
}

impl<S: Store + Clone> Drop for RoomHandle<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Parse a raw `players` subtree into participant records, skipping
/// malformed entries.
pub fn parse_roster(raw: Option<&Value>) -> Vec<Participant> {
    let Some(map) = raw.and_then(Value::as_object) else {
        return Vec::new();
    };
    map.values()
        .filter_map(|v| match serde_json::from_value::<Participant>(v.clone()) {
            Ok(p) => Some(p),
            Err(error) => {
                warn!(%error, "skipping malformed participant record");
                None
            }
        })
        .collect()
}

async fn read_meta<S: Store>(store: &S, code: &RoomCode) -> Result<Option<RoomMeta>> {
    let path = paths::room_meta(code);
    match store.read(&path).await? {
        Some(raw) => Ok(Some(serde_json::from_value(raw).map_err(|source| {
            CoordError::BadRecord {
                path: path.to_string(),
                source,
            }
        })?)),
        None => Ok(None),
    }
}

async fn read_phase<S: Store>(store: &S, code: &RoomCode) -> Result<Option<Phase>> {
    let raw = store.read(&paths::room_state(code)).await?;
    Ok(raw
        .as_ref()
        .and_then(|v| v.get("phase"))
        .and_then(|p| serde_json::from_value(p.clone()).ok()))
}

/// Background watcher turning confirmed store changes into events and
/// keeping the lifecycle armed for the current phase.
#[allow(clippy::too_many_arguments)]
async fn spawn_room_watcher<S: Store + Clone>(
    store: S,
    code: RoomCode,
    uid: Uid,
    is_owner: bool,
    initial_phase: Phase,
    lifecycle: Arc<Mutex<ConnectionLifecycle<S>>>,
    events: broadcast::Sender<RoomEvent>,
    voluntary: Arc<AtomicBool>,
) -> Result<JoinHandle<()>> {
    let mut meta_sub = store.subscribe(&paths::room_meta(&code)).await?;
    let mut state_sub = store.subscribe(&paths::room_state(&code)).await?;
    let mut player_sub = store.subscribe(&paths::player(&code, &uid)).await?;
    // Snapshot before the task is spawned: a removal landing before the
    // task's first poll must still read as record-then-gone.
    let mut had_record = player_sub.current().is_some();

    Ok(tokio::spawn(async move {
        let mut phase = initial_phase;
        loop {
            tokio::select! {
                res = meta_sub.changed() => { if res.is_err() { break; } }
                res = state_sub.changed() => { if res.is_err() { break; } }
                res = player_sub.changed() => { if res.is_err() { break; } }
            }

            let meta_gone = match meta_sub.current() {
                None => true,
                Some(raw) => raw.get("status").and_then(Value::as_str) == Some("closed"),
            };
            if meta_gone {
                if !voluntary.load(Ordering::SeqCst) {
                    let _ = events.send(RoomEvent::Closed);
                }
                break;
            }

            if let Some(new_phase) = state_sub
                .current()
                .as_ref()
                .and_then(|v| v.get("phase"))
                .and_then(|p| serde_json::from_value::<Phase>(p.clone()).ok())
                && new_phase != phase
            {
                phase = new_phase;
                lifecycle.lock().await.arm(phase).await;
                let _ = events.send(RoomEvent::PhaseChanged(phase));
            }

            match player_sub.current() {
                Some(_) => had_record = true,
                None => {
                    if had_record && !is_owner && !voluntary.load(Ordering::SeqCst) {
                        debug!(code = %code, uid = %uid, "own record vanished, treating as kick");
                        let _ = events.send(RoomEvent::Kicked);
                        break;
                    }
                }
            }
        }
    }))
}
