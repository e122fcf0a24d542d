//! End-to-end coordination scenarios against the in-process store.

#![allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]

use std::collections::HashSet;
use std::time::Duration;

use buzzroom_core::{
    BuzzOutcome, CoordConfig, GameMode, GroupId, Phase, RejoinOutcome, RoomCode, RoomEvent,
    RoomHandle, RotationSchedule, ServerClock, Uid,
};
use buzzroom_store::{MemoryClient, MemoryStore, Store};
use serde_json::Value;

fn test_config() -> CoordConfig {
    let mut config = CoordConfig::default();
    config.rooms.owner_grace_ms = 120;
    config.presence.heartbeat_interval_ms = 50;
    config.buzzer.lockout_ms = 60_000;
    config
}

async fn owner_room(store: &MemoryStore) -> (RoomHandle<MemoryClient>, MemoryClient, RoomCode) {
    let client = store.client();
    let handle = RoomHandle::create(
        client.clone(),
        test_config(),
        ServerClock::new(),
        Uid::new("owner"),
        "olga",
    )
    .await
    .unwrap();
    let code = handle.code().clone();
    (handle, client, code)
}

async fn join(
    store: &MemoryStore,
    code: &RoomCode,
    uid: &str,
    name: &str,
) -> (RoomHandle<MemoryClient>, MemoryClient) {
    let client = store.client();
    let handle = RoomHandle::join(
        client.clone(),
        test_config(),
        ServerClock::new(),
        code.clone(),
        Uid::new(uid),
        name,
    )
    .await
    .unwrap();
    (handle, client)
}

async fn recv_event(
    rx: &mut tokio::sync::broadcast::Receiver<RoomEvent>,
    want: RoomEvent,
) -> bool {
    loop {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Ok(event)) if event == want => return true,
            Ok(Ok(_)) => {}
            _ => return false,
        }
    }
}

#[tokio::test]
async fn create_seeds_meta_state_and_owner_record() {
    let store = MemoryStore::new();
    let (owner, client, code) = owner_room(&store).await;

    let meta = client
        .read(&buzzroom_core::paths::room_meta(&code))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(meta["status"], Value::String("open".into()));
    assert_eq!(meta["owner_uid"], Value::String("owner".into()));

    let roster = owner.participants().await.unwrap();
    assert_eq!(roster.len(), 1);
    assert_eq!(roster[0].uid, Uid::new("owner"));
}

#[tokio::test]
async fn concurrent_buzzes_settle_with_exactly_one_winner() {
    let store = MemoryStore::new();
    let (owner, _client, code) = owner_room(&store).await;

    let mut handles = Vec::new();
    for i in 0..5 {
        let (h, _) = join(&store, &code, &format!("u{i}"), &format!("player {i}")).await;
        handles.push(h);
    }
    owner.start_game(GameMode::Single { rounds_per_actor: 1 }).await.unwrap();
    owner.reveal().await.unwrap();

    let mut tasks = Vec::new();
    for handle in &handles {
        let fut = handle.buzz();
        tasks.push(fut);
    }
    let outcomes = settle_all(tasks).await;

    let won = outcomes
        .iter()
        .filter(|o| matches!(o, BuzzOutcome::Won { .. }))
        .count();
    let lost = outcomes
        .iter()
        .filter(|o| matches!(o, BuzzOutcome::Lost { .. }))
        .count();
    assert_eq!(won, 1);
    assert_eq!(lost, 4);

    // Everyone who lost saw the same holder.
    let holders: HashSet<&Uid> = outcomes
        .iter()
        .filter_map(|o| match o {
            BuzzOutcome::Lost { holder } => Some(holder),
            _ => None,
        })
        .collect();
    assert_eq!(holders.len(), 1);
}

// The handles all live on this test's stack, so the presses settle
// sequentially here; true interleaved contention is exercised at the store
// transaction level in the buzzer unit tests.
async fn settle_all(
    tasks: Vec<impl std::future::Future<Output = buzzroom_core::Result<BuzzOutcome>>>,
) -> Vec<BuzzOutcome> {
    let mut outcomes = Vec::new();
    for task in tasks {
        outcomes.push(task.await.unwrap());
    }
    outcomes
}

#[tokio::test]
async fn penalized_participant_is_blocked_until_lockout_elapses() {
    let store = MemoryStore::new();
    let (owner, _client, code) = owner_room(&store).await;
    let (player, _) = join(&store, &code, "u1", "ana").await;
    let (other, _) = join(&store, &code, "u2", "bo").await;

    owner.start_game(GameMode::Single { rounds_per_actor: 1 }).await.unwrap();
    owner.reveal().await.unwrap();

    assert!(matches!(
        player.buzz().await.unwrap(),
        BuzzOutcome::Won { .. }
    ));
    owner.penalize(player.uid()).await.unwrap();
    owner.release_lock().await.unwrap();

    // The penalized player cannot re-take the lock; someone else can.
    assert!(matches!(
        player.buzz().await.unwrap(),
        BuzzOutcome::Blocked { .. }
    ));
    assert!(matches!(
        other.buzz().await.unwrap(),
        BuzzOutcome::Won { .. }
    ));

    let roster = owner.participants().await.unwrap();
    let ana = roster.iter().find(|p| p.uid == Uid::new("u1")).unwrap();
    assert_eq!(ana.score, 0, "penalty floors at zero");
}

#[tokio::test]
async fn award_credits_the_settled_holder() {
    let store = MemoryStore::new();
    let (owner, _client, code) = owner_room(&store).await;
    let (player, _) = join(&store, &code, "u1", "ana").await;

    owner.start_game(GameMode::Single { rounds_per_actor: 1 }).await.unwrap();
    owner.reveal().await.unwrap();
    assert!(matches!(
        player.buzz().await.unwrap(),
        BuzzOutcome::Won { .. }
    ));
    owner.award(player.uid()).await.unwrap();

    let roster = owner.participants().await.unwrap();
    let ana = roster.iter().find(|p| p.uid == Uid::new("u1")).unwrap();
    assert_eq!(ana.score, 100);
}

#[tokio::test]
async fn paired_rotation_covers_all_ordered_pairs_without_self_pairing() {
    let store = MemoryStore::new();
    let (owner, client, code) = owner_room(&store).await;
    for (uid, group) in [("u1", "reds"), ("u2", "blues"), ("u3", "greens")] {
        let (h, _) = join(&store, &code, uid, uid).await;
        owner
            .assign_group(h.uid(), GroupId::new(group))
            .await
            .unwrap();
        // Dropping the handle keeps the record; hooks only fire on sever.
        drop(h);
    }

    owner
        .start_game(GameMode::Paired {
            questions_per_group: 1,
        })
        .await
        .unwrap();

    let state = client
        .read(&buzzroom_core::paths::room_state(&code))
        .await
        .unwrap()
        .unwrap();
    let schedule: RotationSchedule =
        serde_json::from_value(state["rotation"].clone()).unwrap();
    let RotationSchedule::Paired { rounds } = schedule else {
        panic!("expected a paired schedule");
    };
    assert_eq!(rounds.len(), 6, "3 groups, one question each: 3*2 rounds");
    assert!(rounds.iter().all(|r| r.acting != r.target));
    let pairs: HashSet<(String, String)> = rounds
        .iter()
        .map(|r| (r.acting.to_string(), r.target.to_string()))
        .collect();
    assert_eq!(pairs.len(), 6);
}

#[tokio::test]
async fn start_game_refuses_underfilled_groups_without_writing() {
    let store = MemoryStore::new();
    let (owner, client, code) = owner_room(&store).await;
    let (h, _) = join(&store, &code, "u1", "ana").await;
    owner.assign_group(h.uid(), GroupId::new("reds")).await.unwrap();

    let err = owner
        .start_game(GameMode::Paired {
            questions_per_group: 1,
        })
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        buzzroom_core::CoordError::NotEnoughGroups { .. }
    ));

    let state = client
        .read(&buzzroom_core::paths::room_state(&code))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state["phase"], Value::String("lobby".into()));
}

#[tokio::test]
async fn advance_round_clears_lock_and_ends_after_schedule() {
    let store = MemoryStore::new();
    let (owner, _client, code) = owner_room(&store).await;
    let (player, _) = join(&store, &code, "u1", "ana").await;

    owner.start_game(GameMode::Single { rounds_per_actor: 1 }).await.unwrap();
    owner.reveal().await.unwrap();
    assert!(matches!(
        player.buzz().await.unwrap(),
        BuzzOutcome::Won { .. }
    ));

    // Two participants, one round each.
    let phase = owner.advance_round().await.unwrap();
    assert_eq!(phase, Phase::Playing);
    let view = owner.lock_view().await.unwrap();
    assert!(view.holder_uid.is_none(), "advance released the lock");

    let phase = owner.advance_round().await.unwrap();
    assert_eq!(phase, Phase::Ended);
    assert!(owner.current_assignment().await.unwrap().is_none());
}

#[tokio::test]
async fn lobby_disconnect_removes_player_and_playing_disconnect_marks() {
    let store = MemoryStore::new();
    let (owner, client, code) = owner_room(&store).await;

    let (lobby_player, lobby_client) = join(&store, &code, "u1", "ana").await;
    drop(lobby_player);
    lobby_client.sever().await;
    assert!(
        client
            .read(&buzzroom_core::paths::player(&code, &Uid::new("u1")))
            .await
            .unwrap()
            .is_none(),
        "lobby leaver is removed outright"
    );

    let (playing_player, playing_client) = join(&store, &code, "u2", "bo").await;
    let mut events = playing_player.events();
    owner.start_game(GameMode::Single { rounds_per_actor: 1 }).await.unwrap();
    // The watcher re-arms the disconnect action for the playing phase
    // before it publishes the event, so this wait is the ordering fence.
    assert!(recv_event(&mut events, RoomEvent::PhaseChanged(Phase::Playing)).await);
    drop(playing_player);
    playing_client.sever().await;

    let record = client
        .read(&buzzroom_core::paths::player(&code, &Uid::new("u2")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record["status"], Value::String("disconnected".into()));
    assert!(record["disconnected_at"].is_i64());
    assert!(record.get("score").is_some(), "seat and score survive");
}

#[tokio::test]
async fn owner_grace_expiry_closes_the_room_for_everyone() {
    let store = MemoryStore::new();
    let (owner, owner_client, code) = owner_room(&store).await;
    let (player, _client) = join(&store, &code, "u1", "ana").await;
    let mut events = player.events();

    drop(owner);
    owner_client.sever().await;

    assert!(
        recv_event(&mut events, RoomEvent::Closed).await,
        "participant is told the room closed"
    );
    let meta = store
        .client()
        .read(&buzzroom_core::paths::room_meta(&code))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(meta["status"], Value::String("closed".into()));
}

#[tokio::test]
async fn owner_return_within_grace_keeps_the_room_open() {
    let store = MemoryStore::new();
    let (owner, owner_client, code) = owner_room(&store).await;
    let (_player, _client) = join(&store, &code, "u1", "ana").await;

    drop(owner);
    owner_client.sever().await;

    // Owner reattaches well inside the 120 ms grace window.
    let _owner = RoomHandle::join(
        store.client(),
        test_config(),
        ServerClock::new(),
        code.clone(),
        Uid::new("owner"),
        "olga",
    )
    .await
    .unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    let meta = store
        .client()
        .read(&buzzroom_core::paths::room_meta(&code))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(meta["status"], Value::String("open".into()));
}

#[tokio::test]
async fn hard_restart_in_lobby_rejoins_exactly_once() {
    let store = MemoryStore::new();
    let (_owner, client, code) = owner_room(&store).await;

    // First session joins, then the process dies without a goodbye.
    let (player, player_client) = join(&store, &code, "u1", "ana").await;
    drop(player);
    player_client.sever().await;
    assert!(
        client
            .read(&buzzroom_core::paths::player(&code, &Uid::new("u1")))
            .await
            .unwrap()
            .is_none()
    );

    // The restarted session reattaches and repairs its record once.
    let (mut player, _) = join(&store, &code, "u1", "ana").await;
    // join already re-created the record, so the guard finds it present.
    assert_eq!(
        player.ensure_rejoined().await.unwrap(),
        RejoinOutcome::AlreadyPresent
    );

    let roster_raw = client
        .read(&buzzroom_core::paths::players(&code))
        .await
        .unwrap()
        .unwrap();
    let records = roster_raw
        .as_object()
        .unwrap()
        .keys()
        .filter(|k| k.as_str() == "u1")
        .count();
    assert_eq!(records, 1, "exactly one record for the returned player");
}

#[tokio::test]
async fn guard_repairs_record_removed_by_a_late_disconnect_action() {
    let store = MemoryStore::new();
    let (_owner, client, code) = owner_room(&store).await;

    let (mut player, player_client) = join(&store, &code, "u1", "ana").await;
    // A stale session's removal fires while this session is live.
    player_client.sever().await;
    assert!(
        client
            .read(&buzzroom_core::paths::player(&code, &Uid::new("u1")))
            .await
            .unwrap()
            .is_none()
    );

    assert_eq!(
        player.ensure_rejoined().await.unwrap(),
        RejoinOutcome::Rejoined
    );
    assert!(
        client
            .read(&buzzroom_core::paths::player(&code, &Uid::new("u1")))
            .await
            .unwrap()
            .is_some()
    );
}

#[tokio::test]
async fn kicked_participant_gets_the_event() {
    let store = MemoryStore::new();
    let (owner, _client, code) = owner_room(&store).await;
    let (player, _) = join(&store, &code, "u1", "ana").await;
    let mut events = player.events();

    owner.kick(player.uid()).await.unwrap();
    assert!(recv_event(&mut events, RoomEvent::Kicked).await);
}

#[tokio::test]
async fn voluntary_leave_is_not_a_kick() {
    let store = MemoryStore::new();
    let (_owner, client, code) = owner_room(&store).await;
    let (mut player, _) = join(&store, &code, "u1", "ana").await;
    let mut events = player.events();

    player.leave().await.unwrap();
    assert!(
        client
            .read(&buzzroom_core::paths::player(&code, &Uid::new("u1")))
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        !recv_event(&mut events, RoomEvent::Kicked).await,
        "no kick event after leaving on purpose"
    );
}

#[tokio::test]
async fn joining_a_closed_room_is_room_gone() {
    let store = MemoryStore::new();
    let (mut owner, _client, code) = owner_room(&store).await;
    owner.close_room().await.unwrap();

    let result = RoomHandle::join(
        store.client(),
        test_config(),
        ServerClock::new(),
        code,
        Uid::new("u1"),
        "ana",
    )
    .await;
    assert!(matches!(
        result,
        Err(buzzroom_core::CoordError::RoomGone(_))
    ));
}

#[tokio::test]
async fn owner_leave_closes_the_room() {
    let store = MemoryStore::new();
    let (mut owner, _client, code) = owner_room(&store).await;
    let (player, _) = join(&store, &code, "u1", "ana").await;
    let mut events = player.events();

    owner.leave().await.unwrap();

    // No grace period applies: the owner said goodbye, nobody is coming
    // back, and the room must not sit open until its TTL.
    assert!(recv_event(&mut events, RoomEvent::Closed).await);
    let meta = store
        .client()
        .read(&buzzroom_core::paths::room_meta(&code))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(meta["status"], Value::String("closed".into()));
}

#[tokio::test]
async fn voluntary_leave_retires_the_presence_record() {
    let store = MemoryStore::new();
    let (_owner, client, code) = owner_room(&store).await;
    let (mut player, player_client) = join(&store, &code, "u1", "ana").await;

    let path = buzzroom_core::paths::presence(&code, &Uid::new("u1"));
    assert!(client.read(&path).await.unwrap().is_some());

    player.leave().await.unwrap();
    assert_eq!(
        client.read(&path).await.unwrap(),
        None,
        "presence record is withdrawn with the goodbye"
    );

    // The pending offline action was cancelled too; a later transport
    // drop must not resurrect the record.
    player_client.sever().await;
    assert_eq!(client.read(&path).await.unwrap(), None);
}

#[tokio::test]
async fn scoring_runs_on_spawned_tasks() {
    let store = MemoryStore::new();
    let (owner, _client, code) = owner_room(&store).await;
    let (player, _) = join(&store, &code, "u1", "ana").await;
    let uid = player.uid().clone();

    // Hosts drive scoring from their own tasks; the futures have to move.
    let owner = tokio::spawn(async move {
        owner.award(&uid).await.unwrap();
        owner
    })
    .await
    .unwrap();

    let roster = owner.participants().await.unwrap();
    let ana = roster.iter().find(|p| p.uid == Uid::new("u1")).unwrap();
    assert_eq!(ana.score, 100);
}
