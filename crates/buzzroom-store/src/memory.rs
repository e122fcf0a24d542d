//! In-process reference store.
//!
//! [`MemoryStore`] holds the whole tree as one `serde_json::Value` behind an
//! async mutex and implements the trait's semantics faithfully:
//! transactions are optimistic — the closure runs against a snapshot and is
//! re-run whenever another writer committed in between — and every
//! subscriber whose path overlaps a mutation gets the recomputed value.
//! Each [`MemoryClient`] is one "connection": disconnect actions are
//! registered per client and fired by [`MemoryClient::sever`], which stands
//! in for abrupt connection loss in tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value, json};
use tokio::sync::{Mutex, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::path::StorePath;
use crate::value::{apply_update, get_at, remove_at, resolve_sentinels, set_at};
use crate::{
    CancelDisconnect, CancelFuture, DisconnectAction, DisconnectHandle, Store, Subscription,
    TxDecision, TxOutcome,
};

/// Transaction reruns before giving up as contended.
const TX_RETRY_CAP: u32 = 25;

struct SubEntry {
    path: StorePath,
    tx: watch::Sender<Option<Value>>,
}

struct PendingAction {
    id: u64,
    path: StorePath,
    action: DisconnectAction,
}

struct TreeState {
    root: Value,
    /// Bumped on every committed mutation; transactions rebase on mismatch.
    version: u64,
    subs: Vec<SubEntry>,
    pending: HashMap<Uuid, Vec<PendingAction>>,
    denied: Vec<StorePath>,
}

struct Shared {
    state: Mutex<TreeState>,
    offset_ms: AtomicI64,
    next_action_id: AtomicU64,
}

impl Shared {
    fn now_ms(&self) -> i64 {
        let local = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX));
        local + self.offset_ms.load(Ordering::Relaxed)
    }
}

/// The shared tree. Cheap to clone; all clones see the same state.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let mut root = json!({});
        set_at(&mut root, &[".info", "clock_offset_ms"], json!(0));
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(TreeState {
                    root,
                    version: 0,
                    subs: Vec::new(),
                    pending: HashMap::new(),
                    denied: Vec::new(),
                }),
                offset_ms: AtomicI64::new(0),
                next_action_id: AtomicU64::new(1),
            }),
        }
    }

    /// Open a new client connection.
    pub fn client(&self) -> MemoryClient {
        MemoryClient {
            shared: Arc::clone(&self.shared),
            client_id: Uuid::new_v4(),
        }
    }

    /// Skew the store clock relative to the local one and publish the new
    /// offset at the well-known path.
    pub async fn set_clock_offset_ms(&self, offset: i64) {
        self.shared.offset_ms.store(offset, Ordering::Relaxed);
        let path = StorePath::new(".info/clock_offset_ms");
        let mut st = self.shared.state.lock().await;
        let segs: Vec<&str> = path.segments().collect();
        set_at(&mut st.root, &segs, json!(offset));
        st.version += 1;
        notify(&mut st, &path);
    }

    /// Reject all client writes at or below `path` (stand-in for store-side
    /// security rules; used to exercise the permission-denied surface).
    pub async fn deny_writes_under(&self, path: StorePath) {
        self.shared.state.lock().await.denied.push(path);
    }

    /// Lift a previous [`Self::deny_writes_under`] rule, standing in for a
    /// transient store-side failure clearing up.
    pub async fn allow_writes_under(&self, path: &StorePath) {
        self.shared.state.lock().await.denied.retain(|p| p != path);
    }

    /// Store-clock milliseconds (local time + configured offset).
    pub fn now_ms(&self) -> i64 {
        self.shared.now_ms()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// One client connection to a [`MemoryStore`].
#[derive(Clone)]
pub struct MemoryClient {
    shared: Arc<Shared>,
    client_id: Uuid,
}

impl MemoryClient {
    /// Simulate abrupt connection loss: fire every pending disconnect
    /// action this client registered, in registration order. The client
    /// itself stays usable, standing in for the transport reconnecting.
    pub async fn sever(&self) {
        let now = self.shared.now_ms();
        let mut st = self.shared.state.lock().await;
        let actions = st.pending.remove(&self.client_id).unwrap_or_default();
        for pending in actions {
            debug!(path = %pending.path, id = pending.id, "firing disconnect action");
            apply_action(&mut st, &pending.path, pending.action, now);
        }
    }

    fn check_allowed(st: &TreeState, path: &StorePath) -> Result<()> {
        if st.denied.iter().any(|p| p.contains(path)) {
            return Err(StoreError::PermissionDenied {
                path: path.to_string(),
            });
        }
        Ok(())
    }
}

fn notify(st: &mut TreeState, mutated: &StorePath) {
    let TreeState { root, subs, .. } = st;
    subs.retain(|sub| {
        if sub.tx.is_closed() {
            return false;
        }
        if !sub.path.overlaps(mutated) {
            return true;
        }
        let segs: Vec<&str> = sub.path.segments().collect();
        sub.tx.send(get_at(root, &segs).cloned()).is_ok()
    });
}

fn apply_action(st: &mut TreeState, path: &StorePath, action: DisconnectAction, now_ms: i64) {
    let segs: Vec<&str> = path.segments().collect();
    match action {
        DisconnectAction::Remove => remove_at(&mut st.root, &segs),
        DisconnectAction::Update(mut fields) => {
            for v in fields.values_mut() {
                resolve_sentinels(v, now_ms);
            }
            apply_update(&mut st.root, &segs, fields);
        }
        DisconnectAction::Write(mut value) => {
            resolve_sentinels(&mut value, now_ms);
            set_at(&mut st.root, &segs, value);
        }
    }
    st.version += 1;
    notify(st, path);
}

struct MemoryCancel {
    shared: Arc<Shared>,
    client_id: Uuid,
    action_id: u64,
}

impl CancelDisconnect for MemoryCancel {
    fn cancel(self: Box<Self>) -> CancelFuture {
        Box::pin(async move {
            let mut st = self.shared.state.lock().await;
            if let Some(actions) = st.pending.get_mut(&self.client_id) {
                actions.retain(|a| a.id != self.action_id);
            }
            Ok(())
        })
    }
}

impl Store for MemoryClient {
    async fn read(&self, path: &StorePath) -> Result<Option<Value>> {
        let st = self.shared.state.lock().await;
        let segs: Vec<&str> = path.segments().collect();
        Ok(get_at(&st.root, &segs).cloned())
    }

    async fn write(&self, path: &StorePath, mut value: Value) -> Result<()> {
        resolve_sentinels(&mut value, self.shared.now_ms());
        let mut st = self.shared.state.lock().await;
        Self::check_allowed(&st, path)?;
        let segs: Vec<&str> = path.segments().collect();
        set_at(&mut st.root, &segs, value);
        st.version += 1;
        notify(&mut st, path);
        Ok(())
    }

    async fn update(&self, path: &StorePath, mut fields: Map<String, Value>) -> Result<()> {
        let now = self.shared.now_ms();
        for v in fields.values_mut() {
            resolve_sentinels(v, now);
        }
        let mut st = self.shared.state.lock().await;
        Self::check_allowed(&st, path)?;
        let segs: Vec<&str> = path.segments().collect();
        apply_update(&mut st.root, &segs, fields);
        st.version += 1;
        notify(&mut st, path);
        Ok(())
    }

    async fn remove(&self, path: &StorePath) -> Result<()> {
        let mut st = self.shared.state.lock().await;
        Self::check_allowed(&st, path)?;
        let segs: Vec<&str> = path.segments().collect();
        remove_at(&mut st.root, &segs);
        st.version += 1;
        notify(&mut st, path);
        Ok(())
    }

    async fn subscribe(&self, path: &StorePath) -> Result<Subscription> {
        let mut st = self.shared.state.lock().await;
        let segs: Vec<&str> = path.segments().collect();
        let initial = get_at(&st.root, &segs).cloned();
        let (tx, rx) = watch::channel(initial);
        st.subs.push(SubEntry {
            path: path.clone(),
            tx,
        });
        Ok(Subscription::new(rx))
    }

    async fn transaction<F>(&self, path: &StorePath, mut f: F) -> Result<TxOutcome>
    where
        F: FnMut(Option<&Value>) -> TxDecision + Send,
    {
        let segs: Vec<&str> = path.segments().collect();
        for attempt in 0..TX_RETRY_CAP {
            // Snapshot outside the commit so a concurrent writer forces a
            // rebase instead of being overwritten.
            let (snapshot, seen_version) = {
                let st = self.shared.state.lock().await;
                (get_at(&st.root, &segs).cloned(), st.version)
            };
            let decision = f(snapshot.as_ref());

            let mut st = self.shared.state.lock().await;
            if st.version != seen_version {
                debug!(path = %path, attempt, "transaction rebased");
                continue;
            }
            return match decision {
                TxDecision::Set(mut value) => {
                    Self::check_allowed(&st, path)?;
                    resolve_sentinels(&mut value, self.shared.now_ms());
                    set_at(&mut st.root, &segs, value);
                    st.version += 1;
                    notify(&mut st, path);
                    Ok(TxOutcome {
                        committed: true,
                        value: get_at(&st.root, &segs).cloned(),
                    })
                }
                TxDecision::Keep => Ok(TxOutcome {
                    committed: true,
                    value: snapshot,
                }),
                TxDecision::Abort => Ok(TxOutcome {
                    committed: false,
                    value: snapshot,
                }),
            };
        }
        warn!(path = %path, "transaction contention cap reached");
        Err(StoreError::Transient(format!(
            "transaction at {path} exceeded {TX_RETRY_CAP} attempts"
        )))
    }

    async fn on_disconnect(
        &self,
        path: &StorePath,
        action: DisconnectAction,
    ) -> Result<DisconnectHandle> {
        let action_id = self.shared.next_action_id.fetch_add(1, Ordering::Relaxed);
        let mut st = self.shared.state.lock().await;
        Self::check_allowed(&st, path)?;
        st.pending.entry(self.client_id).or_default().push(PendingAction {
            id: action_id,
            path: path.clone(),
            action,
        });
        Ok(DisconnectHandle::new(Box::new(MemoryCancel {
            shared: Arc::clone(&self.shared),
            client_id: self.client_id,
            action_id,
        })))
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_read_remove() {
        let store = MemoryStore::new();
        let client = store.client();
        let path = StorePath::new("rooms/ABCD/meta");

        client.write(&path, json!({"code": "ABCD"})).await.unwrap();
        assert_eq!(
            client.read(&path).await.unwrap(),
            Some(json!({"code": "ABCD"}))
        );

        client.remove(&path).await.unwrap();
        assert_eq!(client.read(&path).await.unwrap(), None);
    }

    #[tokio::test]
    async fn subscription_sees_descendant_writes() {
        let store = MemoryStore::new();
        let client = store.client();
        let players = StorePath::new("rooms/ABCD/players");

        let mut sub = client.subscribe(&players).await.unwrap();
        assert_eq!(sub.current(), None);

        client
            .write(&players.child("u1"), json!({"name": "ana"}))
            .await
            .unwrap();
        sub.changed().await.unwrap();
        assert_eq!(sub.current(), Some(json!({"u1": {"name": "ana"}})));

        // A write *above* the subscription replaces its subtree too.
        client
            .write(&StorePath::new("rooms/ABCD"), json!({"meta": {}}))
            .await
            .unwrap();
        sub.changed().await.unwrap();
        assert_eq!(sub.current(), None);
    }

    #[tokio::test]
    async fn transaction_claims_once_under_contention() {
        let store = MemoryStore::new();
        let path = StorePath::new("rooms/ABCD/state/lock_uid");

        let mut handles = Vec::new();
        for i in 0..8 {
            let client = store.client();
            let path = path.clone();
            let uid = format!("u{i}");
            handles.push(tokio::spawn(async move {
                let outcome = client
                    .transaction(&path, |cur| match cur {
                        Some(v) if !v.is_null() => TxDecision::Keep,
                        _ => TxDecision::Set(json!(uid)),
                    })
                    .await
                    .unwrap();
                (uid, outcome)
            }));
        }

        let mut winners = 0;
        for handle in handles {
            let (uid, outcome) = handle.await.unwrap();
            assert!(outcome.committed);
            if outcome.value == Some(json!(uid)) {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn disconnect_action_fires_on_sever_unless_cancelled() {
        let store = MemoryStore::new();
        let client = store.client();
        let path = StorePath::new("rooms/ABCD/players/u1");

        client.write(&path, json!({"name": "ana"})).await.unwrap();
        let handle = client
            .on_disconnect(&path, DisconnectAction::Remove)
            .await
            .unwrap();
        handle.cancel().await.unwrap();
        client.sever().await;
        assert!(client.read(&path).await.unwrap().is_some());

        client
            .on_disconnect(&path, DisconnectAction::Remove)
            .await
            .unwrap();
        client.sever().await;
        assert_eq!(client.read(&path).await.unwrap(), None);
    }

    #[tokio::test]
    async fn disconnect_update_resolves_server_timestamp() {
        let store = MemoryStore::new();
        store.set_clock_offset_ms(5_000).await;
        let client = store.client();
        let path = StorePath::new("rooms/ABCD/players/u1");
        client
            .write(&path, json!({"name": "ana", "status": "active"}))
            .await
            .unwrap();

        let mut fields = Map::new();
        fields.insert("status".into(), json!("disconnected"));
        fields.insert("disconnected_at".into(), crate::server_timestamp());
        client
            .on_disconnect(&path, DisconnectAction::Update(fields))
            .await
            .unwrap();
        client.sever().await;

        let record = client.read(&path).await.unwrap().unwrap();
        assert_eq!(record["status"], json!("disconnected"));
        let stamped = record["disconnected_at"].as_i64().unwrap();
        // Stamped with the store clock, which is skewed +5s from local.
        assert!(stamped >= store.now_ms() - 1_000);
    }

    #[tokio::test]
    async fn denied_paths_reject_writes() {
        let store = MemoryStore::new();
        store
            .deny_writes_under(StorePath::new("rooms/ABCD/players"))
            .await;
        let client = store.client();

        let err = client
            .write(&StorePath::new("rooms/ABCD/players/u1"), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::PermissionDenied { .. }));

        // Sibling subtree unaffected.
        client
            .write(&StorePath::new("rooms/ABCD/meta"), json!({"code": "ABCD"}))
            .await
            .unwrap();
    }

    #[test]
    fn disconnect_handles_move_across_tasks() {
        // Handles end up inside long-lived components that spawned tasks
        // borrow, so they have to be both Send and Sync.
        fn assert_shareable<T: Send + Sync>() {}
        assert_shareable::<DisconnectHandle>();
    }

    #[tokio::test]
    async fn clock_offset_published_at_well_known_path() {
        let store = MemoryStore::new();
        let client = store.client();
        let mut sub = client.subscribe(&client.clock_offset_path()).await.unwrap();
        assert_eq!(sub.current(), Some(json!(0)));

        store.set_clock_offset_ms(-250).await;
        sub.changed().await.unwrap();
        assert_eq!(sub.current(), Some(json!(-250)));
    }
}
