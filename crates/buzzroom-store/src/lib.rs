//! buzzroom store interface.
//!
//! The coordination layer talks to one shared, path-addressable realtime
//! store: a JSON tree with per-path linearizable transactions, change
//! notifications, and disconnect-triggered mutations. This crate defines
//! that seam as the [`Store`] trait plus the operation types, and ships an
//! in-process reference implementation ([`MemoryStore`]) with the same
//! semantics so the layer above is testable without network mocking.
//!
//! Guarantees the trait encodes (and `MemoryStore` honors):
//! - transactions against the *same* path are linearized; a losing writer's
//!   closure is re-run against the latest committed value,
//! - notification delivery order across *different* paths is unspecified,
//! - a registered disconnect action fires at most once, only if it has not
//!   been cancelled before the connection was lost.

mod error;
mod memory;
mod path;
mod value;

use std::future::Future;
use std::pin::Pin;

use serde_json::{Map, Value};
use tokio::sync::watch;

pub use error::{Result, StoreError};
pub use memory::{MemoryClient, MemoryStore};
pub use path::StorePath;
pub use value::{server_timestamp, set_value_at, value_at};

/// What a transaction closure decided after seeing the current value.
#[derive(Debug, Clone)]
pub enum TxDecision {
    /// Commit this value at the path.
    Set(Value),
    /// Commit nothing; the current value stands. Still a successful commit
    /// (this is how "I lost the race" is expressed without failing).
    Keep,
    /// Do not commit at all (e.g. the target no longer exists).
    Abort,
}

/// Settled result of a transaction.
///
/// `value` is the value the store holds at the path *after* the transaction
/// settled. Decisions that affect game outcomes must be made from this
/// value, never from an optimistic local echo.
#[derive(Debug, Clone)]
pub struct TxOutcome {
    pub committed: bool,
    pub value: Option<Value>,
}

/// Mutation the store runs server-side when the registering client vanishes.
#[derive(Debug, Clone)]
pub enum DisconnectAction {
    /// Delete the node at the registered path.
    Remove,
    /// Shallow-merge these fields at the registered path.
    Update(Map<String, Value>),
    /// Replace the node at the registered path.
    Write(Value),
}

type CancelFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

pub(crate) trait CancelDisconnect: Send + Sync {
    fn cancel(self: Box<Self>) -> CancelFuture;
}

/// Lease on a pending disconnect action.
///
/// Must be cancelled before registering a replacement for the same path, so
/// two pending actions never race each other. Dropping the handle does
/// *not* cancel the action: once registered, it stays armed until cancelled
/// or fired.
pub struct DisconnectHandle {
    inner: Box<dyn CancelDisconnect>,
}

impl DisconnectHandle {
    pub(crate) fn new(inner: Box<dyn CancelDisconnect>) -> Self {
        Self { inner }
    }

    /// Withdraw the pending action. Idempotent; cancelling an action that
    /// already fired is a no-op.
    pub async fn cancel(self) -> Result<()> {
        self.inner.cancel().await
    }
}

impl std::fmt::Debug for DisconnectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DisconnectHandle").finish_non_exhaustive()
    }
}

/// Live subscription to one path.
///
/// Carries the latest confirmed value through a watch channel; dropping the
/// subscription unsubscribes. The first value is delivered immediately.
#[derive(Debug, Clone)]
pub struct Subscription {
    rx: watch::Receiver<Option<Value>>,
}

impl Subscription {
    pub(crate) fn new(rx: watch::Receiver<Option<Value>>) -> Self {
        Self { rx }
    }

    /// Latest confirmed value at the subscribed path.
    pub fn current(&self) -> Option<Value> {
        self.rx.borrow().clone()
    }

    /// Wait for the next change notification.
    ///
    /// Returns `Disconnected` once the store side is gone.
    pub async fn changed(&mut self) -> Result<()> {
        self.rx
            .changed()
            .await
            .map_err(|_| StoreError::Disconnected)
    }

    /// The raw watch receiver, for `tokio::select!` loops.
    pub fn receiver(&self) -> watch::Receiver<Option<Value>> {
        self.rx.clone()
    }
}

/// One client connection to the shared store.
///
/// All operations are async and settle with either the confirmed result or
/// an error; none of them block.
pub trait Store: Send + Sync + 'static {
    /// Read the value at `path` (`None` when absent).
    fn read(&self, path: &StorePath) -> impl Future<Output = Result<Option<Value>>> + Send;

    /// Replace the value at `path`. Writing null removes the node.
    fn write(&self, path: &StorePath, value: Value) -> impl Future<Output = Result<()>> + Send;

    /// Shallow-merge `fields` at `path`; keys may contain slashes for deep
    /// relative writes, null values remove.
    fn update(
        &self,
        path: &StorePath,
        fields: Map<String, Value>,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Delete the node at `path`.
    fn remove(&self, path: &StorePath) -> impl Future<Output = Result<()>> + Send;

    /// Subscribe to confirmed-state changes at `path`.
    fn subscribe(&self, path: &StorePath) -> impl Future<Output = Result<Subscription>> + Send;

    /// Run `f` against the current value at `path` as an atomic
    /// read-modify-write. If a concurrent writer commits first, `f` is
    /// re-run against the latest value until the commit applies cleanly.
    fn transaction<F>(
        &self,
        path: &StorePath,
        f: F,
    ) -> impl Future<Output = Result<TxOutcome>> + Send
    where
        F: FnMut(Option<&Value>) -> TxDecision + Send;

    /// Register a mutation the store executes if this client's connection
    /// is lost. The returned handle must be cancelled before a replacement
    /// is registered for the same concern.
    fn on_disconnect(
        &self,
        path: &StorePath,
        action: DisconnectAction,
    ) -> impl Future<Output = Result<DisconnectHandle>> + Send;

    /// Milliseconds of the store's well-known clock-offset path.
    ///
    /// `local_now + offset` approximates the store's clock; used for coarse
    /// cross-client time sync, never for correctness.
    fn clock_offset_path(&self) -> StorePath {
        StorePath::new(".info/clock_offset_ms")
    }
}
