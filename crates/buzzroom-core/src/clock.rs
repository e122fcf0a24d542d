//! Coarse store-clock sync.
//!
//! The store publishes its clock offset at a well-known path; `local_now +
//! offset` approximates the store's clock. Good enough for countdown display
//! and lockout checks; every correctness decision still goes through store
//! transactions with server-stamped timestamps.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use serde_json::Value;
use tracing::debug;

use buzzroom_store::Store;

use crate::error::Result;

/// Shared view of the store's clock.
#[derive(Debug, Clone, Default)]
pub struct ServerClock {
    offset_ms: Arc<AtomicI64>,
}

impl ServerClock {
    /// Clock with zero offset; tracks nothing until [`Self::sync`] runs.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixed-offset clock for tests.
    pub fn with_offset_ms(offset_ms: i64) -> Self {
        let clock = Self::new();
        clock.offset_ms.store(offset_ms, Ordering::Relaxed);
        clock
    }

    /// Subscribe to the store's offset path and keep the offset current.
    ///
    /// Spawns a background task that follows offset updates until the store
    /// side goes away.
    pub async fn sync<S: Store>(&self, store: &S) -> Result<()> {
        let mut sub = store.subscribe(&store.clock_offset_path()).await?;
        let offset = Arc::clone(&self.offset_ms);
        apply(&offset, sub.current());
        tokio::spawn(async move {
            while sub.changed().await.is_ok() {
                apply(&offset, sub.current());
            }
            debug!("clock offset subscription closed");
        });
        Ok(())
    }

    /// Current offset between the store clock and the local clock.
    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    /// Approximate store time, in milliseconds since the epoch.
    pub fn now_ms(&self) -> i64 {
        local_now_ms() + self.offset_ms()
    }
}

fn apply(offset: &AtomicI64, value: Option<Value>) {
    if let Some(ms) = value.as_ref().and_then(Value::as_i64) {
        offset.store(ms, Ordering::Relaxed);
    }
}

fn local_now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use buzzroom_store::MemoryStore;

    use super::*;

    #[tokio::test]
    async fn tracks_published_offset() {
        let store = MemoryStore::new();
        store.set_clock_offset_ms(2_500).await;

        let clock = ServerClock::new();
        clock.sync(&store.client()).await.unwrap();
        assert_eq!(clock.offset_ms(), 2_500);

        store.set_clock_offset_ms(-400).await;
        for _ in 0..100 {
            if clock.offset_ms() == -400 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(clock.offset_ms(), -400);
    }

    #[test]
    fn fixed_offset_shifts_now() {
        let ahead = ServerClock::with_offset_ms(10_000);
        let level = ServerClock::new();
        assert!(ahead.now_ms() >= level.now_ms() + 9_000);
    }
}
