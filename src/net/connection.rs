//! Connection identity and the process-wide open-connection counter.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Count currently open sessions (`clients_connected`)
//! - Let shutdown wait for sessions to drain

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::observability::metrics;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Counts open sessions.
///
/// Every accepted connection holds a [`ConnectionGuard`]; the count drops
/// when the guard does. The count lives in a watch channel and is only
/// changed under its lock, so readers and drain waiters never see a stale
/// value overwrite a newer one.
#[derive(Debug, Clone)]
pub struct ConnectionTracker {
    count_tx: Arc<watch::Sender<u64>>,
}

impl ConnectionTracker {
    /// Create a new connection tracker.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { count_tx: Arc::new(tx) }
    }

    /// Record a new open connection. Returns a guard that decrements on drop.
    pub fn track(&self) -> ConnectionGuard {
        let id = ConnectionId::new();
        self.update(|count| count + 1);
        ConnectionGuard {
            tracker: self.clone(),
            id,
        }
    }

    /// Get current open connection count.
    pub fn active_count(&self) -> u64 {
        *self.count_tx.borrow()
    }

    /// Wait until every tracked connection has closed, or `timeout` elapses.
    ///
    /// Returns `true` when the count reached zero.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let mut rx = self.count_tx.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|count| *count == 0))
            .await
            .map(|res| res.is_ok())
            .unwrap_or(false)
    }

    fn release(&self) {
        self.update(|count| count.saturating_sub(1));
    }

    fn update(&self, step: impl FnOnce(u64) -> u64) {
        self.count_tx.send_modify(|count| {
            *count = step(*count);
            metrics::record_clients_connected(*count);
        });
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that tracks a connection's lifetime.
/// Decrements the open count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: ConnectionTracker,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.tracker.release();
        tracing::trace!(connection_id = %self.id, "Connection released");
    }
}
