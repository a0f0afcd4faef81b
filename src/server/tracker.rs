//! Connection ids and live work counters.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Global atomic counter for connection IDs.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection or datagram worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

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

#[derive(Debug, Default)]
struct Inner {
    active: AtomicUsize,
    idle: Notify,
}

/// Counts in-flight workers so a listener can drain them on shutdown.
#[derive(Debug, Clone, Default)]
pub struct ActiveTracker {
    inner: Arc<Inner>,
}

impl ActiveTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new worker. The returned guard decrements on drop.
    pub fn track(&self) -> ActiveGuard {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        ActiveGuard {
            inner: Arc::clone(&self.inner),
            id: ConnectionId::new(),
        }
    }

    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Waits until no workers remain. Returns `false` if `deadline` passed
    /// first.
    pub async fn wait_idle(&self, deadline: Option<Instant>) -> bool {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.active() == 0 {
                return true;
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return self.active() == 0;
                    }
                }
                None => notified.await,
            }
        }
    }
}

/// Guard that tracks one worker's lifetime.
#[derive(Debug)]
pub struct ActiveGuard {
    inner: Arc<Inner>,
    id: ConnectionId,
}

impl ActiveGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if self.inner.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
        tracing::trace!(connection_id = %self.id, "Worker finished");
    }
}
