//! Connection sessions and the arena that keeps them alive until closed.
//!
//! # Responsibilities
//! - Own the write half of an accepted socket
//! - Count requests served and decide when keep-alive ends
//! - Close exactly once, whichever path asks first
//! - Transfer the raw socket to a worker process
//!
//! # Design Decisions
//! - The arena holds the only long-lived strong reference to a session; the
//!   terminal-close observer removes it, and removal drops the connection
//!   guard, so the open-connection count falls exactly once per session.
//! - The closed flag lives in a watch channel: flipping it is atomic, and the
//!   read loop can await it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::cluster::{HandoffError, WorkerEntry};
use crate::config::KeepAliveConfig;
use crate::net::connection::{ConnectionGuard, ConnectionId};

/// Callback fired once when a session reaches its terminal close.
pub type CloseObserver = Box<dyn FnOnce(ConnectionId) + Send + 'static>;

/// Errors writing to a session.
#[derive(Debug, thiserror::Error)]
pub enum ResponseError {
    /// The session was closed before or during the write.
    #[error("Session is closed")]
    SessionClosed,
    #[error("Write failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Server-side state of one accepted connection.
pub struct Session {
    id: ConnectionId,
    peer_addr: SocketAddr,
    keep_alive: KeepAliveConfig,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    closed: watch::Sender<bool>,
    observer: Mutex<Option<CloseObserver>>,
    requests_served: AtomicU32,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("requests_served", &self.requests_served())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    /// Create a session that writes responses to `writer`.
    pub fn new(
        id: ConnectionId,
        peer_addr: SocketAddr,
        keep_alive: KeepAliveConfig,
        writer: OwnedWriteHalf,
    ) -> Arc<Self> {
        Self::build(id, peer_addr, keep_alive, Some(writer))
    }

    /// Create a session with no stream attached, used on the handoff path.
    pub fn detached(id: ConnectionId, peer_addr: SocketAddr, keep_alive: KeepAliveConfig) -> Arc<Self> {
        Self::build(id, peer_addr, keep_alive, None)
    }

    fn build(
        id: ConnectionId,
        peer_addr: SocketAddr,
        keep_alive: KeepAliveConfig,
        writer: Option<OwnedWriteHalf>,
    ) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            id,
            peer_addr,
            keep_alive,
            writer: tokio::sync::Mutex::new(writer),
            closed,
            observer: Mutex::new(None),
            requests_served: AtomicU32::new(0),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn requests_served(&self) -> u32 {
        self.requests_served.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once the session has been closed.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Register the terminal-close observer.
    ///
    /// If the session is already closed the observer runs immediately.
    /// Registering again replaces an observer that has not fired yet.
    pub fn on_close(&self, observer: impl FnOnce(ConnectionId) + Send + 'static) {
        let mut slot = self.observer.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_closed() {
            drop(slot);
            observer(self.id);
            return;
        }
        *slot = Some(Box::new(observer));
    }

    /// Close the session.
    ///
    /// Idempotent: only the first call stops the read loop, drops the stream
    /// and fires the observer. Returns whether this call did the closing.
    pub fn close(&self) -> bool {
        let first = self.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        });
        if !first {
            return false;
        }

        // A writer busy mid-response drops the stream itself once it sees the flag.
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }

        let observer = self
            .observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(observer) = observer {
            observer(self.id);
        }

        tracing::debug!(
            connection_id = %self.id,
            peer_addr = %self.peer_addr,
            requests_served = self.requests_served(),
            "Session closed"
        );
        true
    }

    /// Count one fully parsed request. Returns the new total.
    pub(crate) fn record_request(&self) -> u32 {
        self.requests_served.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Whether the cycle for the `served`-th request is the session's last.
    pub fn is_last_request(&self, served: u32, client_wants_close: bool) -> bool {
        !self.keep_alive.enabled() || served >= self.keep_alive.max_requests || client_wants_close
    }

    /// Write raw bytes to the peer.
    ///
    /// A write still pending when the session closes is abandoned and the
    /// stream dropped, so a peer that stops reading cannot pin the socket.
    pub async fn write_all(&self, bytes: &[u8]) -> Result<(), ResponseError> {
        if self.is_closed() {
            return Err(ResponseError::SessionClosed);
        }
        let mut writer = tokio::select! {
            writer = self.writer.lock() => writer,
            _ = self.closed() => return Err(ResponseError::SessionClosed),
        };
        let Some(stream) = writer.as_mut() else {
            return Err(ResponseError::SessionClosed);
        };
        let written = tokio::select! {
            result = stream.write_all(bytes) => Some(result),
            _ = self.closed() => None,
        };
        match written {
            Some(result) => Ok(result?),
            None => {
                writer.take();
                Err(ResponseError::SessionClosed)
            }
        }
    }

    /// Drop the write half. Called by the read loop when it exits.
    pub(crate) async fn release_stream(&self) {
        self.writer.lock().await.take();
    }

    /// Transfer the raw connection to `worker`, then close this side.
    ///
    /// The stream is consumed either way: on success the worker owns the
    /// socket, on failure the connection is dropped. The session closes once
    /// in both cases.
    pub async fn hand_off(&self, stream: TcpStream, worker: &WorkerEntry) -> Result<(), HandoffError> {
        let result = worker.channel().send_stream(stream).await;
        self.close();
        result
    }
}

struct Retained {
    session: Arc<Session>,
    _guard: ConnectionGuard,
}

/// Keeps sessions alive from accept until terminal close.
#[derive(Clone, Default)]
pub struct SessionArena {
    inner: Arc<DashMap<ConnectionId, Retained>>,
}

impl SessionArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of `session` until it closes.
    ///
    /// `guard` is dropped when the session leaves the arena.
    pub fn retain(&self, session: Arc<Session>, guard: ConnectionGuard) {
        let id = session.id();
        self.inner.insert(
            id,
            Retained {
                session: Arc::clone(&session),
                _guard: guard,
            },
        );

        let arena: Weak<DashMap<ConnectionId, Retained>> = Arc::downgrade(&self.inner);
        session.on_close(move |id| {
            if let Some(arena) = arena.upgrade() {
                arena.remove(&id);
            }
        });
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Session>> {
        self.inner.get(&id).map(|entry| Arc::clone(&entry.session))
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Close every retained session.
    pub fn close_all(&self) {
        // Collect first: closing removes entries, which must not happen while
        // a shard guard is held.
        let sessions: Vec<Arc<Session>> = self
            .inner
            .iter()
            .map(|entry| Arc::clone(&entry.session))
            .collect();
        for session in sessions {
            session.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::ConnectionTracker;
    use std::sync::atomic::AtomicUsize;

    fn keep_alive(timeout_secs: u64, max_requests: u32) -> KeepAliveConfig {
        KeepAliveConfig {
            timeout_secs,
            max_requests,
        }
    }

    fn detached() -> Arc<Session> {
        Session::detached(
            ConnectionId::new(),
            "127.0.0.1:4000".parse().unwrap(),
            keep_alive(15, 3),
        )
    }

    #[test]
    fn close_fires_observer_once() {
        let session = detached();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        session.on_close(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(session.close());
        assert!(!session.close());
        assert!(!session.close());
        assert!(session.is_closed());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_close_decrements_once() {
        let tracker = ConnectionTracker::new();
        let arena = SessionArena::new();
        let guard = tracker.track();
        let session = Session::detached(
            guard.id(),
            "127.0.0.1:4000".parse().unwrap(),
            keep_alive(15, 3),
        );
        arena.retain(Arc::clone(&session), guard);
        assert_eq!(tracker.active_count(), 1);

        let closers: Vec<_> = (0..16)
            .map(|_| {
                let session = Arc::clone(&session);
                tokio::spawn(async move { session.close() })
            })
            .collect();
        let mut winners = 0;
        for closer in closers {
            if closer.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(tracker.active_count(), 0);
        assert!(arena.is_empty());
    }

    #[test]
    fn observer_registered_after_close_runs_immediately() {
        let session = detached();
        session.close();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        session.on_close(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn last_request_policy() {
        let session = detached();
        assert!(!session.is_last_request(1, false));
        assert!(session.is_last_request(1, true));
        assert!(session.is_last_request(3, false));

        let no_keep_alive = Session::detached(
            ConnectionId::new(),
            "127.0.0.1:4000".parse().unwrap(),
            keep_alive(0, 100),
        );
        assert!(no_keep_alive.is_last_request(1, false));
    }

    #[tokio::test]
    async fn write_after_close_is_refused() {
        let session = detached();
        session.close();
        assert!(matches!(
            session.write_all(b"late").await,
            Err(ResponseError::SessionClosed)
        ));
    }

    #[tokio::test]
    async fn closed_future_resolves() {
        let session = detached();
        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.closed().await })
        };
        session.close();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn close_abandons_blocked_write() {
        use tokio::io::AsyncReadExt;
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut peer = TcpStream::connect(listener.local_addr().unwrap()).await.unwrap();
        let (stream, peer_addr) = listener.accept().await.unwrap();
        let (_reader, writer) = stream.into_split();
        let session = Session::new(ConnectionId::new(), peer_addr, keep_alive(15, 3), writer);

        let pending = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.write_all(&vec![b'x'; 16 * 1024 * 1024]).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(!pending.is_finished());

        session.close();
        let result = tokio::time::timeout(std::time::Duration::from_secs(2), pending)
            .await
            .expect("write still blocked after close")
            .unwrap();
        assert!(matches!(result, Err(ResponseError::SessionClosed)));
        tokio::time::timeout(std::time::Duration::from_secs(2), session.release_stream())
            .await
            .expect("stream still locked after close");

        // The peer sees the write side end once it drains what was sent.
        let mut sink = vec![0u8; 64 * 1024];
        let drained = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                match peer.read(&mut sink).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        })
        .await;
        assert!(drained.is_ok());
    }

    #[test]
    fn close_all_empties_arena() {
        let tracker = ConnectionTracker::new();
        let arena = SessionArena::new();
        for _ in 0..3 {
            let guard = tracker.track();
            let session = Session::detached(
                guard.id(),
                "127.0.0.1:4000".parse().unwrap(),
                keep_alive(15, 3),
            );
            arena.retain(session, guard);
        }
        assert_eq!(arena.len(), 3);
        arena.close_all();
        assert!(arena.is_empty());
        assert_eq!(tracker.active_count(), 0);
    }
}
