//! Accept loop and per-session read loop.
//!
//! # Connection States
//! ```text
//! Accepted → Transferring → Closed          (master with live workers)
//! Accepted → Parsing ⇄ Delivered → Closed   (standalone, worker, idle master)
//! ```
//!
//! # Design Decisions
//! - Dispatch happens inline in the accept loop, so round-robin order and
//!   per-worker handle order follow accept order.
//! - Each session owns its parser and buffer; requests on one connection are
//!   delivered one at a time, the next only after the previous response cycle
//!   completes.
//! - After a parse error with keep-alive on, the session discards input until
//!   the peer leaves or the idle deadline passes.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::broadcast;

use crate::cluster::{ClusterView, HandleReceiver, RoundRobin, WorkerEntry};
use crate::config::{Role, ServerConfig};
use crate::http::handler::{HandlerInput, RequestHandler};
use crate::http::parser::{wants_close, Http1Parser, Request, RequestParser};
use crate::http::response::ResponseChannel;
use crate::net::connection::{ConnectionGuard, ConnectionTracker};
use crate::net::error::ServeError;
use crate::net::listener::Listener;
use crate::net::session::{Session, SessionArena};
use crate::observability::metrics;

const READ_BUFFER_SIZE: usize = 8 * 1024;
const ACCEPT_ERROR_PAUSE: Duration = Duration::from_millis(100);

enum Flow {
    Continue,
    Stop,
}

enum ReadOutcome {
    Data,
    Eof,
    IdleTimeout,
    Failed(std::io::Error),
}

pub struct Acceptor {
    config: Arc<ServerConfig>,
    cluster: ClusterView,
    dispatcher: RoundRobin,
    tracker: ConnectionTracker,
    sessions: SessionArena,
    handler: Arc<dyn RequestHandler>,
}

impl Acceptor {
    pub fn new(
        config: Arc<ServerConfig>,
        cluster: ClusterView,
        tracker: ConnectionTracker,
        sessions: SessionArena,
        handler: Arc<dyn RequestHandler>,
    ) -> Self {
        Self {
            config,
            cluster,
            dispatcher: RoundRobin::new(),
            tracker,
            sessions,
            handler,
        }
    }

    /// Accept connections until shutdown. Dropping `listener` on return
    /// releases the listening socket.
    pub async fn run(self: Arc<Self>, listener: Listener, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(role = %self.cluster.role(), "Accept loop started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Accept loop stopping");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => self.on_accepted(stream, peer_addr).await,
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                        let pause = accept_backoff(&e);
                        self.report(Err(ServeError::AcceptFailed(e)));
                        if let Some(pause) = pause {
                            tokio::select! {
                                _ = shutdown.recv() => break,
                                _ = tokio::time::sleep(pause) => {}
                            }
                        }
                    }
                },
            }
        }
    }

    /// Serve connections transferred by the master until it hangs up.
    pub async fn run_transferred(self: Arc<Self>, receiver: HandleReceiver, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!("Waiting for transferred connections");
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                received = receiver.recv_stream() => match received {
                    Ok(Some(stream)) => self.adopt(stream),
                    Ok(None) => {
                        tracing::info!("Master closed the cluster channel");
                        break;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                        tracing::warn!(error = %e, "Ignoring malformed handle message");
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Cluster channel failed");
                        self.report(Err(ServeError::AcceptFailed(e)));
                        break;
                    }
                },
            }
        }
    }

    /// Serve a stream that was accepted elsewhere.
    pub fn adopt(self: &Arc<Self>, stream: TcpStream) {
        let peer_addr = stream
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
        if self.config.listener.no_delay {
            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(peer_addr = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
            }
        }
        let guard = self.tracker.track();
        metrics::record_accept();
        tracing::debug!(connection_id = %guard.id(), peer_addr = %peer_addr, "Adopted transferred connection");
        self.serve(stream, peer_addr, guard);
    }

    async fn on_accepted(self: &Arc<Self>, stream: TcpStream, peer_addr: SocketAddr) {
        let guard = self.tracker.track();
        metrics::record_accept();

        match self.select_worker() {
            Some(worker) => self.transfer(stream, peer_addr, guard, &worker).await,
            None => self.serve(stream, peer_addr, guard),
        }
    }

    fn select_worker(&self) -> Option<Arc<WorkerEntry>> {
        if self.cluster.role() != Role::Master {
            return None;
        }
        let workers = self.cluster.workers();
        if workers.is_empty() {
            return None;
        }
        match self.dispatcher.next(&workers) {
            Ok(worker) => Some(worker),
            Err(e) => {
                tracing::error!(error = %e, "Dispatch failed on a non-empty snapshot; serving locally");
                None
            }
        }
    }

    async fn transfer(&self, stream: TcpStream, peer_addr: SocketAddr, guard: ConnectionGuard, worker: &WorkerEntry) {
        let id = guard.id();
        let session = Session::detached(id, peer_addr, self.config.keep_alive.clone());
        self.sessions.retain(Arc::clone(&session), guard);

        match session.hand_off(stream, worker).await {
            Ok(()) => {
                metrics::record_handoff("ok");
                tracing::debug!(
                    connection_id = %id,
                    peer_addr = %peer_addr,
                    worker_id = %worker.id(),
                    pid = worker.pid(),
                    "Connection handed off"
                );
            }
            Err(source) => {
                metrics::record_handoff("failed");
                tracing::warn!(
                    connection_id = %id,
                    worker_id = %worker.id(),
                    error = %source,
                    "Handoff failed; connection dropped"
                );
                self.report(Err(ServeError::Handoff {
                    connection: id,
                    worker: worker.id(),
                    source,
                }));
            }
        }
    }

    fn serve(self: &Arc<Self>, stream: TcpStream, peer_addr: SocketAddr, guard: ConnectionGuard) {
        let (reader, writer) = stream.into_split();
        let session = Session::new(guard.id(), peer_addr, self.config.keep_alive.clone(), writer);
        self.sessions.retain(Arc::clone(&session), guard);
        tokio::spawn(Arc::clone(self).read_loop(session, reader));
    }

    async fn read_loop(self: Arc<Self>, session: Arc<Session>, mut reader: OwnedReadHalf) {
        let _close_on_exit = CloseOnDrop(Arc::clone(&session));
        let keep_alive = self.config.keep_alive.clone();
        let mut parser = Http1Parser::new(self.config.limits);
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut poisoned = false;

        loop {
            if poisoned {
                buf.clear();
            } else {
                match parser.parse(&mut buf) {
                    Ok(Some(request)) => match self.deliver(&session, request).await {
                        Flow::Continue => continue,
                        Flow::Stop => break,
                    },
                    Ok(None) => {}
                    Err(source) => {
                        tracing::debug!(connection_id = %session.id(), error = %source, "Malformed request");
                        self.report(Err(ServeError::Parse {
                            connection: session.id(),
                            source,
                        }));
                        if !keep_alive.enabled() {
                            session.close();
                            break;
                        }
                        poisoned = true;
                        buf.clear();
                    }
                }
            }

            let idle = poisoned || (session.requests_served() > 0 && buf.is_empty() && parser.is_idle());
            let deadline = idle.then(|| keep_alive.timeout());

            let outcome = tokio::select! {
                _ = session.closed() => break,
                outcome = read_more(&mut reader, &mut buf, deadline) => outcome,
            };

            match outcome {
                ReadOutcome::Data => {}
                ReadOutcome::Eof => {
                    session.close();
                    self.report(Err(ServeError::ConnectionClosed {
                        connection: session.id(),
                    }));
                    break;
                }
                ReadOutcome::IdleTimeout => {
                    tracing::debug!(connection_id = %session.id(), "Keep-alive idle timeout");
                    session.close();
                    break;
                }
                ReadOutcome::Failed(source) => {
                    session.close();
                    self.report(Err(ServeError::Io {
                        connection: session.id(),
                        source,
                    }));
                    break;
                }
            }
        }

        session.release_stream().await;
    }

    async fn deliver(&self, session: &Arc<Session>, request: Request) -> Flow {
        let served = session.record_request();
        let last = session.is_last_request(served, wants_close(&request));
        metrics::record_request();
        tracing::debug!(
            connection_id = %session.id(),
            method = %request.method(),
            path = request.uri().path(),
            served,
            last,
            "Request received"
        );

        let (channel, done) = ResponseChannel::new(Arc::clone(session), last, request.version());
        self.handler.on_request(Ok((request, channel)));

        let outcome = tokio::select! {
            _ = session.closed() => return Flow::Stop,
            outcome = done => outcome.unwrap_or_default(),
        };

        if last || outcome.close {
            session.close();
            Flow::Stop
        } else {
            Flow::Continue
        }
    }

    fn report(&self, input: HandlerInput) {
        if let Err(e) = &input {
            metrics::record_session_error(e.kind().as_str());
        }
        self.handler.on_request(input);
    }
}

/// Closes the session however the read loop exits, unwinding included.
struct CloseOnDrop(Arc<Session>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// How long to pause after a failed `accept`.
///
/// Errors tied to a single aborted connection retry at once. Anything else,
/// such as running out of descriptors, would fail again immediately.
fn accept_backoff(error: &std::io::Error) -> Option<Duration> {
    use std::io::ErrorKind::{ConnectionAborted, ConnectionRefused, ConnectionReset, Interrupted};

    match error.kind() {
        ConnectionAborted | ConnectionRefused | ConnectionReset | Interrupted => None,
        _ => Some(ACCEPT_ERROR_PAUSE),
    }
}

async fn read_more(reader: &mut OwnedReadHalf, buf: &mut BytesMut, deadline: Option<Duration>) -> ReadOutcome {
    let read = reader.read_buf(buf);
    let result = match deadline {
        Some(limit) => match tokio::time::timeout(limit, read).await {
            Ok(result) => result,
            Err(_) => return ReadOutcome::IdleTimeout,
        },
        None => read.await,
    };
    match result {
        Ok(0) => ReadOutcome::Eof,
        Ok(_) => ReadOutcome::Data,
        Err(e) => ReadOutcome::Failed(e),
    }
}
