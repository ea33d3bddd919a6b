//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cluster_http::config::ServerConfig;
use cluster_http::http::{HandlerInput, HttpServer, RequestHandler};
use cluster_http::net::ErrorKind;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What the handler saw, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Request(String),
    Error(ErrorKind),
}

/// A handler that records every call and answers requests with `body`.
pub fn recording_handler(
    events: mpsc::UnboundedSender<Event>,
    body: &'static str,
) -> impl Fn(HandlerInput) + Send + Sync + 'static {
    move |input| match input {
        Ok((request, channel)) => {
            let _ = events.send(Event::Request(request.uri().path().to_string()));
            tokio::spawn(async move {
                let _ = channel
                    .send(http::Response::new(Bytes::from_static(body.as_bytes())))
                    .await;
            });
        }
        Err(e) => {
            let _ = events.send(Event::Error(e.kind()));
        }
    }
}

pub struct TestServer {
    pub server: Arc<HttpServer>,
    pub addr: SocketAddr,
    pub events: mpsc::UnboundedReceiver<Event>,
    pub task: JoinHandle<()>,
}

impl TestServer {
    /// Next handler event, failing the test after two seconds.
    pub async fn next_event(&mut self) -> Event {
        tokio::time::timeout(Duration::from_secs(2), self.events.recv())
            .await
            .expect("timed out waiting for handler event")
            .expect("handler channel closed")
    }

    /// Assert no handler event arrives within `window`.
    pub async fn assert_quiet(&mut self, window: Duration) {
        if let Ok(Some(event)) = tokio::time::timeout(window, self.events.recv()).await {
            panic!("unexpected handler event: {event:?}");
        }
    }

    pub async fn wait_for_clients(&self, count: u64) {
        let server = Arc::clone(&self.server);
        wait_until(move || server.clients_connected() == count).await;
    }
}

/// Start a bound, listening server on an ephemeral port.
pub async fn start_server(mut config: ServerConfig) -> TestServer {
    config.listener.bind_address = "127.0.0.1:0".to_string();
    let server = Arc::new(HttpServer::new(config));
    start(server, "ok").await
}

pub async fn start(server: Arc<HttpServer>, body: &'static str) -> TestServer {
    let addr = server.bind("127.0.0.1:0").unwrap();
    let (tx, events) = mpsc::unbounded_channel();
    let listening = Arc::clone(&server);
    let task = tokio::spawn(async move {
        listening.listen(recording_handler(tx, body)).await.unwrap();
    });
    TestServer {
        server,
        addr,
        events,
        task,
    }
}

/// Bind `server` on an ephemeral port and listen with `handler`.
pub fn serve_with(server: &Arc<HttpServer>, handler: impl RequestHandler) -> SocketAddr {
    let addr = server.bind("127.0.0.1:0").unwrap();
    let listening = Arc::clone(server);
    tokio::spawn(async move {
        listening.listen(handler).await.unwrap();
    });
    addr
}

/// Poll `condition` for up to three seconds.
pub async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..300 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// Unique Unix socket path for this test process.
pub fn socket_path(tag: &str) -> PathBuf {
    static SEQ: AtomicU32 = AtomicU32::new(0);
    std::env::temp_dir().join(format!(
        "cluster-http-{tag}-{}-{}.sock",
        std::process::id(),
        SEQ.fetch_add(1, Ordering::Relaxed)
    ))
}

#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub head: String,
    pub body: Vec<u8>,
}

impl RawResponse {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<String> {
        self.head.lines().skip(1).find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.trim()
                .eq_ignore_ascii_case(name)
                .then(|| value.trim().to_string())
        })
    }
}

/// Raw HTTP/1.1 client over one TCP connection.
pub struct Client {
    pub stream: TcpStream,
    buf: Vec<u8>,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            buf: Vec::new(),
        }
    }

    pub async fn send(&mut self, raw: &str) {
        self.stream.write_all(raw.as_bytes()).await.unwrap();
    }

    pub async fn get(&mut self, path: &str) {
        self.send(&format!("GET {path} HTTP/1.1\r\nHost: test\r\n\r\n"))
            .await;
    }

    /// Read one response. `None` if the server closed first.
    pub async fn read_response(&mut self) -> Option<RawResponse> {
        let head_end = loop {
            if let Some(pos) = find(&self.buf, b"\r\n\r\n") {
                break pos;
            }
            if !self.fill().await {
                return None;
            }
        };

        let head = String::from_utf8(self.buf[..head_end].to_vec()).unwrap();
        let status = head
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse().ok())
            .unwrap();
        let mut response = RawResponse {
            status,
            head,
            body: Vec::new(),
        };
        let length: usize = response
            .header("content-length")
            .map(|v| v.parse().unwrap())
            .unwrap_or(0);

        let body_start = head_end + 4;
        while self.buf.len() < body_start + length {
            if !self.fill().await {
                return None;
            }
        }
        response.body = self.buf[body_start..body_start + length].to_vec();
        self.buf.drain(..body_start + length);
        Some(response)
    }

    /// Whether the server closes the connection within `within`.
    pub async fn closed_within(&mut self, within: Duration) -> bool {
        let mut scratch = [0u8; 256];
        match tokio::time::timeout(within, self.stream.read(&mut scratch)).await {
            Ok(Ok(0)) | Ok(Err(_)) => true,
            Ok(Ok(_)) => panic!("unexpected bytes from server"),
            Err(_) => false,
        }
    }

    /// Read until the server ends the stream. Returns the byte count, or
    /// `None` if the stream is still open after `within`.
    pub async fn drain_to_end(&mut self, within: Duration) -> Option<usize> {
        let mut total = std::mem::take(&mut self.buf).len();
        let mut chunk = vec![0u8; 64 * 1024];
        let drained = tokio::time::timeout(within, async {
            loop {
                match self.stream.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => total += n,
                }
            }
        })
        .await;
        drained.ok().map(|()| total)
    }

    async fn fill(&mut self) -> bool {
        let mut chunk = [0u8; 4096];
        match tokio::time::timeout(Duration::from_secs(3), self.stream.read(&mut chunk)).await {
            Ok(Ok(0)) | Ok(Err(_)) => false,
            Ok(Ok(n)) => {
                self.buf.extend_from_slice(&chunk[..n]);
                true
            }
            Err(_) => panic!("timed out reading response"),
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
