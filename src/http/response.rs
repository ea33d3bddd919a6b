//! Response channel handed to the request handler.
//!
//! # Responsibilities
//! - Serialize an `http::Response` as HTTP/1.1 onto the session
//! - Add `Content-Length` and `Connection` headers the application left out
//! - Tell the read loop when the request/response cycle is over
//!
//! # Design Decisions
//! - Dropping the channel completes the cycle, so a handler that forgets to
//!   answer cannot wedge the read loop.
//! - Writing after the session closed is an error, never a panic.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use http::header::{CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, Response, Version};
use tokio::sync::oneshot;

use crate::net::session::Session;

pub use crate::net::session::ResponseError;

/// How a request/response cycle ended.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CycleOutcome {
    /// The application asked for the connection to close.
    pub close: bool,
}

/// Write side of one request/response cycle.
pub struct ResponseChannel {
    session: Arc<Session>,
    last: bool,
    version: Version,
    done: Option<oneshot::Sender<CycleOutcome>>,
}

impl std::fmt::Debug for ResponseChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseChannel")
            .field("connection_id", &self.session.id())
            .field("last", &self.last)
            .finish()
    }
}

impl ResponseChannel {
    pub(crate) fn new(
        session: Arc<Session>,
        last: bool,
        version: Version,
    ) -> (Self, oneshot::Receiver<CycleOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                session,
                last,
                version,
                done: Some(tx),
            },
            rx,
        )
    }

    /// The session this cycle belongs to.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Whether the connection closes once this response is sent.
    pub fn is_last(&self) -> bool {
        self.last
    }

    /// Write raw bytes without completing the cycle.
    pub async fn write(&self, bytes: &[u8]) -> Result<(), ResponseError> {
        self.session.write_all(bytes).await
    }

    /// Send a complete response and finish the cycle.
    pub async fn send(mut self, response: Response<Bytes>) -> Result<(), ResponseError> {
        let close = self.last || header_has_token(response.headers(), "close");
        let encoded = encode_response(&response, close, self.version);
        let result = self.session.write_all(&encoded).await;
        self.complete(CycleOutcome {
            close: close || result.is_err(),
        });
        result
    }

    /// Finish the cycle after raw writes.
    pub fn finish(mut self) {
        self.complete(CycleOutcome::default());
    }

    /// Finish the cycle and close the connection.
    pub fn close(mut self) {
        self.complete(CycleOutcome { close: true });
        self.session.close();
    }

    fn complete(&mut self, outcome: CycleOutcome) {
        if let Some(done) = self.done.take() {
            let _ = done.send(outcome);
        }
    }
}

impl Drop for ResponseChannel {
    fn drop(&mut self) {
        self.complete(CycleOutcome::default());
    }
}

fn header_has_token(headers: &HeaderMap, token: &str) -> bool {
    headers.get_all(CONNECTION).iter().any(|value| {
        value
            .to_str()
            .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
            .unwrap_or(false)
    })
}

/// Serialize `response` as an HTTP/1.1 message.
pub(crate) fn encode_response(response: &Response<Bytes>, close: bool, request_version: Version) -> BytesMut {
    let body = response.body();
    let headers = response.headers();
    let mut out = BytesMut::with_capacity(128 + body.len());

    let status = response.status();
    out.put_slice(b"HTTP/1.1 ");
    out.put_slice(status.as_str().as_bytes());
    out.put_u8(b' ');
    out.put_slice(status.canonical_reason().unwrap_or("").as_bytes());
    out.put_slice(b"\r\n");

    for (name, value) in headers {
        if name == CONNECTION {
            continue;
        }
        out.put_slice(name.as_str().as_bytes());
        out.put_slice(b": ");
        out.put_slice(value.as_bytes());
        out.put_slice(b"\r\n");
    }

    if !headers.contains_key(CONTENT_LENGTH) && !headers.contains_key(TRANSFER_ENCODING) {
        out.put_slice(b"content-length: ");
        out.put_slice(body.len().to_string().as_bytes());
        out.put_slice(b"\r\n");
    }

    if close {
        out.put_slice(b"connection: close\r\n");
    } else if request_version == Version::HTTP_10 {
        out.put_slice(b"connection: keep-alive\r\n");
    }

    out.put_slice(b"\r\n");
    out.put_slice(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeepAliveConfig;
    use crate::net::connection::ConnectionId;
    use http::StatusCode;

    fn text(body: &'static str) -> Response<Bytes> {
        Response::new(Bytes::from_static(body.as_bytes()))
    }

    #[test]
    fn encodes_status_and_content_length() {
        let encoded = encode_response(&text("hello"), false, Version::HTTP_11);
        assert_eq!(
            &encoded[..],
            b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\n\r\nhello"
        );
    }

    #[test]
    fn last_response_announces_close() {
        let mut response = text("");
        *response.status_mut() = StatusCode::NOT_FOUND;
        let encoded = encode_response(&response, true, Version::HTTP_11);
        let text = String::from_utf8(encoded.to_vec()).unwrap();
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("connection: close\r\n"));
        assert!(text.contains("content-length: 0\r\n"));
    }

    #[test]
    fn http10_keep_alive_is_explicit() {
        let encoded = encode_response(&text("x"), false, Version::HTTP_10);
        let text = String::from_utf8(encoded.to_vec()).unwrap();
        assert!(text.contains("connection: keep-alive\r\n"));
    }

    #[test]
    fn application_content_length_is_kept() {
        let mut response = text("abc");
        response
            .headers_mut()
            .insert(CONTENT_LENGTH, http::HeaderValue::from_static("3"));
        let encoded = encode_response(&response, false, Version::HTTP_11);
        let text = String::from_utf8(encoded.to_vec()).unwrap();
        assert_eq!(text.matches("content-length").count(), 1);
    }

    #[test]
    fn connection_close_header_detected() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, http::HeaderValue::from_static("keep-alive, Close"));
        assert!(header_has_token(&headers, "close"));
    }

    #[tokio::test]
    async fn dropping_channel_completes_cycle() {
        let session = Session::detached(
            ConnectionId::new(),
            "127.0.0.1:1".parse().unwrap(),
            KeepAliveConfig::default(),
        );
        let (channel, done) = ResponseChannel::new(session, false, Version::HTTP_11);
        drop(channel);
        assert_eq!(done.await.unwrap(), CycleOutcome::default());
    }

    #[tokio::test]
    async fn send_on_closed_session_fails_and_requests_close() {
        let session = Session::detached(
            ConnectionId::new(),
            "127.0.0.1:1".parse().unwrap(),
            KeepAliveConfig::default(),
        );
        session.close();
        let (channel, done) = ResponseChannel::new(session, false, Version::HTTP_11);
        let result = channel.send(text("late")).await;
        assert!(matches!(result, Err(ResponseError::SessionClosed)));
        assert!(done.await.unwrap().close);
    }
}
