//! Incremental HTTP/1.x request parser.
//!
//! The session owns one parser per connection and feeds it every chunk read
//! from the socket. The parser consumes bytes from the front of the buffer
//! only when a full request is available, so a request split across any
//! number of reads produces exactly one `Request`.

use bytes::{Buf, Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{Method, Version};

use crate::config::LimitsConfig;

/// A fully parsed request.
pub type Request = http::Request<Bytes>;

/// Protocol violations detected while parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("malformed request line")]
    BadRequestLine,
    #[error("unrecognised HTTP method")]
    BadMethod,
    #[error("invalid request target")]
    BadUri,
    #[error("unsupported HTTP version")]
    UnsupportedVersion,
    #[error("malformed header")]
    BadHeader,
    #[error("too many headers")]
    TooManyHeaders,
    #[error("header block too large")]
    HeadersTooLarge,
    #[error("invalid Content-Length")]
    BadContentLength,
    #[error("duplicate Content-Length")]
    DuplicateContentLength,
    #[error("both Content-Length and Transfer-Encoding present")]
    AmbiguousBodyLength,
    #[error("unsupported Transfer-Encoding")]
    BadTransferEncoding,
    #[error("malformed chunked encoding")]
    BadChunkedEncoding,
    #[error("body exceeds size limit")]
    BodyTooLarge,
}

/// A stateful request parser fed with raw connection bytes.
pub trait RequestParser: Send {
    /// Try to take one complete request off the front of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed. Bytes belonging to a
    /// following request stay in `buf`.
    fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Request>, ParseError>;

    /// True between requests: no head or body is partially consumed.
    fn is_idle(&self) -> bool;
}

/// Whether the client asked for the connection to end after this request.
///
/// HTTP/1.1 defaults to persistent connections unless `Connection: close`
/// is sent; HTTP/1.0 defaults to closing unless `Connection: keep-alive`.
pub fn wants_close(request: &Request) -> bool {
    let has_token = |token: &str| {
        request
            .headers()
            .get_all(CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    };

    if request.version() == Version::HTTP_10 {
        !has_token("keep-alive")
    } else {
        has_token("close")
    }
}

const MAX_CHUNK_LINE: usize = 1024;

#[derive(Debug)]
enum State {
    Head,
    Body {
        parts: http::request::Parts,
        remaining: usize,
    },
    Chunked {
        parts: http::request::Parts,
        body: BytesMut,
        phase: ChunkPhase,
    },
}

#[derive(Debug, Clone, Copy)]
enum ChunkPhase {
    SizeLine,
    Data { remaining: usize },
    DataCrlf,
    Trailers,
}

/// Default HTTP/1.0 and HTTP/1.1 parser.
#[derive(Debug)]
pub struct Http1Parser {
    state: State,
    limits: LimitsConfig,
}

impl Http1Parser {
    pub fn new(limits: LimitsConfig) -> Self {
        Self {
            state: State::Head,
            limits,
        }
    }

    fn parse_head(&self, buf: &mut BytesMut) -> Result<Option<(http::request::Parts, BodyKind)>, ParseError> {
        let Some(end) = find_head_end(buf) else {
            if buf.len() > self.limits.max_head_bytes {
                return Err(ParseError::HeadersTooLarge);
            }
            return Ok(None);
        };
        if end > self.limits.max_head_bytes {
            return Err(ParseError::HeadersTooLarge);
        }

        let head = buf.split_to(end);
        let text = std::str::from_utf8(&head[..end - 4]).map_err(|_| ParseError::BadHeader)?;
        let mut lines = text.split("\r\n");

        let request_line = lines.next().ok_or(ParseError::BadRequestLine)?;
        let mut builder = parse_request_line(request_line)?;

        let mut count = 0;
        for line in lines {
            count += 1;
            if count > self.limits.max_headers {
                return Err(ParseError::TooManyHeaders);
            }
            let (name, value) = parse_header_line(line)?;
            builder = builder.header(name, value);
        }

        let (parts, ()) = builder
            .body(())
            .map_err(|_| ParseError::BadRequestLine)?
            .into_parts();
        let kind = body_kind(&parts)?;
        Ok(Some((parts, kind)))
    }

    fn parse_chunked(
        &self,
        buf: &mut BytesMut,
        body: &mut BytesMut,
        phase: &mut ChunkPhase,
    ) -> Result<bool, ParseError> {
        loop {
            match *phase {
                ChunkPhase::SizeLine => {
                    let Some(line) = take_line(buf, MAX_CHUNK_LINE)? else {
                        return Ok(false);
                    };
                    let size = parse_chunk_size(&line)?;
                    if size == 0 {
                        *phase = ChunkPhase::Trailers;
                        continue;
                    }
                    if body.len().saturating_add(size) > self.limits.max_body_bytes {
                        return Err(ParseError::BodyTooLarge);
                    }
                    *phase = ChunkPhase::Data { remaining: size };
                }
                ChunkPhase::Data { remaining } => {
                    if buf.len() < remaining {
                        return Ok(false);
                    }
                    body.extend_from_slice(&buf.split_to(remaining));
                    *phase = ChunkPhase::DataCrlf;
                }
                ChunkPhase::DataCrlf => {
                    if buf.len() < 2 {
                        return Ok(false);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(ParseError::BadChunkedEncoding);
                    }
                    buf.advance(2);
                    *phase = ChunkPhase::SizeLine;
                }
                ChunkPhase::Trailers => {
                    // Trailers are consumed and discarded.
                    let Some(line) = take_line(buf, self.limits.max_head_bytes)? else {
                        return Ok(false);
                    };
                    if line.is_empty() {
                        return Ok(true);
                    }
                }
            }
        }
    }
}

impl RequestParser for Http1Parser {
    fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Request>, ParseError> {
        loop {
            match std::mem::replace(&mut self.state, State::Head) {
                State::Head => {
                    let Some((parts, kind)) = self.parse_head(buf)? else {
                        return Ok(None);
                    };
                    self.state = match kind {
                        BodyKind::Length(0) => {
                            return Ok(Some(Request::from_parts(parts, Bytes::new())));
                        }
                        BodyKind::Length(len) if len > self.limits.max_body_bytes => {
                            return Err(ParseError::BodyTooLarge);
                        }
                        BodyKind::Length(remaining) => State::Body { parts, remaining },
                        BodyKind::Chunked => State::Chunked {
                            parts,
                            body: BytesMut::new(),
                            phase: ChunkPhase::SizeLine,
                        },
                    };
                }
                State::Body { parts, remaining } => {
                    if buf.len() < remaining {
                        self.state = State::Body { parts, remaining };
                        return Ok(None);
                    }
                    let body = buf.split_to(remaining).freeze();
                    return Ok(Some(Request::from_parts(parts, body)));
                }
                State::Chunked {
                    parts,
                    mut body,
                    mut phase,
                } => {
                    if self.parse_chunked(buf, &mut body, &mut phase)? {
                        return Ok(Some(Request::from_parts(parts, body.freeze())));
                    }
                    self.state = State::Chunked { parts, body, phase };
                    return Ok(None);
                }
            }
        }
    }

    fn is_idle(&self) -> bool {
        matches!(self.state, State::Head)
    }
}

enum BodyKind {
    Length(usize),
    Chunked,
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_request_line(line: &str) -> Result<http::request::Builder, ParseError> {
    let mut parts = line.split(' ');
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ParseError::BadRequestLine);
    };

    let method = Method::from_bytes(method.as_bytes()).map_err(|_| ParseError::BadMethod)?;
    let uri: http::Uri = target.parse().map_err(|_| ParseError::BadUri)?;
    let version = match version {
        "HTTP/1.1" => Version::HTTP_11,
        "HTTP/1.0" => Version::HTTP_10,
        _ => return Err(ParseError::UnsupportedVersion),
    };

    Ok(http::Request::builder()
        .method(method)
        .uri(uri)
        .version(version))
}

fn parse_header_line(line: &str) -> Result<(HeaderName, HeaderValue), ParseError> {
    let (name, value) = line.split_once(':').ok_or(ParseError::BadHeader)?;
    // Whitespace between the field name and colon is a smuggling vector.
    if name.is_empty() || name.trim_end() != name {
        return Err(ParseError::BadHeader);
    }
    let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| ParseError::BadHeader)?;
    let value =
        HeaderValue::from_str(value.trim()).map_err(|_| ParseError::BadHeader)?;
    Ok((name, value))
}

fn body_kind(parts: &http::request::Parts) -> Result<BodyKind, ParseError> {
    let mut lengths = parts.headers.get_all(CONTENT_LENGTH).iter();
    let length = lengths.next();
    if lengths.next().is_some() {
        return Err(ParseError::DuplicateContentLength);
    }
    let encoding = parts.headers.get(TRANSFER_ENCODING);

    match (length, encoding) {
        (Some(_), Some(_)) => Err(ParseError::AmbiguousBodyLength),
        (None, Some(te)) => {
            if parts.version == Version::HTTP_10 {
                return Err(ParseError::BadTransferEncoding);
            }
            let te = te.to_str().map_err(|_| ParseError::BadTransferEncoding)?;
            if te.trim().eq_ignore_ascii_case("chunked") {
                Ok(BodyKind::Chunked)
            } else {
                Err(ParseError::BadTransferEncoding)
            }
        }
        (Some(cl), None) => cl
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .map(BodyKind::Length)
            .ok_or(ParseError::BadContentLength),
        (None, None) => Ok(BodyKind::Length(0)),
    }
}

fn take_line(buf: &mut BytesMut, max: usize) -> Result<Option<BytesMut>, ParseError> {
    match buf.windows(2).position(|w| w == b"\r\n") {
        Some(pos) => {
            let line = buf.split_to(pos);
            buf.advance(2);
            Ok(Some(line))
        }
        None if buf.len() > max => Err(ParseError::BadChunkedEncoding),
        None => Ok(None),
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, ParseError> {
    let line = std::str::from_utf8(line).map_err(|_| ParseError::BadChunkedEncoding)?;
    let size = line.split(';').next().unwrap_or_default().trim();
    if size.is_empty() {
        return Err(ParseError::BadChunkedEncoding);
    }
    usize::from_str_radix(size, 16).map_err(|_| ParseError::BadChunkedEncoding)
}
