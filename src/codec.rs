//! HTTP/1.x message framing over async byte streams.
//!
//! Head parsing is delegated to `httparse`; this module only tracks body
//! framing (content-length, chunked, read-to-EOF) and re-encodes messages
//! on the way out. The connection state machines in `client` and `server`
//! operate on the `RequestHead`/`ResponseHead`/`Chunk` values produced here.

use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context, Result};
use bytes::{Buf, Bytes, BytesMut};
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, Method, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Bound on the serialized size of a message head. Heads larger than this
/// fail the read and the connection is dropped.
const MAX_HEAD_BYTES: usize = 16 * 1024;
const MAX_HEADERS: usize = 100;
const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Correlation token stamped on a request when its head is first decoded.
/// Copies of the request share the id, so per-request decisions (like
/// disabling chained proxying) survive snapshotting.
pub type RequestId = u64;

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> RequestId {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub id: RequestId,
    pub method: Method,
    /// Request target exactly as received: absolute-form for proxied
    /// requests, authority-form for CONNECT, origin-form after rewriting.
    pub target: String,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn new(method: Method, target: impl Into<String>, version: Version) -> Self {
        Self {
            id: next_request_id(),
            method,
            target: target.into(),
            version,
            headers: HeaderMap::new(),
        }
    }

    pub fn is_connect(&self) -> bool {
        self.method == Method::CONNECT
    }
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: Version,
    pub status: StatusCode,
    /// Reason phrase as received, kept so relayed status lines survive
    /// verbatim (e.g. "Connection established").
    pub reason: Option<String>,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn new(status: StatusCode) -> Self {
        Self {
            version: Version::HTTP_11,
            status,
            reason: None,
            headers: HeaderMap::new(),
        }
    }

    pub fn with_reason(status: StatusCode, reason: &str) -> Self {
        let mut head = Self::new(status);
        head.reason = Some(reason.to_string());
        head
    }
}

/// One piece of a message body. `last` marks the terminal chunk; for
/// synthesized terminal chunks `data` is empty.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub data: Bytes,
    pub last: bool,
}

impl Chunk {
    pub fn last_empty() -> Self {
        Self {
            data: Bytes::new(),
            last: true,
        }
    }
}

/// How a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    None,
    Length(u64),
    Chunked,
    UntilClose,
}

pub fn is_chunked(headers: &HeaderMap) -> bool {
    headers.get_all(TRANSFER_ENCODING).iter().any(|v| {
        v.to_str()
            .map(|s| s.split(',').any(|t| t.trim().eq_ignore_ascii_case("chunked")))
            .unwrap_or(false)
    })
}

pub fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
}

pub fn request_body_kind(head: &RequestHead) -> BodyKind {
    if is_chunked(&head.headers) {
        BodyKind::Chunked
    } else {
        match content_length(&head.headers) {
            Some(0) | None => BodyKind::None,
            Some(n) => BodyKind::Length(n),
        }
    }
}

/// Body framing of a response, which also depends on the request that
/// prompted it (HEAD and CONNECT responses never carry a body).
pub fn response_body_kind(request_method: &Method, head: &ResponseHead) -> BodyKind {
    if *request_method == Method::HEAD || *request_method == Method::CONNECT {
        return BodyKind::None;
    }
    let status = head.status.as_u16();
    if head.status.is_informational() || status == 204 || status == 304 {
        return BodyKind::None;
    }
    if is_chunked(&head.headers) {
        BodyKind::Chunked
    } else if let Some(n) = content_length(&head.headers) {
        if n == 0 {
            BodyKind::None
        } else {
            BodyKind::Length(n)
        }
    } else {
        BodyKind::UntilClose
    }
}

/// Incremental state for reading one message body.
#[derive(Debug)]
pub struct BodyState {
    kind: BodyKind,
    remaining: u64,
    chunk_remaining: u64,
    expect_crlf: bool,
    /// The zero-size chunk has been consumed; only trailer lines remain.
    in_trailer: bool,
}

impl BodyState {
    pub fn new(kind: BodyKind) -> Self {
        let remaining = match kind {
            BodyKind::Length(n) => n,
            _ => 0,
        };
        Self {
            kind,
            remaining,
            chunk_remaining: 0,
            expect_crlf: false,
            in_trailer: false,
        }
    }
}

/// Buffered reader that decodes HTTP/1.x messages from an async stream.
///
/// All read methods are cancellation safe: partial input stays in the
/// internal buffer and decoding restarts from it on the next call.
pub struct MessageReader<R> {
    io: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(io: R) -> Self {
        Self {
            io,
            buf: BytesMut::with_capacity(READ_CHUNK_SIZE),
        }
    }

    /// Like `new`, but seeds the buffer with bytes already read from the
    /// stream (for example by a connection-flow step).
    pub fn with_leftover(io: R, leftover: Bytes) -> Self {
        let mut buf = BytesMut::with_capacity(READ_CHUNK_SIZE.max(leftover.len()));
        buf.extend_from_slice(&leftover);
        Self { io, buf }
    }

    /// Consumes the reader, returning any bytes read past the last decoded
    /// message.
    pub fn into_leftover(self) -> Bytes {
        self.buf.freeze()
    }

    /// Reads more bytes into the buffer. Returns the number read; 0 means
    /// EOF.
    async fn fill(&mut self) -> Result<usize> {
        self.buf.reserve(READ_CHUNK_SIZE);
        let n = self.io.read_buf(&mut self.buf).await?;
        Ok(n)
    }

    /// Reads one request head. `Ok(None)` means the peer closed the
    /// connection cleanly at a message boundary.
    pub async fn read_request_head(&mut self) -> Result<Option<RequestHead>> {
        loop {
            if !self.buf.is_empty() {
                let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
                let mut parsed = httparse::Request::new(&mut headers);
                match parsed.parse(&self.buf).context("malformed request head")? {
                    httparse::Status::Complete(len) => {
                        let method = Method::from_bytes(parsed.method.unwrap_or("").as_bytes())
                            .context("invalid request method")?;
                        let target = parsed.path.unwrap_or("").to_string();
                        let version = parse_version(parsed.version);
                        let mut head = RequestHead::new(method, target, version);
                        head.headers = collect_headers(parsed.headers)?;
                        self.buf.advance(len);
                        return Ok(Some(head));
                    }
                    httparse::Status::Partial => {
                        if self.buf.len() > MAX_HEAD_BYTES {
                            bail!("request head exceeds {} bytes", MAX_HEAD_BYTES);
                        }
                    }
                }
            }
            if self.fill().await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                bail!("connection closed mid request head");
            }
        }
    }

    /// Reads one response head. `Ok(None)` means the peer closed the
    /// connection at a message boundary.
    pub async fn read_response_head(&mut self) -> Result<Option<ResponseHead>> {
        loop {
            if !self.buf.is_empty() {
                let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
                let mut parsed = httparse::Response::new(&mut headers);
                match parsed.parse(&self.buf).context("malformed response head")? {
                    httparse::Status::Complete(len) => {
                        let status = StatusCode::from_u16(parsed.code.unwrap_or(0))
                            .context("invalid response status")?;
                        let head = ResponseHead {
                            version: parse_version(parsed.version),
                            status,
                            reason: parsed.reason.map(|r| r.to_string()),
                            headers: collect_headers(parsed.headers)?,
                        };
                        self.buf.advance(len);
                        return Ok(Some(head));
                    }
                    httparse::Status::Partial => {
                        if self.buf.len() > MAX_HEAD_BYTES {
                            bail!("response head exceeds {} bytes", MAX_HEAD_BYTES);
                        }
                    }
                }
            }
            if self.fill().await? == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                bail!("connection closed mid response head");
            }
        }
    }

    /// Reads the next piece of a message body. After a chunk with
    /// `last == true` the body is complete and this must not be called
    /// again for the same `BodyState`.
    pub async fn read_body_chunk(&mut self, body: &mut BodyState) -> Result<Chunk> {
        match body.kind {
            BodyKind::None => Ok(Chunk::last_empty()),
            BodyKind::Length(_) => {
                if body.remaining == 0 {
                    return Ok(Chunk::last_empty());
                }
                while self.buf.is_empty() {
                    if self.fill().await? == 0 {
                        bail!("connection closed mid body ({} bytes missing)", body.remaining);
                    }
                }
                let take = (self.buf.len() as u64).min(body.remaining) as usize;
                let data = self.buf.split_to(take).freeze();
                body.remaining -= take as u64;
                Ok(Chunk {
                    data,
                    last: body.remaining == 0,
                })
            }
            BodyKind::UntilClose => {
                while self.buf.is_empty() {
                    if self.fill().await? == 0 {
                        return Ok(Chunk::last_empty());
                    }
                }
                let data = self.buf.split().freeze();
                Ok(Chunk { data, last: false })
            }
            BodyKind::Chunked => self.read_chunked_piece(body).await,
        }
    }

    async fn read_chunked_piece(&mut self, body: &mut BodyState) -> Result<Chunk> {
        loop {
            if body.chunk_remaining > 0 {
                while self.buf.is_empty() {
                    if self.fill().await? == 0 {
                        bail!("connection closed mid chunked body");
                    }
                }
                let take = (self.buf.len() as u64).min(body.chunk_remaining) as usize;
                let data = self.buf.split_to(take).freeze();
                body.chunk_remaining -= take as u64;
                if body.chunk_remaining == 0 {
                    body.expect_crlf = true;
                }
                return Ok(Chunk { data, last: false });
            }
            if body.in_trailer {
                // Trailer section ends with an empty line. Progress lives in
                // `body`, so a read cancelled between lines resumes here
                // instead of re-parsing a size line.
                loop {
                    let line = self.read_line().await?;
                    if line.is_empty() {
                        break;
                    }
                }
                body.in_trailer = false;
                return Ok(Chunk::last_empty());
            }
            if body.expect_crlf {
                self.read_line().await?;
                body.expect_crlf = false;
            }
            let size_line = self.read_line().await?;
            let size_text = size_line
                .split(|&b| b == b';')
                .next()
                .unwrap_or(&size_line[..]);
            let size_text = std::str::from_utf8(size_text)
                .context("invalid chunk size line")?
                .trim();
            let size = u64::from_str_radix(size_text, 16)
                .with_context(|| format!("invalid chunk size: {:?}", size_text))?;
            if size == 0 {
                body.in_trailer = true;
                continue;
            }
            body.chunk_remaining = size;
        }
    }

    /// Reads one CRLF-terminated line, returning it without the terminator.
    async fn read_line(&mut self) -> Result<Bytes> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line = self.buf.split_to(pos + 1);
                line.truncate(pos);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                return Ok(line.freeze());
            }
            if self.buf.len() > MAX_HEAD_BYTES {
                bail!("line exceeds {} bytes", MAX_HEAD_BYTES);
            }
            if self.fill().await? == 0 {
                bail!("connection closed mid line");
            }
        }
    }

    /// Reads whatever bytes are available, for tunnel relaying. `None`
    /// means EOF.
    pub async fn read_raw(&mut self) -> Result<Option<Bytes>> {
        if !self.buf.is_empty() {
            return Ok(Some(self.buf.split().freeze()));
        }
        if self.fill().await? == 0 {
            return Ok(None);
        }
        Ok(Some(self.buf.split().freeze()))
    }
}

fn parse_version(version: Option<u8>) -> Version {
    match version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    }
}

fn collect_headers(parsed: &[httparse::Header<'_>]) -> Result<HeaderMap> {
    let mut headers = HeaderMap::with_capacity(parsed.len());
    for h in parsed {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .with_context(|| format!("invalid header name: {:?}", h.name))?;
        let value = HeaderValue::from_bytes(h.value).context("invalid header value")?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn version_text(version: Version) -> &'static str {
    if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else {
        "HTTP/1.1"
    }
}

fn encode_headers(headers: &HeaderMap, out: &mut BytesMut) {
    for (name, value) in headers.iter() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
}

pub fn encode_request_head(head: &RequestHead) -> Bytes {
    let mut out = BytesMut::with_capacity(256);
    out.extend_from_slice(head.method.as_str().as_bytes());
    out.extend_from_slice(b" ");
    out.extend_from_slice(head.target.as_bytes());
    out.extend_from_slice(b" ");
    out.extend_from_slice(version_text(head.version).as_bytes());
    out.extend_from_slice(b"\r\n");
    encode_headers(&head.headers, &mut out);
    out.extend_from_slice(b"\r\n");
    out.freeze()
}

pub fn encode_response_head(head: &ResponseHead) -> Bytes {
    let mut out = BytesMut::with_capacity(256);
    out.extend_from_slice(version_text(head.version).as_bytes());
    out.extend_from_slice(b" ");
    out.extend_from_slice(head.status.as_str().as_bytes());
    out.extend_from_slice(b" ");
    let reason = head
        .reason
        .as_deref()
        .or_else(|| head.status.canonical_reason())
        .unwrap_or("");
    out.extend_from_slice(reason.as_bytes());
    out.extend_from_slice(b"\r\n");
    encode_headers(&head.headers, &mut out);
    out.extend_from_slice(b"\r\n");
    out.freeze()
}

/// Encodes one body piece. When `chunked` is set the piece is framed as a
/// chunked-transfer chunk (and a terminal piece additionally emits the
/// zero-size terminator); otherwise the bytes pass through unframed.
pub fn encode_body_chunk(chunk: &Chunk, chunked: bool) -> Bytes {
    if !chunked {
        return chunk.data.clone();
    }
    let mut out = BytesMut::with_capacity(chunk.data.len() + 16);
    if !chunk.data.is_empty() {
        out.extend_from_slice(format!("{:X}\r\n", chunk.data.len()).as_bytes());
        out.extend_from_slice(&chunk.data);
        out.extend_from_slice(b"\r\n");
    }
    if chunk.last {
        out.extend_from_slice(b"0\r\n\r\n");
    }
    out.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn reader(input: &str) -> MessageReader<&[u8]> {
        MessageReader::new(input.as_bytes())
    }

    #[tokio::test]
    async fn parses_request_head() {
        let mut r = reader("GET http://example.com/x HTTP/1.1\r\nHost: example.com\r\n\r\n").await;
        let head = r.read_request_head().await.unwrap().unwrap();
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.target, "http://example.com/x");
        assert_eq!(head.version, Version::HTTP_11);
        assert_eq!(head.headers.get("host").unwrap(), "example.com");
    }

    #[tokio::test]
    async fn clean_eof_yields_none() {
        let mut r = reader("").await;
        assert!(r.read_request_head().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_head_is_an_error() {
        let mut r = reader("GET / HTTP/1.1\r\nHost: exa").await;
        assert!(r.read_request_head().await.is_err());
    }

    #[tokio::test]
    async fn request_ids_are_unique() {
        let a = RequestHead::new(Method::GET, "/", Version::HTTP_11);
        let b = RequestHead::new(Method::GET, "/", Version::HTTP_11);
        assert_ne!(a.id, b.id);
        assert_eq!(a.id, a.clone().id);
    }

    #[tokio::test]
    async fn reads_content_length_body() {
        let mut r = reader("HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello").await;
        let head = r.read_response_head().await.unwrap().unwrap();
        let kind = response_body_kind(&Method::GET, &head);
        assert_eq!(kind, BodyKind::Length(5));
        let mut body = BodyState::new(kind);
        let chunk = r.read_body_chunk(&mut body).await.unwrap();
        assert_eq!(&chunk.data[..], b"hello");
        assert!(chunk.last);
    }

    #[tokio::test]
    async fn reads_chunked_body_with_extension_and_trailer() {
        let mut r = reader(
            "HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
             5;ext=1\r\nhello\r\n6\r\n world\r\n0\r\nX-Trailer: 1\r\n\r\n",
        )
        .await;
        let head = r.read_response_head().await.unwrap().unwrap();
        let mut body = BodyState::new(response_body_kind(&Method::GET, &head));
        let mut collected = Vec::new();
        loop {
            let chunk = r.read_body_chunk(&mut body).await.unwrap();
            collected.extend_from_slice(&chunk.data);
            if chunk.last {
                break;
            }
        }
        assert_eq!(&collected[..], b"hello world");
    }

    #[tokio::test]
    async fn chunked_terminator_survives_a_cancelled_read() {
        use tokio::io::AsyncWriteExt;

        let (mut tx, rx) = tokio::io::duplex(64);
        let mut r = MessageReader::new(rx);
        let mut body = BodyState::new(BodyKind::Chunked);
        tx.write_all(b"5\r\nhello\r\n0\r\n").await.unwrap();
        let chunk = r.read_body_chunk(&mut body).await.unwrap();
        assert_eq!(&chunk.data[..], b"hello");

        // The terminator's trailing CRLF has not arrived yet; a concurrent
        // event can cancel the read right after the zero-size line.
        let interrupted = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            r.read_body_chunk(&mut body),
        )
        .await;
        assert!(interrupted.is_err());

        tx.write_all(b"\r\n").await.unwrap();
        let last = r.read_body_chunk(&mut body).await.unwrap();
        assert!(last.last && last.data.is_empty());
    }

    #[tokio::test]
    async fn until_close_body_ends_at_eof() {
        let mut r = reader("HTTP/1.1 200 OK\r\n\r\nall of it").await;
        let head = r.read_response_head().await.unwrap().unwrap();
        let kind = response_body_kind(&Method::GET, &head);
        assert_eq!(kind, BodyKind::UntilClose);
        let mut body = BodyState::new(kind);
        let first = r.read_body_chunk(&mut body).await.unwrap();
        assert_eq!(&first.data[..], b"all of it");
        assert!(!first.last);
        let last = r.read_body_chunk(&mut body).await.unwrap();
        assert!(last.last && last.data.is_empty());
    }

    #[tokio::test]
    async fn head_responses_have_no_body() {
        let mut head = ResponseHead::new(StatusCode::OK);
        head.headers
            .insert(CONTENT_LENGTH, HeaderValue::from_static("1234"));
        assert_eq!(response_body_kind(&Method::HEAD, &head), BodyKind::None);
    }

    #[test]
    fn encodes_chunked_frames() {
        let mid = Chunk {
            data: Bytes::from_static(b"hello"),
            last: false,
        };
        assert_eq!(&encode_body_chunk(&mid, true)[..], b"5\r\nhello\r\n");
        let last = Chunk {
            data: Bytes::from_static(b"bye"),
            last: true,
        };
        assert_eq!(&encode_body_chunk(&last, true)[..], b"3\r\nbye\r\n0\r\n\r\n");
        assert_eq!(&encode_body_chunk(&Chunk::last_empty(), true)[..], b"0\r\n\r\n");
        assert_eq!(&encode_body_chunk(&mid, false)[..], b"hello");
    }

    #[test]
    fn encodes_request_head_roundtrip_text() {
        let mut head = RequestHead::new(Method::GET, "/path", Version::HTTP_11);
        head.headers
            .insert("host", HeaderValue::from_static("example.com"));
        let text = encode_request_head(&head);
        assert_eq!(&text[..], b"GET /path HTTP/1.1\r\nhost: example.com\r\n\r\n");
    }
}
