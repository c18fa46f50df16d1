//! The per-connection HTTP/1.1 state machine: request framing, response
//! parsing, reuse decision, and timeouts.
//!
//! Grounded on the teacher's `http/src/h1/proto/{encode,decode}.rs` head
//! codec and `http/src/h1/dispatcher.rs` exchange loop, reworked from
//! server-side (decode request / encode response) to client-side (encode
//! request / decode response) and collapsed from a generic `D: DateTime`
//! context into the single-exchange-at-a-time shape this spec calls for.

use std::future::poll_fn;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use http::Method;
use httparse::Status;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::body::{RequestBody, ResponseBody};
use crate::config::EngineConfig;
use crate::error::Error;
use crate::proto::{ChunkResult, Context, HeaderIndex, TransferCoding};
use crate::request::{Header, Request};
use crate::response::Response;
use crate::stream::ByteStream;

/// Lifecycle state of one [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Freshly dialed, never used.
    New,
    /// An exchange is in flight.
    Active,
    /// Pooled and eligible for reuse.
    Idle,
    /// Terminal; the transport has been closed.
    Closed,
}

/// A point-in-time snapshot of a connection's counters, for callers that
/// want to read them without holding the connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionStats {
    pub requests_served: u32,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: u32,
}

/// What pulling on a [`ResponseBody`] produced.
pub(crate) enum BodyEvent {
    Chunk(Bytes),
    EndOfBody,
}

struct ParsedHead {
    status: u16,
    reason: Option<Bytes>,
    headers: Vec<Header>,
    declared_length: Option<u64>,
    chunked: bool,
    encoding: Option<Bytes>,
}

struct Inner<S> {
    stream: S,
    state: State,
    config: EngineConfig,
    context: Context,
    read_buf: BytesMut,
    decoder: TransferCoding,
    /// Scratch slot used only inside `encode_head`/`write_request` to hand
    /// the encoded head line back without an extra return value threaded
    /// through a `Future` combinator; always `None` outside of one call.
    write_buf_pending: Option<BytesMut>,
    /// Set when the response framing fell through to read-until-close
    /// (spec.md §4.3 case 4): such a body can never be reused even if no
    /// `Connection: close` header was present.
    reuse_denied: bool,
    /// Bumped every time the connection returns to `Idle`, so a stale
    /// [`ResponseBody`] from a previous exchange can never drive a new one.
    generation: u64,
    requests_served: u32,
    bytes_sent: u64,
    bytes_received: u64,
    errors: u32,
    idle_since: Option<Instant>,
}

impl<S: ByteStream> Inner<S> {
    async fn close(&mut self) {
        if self.state == State::Closed {
            return;
        }
        self.state = State::Closed;
        if let Err(e) = self.stream.close().await {
            warn!(target: "h1_engine", error = %e, "error closing transport");
        } else {
            debug!(target: "h1_engine", "connection closed");
        }
    }

    async fn fail(&mut self, e: &Error) {
        self.errors += 1;
        warn!(target: "h1_engine", kind = ?e.kind(), "exchange failed: {e}");
        self.close().await;
    }

    async fn read_chunk(&mut self, max: usize) -> Result<Vec<u8>, Error> {
        let fut = self.stream.read(max);
        match tokio::time::timeout(self.config.read_timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(Error::timeout(self.config.read_timeout, "timed out waiting for a response read")),
        }
    }

    fn encode_head(&mut self, req: &Request) -> TransferCoding {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(req.method().as_str().as_bytes());
        buf.extend_from_slice(b" ");
        buf.extend_from_slice(req.target());
        buf.extend_from_slice(b" HTTP/1.1\r\n");
        for h in req.headers() {
            buf.extend_from_slice(&h.name);
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(&h.value);
            buf.extend_from_slice(b"\r\n");
        }

        let coding = match req.body() {
            None => TransferCoding::eof(),
            Some(b) if b.chunked() => {
                if !req.has_header("transfer-encoding") {
                    buf.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
                }
                TransferCoding::encode_chunked()
            }
            Some(b) => match b.declared_length() {
                Some(n) => {
                    if !req.has_header("content-length") {
                        buf.extend_from_slice(format!("Content-Length: {n}\r\n").as_bytes());
                    }
                    TransferCoding::length(n)
                }
                None => {
                    if !req.has_header("transfer-encoding") {
                        buf.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
                    }
                    TransferCoding::encode_chunked()
                }
            },
        };
        buf.extend_from_slice(b"\r\n");
        self.write_buf_pending = Some(buf);
        coding
    }

    async fn write_request(&mut self, req: &mut Request) -> Result<(), Error> {
        let mut coding = self.encode_head(req);
        let head = self.write_buf_pending.take().expect("encode_head always sets write_buf_pending");
        self.bytes_sent += head.len() as u64;
        self.stream.write(&head).await?;

        if let Some(mut body) = req.take_body() {
            loop {
                let next = poll_fn(|cx| Pin::new(&mut body).poll_next(cx)).await;
                match next {
                    Some(Ok(chunk)) => {
                        let mut out = BytesMut::new();
                        coding.encode(chunk, &mut out);
                        if !out.is_empty() {
                            self.bytes_sent += out.len() as u64;
                            self.stream.write(&out).await?;
                        }
                    }
                    Some(Err(e)) => return Err(e),
                    None => break,
                }
            }
            let mut out = BytesMut::new();
            coding.encode_eof(&mut out);
            if !out.is_empty() {
                self.bytes_sent += out.len() as u64;
                self.stream.write(&out).await?;
            }
        }

        Ok(())
    }

    async fn read_response_head(&mut self) -> Result<ParsedHead, Error> {
        loop {
            if let Some(head) = self.try_parse_head()? {
                return Ok(head);
            }
            let chunk = self.read_chunk(self.config.read_buffer_size).await?;
            if chunk.is_empty() {
                return Err(Error::protocol("peer closed before a complete response head was received"));
            }
            self.bytes_received += chunk.len() as u64;
            self.read_buf.extend_from_slice(&chunk);
        }
    }

    fn try_parse_head(&mut self) -> Result<Option<ParsedHead>, Error> {
        const MAX_HEADERS: usize = 96;
        let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut raw_headers);

        let status = match parsed.parse(&self.read_buf) {
            Ok(Status::Complete(len)) => len,
            Ok(Status::Partial) => {
                if self.read_buf.len() >= self.config.read_buffer_size * 4 {
                    return Err(Error::protocol("response head exceeded the maximum buffered size"));
                }
                return Ok(None);
            }
            Err(e) => return Err(Error::protocol(format!("malformed response head: {e}"))),
        };

        let index = HeaderIndex::record(&self.read_buf, parsed.headers);
        let status_code = parsed.code.ok_or_else(|| Error::protocol("response head missing status code"))?;
        let reason = parsed.reason.filter(|r| !r.is_empty()).map(|r| Bytes::copy_from_slice(r.as_bytes()));

        let slice = self.read_buf.split_to(status).freeze();

        let mut headers = Vec::with_capacity(index.len());
        let mut declared_length = None;
        let mut chunked = false;
        let mut encoding = None;
        for idx in &index {
            let name = slice.slice(idx.name.0..idx.name.1);
            let value = slice.slice(idx.value.0..idx.value.1);

            if name.eq_ignore_ascii_case(b"connection") {
                self.context.note_connection_header(&value);
            } else if name.eq_ignore_ascii_case(b"transfer-encoding") {
                if let Ok(s) = std::str::from_utf8(&value) {
                    if s.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("chunked")) {
                        chunked = true;
                    }
                }
            } else if name.eq_ignore_ascii_case(b"content-length") {
                if let Some(n) = crate::proto::header::parse_content_length(&value) {
                    declared_length = Some(n);
                }
            } else if name.eq_ignore_ascii_case(b"content-encoding") {
                encoding = Some(value.clone());
            }

            headers.push(Header::new(name, value));
        }

        let is_bodyless =
            matches!(status_code, 100..=199 | 204 | 304) || self.context.is_head_method();

        let decoder = if is_bodyless {
            declared_length = None;
            chunked = false;
            TransferCoding::eof()
        } else if chunked {
            declared_length = None;
            TransferCoding::decode_chunked()
        } else if let Some(n) = declared_length {
            TransferCoding::length(n)
        } else {
            self.reuse_denied = true;
            TransferCoding::upgrade()
        };

        self.decoder = decoder;

        Ok(Some(ParsedHead { status: status_code, reason, headers, declared_length, chunked, encoding }))
    }
}

/// A unique handle bound to one [`ByteStream`]. Cheaply `Clone`-able
/// (an `Arc` underneath); every clone refers to the same underlying
/// connection and the same single in-flight-exchange guard.
pub struct Connection<S> {
    inner: Arc<Mutex<Inner<S>>>,
}

impl<S> Clone for Connection<S> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<S> Connection<S> {
    /// True if `self` and `other` are handles onto the same underlying
    /// connection. Used by the pool to find a leased connection's entry
    /// on release without requiring `Connection` to implement `Eq`.
    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl<S: ByteStream> Connection<S> {
    pub fn new(stream: S, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                stream,
                state: State::New,
                config,
                context: Context::default(),
                read_buf: BytesMut::new(),
                decoder: TransferCoding::eof(),
                write_buf_pending: None,
                reuse_denied: false,
                generation: 0,
                requests_served: 0,
                bytes_sent: 0,
                bytes_received: 0,
                errors: 0,
                idle_since: None,
            })),
        }
    }

    pub async fn state(&self) -> State {
        self.inner.lock().await.state
    }

    pub async fn stats(&self) -> ConnectionStats {
        let guard = self.inner.lock().await;
        ConnectionStats {
            requests_served: guard.requests_served,
            bytes_sent: guard.bytes_sent,
            bytes_received: guard.bytes_received,
            errors: guard.errors,
        }
    }

    pub async fn idle_since(&self) -> Option<Instant> {
        self.inner.lock().await.idle_since
    }

    pub async fn requests_served(&self) -> u32 {
        self.inner.lock().await.requests_served
    }

    /// True if this connection has been `Idle` for longer than `timeout`.
    pub async fn is_idle_expired(&self, timeout: Duration) -> bool {
        match self.inner.lock().await.idle_since {
            Some(since) => since.elapsed() > timeout,
            None => false,
        }
    }

    /// Drive one request/response exchange. Fails fast with
    /// [`crate::error::Kind::State`] if another exchange is already in
    /// flight or the connection is closed.
    pub async fn exchange(&self, mut req: Request) -> Result<Response<ResponseBody<S>>, Error> {
        let mut guard = self.inner.lock().await;
        match guard.state {
            State::Closed => return Err(Error::state("exchange attempted on a closed connection")),
            State::Active => return Err(Error::state("exchange already in progress on this connection")),
            State::New | State::Idle => {}
        }

        guard.state = State::Active;
        guard.context.reset();
        guard.reuse_denied = false;
        if let Some(v) = req.header("connection") {
            guard.context.note_connection_header(v);
        }
        if *req.method() == Method::HEAD {
            guard.context.set_head_method();
        }

        let mut cancel_guard = CancelGuard::new(self.clone());

        let write_timeout = guard.config.write_timeout;
        let write_result = tokio::time::timeout(write_timeout, guard.write_request(&mut req)).await;
        let write_result = match write_result {
            Ok(r) => r,
            Err(_) => Err(Error::timeout(write_timeout, "timed out writing the request")),
        };
        if let Err(e) = write_result {
            guard.fail(&e).await;
            cancel_guard.disarm();
            return Err(e);
        }

        let head = match guard.read_response_head().await {
            Ok(h) => h,
            Err(e) => {
                guard.fail(&e).await;
                cancel_guard.disarm();
                return Err(e);
            }
        };

        debug!(target: "h1_engine", status = head.status, "response head parsed");

        let generation = guard.generation;
        cancel_guard.disarm();
        drop(guard);

        let body = ResponseBody::new(self.clone(), generation, head.declared_length, head.chunked, head.encoding);
        Ok(Response::new(head.status, head.reason, head.headers, body))
    }

    /// Called by a [`ResponseBody`] to pull the next chunk. Rejected with
    /// [`crate::error::Kind::State`] if `generation` no longer matches
    /// (the connection was reused or closed since the body was created).
    pub(crate) async fn pull_body_chunk(&self, generation: u64) -> Result<BodyEvent, Error> {
        let mut guard = self.inner.lock().await;
        if guard.generation != generation {
            return Err(Error::state("response body pulled after its connection was reused"));
        }
        if guard.state != State::Active {
            return Err(Error::state("response body pulled on a connection that is no longer active"));
        }

        let mut cancel_guard = CancelGuard::new(self.clone());

        loop {
            match guard.decoder.decode(&mut guard.read_buf) {
                ChunkResult::Ok(bytes) => {
                    trace!(target: "h1_engine", len = bytes.len(), "response body chunk");
                    cancel_guard.disarm();
                    return Ok(BodyEvent::Chunk(bytes));
                }
                ChunkResult::Eof | ChunkResult::AlreadyEof => {
                    cancel_guard.disarm();
                    return Ok(BodyEvent::EndOfBody);
                }
                ChunkResult::Err(e) => {
                    guard.fail(&e).await;
                    cancel_guard.disarm();
                    return Err(e);
                }
                ChunkResult::InsufficientData => {
                    let read_until_close = matches!(guard.decoder, TransferCoding::Upgrade);
                    match guard.read_chunk(guard.config.read_buffer_size).await {
                        Ok(bytes) if bytes.is_empty() => {
                            if read_until_close {
                                guard.decoder = TransferCoding::eof();
                                cancel_guard.disarm();
                                return Ok(BodyEvent::EndOfBody);
                            }
                            let e = Error::protocol("peer closed before the declared body was fully received");
                            guard.fail(&e).await;
                            cancel_guard.disarm();
                            return Err(e);
                        }
                        Ok(bytes) => {
                            guard.bytes_received += bytes.len() as u64;
                            guard.read_buf.extend_from_slice(&bytes);
                        }
                        Err(e) => {
                            guard.fail(&e).await;
                            cancel_guard.disarm();
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    /// Called exactly once by a [`ResponseBody`] when it terminates,
    /// either at a clean end-of-body (`consumed = true`) or an early
    /// `close()` (`consumed = false`).
    pub(crate) async fn body_finished(&self, generation: u64, consumed: bool) {
        let mut guard = self.inner.lock().await;
        if guard.generation != generation || guard.state != State::Active {
            return;
        }

        if !consumed {
            warn!(target: "h1_engine", "response body closed early; connection cannot be reused");
            guard.close().await;
            return;
        }

        let will_hit_cap = guard.requests_served + 1 >= guard.config.max_requests_per_connection;
        guard.requests_served += 1;

        let reusable = !guard.context.is_close() && !guard.reuse_denied && !will_hit_cap;
        if reusable {
            guard.context.reset();
            guard.idle_since = Some(Instant::now());
            guard.generation += 1;
            guard.state = State::Idle;
            debug!(target: "h1_engine", requests_served = guard.requests_served, "connection returned to idle");
        } else {
            debug!(target: "h1_engine", requests_served = guard.requests_served, "connection not eligible for reuse");
            guard.close().await;
        }
    }

    /// Explicitly close the connection. Idempotent.
    pub async fn close(&self) {
        self.inner.lock().await.close().await;
    }
}

/// Ensures a cancelled `exchange`/body pull still closes the connection
/// (spec.md §5 cancellation semantics) even though the `MutexGuard`
/// borrowed from `self.inner` is released the instant the holding future
/// is dropped. Declared after the guard it protects so it drops first
/// during cancellation, before the lock is released, and schedules the
/// actual close as a detached task that waits for the lock.
struct CancelGuard<S> {
    conn: Connection<S>,
    armed: bool,
}

impl<S: ByteStream> CancelGuard<S> {
    fn new(conn: Connection<S>) -> Self {
        Self { conn, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<S: ByteStream> Drop for CancelGuard<S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let conn = self.conn.clone();
        tokio::spawn(async move {
            let mut guard = conn.inner.lock().await;
            if guard.state == State::Active {
                warn!(target: "h1_engine", "in-flight exchange was cancelled; closing connection");
                guard.close().await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{self, MockStream};

    fn conn(response: &[u8]) -> Connection<MockStream> {
        Connection::new(MockStream::with_canned_response(response), EngineConfig::default())
    }

    #[tokio::test]
    async fn status_204_has_zero_length_body_regardless_of_content_length() {
        let c = conn(b"HTTP/1.1 204 No Content\r\nContent-Length: 5\r\n\r\nhello");
        let resp = c.exchange(test_support::simple_get()).await.unwrap();
        assert_eq!(resp.status(), 204);
        let out = resp.into_body().drain_to_buffer().await.unwrap();
        assert!(out.is_empty());
        assert_eq!(c.state().await, State::Idle);
    }

    #[tokio::test]
    async fn status_304_has_zero_length_body_regardless_of_content_length() {
        let c = conn(b"HTTP/1.1 304 Not Modified\r\nContent-Length: 12\r\n\r\nhello world!");
        let resp = c.exchange(test_support::simple_get()).await.unwrap();
        assert_eq!(resp.status(), 304);
        let out = resp.into_body().drain_to_buffer().await.unwrap();
        assert!(out.is_empty());
        assert_eq!(c.state().await, State::Idle);
    }

    #[tokio::test]
    async fn head_response_has_zero_length_body_regardless_of_content_length() {
        let c = conn(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");
        let req = Request::new(Method::HEAD, "/x", test_support::origin()).with_header("Host", "example.com");
        let resp = c.exchange(req).await.unwrap();
        let out = resp.into_body().drain_to_buffer().await.unwrap();
        assert!(out.is_empty());
        assert_eq!(c.state().await, State::Idle);
    }

    #[tokio::test]
    async fn exchange_is_rejected_while_another_is_already_active() {
        let c = conn(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");
        let resp = c.exchange(test_support::simple_get()).await.unwrap();
        // the first exchange's body is still undrained, so the connection
        // is still `Active`.
        let err = c.exchange(test_support::simple_get()).await.unwrap_err();
        assert!(matches!(err.kind(), crate::error::Kind::State));
        resp.into_body().drain_to_buffer().await.unwrap();
    }

    #[tokio::test]
    async fn exchange_is_rejected_on_a_closed_connection() {
        let c = conn(b"");
        c.close().await;
        let err = c.exchange(test_support::simple_get()).await.unwrap_err();
        assert!(matches!(err.kind(), crate::error::Kind::State));
    }

    #[tokio::test]
    async fn read_timeout_fails_the_exchange_and_closes_the_connection() {
        let stream = SlowStream::new(MockStream::empty(), Duration::from_millis(30), Duration::ZERO);
        let config = EngineConfig { read_timeout: Duration::from_millis(5), ..EngineConfig::default() };
        let c = Connection::new(stream, config);
        let err = c.exchange(test_support::simple_get()).await.unwrap_err();
        assert!(matches!(err.kind(), crate::error::Kind::Timeout));
        assert_eq!(c.state().await, State::Closed);
    }

    #[tokio::test]
    async fn write_timeout_fails_the_exchange_and_closes_the_connection() {
        let inner = MockStream::with_canned_response(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        let stream = SlowStream::new(inner, Duration::ZERO, Duration::from_millis(30));
        let config = EngineConfig { write_timeout: Duration::from_millis(5), ..EngineConfig::default() };
        let c = Connection::new(stream, config);
        let err = c.exchange(test_support::simple_get()).await.unwrap_err();
        assert!(matches!(err.kind(), crate::error::Kind::Timeout));
        assert_eq!(c.state().await, State::Closed);
    }

    /// Wraps a `MockStream`, sleeping before each read/write so timeout
    /// configs shorter than the sleep reliably elapse first. Real (short)
    /// wall-clock delays, not a paused test clock.
    struct SlowStream {
        inner: MockStream,
        read_delay: Duration,
        write_delay: Duration,
    }

    impl SlowStream {
        fn new(inner: MockStream, read_delay: Duration, write_delay: Duration) -> Self {
            Self { inner, read_delay, write_delay }
        }
    }

    impl ByteStream for SlowStream {
        async fn read(&mut self, max: usize) -> Result<Vec<u8>, Error> {
            if !self.read_delay.is_zero() {
                tokio::time::sleep(self.read_delay).await;
            }
            self.inner.read(max).await
        }

        async fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
            if !self.write_delay.is_zero() {
                tokio::time::sleep(self.write_delay).await;
            }
            self.inner.write(bytes).await
        }

        async fn close(&mut self) -> Result<(), Error> {
            self.inner.close().await
        }

        fn info(&self, key: &str) -> Option<String> {
            self.inner.info(key)
        }
    }
}
