//! Lazy, at-most-once request body production.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;

use crate::error::Error;

enum RequestBodyKind {
    SingleBuffer(Option<Bytes>),
    BufferList(VecDeque<Bytes>),
    UserProducer(Pin<Box<dyn Stream<Item = Result<Bytes, Error>> + Send>>),
}

/// A request body: a single buffer, an ordered list of buffers, or a
/// caller-supplied async producer. Yields zero or more non-empty chunks
/// and then terminates; it cannot be restarted.
pub struct RequestBody {
    kind: RequestBodyKind,
    declared_length: Option<u64>,
    chunked: bool,
    bytes_yielded: u64,
    /// Set once the stream reaches a terminal state, whether by running
    /// out naturally or by an explicit [`Self::close`]. Further polls
    /// short-circuit instead of touching `kind` again.
    closed: bool,
    /// Set only by an explicit [`Self::close`] called before the stream
    /// ran out on its own. Distinguishes "iteration already finished"
    /// (further polls quietly return `None`) from "the caller closed this
    /// early" (further polls must fail per spec.md §4.2).
    explicitly_closed: bool,
}

impl RequestBody {
    /// A body made of a single buffer. `declared_length` is set
    /// automatically from the buffer's length.
    pub fn from_buffer(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let declared_length = Some(bytes.len() as u64);
        Self {
            kind: RequestBodyKind::SingleBuffer(Some(bytes)),
            declared_length,
            chunked: false,
            bytes_yielded: 0,
            closed: false,
            explicitly_closed: false,
        }
    }

    /// A body made of an ordered list of buffers. Empty buffers are
    /// dropped up front; `declared_length` is the sum of what remains.
    pub fn from_buffers(buffers: impl IntoIterator<Item = Bytes>) -> Self {
        let mut total = 0u64;
        let queue: VecDeque<Bytes> = buffers
            .into_iter()
            .filter(|b| !b.is_empty())
            .map(|b| {
                total += b.len() as u64;
                b
            })
            .collect();
        Self {
            kind: RequestBodyKind::BufferList(queue),
            declared_length: Some(total),
            chunked: false,
            bytes_yielded: 0,
            closed: false,
            explicitly_closed: false,
        }
    }

    /// A body driven by a caller-supplied async producer. Its total
    /// length is unknowable up front, so `declared_length` and `chunked`
    /// are taken as given; a `declared_length` mismatch surfaces as a
    /// [`crate::error::Kind::Protocol`] error when the producer finishes.
    pub fn from_stream<S>(stream: S, declared_length: Option<u64>, chunked: bool) -> Self
    where
        S: Stream<Item = Result<Bytes, Error>> + Send + 'static,
    {
        Self {
            kind: RequestBodyKind::UserProducer(Box::pin(stream)),
            declared_length,
            chunked,
            bytes_yielded: 0,
            closed: false,
            explicitly_closed: false,
        }
    }

    pub fn with_chunked(mut self, chunked: bool) -> Self {
        self.chunked = chunked;
        self
    }

    /// Override the declared length. For statically-sized bodies
    /// (buffer / buffer list) this is validated immediately against the
    /// actual total and rejected on mismatch; for a streaming producer it
    /// is taken on faith and checked later, at drain time.
    pub fn with_declared_length(mut self, declared_length: Option<u64>) -> Result<Self, Error> {
        if !matches!(self.kind, RequestBodyKind::UserProducer(_)) {
            let actual = self.static_total();
            if let Some(n) = declared_length {
                if actual != n {
                    return Err(Error::protocol(format!(
                        "declared request body length {n} does not match the {actual} bytes actually present"
                    )));
                }
            }
        }
        self.declared_length = declared_length;
        Ok(self)
    }

    fn static_total(&self) -> u64 {
        match &self.kind {
            RequestBodyKind::SingleBuffer(b) => b.as_ref().map_or(0, |b| b.len() as u64),
            RequestBodyKind::BufferList(q) => q.iter().map(|b| b.len() as u64).sum(),
            RequestBodyKind::UserProducer(_) => 0,
        }
    }

    pub fn declared_length(&self) -> Option<u64> {
        self.declared_length
    }

    pub fn chunked(&self) -> bool {
        self.chunked
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Idempotent: calling this more than once, or after the stream has
    /// already run out on its own, has no further effect. Calling it
    /// before the stream would otherwise have finished makes every
    /// subsequent poll fail with [`crate::error::Kind::State`] instead of
    /// quietly ending iteration (spec.md §4.2: "`close()` is idempotent
    /// and makes further iteration fail").
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.explicitly_closed = true;
    }

    /// Concatenate every remaining chunk into one buffer.
    pub async fn drain_to_buffer(&mut self) -> Result<Bytes, Error> {
        let mut out = BytesMut::new();
        loop {
            let next = std::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await;
            match next {
                Some(Ok(chunk)) => out.extend_from_slice(&chunk),
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }
        Ok(out.freeze())
    }

    fn finish(&mut self) -> Poll<Option<Result<Bytes, Error>>> {
        self.closed = true;
        if let Some(declared) = self.declared_length {
            if self.bytes_yielded != declared {
                return Poll::Ready(Some(Err(Error::protocol(format!(
                    "request body produced {} bytes, declared length was {declared}",
                    self.bytes_yielded
                )))));
            }
        }
        Poll::Ready(None)
    }
}

impl Stream for RequestBody {
    type Item = Result<Bytes, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.explicitly_closed {
            return Poll::Ready(Some(Err(Error::state("iteration attempted on a closed request body"))));
        }
        if this.closed {
            return Poll::Ready(None);
        }

        match &mut this.kind {
            RequestBodyKind::SingleBuffer(slot) => match slot.take() {
                Some(b) if !b.is_empty() => {
                    this.bytes_yielded += b.len() as u64;
                    Poll::Ready(Some(Ok(b)))
                }
                _ => this.finish(),
            },
            RequestBodyKind::BufferList(queue) => loop {
                match queue.pop_front() {
                    Some(b) if !b.is_empty() => {
                        this.bytes_yielded += b.len() as u64;
                        return Poll::Ready(Some(Ok(b)));
                    }
                    Some(_) => continue,
                    None => return this.finish(),
                }
            },
            RequestBodyKind::UserProducer(stream) => loop {
                match stream.as_mut().poll_next(cx) {
                    Poll::Ready(Some(Ok(b))) if b.is_empty() => continue,
                    Poll::Ready(Some(Ok(b))) => {
                        this.bytes_yielded += b.len() as u64;
                        return Poll::Ready(Some(Ok(b)));
                    }
                    Poll::Ready(Some(Err(e))) => {
                        this.closed = true;
                        return Poll::Ready(Some(Err(e)));
                    }
                    Poll::Ready(None) => return this.finish(),
                    Poll::Pending => return Poll::Pending,
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(body: &mut RequestBody) -> Result<Vec<Bytes>, Error> {
        let mut chunks = Vec::new();
        loop {
            match std::future::poll_fn(|cx| Pin::new(&mut *body).poll_next(cx)).await {
                Some(Ok(b)) => chunks.push(b),
                Some(Err(e)) => return Err(e),
                None => return Ok(chunks),
            }
        }
    }

    #[tokio::test]
    async fn single_buffer_yields_one_chunk() {
        let mut body = RequestBody::from_buffer(Bytes::from_static(b"hello"));
        let chunks = drain(&mut body).await.unwrap();
        assert_eq!(chunks, vec![Bytes::from_static(b"hello")]);
        assert_eq!(body.declared_length(), Some(5));
    }

    #[tokio::test]
    async fn empty_single_buffer_yields_no_chunks() {
        let mut body = RequestBody::from_buffer(Bytes::new());
        let chunks = drain(&mut body).await.unwrap();
        assert!(chunks.is_empty());
    }

    #[tokio::test]
    async fn buffer_list_skips_empty_entries() {
        let mut body = RequestBody::from_buffers(vec![
            Bytes::from_static(b"a"),
            Bytes::new(),
            Bytes::from_static(b"b"),
        ]);
        let chunks = drain(&mut body).await.unwrap();
        assert_eq!(chunks, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
        assert_eq!(body.declared_length(), Some(2));
    }

    #[test]
    fn mismatched_static_length_is_rejected_at_construction() {
        let body = RequestBody::from_buffer(Bytes::from_static(b"hello")).with_declared_length(Some(4));
        assert!(body.is_err());
    }

    #[tokio::test]
    async fn stream_length_mismatch_is_a_protocol_error_at_drain() {
        let stream = futures::stream::once(async { Ok(Bytes::from_static(b"short")) });
        let mut body = RequestBody::from_stream(stream, Some(10), false);
        let err = drain(&mut body).await.unwrap_err();
        assert!(matches!(err.kind(), crate::error::Kind::Protocol));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_fails_further_iteration() {
        let mut body = RequestBody::from_buffer(Bytes::from_static(b"hello"));
        body.close();
        body.close();
        let err = drain(&mut body).await.unwrap_err();
        assert!(matches!(err.kind(), crate::error::Kind::State));
    }

    #[tokio::test]
    async fn close_after_natural_exhaustion_does_not_poison_further_polls() {
        let mut body = RequestBody::from_buffer(Bytes::from_static(b"hi"));
        let chunks = drain(&mut body).await.unwrap();
        assert_eq!(chunks, vec![Bytes::from_static(b"hi")]);
        // the stream already ran out on its own; closing it afterward is a
        // no-op, so iterating again still quietly yields nothing rather
        // than failing.
        body.close();
        let chunks = drain(&mut body).await.unwrap();
        assert!(chunks.is_empty());
    }
}
