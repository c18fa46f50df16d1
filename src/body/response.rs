//! A response body: each chunk is pulled, lazily, from the engine that
//! produced it. Mirrors `RequestBody`'s at-most-once contract but the
//! producer lives on the other side of a [`crate::engine::Connection`]
//! rather than inside this struct.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use tracing::trace;

use crate::engine::{BodyEvent, Connection};
use crate::error::Error;
use crate::stream::ByteStream;

type PullFuture = Pin<Box<dyn Future<Output = Result<BodyEvent, Error>> + Send>>;

/// A response body, owned by the caller but delegating each chunk to the
/// connection that parsed it. Iteration drives the engine; it cannot be
/// restarted once exhausted or closed.
pub struct ResponseBody<S> {
    conn: Connection<S>,
    generation: u64,
    declared_length: Option<u64>,
    chunked: bool,
    encoding: Option<Bytes>,
    bytes_read: u64,
    /// Set on any terminal state, whether the body ran out on its own or
    /// was closed early. Further polls short-circuit instead of touching
    /// `conn`/`pending` again.
    closed: bool,
    /// Set only by an explicit [`Self::close`] called before the body ran
    /// out on its own. Distinguishes "iteration already finished"
    /// (further polls quietly return `None`) from "the caller closed this
    /// early" (further polls must fail per spec.md §4.2).
    explicitly_closed: bool,
    pending: Option<PullFuture>,
}

impl<S: ByteStream> ResponseBody<S> {
    pub(crate) fn new(
        conn: Connection<S>,
        generation: u64,
        declared_length: Option<u64>,
        chunked: bool,
        encoding: Option<Bytes>,
    ) -> Self {
        Self {
            conn,
            generation,
            declared_length,
            chunked,
            encoding,
            bytes_read: 0,
            closed: false,
            explicitly_closed: false,
            pending: None,
        }
    }

    pub fn declared_length(&self) -> Option<u64> {
        self.declared_length
    }

    pub fn chunked(&self) -> bool {
        self.chunked
    }

    pub fn encoding(&self) -> Option<&[u8]> {
        self.encoding.as_deref()
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Concatenate every remaining chunk into one buffer.
    pub async fn drain_to_buffer(&mut self) -> Result<Bytes, Error> {
        let mut out = BytesMut::new();
        loop {
            match std::future::poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await {
                Some(Ok(chunk)) => out.extend_from_slice(&chunk),
                Some(Err(e)) => return Err(e),
                None => break,
            }
        }
        Ok(out.freeze())
    }

    /// Close the body early. Idempotent. Tells the owning connection the
    /// body was not fully consumed, so it cannot be reused (spec.md §4.2).
    /// Every subsequent poll then fails instead of quietly ending
    /// iteration, distinguishing an early close from natural exhaustion.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.explicitly_closed = true;
        self.pending = None;
        self.conn.body_finished(self.generation, false).await;
    }

    fn spawn_pull(&self) -> PullFuture {
        let conn = self.conn.clone();
        let generation = self.generation;
        let declared_length = self.declared_length;
        let bytes_read_so_far = self.bytes_read;
        Box::pin(async move {
            let event = conn.pull_body_chunk(generation).await?;
            match event {
                BodyEvent::Chunk(bytes) => {
                    let total = bytes_read_so_far + bytes.len() as u64;
                    if let Some(declared) = declared_length {
                        if total > declared {
                            conn.body_finished(generation, false).await;
                            return Err(Error::protocol(format!(
                                "response body exceeded its declared length of {declared} bytes"
                            )));
                        }
                    }
                    Ok(BodyEvent::Chunk(bytes))
                }
                BodyEvent::EndOfBody => {
                    conn.body_finished(generation, true).await;
                    Ok(BodyEvent::EndOfBody)
                }
            }
        })
    }
}

impl<S: ByteStream> Stream for ResponseBody<S> {
    type Item = Result<Bytes, Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.explicitly_closed {
            return Poll::Ready(Some(Err(Error::state("iteration attempted on a closed response body"))));
        }
        if this.closed {
            return Poll::Ready(None);
        }

        if this.pending.is_none() {
            this.pending = Some(this.spawn_pull());
        }

        let result = match this.pending.as_mut().unwrap().as_mut().poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(result) => result,
        };
        this.pending = None;

        match result {
            Ok(BodyEvent::Chunk(bytes)) => {
                this.bytes_read += bytes.len() as u64;
                trace!(target: "h1_engine", len = bytes.len(), total = this.bytes_read, "response body chunk consumed");
                Poll::Ready(Some(Ok(bytes)))
            }
            Ok(BodyEvent::EndOfBody) => {
                this.closed = true;
                Poll::Ready(None)
            }
            Err(e) => {
                this.closed = true;
                Poll::Ready(Some(Err(e)))
            }
        }
    }
}
