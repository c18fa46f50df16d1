//! In-memory [`ByteStream`] test double shared by the body, engine, pool,
//! and client test modules. Not part of the public API.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use http::uri::Scheme;

use crate::error::Error;
use crate::origin::Origin;
use crate::request::Request;
use crate::stream::{ByteStream, StaticInfo};

/// A `ByteStream` double that serves pre-scripted inbound bytes and
/// records whatever is written to it. `inbound` drains in whatever chunk
/// sizes the caller requests; once exhausted, `read` returns an empty
/// buffer forever, matching the "empty read means orderly close" contract.
#[derive(Clone)]
pub struct MockStream {
    inbound: Arc<Mutex<VecDeque<u8>>>,
    written: Arc<Mutex<Vec<u8>>>,
    closed: Arc<Mutex<bool>>,
    info: Arc<StaticInfo>,
}

impl MockStream {
    pub fn with_canned_response(bytes: &[u8]) -> Self {
        let mut info = StaticInfo::new();
        info.insert("peer", "mock:0").insert("transport", "memory");
        Self {
            inbound: Arc::new(Mutex::new(bytes.iter().copied().collect())),
            written: Arc::new(Mutex::new(Vec::new())),
            closed: Arc::new(Mutex::new(false)),
            info: Arc::new(info),
        }
    }

    pub fn empty() -> Self {
        Self::with_canned_response(b"")
    }

    /// Append more bytes as if the peer sent a second response (used to
    /// script keep-alive reuse across two exchanges on one connection).
    pub fn feed(&self, bytes: &[u8]) {
        self.inbound.lock().unwrap().extend(bytes.iter().copied());
    }

    pub fn written_bytes(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }
}

impl ByteStream for MockStream {
    async fn read(&mut self, max: usize) -> Result<Vec<u8>, Error> {
        let mut inbound = self.inbound.lock().unwrap();
        let n = max.min(inbound.len());
        Ok(inbound.drain(..n).collect())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.written.lock().unwrap().extend_from_slice(bytes);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), Error> {
        *self.closed.lock().unwrap() = true;
        Ok(())
    }

    fn info(&self, key: &str) -> Option<String> {
        self.info.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_reports_scripted_transport_metadata() {
        let stream = MockStream::with_canned_response(b"");
        assert_eq!(stream.info("peer").as_deref(), Some("mock:0"));
        assert_eq!(stream.info("unknown-key"), None);
    }
}

pub fn origin() -> Origin {
    Origin::new(Scheme::HTTP, "example.com", 80)
}

pub fn simple_get() -> Request {
    Request::get("/x", origin()).with_header("Host", "example.com")
}
