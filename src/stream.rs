//! The narrow byte-transport interface the engine consumes.
//!
//! Acquiring a concrete stream (TCP dial, TLS handshake, a non-blocking
//! event loop) is out of scope here; callers hand the engine something
//! that already speaks these four operations.

use std::collections::HashMap;

use crate::error::Error;

/// A duplex byte transport bound exclusively to one [`crate::Connection`].
///
/// `read`/`write`/`close` are async because the concrete transport usually
/// is; `info` is synchronous metadata lookup (peer address, negotiated ALPN,
/// TLS version) keyed by an arbitrary string so this trait never needs to
/// grow new methods for new metadata.
pub trait ByteStream: Send + 'static {
    /// Read at most `max` bytes. An empty return means the peer closed the
    /// connection in an orderly fashion.
    fn read(&mut self, max: usize) -> impl Future<Output = Result<Vec<u8>, Error>> + Send;

    /// Write `bytes` in full.
    fn write(&mut self, bytes: &[u8]) -> impl Future<Output = Result<(), Error>> + Send;

    /// Close the transport. Idempotent: calling this more than once is not
    /// an error.
    fn close(&mut self) -> impl Future<Output = Result<(), Error>> + Send;

    /// Look up transport metadata by key. Returns `None` for unknown keys;
    /// this is never a protocol-affecting value, only diagnostic.
    fn info(&self, key: &str) -> Option<String>;
}

/// A trivial [`ByteStream`] implementation over an in-memory metadata map,
/// useful for transports that have nothing interesting to report.
#[derive(Default)]
pub struct StaticInfo(HashMap<String, String>);

impl StaticInfo {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).cloned()
    }
}
