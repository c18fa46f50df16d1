//! The response value object: an immutable head plus a caller-owned body
//! handle.
//!
//! Generic over the body type rather than the transport: the bare engine
//! hands back a `Response<ResponseBody<S>>`, while the pooled client
//! façade (`src/client.rs`) rewraps the body before handing the response
//! to its caller, so `Response` itself carries no transport bound.

use bytes::Bytes;
use http::Extensions;

use crate::request::Header;

/// An HTTP response. The head (`status`, `reason_phrase`, `headers`) is
/// immutable once built; the body is owned by the caller and draining it
/// drives whatever produced it.
pub struct Response<B> {
    status: u16,
    reason_phrase: Option<Bytes>,
    headers: Vec<Header>,
    body: B,
    extensions: Extensions,
}

impl<B> Response<B> {
    pub(crate) fn new(status: u16, reason_phrase: Option<Bytes>, headers: Vec<Header>, body: B) -> Self {
        Self { status, reason_phrase, headers, body, extensions: Extensions::new() }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn reason_phrase(&self) -> Option<&[u8]> {
        self.reason_phrase.as_deref()
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&Bytes> {
        self.headers.iter().find(|h| h.name.eq_ignore_ascii_case(name.as_bytes())).map(|h| &h.value)
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|h| h.name.eq_ignore_ascii_case(name.as_bytes()))
    }

    pub fn body(&self) -> &B {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut B {
        &mut self.body
    }

    pub fn into_body(self) -> B {
        self.body
    }

    /// Replace the body, keeping the head. Used by the pooled client
    /// façade to wrap the bare engine body in one that releases the
    /// connection back to the pool when it terminates.
    pub(crate) fn map_body<B2>(self, f: impl FnOnce(B) -> B2) -> Response<B2> {
        Response {
            status: self.status,
            reason_phrase: self.reason_phrase,
            headers: self.headers,
            body: f(self.body),
            extensions: self.extensions,
        }
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }
}

impl<B> std::fmt::Debug for Response<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("reason_phrase", &self.reason_phrase)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}
