//! The immutable request value object.

use bytes::Bytes;
use http::Method;

use crate::body::RequestBody;
use crate::origin::Origin;

/// An ordered `(name, value)` header pair, stored as raw bytes. Lookup is
/// case-insensitive; emission preserves whatever case the caller supplied.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Header {
    pub name: Bytes,
    pub value: Bytes,
}

impl Header {
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self { name: name.into(), value: value.into() }
    }

    fn name_eq(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name.as_bytes())
    }
}

/// An immutable HTTP request: method, origin-form target, an `Origin`
/// triple naming where to send it, ordered headers, and an optional body.
///
/// Construction never parses a URL; the caller supplies `origin` and
/// `target` already split, per spec.
#[derive(Clone, Debug)]
pub struct Request {
    method: Method,
    target: Bytes,
    origin: Origin,
    headers: Vec<Header>,
    body: Option<RequestBodyHandle>,
}

/// `RequestBody` does not implement `Clone` (it may own a boxed stream),
/// so a `Request` carrying one is only cheaply clonable when the body is
/// absent. Callers that need to clone a bodied request should `take_body`
/// and reconstruct. This wrapper exists purely so `Request` can still
/// derive the rest of its fields as `Clone` without forcing `RequestBody:
/// Clone` onto the whole struct.
#[derive(Debug)]
struct RequestBodyHandle(RequestBody);

impl Clone for RequestBodyHandle {
    fn clone(&self) -> Self {
        panic!("Request::clone called on a request carrying a body; take the body out first")
    }
}

impl Request {
    pub fn new(method: Method, target: impl Into<Bytes>, origin: Origin) -> Self {
        Self { method, target: target.into(), origin, headers: Vec::new(), body: None }
    }

    pub fn get(target: impl Into<Bytes>, origin: Origin) -> Self {
        Self::new(Method::GET, target, origin)
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn target(&self) -> &[u8] {
        &self.target
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn headers(&self) -> &[Header] {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&Bytes> {
        self.headers.iter().find(|h| h.name_eq(name)).map(|h| &h.value)
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|h| h.name_eq(name))
    }

    pub fn body(&self) -> Option<&RequestBody> {
        self.body.as_ref().map(|h| &h.0)
    }

    pub fn take_body(&mut self) -> Option<RequestBody> {
        self.body.take().map(|h| h.0)
    }

    pub fn with_method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn with_target(mut self, target: impl Into<Bytes>) -> Self {
        self.target = target.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        self.headers.push(Header::new(name, value));
        self
    }

    pub fn with_headers(mut self, headers: impl IntoIterator<Item = Header>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = Some(RequestBodyHandle(body));
        self
    }
}
