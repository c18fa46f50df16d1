//! Streaming body types. Request bodies are supplied by the caller up
//! front; response bodies are produced lazily by the engine as the wire
//! is read. Both are at-most-once [`futures_core::Stream`]s.

pub mod request;
pub mod response;

pub use request::RequestBody;
pub use response::ResponseBody;
