#![forbid(unsafe_code)]

//! An HTTP/1.1 client transport core: a per-connection engine that frames
//! requests and parses responses, a streaming body framework for both
//! directions, and a connection pool with per-origin capacity and idle
//! expiration. The byte transport itself (TCP, TLS, dialing) is supplied
//! by the caller through [`stream::ByteStream`]; this crate owns nothing
//! below that boundary.

mod body;
mod client;
mod config;
mod engine;
mod error;
mod origin;
mod pool;
mod proto;
mod request;
mod response;
mod stream;

#[cfg(test)]
mod test_support;

pub use body::{RequestBody, ResponseBody};
pub use client::{Client, ClientResponseBody};
pub use config::{EngineConfig, PoolConfig};
pub use engine::{Connection, ConnectionStats, State};
pub use error::{Error, Kind};
pub use origin::Origin;
pub use pool::{Connector, OriginSizes, Pool, PoolSizes, PoolStats};
pub use request::{Header, Request};
pub use response::Response;
pub use stream::{ByteStream, StaticInfo};

// re-export the `http` crate types this crate's public API is built on.
pub use http;

// re-export the `bytes` crate for callers constructing `Header`s/bodies.
pub use bytes;
