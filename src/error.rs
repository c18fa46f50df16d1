//! Error taxonomy shared by the connection engine, body streams, and pool.

use std::fmt;
use std::time::Duration;

/// Coarse classification of a failure.
///
/// This mirrors the failure taxonomy a caller needs to branch on: whether
/// a retry at a higher layer is meaningful, whether the connection that
/// produced the error is still usable (it never is, for `Transport`,
/// `Timeout`, and `Protocol`), and whether the failure says anything about
/// the wider pool (`Capacity`, `State`).
#[derive(Debug)]
pub enum Kind {
    /// The underlying `ByteStream` failed: connect failure, read/write
    /// error, or an orderly close where more bytes were expected.
    Transport,
    /// A configured deadline elapsed.
    Timeout { deadline: Duration },
    /// Malformed head, unexpected end-of-body, bad chunk framing, an
    /// over-length body, or a peer close in the middle of a head.
    Protocol,
    /// The pool is at a configured capacity limit.
    Capacity,
    /// An operation was attempted against a connection or pool in the
    /// wrong lifecycle state (busy, closed, stopped).
    State,
    /// The caller cancelled the operation.
    Cancelled,
}

/// The error type returned by every fallible operation in this crate.
pub struct Error {
    kind: Kind,
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    pub fn new(kind: Kind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), source: None }
    }

    pub fn with_source(
        kind: Kind,
        message: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self { kind, message: message.into(), source: Some(source.into()) }
    }

    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(Kind::Transport, message)
    }

    pub fn timeout(deadline: Duration, message: impl Into<String>) -> Self {
        Self::new(Kind::Timeout { deadline }, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(Kind::Protocol, message)
    }

    pub fn capacity(message: impl Into<String>) -> Self {
        Self::new(Kind::Capacity, message)
    }

    pub fn state(message: impl Into<String>) -> Self {
        Self::new(Kind::State, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(Kind::Cancelled, message)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Kind::Timeout { deadline } => write!(f, "{} (deadline: {:?})", self.message, deadline),
            _ => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::TimedOut {
            return Self::with_source(Kind::Timeout { deadline: Duration::ZERO }, "io operation timed out", e);
        }
        Self::with_source(Kind::Transport, "transport io error", e)
    }
}
