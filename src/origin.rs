//! The `(scheme, host, port)` triple that keys a pooled connection.

use std::fmt;

use http::uri::Scheme;

/// Identifies the remote endpoint a connection is dialed to and pooled
/// under. Built by the caller, never derived from parsing a URL.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct Origin {
    scheme: Scheme,
    host: Box<str>,
    port: u16,
}

impl Origin {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self { scheme, host: host.into().into_boxed_str(), port }
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Debug for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_triples_hash_and_compare_equal() {
        let a = Origin::new(Scheme::HTTP, "example.com", 80);
        let b = Origin::new(Scheme::HTTP, "example.com", 80);
        assert_eq!(a, b);

        let c = Origin::new(Scheme::HTTP, "example.com", 8080);
        assert_ne!(a, c);
    }
}
