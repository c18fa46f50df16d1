//! Per-exchange parser/encoder flags carried across a `Connection`'s
//! lifetime and reset between exchanges.

/// Flags accumulated while encoding a request and decoding its response,
/// reset at the start of every exchange.
#[derive(Debug, Default)]
pub struct Context {
    close: bool,
    head_method: bool,
}

impl Context {
    pub fn reset(&mut self) {
        self.close = false;
        self.head_method = false;
    }

    pub fn is_close(&self) -> bool {
        self.close
    }

    pub fn set_close(&mut self) {
        self.close = true;
    }

    pub fn is_head_method(&self) -> bool {
        self.head_method
    }

    pub fn set_head_method(&mut self) {
        self.head_method = true;
    }

    /// Interpret a `Connection` header value, folding in any `close`
    /// token. Unlike `keep-alive`, a `close` token is sticky for the rest
    /// of the exchange once observed (matches the common interpretation:
    /// a later repeated header does not un-close a connection that is
    /// already marked for closing by the request or an earlier header).
    pub fn note_connection_header(&mut self, value: &[u8]) {
        if let Ok(value) = std::str::from_utf8(value) {
            for token in value.split(',') {
                if token.trim().eq_ignore_ascii_case("close") {
                    self.close = true;
                }
            }
        }
    }
}
