//! Byte-offset recording for parsed headers.
//!
//! `httparse` hands back headers borrowing from the input buffer. This
//! crate needs to `split_to` that buffer (to freeze the consumed head
//! into an owned [`bytes::Bytes`]) before it can build owned header
//! values, so positions are recorded as offsets first and re-sliced from
//! the frozen buffer afterwards — the same two-step dance the corpus
//! uses, done here with a plain `Vec` instead of an uninitialized array.

#[derive(Clone, Copy)]
pub struct HeaderIndex {
    pub name: (usize, usize),
    pub value: (usize, usize),
}

impl HeaderIndex {
    /// Record the byte offsets of `headers` (borrowed from `buf`) relative
    /// to the start of `buf`.
    pub fn record(buf: &[u8], headers: &[httparse::Header<'_>]) -> Vec<Self> {
        let head = buf.as_ptr() as usize;
        headers
            .iter()
            .map(|header| {
                let name_start = header.name.as_ptr() as usize - head;
                let value_start = header.value.as_ptr() as usize - head;
                Self {
                    name: (name_start, name_start + header.name.len()),
                    value: (value_start, value_start + header.value.len()),
                }
            })
            .collect()
    }
}

/// Parse a `Content-Length` header value. Returns `None` for anything
/// that is not a bare non-negative decimal integer, per spec: an invalid
/// `Content-Length` is treated as if the header were absent.
pub fn parse_content_length(value: &[u8]) -> Option<u64> {
    let s = std::str::from_utf8(value).ok()?;
    let s = s.trim();
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse::<u64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_numeric_content_length() {
        assert_eq!(parse_content_length(b"not-a-number"), None);
        assert_eq!(parse_content_length(b"-1"), None);
        assert_eq!(parse_content_length(b"12"), Some(12));
        assert_eq!(parse_content_length(b" 12 "), Some(12));
    }
}
