//! Transfer-coding state machine shared by request encoding and response
//! decoding: content-length framing, chunked framing, and the "read until
//! peer close" / upgrade passthrough modes.

use bytes::{Buf, Bytes, BytesMut};
use tracing::trace;

use crate::error::Error;

/// How a body's bytes are framed on the wire, for either direction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransferCoding {
    /// No body at all.
    Eof,
    /// Exactly `n` more bytes remain, per `Content-Length`.
    Length(u64),
    /// Decoding a `Transfer-Encoding: chunked` body.
    DecodeChunked(ChunkedState, u64),
    /// Encoding a body as `Transfer-Encoding: chunked`.
    EncodeChunked,
    /// Pass bytes through untransformed until the peer closes.
    Upgrade,
}

impl TransferCoding {
    pub const fn eof() -> Self {
        Self::Eof
    }

    pub const fn length(len: u64) -> Self {
        Self::Length(len)
    }

    pub const fn decode_chunked() -> Self {
        Self::DecodeChunked(ChunkedState::Size, 0)
    }

    pub const fn encode_chunked() -> Self {
        Self::EncodeChunked
    }

    pub const fn upgrade() -> Self {
        Self::Upgrade
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Eof)
    }

    /// Encode one chunk of body bytes into `buf` per this coding.
    pub fn encode(&mut self, mut bytes: Bytes, buf: &mut BytesMut) {
        if bytes.is_empty() {
            return;
        }
        match self {
            Self::Upgrade => buf.extend_from_slice(&bytes),
            Self::EncodeChunked => encode_chunk(&bytes, buf),
            Self::Length(rem) => {
                let len = bytes.len() as u64;
                if *rem >= len {
                    *rem -= len;
                    buf.extend_from_slice(&bytes);
                } else {
                    let rem_usize = *rem as usize;
                    *rem = 0;
                    buf.extend_from_slice(&bytes.split_to(rem_usize));
                }
            }
            Self::Eof => {}
            Self::DecodeChunked(..) => unreachable!("decode coding used for encoding"),
        }
    }

    /// Write the terminating marker for this coding, if any (`0\r\n\r\n`
    /// for chunked; nothing otherwise).
    pub fn encode_eof(&mut self, buf: &mut BytesMut) {
        match *self {
            Self::Eof | Self::Upgrade | Self::Length(0) => {}
            Self::EncodeChunked => buf.extend_from_slice(b"0\r\n\r\n"),
            Self::Length(n) => unreachable!("end of body with {n} bytes still owed"),
            Self::DecodeChunked(..) => unreachable!("decode coding used for encoding"),
        }
    }

    /// Pull as much of the next chunk out of `src` as is available.
    pub fn decode(&mut self, src: &mut BytesMut) -> ChunkResult {
        match self {
            Self::Length(0) | Self::DecodeChunked(ChunkedState::End, _) => {
                *self = Self::Eof;
                ChunkResult::Eof
            }
            Self::Eof => ChunkResult::AlreadyEof,
            _ if src.is_empty() => ChunkResult::InsufficientData,
            Self::Length(rem) => ChunkResult::Ok(bounded_split(rem, src)),
            Self::Upgrade => ChunkResult::Ok(src.split().freeze()),
            Self::DecodeChunked(state, size) => loop {
                let mut out = None;
                *state = match state.step(src, size, &mut out) {
                    Ok(Some(next)) => next,
                    Ok(None) => return ChunkResult::InsufficientData,
                    Err(e) => return ChunkResult::Err(e),
                };
                if matches!(state, ChunkedState::End) {
                    return self.decode(src);
                }
                if let Some(out) = out {
                    return ChunkResult::Ok(out);
                }
            },
        }
    }
}

fn encode_chunk(bytes: &[u8], buf: &mut BytesMut) {
    let mut header = [0u8; 18];
    let len = itoa_hex(bytes.len() as u64, &mut header);
    buf.extend_from_slice(&header[..len]);
    buf.extend_from_slice(b"\r\n");
    buf.extend_from_slice(bytes);
    buf.extend_from_slice(b"\r\n");
}

fn itoa_hex(mut n: u64, out: &mut [u8; 18]) -> usize {
    if n == 0 {
        out[0] = b'0';
        return 1;
    }
    let mut tmp = [0u8; 16];
    let mut i = 16;
    while n > 0 {
        i -= 1;
        tmp[i] = b"0123456789abcdef"[(n & 0xf) as usize];
        n >>= 4;
    }
    let len = 16 - i;
    out[..len].copy_from_slice(&tmp[i..]);
    len
}

fn bounded_split(rem: &mut u64, buf: &mut BytesMut) -> Bytes {
    let len = buf.len() as u64;
    if *rem >= len {
        *rem -= len;
        buf.split().freeze()
    } else {
        let rem_usize = *rem as usize;
        *rem = 0;
        buf.split_to(rem_usize).freeze()
    }
}

/// The byte-level state machine walking a `chunked` encoded body.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ChunkedState {
    Size,
    SizeLws,
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    Trailer,
    TrailerLf,
    EndCr,
    EndLf,
    End,
}

macro_rules! byte {
    ($rdr:ident) => {{
        if $rdr.is_empty() {
            return Ok(None);
        }
        let b = $rdr[0];
        $rdr.advance(1);
        b
    }};
}

impl ChunkedState {
    fn step(&mut self, body: &mut BytesMut, size: &mut u64, buf: &mut Option<Bytes>) -> Result<Option<Self>, Error> {
        match *self {
            Self::Size => Self::read_size(body, size),
            Self::SizeLws => Self::read_size_lws(body),
            Self::Extension => Self::read_extension(body),
            Self::SizeLf => Self::read_size_lf(body, size),
            Self::Body => Self::read_body(body, size, buf),
            Self::BodyCr => Self::read_body_cr(body),
            Self::BodyLf => Self::read_body_lf(body),
            Self::Trailer => Self::read_trailer(body),
            Self::TrailerLf => Self::read_trailer_lf(body),
            Self::EndCr => Self::read_end_cr(body),
            Self::EndLf => Self::read_end_lf(body),
            Self::End => Ok(Some(Self::End)),
        }
    }

    fn read_size(rdr: &mut BytesMut, size: &mut u64) -> Result<Option<Self>, Error> {
        let radix = 16;
        match byte!(rdr) {
            b @ b'0'..=b'9' => {
                *size = size
                    .checked_mul(radix)
                    .and_then(|v| v.checked_add((b - b'0') as u64))
                    .ok_or_else(|| Error::protocol("chunk size overflow"))?;
            }
            b @ b'a'..=b'f' => {
                *size = size
                    .checked_mul(radix)
                    .and_then(|v| v.checked_add((b + 10 - b'a') as u64))
                    .ok_or_else(|| Error::protocol("chunk size overflow"))?;
            }
            b @ b'A'..=b'F' => {
                *size = size
                    .checked_mul(radix)
                    .and_then(|v| v.checked_add((b + 10 - b'A') as u64))
                    .ok_or_else(|| Error::protocol("chunk size overflow"))?;
            }
            b'\t' | b' ' => return Ok(Some(Self::SizeLws)),
            b';' => return Ok(Some(Self::Extension)),
            b'\r' => return Ok(Some(Self::SizeLf)),
            _ => return Err(Error::protocol("invalid chunk size digit")),
        }
        Ok(Some(Self::Size))
    }

    fn read_size_lws(rdr: &mut BytesMut) -> Result<Option<Self>, Error> {
        match byte!(rdr) {
            b'\t' | b' ' => Ok(Some(Self::SizeLws)),
            b';' => Ok(Some(Self::Extension)),
            b'\r' => Ok(Some(Self::SizeLf)),
            _ => Err(Error::protocol("invalid chunk size linear whitespace")),
        }
    }

    fn read_extension(rdr: &mut BytesMut) -> Result<Option<Self>, Error> {
        match byte!(rdr) {
            b'\r' => Ok(Some(Self::SizeLf)),
            b'\n' => Err(Error::protocol("chunk extension contains a bare newline")),
            _ => Ok(Some(Self::Extension)),
        }
    }

    fn read_size_lf(rdr: &mut BytesMut, size: &mut u64) -> Result<Option<Self>, Error> {
        match byte!(rdr) {
            b'\n' if *size > 0 => Ok(Some(Self::Body)),
            b'\n' if *size == 0 => Ok(Some(Self::EndCr)),
            _ => Err(Error::protocol("invalid chunk size line feed")),
        }
    }

    fn read_body(rdr: &mut BytesMut, rem: &mut u64, out: &mut Option<Bytes>) -> Result<Option<Self>, Error> {
        if rdr.is_empty() {
            Ok(None)
        } else {
            *out = Some(bounded_split(rem, rdr));
            if *rem > 0 { Ok(Some(Self::Body)) } else { Ok(Some(Self::BodyCr)) }
        }
    }

    fn read_body_cr(rdr: &mut BytesMut) -> Result<Option<Self>, Error> {
        match byte!(rdr) {
            b'\r' => Ok(Some(Self::BodyLf)),
            _ => Err(Error::protocol("invalid chunk body CR")),
        }
    }

    fn read_body_lf(rdr: &mut BytesMut) -> Result<Option<Self>, Error> {
        match byte!(rdr) {
            b'\n' => Ok(Some(Self::Size)),
            _ => Err(Error::protocol("invalid chunk body LF")),
        }
    }

    fn read_trailer(rdr: &mut BytesMut) -> Result<Option<Self>, Error> {
        trace!(target: "h1_engine", "skipping chunk trailer");
        match byte!(rdr) {
            b'\r' => Ok(Some(Self::TrailerLf)),
            _ => Ok(Some(Self::Trailer)),
        }
    }

    fn read_trailer_lf(rdr: &mut BytesMut) -> Result<Option<Self>, Error> {
        match byte!(rdr) {
            b'\n' => Ok(Some(Self::EndCr)),
            _ => Err(Error::protocol("invalid trailer end LF")),
        }
    }

    fn read_end_cr(rdr: &mut BytesMut) -> Result<Option<Self>, Error> {
        match byte!(rdr) {
            b'\r' => Ok(Some(Self::EndLf)),
            _ => Ok(Some(Self::Trailer)),
        }
    }

    fn read_end_lf(rdr: &mut BytesMut) -> Result<Option<Self>, Error> {
        match byte!(rdr) {
            b'\n' => Ok(Some(Self::End)),
            _ => Err(Error::protocol("invalid chunk end LF")),
        }
    }
}

#[derive(Debug)]
pub enum ChunkResult {
    /// A non-empty chunk of decoded bytes.
    Ok(Bytes),
    /// Chunk framing was malformed.
    Err(Error),
    /// More input bytes are required before a decision can be made.
    InsufficientData,
    /// The coder just reached end-of-body; this is the one and only time
    /// this value is returned.
    Eof,
    /// The coder already reached end-of-body on a previous call.
    AlreadyEof,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(coding: &mut TransferCoding, mut src: BytesMut) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            match coding.decode(&mut src) {
                ChunkResult::Ok(b) => out.extend_from_slice(&b),
                ChunkResult::Eof => break,
                ChunkResult::InsufficientData => break,
                ChunkResult::AlreadyEof => break,
                ChunkResult::Err(e) => panic!("{e}"),
            }
        }
        out
    }

    #[test]
    fn chunked_single_read() {
        let mut coding = TransferCoding::decode_chunked();
        let src = BytesMut::from(&b"10\r\n1234567890abcdef\r\n0\r\n\r\n"[..]);
        assert_eq!(decode_all(&mut coding, src), b"1234567890abcdef");
    }

    #[test]
    fn chunked_multiple_chunks() {
        let mut coding = TransferCoding::decode_chunked();
        let src = BytesMut::from(&b"5\r\nHello\r\n6\r\nWorld!\r\n0\r\n\r\n"[..]);
        assert_eq!(decode_all(&mut coding, src), b"HelloWorld!");
    }

    #[test]
    fn chunked_zero_length_body() {
        let mut coding = TransferCoding::decode_chunked();
        let src = BytesMut::from(&b"0\r\n\r\n"[..]);
        assert_eq!(decode_all(&mut coding, src), b"");
    }

    #[test]
    fn chunked_malformed_size_is_protocol_error() {
        let mut coding = TransferCoding::decode_chunked();
        let mut src = BytesMut::from(&b"zz\r\n"[..]);
        match coding.decode(&mut src) {
            ChunkResult::Err(e) => assert!(matches!(e.kind(), crate::error::Kind::Protocol)),
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[test]
    fn length_coding_truncates_overflow() {
        let mut coding = TransferCoding::length(5);
        let mut buf = BytesMut::new();
        coding.encode(Bytes::from_static(b"hello world"), &mut buf);
        assert_eq!(&buf[..], b"hello");
    }

    #[test]
    fn encode_chunked_round_trip() {
        let mut encoder = TransferCoding::encode_chunked();
        let mut buf = BytesMut::new();
        encoder.encode(Bytes::from_static(b"foo bar"), &mut buf);
        encoder.encode_eof(&mut buf);
        assert_eq!(&buf[..], b"7\r\nfoo bar\r\n0\r\n\r\n");
    }
}
