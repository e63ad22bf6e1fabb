use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Parse, ProtoError};

/// Request body transfer coding decoder and response body encoder.
pub enum TransferCoding {
    /// no body.
    Eof,
    /// sized body, remaining byte count.
    Length(u64),
    /// chunked request body decode state machine.
    DecodeChunked(ChunkedState, u64),
    /// chunked response body encode.
    EncodeChunked,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ChunkedState {
    Size,
    Ext,
    SizeLf,
    Data,
    DataCr,
    DataLf,
    TrailerCr,
    TrailerLine,
    End,
}

pub enum ChunkResult {
    Ok(Bytes),
    /// need more socket bytes.
    InsufficientData,
    Eof,
    Err(ProtoError),
}

impl TransferCoding {
    pub fn length(len: u64) -> Self {
        if len == 0 {
            Self::Eof
        } else {
            Self::Length(len)
        }
    }

    pub fn decode_chunked() -> Self {
        Self::DecodeChunked(ChunkedState::Size, 0)
    }

    pub fn encode_chunked() -> Self {
        Self::EncodeChunked
    }

    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Eof | Self::DecodeChunked(ChunkedState::End, _))
    }

    /// Pull the next decoded body chunk out of the read buffer.
    pub fn decode(&mut self, buf: &mut BytesMut) -> ChunkResult {
        match self {
            Self::Eof => ChunkResult::Eof,
            Self::Length(remaining) => {
                if buf.is_empty() {
                    return ChunkResult::InsufficientData;
                }
                let n = (*remaining).min(buf.len() as u64) as usize;
                let chunk = buf.split_to(n).freeze();
                *remaining -= n as u64;
                if *remaining == 0 {
                    *self = Self::Eof;
                }
                ChunkResult::Ok(chunk)
            }
            Self::DecodeChunked(state, size) => decode_chunked(state, size, buf),
            Self::EncodeChunked => ChunkResult::Err(ProtoError::Parse(Parse::Chunked)),
        }
    }

    /// Encode one response body chunk into the write buffer. A no-body
    /// coding (HEAD replies, 304) swallows the bytes.
    pub fn encode(&mut self, bytes: &[u8], buf: &mut BytesMut) {
        if bytes.is_empty() {
            return;
        }
        match self {
            Self::EncodeChunked => {
                let mut hex = [0u8; 16];
                let hex = hex_len(bytes.len(), &mut hex);
                buf.reserve(hex.len() + bytes.len() + 4);
                buf.put_slice(hex);
                buf.put_slice(b"\r\n");
                buf.put_slice(bytes);
                buf.put_slice(b"\r\n");
            }
            Self::Length(_) => buf.put_slice(bytes),
            Self::Eof | Self::DecodeChunked(..) => {}
        }
    }

    pub fn encode_eof(&mut self, buf: &mut BytesMut) {
        if let Self::EncodeChunked = self {
            buf.put_slice(b"0\r\n\r\n");
        }
    }
}

fn hex_len(mut n: usize, out: &mut [u8; 16]) -> &[u8] {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut i = 16;
    loop {
        i -= 1;
        out[i] = DIGITS[n & 0xf];
        n >>= 4;
        if n == 0 {
            break;
        }
    }
    // shift used digits to the front.
    out.copy_within(i.., 0);
    &out[..16 - i]
}

fn decode_chunked(state: &mut ChunkedState, size: &mut u64, buf: &mut BytesMut) -> ChunkResult {
    loop {
        match *state {
            ChunkedState::Size => {
                let Some(b) = next_byte(buf) else {
                    return ChunkResult::InsufficientData;
                };
                match b {
                    b'0'..=b'9' => *size = shift_hex(size, b - b'0'),
                    b'a'..=b'f' => *size = shift_hex(size, b - b'a' + 10),
                    b'A'..=b'F' => *size = shift_hex(size, b - b'A' + 10),
                    b';' => *state = ChunkedState::Ext,
                    b'\r' => *state = ChunkedState::SizeLf,
                    _ => return chunk_err(),
                }
                if *size == u64::MAX {
                    return chunk_err();
                }
            }
            ChunkedState::Ext => {
                let Some(b) = next_byte(buf) else {
                    return ChunkResult::InsufficientData;
                };
                if b == b'\r' {
                    *state = ChunkedState::SizeLf;
                }
            }
            ChunkedState::SizeLf => {
                let Some(b) = next_byte(buf) else {
                    return ChunkResult::InsufficientData;
                };
                if b != b'\n' {
                    return chunk_err();
                }
                *state = if *size == 0 {
                    ChunkedState::TrailerCr
                } else {
                    ChunkedState::Data
                };
            }
            ChunkedState::Data => {
                if buf.is_empty() {
                    return ChunkResult::InsufficientData;
                }
                let n = (*size).min(buf.len() as u64) as usize;
                let chunk = buf.split_to(n).freeze();
                *size -= n as u64;
                if *size == 0 {
                    *state = ChunkedState::DataCr;
                }
                return ChunkResult::Ok(chunk);
            }
            ChunkedState::DataCr => {
                let Some(b) = next_byte(buf) else {
                    return ChunkResult::InsufficientData;
                };
                if b != b'\r' {
                    return chunk_err();
                }
                *state = ChunkedState::DataLf;
            }
            ChunkedState::DataLf => {
                let Some(b) = next_byte(buf) else {
                    return ChunkResult::InsufficientData;
                };
                if b != b'\n' {
                    return chunk_err();
                }
                *state = ChunkedState::Size;
            }
            // after the zero chunk: either the final crlf or trailer lines.
            ChunkedState::TrailerCr => {
                let Some(b) = peek_byte(buf) else {
                    return ChunkResult::InsufficientData;
                };
                if b == b'\r' {
                    buf.advance(1);
                    let Some(b) = next_byte(buf) else {
                        return ChunkResult::InsufficientData;
                    };
                    if b != b'\n' {
                        return chunk_err();
                    }
                    *state = ChunkedState::End;
                    return ChunkResult::Eof;
                }
                *state = ChunkedState::TrailerLine;
            }
            ChunkedState::TrailerLine => {
                let Some(b) = next_byte(buf) else {
                    return ChunkResult::InsufficientData;
                };
                if b == b'\n' {
                    *state = ChunkedState::TrailerCr;
                }
            }
            ChunkedState::End => return ChunkResult::Eof,
        }
    }
}

fn shift_hex(size: &u64, digit: u8) -> u64 {
    // reject absurd sizes before they overflow.
    if *size > u64::MAX >> 8 {
        return u64::MAX;
    }
    (*size << 4) | digit as u64
}

fn next_byte(buf: &mut BytesMut) -> Option<u8> {
    if buf.is_empty() {
        None
    } else {
        let b = buf[0];
        buf.advance(1);
        Some(b)
    }
}

fn peek_byte(buf: &BytesMut) -> Option<u8> {
    buf.first().copied()
}

#[cold]
#[inline(never)]
fn chunk_err() -> ChunkResult {
    ChunkResult::Err(ProtoError::Parse(Parse::Chunked))
}

#[cfg(test)]
mod test {
    use super::*;

    fn collect(coding: &mut TransferCoding, buf: &mut BytesMut) -> (Vec<u8>, bool) {
        let mut out = Vec::new();
        loop {
            match coding.decode(buf) {
                ChunkResult::Ok(chunk) => out.extend_from_slice(&chunk),
                ChunkResult::Eof => return (out, true),
                ChunkResult::InsufficientData => return (out, false),
                ChunkResult::Err(e) => panic!("decode error: {e}"),
            }
        }
    }

    #[test]
    fn length_decode() {
        let mut coding = TransferCoding::length(5);
        let mut buf = BytesMut::from(&b"hello extra"[..]);
        let (out, eof) = collect(&mut coding, &mut buf);
        assert_eq!(out, b"hello");
        assert!(eof);
        // pipelined bytes stay in the buffer.
        assert_eq!(&buf[..], b" extra");
    }

    #[test]
    fn length_decode_split() {
        let mut coding = TransferCoding::length(6);
        let mut buf = BytesMut::from(&b"abc"[..]);
        let (out, eof) = collect(&mut coding, &mut buf);
        assert_eq!(out, b"abc");
        assert!(!eof);
        buf.extend_from_slice(b"def");
        let (out, eof) = collect(&mut coding, &mut buf);
        assert_eq!(out, b"def");
        assert!(eof);
    }

    #[test]
    fn chunked_decode() {
        let mut coding = TransferCoding::decode_chunked();
        let mut buf = BytesMut::from(&b"4\r\nWiki\r\n5;ext=1\r\npedia\r\n0\r\n\r\nrest"[..]);
        let (out, eof) = collect(&mut coding, &mut buf);
        assert_eq!(out, b"Wikipedia");
        assert!(eof);
        assert!(coding.is_eof());
        assert_eq!(&buf[..], b"rest");
    }

    #[test]
    fn chunked_decode_with_trailer() {
        let mut coding = TransferCoding::decode_chunked();
        let mut buf = BytesMut::from(&b"3\r\nabc\r\n0\r\nX-Sum: 1\r\n\r\n"[..]);
        let (out, eof) = collect(&mut coding, &mut buf);
        assert_eq!(out, b"abc");
        assert!(eof);
    }

    #[test]
    fn chunked_decode_incremental() {
        let full = b"a\r\n0123456789\r\n0\r\n\r\n";
        let mut coding = TransferCoding::decode_chunked();
        let mut buf = BytesMut::new();
        let mut out = Vec::new();
        let mut eof = false;
        for b in full.iter() {
            buf.extend_from_slice(&[*b]);
            let (chunk, done) = collect(&mut coding, &mut buf);
            out.extend_from_slice(&chunk);
            eof = done;
        }
        assert_eq!(out, b"0123456789");
        assert!(eof);
    }

    #[test]
    fn chunked_bad_framing() {
        let mut coding = TransferCoding::decode_chunked();
        let mut buf = BytesMut::from(&b"zz\r\n"[..]);
        assert!(matches!(coding.decode(&mut buf), ChunkResult::Err(_)));
    }

    #[test]
    fn chunked_encode() {
        let mut coding = TransferCoding::encode_chunked();
        let mut buf = BytesMut::new();
        coding.encode(b"hello", &mut buf);
        coding.encode(b"", &mut buf);
        coding.encode_eof(&mut buf);
        assert_eq!(&buf[..], b"5\r\nhello\r\n0\r\n\r\n");
    }

    #[test]
    fn sized_encode_passthrough() {
        let mut coding = TransferCoding::length(5);
        let mut buf = BytesMut::new();
        coding.encode(b"hello", &mut buf);
        coding.encode_eof(&mut buf);
        assert_eq!(&buf[..], b"hello");
    }
}
