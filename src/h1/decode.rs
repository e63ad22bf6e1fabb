use bytes::BytesMut;
use http::{
    header::{HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, EXPECT, TRANSFER_ENCODING},
    HeaderMap, Method, Version,
};

use crate::error::{Parse, ProtoError};

use super::codec::TransferCoding;

const MAX_HEADERS: usize = 96;

/// Parsed request head plus the body decoder derived from its framing
/// headers.
pub struct RequestHead {
    pub method: Method,
    /// request target exactly as received.
    pub target: String,
    pub version: Version,
    pub headers: HeaderMap,
    /// effective keep-alive: the version default overridden by the last
    /// recognized `Connection` token. The responder consumes this; the
    /// `Connection` header is parsed exactly once, here.
    pub keep_alive: bool,
    /// the last recognized `Connection` token was an explicit `keep-alive`.
    pub asked_keep_alive: bool,
    pub expect_continue: bool,
    pub decoder: TransferCoding,
    /// wire size of the head, for byte accounting.
    pub head_len: usize,
}

/// Try to parse one request head out of the read buffer. `Ok(None)` means
/// more bytes are needed; the buffer is only consumed on a complete parse.
pub fn decode_head(buf: &mut BytesMut, max_head: usize) -> Result<Option<RequestHead>, ProtoError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);

    let head_len = match parsed.parse(buf.as_ref())? {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => {
            if buf.len() >= max_head {
                return Err(Parse::HeaderTooLarge.into());
            }
            return Ok(None);
        }
    };

    let method = Method::from_bytes(parsed.method.unwrap_or("").as_bytes())
        .map_err(|_| ProtoError::from(Parse::Method))?;
    let target = parsed.path.ok_or(ProtoError::Parse(Parse::Uri))?.to_owned();
    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        Some(1) => Version::HTTP_11,
        _ => return Err(Parse::Version.into()),
    };

    let mut map = HeaderMap::with_capacity(parsed.headers.len());
    for header in parsed.headers.iter() {
        let name = HeaderName::from_bytes(header.name.as_bytes())
            .map_err(|_| ProtoError::from(Parse::Malformed))?;
        let value = HeaderValue::from_bytes(header.value)
            .map_err(|_| ProtoError::from(Parse::Malformed))?;
        map.append(name, value);
    }

    let mut explicit = None;
    if let Some(conn) = map.get(CONNECTION).and_then(|v| v.to_str().ok()) {
        for token in conn.split(',') {
            let token = token.trim();
            if token.eq_ignore_ascii_case("close") {
                explicit = Some(false);
            } else if token.eq_ignore_ascii_case("keep-alive") {
                explicit = Some(true);
            }
        }
    }
    let keep_alive = explicit.unwrap_or(version == Version::HTTP_11);
    let asked_keep_alive = explicit == Some(true);

    let expect_continue = map
        .get(EXPECT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"));

    let decoder = body_decoder(&map)?;

    let _ = buf.split_to(head_len);

    Ok(Some(RequestHead {
        method,
        target,
        version,
        headers: map,
        keep_alive,
        asked_keep_alive,
        expect_continue,
        decoder,
        head_len,
    }))
}

fn body_decoder(headers: &HeaderMap) -> Result<TransferCoding, ProtoError> {
    let chunked = headers
        .get(TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("chunked")));

    let mut lengths = headers.get_all(CONTENT_LENGTH).iter();
    let length = match lengths.next() {
        Some(value) => {
            // multiple differing content-length headers are a smuggling vector.
            if lengths.next().is_some() {
                return Err(Parse::ContentLength.into());
            }
            let value = value
                .to_str()
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok())
                .ok_or(ProtoError::Parse(Parse::ContentLength))?;
            Some(value)
        }
        None => None,
    };

    match (chunked, length) {
        (true, Some(_)) => Err(Parse::ContentLength.into()),
        (true, None) => Ok(TransferCoding::decode_chunked()),
        (false, Some(n)) => Ok(TransferCoding::length(n)),
        (false, None) => Ok(TransferCoding::Eof),
    }
}

impl RequestHead {
    pub fn has_body(&self) -> bool {
        !self.decoder.is_eof()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn simple_get() {
        let mut buf = BytesMut::from(&b"GET /a/b?x=1 HTTP/1.1\r\nHost: ex.com\r\n\r\nGET /next"[..]);
        let head = decode_head(&mut buf, 8192).unwrap().unwrap();
        assert_eq!(head.method, Method::GET);
        assert_eq!(head.target, "/a/b?x=1");
        assert_eq!(head.version, Version::HTTP_11);
        assert!(head.keep_alive);
        assert!(!head.has_body());
        assert_eq!(head.headers.get("host").unwrap(), "ex.com");
        // pipelined bytes survive.
        assert_eq!(&buf[..], b"GET /next");
    }

    #[test]
    fn partial_returns_none() {
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nHost: e"[..]);
        assert!(decode_head(&mut buf, 8192).unwrap().is_none());
        assert_eq!(buf.len(), 23);
    }

    #[test]
    fn head_too_large() {
        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nHost: e"[..]);
        assert!(matches!(
            decode_head(&mut buf, 10),
            Err(ProtoError::Parse(Parse::HeaderTooLarge))
        ));
    }

    #[test]
    fn connection_close_http10() {
        let mut buf = BytesMut::from(&b"GET / HTTP/1.0\r\n\r\n"[..]);
        let head = decode_head(&mut buf, 8192).unwrap().unwrap();
        assert!(!head.keep_alive);
        assert!(!head.asked_keep_alive);

        let mut buf = BytesMut::from(&b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n"[..]);
        let head = decode_head(&mut buf, 8192).unwrap().unwrap();
        assert!(head.keep_alive);
        assert!(head.asked_keep_alive);

        let mut buf = BytesMut::from(&b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n"[..]);
        let head = decode_head(&mut buf, 8192).unwrap().unwrap();
        assert!(!head.keep_alive);
        assert!(!head.asked_keep_alive);
    }

    #[test]
    fn conflicting_connection_tokens_last_wins() {
        let mut buf =
            BytesMut::from(&b"GET / HTTP/1.1\r\nConnection: keep-alive, close\r\n\r\n"[..]);
        let head = decode_head(&mut buf, 8192).unwrap().unwrap();
        assert!(!head.keep_alive);
        assert!(!head.asked_keep_alive);

        let mut buf =
            BytesMut::from(&b"GET / HTTP/1.1\r\nConnection: close, keep-alive\r\n\r\n"[..]);
        let head = decode_head(&mut buf, 8192).unwrap().unwrap();
        assert!(head.keep_alive);
        assert!(head.asked_keep_alive);
    }

    #[test]
    fn content_length_body() {
        let mut buf = BytesMut::from(&b"POST /u HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc"[..]);
        let head = decode_head(&mut buf, 8192).unwrap().unwrap();
        assert!(head.has_body());
        assert!(matches!(head.decoder, TransferCoding::Length(3)));
        assert_eq!(&buf[..], b"abc");
    }

    #[test]
    fn chunked_body() {
        let mut buf =
            BytesMut::from(&b"POST /u HTTP/1.1\r\nTransfer-Encoding: gzip, chunked\r\n\r\n"[..]);
        let head = decode_head(&mut buf, 8192).unwrap().unwrap();
        assert!(matches!(head.decoder, TransferCoding::DecodeChunked(..)));
    }

    #[test]
    fn conflicting_framing_rejected() {
        let mut buf = BytesMut::from(
            &b"POST / HTTP/1.1\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\n"[..],
        );
        assert!(decode_head(&mut buf, 8192).is_err());

        let mut buf =
            BytesMut::from(&b"POST / HTTP/1.1\r\nContent-Length: 3\r\nContent-Length: 4\r\n\r\n"[..]);
        assert!(decode_head(&mut buf, 8192).is_err());
    }

    #[test]
    fn expect_continue() {
        let mut buf = BytesMut::from(
            &b"POST / HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 1\r\n\r\n"[..],
        );
        let head = decode_head(&mut buf, 8192).unwrap().unwrap();
        assert!(head.expect_continue);
    }

    #[test]
    fn bad_content_length() {
        let mut buf = BytesMut::from(&b"POST / HTTP/1.1\r\nContent-Length: abc\r\n\r\n"[..]);
        assert!(matches!(
            decode_head(&mut buf, 8192),
            Err(ProtoError::Parse(Parse::ContentLength))
        ));
    }
}
