use std::time::SystemTime;

use bytes::{BufMut, BytesMut};
use http::{
    header::{CONTENT_LENGTH, DATE, TRANSFER_ENCODING},
    HeaderMap, StatusCode, Version,
};

use crate::body::BodySize;

use super::codec::TransferCoding;

/// Write a response head into the buffer and derive the body encoder.
///
/// Framing precedence: an explicit `Content-Length` header wins, then an
/// explicit `Transfer-Encoding: chunked`, then the body size tag. 1xx/204/304
/// responses and HEAD replies carry no body bytes regardless of framing
/// headers.
///
/// Returns the encoder and the number of head bytes written.
pub fn encode_head(
    buf: &mut BytesMut,
    version: Version,
    status: StatusCode,
    headers: &HeaderMap,
    body_size: BodySize,
    head_only: bool,
) -> (TransferCoding, usize) {
    let start = buf.len();

    encode_status_line(buf, version, status);

    let suppress_framing = status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED;

    let mut explicit_len = None;
    let mut explicit_chunked = false;

    let mut date_written = false;
    for (name, value) in headers.iter() {
        if name == CONTENT_LENGTH {
            if suppress_framing {
                continue;
            }
            explicit_len = std::str::from_utf8(value.as_bytes())
                .ok()
                .and_then(|v| v.trim().parse::<u64>().ok());
        } else if name == TRANSFER_ENCODING {
            if suppress_framing {
                continue;
            }
            explicit_chunked = value
                .to_str()
                .is_ok_and(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("chunked")));
        } else if name == DATE {
            date_written = true;
        }

        buf.reserve(name.as_str().len() + value.as_bytes().len() + 4);
        put_canonical_name(buf, name.as_str());
        buf.put_slice(b": ");
        buf.put_slice(value.as_bytes());
        buf.put_slice(b"\r\n");
    }

    if !date_written {
        buf.put_slice(b"Date: ");
        buf.put_slice(httpdate::fmt_http_date(SystemTime::now()).as_bytes());
        buf.put_slice(b"\r\n");
    }

    let mut coding = if suppress_framing {
        TransferCoding::Eof
    } else if let Some(len) = explicit_len {
        TransferCoding::length(len)
    } else if explicit_chunked {
        TransferCoding::encode_chunked()
    } else {
        match body_size {
            BodySize::Sized(len) => {
                buf.put_slice(b"Content-Length: ");
                buf.put_slice(itoa::Buffer::new().format(len).as_bytes());
                buf.put_slice(b"\r\n");
                TransferCoding::length(len)
            }
            BodySize::Empty => {
                buf.put_slice(b"Content-Length: 0\r\n");
                TransferCoding::Eof
            }
            BodySize::Unknown => {
                buf.put_slice(b"Transfer-Encoding: chunked\r\n");
                TransferCoding::encode_chunked()
            }
        }
    };

    // head replies advertise the entity size but send no body bytes.
    if head_only {
        coding = TransferCoding::Eof;
    }

    buf.put_slice(b"\r\n");

    (coding, buf.len() - start)
}

fn encode_status_line(buf: &mut BytesMut, version: Version, status: StatusCode) {
    match (version, status) {
        (Version::HTTP_11, StatusCode::OK) => {
            buf.put_slice(b"HTTP/1.1 200 OK\r\n");
            return;
        }
        (Version::HTTP_10, _) => buf.put_slice(b"HTTP/1.0 "),
        _ => buf.put_slice(b"HTTP/1.1 "),
    }

    buf.put_slice(status.as_str().as_bytes());
    buf.put_slice(b" ");
    // a reason must be written, many parsers expect one.
    buf.put_slice(status.canonical_reason().unwrap_or("Unknown").as_bytes());
    buf.put_slice(b"\r\n");
}

// http::HeaderName stores lowercase; emit the conventional Title-Case form.
fn put_canonical_name(buf: &mut BytesMut, name: &str) {
    let mut upper = true;
    for &b in name.as_bytes() {
        if upper {
            buf.put_u8(b.to_ascii_uppercase());
        } else {
            buf.put_u8(b);
        }
        upper = b == b'-';
    }
}

#[cfg(test)]
mod test {
    use http::header::{HeaderValue, CONTENT_TYPE, SET_COOKIE};

    use super::*;

    fn encode_to_string(
        status: StatusCode,
        headers: &HeaderMap,
        size: BodySize,
        head_only: bool,
    ) -> (String, TransferCoding) {
        let mut buf = BytesMut::new();
        let (coding, n) = encode_head(&mut buf, Version::HTTP_11, status, headers, size, head_only);
        assert_eq!(n, buf.len());
        (String::from_utf8(buf.to_vec()).unwrap(), coding)
    }

    #[test]
    fn fast_path_and_sizing() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let (head, coding) = encode_to_string(StatusCode::OK, &headers, BodySize::Sized(5), false);
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains("Content-Type: text/plain\r\n"));
        assert!(head.contains("Content-Length: 5\r\n"));
        assert!(head.contains("Date: "));
        assert!(head.ends_with("\r\n\r\n"));
        assert!(matches!(coding, TransferCoding::Length(5)));
    }

    #[test]
    fn chunked_for_unknown() {
        let headers = HeaderMap::new();
        let (head, coding) = encode_to_string(StatusCode::OK, &headers, BodySize::Unknown, false);
        assert!(head.contains("Transfer-Encoding: chunked\r\n"));
        assert!(matches!(coding, TransferCoding::EncodeChunked));
    }

    #[test]
    fn explicit_content_length_wins() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("100"));
        let (head, coding) = encode_to_string(StatusCode::OK, &headers, BodySize::Unknown, false);
        assert!(head.contains("Content-Length: 100\r\n"));
        assert!(!head.contains("Transfer-Encoding"));
        assert!(matches!(coding, TransferCoding::Length(100)));
    }

    #[test]
    fn not_modified_suppresses_framing() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("100"));
        let (head, coding) =
            encode_to_string(StatusCode::NOT_MODIFIED, &headers, BodySize::Empty, false);
        assert!(head.starts_with("HTTP/1.1 304 Not Modified\r\n"));
        assert!(!head.contains("Content-Length"));
        assert!(matches!(coding, TransferCoding::Eof));
    }

    #[test]
    fn head_reply_keeps_length_drops_body() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("42"));
        let (head, coding) = encode_to_string(StatusCode::OK, &headers, BodySize::Empty, true);
        assert!(head.contains("Content-Length: 42\r\n"));
        assert!(matches!(coding, TransferCoding::Eof));
    }

    #[test]
    fn set_cookie_multi_line() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("a=1"));
        headers.append(SET_COOKIE, HeaderValue::from_static("b=2"));
        let (head, _) = encode_to_string(StatusCode::OK, &headers, BodySize::Empty, false);
        assert!(head.contains("Set-Cookie: a=1\r\n"));
        assert!(head.contains("Set-Cookie: b=2\r\n"));
    }

    #[test]
    fn canonical_casing() {
        let mut headers = HeaderMap::new();
        headers.insert("x-custom-header", HeaderValue::from_static("v"));
        let (head, _) = encode_to_string(StatusCode::OK, &headers, BodySize::Empty, false);
        assert!(head.contains("X-Custom-Header: v\r\n"));
    }
}
