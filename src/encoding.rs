use core::{
    pin::Pin,
    task::{ready, Context, Poll},
};

use std::io::{self, Write};

use brotli2::write::BrotliEncoder;
use bytes::{BufMut, Bytes, BytesMut};
use flate2::{
    write::{GzEncoder, ZlibEncoder},
    Compression,
};
use futures_core::Stream;

use crate::{
    body::BoxStream,
    config::{BrotliOpts, GzipOpts},
};

/// A supported response encoding, in server preference order.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ContentEncoding {
    Br,
    Gzip,
    Deflate,
}

impl ContentEncoding {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Br => "br",
            Self::Gzip => "gzip",
            Self::Deflate => "deflate",
        }
    }
}

/// Pick the encoding for a response. Server priority is brotli, gzip,
/// deflate; the client's `Accept-Encoding` list gates which are candidates.
/// `*` counts as accepting gzip. Returns `None` when nothing matches.
pub fn select_encoding(accept: Option<&str>, enable_brotli: bool) -> Option<ContentEncoding> {
    let accept = accept?;
    let (mut br, mut gz, mut de) = (false, false, false);
    for token in accept.split(',') {
        let mut parts = token.split(';');
        let name = parts.next().unwrap_or("").trim();
        // a zero q-value is an explicit refusal.
        let refused = parts.any(|p| {
            let p = p.trim();
            p.strip_prefix("q=")
                .and_then(|q| q.trim().parse::<f32>().ok())
                .is_some_and(|q| q == 0.0)
        });
        if refused {
            continue;
        }
        if name.eq_ignore_ascii_case("br") {
            br = true;
        } else if name.eq_ignore_ascii_case("gzip") || name == "*" {
            gz = true;
        } else if name.eq_ignore_ascii_case("deflate") {
            de = true;
        }
    }
    if br && enable_brotli {
        Some(ContentEncoding::Br)
    } else if gz {
        Some(ContentEncoding::Gzip)
    } else if de {
        Some(ContentEncoding::Deflate)
    } else {
        None
    }
}

/// Does the client accept gzip at all? Gates the pre-gzipped sibling path.
pub fn accepts_gzip(accept: Option<&str>) -> bool {
    select_encoding(accept, false) == Some(ContentEncoding::Gzip)
}

// in-memory sink the flate2/brotli2 writers push encoded bytes into.
struct Writer {
    buf: BytesMut,
}

impl Writer {
    fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

impl io::Write for Writer {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.put_slice(buf);
        Ok(buf.len())
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub(crate) enum Encoder {
    Br(BrotliEncoder<Writer>),
    Gz(GzEncoder<Writer>),
    De(ZlibEncoder<Writer>),
}

impl Encoder {
    pub(crate) fn new(encoding: ContentEncoding, gzip: &GzipOpts, brotli: &BrotliOpts) -> Self {
        match encoding {
            ContentEncoding::Br => Self::Br(BrotliEncoder::new(Writer::new(), brotli.level)),
            ContentEncoding::Gzip => {
                Self::Gz(GzEncoder::new(Writer::new(), Compression::new(gzip.level)))
            }
            ContentEncoding::Deflate => {
                Self::De(ZlibEncoder::new(Writer::new(), Compression::new(gzip.level)))
            }
        }
    }

    fn code(&mut self, item: &[u8]) -> io::Result<Option<Bytes>> {
        let out = match self {
            Self::Br(enc) => {
                enc.write_all(item)?;
                enc.flush()?;
                enc.get_mut().take()
            }
            Self::Gz(enc) => {
                enc.write_all(item)?;
                enc.get_mut().take()
            }
            Self::De(enc) => {
                enc.write_all(item)?;
                enc.get_mut().take()
            }
        };
        Ok((!out.is_empty()).then_some(out))
    }

    // finishing consumes the underlying encoder.
    fn code_eof(self) -> io::Result<Option<Bytes>> {
        let out = match self {
            Self::Br(enc) => enc.finish()?.take(),
            Self::Gz(enc) => enc.finish()?.take(),
            Self::De(enc) => enc.finish()?.take(),
        };
        Ok((!out.is_empty()).then_some(out))
    }
}

/// Compress a buffered body in one shot.
pub fn compress_bytes(
    encoding: ContentEncoding,
    input: &[u8],
    gzip: &GzipOpts,
    brotli: &BrotliOpts,
) -> io::Result<Bytes> {
    let mut encoder = Encoder::new(encoding, gzip, brotli);
    let mut out = BytesMut::new();
    if let Some(b) = encoder.code(input)? {
        out.extend_from_slice(&b);
    }
    if let Some(b) = encoder.code_eof()? {
        out.extend_from_slice(&b);
    }
    Ok(out.freeze())
}

/// Wrap a streamed body in an encoder. The output length is unknown, so the
/// caller must drop `Content-Length` and go chunked.
pub(crate) fn encode_stream(
    encoding: ContentEncoding,
    stream: BoxStream,
    gzip: &GzipOpts,
    brotli: &BrotliOpts,
) -> BoxStream {
    Box::pin(CoderStream {
        inner: Some(stream),
        encoder: Some(Encoder::new(encoding, gzip, brotli)),
    })
}

struct CoderStream {
    // both drop to None once the input stream and the trailer are drained.
    inner: Option<BoxStream>,
    encoder: Option<Encoder>,
}

impl Stream for CoderStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        loop {
            let Some(inner) = this.inner.as_mut() else {
                return Poll::Ready(None);
            };
            match ready!(inner.as_mut().poll_next(cx)) {
                Some(Ok(bytes)) => {
                    let Some(encoder) = this.encoder.as_mut() else {
                        return Poll::Ready(None);
                    };
                    match encoder.code(&bytes) {
                        Ok(Some(out)) => return Poll::Ready(Some(Ok(out))),
                        Ok(None) => continue,
                        Err(e) => {
                            this.inner = None;
                            return Poll::Ready(Some(Err(e)));
                        }
                    }
                }
                Some(Err(e)) => {
                    this.inner = None;
                    return Poll::Ready(Some(Err(e)));
                }
                None => {
                    this.inner = None;
                    let Some(encoder) = this.encoder.take() else {
                        return Poll::Ready(None);
                    };
                    return match encoder.code_eof() {
                        Ok(Some(out)) => Poll::Ready(Some(Ok(out))),
                        Ok(None) => Poll::Ready(None),
                        Err(e) => Poll::Ready(Some(Err(e))),
                    };
                }
            }
        }
    }
}
