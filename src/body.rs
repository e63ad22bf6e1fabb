use core::pin::Pin;

use std::io;

use bytes::Bytes;
use futures_core::Stream;

pub type BoxStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + 'static>>;

/// Response body as a tagged variant. Replaces runtime type sniffing: the
/// producer states what it hands over and the responder picks buffered vs
/// streamed writes from the tag alone.
pub enum Body {
    Empty,
    Bytes(Bytes),
    /// utf-8 text. content-length is the byte count, not the char count.
    Text(String),
    Stream {
        stream: BoxStream,
        /// exact byte size when the producer knows it (sized file reads).
        size: Option<u64>,
    },
}

impl core::fmt::Debug for Body {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Body::Empty => f.write_str("Body::Empty"),
            Body::Bytes(b) => f.debug_tuple("Body::Bytes").field(b).finish(),
            Body::Text(t) => f.debug_tuple("Body::Text").field(t).finish(),
            Body::Stream { size, .. } => f
                .debug_struct("Body::Stream")
                .field("size", size)
                .finish(),
        }
    }
}

/// Body size as seen by the h1 encoder.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BodySize {
    Empty,
    Sized(u64),
    /// streamed body of unknown length. goes out chunked.
    Unknown,
}

impl Body {
    pub fn stream(stream: BoxStream, size: Option<u64>) -> Self {
        Self::Stream { stream, size }
    }

    pub fn size(&self) -> BodySize {
        match self {
            Self::Empty => BodySize::Empty,
            Self::Bytes(b) if b.is_empty() => BodySize::Empty,
            Self::Bytes(b) => BodySize::Sized(b.len() as u64),
            Self::Text(s) if s.is_empty() => BodySize::Empty,
            Self::Text(s) => BodySize::Sized(s.len() as u64),
            Self::Stream { size: Some(0), .. } => BodySize::Empty,
            Self::Stream { size: Some(n), .. } => BodySize::Sized(*n),
            Self::Stream { size: None, .. } => BodySize::Unknown,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.size(), BodySize::Empty)
    }

    /// buffered bytes when the body is not a stream.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Empty => Some(&[]),
            Self::Bytes(b) => Some(b),
            Self::Text(s) => Some(s.as_bytes()),
            Self::Stream { .. } => None,
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::Empty
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Self {
        Self::Bytes(b)
    }
}

impl From<Vec<u8>> for Body {
    fn from(b: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(b))
    }
}

impl From<&'static [u8]> for Body {
    fn from(b: &'static [u8]) -> Self {
        Self::Bytes(Bytes::from_static(b))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Self::Bytes(Bytes::from_static(s.as_bytes()))
    }
}
