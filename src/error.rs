use core::fmt;

use std::{error, io};

/// Top level error for server construction and runtime faults that are not
/// tied to a single request.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    /// a configuration value failed validation (bad regex, bad CIDR, bad port).
    Config(String),
    Cert(CertError),
    Proto(ProtoError),
    /// server already stopped or never started.
    Closed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Config(msg) => write!(f, "config error: {msg}"),
            Self::Cert(e) => write!(f, "certificate error: {e}"),
            Self::Proto(e) => write!(f, "protocol error: {e}"),
            Self::Closed => f.write_str("server closed"),
        }
    }
}

impl error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<CertError> for Error {
    fn from(e: CertError) -> Self {
        Self::Cert(e)
    }
}

impl From<ProtoError> for Error {
    fn from(e: ProtoError) -> Self {
        Self::Proto(e)
    }
}

/// Http/1 protocol level error. A protocol error terminates the connection it
/// happened on and never propagates beyond it.
#[derive(Debug)]
pub enum ProtoError {
    Parse(Parse),
    /// header value is not valid when encoding response head.
    HeaderValue,
    Io(io::Error),
}

#[derive(Debug, Eq, PartialEq)]
pub enum Parse {
    /// request head did not fit the read buffer.
    HeaderTooLarge,
    /// malformed request line or header bytes.
    Malformed,
    /// method token not recognized.
    Method,
    Uri,
    Version,
    /// content-length header is not a valid integer or conflicts.
    ContentLength,
    /// chunked transfer encoding framing broken.
    Chunked,
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(p) => write!(f, "parse error: {p:?}"),
            Self::HeaderValue => f.write_str("invalid header value"),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl error::Error for ProtoError {}

impl From<Parse> for ProtoError {
    fn from(p: Parse) -> Self {
        Self::Parse(p)
    }
}

impl From<io::Error> for ProtoError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<httparse::Error> for ProtoError {
    fn from(e: httparse::Error) -> Self {
        let p = match e {
            httparse::Error::TooManyHeaders => Parse::HeaderTooLarge,
            httparse::Error::Token => Parse::Method,
            httparse::Error::Version => Parse::Version,
            _ => Parse::Malformed,
        };
        Self::Parse(p)
    }
}

/// Error loading or reloading the tls certificate bundle.
#[derive(Debug)]
pub enum CertError {
    Io(io::Error),
    /// pem file parsed but contained no usable cert/key.
    Empty(&'static str),
    Tls(rustls::Error),
}

impl fmt::Display for CertError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Empty(what) => write!(f, "no {what} found in pem file"),
            Self::Tls(e) => write!(f, "tls error: {e}"),
        }
    }
}

impl error::Error for CertError {}

impl From<io::Error> for CertError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<rustls::Error> for CertError {
    fn from(e: rustls::Error) -> Self {
        Self::Tls(e)
    }
}
