//! Request lifecycle stages between the wire and the responder: admission,
//! parse, filter chain, dispatch.

pub(crate) mod dispatch;
pub(crate) mod intake;
pub(crate) mod parse;

pub use parse::{FormData, FormParser, UrlencodedParser};

use bytes::Bytes;
use http::{header::HeaderValue, StatusCode};

use crate::handler::Response;

/// Terminal result of the filter/dispatch stages for one request.
pub(crate) enum Outcome {
    /// normal response; goes through the responder.
    Respond(Response),
    /// pre-framed bytes written verbatim; connection closes after.
    Raw(Bytes),
}

/// Minimal error document: `<code> <reason>` text.
pub(crate) fn error_response(status: StatusCode) -> Response {
    let body = format!("{} {}\n", status.as_u16(), status.canonical_reason().unwrap_or(""));
    let mut res = Response::with_body(status, body);
    res.headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    res
}

/// Error document naming the user component that caused it.
pub(crate) fn named_error_response(status: StatusCode, name: &str) -> Response {
    let body = format!(
        "{} {}: {}\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or(""),
        name
    );
    let mut res = Response::with_body(status, body);
    res.headers.insert(
        http::header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    res
}
