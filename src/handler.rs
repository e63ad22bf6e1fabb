use core::{future::Future, pin::Pin};

use std::{path::PathBuf, sync::Arc};

use http::{header::HeaderName, HeaderMap, HeaderValue, Method, StatusCode};
use regex::Regex;

use crate::{acl::Acl, body::Body, config::StaticTtl, error::Error, request::RequestCtx};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Async handler callback. Return a [HandlerResult] to tell the engine what
/// happened:
///
/// ```ignore
/// server.add_uri_handler("^/hello", "hello", |ctx| {
///     Box::pin(async move {
///         HandlerResult::Response(Response::text(StatusCode::OK, "hi"))
///     })
/// })?;
/// ```
pub type HandlerFn =
    Arc<dyn for<'a> Fn(&'a mut RequestCtx) -> BoxFuture<'a, HandlerResult> + Send + Sync>;

pub type FilterFn =
    Arc<dyn for<'a> Fn(&'a mut RequestCtx) -> BoxFuture<'a, FilterResult> + Send + Sync>;

/// A normal response produced by a filter or handler.
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
}

impl Response {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Body::Empty,
        }
    }

    pub fn with_body(status: StatusCode, body: impl Into<Body>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn text(status: StatusCode, body: impl Into<Body>) -> Self {
        let mut res = Self::with_body(status, body);
        res.headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/html; charset=utf-8"),
        );
        res
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// What a handler did with the request.
pub enum HandlerResult {
    Response(Response),
    /// the handler placed pre-framed bytes via [RequestCtx::write_raw].
    RawWritten,
    /// not mine; fall through to the static server.
    Decline,
    /// serialize as json (or jsonp/html wrapped in legacy callback mode).
    Json(serde_json::Value),
}

/// What a filter did with the request.
pub enum FilterResult {
    /// continue down the chain.
    Pass,
    /// filter wrote the raw response itself via [RequestCtx::write_raw].
    RawWritten,
    /// filter supplies the response; chain stops.
    Response(Response),
}

pub(crate) enum HandlerKind {
    Callback(HandlerFn),
    /// serve this file through the static path instead of invoking code.
    InternalFile(String),
    /// static serving rooted at a directory other than the main htdocs.
    Directory {
        base: PathBuf,
        ttl: Option<StaticTtl>,
        headers: Vec<(HeaderName, HeaderValue)>,
    },
}

pub(crate) struct UriHandler {
    pub re: Regex,
    pub name: String,
    pub acl: Option<Acl>,
    pub kind: HandlerKind,
}

pub(crate) struct MethodHandler {
    pub method: Method,
    pub name: String,
    pub callback: HandlerFn,
}

pub(crate) struct FilterEntry {
    pub re: Regex,
    pub name: String,
    pub callback: FilterFn,
}

/// User-registered routing tables, scanned in registration order.
#[derive(Default)]
pub(crate) struct Routes {
    pub filters: Vec<FilterEntry>,
    pub uri: Vec<UriHandler>,
    pub methods: Vec<MethodHandler>,
}

impl Routes {
    pub fn add_filter(&mut self, pattern: &str, name: &str, callback: FilterFn) -> Result<(), Error> {
        let re = compile(pattern)?;
        self.filters.push(FilterEntry {
            re,
            name: name.to_owned(),
            callback,
        });
        Ok(())
    }

    pub fn remove_filter(&mut self, name: &str) {
        self.filters.retain(|f| f.name != name);
    }

    pub fn add_uri(
        &mut self,
        pattern: &str,
        name: &str,
        acl: Option<Acl>,
        kind: HandlerKind,
    ) -> Result<(), Error> {
        let re = compile(pattern)?;
        self.uri.push(UriHandler {
            re,
            name: name.to_owned(),
            acl,
            kind,
        });
        Ok(())
    }

    pub fn remove_uri(&mut self, name: &str) {
        self.uri.retain(|h| h.name != name);
    }

    pub fn remove_uri_pattern(&mut self, pattern: &str) {
        self.uri.retain(|h| h.re.as_str() != pattern);
    }

    pub fn add_method(&mut self, method: Method, name: &str, callback: HandlerFn) {
        self.methods.push(MethodHandler {
            method,
            name: name.to_owned(),
            callback,
        });
    }

    pub fn remove_method(&mut self, name: &str) {
        self.methods.retain(|h| h.name != name);
    }
}

fn compile(pattern: &str) -> Result<Regex, Error> {
    Regex::new(pattern).map_err(|e| Error::Config(format!("invalid handler regex {pattern:?}: {e}")))
}
