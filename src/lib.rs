//! Embeddable http/1.1 + tls server engine.
//!
//! The engine accepts tcp/tls sockets, applies admission control (connection
//! caps, blacklists, host allow-lists, a bounded request queue), parses
//! requests, runs them through user filters and uri/method handlers, serves
//! static files with conditional-get and byte-range support, compresses
//! responses adaptively and reports per-request metrics.
//!
//! ```no_run
//! use quay_http::{BoxFuture, HandlerResult, RequestCtx, Response, ServerConfig, WebServer};
//!
//! fn hello(_ctx: &mut RequestCtx) -> BoxFuture<'_, HandlerResult> {
//!     Box::pin(async move {
//!         HandlerResult::Response(Response::text(quay_http::http::StatusCode::OK, "hi"))
//!     })
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), quay_http::Error> {
//!     let server = WebServer::new(ServerConfig::default())?;
//!     server.add_uri_handler("^/hello", "hello", std::sync::Arc::new(hello))?;
//!     server.start().await?;
//!     Ok(())
//! }
//! ```

mod acl;
mod body;
mod config;
mod cookie;
mod encoding;
mod engine;
mod error;
mod file;
mod h1;
mod handler;
mod ip;
mod metrics;
mod net;
mod perf;
mod queue;
mod request;
mod respond;
mod server;
mod tls;

pub use self::{
    acl::Acl,
    body::{Body, BodySize, BoxStream},
    config::{
        BrotliOpts, GzipOpts, KeepAlives, PerfReport, RedirectRule, RewriteRule, ServerConfig,
        StaticTtl, UriHeaderRule,
    },
    cookie::{parse_cookies, SameSite, Secure, SetCookie},
    encoding::{accepts_gzip, compress_bytes, select_encoding, ContentEncoding},
    engine::{FormData, FormParser, UrlencodedParser},
    error::{CertError, Error, Parse, ProtoError},
    handler::{BoxFuture, FilterFn, FilterResult, HandlerFn, HandlerResult, Response},
    ip::{collect_client_ips, public_ip},
    metrics::{Mma, RequestSummary, StatsBuffer},
    perf::{PerfSnapshot, PerfTimer},
    request::{parse_query, Params, QueryValue, RequestCtx, RequestState, UploadedFile},
    server::{DirectoryOptions, HandlerAcl, MetricsCallback, SocketCallback, WebServer},
};

// re-exports for handler signatures.
pub use bytes;
pub use http;
pub use serde_json;
