use std::sync::RwLock;

use http::{
    header::{HeaderValue, CONTENT_TYPE, LOCATION},
    StatusCode,
};
use tracing::{debug, error, warn};

use crate::{
    config::{CompiledConfig, StaticTtl},
    encoding::accepts_gzip,
    file::{self, StaticRequest},
    handler::{FilterFn, HandlerFn, HandlerKind, HandlerResult, Response, Routes},
    request::{QueryValue, RequestCtx, RequestState},
    respond::sanitize_str,
};

use super::{error_response, named_error_response, parse::strip_query, Outcome};

/// Route one parsed request: filters, then redirects, method handlers, uri
/// handlers, finally the static server.
pub(crate) async fn route(
    cfg: &CompiledConfig,
    routes: &RwLock<Routes>,
    ctx: &mut RequestCtx,
) -> Outcome {
    // filter chain. matching filters run in registration order.
    ctx.advance(RequestState::Filtering);
    ctx.perf.begin("filter");
    let matching: Vec<(String, FilterFn)> = {
        let routes = routes.read().unwrap();
        routes
            .filters
            .iter()
            .filter(|f| f.re.is_match(&ctx.path))
            .map(|f| (f.name.clone(), f.callback.clone()))
            .collect()
    };
    for (name, filter) in matching {
        match filter(ctx).await {
            crate::handler::FilterResult::Pass => {}
            crate::handler::FilterResult::Response(res) => {
                ctx.perf.end("filter");
                return Outcome::Respond(res);
            }
            crate::handler::FilterResult::RawWritten => {
                ctx.perf.end("filter");
                return raw_outcome(ctx, &name);
            }
        }
    }
    ctx.perf.end("filter");

    ctx.advance(RequestState::Processing);
    ctx.perf.begin("process");
    let outcome = dispatch(cfg, routes, ctx).await;
    ctx.perf.end("process");
    outcome
}

async fn dispatch(cfg: &CompiledConfig, routes: &RwLock<Routes>, ctx: &mut RequestCtx) -> Outcome {
    let match_target = if cfg.raw.http_full_uri_match {
        ctx.uri.clone()
    } else {
        ctx.path.clone()
    };

    // declarative redirects win over any handler.
    for redirect in cfg.redirects.iter() {
        let Some(caps) = redirect.re.captures(&match_target) else {
            continue;
        };
        let mut location = String::new();
        caps.expand(&redirect.url, &mut location);
        let mut res = Response::new(redirect.status);
        for (name, value) in redirect.headers.iter() {
            res.headers.insert(name.clone(), value.clone());
        }
        match HeaderValue::from_str(&sanitize_str(&location)) {
            Ok(v) => {
                res.headers.insert(LOCATION, v);
            }
            Err(_) => {
                warn!(target: "dispatch", "redirect target unusable for {}: {location:?}", ctx.id);
                return Outcome::Respond(error_response(StatusCode::INTERNAL_SERVER_ERROR));
            }
        }
        return Outcome::Respond(res);
    }

    // method handlers before uri handlers.
    let selected = {
        let routes = routes.read().unwrap();
        let by_method = routes
            .methods
            .iter()
            .find(|h| h.method == ctx.method)
            .map(|h| (h.name.clone(), None, Selected::Callback(h.callback.clone())));

        by_method.or_else(|| {
            routes.uri.iter().find_map(|h| {
                h.re.captures(&match_target).map(|caps| {
                    let matches = caps
                        .iter()
                        .map(|m| m.map_or(String::new(), |m| m.as_str().to_owned()))
                        .collect::<Vec<_>>();
                    let selected = match &h.kind {
                        HandlerKind::Callback(f) => Selected::CallbackWith(f.clone(), matches),
                        HandlerKind::InternalFile(path) => Selected::InternalFile(path.clone()),
                        HandlerKind::Directory { base, ttl, headers } => Selected::Directory {
                            prefix: matches.first().cloned().unwrap_or_default(),
                            base: base.clone(),
                            ttl: ttl.clone(),
                            headers: headers.clone(),
                        },
                    };
                    (h.name.clone(), h.acl.clone(), selected)
                })
            })
        })
    };

    if let Some((name, acl, selected)) = selected {
        if let Some(acl) = acl {
            // every address the client claims must pass.
            if !acl.check_all(&ctx.client_ips) {
                warn!(
                    target: "dispatch",
                    "acl rejection for handler {name} on {}: {:?}", ctx.id, ctx.client_ips
                );
                return Outcome::Respond(error_response(StatusCode::FORBIDDEN));
            }
        }

        match selected {
            Selected::Callback(callback) => return invoke(cfg, ctx, &name, callback).await,
            Selected::CallbackWith(callback, matches) => {
                ctx.matches = matches;
                return invoke(cfg, ctx, &name, callback).await;
            }
            Selected::InternalFile(path) => {
                return serve_static(cfg, ctx, StaticTarget::Internal(path)).await;
            }
            Selected::Directory { prefix, base, ttl, headers } => {
                let target = StaticTarget::Directory {
                    prefix,
                    base,
                    ttl,
                    headers,
                };
                return serve_static(cfg, ctx, target).await;
            }
        }
    }

    serve_static(cfg, ctx, StaticTarget::Htdocs).await
}

enum Selected {
    Callback(HandlerFn),
    CallbackWith(HandlerFn, Vec<String>),
    InternalFile(String),
    Directory {
        prefix: String,
        base: std::path::PathBuf,
        ttl: Option<StaticTtl>,
        headers: Vec<(http::header::HeaderName, HeaderValue)>,
    },
}

async fn invoke(
    cfg: &CompiledConfig,
    ctx: &mut RequestCtx,
    name: &str,
    callback: HandlerFn,
) -> Outcome {
    match callback(ctx).await {
        HandlerResult::Response(res) => Outcome::Respond(res),
        HandlerResult::RawWritten => raw_outcome(ctx, name),
        HandlerResult::Json(value) => Outcome::Respond(json_response(cfg, ctx, value)),
        HandlerResult::Decline => serve_static(cfg, ctx, StaticTarget::Htdocs).await,
    }
}

/// A handler claimed it wrote raw bytes; missing bytes are a handler bug and
/// surface as a 500 naming the offender.
fn raw_outcome(ctx: &mut RequestCtx, name: &str) -> Outcome {
    match ctx.raw_out.take() {
        Some(bytes) => Outcome::Raw(bytes),
        None => {
            error!(target: "dispatch", "{name} signalled a raw response but wrote nothing");
            Outcome::Respond(named_error_response(StatusCode::INTERNAL_SERVER_ERROR, name))
        }
    }
}

/// Serialize a json handler reply. `?pretty=1` indents; in legacy callback
/// mode `?callback=` wraps the payload in a script call, and `?format=html`
/// additionally wraps it in a html document.
fn json_response(cfg: &CompiledConfig, ctx: &RequestCtx, value: serde_json::Value) -> Response {
    let query_str = |key: &str| match ctx.query.get(key) {
        Some(QueryValue::One(v)) => Some(v.as_str()),
        Some(QueryValue::Many(list)) => list.last().map(String::as_str),
        None => None,
    };

    let pretty = query_str("pretty") == Some("1");
    let json = if pretty {
        serde_json::to_string_pretty(&value).unwrap_or_else(|_| String::from("null"))
    } else {
        serde_json::to_string(&value).unwrap_or_else(|_| String::from("null"))
    };

    if cfg.raw.http_legacy_callback_support {
        if let Some(callback) = query_str("callback") {
            // callback name restricted to a js identifier path.
            let callback: String = callback
                .chars()
                .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '$'))
                .collect();
            if !callback.is_empty() {
                if query_str("format") == Some("html") {
                    let body = format!(
                        "<html><head><script>{callback}({json});</script></head><body>&nbsp;</body></html>\n"
                    );
                    let mut res = Response::with_body(StatusCode::OK, body);
                    res.headers.insert(
                        CONTENT_TYPE,
                        HeaderValue::from_static("text/html; charset=utf-8"),
                    );
                    return res;
                }
                let body = format!("{callback}({json});\n");
                let mut res = Response::with_body(StatusCode::OK, body);
                res.headers.insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("text/javascript; charset=utf-8"),
                );
                return res;
            }
        }
    }

    let mut res = Response::with_body(StatusCode::OK, json + "\n");
    res.headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("application/json; charset=utf-8"),
    );
    res
}

enum StaticTarget {
    Htdocs,
    Internal(String),
    Directory {
        prefix: String,
        base: std::path::PathBuf,
        ttl: Option<StaticTtl>,
        headers: Vec<(http::header::HeaderName, HeaderValue)>,
    },
}

async fn serve_static(cfg: &CompiledConfig, ctx: &mut RequestCtx, target: StaticTarget) -> Outcome {
    let accept = ctx
        .headers
        .get(http::header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok());
    let client_gzip = accepts_gzip(accept);
    let is_head = ctx.method == http::Method::HEAD;

    let (base, serve_path, cache_control, extra_headers, internal) = match &target {
        StaticTarget::Htdocs => (
            std::path::PathBuf::from(&cfg.raw.http_htdocs_dir),
            ctx.path.clone(),
            cfg.raw.http_static_ttl.cache_control(),
            Vec::new(),
            None,
        ),
        StaticTarget::Internal(path) => (
            std::path::PathBuf::new(),
            ctx.path.clone(),
            cfg.raw.http_static_ttl.cache_control(),
            Vec::new(),
            Some(path.clone()),
        ),
        StaticTarget::Directory { prefix, base, ttl, headers } => {
            let remainder = strip_query(&ctx.path)
                .strip_prefix(prefix.as_str())
                .unwrap_or(&ctx.path)
                .to_owned();
            let remainder = if remainder.starts_with('/') {
                remainder
            } else {
                format!("/{remainder}")
            };
            (
                base.clone(),
                remainder,
                ttl.as_ref()
                    .map(StaticTtl::cache_control)
                    .unwrap_or_else(|| cfg.raw.http_static_ttl.cache_control()),
                headers.clone(),
                None,
            )
        }
    };

    let req = StaticRequest {
        path: &serve_path,
        internal_file: internal.as_deref(),
        base: &base,
        index: &cfg.raw.http_static_index,
        cache_control: &cache_control,
        gzip_sibling: cfg.raw.http_static_gzip_text,
        accepts_gzip: client_gzip,
        regex_text: &cfg.regex_text,
        headers: &ctx.headers,
        is_head,
    };

    match file::serve(req).await {
        Ok(mut res) => {
            for (name, value) in extra_headers {
                res.headers.insert(name, value);
            }
            Outcome::Respond(res)
        }
        Err(file::ServeError::NotFound) => {
            if internal.is_none() && file::is_dir_without_slash(&base, &serve_path).await {
                return Outcome::Respond(file::dir_redirect(&ctx.path));
            }
            debug!(target: "static", "miss for {}: {:?}", ctx.id, serve_path);
            Outcome::Respond(error_response(StatusCode::NOT_FOUND))
        }
        Err(file::ServeError::Io(e)) => {
            error!(target: "static", "file error for {}: {e}", ctx.id);
            Outcome::Respond(error_response(StatusCode::INTERNAL_SERVER_ERROR))
        }
    }
}
