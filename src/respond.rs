use http::{
    header::{HeaderName, HeaderValue, CONNECTION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE,
        LOCATION, SERVER, SET_COOKIE},
    HeaderMap, StatusCode,
};
use tracing::debug;

use crate::{
    body::Body,
    config::{CompiledConfig, KeepAlives},
    encoding::{compress_bytes, encode_stream, select_encoding},
    handler::Response,
    request::RequestCtx,
};

// handler-set marker forcing compression for non-text types.
const X_COMPRESS: &str = "x-compress";

/// Fully assembled response ready for the wire. `keep_alive` and the
/// `Connection` header are guaranteed to agree.
pub(crate) struct Prepared {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
    pub keep_alive: bool,
}

/// Merge layered headers, decide compression and keep-alive, sanitize
/// values. Order: caller headers, then defaults where absent, then server
/// signature, connection management, per-status overlay, per-uri overlay.
pub(crate) fn prepare(
    cfg: &CompiledConfig,
    ctx: &mut RequestCtx,
    res: Response,
    requests_on_conn: u32,
    shutting_down: bool,
) -> Prepared {
    let Response {
        status,
        mut headers,
        mut body,
    } = res;

    for (name, value) in cfg.response_headers.iter() {
        if !headers.contains_key(name) {
            headers.insert(name.clone(), value.clone());
        }
    }

    if !headers.contains_key(SERVER) {
        if let Ok(v) = HeaderValue::from_str(&cfg.raw.http_server_signature) {
            headers.insert(SERVER, v);
        }
    }

    let keep_alive = keep_alive_decision(cfg, ctx, requests_on_conn, shutting_down);
    if keep_alive {
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        if cfg.raw.http_keep_alives == KeepAlives::Request {
            if let Some(dur) = cfg.keep_alive_timeout {
                let v = format!("timeout={}", dur.as_secs());
                if let Ok(v) = HeaderValue::from_str(&v) {
                    headers.insert(HeaderName::from_static("keep-alive"), v);
                }
            }
        }
    } else {
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
    }

    if let Some(overlay) = cfg.code_response_headers.get(&status.as_u16()) {
        for (name, value) in overlay.iter() {
            headers.insert(name.clone(), value.clone());
        }
    }

    let match_target = if cfg.raw.http_full_uri_match { &ctx.uri } else { &ctx.path };
    for (re, overlay) in cfg.uri_response_headers.iter() {
        if re.is_match(match_target) {
            for (name, value) in overlay.iter() {
                headers.insert(name.clone(), value.clone());
            }
        }
    }

    for cookie in ctx.set_cookies.drain(..) {
        if let Ok(v) = HeaderValue::from_str(&cookie.serialize(ctx.is_tls)) {
            headers.append(SET_COOKIE, v);
        }
    }

    body = maybe_compress(cfg, ctx, status, &mut headers, body);

    sanitize(&mut headers, cfg.raw.http_clean_headers);

    Prepared {
        status,
        headers,
        body,
        keep_alive,
    }
}

/// Three-mode keep-alive policy plus the per-connection request cap and the
/// shutdown override. The `Connection` request header was parsed once at
/// head decode; the request carries the result.
fn keep_alive_decision(
    cfg: &CompiledConfig,
    ctx: &RequestCtx,
    requests_on_conn: u32,
    shutting_down: bool,
) -> bool {
    if shutting_down {
        return false;
    }
    let max = cfg.raw.http_max_requests_per_connection;
    if max > 0 && requests_on_conn >= max {
        return false;
    }

    match cfg.raw.http_keep_alives {
        KeepAlives::Close => false,
        KeepAlives::Request => ctx.asked_keep_alive,
        // effective flag folds in the http/1.0 close default.
        KeepAlives::Default => ctx.keep_alive,
    }
}

/// Compress when all gates hold: non-empty body, 200 status, no prior
/// content-encoding, client accepts something we speak, and either the
/// handler forced it or the type is text-like.
fn maybe_compress(
    cfg: &CompiledConfig,
    ctx: &RequestCtx,
    status: StatusCode,
    headers: &mut HeaderMap,
    body: Body,
) -> Body {
    let forced = headers.remove(X_COMPRESS).is_some();

    if body.is_empty() || status != StatusCode::OK || headers.contains_key(CONTENT_ENCODING) {
        return body;
    }

    let accept = ctx
        .headers
        .get(http::header::ACCEPT_ENCODING)
        .and_then(|v| v.to_str().ok());
    let Some(encoding) = select_encoding(accept, cfg.raw.http_enable_brotli) else {
        return body;
    };

    if !forced {
        if !cfg.raw.http_compress_text {
            return body;
        }
        let text_like = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| cfg.regex_text.is_match(ct));
        if !text_like {
            return body;
        }
    }

    let gzip_opts = &cfg.raw.http_gzip_opts;
    let brotli_opts = &cfg.raw.http_brotli_opts;

    match body {
        Body::Stream { stream, .. } => {
            headers.remove(CONTENT_LENGTH);
            headers.insert(
                CONTENT_ENCODING,
                HeaderValue::from_static(encoding.as_str()),
            );
            Body::stream(encode_stream(encoding, stream, gzip_opts, brotli_opts), None)
        }
        buffered => {
            let input = buffered.as_bytes().unwrap_or(&[]);
            match compress_bytes(encoding, input, gzip_opts, brotli_opts) {
                Ok(compressed) => {
                    headers.remove(CONTENT_LENGTH);
                    headers.insert(
                        CONTENT_ENCODING,
                        HeaderValue::from_static(encoding.as_str()),
                    );
                    Body::Bytes(compressed)
                }
                Err(e) => {
                    debug!(target: "respond", "compression failed, sending identity: {e}");
                    buffered
                }
            }
        }
    }
}

// strip control bytes from header values. with clean_headers off only the
// Location header is touched.
fn sanitize(headers: &mut HeaderMap, clean_all: bool) {
    let dirty: Vec<HeaderName> = headers
        .iter()
        .filter(|(name, value)| {
            (clean_all || **name == LOCATION)
                && value.as_bytes().iter().any(|b| *b < 0x20 || *b == 0x7f)
        })
        .map(|(name, _)| name.clone())
        .collect();

    for name in dirty {
        let values: Vec<HeaderValue> = headers
            .get_all(&name)
            .iter()
            .map(|value| {
                let cleaned: Vec<u8> = value
                    .as_bytes()
                    .iter()
                    .copied()
                    .filter(|b| *b >= 0x20 && *b != 0x7f)
                    .collect();
                HeaderValue::from_bytes(&cleaned).unwrap_or_else(|_| HeaderValue::from_static(""))
            })
            .collect();
        headers.remove(&name);
        for value in values {
            headers.append(name.clone(), value);
        }
    }
}

/// Strip control bytes from a string destined for a header value. Used when
/// building values out of user-supplied parts (redirect substitutions).
pub(crate) fn sanitize_str(value: &str) -> String {
    value
        .chars()
        .filter(|c| *c >= ' ' && *c != '\u{7f}')
        .collect()
}
