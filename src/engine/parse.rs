use std::{collections::HashMap, path::Path};

use bytes::Bytes;
use http::{
    header::{HeaderName, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE, COOKIE},
    Method, StatusCode,
};
use tracing::debug;

use crate::{
    config::CompiledConfig,
    cookie::parse_cookies,
    request::{parse_query, Params, RequestCtx, UploadedFile},
};

use super::error_response;

/// Output of the form parser collaborator: flat fields plus file
/// descriptors for parts spooled to disk.
#[derive(Debug, Default)]
pub struct FormData {
    pub params: HashMap<String, String>,
    pub files: Vec<UploadedFile>,
}

/// Body parser for `multipart/form-data` and `x-www-form-urlencoded`
/// payloads. The engine ships a urlencoded implementation; hosts plug in a
/// multipart-capable one.
pub trait FormParser: Send + Sync {
    fn parse(
        &self,
        content_type: &str,
        body: &[u8],
        temp_dir: &Path,
        allow_empty_files: bool,
    ) -> Result<FormData, String>;
}

/// Default [FormParser]: handles urlencoded bodies, rejects multipart.
pub struct UrlencodedParser;

impl FormParser for UrlencodedParser {
    fn parse(
        &self,
        content_type: &str,
        body: &[u8],
        _temp_dir: &Path,
        _allow_empty_files: bool,
    ) -> Result<FormData, String> {
        if content_type.contains("multipart") {
            return Err(String::from("no multipart parser registered"));
        }
        let body = std::str::from_utf8(body).map_err(|_| String::from("invalid utf-8 form body"))?;
        let params = parse_query(body, true)
            .into_iter()
            .map(|(k, v)| {
                let v = match v {
                    crate::request::QueryValue::One(s) => s,
                    crate::request::QueryValue::Many(mut list) => list.pop().unwrap_or_default(),
                };
                (k, v)
            })
            .collect();
        Ok(FormData {
            params,
            files: Vec::new(),
        })
    }
}

/// Apply configured rewrites in declared order. Each matching rule rewrites
/// the target and may inject request headers; a `last` rule stops the scan.
pub(crate) fn apply_rewrites(cfg: &CompiledConfig, ctx: &mut RequestCtx) {
    for rule in cfg.rewrites.iter() {
        let Some(caps) = rule.re.captures(&ctx.uri) else {
            continue;
        };
        let mut rewritten = String::new();
        caps.expand(&rule.url, &mut rewritten);
        debug!(target: "parse", "rewrite {} -> {}", ctx.uri, rewritten);
        ctx.uri = rewritten;
        for (name, value) in rule.headers.iter() {
            ctx.headers.insert(name.clone(), value.clone());
        }
        if rule.last {
            break;
        }
    }
    ctx.path = strip_query(&ctx.uri).to_owned();
}

/// Detect tls terminated by a front end. On the first configured
/// header/pattern match the synthetic `ssl`/`https` request headers are set
/// and the request counts as tls.
pub(crate) fn detect_front_tls(cfg: &CompiledConfig, ctx: &mut RequestCtx) {
    if ctx.is_tls {
        return;
    }
    for (name, re) in cfg.https_header_detect.iter() {
        let matched = ctx
            .headers
            .get(name.as_str())
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| re.is_match(v));
        if matched {
            ctx.is_tls = true;
            ctx.headers
                .insert(HeaderName::from_static("ssl"), HeaderValue::from_static("1"));
            ctx.headers
                .insert(HeaderName::from_static("https"), HeaderValue::from_static("1"));
            return;
        }
    }
}

/// Query and cookie parse. Runs after rewrites so the rewritten target is
/// what gets parsed.
pub(crate) fn parse_query_and_cookies(cfg: &CompiledConfig, ctx: &mut RequestCtx) {
    let query = match ctx.uri.split_once('?') {
        Some((_, q)) => q,
        None => "",
    };
    ctx.query = parse_query(query, cfg.raw.http_flatten_query);

    if let Some(cookie) = ctx.headers.get(COOKIE).and_then(|v| v.to_str().ok()) {
        ctx.cookies = parse_cookies(cookie);
    }
}

/// How the request body should be consumed.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum BodyMode {
    Skip,
    Form,
    Json,
    Raw,
}

pub(crate) fn body_mode(cfg: &CompiledConfig, ctx: &RequestCtx, has_body: bool) -> BodyMode {
    if ctx.method == Method::HEAD || !has_body {
        return BodyMode::Skip;
    }

    let content_type = ctx
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let encoded = ctx.headers.contains_key(CONTENT_ENCODING);

    if !encoded && (content_type.contains("multipart") || content_type.contains("urlencoded")) {
        return BodyMode::Form;
    }
    if !encoded && cfg.regex_json.is_match(content_type) {
        return BodyMode::Json;
    }
    BodyMode::Raw
}

/// Interpret the collected body bytes per mode. A parse failure produces the
/// 400 response to send.
pub(crate) fn process_body(
    cfg: &CompiledConfig,
    ctx: &mut RequestCtx,
    mode: BodyMode,
    body: Bytes,
    form_parser: &dyn FormParser,
) -> Result<(), crate::handler::Response> {
    match mode {
        BodyMode::Skip => Ok(()),
        BodyMode::Form => {
            let content_type = ctx
                .headers
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_owned();
            match form_parser.parse(
                &content_type,
                &body,
                &cfg.temp_dir,
                cfg.raw.http_allow_empty_files,
            ) {
                Ok(form) => {
                    ctx.params = Params::Form(form.params);
                    ctx.files = form.files;
                    Ok(())
                }
                Err(e) => {
                    debug!(target: "parse", "form parse failed on {}: {e}", ctx.id);
                    Err(error_response(StatusCode::BAD_REQUEST))
                }
            }
        }
        BodyMode::Json => match serde_json::from_slice(&body) {
            Ok(value) => {
                ctx.params = Params::Json(value);
                Ok(())
            }
            Err(e) => {
                debug!(target: "parse", "json parse failed on {}: {e}", ctx.id);
                Err(error_response(StatusCode::BAD_REQUEST))
            }
        },
        BodyMode::Raw => {
            ctx.params = Params::Raw(body);
            Ok(())
        }
    }
}

/// Delete upload temp files. Runs on every request outcome, including
/// timeouts and aborts.
pub(crate) async fn cleanup_uploads(ctx: &mut RequestCtx) {
    for file in ctx.files.drain(..) {
        if let Err(e) = tokio::fs::remove_file(&file.path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!(target: "parse", "failed to remove upload temp file {:?}: {e}", file.path);
            }
        }
    }
}

pub(crate) fn strip_query(uri: &str) -> &str {
    uri.split_once('?').map_or(uri, |(path, _)| path)
}

#[cfg(test)]
mod test {
    use http::{HeaderMap, Version};

    use crate::{config::ServerConfig, perf::PerfTimer, request::RequestState};

    use super::*;

    fn ctx(uri: &str) -> RequestCtx {
        RequestCtx {
            id: String::from("r1"),
            received: std::time::SystemTime::now(),
            method: Method::GET,
            uri: uri.to_owned(),
            path: strip_query(uri).to_owned(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            query: HashMap::new(),
            cookies: HashMap::new(),
            params: Params::None,
            files: Vec::new(),
            client_ips: Vec::new(),
            public_ip: None,
            is_tls: false,
            matches: Vec::new(),
            perf: PerfTimer::new(),
            state: RequestState::Reading,
            conn_id: String::from("c1"),
            remote: None,
            port: 80,
            keep_alive: true,
            asked_keep_alive: false,
            set_cookies: Vec::new(),
            raw_out: None,
            outcome: None,
        }
    }

    #[test]
    fn rewrites_in_order_with_last() {
        let mut raw = ServerConfig::default();
        raw.http_rewrites = vec![
            crate::config::RewriteRule {
                pattern: String::from("^/v1/(.*)$"),
                url: String::from("/api/$1"),
                headers: [(String::from("X-Rewrote"), String::from("v1"))]
                    .into_iter()
                    .collect(),
                last: false,
            },
            crate::config::RewriteRule {
                pattern: String::from("^/api/(.*)$"),
                url: String::from("/internal/$1"),
                headers: HashMap::new(),
                last: true,
            },
            crate::config::RewriteRule {
                pattern: String::from("^/internal/(.*)$"),
                url: String::from("/never/$1"),
                headers: HashMap::new(),
                last: false,
            },
        ];
        let cfg = raw.compile().unwrap();

        let mut c = ctx("/v1/users?id=1");
        apply_rewrites(&cfg, &mut c);
        // first two applied, third skipped because of `last`.
        assert_eq!(c.uri, "/internal/users?id=1");
        assert_eq!(c.path, "/internal/users");
        assert_eq!(c.headers.get("x-rewrote").unwrap(), "v1");
    }

    #[test]
    fn front_tls_detection() {
        let cfg = ServerConfig::default().compile().unwrap();
        let mut c = ctx("/");
        c.headers
            .insert("x-forwarded-proto", HeaderValue::from_static("https"));
        detect_front_tls(&cfg, &mut c);
        assert!(c.is_tls);
        assert_eq!(c.headers.get("ssl").unwrap(), "1");
        assert_eq!(c.headers.get("https").unwrap(), "1");

        let mut c = ctx("/");
        c.headers
            .insert("x-forwarded-proto", HeaderValue::from_static("http"));
        detect_front_tls(&cfg, &mut c);
        assert!(!c.is_tls);
    }

    #[test]
    fn body_modes() {
        let cfg = ServerConfig::default().compile().unwrap();

        let mut c = ctx("/");
        c.method = Method::HEAD;
        assert_eq!(body_mode(&cfg, &c, true), BodyMode::Skip);

        let c = ctx("/");
        assert_eq!(body_mode(&cfg, &c, false), BodyMode::Skip);

        let mut c = ctx("/");
        c.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        assert_eq!(body_mode(&cfg, &c, true), BodyMode::Form);

        let mut c = ctx("/");
        c.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        assert_eq!(body_mode(&cfg, &c, true), BodyMode::Json);

        // content-encoding disables structured parsing.
        c.headers
            .insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        assert_eq!(body_mode(&cfg, &c, true), BodyMode::Raw);

        let mut c = ctx("/");
        c.headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/octet-stream"),
        );
        assert_eq!(body_mode(&cfg, &c, true), BodyMode::Raw);
    }

    #[test]
    fn json_body() {
        let cfg = ServerConfig::default().compile().unwrap();
        let mut c = ctx("/");
        process_body(
            &cfg,
            &mut c,
            BodyMode::Json,
            Bytes::from_static(b"{\"a\": [1, 2]}"),
            &UrlencodedParser,
        )
        .unwrap();
        assert_eq!(c.params.json().unwrap()["a"][1], 2);

        let err = process_body(
            &cfg,
            &mut c,
            BodyMode::Json,
            Bytes::from_static(b"{nope"),
            &UrlencodedParser,
        )
        .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn urlencoded_body() {
        let cfg = ServerConfig::default().compile().unwrap();
        let mut c = ctx("/");
        process_body(
            &cfg,
            &mut c,
            BodyMode::Form,
            Bytes::from_static(b"a=1&b=hello+world"),
            &UrlencodedParser,
        )
        .unwrap();
        let form = c.params.form().unwrap();
        assert_eq!(form["a"], "1");
        assert_eq!(form["b"], "hello world");
    }

    #[test]
    fn raw_body() {
        let cfg = ServerConfig::default().compile().unwrap();
        let mut c = ctx("/");
        process_body(
            &cfg,
            &mut c,
            BodyMode::Raw,
            Bytes::from_static(b"\x00\x01"),
            &UrlencodedParser,
        )
        .unwrap();
        assert_eq!(c.params.raw().unwrap().as_ref(), b"\x00\x01");
    }
}
