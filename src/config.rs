use core::fmt;

use std::{collections::HashMap, env, path::PathBuf, time::Duration};

use http::{header::HeaderName, HeaderValue, StatusCode};
use regex::Regex;
use serde::{
    de::{self, Deserializer, Visitor},
    Deserialize,
};

use crate::{acl::Acl, error::Error};

/// Keep-alive policy. `close` always closes, `request` keeps the socket open
/// only when the client asked for keep-alive, `default` keeps it open unless
/// the client said close.
///
/// The config key accepts both the numeric form (0/1/2) and the string names.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum KeepAlives {
    Close,
    Request,
    #[default]
    Default,
}

impl<'de> Deserialize<'de> for KeepAlives {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct KaVisitor;

        impl Visitor<'_> for KaVisitor {
            type Value = KeepAlives;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("0|1|2 or \"close\"|\"request\"|\"default\"")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                match v {
                    0 => Ok(KeepAlives::Close),
                    1 => Ok(KeepAlives::Request),
                    2 => Ok(KeepAlives::Default),
                    other => Err(E::custom(format!("invalid keep-alive mode: {other}"))),
                }
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                u64::try_from(v)
                    .map_err(|_| E::custom(format!("invalid keep-alive mode: {v}")))
                    .and_then(|v| self.visit_u64(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                match v {
                    "close" => Ok(KeepAlives::Close),
                    "request" => Ok(KeepAlives::Request),
                    "default" => Ok(KeepAlives::Default),
                    other => Err(E::custom(format!("invalid keep-alive mode: {other:?}"))),
                }
            }
        }

        deserializer.deserialize_any(KaVisitor)
    }
}

/// `http_static_ttl`: integer seconds become `public, max-age=<n>`, a string
/// is emitted as the `Cache-Control` value verbatim.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum StaticTtl {
    Secs(u64),
    Raw(String),
}

impl Default for StaticTtl {
    fn default() -> Self {
        Self::Secs(0)
    }
}

impl StaticTtl {
    pub fn cache_control(&self) -> String {
        match self {
            Self::Secs(n) => format!("public, max-age={n}"),
            Self::Raw(s) => s.clone(),
        }
    }
}

/// `http_log_perf_report`: false, true (full report) or a list of sections.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum PerfReport {
    Flag(bool),
    Sections(Vec<String>),
}

impl Default for PerfReport {
    fn default() -> Self {
        Self::Flag(false)
    }
}

impl PerfReport {
    pub fn enabled(&self) -> bool {
        !matches!(self, Self::Flag(false))
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct GzipOpts {
    #[serde(default = "default_gzip_level")]
    pub level: u32,
}

impl Default for GzipOpts {
    fn default() -> Self {
        Self { level: default_gzip_level() }
    }
}

fn default_gzip_level() -> u32 {
    6
}

/// Brotli tuning, friendly keys. `mode` selects the encoder mode by content
/// kind, `hint` is the expected input size.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BrotliOpts {
    pub mode: String,
    pub level: u32,
    pub hint: usize,
    #[serde(rename = "chunkSize")]
    pub chunk_size: usize,
}

impl Default for BrotliOpts {
    fn default() -> Self {
        Self {
            mode: String::from("text"),
            level: 4,
            hint: 0,
            chunk_size: 16 * 1024,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RewriteRule {
    #[serde(rename = "match")]
    pub pattern: String,
    pub url: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub last: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct RedirectRule {
    #[serde(rename = "match")]
    pub pattern: String,
    pub url: String,
    /// defaults to 302 Found.
    #[serde(default)]
    pub status: Option<u16>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct UriHeaderRule {
    #[serde(rename = "match")]
    pub pattern: String,
    pub headers: HashMap<String, String>,
}

/// Every tunable of the engine. Deserializable from the host's config store;
/// all keys optional with production defaults.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    // ports and binds
    pub http_port: u16,
    pub http_bind_address: String,
    pub https_port: u16,
    pub https_bind_address: String,
    pub http_alt_ports: Vec<u16>,
    pub https_alt_ports: Vec<u16>,
    pub https: bool,

    // tls
    pub https_cert_file: String,
    pub https_key_file: String,
    pub https_ca_file: String,
    pub https_cert_poll_ms: u64,
    pub https_force: bool,
    pub https_header_detect: HashMap<String, String>,
    pub https_allow_hosts: Vec<String>,

    // admission
    pub http_max_connections: usize,
    pub http_max_concurrent_requests: usize,
    pub http_max_queue_length: usize,
    /// optional hard cap on in-flight requests checked at admission,
    /// independent of the queue concurrency. 0 disables.
    pub http_max_queue_active: usize,
    pub http_queue_skip_uri_match: String,
    pub http_blacklist: Vec<String>,
    pub http_allow_hosts: Vec<String>,
    pub http_default_acl: Vec<String>,
    pub http_private_ip_ranges: Vec<String>,
    pub http_public_ip_offset: i32,

    // timeouts, seconds. 0 disables.
    pub http_timeout: f64,
    pub http_keep_alive_timeout: f64,
    pub http_socket_prelim_timeout: f64,
    pub http_request_timeout: f64,

    // request body
    pub http_max_upload_size: u64,
    pub http_temp_dir: String,
    pub http_allow_empty_files: bool,
    pub http_flatten_query: bool,
    pub http_full_uri_match: bool,

    // compression
    pub http_compress_text: bool,
    pub http_enable_brotli: bool,
    pub http_gzip_opts: GzipOpts,
    pub http_brotli_opts: BrotliOpts,

    // static serving
    pub http_htdocs_dir: String,
    pub http_static_index: String,
    pub http_static_ttl: StaticTtl,
    /// serve a pre-gzipped `.gz` sibling for text-like files. decoupled from
    /// the compression gate.
    pub http_static_gzip_text: bool,

    // response headers
    pub http_response_headers: HashMap<String, String>,
    pub http_code_response_headers: HashMap<String, HashMap<String, String>>,
    pub http_uri_response_headers: Vec<UriHeaderRule>,
    pub http_clean_headers: bool,
    pub http_server_signature: String,

    // routing
    pub http_rewrites: Vec<RewriteRule>,
    pub http_redirects: Vec<RedirectRule>,

    // keep-alives
    pub http_keep_alives: KeepAlives,
    pub http_max_requests_per_connection: u32,

    // logging and metrics
    pub http_log_requests: bool,
    pub http_regex_log: String,
    pub http_log_socket_errors: bool,
    pub http_log_perf: bool,
    pub http_perf_threshold_ms: f64,
    pub http_log_perf_report: PerfReport,
    pub http_recent_requests: usize,
    pub http_regex_text: String,
    pub http_regex_json: String,
    pub http_legacy_callback_support: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 3000,
            http_bind_address: String::new(),
            https_port: 3001,
            https_bind_address: String::new(),
            http_alt_ports: Vec::new(),
            https_alt_ports: Vec::new(),
            https: false,

            https_cert_file: String::new(),
            https_key_file: String::new(),
            https_ca_file: String::new(),
            https_cert_poll_ms: 0,
            https_force: false,
            https_header_detect: [
                ("front-end-https", "^on$"),
                ("x-url-scheme", "^https$"),
                ("x-forwarded-protocol", "^https$"),
                ("x-forwarded-proto", "^https$"),
                ("x-forwarded-ssl", "^on$"),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect(),
            https_allow_hosts: Vec::new(),

            http_max_connections: 255,
            http_max_concurrent_requests: 64,
            http_max_queue_length: 1024,
            http_max_queue_active: 0,
            http_queue_skip_uri_match: String::new(),
            http_blacklist: Vec::new(),
            http_allow_hosts: Vec::new(),
            http_default_acl: vec![
                String::from("127.0.0.0/8"),
                String::from("10.0.0.0/8"),
                String::from("172.16.0.0/12"),
                String::from("192.168.0.0/16"),
                String::from("::1/128"),
            ],
            http_private_ip_ranges: Vec::new(),
            http_public_ip_offset: 0,

            http_timeout: 120.0,
            http_keep_alive_timeout: 15.0,
            http_socket_prelim_timeout: 0.0,
            http_request_timeout: 0.0,

            http_max_upload_size: 32 * 1024 * 1024,
            http_temp_dir: String::new(),
            http_allow_empty_files: false,
            http_flatten_query: false,
            http_full_uri_match: false,

            http_compress_text: false,
            http_enable_brotli: false,
            http_gzip_opts: GzipOpts::default(),
            http_brotli_opts: BrotliOpts::default(),

            http_htdocs_dir: String::from("htdocs"),
            http_static_index: String::from("index.html"),
            http_static_ttl: StaticTtl::default(),
            http_static_gzip_text: true,

            http_response_headers: HashMap::new(),
            http_code_response_headers: HashMap::new(),
            http_uri_response_headers: Vec::new(),
            http_clean_headers: true,
            http_server_signature: format!("quay-http {}", env!("CARGO_PKG_VERSION")),

            http_rewrites: Vec::new(),
            http_redirects: Vec::new(),

            http_keep_alives: KeepAlives::Default,
            http_max_requests_per_connection: 0,

            http_log_requests: true,
            http_regex_log: String::new(),
            http_log_socket_errors: true,
            http_log_perf: false,
            http_perf_threshold_ms: 100.0,
            http_log_perf_report: PerfReport::default(),
            http_recent_requests: 10,
            http_regex_text: String::from("(text|javascript|json|css|html)"),
            http_regex_json: String::from("(javascript|js|json)"),
            http_legacy_callback_support: false,
        }
    }
}

/// A compiled rewrite: regex, replacement url with `$N` back-references,
/// headers to inject, stop flag.
#[derive(Clone, Debug)]
pub struct Rewrite {
    pub re: Regex,
    pub url: String,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub last: bool,
}

#[derive(Clone, Debug)]
pub struct Redirect {
    pub re: Regex,
    pub url: String,
    pub status: StatusCode,
    pub headers: Vec<(HeaderName, HeaderValue)>,
}

/// [ServerConfig] with every pattern compiled, every acl parsed and every
/// duration resolved. Built once per config application; shared behind `Arc`.
pub struct CompiledConfig {
    pub raw: ServerConfig,

    pub skip_uri: Option<Regex>,
    pub blacklist: Acl,
    pub allow_hosts: Vec<String>,
    pub https_allow_hosts: Vec<String>,
    pub default_acl: Acl,
    pub private_ranges: Acl,
    pub https_header_detect: Vec<(String, Regex)>,

    pub regex_text: Regex,
    pub regex_json: Regex,
    pub regex_log: Option<Regex>,

    pub rewrites: Vec<Rewrite>,
    pub redirects: Vec<Redirect>,

    pub response_headers: Vec<(HeaderName, HeaderValue)>,
    pub code_response_headers: HashMap<u16, Vec<(HeaderName, HeaderValue)>>,
    pub uri_response_headers: Vec<(Regex, Vec<(HeaderName, HeaderValue)>)>,

    pub timeout: Option<Duration>,
    pub keep_alive_timeout: Option<Duration>,
    pub prelim_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
    pub cert_poll: Option<Duration>,

    pub temp_dir: PathBuf,
}

impl ServerConfig {
    pub fn compile(self) -> Result<CompiledConfig, Error> {
        let skip_uri = compile_opt_regex(&self.http_queue_skip_uri_match)?;
        let regex_log = compile_opt_regex(&self.http_regex_log)?;
        let regex_text = compile_regex(&self.http_regex_text)?;
        let regex_json = compile_regex(&self.http_regex_json)?;

        let blacklist = Acl::new(&self.http_blacklist)?;
        let default_acl = Acl::new(&self.http_default_acl)?;
        let private_ranges = if self.http_private_ip_ranges.is_empty() {
            Acl::private_ranges()
        } else {
            Acl::new(&self.http_private_ip_ranges)?
        };

        let https_header_detect = self
            .https_header_detect
            .iter()
            .map(|(name, pattern)| Ok((name.to_ascii_lowercase(), compile_regex(pattern)?)))
            .collect::<Result<Vec<_>, Error>>()?;

        let rewrites = self
            .http_rewrites
            .iter()
            .map(|rule| {
                Ok(Rewrite {
                    re: compile_regex(&rule.pattern)?,
                    url: rule.url.clone(),
                    headers: compile_headers(&rule.headers)?,
                    last: rule.last,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let redirects = self
            .http_redirects
            .iter()
            .map(|rule| {
                let status = match rule.status {
                    Some(code) => StatusCode::from_u16(code)
                        .map_err(|_| Error::Config(format!("invalid redirect status: {code}")))?,
                    None => StatusCode::FOUND,
                };
                Ok(Redirect {
                    re: compile_regex(&rule.pattern)?,
                    url: rule.url.clone(),
                    status,
                    headers: compile_headers(&rule.headers)?,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let response_headers = compile_headers(&self.http_response_headers)?;

        let code_response_headers = self
            .http_code_response_headers
            .iter()
            .map(|(code, headers)| {
                let code = code
                    .parse::<u16>()
                    .map_err(|_| Error::Config(format!("invalid status code key: {code:?}")))?;
                Ok((code, compile_headers(headers)?))
            })
            .collect::<Result<HashMap<_, _>, Error>>()?;

        let uri_response_headers = self
            .http_uri_response_headers
            .iter()
            .map(|rule| Ok((compile_regex(&rule.pattern)?, compile_headers(&rule.headers)?)))
            .collect::<Result<Vec<_>, Error>>()?;

        let allow_hosts = lowercase_all(&self.http_allow_hosts);
        let https_allow_hosts = lowercase_all(&self.https_allow_hosts);

        let temp_dir = if self.http_temp_dir.is_empty() {
            env::temp_dir()
        } else {
            PathBuf::from(&self.http_temp_dir)
        };

        Ok(CompiledConfig {
            skip_uri,
            blacklist,
            allow_hosts,
            https_allow_hosts,
            default_acl,
            private_ranges,
            https_header_detect,
            regex_text,
            regex_json,
            regex_log,
            rewrites,
            redirects,
            response_headers,
            code_response_headers,
            uri_response_headers,
            timeout: secs(self.http_timeout),
            keep_alive_timeout: secs(self.http_keep_alive_timeout),
            prelim_timeout: secs(self.http_socket_prelim_timeout),
            request_timeout: secs(self.http_request_timeout),
            cert_poll: millis(self.https_cert_poll_ms),
            temp_dir,
            raw: self,
        })
    }
}

fn secs(v: f64) -> Option<Duration> {
    (v > 0.0).then(|| Duration::from_secs_f64(v))
}

fn millis(v: u64) -> Option<Duration> {
    (v > 0).then(|| Duration::from_millis(v))
}

fn lowercase_all(list: &[String]) -> Vec<String> {
    list.iter().map(|s| s.to_ascii_lowercase()).collect()
}

fn compile_regex(pattern: &str) -> Result<Regex, Error> {
    Regex::new(pattern).map_err(|e| Error::Config(format!("invalid regex {pattern:?}: {e}")))
}

fn compile_opt_regex(pattern: &str) -> Result<Option<Regex>, Error> {
    if pattern.is_empty() {
        Ok(None)
    } else {
        compile_regex(pattern).map(Some)
    }
}

fn compile_headers(map: &HashMap<String, String>) -> Result<Vec<(HeaderName, HeaderValue)>, Error> {
    map.iter()
        .map(|(name, value)| {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| Error::Config(format!("invalid header name: {name:?}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| Error::Config(format!("invalid header value for {name}: {value:?}")))?;
            Ok((name, value))
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_compile() {
        ServerConfig::default().compile().unwrap();
    }

    #[test]
    fn keep_alives_both_forms() {
        #[derive(Deserialize)]
        struct Wrap {
            ka: KeepAlives,
        }
        let w: Wrap = serde_json::from_str(r#"{"ka": 0}"#).unwrap();
        assert_eq!(w.ka, KeepAlives::Close);
        let w: Wrap = serde_json::from_str(r#"{"ka": "request"}"#).unwrap();
        assert_eq!(w.ka, KeepAlives::Request);
        let w: Wrap = serde_json::from_str(r#"{"ka": 2}"#).unwrap();
        assert_eq!(w.ka, KeepAlives::Default);
        assert!(serde_json::from_str::<Wrap>(r#"{"ka": 9}"#).is_err());
    }

    #[test]
    fn static_ttl_forms() {
        #[derive(Deserialize)]
        struct Wrap {
            ttl: StaticTtl,
        }
        let w: Wrap = serde_json::from_str(r#"{"ttl": 3600}"#).unwrap();
        assert_eq!(w.ttl.cache_control(), "public, max-age=3600");
        let w: Wrap = serde_json::from_str(r#"{"ttl": "private, no-cache"}"#).unwrap();
        assert_eq!(w.ttl.cache_control(), "private, no-cache");
    }

    #[test]
    fn bad_regex_rejected() {
        let cfg = ServerConfig {
            http_queue_skip_uri_match: String::from("(["),
            ..Default::default()
        };
        assert!(cfg.compile().is_err());
    }

    #[test]
    fn full_json_config() {
        let cfg: ServerConfig = serde_json::from_str(
            r#"{
                "http_port": 8080,
                "http_keep_alives": "close",
                "http_static_ttl": 60,
                "http_redirects": [
                    {"match": "^/old(.*)$", "url": "https://ex.com$1", "status": 301}
                ],
                "http_rewrites": [
                    {"match": "^/v1/(.*)$", "url": "/api/$1", "last": true}
                ],
                "http_code_response_headers": {"404": {"X-Miss": "1"}}
            }"#,
        )
        .unwrap();
        let compiled = cfg.compile().unwrap();
        assert_eq!(compiled.raw.http_port, 8080);
        assert_eq!(compiled.redirects[0].status, StatusCode::MOVED_PERMANENTLY);
        assert!(compiled.rewrites[0].last);
        assert!(compiled.code_response_headers.contains_key(&404));
    }
}
