use std::{
    collections::HashMap,
    net::IpAddr,
    path::PathBuf,
    time::SystemTime,
};

use bytes::Bytes;
use http::{HeaderMap, Method, Version};
use serde::Serialize;
use tracing::warn;

use crate::{cookie::SetCookie, perf::PerfTimer};

/// Lifecycle state of a request. Transitions are monotonic; a request that
/// reached `Writing` can not re-enter the pipeline.
#[derive(Copy, Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum RequestState {
    Queued,
    Reading,
    Filtering,
    Processing,
    Writing,
    Finished,
}

/// One query value. Repeated keys collect in order; `http_flatten_query`
/// keeps the last value instead.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryValue {
    One(String),
    Many(Vec<String>),
}

/// Parsed request body.
#[derive(Clone, Debug, Default)]
pub enum Params {
    #[default]
    None,
    Json(serde_json::Value),
    Form(HashMap<String, String>),
    Raw(Bytes),
}

impl Params {
    pub fn json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(v) => Some(v),
            _ => None,
        }
    }

    pub fn form(&self) -> Option<&HashMap<String, String>> {
        match self {
            Self::Form(f) => Some(f),
            _ => None,
        }
    }

    pub fn raw(&self) -> Option<&Bytes> {
        match self {
            Self::Raw(b) => Some(b),
            _ => None,
        }
    }
}

/// Descriptor of an uploaded file produced by the form parser. The temp file
/// belongs to the request and is deleted when the request finishes.
#[derive(Clone, Debug)]
pub struct UploadedFile {
    pub path: PathBuf,
    pub content_type: String,
    pub name: String,
    pub size: u64,
    pub mtime: Option<SystemTime>,
}

/// Per-request context handed to filters and handlers.
pub struct RequestCtx {
    /// server scoped id, `r` prefix.
    pub id: String,
    pub received: SystemTime,
    pub method: Method,
    /// request target after rewrites, query included.
    pub uri: String,
    /// uri with the query stripped.
    pub path: String,
    pub version: Version,
    pub headers: HeaderMap,
    pub query: HashMap<String, QueryValue>,
    pub cookies: HashMap<String, String>,
    pub params: Params,
    pub files: Vec<UploadedFile>,
    pub client_ips: Vec<IpAddr>,
    pub public_ip: Option<IpAddr>,
    /// true when the listener is tls or a front-end tls header matched.
    pub is_tls: bool,
    /// capture groups of the uri handler regex that matched, `$0` first.
    pub matches: Vec<String>,
    pub perf: PerfTimer,

    pub(crate) state: RequestState,
    pub(crate) conn_id: String,
    pub(crate) remote: Option<IpAddr>,
    pub(crate) port: u16,
    /// effective keep-alive decoded from the request head; the `Connection`
    /// request header is never re-parsed downstream.
    pub(crate) keep_alive: bool,
    /// client sent an explicit `Connection: keep-alive` (last token wins).
    pub(crate) asked_keep_alive: bool,
    pub(crate) set_cookies: Vec<SetCookie>,
    pub(crate) raw_out: Option<Bytes>,
    /// final (code, status) pair recorded for metrics.
    pub(crate) outcome: Option<(u16, String)>,
}

impl RequestCtx {
    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    /// the host header with any port stripped, lowercased.
    pub fn host(&self) -> Option<String> {
        let host = self.headers.get(http::header::HOST)?.to_str().ok()?;
        let host = host.rsplit_once(':').map_or(host, |(h, _)| h);
        Some(host.to_ascii_lowercase())
    }

    /// queue a `Set-Cookie` header for the response.
    pub fn set_cookie(&mut self, cookie: SetCookie) {
        self.set_cookies.push(cookie);
    }

    /// hand back a raw, pre-framed response. the engine writes the bytes
    /// verbatim and closes the connection since it can not know the framing.
    pub fn write_raw(&mut self, bytes: Bytes) {
        self.raw_out = Some(bytes);
    }

    pub(crate) fn advance(&mut self, next: RequestState) {
        if next > self.state {
            self.state = next;
        } else if next < self.state {
            warn!(
                target: "engine",
                "ignoring backwards state transition {:?} -> {:?} for {}",
                self.state, next, self.id
            );
        }
    }
}

/// Parse a raw query string. `+` decodes to space, percent sequences are
/// decoded, undecodable tokens are kept verbatim.
pub fn parse_query(raw: &str, flatten: bool) -> HashMap<String, QueryValue> {
    let mut out: HashMap<String, QueryValue> = HashMap::new();
    for pair in raw.split('&') {
        if pair.is_empty() {
            continue;
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let key = decode_component(key);
        let value = decode_component(value);
        if flatten {
            out.insert(key, QueryValue::One(value));
            continue;
        }
        match out.remove(&key) {
            None => {
                out.insert(key, QueryValue::One(value));
            }
            Some(QueryValue::One(first)) => {
                out.insert(key, QueryValue::Many(vec![first, value]));
            }
            Some(QueryValue::Many(mut list)) => {
                list.push(value);
                out.insert(key, QueryValue::Many(list));
            }
        }
    }
    out
}

fn decode_component(raw: &str) -> String {
    let plus_decoded = raw.replace('+', " ");
    match percent_encoding::percent_decode_str(&plus_decoded).decode_utf8() {
        Ok(s) => s.into_owned(),
        Err(_) => plus_decoded,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn repeated_keys_collect() {
        let q = parse_query("x=1&x=2&y=a%20b&flag", false);
        assert_eq!(
            q["x"],
            QueryValue::Many(vec![String::from("1"), String::from("2")])
        );
        assert_eq!(q["y"], QueryValue::One(String::from("a b")));
        assert_eq!(q["flag"], QueryValue::One(String::new()));
    }

    #[test]
    fn flatten_keeps_last() {
        let q = parse_query("x=1&x=2", true);
        assert_eq!(q["x"], QueryValue::One(String::from("2")));
    }

    #[test]
    fn query_value_serializes_flat_or_list() {
        let q = parse_query("x=1&x=2&y=3", false);
        let json = serde_json::to_value(&q).unwrap();
        assert_eq!(json["x"], serde_json::json!(["1", "2"]));
        assert_eq!(json["y"], serde_json::json!("3"));
    }

    #[test]
    fn plus_decodes_to_space() {
        let q = parse_query("name=John+Doe", false);
        assert_eq!(q["name"], QueryValue::One(String::from("John Doe")));
    }
}
