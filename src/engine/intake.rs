use http::StatusCode;
use tracing::warn;

use crate::{config::CompiledConfig, queue::Queue, request::RequestCtx};

use super::error_response;

/// Admission verdict for a request that just finished head parse.
pub(crate) enum Admission {
    /// enqueue normally.
    Enqueue,
    /// skip-uri fast lane: front-insert into the pending queue.
    EnqueueFront,
    /// terminal rejection carrying the response to send.
    Reject(crate::handler::Response),
}

/// Pre-queue checks in fixed order: remote address, shutdown, blacklist,
/// host allow-list, skip-uri, active cap, pending cap.
pub(crate) fn admission_check(
    cfg: &CompiledConfig,
    ctx: &RequestCtx,
    queue: &Queue,
    shutting_down: bool,
) -> Admission {
    if ctx.remote.is_none() {
        warn!(target: "intake", "request {} has no socket remote address", ctx.id);
        return Admission::Reject(error_response(StatusCode::BAD_REQUEST));
    }

    if shutting_down {
        return Admission::Reject(error_response(StatusCode::SERVICE_UNAVAILABLE));
    }

    // header-derived addresses are checked here; the socket address itself
    // was already screened at accept time.
    if !cfg.blacklist.is_empty() {
        let remote = ctx.remote.unwrap();
        let forwarded: Vec<_> = ctx
            .client_ips
            .iter()
            .copied()
            .filter(|ip| *ip != remote)
            .collect();
        if cfg.blacklist.check_any(&forwarded) {
            warn!(target: "intake", "blacklisted forwarded address on {}: {:?}", ctx.id, forwarded);
            return Admission::Reject(error_response(StatusCode::FORBIDDEN));
        }
    }

    if !cfg.allow_hosts.is_empty() {
        match ctx.host() {
            Some(host) if cfg.allow_hosts.iter().any(|h| *h == host) => {}
            other => {
                warn!(target: "intake", "host not allowed on {}: {:?}", ctx.id, other);
                return Admission::Reject(error_response(StatusCode::FORBIDDEN));
            }
        }
    }

    if let Some(ref skip) = cfg.skip_uri {
        if skip.is_match(&ctx.uri) {
            return Admission::EnqueueFront;
        }
    }

    let max_active = cfg.raw.http_max_queue_active;
    if max_active > 0 && queue.running() >= max_active {
        warn!(target: "intake", "active request cap reached, rejecting {}", ctx.id);
        return Admission::Reject(error_response(StatusCode::TOO_MANY_REQUESTS));
    }

    if queue.len() >= cfg.raw.http_max_queue_length {
        warn!(target: "intake", "pending queue full, rejecting {}", ctx.id);
        return Admission::Reject(error_response(StatusCode::TOO_MANY_REQUESTS));
    }

    Admission::Enqueue
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use http::{HeaderMap, HeaderValue, Method, Version};

    use crate::{
        config::ServerConfig,
        perf::PerfTimer,
        request::{Params, RequestState},
    };

    use super::*;

    fn ctx(host: Option<&str>) -> RequestCtx {
        let mut headers = HeaderMap::new();
        if let Some(host) = host {
            headers.insert(http::header::HOST, HeaderValue::from_str(host).unwrap());
        }
        RequestCtx {
            id: String::from("r1"),
            received: std::time::SystemTime::now(),
            method: Method::GET,
            uri: String::from("/x"),
            path: String::from("/x"),
            version: Version::HTTP_11,
            headers,
            query: HashMap::new(),
            cookies: HashMap::new(),
            params: Params::None,
            files: Vec::new(),
            client_ips: vec!["127.0.0.1".parse().unwrap()],
            public_ip: None,
            is_tls: false,
            matches: Vec::new(),
            perf: PerfTimer::new(),
            state: RequestState::Queued,
            conn_id: String::from("c1"),
            remote: Some("127.0.0.1".parse().unwrap()),
            port: 80,
            keep_alive: true,
            asked_keep_alive: false,
            set_cookies: Vec::new(),
            raw_out: None,
            outcome: None,
        }
    }

    fn status_of(admission: Admission) -> Option<StatusCode> {
        match admission {
            Admission::Reject(res) => Some(res.status),
            _ => None,
        }
    }

    #[test]
    fn shutdown_rejects_503() {
        let cfg = ServerConfig::default().compile().unwrap();
        let queue = Queue::new(4);
        let verdict = admission_check(&cfg, &ctx(None), &queue, true);
        assert_eq!(status_of(verdict), Some(StatusCode::SERVICE_UNAVAILABLE));
    }

    #[test]
    fn missing_remote_rejects_400() {
        let cfg = ServerConfig::default().compile().unwrap();
        let queue = Queue::new(4);
        let mut c = ctx(None);
        c.remote = None;
        assert_eq!(
            status_of(admission_check(&cfg, &c, &queue, false)),
            Some(StatusCode::BAD_REQUEST)
        );
    }

    #[test]
    fn forwarded_blacklist_rejects_403() {
        let mut raw = ServerConfig::default();
        raw.http_blacklist = vec![String::from("9.9.9.0/24")];
        let cfg = raw.compile().unwrap();
        let queue = Queue::new(4);

        let mut c = ctx(None);
        c.client_ips = vec!["9.9.9.9".parse().unwrap(), "127.0.0.1".parse().unwrap()];
        assert_eq!(
            status_of(admission_check(&cfg, &c, &queue, false)),
            Some(StatusCode::FORBIDDEN)
        );

        // socket-only list passes; the socket address was screened earlier.
        let c = ctx(None);
        assert!(matches!(
            admission_check(&cfg, &c, &queue, false),
            Admission::Enqueue
        ));
    }

    #[test]
    fn host_allow_list() {
        let mut raw = ServerConfig::default();
        raw.http_allow_hosts = vec![String::from("Good.Example.Com")];
        let cfg = raw.compile().unwrap();
        let queue = Queue::new(4);

        // port stripped, case folded.
        let c = ctx(Some("good.example.com:8080"));
        assert!(matches!(
            admission_check(&cfg, &c, &queue, false),
            Admission::Enqueue
        ));

        let c = ctx(Some("evil.example.com"));
        assert_eq!(
            status_of(admission_check(&cfg, &c, &queue, false)),
            Some(StatusCode::FORBIDDEN)
        );

        let c = ctx(None);
        assert_eq!(
            status_of(admission_check(&cfg, &c, &queue, false)),
            Some(StatusCode::FORBIDDEN)
        );
    }

    #[test]
    fn skip_uri_front_inserts() {
        let mut raw = ServerConfig::default();
        raw.http_queue_skip_uri_match = String::from("^/health");
        raw.http_max_queue_length = 0;
        let cfg = raw.compile().unwrap();
        let queue = Queue::new(1);

        let mut c = ctx(None);
        c.uri = String::from("/health?probe=1");
        // skip uris bypass the queue caps entirely.
        assert!(matches!(
            admission_check(&cfg, &c, &queue, false),
            Admission::EnqueueFront
        ));

        let c = ctx(None);
        assert_eq!(
            status_of(admission_check(&cfg, &c, &queue, false)),
            Some(StatusCode::TOO_MANY_REQUESTS)
        );
    }
}
