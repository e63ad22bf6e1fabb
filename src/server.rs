use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, RwLock,
    },
    time::{Duration, SystemTime},
};

use http::Method;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    acl::Acl,
    config::{CompiledConfig, ServerConfig, StaticTtl},
    engine::{FormParser, UrlencodedParser},
    error::Error,
    handler::{FilterFn, HandlerFn, HandlerKind, Routes},
    metrics::{log_slow, log_transaction, Metrics, RequestSummary},
    net::{accept_loop, bind_listener, ConnInfo},
    queue::Queue,
    request::RequestCtx,
    tls::CertManager,
};

const LISTEN_BACKLOG: u32 = 2048;

/// Called on every accepted socket with a connection snapshot.
pub type SocketCallback = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

/// Called once per completed request with the perf object and the summary.
pub type MetricsCallback = Arc<dyn Fn(&serde_json::Value, &RequestSummary) + Send + Sync>;

/// ACL attached to a handler registration.
pub enum HandlerAcl {
    /// use `http_default_acl`.
    Default,
    /// explicit CIDR blocks.
    Blocks(Vec<String>),
}

/// Options for [WebServer::add_directory_handler].
#[derive(Default)]
pub struct DirectoryOptions {
    pub acl: Option<HandlerAcl>,
    pub ttl: Option<StaticTtl>,
    pub headers: HashMap<String, String>,
}

/// The embeddable http/https server engine.
///
/// A `WebServer` is constructed from a [ServerConfig], started with
/// [start](WebServer::start), driven by periodic [tick](WebServer::tick)
/// calls from the host (certificate polling, stats rotation) and stopped
/// with [shutdown](WebServer::shutdown). Handlers, filters and directory
/// mounts may be registered at any time.
#[derive(Clone)]
pub struct WebServer {
    inner: Arc<Inner>,
}

pub(crate) struct Inner {
    cfg: RwLock<Arc<CompiledConfig>>,
    routes: RwLock<Routes>,
    pub(crate) queue: Queue,
    pub(crate) metrics: Metrics,

    conns: Mutex<HashMap<String, Arc<ConnInfo>>>,
    conn_count: AtomicUsize,
    conn_seq: AtomicU64,
    req_seq: AtomicU64,

    started: Mutex<Option<SystemTime>>,
    running: AtomicBool,
    shutting_down: AtomicBool,
    shutdown_tx: watch::Sender<bool>,

    cert: Mutex<Option<Arc<CertManager>>>,
    form_parser: RwLock<Arc<dyn FormParser>>,

    on_socket: RwLock<Vec<SocketCallback>>,
    on_metrics: RwLock<Vec<MetricsCallback>>,

    listeners: Mutex<Vec<ListenerInfo>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct ListenerInfo {
    proto: &'static str,
    port: u16,
    addr: SocketAddr,
}

impl WebServer {
    pub fn new(config: ServerConfig) -> Result<Self, Error> {
        let compiled = config.compile()?;
        let queue = Queue::new(compiled.raw.http_max_concurrent_requests);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                cfg: RwLock::new(Arc::new(compiled)),
                routes: RwLock::new(Routes::default()),
                queue,
                metrics: Metrics::default(),
                conns: Mutex::new(HashMap::new()),
                conn_count: AtomicUsize::new(0),
                conn_seq: AtomicU64::new(0),
                req_seq: AtomicU64::new(0),
                started: Mutex::new(None),
                running: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                shutdown_tx,
                cert: Mutex::new(None),
                form_parser: RwLock::new(Arc::new(UrlencodedParser)),
                on_socket: RwLock::new(Vec::new()),
                on_metrics: RwLock::new(Vec::new()),
                listeners: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Bind every configured listener and start accepting. Listener bind
    /// failures abort startup and surface to the caller.
    pub async fn start(&self) -> Result<(), Error> {
        if self.inner.is_shutting_down() {
            return Err(Error::Closed);
        }
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(Error::Config(String::from("server already started")));
        }
        *self.inner.started.lock().unwrap() = Some(SystemTime::now());

        let cfg = self.inner.config();

        // the http listener is always on; port 0 binds an ephemeral port.
        let mut binds: Vec<(bool, u16)> = Vec::new();
        binds.push((false, cfg.raw.http_port));
        for port in cfg.raw.http_alt_ports.iter() {
            binds.push((false, *port));
        }
        if cfg.raw.https {
            let cert = CertManager::new(
                &cfg.raw.https_cert_file,
                &cfg.raw.https_key_file,
                (!cfg.raw.https_ca_file.is_empty())
                    .then(|| std::path::PathBuf::from(&cfg.raw.https_ca_file)),
                cfg.cert_poll,
            )?;
            *self.inner.cert.lock().unwrap() = Some(Arc::new(cert));

            binds.push((true, cfg.raw.https_port));
            for port in cfg.raw.https_alt_ports.iter() {
                binds.push((true, *port));
            }
        }

        let mut tasks = Vec::with_capacity(binds.len() + 1);
        for (tls, port) in binds {
            let bind = if tls {
                &cfg.raw.https_bind_address
            } else {
                &cfg.raw.http_bind_address
            };
            let listener = bind_listener(bind, port, LISTEN_BACKLOG)?;
            let addr = listener.local_addr()?;
            let proto = if tls { "https" } else { "http" };
            info!(target: "acceptor", "listening on {proto}://{addr}");
            self.inner.listeners.lock().unwrap().push(ListenerInfo {
                proto,
                // a 0 port in config resolves at bind time.
                port: addr.port(),
                addr,
            });
            let inner = self.inner.clone();
            let shutdown = self.inner.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(accept_loop(inner, listener, tls, addr.port(), shutdown)));
        }

        // internal 1s tick: cert polling and stats rotation. hosts may call
        // tick() themselves as well; both paths are idempotent per interval.
        let inner = self.inner.clone();
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        tasks.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => inner.tick().await,
                    _ = shutdown.changed() => return,
                }
            }
        }));

        *self.inner.tasks.lock().unwrap() = tasks;
        Ok(())
    }

    /// One housekeeping tick: swap the stats buffers, poll certificates.
    pub async fn tick(&self) {
        self.inner.tick().await;
    }

    /// Stop accepting, close idle sockets, let in-flight requests finish,
    /// then return. Waits up to `timeout` for connections to drain.
    pub async fn shutdown(&self, timeout: Duration) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let _ = self.inner.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + timeout;
        while self.inner.conn_count() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let tasks = std::mem::take(&mut *self.inner.tasks.lock().unwrap());
        for task in tasks {
            task.abort();
        }
        let remaining = self.inner.conn_count();
        if remaining > 0 {
            warn!(target: "acceptor", "shutdown with {remaining} connections still open");
        }
    }

    /// Replace the live configuration. Compiled state swaps atomically;
    /// in-flight requests finish under the config they started with.
    /// Listener bindings and certificate paths are fixed at start.
    pub fn apply_config(&self, config: ServerConfig) -> Result<(), Error> {
        let compiled = Arc::new(config.compile()?);
        self.inner
            .queue
            .set_concurrency(compiled.raw.http_max_concurrent_requests);
        *self.inner.cfg.write().unwrap() = compiled;
        Ok(())
    }

    pub fn add_uri_filter(&self, pattern: &str, name: &str, callback: FilterFn) -> Result<(), Error> {
        self.inner.routes.write().unwrap().add_filter(pattern, name, callback)
    }

    pub fn remove_uri_filter(&self, name: &str) {
        self.inner.routes.write().unwrap().remove_filter(name);
    }

    pub fn add_uri_handler(&self, pattern: &str, name: &str, callback: HandlerFn) -> Result<(), Error> {
        self.inner
            .routes
            .write()
            .unwrap()
            .add_uri(pattern, name, None, HandlerKind::Callback(callback))
    }

    pub fn add_uri_handler_with_acl(
        &self,
        pattern: &str,
        name: &str,
        acl: HandlerAcl,
        callback: HandlerFn,
    ) -> Result<(), Error> {
        let acl = self.resolve_acl(acl)?;
        self.inner
            .routes
            .write()
            .unwrap()
            .add_uri(pattern, name, Some(acl), HandlerKind::Callback(callback))
    }

    /// String-target registration: requests matching the pattern serve the
    /// given file through the static path.
    pub fn add_uri_file_handler(&self, pattern: &str, name: &str, target: &str) -> Result<(), Error> {
        self.inner.routes.write().unwrap().add_uri(
            pattern,
            name,
            None,
            HandlerKind::InternalFile(target.to_owned()),
        )
    }

    pub fn remove_uri_handler(&self, name: &str) {
        self.inner.routes.write().unwrap().remove_uri(name);
    }

    pub fn add_method_handler(&self, method: Method, name: &str, callback: HandlerFn) {
        self.inner.routes.write().unwrap().add_method(method, name, callback);
    }

    pub fn remove_method_handler(&self, name: &str) {
        self.inner.routes.write().unwrap().remove_method(name);
    }

    /// Mount a directory for static serving under a uri prefix.
    pub fn add_directory_handler(
        &self,
        uri_match: &str,
        base_path: impl Into<std::path::PathBuf>,
        opts: DirectoryOptions,
    ) -> Result<(), Error> {
        let acl = opts.acl.map(|acl| self.resolve_acl(acl)).transpose()?;
        let headers = opts
            .headers
            .iter()
            .map(|(name, value)| {
                let name = http::header::HeaderName::from_bytes(name.as_bytes())
                    .map_err(|_| Error::Config(format!("invalid header name: {name:?}")))?;
                let value = http::HeaderValue::from_str(value)
                    .map_err(|_| Error::Config(format!("invalid header value: {value:?}")))?;
                Ok((name, value))
            })
            .collect::<Result<Vec<_>, Error>>()?;
        self.inner.routes.write().unwrap().add_uri(
            uri_match,
            uri_match,
            acl,
            HandlerKind::Directory {
                base: base_path.into(),
                ttl: opts.ttl,
                headers,
            },
        )
    }

    pub fn remove_directory_handler(&self, uri_match: &str) {
        self.inner.routes.write().unwrap().remove_uri_pattern(uri_match);
    }

    /// Replace the form-body parser (multipart support plugs in here).
    pub fn set_form_parser(&self, parser: Arc<dyn FormParser>) {
        *self.inner.form_parser.write().unwrap() = parser;
    }

    pub fn on_socket(&self, callback: SocketCallback) {
        self.inner.on_socket.write().unwrap().push(callback);
    }

    pub fn on_metrics(&self, callback: MetricsCallback) {
        self.inner.on_metrics.write().unwrap().push(callback);
    }

    /// Bound listener addresses, in bind order. Useful with port 0 configs.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.inner.listeners.lock().unwrap().iter().map(|l| l.addr).collect()
    }

    /// Stats snapshot: server info, last-interval stats, listeners, live
    /// sockets and the recent request ring.
    pub fn get_stats(&self) -> serde_json::Value {
        let inner = &self.inner;
        let started = *inner.started.lock().unwrap();
        let uptime = started
            .and_then(|t| t.elapsed().ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let last = inner.metrics.last();
        let mut stats = serde_json::to_value(&last).unwrap_or_default();
        if let Some(obj) = stats.as_object_mut() {
            obj.insert(
                String::from("queue"),
                serde_json::json!({
                    "pending": inner.queue.len(),
                    "running": inner.queue.running(),
                }),
            );
        }

        let listeners: Vec<_> = inner
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|l| {
                serde_json::json!({
                    "proto": l.proto,
                    "port": l.port,
                    "addr": l.addr.to_string(),
                })
            })
            .collect();

        let sockets: Vec<_> = inner.conn_snapshots();

        serde_json::json!({
            "server": {
                "version": env!("CARGO_PKG_VERSION"),
                "uptime_sec": uptime,
                "num_connections": inner.conn_count(),
                "num_pending": inner.queue.len(),
                "num_active": inner.queue.running(),
                "shutting_down": inner.is_shutting_down(),
            },
            "stats": stats,
            "listeners": listeners,
            "sockets": sockets,
            "recent": inner.metrics.recent(),
        })
    }
}

impl Inner {
    pub(crate) fn config(&self) -> Arc<CompiledConfig> {
        self.cfg.read().unwrap().clone()
    }

    pub(crate) fn routes(&self) -> &RwLock<Routes> {
        &self.routes
    }

    pub(crate) fn form_parser(&self) -> Arc<dyn FormParser> {
        self.form_parser.read().unwrap().clone()
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    pub(crate) fn conn_count(&self) -> usize {
        self.conn_count.load(Ordering::Relaxed)
    }

    pub(crate) fn next_conn_id(&self, tls: bool) -> String {
        let seq = self.conn_seq.fetch_add(1, Ordering::Relaxed) + 1;
        if tls {
            format!("cs{seq}")
        } else {
            format!("c{seq}")
        }
    }

    pub(crate) fn next_req_id(&self) -> String {
        format!("r{}", self.req_seq.fetch_add(1, Ordering::Relaxed) + 1)
    }

    pub(crate) fn register_conn(&self, conn: Arc<ConnInfo>) {
        let mut conns = self.conns.lock().unwrap();
        conns.insert(conn.id.clone(), conn);
        self.conn_count.store(conns.len(), Ordering::Relaxed);
    }

    pub(crate) fn unregister_conn(&self, id: &str) {
        let mut conns = self.conns.lock().unwrap();
        conns.remove(id);
        self.conn_count.store(conns.len(), Ordering::Relaxed);
    }

    pub(crate) fn conn_snapshots(&self) -> Vec<serde_json::Value> {
        self.conns
            .lock()
            .unwrap()
            .values()
            .map(|c| c.snapshot())
            .collect()
    }

    pub(crate) fn tls_acceptor(&self) -> Option<tokio_rustls::TlsAcceptor> {
        self.cert.lock().unwrap().as_ref().map(|c| c.acceptor())
    }

    pub(crate) fn emit_socket(&self, conn: &ConnInfo) {
        let callbacks = self.on_socket.read().unwrap().clone();
        if callbacks.is_empty() {
            return;
        }
        let snapshot = conn.snapshot();
        for callback in callbacks {
            callback(&snapshot);
        }
    }

    pub(crate) async fn tick(&self) {
        self.metrics.tick();
        let cert = self.cert.lock().unwrap().clone();
        if let Some(cert) = cert {
            cert.poll_tick().await;
        }
    }

    /// Single finalization point for every request outcome. Guarded so a
    /// request can not be finished twice.
    pub(crate) fn finish_request(
        &self,
        cfg: &CompiledConfig,
        ctx: &mut RequestCtx,
        conn: &ConnInfo,
        code: u16,
        status: &str,
        bytes_in: u64,
        bytes_out: u64,
    ) {
        if ctx.outcome.is_some() {
            debug!(target: "engine", "request {} already finished, ignoring", ctx.id);
            return;
        }
        ctx.outcome = Some((code, status.to_owned()));
        ctx.advance(crate::request::RequestState::Finished);
        ctx.perf.finish();

        conn.num_requests.fetch_add(1, Ordering::Relaxed);
        conn.bytes_in.fetch_add(bytes_in, Ordering::Relaxed);
        conn.bytes_out.fetch_add(bytes_out, Ordering::Relaxed);

        let snapshot = ctx.perf.snapshot();
        let summary = RequestSummary {
            id: ctx.id.clone(),
            conn_id: ctx.conn_id.clone(),
            when: ctx
                .received
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            proto: conn.proto,
            port: conn.port,
            ip: ctx
                .public_ip
                .or(ctx.remote)
                .map(|ip| ip.to_string())
                .unwrap_or_default(),
            method: ctx.method.to_string(),
            uri: ctx.uri.clone(),
            host: ctx.host().unwrap_or_default(),
            code,
            status: status.to_owned(),
            elapsed_ms: snapshot.total_ms,
            bytes_in,
            bytes_out,
        };

        self.metrics
            .record(&snapshot, summary.clone(), cfg.raw.http_recent_requests);

        if cfg.raw.http_log_requests
            && cfg
                .regex_log
                .as_ref()
                .map_or(true, |re| re.is_match(&ctx.uri))
        {
            log_transaction(&summary);
        }

        if cfg.raw.http_log_perf && snapshot.total_ms >= cfg.raw.http_perf_threshold_ms {
            log_slow(&summary, &snapshot, cfg.raw.http_log_perf_report.enabled());
        }

        let callbacks = self.on_metrics.read().unwrap().clone();
        if !callbacks.is_empty() {
            let metrics_obj = serde_json::json!({
                "total_ms": snapshot.total_ms,
                "phases": snapshot
                    .phases
                    .iter()
                    .map(|(name, ms)| (name.to_string(), *ms))
                    .collect::<HashMap<String, f64>>(),
                "counters": snapshot
                    .counters
                    .iter()
                    .map(|(name, n)| (name.to_string(), *n))
                    .collect::<HashMap<String, u64>>(),
            });
            for callback in callbacks {
                callback(&metrics_obj, &summary);
            }
        }
    }

    fn resolve_acl_inner(&self, acl: HandlerAcl) -> Result<Acl, Error> {
        match acl {
            HandlerAcl::Default => Ok(self.config().default_acl.clone()),
            HandlerAcl::Blocks(blocks) => Acl::new(blocks),
        }
    }
}

impl WebServer {
    fn resolve_acl(&self, acl: HandlerAcl) -> Result<Acl, Error> {
        self.inner.resolve_acl_inner(acl)
    }
}
