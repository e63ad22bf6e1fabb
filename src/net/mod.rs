use core::{
    pin::Pin,
    task::{Context, Poll},
};

use std::{
    io,
    net::{IpAddr, SocketAddr},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, SystemTime},
};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::{TcpListener, TcpStream},
    sync::watch,
    time::timeout,
};
use tracing::{debug, error, warn};

use crate::server::Inner;

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Socket stream, plain or tls.
pub(crate) enum Io {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl AsyncRead for Io {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Io {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Per-connection bookkeeping shared between the connection task and the
/// stats surface. Lives exactly as long as the socket.
pub(crate) struct ConnInfo {
    pub id: String,
    pub proto: &'static str,
    pub port: u16,
    pub remote: Option<IpAddr>,
    pub started: SystemTime,
    pub num_requests: AtomicU32,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub aborted: AtomicBool,
    pub in_flight: Mutex<Option<InFlight>>,
}

#[derive(Clone)]
pub(crate) struct InFlight {
    pub id: String,
    pub uri: String,
    pub started: SystemTime,
}

impl ConnInfo {
    pub fn snapshot(&self) -> serde_json::Value {
        let in_flight = self.in_flight.lock().unwrap().clone();
        serde_json::json!({
            "id": self.id,
            "proto": self.proto,
            "port": self.port,
            "ip": self.remote.map(|ip| ip.to_string()),
            "uptime_sec": self.started.elapsed().map(|d| d.as_secs()).unwrap_or(0),
            "num_requests": self.num_requests.load(Ordering::Relaxed),
            "bytes_in": self.bytes_in.load(Ordering::Relaxed),
            "bytes_out": self.bytes_out.load(Ordering::Relaxed),
            "aborted": self.aborted.load(Ordering::Relaxed),
            "current": in_flight.map(|r| serde_json::json!({
                "id": r.id,
                "uri": r.uri,
                "elapsed_sec": r.started.elapsed().map(|d| d.as_secs()).unwrap_or(0),
            })),
        })
    }
}

/// Build a listening socket with reuse-addr and the given backlog.
pub(crate) fn bind_listener(bind: &str, port: u16, backlog: u32) -> io::Result<TcpListener> {
    let addr: SocketAddr = if bind.is_empty() {
        SocketAddr::from(([0, 0, 0, 0], port))
    } else {
        format!("{bind}:{port}")
            .parse()
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid bind address"))?
    };

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog as i32)?;

    TcpListener::from_std(socket.into())
}

/// Accept loop for one listener. Runs until shutdown is signalled; every
/// admission failure is logged and never escapes the loop.
pub(crate) async fn accept_loop(
    inner: Arc<Inner>,
    listener: TcpListener,
    tls: bool,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            res = listener.accept() => res,
            _ = shutdown.changed() => return,
        };

        let (stream, peer) = match accepted {
            Ok(pair) => pair,
            Err(ref e) if connection_error(e) => continue,
            Err(e) => {
                error!(target: "acceptor", "error accepting connection: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        // per-socket work (tls handshake included) must not stall the loop.
        tokio::spawn(handle_accept(
            inner.clone(),
            stream,
            peer,
            tls,
            port,
            shutdown.clone(),
        ));
    }
}

async fn handle_accept(
    inner: Arc<Inner>,
    stream: TcpStream,
    peer: SocketAddr,
    tls: bool,
    port: u16,
    shutdown: watch::Receiver<bool>,
) {
    let cfg = inner.config();

    if inner.conn_count() >= cfg.raw.http_max_connections {
        warn!(target: "acceptor", reason = "maxconns", %peer, "rejecting connection");
        dump_active(&inner);
        reject(stream).await;
        return;
    }

    if inner.is_shutting_down() {
        warn!(target: "acceptor", reason = "shutdown", %peer, "rejecting connection");
        reject(stream).await;
        return;
    }

    let remote = peer.ip().to_canonical();
    if cfg.blacklist.check(remote) {
        warn!(target: "acceptor", reason = "blacklist", %peer, "rejecting connection");
        reject(stream).await;
        return;
    }

    let _ = stream.set_nodelay(true);

    let io = if tls {
        let Some(acceptor) = inner.tls_acceptor() else {
            error!(target: "acceptor", "tls listener without a certificate bundle");
            reject(stream).await;
            return;
        };
        let handshake = timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await;
        let tls_stream = match handshake {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => {
                debug!(target: "acceptor", %peer, "tls handshake failed: {e}");
                return;
            }
            Err(_) => {
                debug!(target: "acceptor", %peer, "tls handshake timed out");
                return;
            }
        };

        if !cfg.https_allow_hosts.is_empty() {
            let sni = tls_stream
                .get_ref()
                .1
                .server_name()
                .map(|s| s.to_ascii_lowercase());
            let allowed = sni
                .as_deref()
                .is_some_and(|name| cfg.https_allow_hosts.iter().any(|h| h == name));
            if !allowed {
                warn!(target: "acceptor", reason = "allowhosts", %peer, ?sni, "rejecting connection");
                let mut s = tls_stream;
                let _ = s.shutdown().await;
                return;
            }
        }

        Io::Tls(Box::new(tls_stream))
    } else {
        Io::Plain(stream)
    };

    let conn = Arc::new(ConnInfo {
        id: inner.next_conn_id(tls),
        proto: if tls { "https" } else { "http" },
        port,
        remote: Some(remote),
        started: SystemTime::now(),
        num_requests: AtomicU32::new(0),
        bytes_in: AtomicU64::new(0),
        bytes_out: AtomicU64::new(0),
        aborted: AtomicBool::new(false),
        in_flight: Mutex::new(None),
    });

    inner.register_conn(conn.clone());
    inner.emit_socket(&conn);

    crate::h1::conn::run(inner.clone(), io, conn.clone(), shutdown).await;
    inner.unregister_conn(&conn.id);
}

async fn reject(mut stream: TcpStream) {
    // half-close so the peer sees eof, then drop hard-closes.
    let _ = stream.shutdown().await;
}

// diagnostics on maxconns: what is every live connection doing right now.
fn dump_active(inner: &Inner) {
    for snapshot in inner.conn_snapshots() {
        debug!(target: "acceptor", "active: {snapshot}");
    }
}

fn connection_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    )
}
