use core::future::poll_fn;

use std::{collections::HashMap, sync::Arc, time::SystemTime};

use bytes::{Bytes, BytesMut};
use http::{Method, StatusCode};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::watch,
    time::timeout,
};
use tracing::{debug, trace, warn};

use crate::{
    body::Body,
    config::CompiledConfig,
    engine::{
        error_response, intake,
        parse::{self, strip_query},
        Outcome,
    },
    error::ProtoError,
    h1::{
        codec::{ChunkResult, TransferCoding},
        decode::{decode_head, RequestHead},
        encode::encode_head,
    },
    ip,
    net::{ConnInfo, InFlight, Io},
    perf::PerfTimer,
    queue::QueueSlot,
    request::{Params, RequestCtx, RequestState},
    respond,
    server::Inner,
};

const MAX_HEAD: usize = 16 * 1024;
const WRITE_FLUSH_THRESHOLD: usize = 64 * 1024;
const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";
const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";

enum HeadWait {
    Head(Box<RequestHead>),
    /// clean close: peer eof, keep-alive expiry, shutdown while idle.
    Closed,
    /// preliminary timeout fired before the first request.
    PrelimTimeout,
    ParseError(ProtoError),
}

/// Per-connection loop: wait for a head, admit, queue, read the body, run
/// the engine, write the response, repeat until the keep-alive policy or a
/// fault closes the socket.
pub(crate) async fn run(
    inner: Arc<Inner>,
    mut io: Io,
    conn: Arc<ConnInfo>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut read_buf = BytesMut::with_capacity(8 * 1024);
    let mut served: u32 = 0;
    // whether any response head went out on this socket, for the manual 400.
    let mut wrote_any = false;

    loop {
        let cfg = inner.config();

        let head = match wait_for_head(&mut io, &mut read_buf, &cfg, served == 0, &mut shutdown).await
        {
            HeadWait::Head(head) => head,
            HeadWait::Closed => return,
            HeadWait::PrelimTimeout => {
                conn.aborted.store(true, std::sync::atomic::Ordering::Relaxed);
                if cfg.raw.http_log_socket_errors {
                    warn!(target: "h1_conn", conn = %conn.id, "socket timed out before first request");
                } else {
                    debug!(target: "h1_conn", conn = %conn.id, "socket timed out before first request");
                }
                return;
            }
            HeadWait::ParseError(e) => {
                debug!(target: "h1_conn", conn = %conn.id, "request parse error: {e}");
                // only answer on a socket with no response bytes in flight.
                if !wrote_any {
                    let _ = io.write_all(BAD_REQUEST).await;
                }
                let _ = io.shutdown().await;
                return;
            }
        };

        let mut req_bytes_in = head.head_len as u64;
        let mut req_bytes_out = 0u64;

        let mut ctx = build_ctx(&inner, &cfg, &head, &conn);
        *conn.in_flight.lock().unwrap() = Some(InFlight {
            id: ctx.id.clone(),
            uri: ctx.uri.clone(),
            started: SystemTime::now(),
        });

        // pre-queue admission.
        let admission = intake::admission_check(&cfg, &ctx, &inner.queue, inner.is_shutting_down());
        let slot: Option<QueueSlot> = match admission {
            intake::Admission::Reject(res) => {
                // an unread body would desync framing on reuse; force close.
                let force_close = head.has_body();
                served += 1;
                let code = res.status;
                ctx.advance(RequestState::Writing);
                let mut prepared = respond::prepare(&cfg, &mut ctx, res, served, inner.is_shutting_down());
                if force_close {
                    prepared.keep_alive = false;
                    prepared.headers.insert(
                        http::header::CONNECTION,
                        http::HeaderValue::from_static("close"),
                    );
                }
                let keep = prepared.keep_alive;
                match write_response(&mut io, prepared, head.method == Method::HEAD, head.version).await
                {
                    Ok(n) => {
                        wrote_any = true;
                        req_bytes_out += n;
                        inner.finish_request(
                            &cfg,
                            &mut ctx,
                            &conn,
                            code.as_u16(),
                            code.canonical_reason().unwrap_or(""),
                            req_bytes_in,
                            req_bytes_out,
                        );
                    }
                    Err(e) => {
                        socket_fault(&inner, &cfg, &mut ctx, &conn, &e, req_bytes_in, req_bytes_out);
                        return;
                    }
                }
                *conn.in_flight.lock().unwrap() = None;
                if !keep {
                    let _ = io.shutdown().await;
                    return;
                }
                continue;
            }
            intake::Admission::Enqueue => Some(inner.queue.acquire().await),
            intake::Admission::EnqueueFront => Some(inner.queue.acquire_front().await),
        };
        let mut slot = slot.unwrap();

        ctx.perf.end("queue");
        ctx.advance(RequestState::Reading);
        ctx.perf.begin("read");

        // ask for the body only once a queue slot is held.
        if head.expect_continue && head.has_body() {
            if let Err(e) = io.write_all(CONTINUE).await {
                socket_fault(&inner, &cfg, &mut ctx, &conn, &e, req_bytes_in, req_bytes_out);
                return;
            }
            req_bytes_out += CONTINUE.len() as u64;
        }

        let mut decoder = head.decoder;
        let body = match read_body(&mut io, &mut read_buf, &mut decoder, &cfg).await {
            BodyRead::Complete(bytes) => {
                req_bytes_in += bytes.len() as u64;
                bytes
            }
            BodyRead::TooLarge => {
                // no response at all: log and destroy the socket.
                warn!(
                    target: "h1_conn",
                    conn = %conn.id, req = %ctx.id, uri = %ctx.uri,
                    "413 request body exceeded {} bytes, destroying socket",
                    cfg.raw.http_max_upload_size
                );
                conn.aborted.store(true, std::sync::atomic::Ordering::Relaxed);
                inner.finish_request(
                    &cfg,
                    &mut ctx,
                    &conn,
                    StatusCode::PAYLOAD_TOO_LARGE.as_u16(),
                    "Payload Too Large",
                    req_bytes_in,
                    req_bytes_out,
                );
                parse::cleanup_uploads(&mut ctx).await;
                slot.release();
                return;
            }
            BodyRead::Fault(e) => {
                socket_fault(&inner, &cfg, &mut ctx, &conn, &e, req_bytes_in, req_bytes_out);
                parse::cleanup_uploads(&mut ctx).await;
                slot.release();
                return;
            }
        };
        ctx.perf.end("read");

        // parse + filters + dispatch, bounded by the per-request timeout.
        let has_body = !body.is_empty();
        let mut timed_out = false;
        let process = process_request(&inner, &cfg, &mut ctx, body, has_body);
        let outcome = match cfg.request_timeout {
            Some(dur) => match timeout(dur, process).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    timed_out = true;
                    Outcome::Respond(error_response(StatusCode::REQUEST_TIMEOUT))
                }
            },
            None => process.await,
        };

        if timed_out {
            // upload temp files do not outlive the request.
            parse::cleanup_uploads(&mut ctx).await;
        }

        ctx.advance(RequestState::Writing);
        ctx.perf.begin("write");

        match outcome {
            Outcome::Raw(bytes) => {
                served += 1;
                let result = io.write_all(&bytes).await;
                let flush = io.flush().await;
                match result.and(flush) {
                    Ok(()) => {
                        wrote_any = true;
                        req_bytes_out += bytes.len() as u64;
                        inner.finish_request(&cfg, &mut ctx, &conn, 200, "OK", req_bytes_in, req_bytes_out);
                    }
                    Err(e) => {
                        socket_fault(&inner, &cfg, &mut ctx, &conn, &e, req_bytes_in, req_bytes_out);
                    }
                }
                parse::cleanup_uploads(&mut ctx).await;
                slot.release();
                *conn.in_flight.lock().unwrap() = None;
                // framing of raw bytes is unknown; never reuse the socket.
                let _ = io.shutdown().await;
                return;
            }
            Outcome::Respond(res) => {
                served += 1;
                let code = res.status;
                let mut prepared =
                    respond::prepare(&cfg, &mut ctx, res, served, inner.is_shutting_down());
                if timed_out {
                    prepared.keep_alive = false;
                    prepared.headers.insert(
                        http::header::CONNECTION,
                        http::HeaderValue::from_static("close"),
                    );
                }
                let keep = prepared.keep_alive;
                match write_response(&mut io, prepared, head.method == Method::HEAD, head.version).await
                {
                    Ok(n) => {
                        wrote_any = true;
                        req_bytes_out += n;
                        inner.finish_request(
                            &cfg,
                            &mut ctx,
                            &conn,
                            code.as_u16(),
                            code.canonical_reason().unwrap_or(""),
                            req_bytes_in,
                            req_bytes_out,
                        );
                    }
                    Err(e) => {
                        socket_fault(&inner, &cfg, &mut ctx, &conn, &e, req_bytes_in, req_bytes_out);
                        parse::cleanup_uploads(&mut ctx).await;
                        slot.release();
                        return;
                    }
                }
                parse::cleanup_uploads(&mut ctx).await;
                slot.release();
                *conn.in_flight.lock().unwrap() = None;

                if !keep {
                    let _ = io.shutdown().await;
                    return;
                }
            }
        }
    }
}

fn build_ctx(inner: &Inner, cfg: &CompiledConfig, head: &RequestHead, conn: &ConnInfo) -> RequestCtx {
    let client_ips = ip::collect_client_ips(&head.headers, conn.remote);
    let public_ip = ip::public_ip(
        &client_ips,
        &cfg.private_ranges,
        cfg.raw.http_public_ip_offset,
    );

    let mut perf = PerfTimer::new();
    perf.begin("queue");

    RequestCtx {
        id: inner.next_req_id(),
        received: SystemTime::now(),
        method: head.method.clone(),
        uri: head.target.clone(),
        path: strip_query(&head.target).to_owned(),
        version: head.version,
        headers: head.headers.clone(),
        query: HashMap::new(),
        cookies: HashMap::new(),
        params: Params::None,
        files: Vec::new(),
        client_ips,
        public_ip,
        is_tls: conn.proto == "https",
        matches: Vec::new(),
        perf,
        state: RequestState::Queued,
        conn_id: conn.id.clone(),
        remote: conn.remote,
        port: conn.port,
        keep_alive: head.keep_alive,
        asked_keep_alive: head.asked_keep_alive,
        set_cookies: Vec::new(),
        raw_out: None,
        outcome: None,
    }
}

/// parse stages, https redirect enforcement and routing. Runs under the
/// per-request timeout.
async fn process_request(
    inner: &Inner,
    cfg: &CompiledConfig,
    ctx: &mut RequestCtx,
    body: Bytes,
    has_body: bool,
) -> Outcome {
    ctx.perf.begin("parse");
    parse::apply_rewrites(cfg, ctx);
    parse::detect_front_tls(cfg, ctx);
    parse::parse_query_and_cookies(cfg, ctx);

    let mode = parse::body_mode(cfg, ctx, has_body);
    let parsed = parse::process_body(cfg, ctx, mode, body, inner.form_parser().as_ref());
    ctx.perf.end("parse");

    if let Err(res) = parsed {
        return Outcome::Respond(res);
    }

    // plain requests bounce to the tls port when https is enforced.
    if cfg.raw.https_force && !ctx.is_tls {
        if let Some(host) = ctx.host() {
            let location = format!("https://{}{}", host, ctx.uri);
            let mut res = crate::handler::Response::new(StatusCode::MOVED_PERMANENTLY);
            if let Ok(v) = http::HeaderValue::from_str(&respond::sanitize_str(&location)) {
                res.headers.insert(http::header::LOCATION, v);
            }
            return Outcome::Respond(res);
        }
    }

    crate::engine::dispatch::route(cfg, inner.routes(), ctx).await
}

async fn wait_for_head(
    io: &mut Io,
    buf: &mut BytesMut,
    cfg: &CompiledConfig,
    first_request: bool,
    shutdown: &mut watch::Receiver<bool>,
) -> HeadWait {
    loop {
        match decode_head(buf, MAX_HEAD) {
            Ok(Some(head)) => return HeadWait::Head(Box::new(head)),
            Ok(None) => {}
            Err(e) => return HeadWait::ParseError(e),
        }

        let idle = buf.is_empty();
        let wait = if idle && first_request {
            cfg.prelim_timeout.or(cfg.timeout)
        } else if idle {
            cfg.keep_alive_timeout.or(cfg.timeout)
        } else {
            cfg.timeout
        };

        let read = async {
            if idle {
                // between requests a shutdown closes the socket immediately.
                tokio::select! {
                    n = io.read_buf(buf) => Some(n),
                    _ = shutdown.changed() => None,
                }
            } else {
                Some(io.read_buf(buf).await)
            }
        };

        let result = match wait {
            Some(dur) => match timeout(dur, read).await {
                Ok(r) => r,
                Err(_) => {
                    if idle && first_request && cfg.prelim_timeout.is_some() {
                        return HeadWait::PrelimTimeout;
                    }
                    trace!(target: "h1_conn", "socket idle timeout expired, closing");
                    return HeadWait::Closed;
                }
            },
            None => read.await,
        };

        match result {
            None => return HeadWait::Closed,
            Some(Ok(0)) => return HeadWait::Closed,
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(target: "h1_conn", "socket read error: {e}");
                return HeadWait::Closed;
            }
        }
    }
}

enum BodyRead {
    Complete(Bytes),
    TooLarge,
    Fault(std::io::Error),
}

/// Drain the request body into memory, bounded by the upload cap.
async fn read_body(
    io: &mut Io,
    buf: &mut BytesMut,
    decoder: &mut TransferCoding,
    cfg: &CompiledConfig,
) -> BodyRead {
    let cap = cfg.raw.http_max_upload_size;
    let mut body = BytesMut::new();

    loop {
        match decoder.decode(buf) {
            ChunkResult::Ok(chunk) => {
                body.extend_from_slice(&chunk);
                if body.len() as u64 > cap {
                    return BodyRead::TooLarge;
                }
            }
            ChunkResult::Eof => return BodyRead::Complete(body.freeze()),
            ChunkResult::Err(e) => {
                return BodyRead::Fault(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
            }
            ChunkResult::InsufficientData => {
                let read = io.read_buf(buf);
                let n = match cfg.timeout {
                    Some(dur) => match timeout(dur, read).await {
                        Ok(n) => n,
                        Err(_) => {
                            return BodyRead::Fault(std::io::ErrorKind::TimedOut.into());
                        }
                    },
                    None => read.await,
                };
                match n {
                    Ok(0) => return BodyRead::Fault(std::io::ErrorKind::UnexpectedEof.into()),
                    Ok(_) => {}
                    Err(e) => return BodyRead::Fault(e),
                }
            }
        }
    }
}

/// Write one prepared response. Returns bytes put on the wire.
async fn write_response(
    io: &mut Io,
    prepared: respond::Prepared,
    is_head: bool,
    version: http::Version,
) -> std::io::Result<u64> {
    let mut buf = BytesMut::with_capacity(1024);
    let (mut coding, _) = encode_head(
        &mut buf,
        version,
        prepared.status,
        &prepared.headers,
        prepared.body.size(),
        is_head,
    );

    let mut total = 0u64;

    match prepared.body {
        Body::Empty => {
            coding.encode_eof(&mut buf);
        }
        Body::Bytes(b) => {
            coding.encode(&b, &mut buf);
            coding.encode_eof(&mut buf);
        }
        Body::Text(s) => {
            coding.encode(s.as_bytes(), &mut buf);
            coding.encode_eof(&mut buf);
        }
        Body::Stream { mut stream, .. } => {
            io.write_all(&buf).await?;
            total += buf.len() as u64;
            buf.clear();

            while let Some(chunk) = poll_fn(|cx| stream.as_mut().poll_next(cx)).await {
                let chunk = chunk?;
                coding.encode(&chunk, &mut buf);
                if buf.len() >= WRITE_FLUSH_THRESHOLD {
                    io.write_all(&buf).await?;
                    total += buf.len() as u64;
                    buf.clear();
                }
            }
            coding.encode_eof(&mut buf);
        }
    }

    io.write_all(&buf).await?;
    total += buf.len() as u64;
    io.flush().await?;

    Ok(total)
}

/// Resolve an in-flight request hit by a socket fault with the synthetic
/// zero status.
fn socket_fault(
    inner: &Inner,
    cfg: &CompiledConfig,
    ctx: &mut RequestCtx,
    conn: &ConnInfo,
    e: &std::io::Error,
    bytes_in: u64,
    bytes_out: u64,
) {
    if cfg.raw.http_log_socket_errors {
        warn!(target: "h1_conn", conn = %conn.id, req = %ctx.id, "socket error: {e}");
    } else {
        debug!(target: "h1_conn", conn = %conn.id, req = %ctx.id, "socket error: {e}");
    }
    conn.aborted.store(true, std::sync::atomic::Ordering::Relaxed);
    inner.finish_request(cfg, ctx, conn, 0, "Socket Error", bytes_in, bytes_out);
    *conn.in_flight.lock().unwrap() = None;
}
