use core::{
    pin::Pin,
    task::{ready, Context, Poll},
};

use std::{
    io::{self, SeekFrom},
    path::{Path, PathBuf},
    time::SystemTime,
};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use http::{
    header::{
        HeaderValue, CACHE_CONTROL, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE,
        ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LOCATION, RANGE,
    },
    HeaderMap, StatusCode,
};
use pin_project_lite::pin_project;
use regex::Regex;
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncSeekExt, ReadBuf},
};
use tracing::debug;

use crate::{body::Body, handler::Response};

const CHUNK_SIZE: usize = 64 * 1024;

pub(crate) struct StaticRequest<'a> {
    /// url path, query already stripped, percent-encoded as received.
    pub path: &'a str,
    /// bypass base-dir resolution and serve this file verbatim.
    pub internal_file: Option<&'a str>,
    pub base: &'a Path,
    pub index: &'a str,
    pub cache_control: &'a str,
    /// serve a `.gz` sibling when the type is text-like and the client
    /// accepts gzip.
    pub gzip_sibling: bool,
    pub accepts_gzip: bool,
    pub regex_text: &'a Regex,
    pub headers: &'a HeaderMap,
    pub is_head: bool,
}

pub(crate) enum ServeError {
    /// missing file, traversal attempt or undecodable path. maps to 404.
    NotFound,
    Io(io::Error),
}

impl From<io::Error> for ServeError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied => Self::NotFound,
            _ => Self::Io(e),
        }
    }
}

/// Serve a file from disk with conditional-get, byte-range and pre-gzipped
/// sibling support.
pub(crate) async fn serve(req: StaticRequest<'_>) -> Result<Response, ServeError> {
    let (mut file_path, meta) = match req.internal_file {
        Some(path) => {
            let path = PathBuf::from(path);
            let meta = fs::metadata(&path).await?;
            (path, meta)
        }
        None => resolve(&req).await?,
    };

    let mut meta = meta;
    if meta.is_dir() {
        // a directory reached through the verbatim path still needs an index.
        file_path.push(req.index);
        meta = fs::metadata(&file_path).await?;
        if meta.is_dir() {
            return Err(ServeError::NotFound);
        }
    }

    let content_type = mime_guess::from_path(&file_path)
        .first_raw()
        .unwrap_or("application/octet-stream");

    // prefer a pre-compressed sibling over live compression for text files.
    let mut gzip_encoded = false;
    if req.gzip_sibling && req.accepts_gzip && req.regex_text.is_match(content_type) {
        let mut sibling = file_path.clone().into_os_string();
        sibling.push(".gz");
        let sibling = PathBuf::from(sibling);
        if let Ok(gz_meta) = fs::metadata(&sibling).await {
            if gz_meta.is_file() {
                file_path = sibling;
                meta = gz_meta;
                gzip_encoded = true;
            }
        }
    }

    let size = meta.len();
    let mtime = meta.modified().ok();
    let etag = etag_for(&meta);

    let mut res = Response::new(StatusCode::OK);
    res.headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_str(content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    if let Some(mtime) = mtime {
        if let Ok(v) = HeaderValue::from_str(&httpdate::fmt_http_date(mtime)) {
            res.headers.insert(http::header::LAST_MODIFIED, v);
        }
    }
    if let Ok(v) = HeaderValue::from_str(&etag) {
        res.headers.insert(ETAG, v);
    }
    if let Ok(v) = HeaderValue::from_str(req.cache_control) {
        res.headers.insert(CACHE_CONTROL, v);
    }
    if gzip_encoded {
        res.headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    }

    if not_modified(req.headers, &etag, mtime) {
        res.status = StatusCode::NOT_MODIFIED;
        return Ok(res);
    }

    let range = byte_range(req.headers, size);
    let (from, len) = match range {
        Some((from, to)) => {
            res.status = StatusCode::PARTIAL_CONTENT;
            let content_range = format!("bytes {from}-{to}/{size}");
            res.headers
                .insert(CONTENT_RANGE, HeaderValue::from_str(&content_range).unwrap());
            (from, to - from + 1)
        }
        None => (0, size),
    };

    res.headers
        .insert(CONTENT_LENGTH, HeaderValue::from(len));

    // head replies and zero length files carry headers only.
    if req.is_head || len == 0 {
        return Ok(res);
    }

    let mut file = File::open(&file_path).await?;
    if from > 0 {
        file.seek(SeekFrom::Start(from)).await?;
    }
    res.body = Body::stream(Box::pin(FileStream::new(file, len)), Some(len));

    Ok(res)
}

/// 302 redirect appending the missing trailing slash, so relative urls in
/// the index document resolve against the directory.
pub(crate) fn dir_redirect(path: &str) -> Response {
    let mut location = String::with_capacity(path.len() + 1);
    location.push_str(path);
    location.push('/');
    let mut res = Response::new(StatusCode::FOUND);
    res.headers.insert(
        LOCATION,
        HeaderValue::from_str(&location).unwrap_or_else(|_| HeaderValue::from_static("/")),
    );
    res
}

/// Resolve the url path under the base dir. Canonicalization plus a prefix
/// check defeats `..` and symlink escapes.
async fn resolve(req: &StaticRequest<'_>) -> Result<(PathBuf, std::fs::Metadata), ServeError> {
    let decoded = percent_encoding::percent_decode_str(req.path)
        .decode_utf8()
        .map_err(|_| ServeError::NotFound)?;
    if decoded.contains('\0') {
        return Err(ServeError::NotFound);
    }

    let rel = decoded.trim_start_matches('/').trim_end_matches('/');

    let base = fs::canonicalize(req.base).await?;
    let joined = if rel.is_empty() { base.clone() } else { base.join(rel) };

    let canonical = fs::canonicalize(&joined).await?;
    if !canonical.starts_with(&base) {
        debug!(target: "static", "path traversal attempt: {:?}", req.path);
        return Err(ServeError::NotFound);
    }

    let meta = fs::metadata(&canonical).await?;

    if meta.is_dir() {
        if !decoded.ends_with('/') {
            // caller turns this into the trailing slash redirect.
            return Err(ServeError::NotFound);
        }
        let indexed = canonical.join(req.index);
        let meta = fs::metadata(&indexed).await?;
        return Ok((indexed, meta));
    }

    Ok((canonical, meta))
}

/// Cheap existence + kind probe used by the dispatcher to decide between a
/// trailing slash redirect and a miss.
pub(crate) async fn is_dir_without_slash(base: &Path, path: &str) -> bool {
    let Ok(decoded) = percent_encoding::percent_decode_str(path).decode_utf8() else {
        return false;
    };
    if decoded.ends_with('/') {
        return false;
    }
    let rel = decoded.trim_start_matches('/');
    if rel.is_empty() {
        return false;
    }
    let Ok(base) = fs::canonicalize(base).await else {
        return false;
    };
    let Ok(canonical) = fs::canonicalize(base.join(rel)).await else {
        return false;
    };
    canonical.starts_with(&base) && fs::metadata(&canonical).await.map(|m| m.is_dir()).unwrap_or(false)
}

// etag is a quoted inode-size-mtime_ms triple; inode is 0 off unix.
fn etag_for(meta: &std::fs::Metadata) -> String {
    #[cfg(unix)]
    let ino = {
        use std::os::unix::fs::MetadataExt;
        meta.ino()
    };
    #[cfg(not(unix))]
    let ino = 0u64;

    let mtime_ms = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_millis())
        .unwrap_or(0);

    format!("\"{}-{}-{}\"", ino, meta.len(), mtime_ms)
}

fn not_modified(headers: &HeaderMap, etag: &str, mtime: Option<SystemTime>) -> bool {
    if let Some(inm) = headers.get(IF_NONE_MATCH).and_then(|v| v.to_str().ok()) {
        return inm
            .split(',')
            .map(str::trim)
            .any(|t| t == etag || t == "*");
    }
    if let (Some(ims), Some(mtime)) = (
        headers.get(IF_MODIFIED_SINCE).and_then(|v| v.to_str().ok()),
        mtime,
    ) {
        if let Ok(since) = httpdate::parse_http_date(ims) {
            // http dates have second resolution; truncate before comparing.
            let mtime_secs = mtime
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let since_secs = since
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            return mtime_secs <= since_secs;
        }
    }
    false
}

/// Parse a singular `Range: bytes=from-to` header. Multi-range requests and
/// anything invalid are ignored and the whole file is served.
fn byte_range(headers: &HeaderMap, size: u64) -> Option<(u64, u64)> {
    let value = headers.get(RANGE)?.to_str().ok()?;
    if value.contains(',') || size == 0 {
        return None;
    }
    let ranges = http_range_header::parse_range_header(value).ok()?;
    let mut validated = ranges.validate(size).ok()?;
    if validated.len() != 1 {
        return None;
    }
    let range = validated.pop()?;
    Some((*range.start(), *range.end()))
}

pin_project! {
    /// Sized chunk reader over an open file.
    struct FileStream {
        #[pin]
        file: File,
        remaining: u64,
    }
}

impl FileStream {
    fn new(file: File, remaining: u64) -> Self {
        Self { file, remaining }
    }
}

impl Stream for FileStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();

        if *this.remaining == 0 {
            return Poll::Ready(None);
        }

        let want = (*this.remaining).min(CHUNK_SIZE as u64) as usize;
        let mut buf = BytesMut::zeroed(want);
        let mut read_buf = ReadBuf::new(&mut buf);

        ready!(this.file.as_mut().poll_read(cx, &mut read_buf))?;
        let n = read_buf.filled().len();
        if n == 0 {
            // file shrank while serving; promised length can not be met.
            return Poll::Ready(Some(Err(io::ErrorKind::UnexpectedEof.into())));
        }

        *this.remaining -= n as u64;
        buf.truncate(n);
        Poll::Ready(Some(Ok(buf.freeze())))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let size = self.remaining as usize;
        (size, Some(size))
    }
}

#[cfg(test)]
mod test {
    use futures_util::StreamExt;
    use http::Method;

    use super::*;

    fn text_re() -> Regex {
        Regex::new("(text|javascript|json|css|html)").unwrap()
    }

    async fn body_bytes(body: Body) -> Vec<u8> {
        match body {
            Body::Empty => Vec::new(),
            Body::Bytes(b) => b.to_vec(),
            Body::Text(s) => s.into_bytes(),
            Body::Stream { mut stream, .. } => {
                let mut out = Vec::new();
                while let Some(chunk) = stream.next().await {
                    out.extend_from_slice(&chunk.unwrap());
                }
                out
            }
        }
    }

    fn request<'a>(
        base: &'a Path,
        path: &'a str,
        headers: &'a HeaderMap,
        method: &Method,
    ) -> StaticRequest<'a> {
        StaticRequest {
            path,
            internal_file: None,
            base,
            index: "index.html",
            cache_control: "public, max-age=3600",
            gzip_sibling: true,
            accepts_gzip: false,
            regex_text: Box::leak(Box::new(text_re())),
            headers,
            is_head: *method == Method::HEAD,
        }
    }

    #[tokio::test]
    async fn basic_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("hello.txt"), b"hello world").unwrap();

        let headers = HeaderMap::new();
        let res = serve(request(dir.path(), "/hello.txt", &headers, &Method::GET))
            .await
            .ok()
            .unwrap();
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(res.headers.get(CONTENT_TYPE).unwrap(), "text/plain");
        assert_eq!(res.headers.get(CONTENT_LENGTH).unwrap(), "11");
        assert!(res.headers.contains_key(ETAG));
        assert_eq!(body_bytes(res.body).await, b"hello world");
    }

    #[tokio::test]
    async fn traversal_denied() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("pub");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(dir.path().join("secret.txt"), b"secret").unwrap();

        let headers = HeaderMap::new();
        let res = serve(request(&sub, "/../secret.txt", &headers, &Method::GET)).await;
        assert!(matches!(res, Err(ServeError::NotFound)));

        let res = serve(request(&sub, "/%2e%2e/secret.txt", &headers, &Method::GET)).await;
        assert!(matches!(res, Err(ServeError::NotFound)));
    }

    #[tokio::test]
    async fn directory_index() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs/index.html"), b"<html>").unwrap();

        let headers = HeaderMap::new();
        let res = serve(request(dir.path(), "/docs/", &headers, &Method::GET))
            .await
            .ok()
            .unwrap();
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(body_bytes(res.body).await, b"<html>");

        // without the slash the resolver reports a miss; the dispatcher is
        // responsible for the redirect probe.
        assert!(is_dir_without_slash(dir.path(), "/docs").await);
        let res = serve(request(dir.path(), "/docs", &headers, &Method::GET)).await;
        assert!(matches!(res, Err(ServeError::NotFound)));
    }

    #[tokio::test]
    async fn pre_gzipped_sibling() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.js"), b"var x = 1;").unwrap();
        std::fs::write(dir.path().join("app.js.gz"), b"\x1f\x8bfake").unwrap();

        let headers = HeaderMap::new();
        let mut req = request(dir.path(), "/app.js", &headers, &Method::GET);
        req.accepts_gzip = true;
        let res = serve(req).await.ok().unwrap();
        assert_eq!(res.headers.get(CONTENT_ENCODING).unwrap(), "gzip");
        assert_eq!(body_bytes(res.body).await, b"\x1f\x8bfake");

        // no gzip accepted: plain file.
        let req = request(dir.path(), "/app.js", &headers, &Method::GET);
        let res = serve(req).await.ok().unwrap();
        assert!(res.headers.get(CONTENT_ENCODING).is_none());
        assert_eq!(body_bytes(res.body).await, b"var x = 1;");
    }

    #[tokio::test]
    async fn conditional_get() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("page.html"), b"content").unwrap();

        let headers = HeaderMap::new();
        let res = serve(request(dir.path(), "/page.html", &headers, &Method::GET))
            .await
            .ok()
            .unwrap();
        let etag = res.headers.get(ETAG).unwrap().clone();

        let mut headers = HeaderMap::new();
        headers.insert(IF_NONE_MATCH, etag);
        let res = serve(request(dir.path(), "/page.html", &headers, &Method::GET))
            .await
            .ok()
            .unwrap();
        assert_eq!(res.status, StatusCode::NOT_MODIFIED);
        assert!(matches!(res.body, Body::Empty));

        let mut headers = HeaderMap::new();
        headers.insert(
            IF_MODIFIED_SINCE,
            HeaderValue::from_str(&httpdate::fmt_http_date(SystemTime::now())).unwrap(),
        );
        let res = serve(request(dir.path(), "/page.html", &headers, &Method::GET))
            .await
            .ok()
            .unwrap();
        assert_eq!(res.status, StatusCode::NOT_MODIFIED);
    }

    #[tokio::test]
    async fn byte_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        std::fs::write(dir.path().join("big.bin"), &data).unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(RANGE, HeaderValue::from_static("bytes=100-199"));
        let res = serve(request(dir.path(), "/big.bin", &headers, &Method::GET))
            .await
            .ok()
            .unwrap();
        assert_eq!(res.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(res.headers.get(CONTENT_RANGE).unwrap(), "bytes 100-199/1000");
        assert_eq!(res.headers.get(CONTENT_LENGTH).unwrap(), "100");
        assert_eq!(body_bytes(res.body).await, &data[100..200]);

        // suffix range: last 100 bytes.
        let mut headers = HeaderMap::new();
        headers.insert(RANGE, HeaderValue::from_static("bytes=-100"));
        let res = serve(request(dir.path(), "/big.bin", &headers, &Method::GET))
            .await
            .ok()
            .unwrap();
        assert_eq!(res.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(res.headers.get(CONTENT_RANGE).unwrap(), "bytes 900-999/1000");

        // open ended: through eof.
        let mut headers = HeaderMap::new();
        headers.insert(RANGE, HeaderValue::from_static("bytes=990-"));
        let res = serve(request(dir.path(), "/big.bin", &headers, &Method::GET))
            .await
            .ok()
            .unwrap();
        assert_eq!(res.headers.get(CONTENT_RANGE).unwrap(), "bytes 990-999/1000");

        // invalid range is ignored.
        let mut headers = HeaderMap::new();
        headers.insert(RANGE, HeaderValue::from_static("bytes=700-100"));
        let res = serve(request(dir.path(), "/big.bin", &headers, &Method::GET))
            .await
            .ok()
            .unwrap();
        assert_eq!(res.status, StatusCode::OK);
        assert_eq!(res.headers.get(CONTENT_LENGTH).unwrap(), "1000");

        // multi-range is ignored.
        let mut headers = HeaderMap::new();
        headers.insert(RANGE, HeaderValue::from_static("bytes=0-1,5-6"));
        let res = serve(request(dir.path(), "/big.bin", &headers, &Method::GET))
            .await
            .ok()
            .unwrap();
        assert_eq!(res.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn head_and_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"abc").unwrap();
        std::fs::write(dir.path().join("empty.txt"), b"").unwrap();

        let headers = HeaderMap::new();
        let res = serve(request(dir.path(), "/a.txt", &headers, &Method::HEAD))
            .await
            .ok()
            .unwrap();
        assert_eq!(res.headers.get(CONTENT_LENGTH).unwrap(), "3");
        assert!(matches!(res.body, Body::Empty));

        let res = serve(request(dir.path(), "/empty.txt", &headers, &Method::GET))
            .await
            .ok()
            .unwrap();
        assert_eq!(res.headers.get(CONTENT_LENGTH).unwrap(), "0");
        assert!(matches!(res.body, Body::Empty));
    }

    #[tokio::test]
    async fn idempotent_etag() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f.txt"), b"same").unwrap();
        let headers = HeaderMap::new();
        let a = serve(request(dir.path(), "/f.txt", &headers, &Method::GET))
            .await
            .ok()
            .unwrap();
        let b = serve(request(dir.path(), "/f.txt", &headers, &Method::GET))
            .await
            .ok()
            .unwrap();
        assert_eq!(a.headers.get(ETAG), b.headers.get(ETAG));
        assert_eq!(a.headers.get(CONTENT_LENGTH), b.headers.get(CONTENT_LENGTH));
    }
}
