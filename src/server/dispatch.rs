use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use http::{Method, StatusCode, Version};
use httpdate::{fmt_http_date, parse_http_date};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::{fs as async_fs, io::SeekFrom};
use tracing::{debug, trace};

use crate::cache::{ByteRange, FileMeta, PacingConfig, StreamConsumer, StreamError};
use crate::error::ServeError;
use crate::logging::AccessLogBuilder;

use super::AppContext;
use super::codec::{self, RequestHead};
use super::resolver::Resolution;

/// Serves requests off one client connection until it closes, errors, or
/// opts out of keep-alive.
pub async fn serve_connection(stream: TcpStream, peer: SocketAddr, app: AppContext) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    loop {
        let Some(head) = codec::read_request_head(
            &mut reader,
            peer,
            app.settings.client_timeout(),
            app.settings.max_header_size,
        )
        .await?
        else {
            return Ok(());
        };

        let keep_alive = head.keep_alive();
        let served = handle_request(&head, &mut write_half, peer, &app).await?;
        if !served || !keep_alive {
            write_half.shutdown().await.ok();
            return Ok(());
        }
    }
}

/// Dispatches one parsed request. Returns whether the connection is still
/// in a known-good state for another request.
async fn handle_request<W>(
    head: &RequestHead,
    sink: &mut W,
    peer: SocketAddr,
    app: &AppContext,
) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    let started = Instant::now();
    let mut log = AccessLogBuilder::new(peer)
        .method(head.method.as_str())
        .path(head.target.clone());
    if let Some(range) = head.header("range") {
        log = log.range(range);
    }

    if head.method != Method::GET && head.method != Method::HEAD {
        let status = write_error_response(sink, head, StatusCode::METHOD_NOT_ALLOWED).await?;
        log.status(status).elapsed(started.elapsed()).log();
        // Any request body was never drained, so the framing is gone.
        return Ok(false);
    }

    let asset_path = match app.resolver.resolve(&head.method, &head.target) {
        Resolution::Asset(path) => path,
        Resolution::Status(status) => {
            let status = write_error_response(sink, head, status).await?;
            log.status(status).elapsed(started.elapsed()).log();
            return Ok(true);
        }
        Resolution::Deferred => {
            // The resolver owns this request; nothing was written, so the
            // framing is unknown and the connection cannot be reused.
            debug!(peer = %peer, target = %head.target, "request deferred by resolver");
            return Ok(false);
        }
    };

    match &app.cache {
        Some(cache) => {
            serve_cached(head, sink, app, cache.clone(), &asset_path, log, started).await
        }
        None => serve_direct(head, sink, app, &asset_path, log, started).await,
    }
}

async fn serve_cached<W>(
    head: &RequestHead,
    sink: &mut W,
    app: &AppContext,
    cache: Arc<crate::cache::AssetCache>,
    asset_path: &Path,
    log: AccessLogBuilder,
    started: Instant,
) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    let resident = cache.get(asset_path).is_some();
    let log = log.cache_lookup(if resident { "hit" } else { "miss" });

    let entry = cache.get_or_create(asset_path);
    let meta = match entry.wait_readable().await {
        Ok(meta) => meta,
        Err(err) => {
            let status = write_error_response(sink, head, err.status()).await?;
            log.status(status)
                .error_reason(err.to_string())
                .elapsed(started.elapsed())
                .log();
            return Ok(true);
        }
    };

    let plan = match plan_response(head, app, asset_path, meta) {
        Ok(plan) => plan,
        Err(err) => {
            let status = write_error_response(sink, head, err.status()).await?;
            log.status(status)
                .error_reason(err.to_string())
                .elapsed(started.elapsed())
                .log();
            return Ok(true);
        }
    };

    let head_bytes = codec::encode_response_head(head.version, plan.status, &plan.headers);
    sink.write_all(&head_bytes).await?;

    let Some(range) = plan.body else {
        sink.flush().await?;
        log.status(plan.status).elapsed(started.elapsed()).log();
        return Ok(true);
    };

    let pacing = PacingConfig {
        chunk_percent: app.settings.pacing_chunk_percent,
        attempt_cap: app.settings.pacing_attempt_cap,
    };
    let guard = StreamGuard::begin(app.pending_streams.clone());
    let consumer = StreamConsumer::new(entry, range, pacing, guard.start_delay());
    match consumer.stream_to(sink).await {
        Ok(delivered) => {
            drop(guard);
            sink.flush().await?;
            log.status(plan.status)
                .bytes_out(delivered)
                .elapsed(started.elapsed())
                .log();
            Ok(true)
        }
        Err(StreamError::Sink(err)) => Err(err.into()),
        Err(StreamError::Entry(err)) => {
            // Headers already promised a full body; the truncated stream is
            // the only error signal left.
            drop(guard);
            log.status(plan.status)
                .error_reason(err.to_string())
                .elapsed(started.elapsed())
                .log();
            Ok(false)
        }
    }
}

/// Cache-disabled path: stat and pipe the file straight from disk, one
/// request at a time, honoring the same header semantics.
async fn serve_direct<W>(
    head: &RequestHead,
    sink: &mut W,
    app: &AppContext,
    asset_path: &Path,
    log: AccessLogBuilder,
    started: Instant,
) -> Result<bool>
where
    W: AsyncWrite + Unpin,
{
    let log = log.cache_lookup("off");

    let meta = match stat_direct(asset_path).await {
        Ok(meta) => meta,
        Err(err) => {
            let status = write_error_response(sink, head, err.status()).await?;
            log.status(status)
                .error_reason(err.to_string())
                .elapsed(started.elapsed())
                .log();
            return Ok(true);
        }
    };

    let plan = match plan_response(head, app, asset_path, meta) {
        Ok(plan) => plan,
        Err(err) => {
            let status = write_error_response(sink, head, err.status()).await?;
            log.status(status)
                .error_reason(err.to_string())
                .elapsed(started.elapsed())
                .log();
            return Ok(true);
        }
    };

    let head_bytes = codec::encode_response_head(head.version, plan.status, &plan.headers);
    sink.write_all(&head_bytes).await?;

    let Some(range) = plan.body else {
        sink.flush().await?;
        log.status(plan.status).elapsed(started.elapsed()).log();
        return Ok(true);
    };

    let mut file = match async_fs::File::open(asset_path).await {
        Ok(file) => file,
        Err(err) => {
            debug!(path = %asset_path.display(), error = %err, "direct open failed after stat");
            return Ok(false);
        }
    };
    if range.start > 0 {
        if let Err(err) = file.seek(SeekFrom::Start(range.start)).await {
            debug!(path = %asset_path.display(), error = %err, "direct seek failed");
            return Ok(false);
        }
    }
    let mut limited = file.take(range.len());
    let delivered = tokio::io::copy(&mut limited, sink).await?;
    sink.flush().await?;
    if delivered < range.len() {
        trace!(path = %asset_path.display(), delivered, "file shrank mid-response");
        return Ok(false);
    }

    log.status(plan.status)
        .bytes_out(delivered)
        .elapsed(started.elapsed())
        .log();
    Ok(true)
}

/// Everything needed to emit a success response head, plus the body range
/// (`None` for 304, HEAD, and zero-length files).
struct ResponsePlan {
    status: StatusCode,
    headers: Vec<(&'static str, String)>,
    body: Option<ByteRange>,
}

/// Applies the conditional and range semantics shared by both serving
/// paths: 304 before range handling, `Range` honored only on HTTP/1.1.
fn plan_response(
    head: &RequestHead,
    app: &AppContext,
    asset_path: &Path,
    meta: FileMeta,
) -> Result<ResponsePlan, ServeError> {
    let date = fmt_http_date(SystemTime::now());
    let last_modified = fmt_http_date(meta.mtime);

    if let Some(since) = head.header("if-modified-since")
        && not_modified_since(meta.mtime, since)
    {
        return Ok(ResponsePlan {
            status: StatusCode::NOT_MODIFIED,
            headers: vec![("Date", date), ("Last-Modified", last_modified)],
            body: None,
        });
    }

    let range_header = match head.version {
        Version::HTTP_11 => head.header("range"),
        _ => None,
    };

    let (status, range) = match range_header {
        Some(value) => (
            StatusCode::PARTIAL_CONTENT,
            Some(ByteRange::resolve(value, meta.size)?),
        ),
        None if meta.size == 0 => (StatusCode::OK, None),
        None => (StatusCode::OK, Some(ByteRange::full(meta.size))),
    };

    let content_length = range.map(|r| r.len()).unwrap_or(0);
    let mut headers = vec![
        ("Date", date),
        ("Last-Modified", last_modified),
        (
            "Content-Type",
            app.content_types.lookup(asset_path).to_string(),
        ),
        ("Content-Length", content_length.to_string()),
        ("Accept-Ranges", "bytes".to_string()),
    ];
    if status == StatusCode::PARTIAL_CONTENT {
        let range = range.unwrap_or(ByteRange { start: 0, end: 0 });
        headers.push((
            "Content-Range",
            format!("bytes {}-{}/{}", range.start, range.end, meta.size),
        ));
    }

    let body = if head.method == Method::HEAD {
        None
    } else {
        range
    };

    Ok(ResponsePlan {
        status,
        headers,
        body,
    })
}

/// `If-Modified-Since` comparison at whole-second resolution, the
/// granularity the HTTP date format can carry.
fn not_modified_since(mtime: SystemTime, header: &str) -> bool {
    let Ok(since) = parse_http_date(header) else {
        return false;
    };
    let mtime_secs = mtime
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let since_secs = since
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    mtime_secs <= since_secs
}

/// Writes a complete error response (`<code> - <reason phrase>` body, plain
/// text), suppressing the body on HEAD. Returns the status actually sent.
async fn write_error_response<W>(
    sink: &mut W,
    head: &RequestHead,
    status: StatusCode,
) -> Result<StatusCode>
where
    W: AsyncWrite + Unpin,
{
    let status = codec::effective_status(head.version, status);
    let reason = status.canonical_reason().unwrap_or("Unknown");
    let body = format!("{} - {}", status.as_u16(), reason);

    let mut headers = vec![
        ("Date", fmt_http_date(SystemTime::now())),
        ("Content-Type", "text/plain".to_string()),
        ("Content-Length", body.len().to_string()),
    ];
    if status == StatusCode::METHOD_NOT_ALLOWED {
        headers.push(("Allow", "GET, HEAD".to_string()));
    }

    let head_bytes = codec::encode_response_head(head.version, status, &headers);
    sink.write_all(&head_bytes).await?;
    if head.method != Method::HEAD {
        sink.write_all(body.as_bytes()).await?;
    }
    sink.flush().await?;
    Ok(status)
}

async fn stat_direct(path: &Path) -> Result<FileMeta, ServeError> {
    let stat = async_fs::metadata(path)
        .await
        .map_err(|_| ServeError::NotFound)?;
    if stat.is_dir() {
        return Err(ServeError::IsDirectory);
    }
    if !stat.is_file() {
        return Err(ServeError::NotAFile);
    }
    Ok(FileMeta {
        size: stat.len(),
        mtime: stat.modified().unwrap_or(UNIX_EPOCH),
    })
}

/// Accounting scope for one streaming body: bumps the pending-stream count
/// on entry, and derives the start delay new consumers pay while the server
/// is busy. The count and gauge drop with the guard on every exit path.
struct StreamGuard {
    pending: Arc<AtomicUsize>,
    delay: Duration,
}

impl StreamGuard {
    fn begin(pending: Arc<AtomicUsize>) -> Self {
        let already_pending = pending.fetch_add(1, Ordering::SeqCst) as u64;
        crate::metrics::inc_active_streams();
        let delay = Duration::from_millis((already_pending / 10).min(10));
        Self { pending, delay }
    }

    fn start_delay(&self) -> Duration {
        self.delay
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
        crate::metrics::dec_active_streams();
    }
}
