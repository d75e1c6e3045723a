//! Parallel ranged transfer with retries, backoff, per-host concurrency
//! caps, and rate limiting (spec §4.6).

use std::collections::VecDeque;
use std::fs::File;
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use backoff::backoff::Backoff;
use bytes::Bytes;
use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::config::{BackoffConfig, ConcurrencyConfig, NetworkConfig};
use crate::error::{Error, Result};
use crate::fileio;
use crate::progress::ProgressSender;
use crate::resolver::Resolved;
use crate::state::{ChunkRow, ChunkStatus, DownloadRow, DownloadStatus, Key, StateStore};

type ByteLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Collaborators shared by every worker across every download in the engine
/// (spec §5 "HTTP client / connection pool is shared process-wide; per-host
/// semaphores enforce fairness").
pub struct WorkerContext {
    pub http: Client,
    per_host: Arc<DashMap<String, Arc<Semaphore>>>,
    per_host_requests: usize,
    global_limiter: Option<Arc<ByteLimiter>>,
    per_download_bytes_per_second: Option<u32>,
    backoff_cfg: BackoffConfig,
    max_retries: u32,
    retry_on_rate_limit: bool,
    rate_limit_max_delay: Duration,
}

impl WorkerContext {
    pub fn new(http: Client, network: &NetworkConfig, concurrency: &ConcurrencyConfig) -> Self {
        Self {
            http,
            per_host: Arc::new(DashMap::new()),
            per_host_requests: concurrency.per_host_requests,
            global_limiter: build_limiter(concurrency.max_bytes_per_second),
            per_download_bytes_per_second: concurrency.max_bytes_per_second_per_download,
            backoff_cfg: concurrency.backoff.clone(),
            max_retries: concurrency.max_retries,
            retry_on_rate_limit: network.retry_on_rate_limit,
            rate_limit_max_delay: Duration::from_secs(network.rate_limit_max_delay_seconds),
        }
    }
}

fn build_limiter(bytes_per_sec: Option<u32>) -> Option<Arc<ByteLimiter>> {
    let bps = NonZeroU32::new(bytes_per_sec?.max(1))?;
    let quota = Quota::per_second(bps).allow_burst(bps);
    Some(Arc::new(RateLimiter::direct(quota)))
}

async fn throttle(limiter: Option<&ByteLimiter>, n: usize) {
    let Some(limiter) = limiter else { return };
    let Some(n) = NonZeroU32::new(n.min(u32::MAX as usize) as u32) else { return };
    if limiter.until_n_ready(n).await.is_err() {
        // More bytes than the configured burst in one shot; proceed
        // unmetered for this write rather than stalling forever.
    }
}

fn make_backoff(cfg: &BackoffConfig) -> backoff::ExponentialBackoff {
    backoff::ExponentialBackoffBuilder::new()
        .with_initial_interval(Duration::from_millis(cfg.initial_interval_ms))
        .with_multiplier(cfg.multiplier)
        .with_max_interval(Duration::from_millis(cfg.max_interval_ms))
        .with_max_elapsed_time(None)
        .build()
}

fn header_map(resolved: &Resolved) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (name, value) in &resolved.headers {
        let name: reqwest::header::HeaderName =
            name.parse().map_err(|e: reqwest::header::InvalidHeaderName| Error::internal(e, "workers::header_name"))?;
        let value = HeaderValue::from_str(value).map_err(|e| Error::internal(e, "workers::header_value"))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

fn host_of(url: &str) -> String {
    url::Url::parse(url).ok().and_then(|u| u.host_str().map(str::to_string)).unwrap_or_default()
}

/// Run the fixed-size worker pool over `chunks`, mutating each row's status
/// through the state store as it progresses. Pulls from the queue in offset
/// order (§5 determinism); `pending` and `dirty` rows are queued, `complete`
/// rows are skipped but still counted toward reported progress.
pub async fn run_chunked(
    ctx: &WorkerContext,
    key: &Key,
    resolved: &Resolved,
    staging_path: &Path,
    chunks: Vec<ChunkRow>,
    store: Arc<dyn StateStore>,
    progress: &ProgressSender,
    cancel: &CancelToken,
    total_size: u64,
    worker_count: usize,
) -> Result<()> {
    let file = Arc::new(open_for_write(staging_path).await?);
    let download_limiter = build_limiter(ctx.per_download_bytes_per_second);

    let bytes_done = Arc::new(std::sync::atomic::AtomicU64::new(chunks.iter().filter(|c| c.status == ChunkStatus::Complete).map(|c| c.size).sum()));

    let queue: VecDeque<ChunkRow> = chunks.into_iter().filter(|c| c.status != ChunkStatus::Complete).collect();
    let queue = Arc::new(Mutex::new(queue));

    let worker_count = worker_count.max(1);
    let mut join_set = tokio::task::JoinSet::new();

    for _ in 0..worker_count {
        let queue = queue.clone();
        let file = file.clone();
        let bytes_done = bytes_done.clone();
        let cancel = cancel.clone();
        let progress = progress.clone();
        let resolved = resolved.clone();
        let key = key.clone();
        let download_limiter = download_limiter.clone();
        let store = store.clone();

        join_set.spawn(worker_loop(
            WorkerLoopArgs {
                http: ctx.http.clone(),
                per_host: ctx.per_host.clone(),
                per_host_requests: ctx.per_host_requests,
                global_limiter: ctx.global_limiter.clone(),
                download_limiter,
                backoff_cfg: ctx.backoff_cfg.clone(),
                max_retries: ctx.max_retries,
                retry_on_rate_limit: ctx.retry_on_rate_limit,
                rate_limit_max_delay: ctx.rate_limit_max_delay,
            },
            queue,
            file,
            bytes_done,
            total_size,
            cancel,
            progress,
            resolved,
            key,
            store,
        ));
    }

    let mut first_error: Option<WorkerFailure> = None;
    while let Some(result) = join_set.join_next().await {
        match result.map_err(|e| Error::internal(e, "workers::join"))? {
            Ok(()) => {}
            Err(failure) if first_error.is_none() => first_error = Some(failure),
            Err(_) => {}
        }
    }

    let Some(failure) = first_error else { return Ok(()) };
    let mut row = store.get(key)?.unwrap_or_else(|| DownloadRow::new(key.clone()));
    row.status = DownloadStatus::Error;
    row.updated_at = chrono::Utc::now();

    // The failing chunk's terminal row and the download's terminal status
    // commit in one transaction (§4.1): a crash between the two writes must
    // never leave a `running` download paired with an already-failed chunk.
    match failure {
        WorkerFailure::Chunk(e, chunk) => {
            row.last_error = Some(e.to_string());
            store.transaction(&mut |txn| {
                txn.upsert_chunk(&chunk)?;
                txn.upsert_download(&row)
            })?;
            Err(e)
        }
        WorkerFailure::Other(e) => {
            row.last_error = Some(e.to_string());
            store.upsert_download(&row)?;
            Err(e)
        }
    }
}

struct WorkerLoopArgs {
    http: Client,
    per_host: Arc<DashMap<String, Arc<Semaphore>>>,
    per_host_requests: usize,
    global_limiter: Option<Arc<ByteLimiter>>,
    download_limiter: Option<Arc<ByteLimiter>>,
    backoff_cfg: BackoffConfig,
    max_retries: u32,
    retry_on_rate_limit: bool,
    rate_limit_max_delay: Duration,
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    args: WorkerLoopArgs,
    queue: Arc<Mutex<VecDeque<ChunkRow>>>,
    file: Arc<File>,
    bytes_done: Arc<std::sync::atomic::AtomicU64>,
    total_size: u64,
    cancel: CancelToken,
    progress: ProgressSender,
    resolved: Resolved,
    key: Key,
    store: Arc<dyn StateStore>,
) -> std::result::Result<(), WorkerFailure> {
    loop {
        crate::cancel::check(&cancel).map_err(WorkerFailure::Other)?;

        let chunk = {
            let mut guard = queue.lock().unwrap();
            guard.pop_front()
        };
        let Some(mut chunk) = chunk else { return Ok(()) };

        let host = host_of(&resolved.url);
        let permit_sem = args.per_host.entry(host).or_insert_with(|| Arc::new(Semaphore::new(args.per_host_requests.max(1)))).clone();

        transfer_one_chunk(&args, &permit_sem, &resolved, &file, &mut chunk, &cancel, &bytes_done, total_size, &progress, &key, &store).await?;
    }
}

/// A worker's terminal failure: `Chunk` carries the specific row that needs
/// to commit alongside the download's terminal status in one transaction
/// (§4.1); `Other` covers failures with no single chunk to blame, such as a
/// cancellation observed between chunks.
enum WorkerFailure {
    Chunk(Error, ChunkRow),
    Other(Error),
}

impl From<Error> for WorkerFailure {
    fn from(e: Error) -> Self {
        WorkerFailure::Other(e)
    }
}

#[allow(clippy::too_many_arguments)]
async fn transfer_one_chunk(
    args: &WorkerLoopArgs,
    host_permit: &Arc<Semaphore>,
    resolved: &Resolved,
    file: &Arc<File>,
    chunk: &mut ChunkRow,
    cancel: &CancelToken,
    bytes_done: &Arc<std::sync::atomic::AtomicU64>,
    total_size: u64,
    progress: &ProgressSender,
    key: &Key,
    store: &Arc<dyn StateStore>,
) -> std::result::Result<(), WorkerFailure> {
    let mut backoff = make_backoff(&args.backoff_cfg);

    loop {
        crate::cancel::check(cancel)?;
        chunk.attempts += 1;
        chunk.status = ChunkStatus::InFlight;
        store.upsert_chunk(chunk)?;

        let _permit = host_permit.clone().acquire_owned().await.map_err(|e| Error::internal(e, "workers::semaphore"))?;

        let attempt = fetch_chunk_once(args, resolved, file, chunk, cancel, bytes_done, total_size, progress, key).await;
        drop(_permit);

        match attempt {
            Ok(()) => {
                store.upsert_chunk(chunk)?;
                return Ok(());
            }
            // The chunk's terminal row is not written here: it commits
            // transactionally with the download's terminal status once the
            // worker pool as a whole gives up (§4.1).
            Err(e) if chunk.attempts > args.max_retries => {
                chunk.status = ChunkStatus::Pending;
                chunk.last_error = Some(e.to_string());
                warn!(error = %e, chunk = chunk.index, "chunk retries exhausted");
                return Err(WorkerFailure::Chunk(e, chunk.clone()));
            }
            Err(Error::RateLimited { retry_after }) if args.retry_on_rate_limit => {
                let delay = retry_after.unwrap_or_else(|| Duration::from_secs(1)).min(args.rate_limit_max_delay);
                warn!(delay_ms = delay.as_millis() as u64, chunk = chunk.index, "rate limited, sleeping");
                tokio::time::sleep(delay).await;
            }
            Err(e) if e.is_transient() => {
                let delay = backoff.next_backoff().unwrap_or(args.backoff_cfg.max_interval_ms_as_duration());
                warn!(error = %e, delay_ms = delay.as_millis() as u64, chunk = chunk.index, "transient error, retrying");
                chunk.last_error = Some(e.to_string());
                store.upsert_chunk(chunk)?;
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                chunk.status = ChunkStatus::Pending;
                chunk.last_error = Some(e.to_string());
                return Err(WorkerFailure::Chunk(e, chunk.clone()));
            }
        }
    }
}

impl BackoffConfig {
    fn max_interval_ms_as_duration(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }
}

#[allow(clippy::too_many_arguments)]
async fn fetch_chunk_once(
    args: &WorkerLoopArgs,
    resolved: &Resolved,
    file: &Arc<File>,
    chunk: &mut ChunkRow,
    cancel: &CancelToken,
    bytes_done: &Arc<std::sync::atomic::AtomicU64>,
    total_size: u64,
    progress: &ProgressSender,
    key: &Key,
) -> Result<()> {
    let headers = header_map(resolved)?;
    let range = format!("bytes={}-{}", chunk.offset, chunk.offset + chunk.size - 1);

    let response = args
        .http
        .get(&resolved.url)
        .headers(headers)
        .header("Range", range)
        .send()
        .await
        .map_err(|e| Error::new_reqwest(e, "workers::fetch_chunk"))?;

    classify_status(response.status(), response.headers())?;

    let mut stream = response.bytes_stream();
    let mut hasher = Sha256::new();
    let mut written: u64 = 0;
    let mut cursor = chunk.offset;

    use futures_util::StreamExt;
    while let Some(next) = stream.next().await {
        crate::cancel::check(cancel)?;
        let bytes: Bytes = next.map_err(|e| Error::new_reqwest(e, "workers::fetch_chunk::stream"))?;
        if bytes.is_empty() {
            continue;
        }

        throttle(args.global_limiter.as_deref(), bytes.len()).await;
        throttle(args.download_limiter.as_deref(), bytes.len()).await;

        hasher.update(&bytes);
        fileio::write_at(file.clone(), bytes.to_vec(), cursor).await?;

        cursor += bytes.len() as u64;
        written += bytes.len() as u64;
        let done = bytes_done.fetch_add(bytes.len() as u64, std::sync::atomic::Ordering::SeqCst) + bytes.len() as u64;
        progress.emit(&key.source_uri, &key.dest_path, Some(chunk.index), done, total_size, chunk.attempts, None, DownloadStatus::Running, None);
    }

    if written != chunk.size {
        return Err(Error::internal(
            std::io::Error::new(std::io::ErrorKind::UnexpectedEof, format!("expected {} bytes, got {written}", chunk.size)),
            "workers::short_chunk",
        ));
    }

    file.sync_all().map_err(Error::new_io)?;

    chunk.sha256 = Some(hex::encode(hasher.finalize()));
    chunk.status = ChunkStatus::Complete;
    chunk.last_error = None;
    info!(chunk = chunk.index, bytes = written, "chunk complete");

    Ok(())
}

fn classify_status(status: StatusCode, headers: &HeaderMap) -> Result<()> {
    match status {
        StatusCode::OK | StatusCode::PARTIAL_CONTENT => Ok(()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::Auth { status: status.as_u16() }),
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after = headers.get("retry-after").and_then(|v| v.to_str().ok()).and_then(crate::probe::parse_retry_after);
            Err(Error::RateLimited { retry_after })
        }
        StatusCode::RANGE_NOT_SATISFIABLE => Err(Error::RangeOutOfBounds),
        s if s.is_server_error() => Err(Error::NetworkUnreachable(Box::new(std::io::Error::other(format!("server error {s}"))))),
        s => Err(Error::internal(std::io::Error::other(format!("unexpected status {s}")), "workers::classify_status")),
    }
}

async fn open_for_write(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(Error::new_io)?;
    }
    let std_path = path.to_path_buf();
    tokio::task::spawn_blocking(move || std::fs::OpenOptions::new().create(true).write(true).read(true).open(std_path))
        .await
        .map_err(|e| Error::internal(e, "workers::open_for_write::join"))?
        .map_err(Error::new_io)
}

/// Single-stream transfer for `supports_range=false` or unknown total size
/// (§4.5.1). Writes sequentially from the current staging size, treating a
/// `416` as completion when the staging file already matches `total_size`.
pub async fn run_single_stream(
    ctx: &WorkerContext,
    key: &Key,
    resolved: &Resolved,
    staging_path: &Path,
    total_size: u64,
    cancel: &CancelToken,
    progress: &ProgressSender,
) -> Result<()> {
    let mut backoff = make_backoff(&ctx.backoff_cfg);
    let mut attempts = 0u32;

    loop {
        crate::cancel::check(cancel)?;
        let staging_size = tokio::fs::metadata(staging_path).await.map(|m| m.len()).unwrap_or(0);

        if total_size > 0 && staging_size >= total_size {
            return Ok(());
        }

        attempts += 1;
        match attempt_single_stream(ctx, key, resolved, staging_path, staging_size, total_size, cancel, progress).await {
            Ok(()) => return Ok(()),
            Err(Error::RangeOutOfBounds) => {
                if total_size > 0 && staging_size == total_size {
                    return Ok(());
                }
                warn!("server rejected resume range, restarting single-stream transfer from zero");
                tokio::fs::remove_file(staging_path).await.ok();
                continue;
            }
            Err(e) if attempts > ctx.max_retries => return Err(e),
            Err(Error::RateLimited { retry_after }) if ctx.retry_on_rate_limit => {
                let delay = retry_after.unwrap_or_else(|| Duration::from_secs(1)).min(ctx.rate_limit_max_delay);
                tokio::time::sleep(delay).await;
            }
            Err(e) if e.is_transient() => {
                let delay = backoff.next_backoff().unwrap_or(ctx.backoff_cfg.max_interval_ms_as_duration());
                warn!(error = %e, "single-stream transient error, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn attempt_single_stream(
    ctx: &WorkerContext,
    key: &Key,
    resolved: &Resolved,
    staging_path: &Path,
    staging_size: u64,
    total_size: u64,
    cancel: &CancelToken,
    progress: &ProgressSender,
) -> Result<()> {
    let mut headers = header_map(resolved)?;
    if staging_size > 0 {
        headers.insert("Range", HeaderValue::from_str(&format!("bytes={staging_size}-")).unwrap());
    }

    let response = ctx.http.get(&resolved.url).headers(headers).send().await.map_err(|e| Error::new_reqwest(e, "workers::single_stream"))?;

    if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
        return Err(Error::RangeOutOfBounds);
    }
    classify_status(response.status(), response.headers())?;

    let file = Arc::new(open_for_write(staging_path).await?);
    let mut stream = response.bytes_stream();
    let mut cursor = staging_size;

    use futures_util::StreamExt;
    while let Some(next) = stream.next().await {
        crate::cancel::check(cancel)?;
        let bytes: Bytes = next.map_err(|e| Error::new_reqwest(e, "workers::single_stream::stream"))?;
        if bytes.is_empty() {
            continue;
        }
        throttle(ctx.global_limiter.as_deref(), bytes.len()).await;
        fileio::write_at(file.clone(), bytes.to_vec(), cursor).await?;
        cursor += bytes.len() as u64;
        progress.emit(&key.source_uri, &key.dest_path, None, cursor, total_size, 0, None, DownloadStatus::Running, None);
    }

    file.sync_all().map_err(Error::new_io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_status_maps_known_codes() {
        let empty = HeaderMap::new();
        assert!(classify_status(StatusCode::OK, &empty).is_ok());
        assert!(classify_status(StatusCode::PARTIAL_CONTENT, &empty).is_ok());
        assert!(matches!(classify_status(StatusCode::UNAUTHORIZED, &empty), Err(Error::Auth { status: 401 })));
        assert!(matches!(classify_status(StatusCode::RANGE_NOT_SATISFIABLE, &empty), Err(Error::RangeOutOfBounds)));
    }

    #[test]
    fn classify_status_parses_retry_after_on_429() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", HeaderValue::from_static("2"));
        match classify_status(StatusCode::TOO_MANY_REQUESTS, &headers) {
            Err(Error::RateLimited { retry_after }) => assert_eq!(retry_after, Some(Duration::from_secs(2))),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn host_of_extracts_host() {
        assert_eq!(host_of("https://example.com/a/b"), "example.com");
        assert_eq!(host_of("not a url"), "");
    }
}
