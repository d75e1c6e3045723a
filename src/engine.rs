//! Drives resolve → probe → plan → transfer → (repair) → finalize and
//! persists every state transition (spec §4.10).

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use reqwest::Client;
use tokio::sync::{Mutex, Semaphore};
use tracing::{error, info, warn};

use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::format;
use crate::path::PathBufExt;
use crate::plan::{self, PlannedTransfer};
use crate::probe;
use crate::progress::{ProgressReceiver, ProgressSender};
use crate::repair;
use crate::resolver::{self, Resolved};
use crate::resolver::cache::ResolverCache;
use crate::stage::{self, FinalizeOutcome};
use crate::state::{ChunkStatus, DownloadRow, DownloadStatus, Key, StateStore};
use crate::workers::{self, WorkerContext};

/// A download's identity, returned by [`Engine::start`] and accepted by
/// [`Engine::cancel`]. Aliased rather than newtyped since `(source_uri,
/// dest_path)` is already exactly [`Key`]'s shape.
pub type Handle = Key;

/// Explicitly injected collaborators (§9 "no process-wide singletons"; the
/// one sanctioned exception is `tracing`'s process-global subscriber).
pub struct EngineConfig {
    pub config: Config,
    pub store: Arc<dyn StateStore>,
    pub http: Client,
}

/// The download engine. One instance owns every Download/Chunk row and
/// staging file for the keys it is actively running (I4).
pub struct Engine {
    config: Config,
    store: Arc<dyn StateStore>,
    http: Client,
    worker_ctx: Arc<WorkerContext>,
    resolver_cache: Arc<ResolverCache>,
    global_files: Arc<Semaphore>,
    active: Arc<DashMap<Key, CancelToken>>,
    progress_tx: ProgressSender,
    progress_rx: Mutex<Option<ProgressReceiver>>,
}

impl Engine {
    pub fn new(cfg: EngineConfig) -> Self {
        let resolver_cache = ResolverCache::open(cfg.config.data_root.clone().joined("resolver-cache.json"), cfg.config.resolver.cache_ttl_hours);
        let worker_ctx = WorkerContext::new(cfg.http.clone(), &cfg.config.network, &cfg.config.concurrency);
        let (progress_tx, progress_rx) = ProgressSender::new();

        Self {
            global_files: Arc::new(Semaphore::new(cfg.config.concurrency.global_files.max(1))),
            worker_ctx: Arc::new(worker_ctx),
            resolver_cache: Arc::new(resolver_cache),
            active: Arc::new(DashMap::new()),
            progress_tx,
            progress_rx: Mutex::new(Some(progress_rx)),
            config: cfg.config,
            store: cfg.store,
            http: cfg.http,
        }
    }

    /// Take the progress receiver. Returns `None` on a second call — there
    /// is exactly one subscription per engine instance (§6.4).
    pub async fn subscribe(&self) -> Option<ProgressReceiver> {
        self.progress_rx.lock().await.take()
    }

    /// Enqueue and begin a download, returning its handle once the URI has
    /// been resolved far enough to know its destination path. The transfer
    /// itself continues on a spawned task; progress and completion are
    /// observed through [`Engine::subscribe`] and [`Engine::query`].
    pub async fn start(&self, uri: &str, dest: Option<PathBuf>, expected_sha256: Option<String>) -> Result<Handle> {
        let normalized = resolver::normalize(uri);
        let probe_resolved = resolver::resolve(&normalized, &self.config, &self.http, &self.resolver_cache).await?;
        let dest_path = derive_dest_path(&self.config, &normalized, &probe_resolved, dest);
        let key = Key::new(normalized, dest_path);

        // Reserve the slot in `active` before touching the store, so two
        // concurrent `start()` calls on the same key can't both observe an
        // empty map across the `await` points below (I4).
        let Some(cancel) = self.reserve(&key) else {
            return Ok(key); // already running; I4 process-local lock.
        };

        let row = match self.store.get(&key) {
            Ok(row) => row,
            Err(e) => {
                self.active.remove(&key);
                return Err(e);
            }
        };
        let mut row = row.unwrap_or_else(|| DownloadRow::new(key.clone()));
        if row.status.is_terminal() && row.status != DownloadStatus::Error {
            self.active.remove(&key);
            return Ok(key); // P4: re-starting a complete/verify_failed download is a no-op.
        }
        if let Some(expected) = &expected_sha256 {
            row.expected_sha256 = Some(expected.clone());
        }
        row.status = DownloadStatus::Pending;
        row.updated_at = Utc::now();
        if let Err(e) = self.store.upsert_download(&row) {
            self.active.remove(&key);
            return Err(e);
        }

        self.spawn_run(key.clone(), cancel, expected_sha256.or(row.expected_sha256));
        Ok(key)
    }

    /// Cooperative cancellation: the token is observed at the worker's next
    /// await boundary, partial chunk state is persisted, permits released.
    pub fn cancel(&self, handle: &Handle) {
        if let Some(entry) = self.active.get(handle) {
            entry.cancel();
        }
    }

    pub fn query(&self, handle: &Handle) -> Result<Option<DownloadRow>> {
        self.store.get(handle)
    }

    /// Restart every `running`/`hold` row left over from a prior crash
    /// (§4.10). Idempotent: rows already moved on by the time this runs are
    /// simply skipped by `spawn_run`'s own terminal check.
    pub async fn recover_on_start(&self) -> Result<()> {
        if !self.config.auto_recover_on_start {
            return Ok(());
        }
        for row in self.store.recover_running_on_start()? {
            info!(source_uri = %row.source_uri, dest = %row.dest_path.display(), status = row.status.as_str(), "recovering download");
            let key = row.key();
            let Some(cancel) = self.reserve(&key) else { continue };
            let expected = row.expected_sha256.clone();
            self.spawn_run(key, cancel, expected);
        }
        Ok(())
    }

    /// Atomically reserve `key` in the process-local `active` registry,
    /// returning its fresh cancel token, or `None` if another call already
    /// holds it (I4: at most one mutator per key).
    fn reserve(&self, key: &Key) -> Option<CancelToken> {
        use dashmap::mapref::entry::Entry;
        let cancel = CancelToken::new();
        match self.active.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(cancel.clone());
                Some(cancel)
            }
        }
    }

    fn spawn_run(&self, key: Key, cancel: CancelToken, expected_sha256: Option<String>) {
        let config = self.config.clone();
        let store = self.store.clone();
        let http = self.http.clone();
        let worker_ctx = self.worker_ctx.clone();
        let resolver_cache = self.resolver_cache.clone();
        let progress = self.progress_tx.clone();
        let global_files = self.global_files.clone();
        let active = self.active.clone();

        tokio::spawn(async move {
            let _permit = match global_files.acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };
            let result = run(config, store, http, worker_ctx, resolver_cache, progress, cancel, key.clone(), expected_sha256).await;
            if let Err(e) = result {
                warn!(source_uri = %key.source_uri, dest = %key.dest_path.display(), error = %e, "download did not complete");
            }
            active.remove(&key);
        });
    }
}

fn derive_dest_path(config: &Config, uri: &str, resolved: &Resolved, dest: Option<PathBuf>) -> PathBuf {
    if let Some(d) = dest {
        return d;
    }
    let name = resolved
        .suggested_filename
        .clone()
        .or_else(|| resolved.file_name.clone())
        .unwrap_or_else(|| uri.rsplit('/').next().filter(|s| !s.is_empty()).unwrap_or("download.bin").to_string());
    config.download_root.clone().joined(name)
}

#[allow(clippy::too_many_arguments)]
async fn run(
    config: Config,
    store: Arc<dyn StateStore>,
    http: Client,
    worker_ctx: Arc<WorkerContext>,
    resolver_cache: Arc<ResolverCache>,
    progress: ProgressSender,
    cancel: CancelToken,
    key: Key,
    expected_sha256: Option<String>,
) -> Result<()> {
    if let Some(row) = store.get(&key)? {
        if row.status == DownloadStatus::Complete {
            return Ok(()); // P4: idempotent finalize/start.
        }
    }

    set_status(&store, &key, DownloadStatus::Planning, None)?;

    let resolved = match resolver::resolve(&key.source_uri, &config, &http, &resolver_cache).await {
        Ok(r) => r,
        Err(e) => {
            set_terminal_or_hold(&store, &key, &e)?;
            return Err(e);
        }
    };

    let probed = match probe::probe(&http, &resolved, &config.network).await {
        Ok(p) => p,
        Err(e) => {
            set_terminal_or_hold(&store, &key, &e)?;
            return Err(e);
        }
    };

    let total_size = probed.total_size;

    let mut row = store.get(&key)?.unwrap_or_else(|| DownloadRow::new(key.clone()));
    row.resolved_url = Some(resolved.url.clone());
    row.total_size = total_size;
    row.etag = probed.etag.clone();
    row.last_modified = probed.last_modified.clone();
    if row.expected_sha256.is_none() {
        row.expected_sha256 = expected_sha256.clone();
    }
    let expected_sha256 = row.expected_sha256.clone();
    row.status = DownloadStatus::Running;
    row.updated_at = Utc::now();
    store.upsert_download(&row)?;

    let staging = stage::staging_path(&config, &key);

    if config.always_no_resume {
        tokio::fs::remove_file(&staging).await.ok();
        store.delete_chunks(&key)?;
    }

    let staging_size = tokio::fs::metadata(&staging).await.map(|m| m.len()).unwrap_or(0);
    let existing_chunks = if config.always_no_resume { Vec::new() } else { store.list_chunks(&key)? };

    let transfer_plan = plan::plan(&key, total_size, probed.supports_range, &config.concurrency, &existing_chunks, staging_size);

    stage::preallocate(&staging, total_size).await;

    match &transfer_plan {
        PlannedTransfer::Chunked(chunks) => {
            for chunk in chunks {
                store.upsert_chunk(chunk)?;
            }
            let worker_count = config.concurrency.per_file_chunks.min(chunks.len()).max(1);
            if let Err(e) = workers::run_chunked(&worker_ctx, &key, &resolved, &staging, chunks.clone(), store.clone(), &progress, &cancel, total_size, worker_count).await {
                set_terminal_or_hold(&store, &key, &e)?;
                return Err(e);
            }
        }
        PlannedTransfer::SingleStream => {
            if let Err(e) = workers::run_single_stream(&worker_ctx, &key, &resolved, &staging, total_size, &cancel, &progress).await {
                set_terminal_or_hold(&store, &key, &e)?;
                return Err(e);
            }
        }
    }

    finalize_with_repair(
        &config,
        &store,
        &worker_ctx,
        &resolved,
        &key,
        &staging,
        expected_sha256.as_deref(),
        row.expected_md5.as_deref(),
        row.expected_sha1.as_deref(),
        &progress,
        &cancel,
        total_size,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn finalize_with_repair(
    config: &Config,
    store: &Arc<dyn StateStore>,
    worker_ctx: &Arc<WorkerContext>,
    resolved: &Resolved,
    key: &Key,
    staging: &std::path::Path,
    expected_sha256: Option<&str>,
    expected_md5: Option<&str>,
    expected_sha1: Option<&str>,
    progress: &ProgressSender,
    cancel: &CancelToken,
    total_size: u64,
) -> Result<()> {
    let mut already_repaired = false;

    loop {
        let outcome = stage::finalize(
            key,
            staging,
            expected_sha256,
            expected_md5,
            expected_sha1,
            &config.data_root,
            &config.validation,
            &config.general,
            already_repaired,
        )
        .await?;

        match outcome {
            FinalizeOutcome::Complete { actual_sha256 } => {
                let mut row = store.get(key)?.unwrap_or_else(|| DownloadRow::new(key.clone()));
                row.actual_sha256 = Some(actual_sha256);
                row.status = DownloadStatus::Complete;
                row.last_error = None;
                row.updated_at = Utc::now();
                store.upsert_download(&row)?;
                let format = format::sniff(&key.dest_path).await;
                progress.emit(&key.source_uri, &key.dest_path, None, total_size, total_size, row.retries, None, DownloadStatus::Complete, format);
                return Ok(());
            }
            FinalizeOutcome::NeedsRepair { .. } if !already_repaired => {
                let chunks = store.list_chunks(key)?;
                if chunks.is_empty() {
                    already_repaired = true;
                    continue; // single-stream: nothing to target, let the next pass report the fatal mismatch.
                }

                let repaired = repair::diagnose(staging, chunks).await?;
                for chunk in &repaired {
                    store.upsert_chunk(chunk)?;
                }
                let dirty: Vec<_> = repaired.into_iter().filter(|c| c.status == ChunkStatus::Dirty).collect();
                already_repaired = true;

                if dirty.is_empty() {
                    continue; // re-hash agreed with every stored hash; the mismatch must be fatal.
                }

                let worker_count = config.concurrency.per_file_chunks.min(dirty.len()).max(1);
                workers::run_chunked(worker_ctx, key, resolved, staging, dirty, store.clone(), progress, cancel, total_size, worker_count).await?;
            }
            FinalizeOutcome::NeedsRepair { actual_sha256 } => {
                let expected = expected_sha256.unwrap_or_default().to_string();
                set_status(store, key, DownloadStatus::ChecksumMismatch, Some(format!("expected {expected}, got {actual_sha256}")))?;
                return Err(Error::ChecksumMismatch { expected, actual: actual_sha256 });
            }
            FinalizeOutcome::ChecksumMismatch { expected, actual } => {
                set_status(store, key, DownloadStatus::ChecksumMismatch, Some(format!("expected {expected}, got {actual}")))?;
                return Err(Error::ChecksumMismatch { expected, actual });
            }
            FinalizeOutcome::VerifyFailed(msg) => {
                set_status(store, key, DownloadStatus::VerifyFailed, Some(msg.clone()))?;
                return Err(Error::VerifyFailed(msg));
            }
        }
    }
}

fn set_status(store: &Arc<dyn StateStore>, key: &Key, status: DownloadStatus, last_error: Option<String>) -> Result<()> {
    let mut row = store.get(key)?.unwrap_or_else(|| DownloadRow::new(key.clone()));
    row.status = status;
    row.last_error = last_error;
    row.updated_at = Utc::now();
    store.upsert_download(&row)
}

/// `auth_error`/`rate_limited`/`network_unreachable` from preflight or a
/// worker move the row to `hold` with an actionable reason (§7 propagation
/// policy); everything else is terminal `error`.
fn set_terminal_or_hold(store: &Arc<dyn StateStore>, key: &Key, e: &Error) -> Result<()> {
    let (status, message) = match e {
        Error::Auth { status } => {
            (DownloadStatus::Hold, format!("authentication failed (status {status}); set the source's token environment variable and accept any required license"))
        }
        Error::RateLimited { .. } => (DownloadStatus::Hold, "rate limited; will retry on next recovery pass".to_string()),
        Error::NetworkUnreachable(_) => (DownloadStatus::Hold, format!("preflight unreachable: {e}")),
        _ => {
            error!(error = %e, source_uri = %key.source_uri, "download failed");
            (DownloadStatus::Error, e.to_string())
        }
    };
    set_status(store, key, status, Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::memory::MemoryStateStore;

    fn test_config(root: &std::path::Path) -> Config {
        let mut cfg = Config::default();
        cfg.data_root = root.to_path_buf();
        cfg.download_root = root.to_path_buf();
        cfg.partials_root = Some(root.join(".parts"));
        cfg.network.disable_auth_preflight = true;
        cfg
    }

    #[tokio::test]
    async fn direct_http_download_completes_and_publishes() {
        let mut server = mockito::Server::new_async().await;
        let body = b"hello world, this is a small test artifact";
        let _mock = server.mock("GET", "/file.bin").with_status(200).with_body(body).create_async().await;

        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        cfg.network.disable_auth_preflight = true;
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let http = crate::http::build_client(&cfg.network).unwrap();

        let engine = Engine::new(EngineConfig { config: cfg, store: store.clone(), http });
        let mut rx = engine.subscribe().await.unwrap();

        let dest = dir.path().join("out.bin");
        let url = format!("{}/file.bin", server.url());
        let handle = engine.start(&url, Some(dest.clone()), None).await.unwrap();

        let mut saw_complete = false;
        while let Some(event) = rx.recv().await {
            if event.status == DownloadStatus::Complete {
                saw_complete = true;
                break;
            }
            if event.status == DownloadStatus::Error {
                panic!("download errored: {:?}", event.last_error);
            }
        }

        assert!(saw_complete);
        let row = store.get(&handle).unwrap().unwrap();
        assert_eq!(row.status, DownloadStatus::Complete);
        assert!(dest.exists());
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), body);
    }

    #[tokio::test]
    async fn starting_an_already_complete_download_is_a_noop() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = test_config(dir.path());
        let store: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let http = crate::http::build_client(&cfg.network).unwrap();

        let dest = dir.path().join("out.bin");
        let key = Key::new("https://example.com/out.bin", dest.clone());
        let mut row = DownloadRow::new(key.clone());
        row.status = DownloadStatus::Complete;
        store.upsert_download(&row).unwrap();

        let engine = Engine::new(EngineConfig { config: cfg, store: store.clone(), http });
        let handle = engine.start("https://example.com/out.bin", Some(dest), None).await.unwrap();
        assert_eq!(handle, key);

        let row = store.get(&handle).unwrap().unwrap();
        assert_eq!(row.status, DownloadStatus::Complete);
    }
}
