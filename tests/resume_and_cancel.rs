//! Crash-resume and cancellation-safety properties, exercised against the
//! engine's public surface rather than any one module in isolation.

use std::sync::Arc;
use std::time::Duration;

use haul::config::Config;
use haul::state::sqlite::SqliteStateStore;
use haul::state::{ChunkRow, ChunkStatus, DownloadRow, DownloadStatus, Key, StateStore};
use haul::{Engine, EngineConfig};

const MIB: u64 = 1024 * 1024;

fn test_config(root: &std::path::Path) -> Config {
    let mut cfg = Config::default();
    cfg.data_root = root.to_path_buf();
    cfg.download_root = root.to_path_buf();
    cfg.partials_root = Some(root.join(".parts"));
    cfg
}

fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

async fn poll_until_terminal(engine: &Engine, handle: &Key) -> DownloadRow {
    for _ in 0..200 {
        if let Some(row) = engine.query(handle).unwrap() {
            if row.status.is_terminal() {
                return row;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("download never reached a terminal status");
}

/// P2: a download already holding one `complete` chunk on disk, recovered
/// through a second `Engine` backed by the same on-disk SQLite database
/// (simulating a process restart), fetches only the remaining chunk — never
/// re-requesting the range already marked complete. Deregistering the first
/// chunk's range from the mock server means any accidental re-fetch panics
/// with an unmatched-mock error rather than silently passing.
#[tokio::test]
async fn p2_resume_after_restart_does_not_retransmit_completed_chunks() {
    let good: Vec<u8> = (0..2 * MIB as usize).map(|i| (i % 233) as u8).collect();
    let good_sha256 = sha256_hex(&good);
    let first_half_sha256 = sha256_hex(&good[0..MIB as usize]);

    let mut server = mockito::Server::new_async().await;
    let _head = server
        .mock("HEAD", "/durable.bin")
        .with_status(200)
        .with_header("accept-ranges", "bytes")
        .with_header("content-length", &good.len().to_string())
        .create_async()
        .await;
    // Only the second half's range is ever mocked; a request for the first
    // half's range would panic at drop time with "not all mocks were called"
    // inverted into "unexpected request", surfacing an accidental re-fetch.
    let _second_half = server
        .mock("GET", "/durable.bin")
        .match_header("range", "bytes=1048576-2097151")
        .with_status(206)
        .with_body(&good[MIB as usize..])
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.concurrency.chunk_size_mb = 1;
    cfg.concurrency.per_file_chunks = 2;

    let db_path = dir.path().join("state.db");
    let dest = dir.path().join("durable.bin");
    let url = format!("{}/durable.bin", server.url());
    let key = Key::new(url.clone(), dest.clone());

    // Simulate the first process: chunk 0 finished and was fsynced to the
    // staging file before a crash; chunk 1 never started.
    {
        let store = SqliteStateStore::open(&db_path).unwrap();
        let staging = haul::stage::staging_path(&cfg, &key);
        tokio::fs::create_dir_all(staging.parent().unwrap()).await.unwrap();
        let mut partial = vec![0u8; good.len()];
        partial[0..MIB as usize].copy_from_slice(&good[0..MIB as usize]);
        tokio::fs::write(&staging, &partial).await.unwrap();

        let mut row = DownloadRow::new(key.clone());
        row.status = DownloadStatus::Running;
        row.total_size = good.len() as u64;
        row.expected_sha256 = Some(good_sha256.clone());
        store.upsert_download(&row).unwrap();
        store
            .upsert_chunk(&ChunkRow {
                source_uri: key.source_uri.clone(),
                dest_path: key.dest_path.clone(),
                index: 0,
                offset: 0,
                size: MIB,
                status: ChunkStatus::Complete,
                attempts: 1,
                last_error: None,
                sha256: Some(first_half_sha256),
            })
            .unwrap();
        store
            .upsert_chunk(&ChunkRow {
                source_uri: key.source_uri.clone(),
                dest_path: key.dest_path.clone(),
                index: 1,
                offset: MIB,
                size: MIB,
                status: ChunkStatus::Pending,
                attempts: 0,
                last_error: None,
                sha256: None,
            })
            .unwrap();
    }

    // Second process: a fresh Engine over the same database recovers the
    // `running` row and only has to fetch the missing second half.
    let store: Arc<dyn StateStore> = Arc::new(SqliteStateStore::open(&db_path).unwrap());
    let http = haul::http::build_client(&cfg.network).unwrap();
    let engine = Engine::new(EngineConfig { config: cfg, store: store.clone(), http });

    engine.recover_on_start().await.unwrap();
    let row = poll_until_terminal(&engine, &key).await;

    assert_eq!(row.status, DownloadStatus::Complete, "last_error: {:?}", row.last_error);
    assert_eq!(row.actual_sha256.as_deref(), Some(good_sha256.as_str()));
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), good);
}

/// P5: cancelling immediately after `start()` stops the transfer before any
/// bytes move (cooperative cancellation is checked before the first network
/// call), leaves the row in a retryable, non-corrupted state, and a later
/// `start()` on the same handle completes normally.
#[tokio::test(flavor = "current_thread")]
async fn p5_cancel_before_transfer_starts_is_safe_and_retryable() {
    let body = b"retried after a cancellation".to_vec();
    let mut server = mockito::Server::new_async().await;
    // Registered up front: the canceled attempt never reaches the network,
    // so this same mock is still unconsumed for the later successful retry.
    let _mock = server.mock("GET", "/canceled.bin").with_status(200).with_body(body.clone()).create_async().await;

    let dir = tempfile::tempdir().unwrap();
    let mut cfg = test_config(dir.path());
    cfg.network.disable_auth_preflight = true; // total_size stays 0 -> single-stream, no probe request
    let store: Arc<dyn StateStore> = Arc::new(haul::state::memory::MemoryStateStore::new());
    let http = haul::http::build_client(&cfg.network).unwrap();

    let engine = Engine::new(EngineConfig { config: cfg, store: store.clone(), http });

    let dest = dir.path().join("canceled.bin");
    let url = format!("{}/canceled.bin", server.url());
    let handle = engine.start(&url, Some(dest.clone()), None).await.unwrap();
    // `start()` is the only other place this task yields before this call, so
    // on the current-thread runtime the spawned transfer task has not yet run
    // a single poll by the time `cancel` executes.
    engine.cancel(&handle);

    let row = poll_until_terminal(&engine, &handle).await;
    assert_eq!(row.status, DownloadStatus::Error);
    assert!(!dest.exists());

    // Retrying the same handle after a cancellation-turned-error is not a
    // no-op (Error is explicitly excluded from the terminal no-op check) and
    // completes normally once the transfer actually runs.
    engine.start(&url, Some(dest.clone()), None).await.unwrap();
    let row = poll_until_terminal(&engine, &handle).await;
    assert_eq!(row.status, DownloadStatus::Complete, "last_error: {:?}", row.last_error);
    assert_eq!(tokio::fs::read(&dest).await.unwrap(), body);
}
