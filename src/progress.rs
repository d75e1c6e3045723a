//! Caller-facing progress subscription (spec §6.4).

use std::path::PathBuf;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::format::ArtifactFormat;
use crate::state::DownloadStatus;

/// One progress update. Sent on every chunk completion, every retry, and
/// every status transition — never synthesized for anything the engine
/// didn't actually observe (§9 Open Questions: "the engine MUST report true
/// bytes on disk").
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub source_uri: String,
    pub dest_path: PathBuf,
    /// `None` in single-stream mode; `Some(index)` for the chunk that just
    /// produced this update in chunked mode.
    pub chunk_index: Option<u32>,
    pub bytes_done: u64,
    pub total_size: u64,
    /// Instantaneous transfer rate in bytes/second, smoothed over the last update.
    pub bytes_per_second: f64,
    pub retries: u32,
    pub last_error: Option<String>,
    pub status: DownloadStatus,
    /// Best-effort artifact tag (§4.9 supplement). `None` whenever detection
    /// hasn't run yet or recognized nothing; never blocks or delays the event.
    pub format: Option<ArtifactFormat>,
}

/// The writable half of a progress subscription, held by engine internals.
#[derive(Clone)]
pub struct ProgressSender {
    tx: mpsc::UnboundedSender<ProgressEvent>,
    last_emit: std::sync::Arc<std::sync::Mutex<(Instant, u64)>>,
}

/// The readable half returned to callers from `Engine::subscribe`.
pub type ProgressReceiver = mpsc::UnboundedReceiver<ProgressEvent>;

impl ProgressSender {
    pub fn new() -> (Self, ProgressReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sender = Self {
            tx,
            last_emit: std::sync::Arc::new(std::sync::Mutex::new((Instant::now(), 0))),
        };
        (sender, rx)
    }

    /// Compute `bytes_per_second` from wall-clock delta since the last emit
    /// and send the event. A send error means every receiver has been
    /// dropped; that's not a failure the producer should propagate.
    pub fn emit(
        &self,
        source_uri: &str,
        dest_path: &std::path::Path,
        chunk_index: Option<u32>,
        bytes_done: u64,
        total_size: u64,
        retries: u32,
        last_error: Option<String>,
        status: DownloadStatus,
        format: Option<ArtifactFormat>,
    ) {
        let bytes_per_second = {
            let mut guard = self.last_emit.lock().unwrap();
            let (prev_instant, prev_bytes) = *guard;
            let elapsed = prev_instant.elapsed().as_secs_f64();
            let rate = if elapsed > 0.0 && bytes_done >= prev_bytes {
                (bytes_done - prev_bytes) as f64 / elapsed
            } else {
                0.0
            };
            *guard = (Instant::now(), bytes_done);
            rate
        };

        let _ = self.tx.send(ProgressEvent {
            source_uri: source_uri.to_string(),
            dest_path: dest_path.to_path_buf(),
            chunk_index,
            bytes_done,
            total_size,
            bytes_per_second,
            retries,
            last_error,
            status,
            format,
        });
    }
}
