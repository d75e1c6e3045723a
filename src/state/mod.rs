//! Durable, transactional record of downloads and per-chunk status (spec §4.1).

pub mod memory;
pub mod sqlite;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::Result;

/// Identifies a download and its chunks: `(source_uri, dest_path)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    pub source_uri: String,
    pub dest_path: PathBuf,
}

impl Key {
    pub fn new(source_uri: impl Into<String>, dest_path: impl Into<PathBuf>) -> Self {
        Self { source_uri: source_uri.into(), dest_path: dest_path.into() }
    }
}

/// Status of a [`DownloadRow`] (spec §3). `Complete`, `Error` and
/// `VerifyFailed` are terminal: the row is frozen until an explicit retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Pending,
    Planning,
    Running,
    Hold,
    Complete,
    Error,
    ChecksumMismatch,
    VerifyFailed,
}

impl DownloadStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::VerifyFailed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Planning => "planning",
            Self::Running => "running",
            Self::Hold => "hold",
            Self::Complete => "complete",
            Self::Error => "error",
            Self::ChecksumMismatch => "checksum_mismatch",
            Self::VerifyFailed => "verify_failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "planning" => Self::Planning,
            "running" => Self::Running,
            "hold" => Self::Hold,
            "complete" => Self::Complete,
            "error" => Self::Error,
            "checksum_mismatch" => Self::ChecksumMismatch,
            "verify_failed" => Self::VerifyFailed,
            _ => return None,
        })
    }
}

/// A download row (spec §3 Entities / Download).
#[derive(Debug, Clone)]
pub struct DownloadRow {
    pub source_uri: String,
    pub dest_path: PathBuf,
    pub resolved_url: Option<String>,
    pub total_size: u64,
    pub expected_sha256: Option<String>,
    pub actual_sha256: Option<String>,
    /// Legacy digests, consulted only when no `expected_sha256` is set and
    /// `validation.accept_md5_sha1_if_provided` is on (spec §4.2 supplement).
    pub expected_md5: Option<String>,
    pub expected_sha1: Option<String>,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub status: DownloadStatus,
    pub retries: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DownloadRow {
    pub fn new(key: Key) -> Self {
        let now = Utc::now();
        Self {
            source_uri: key.source_uri,
            dest_path: key.dest_path,
            resolved_url: None,
            total_size: 0,
            expected_sha256: None,
            actual_sha256: None,
            expected_md5: None,
            expected_sha1: None,
            etag: None,
            last_modified: None,
            status: DownloadStatus::Pending,
            retries: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> Key {
        Key::new(self.source_uri.clone(), self.dest_path.clone())
    }
}

/// Status of a [`ChunkRow`] (spec §3 Entities / Chunk).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStatus {
    Pending,
    InFlight,
    Complete,
    Dirty,
}

impl ChunkStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Complete => "complete",
            Self::Dirty => "dirty",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "in_flight" => Self::InFlight,
            "complete" => Self::Complete,
            "dirty" => Self::Dirty,
            _ => return None,
        })
    }
}

/// A chunk row (spec §3 Entities / Chunk). Chunks exist only after planning.
#[derive(Debug, Clone)]
pub struct ChunkRow {
    pub source_uri: String,
    pub dest_path: PathBuf,
    pub index: u32,
    pub offset: u64,
    pub size: u64,
    pub status: ChunkStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub sha256: Option<String>,
}

impl ChunkRow {
    pub fn key(&self) -> Key {
        Key::new(self.source_uri.clone(), self.dest_path.clone())
    }
}

/// Filter applied by [`StateStore::list`]. `None` fields are unconstrained.
#[derive(Debug, Clone, Default)]
pub struct DownloadFilter {
    pub status: Option<DownloadStatus>,
}

/// A conforming state store backend (spec §4.1).
///
/// All chunk-status updates that accompany a download-status change MUST be
/// applied through [`StateStore::transaction`] so they commit atomically.
pub trait StateStore: Send + Sync {
    fn upsert_download(&self, row: &DownloadRow) -> Result<()>;
    fn get(&self, key: &Key) -> Result<Option<DownloadRow>>;
    fn list(&self, filter: &DownloadFilter) -> Result<Vec<DownloadRow>>;
    fn delete(&self, key: &Key) -> Result<()>;

    fn upsert_chunk(&self, chunk: &ChunkRow) -> Result<()>;
    fn list_chunks(&self, key: &Key) -> Result<Vec<ChunkRow>>;
    fn delete_chunks(&self, key: &Key) -> Result<()>;

    /// Run `f` with a consistent snapshot; either every write inside commits
    /// or none do. `f` receives a [`StateTxn`] scoped to this call.
    fn transaction(&self, f: &mut dyn FnMut(&dyn StateTxn) -> Result<()>) -> Result<()>;

    /// List rows whose status is `running` or `hold`, for crash recovery.
    fn recover_running_on_start(&self) -> Result<Vec<DownloadRow>>;

    /// Generic KV access reserved for caller/UI preferences (spec §4.1); the
    /// engine itself never reads or writes through this (see `SPEC_FULL.md`
    /// §3 on why the resolver cache is not stored here).
    fn kv_get(&self, key: &str) -> Result<Option<String>>;
    fn kv_set(&self, key: &str, value: &str) -> Result<()>;
}

/// The subset of [`StateStore`] operations usable inside a [`StateStore::transaction`].
pub trait StateTxn {
    fn upsert_download(&self, row: &DownloadRow) -> Result<()>;
    fn upsert_chunk(&self, chunk: &ChunkRow) -> Result<()>;
    fn delete_chunks(&self, key: &Key) -> Result<()>;
}

/// Derive the staging file's deterministic name from its key, independent of
/// the backend (used by both `stage.rs` and recovery reconciliation).
pub fn staging_hash(key: &Key) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(key.source_uri.as_bytes());
    hasher.update([0u8]);
    hasher.update(key.dest_path.to_string_lossy().as_bytes());
    hex::encode(hasher.finalize())
}

/// Helper used by backends to normalize a path for storage/display.
pub fn display_path(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
