//! TTL-bounded JSON cache for resolved URIs (spec §9 "Persistence format of
//! resolver cache"). Never stores `Authorization` header values — those are
//! re-derived from config/environment on every read.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use fs4::fs_std::FileExt;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// One cached resolution, sans any credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub url: String,
    pub model_name: Option<String>,
    pub version_name: Option<String>,
    pub version_id: Option<String>,
    pub file_name: Option<String>,
    pub file_type: Option<String>,
    pub suggested_filename: Option<String>,
    pub available_quantizations: Option<Vec<String>>,
    pub selected_quantization: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CacheFile {
    #[serde(flatten)]
    entries: HashMap<String, CacheEntry>,
}

/// Handle to the on-disk resolver cache at `<data_root>/resolver-cache.json`.
/// Readers tolerate a missing or malformed file as empty (§9); a cache miss
/// is never an error (§3).
pub struct ResolverCache {
    path: PathBuf,
    ttl: chrono::Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl ResolverCache {
    pub fn open(path: impl Into<PathBuf>, ttl_hours: u64) -> Self {
        let path = path.into();
        let entries = load(&path).unwrap_or_else(|err| {
            warn!(error = %err, path = %path.display(), "resolver cache unreadable, starting empty");
            HashMap::new()
        });
        Self { path, ttl: chrono::Duration::hours(ttl_hours as i64), entries: Mutex::new(entries) }
    }

    /// Return a fresh cached entry for `uri`, or `None` on miss/expiry.
    pub fn get(&self, uri: &str) -> Option<CacheEntry> {
        let entries = self.entries.lock().unwrap();
        let entry = entries.get(uri)?;
        if Utc::now() - entry.updated_at > self.ttl {
            return None;
        }
        Some(entry.clone())
    }

    /// Insert or replace the cached entry for `uri` and persist the cache.
    pub fn put(&self, uri: &str, entry: CacheEntry) -> Result<()> {
        {
            let mut entries = self.entries.lock().unwrap();
            entries.insert(uri.to_string(), entry);
        }
        self.flush()
    }

    /// Drop the cached entry for `uri` (invoked on a 404 from the origin).
    pub fn invalidate(&self, uri: &str) -> Result<()> {
        {
            let mut entries = self.entries.lock().unwrap();
            entries.remove(uri);
        }
        self.flush()
    }

    fn flush(&self) -> Result<()> {
        let entries = self.entries.lock().unwrap().clone();
        write_atomic(&self.path, &entries)
    }
}

fn load(path: &Path) -> Result<HashMap<String, CacheEntry>> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(Error::new_io(e)),
    };

    let mut contents = String::new();
    file.read_to_string(&mut contents).map_err(Error::new_io)?;
    if contents.trim().is_empty() {
        return Ok(HashMap::new());
    }

    let mut deserializer = serde_json::Deserializer::from_str(&contents);
    let parsed: CacheFile = serde_path_to_error::deserialize(&mut deserializer)
        .map_err(|e| Error::internal(e, "resolver::cache::load"))?;
    Ok(parsed.entries)
}

/// Write-to-temp-then-rename with a best-effort advisory lock around the
/// swap, so two processes racing a write never interleave partial bytes.
fn write_atomic(path: &Path, entries: &HashMap<String, CacheEntry>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(Error::new_io)?;
    }

    let lock_path = path.with_extension("json.lock");
    let lock_file = File::create(&lock_path).map_err(Error::new_io)?;
    let _ = lock_file.lock_exclusive();

    let tmp_path = path.with_extension("json.tmp");
    let body = serde_json::to_vec_pretty(&CacheFile { entries: entries.clone() })
        .map_err(|e| Error::internal(e, "resolver::cache::serialize"))?;

    {
        let mut tmp = File::create(&tmp_path).map_err(Error::new_io)?;
        tmp.write_all(&body).map_err(Error::new_io)?;
        tmp.sync_all().map_err(Error::new_io)?;
    }
    std::fs::rename(&tmp_path, path).map_err(Error::new_io)?;

    let _ = lock_file.unlock();
    Ok(())
}
