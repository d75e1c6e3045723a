//! In-memory [`StateStore`], used by unit and integration tests that don't
//! need to exercise real persistence.

use std::collections::HashMap;
use std::sync::Mutex;

use super::{ChunkRow, DownloadFilter, DownloadRow, Key, StateStore, StateTxn};
use crate::error::Result;

#[derive(Default)]
struct Inner {
    downloads: HashMap<Key, DownloadRow>,
    chunks: HashMap<Key, Vec<ChunkRow>>,
    kv: HashMap<String, String>,
}

pub struct MemoryStateStore {
    inner: Mutex<Inner>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::default()) }
    }
}

impl Default for MemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

fn upsert_chunk_into(chunks: &mut Vec<ChunkRow>, chunk: ChunkRow) {
    match chunks.iter_mut().find(|c| c.index == chunk.index) {
        Some(existing) => *existing = chunk,
        None => chunks.push(chunk),
    }
}

impl StateStore for MemoryStateStore {
    fn upsert_download(&self, row: &DownloadRow) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.downloads.insert(row.key(), row.clone());
        Ok(())
    }

    fn get(&self, key: &Key) -> Result<Option<DownloadRow>> {
        Ok(self.inner.lock().unwrap().downloads.get(key).cloned())
    }

    fn list(&self, filter: &DownloadFilter) -> Result<Vec<DownloadRow>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .downloads
            .values()
            .filter(|row| filter.status.is_none_or(|s| row.status == s))
            .cloned()
            .collect())
    }

    fn delete(&self, key: &Key) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.downloads.remove(key);
        inner.chunks.remove(key);
        Ok(())
    }

    fn upsert_chunk(&self, chunk: &ChunkRow) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let key = chunk.key();
        upsert_chunk_into(inner.chunks.entry(key).or_default(), chunk.clone());
        Ok(())
    }

    fn list_chunks(&self, key: &Key) -> Result<Vec<ChunkRow>> {
        let inner = self.inner.lock().unwrap();
        let mut rows = inner.chunks.get(key).cloned().unwrap_or_default();
        rows.sort_by_key(|c| c.index);
        Ok(rows)
    }

    fn delete_chunks(&self, key: &Key) -> Result<()> {
        self.inner.lock().unwrap().chunks.remove(key);
        Ok(())
    }

    fn transaction(&self, f: &mut dyn FnMut(&dyn StateTxn) -> Result<()>) -> Result<()> {
        // Mirrors the sqlite backend's all-or-nothing commit by buffering
        // writes and only applying them once `f` returns without error.
        let buffer = Mutex::new(TxnBuffer::default());
        let handle = MemoryTxn { buffer: &buffer };
        f(&handle)?;

        let buffer = buffer.into_inner().unwrap();
        let mut inner = self.inner.lock().unwrap();
        for row in buffer.downloads {
            inner.downloads.insert(row.key(), row);
        }
        for chunk in buffer.chunks {
            let key = chunk.key();
            upsert_chunk_into(inner.chunks.entry(key).or_default(), chunk);
        }
        for key in buffer.deleted_chunk_keys {
            inner.chunks.remove(&key);
        }
        Ok(())
    }

    fn recover_running_on_start(&self) -> Result<Vec<DownloadRow>> {
        use super::DownloadStatus;
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .downloads
            .values()
            .filter(|row| matches!(row.status, DownloadStatus::Running | DownloadStatus::Hold))
            .cloned()
            .collect())
    }

    fn kv_get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().unwrap().kv.get(key).cloned())
    }

    fn kv_set(&self, key: &str, value: &str) -> Result<()> {
        self.inner.lock().unwrap().kv.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

#[derive(Default)]
struct TxnBuffer {
    downloads: Vec<DownloadRow>,
    chunks: Vec<ChunkRow>,
    deleted_chunk_keys: Vec<Key>,
}

struct MemoryTxn<'a> {
    buffer: &'a Mutex<TxnBuffer>,
}

impl StateTxn for MemoryTxn<'_> {
    fn upsert_download(&self, row: &DownloadRow) -> Result<()> {
        self.buffer.lock().unwrap().downloads.push(row.clone());
        Ok(())
    }

    fn upsert_chunk(&self, chunk: &ChunkRow) -> Result<()> {
        self.buffer.lock().unwrap().chunks.push(chunk.clone());
        Ok(())
    }

    fn delete_chunks(&self, key: &Key) -> Result<()> {
        self.buffer.lock().unwrap().deleted_chunk_keys.push(key.clone());
        Ok(())
    }
}
