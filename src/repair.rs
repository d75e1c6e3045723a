//! One-pass repair loop invoked on a whole-file hash mismatch (spec §4.8).

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::error::Result;
use crate::fileio;
use crate::hash;
use crate::state::{ChunkRow, ChunkStatus};

/// Re-hash each chunk's on-disk range and compare against its stored
/// `sha256`. Chunks that still match stay `complete`; mismatching chunks are
/// cleared and marked `dirty` so the caller can re-enter the transfer
/// workers for just those chunks.
pub async fn diagnose(staging_path: &Path, chunks: Vec<ChunkRow>) -> Result<Vec<ChunkRow>> {
    let std_file = tokio::task::spawn_blocking({
        let path = staging_path.to_path_buf();
        move || File::open(path)
    })
    .await
    .map_err(|e| crate::error::Error::internal(e, "repair::open::join"))?
    .map_err(crate::error::Error::new_io)?;
    let file = Arc::new(std_file);

    let mut out = Vec::with_capacity(chunks.len());
    for mut chunk in chunks {
        if chunk.status != ChunkStatus::Complete {
            out.push(chunk);
            continue;
        }

        let bytes = fileio::read_at(file.clone(), vec![0u8; chunk.size as usize], chunk.offset).await?;
        let actual = hash::digest_bytes(&bytes);

        if chunk.sha256.as_deref() == Some(actual.as_str()) {
            out.push(chunk);
            continue;
        }

        warn!(chunk = chunk.index, offset = chunk.offset, "chunk failed repair re-hash, marking dirty");
        chunk.status = ChunkStatus::Dirty;
        chunk.sha256 = None;
        chunk.last_error = Some("repair: on-disk bytes did not match stored hash".to_string());
        out.push(chunk);
    }

    let dirty = out.iter().filter(|c| c.status == ChunkStatus::Dirty).count();
    info!(dirty, total = out.len(), "repair diagnosis complete");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(offset: u64, size: u64, sha256: Option<&str>) -> ChunkRow {
        ChunkRow {
            source_uri: "http://h/x".to_string(),
            dest_path: "/tmp/x".into(),
            index: (offset / size.max(1)) as u32,
            offset,
            size,
            status: ChunkStatus::Complete,
            attempts: 1,
            last_error: None,
            sha256: sha256.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn matching_chunk_stays_complete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.part");
        tokio::fs::write(&path, b"abcdefgh").await.unwrap();

        let expected = hash::digest_bytes(b"abcd");
        let chunks = vec![chunk(0, 4, Some(&expected))];

        let out = diagnose(&path, chunks).await.unwrap();
        assert_eq!(out[0].status, ChunkStatus::Complete);
    }

    #[tokio::test]
    async fn mismatching_chunk_is_marked_dirty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.part");
        tokio::fs::write(&path, b"abcdefgh").await.unwrap();

        let chunks = vec![chunk(0, 4, Some("deadbeef"))];

        let out = diagnose(&path, chunks).await.unwrap();
        assert_eq!(out[0].status, ChunkStatus::Dirty);
        assert!(out[0].sha256.is_none());
    }

    #[tokio::test]
    async fn non_complete_chunks_pass_through_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.part");
        tokio::fs::write(&path, b"abcdefgh").await.unwrap();

        let mut pending = chunk(4, 4, None);
        pending.status = ChunkStatus::Pending;
        let out = diagnose(&path, vec![pending]).await.unwrap();
        assert_eq!(out[0].status, ChunkStatus::Pending);
    }
}
