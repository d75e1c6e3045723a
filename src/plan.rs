//! Splits a byte range into fixed-size chunks and reconciles with stored
//! chunk state on resume (spec §4.5).

use crate::config::ConcurrencyConfig;
use crate::state::{ChunkRow, ChunkStatus, Key};

/// The engine-facing decision a plan reduces to: either no chunking at all
/// (single-stream fallback, §4.5.1) or a concrete chunk set.
#[derive(Debug, Clone)]
pub enum PlannedTransfer {
    SingleStream,
    Chunked(Vec<ChunkRow>),
}

/// Partition `[0, total_size)` into `N = min(per_file_chunks, ceil(total_size / chunk_size))`
/// chunks of `chunk_size` bytes, with the last chunk absorbing the remainder.
/// Pure and total for any `total_size > 0`, `chunk_size > 0`, `per_file_chunks >= 1`.
pub fn partition_sizes(total_size: u64, chunk_size: u64, per_file_chunks: usize) -> Vec<(u64, u64)> {
    if total_size == 0 {
        return Vec::new();
    }
    let chunk_size = chunk_size.max(1);
    let per_file_chunks = per_file_chunks.max(1);

    let chunks_needed = total_size.div_ceil(chunk_size);
    let n = (per_file_chunks as u64).min(chunks_needed).max(1);

    let mut out = Vec::with_capacity(n as usize);
    for i in 0..n {
        let offset = i * chunk_size;
        let size = if i == n - 1 { total_size - offset } else { chunk_size };
        out.push((offset, size));
    }
    out
}

/// Build the transfer plan for `key`, reconciling the fresh partition against
/// `existing` chunk rows and the on-disk `staging_size` (§4.5 steps 2-3, I5).
pub fn plan(
    key: &Key,
    total_size: u64,
    supports_range: bool,
    concurrency: &ConcurrencyConfig,
    existing: &[ChunkRow],
    staging_size: u64,
) -> PlannedTransfer {
    if !supports_range || total_size == 0 {
        return PlannedTransfer::SingleStream;
    }

    let partitions = partition_sizes(total_size, concurrency.chunk_size_bytes(), concurrency.per_file_chunks);

    let chunks = partitions
        .into_iter()
        .enumerate()
        .map(|(index, (offset, size))| reconcile_one(key, index as u32, offset, size, existing, staging_size))
        .collect();

    PlannedTransfer::Chunked(chunks)
}

fn reconcile_one(key: &Key, index: u32, offset: u64, size: u64, existing: &[ChunkRow], staging_size: u64) -> ChunkRow {
    let found = existing.iter().find(|c| c.offset == offset && c.size == size);

    match found {
        Some(row) if row.status == ChunkStatus::Complete => {
            if staging_size >= offset + size {
                ChunkRow { index, ..row.clone() }
            } else {
                // I5: a `complete` chunk is never trusted without a size check.
                ChunkRow { index, status: ChunkStatus::Pending, sha256: None, ..row.clone() }
            }
        }
        Some(row) if row.status == ChunkStatus::Dirty => ChunkRow { index, ..row.clone() },
        Some(row) => ChunkRow { index, status: ChunkStatus::Pending, sha256: None, ..row.clone() },
        None => ChunkRow {
            source_uri: key.source_uri.clone(),
            dest_path: key.dest_path.clone(),
            index,
            offset,
            size,
            status: ChunkStatus::Pending,
            attempts: 0,
            last_error: None,
            sha256: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key() -> Key {
        Key::new("http://h/x", "/tmp/x.bin")
    }

    #[test]
    fn s1_scenario_produces_expected_chunk_sizes() {
        let sizes = partition_sizes(10_000_000, 4_194_304, 4);
        assert_eq!(sizes, vec![(0, 4_194_304), (4_194_304, 4_194_304), (8_388_608, 1_611_392)]);
    }

    #[test]
    fn unsupported_range_forces_single_stream() {
        let cfg = ConcurrencyConfig::default();
        let plan = plan(&key(), 10_000_000, false, &cfg, &[], 0);
        assert!(matches!(plan, PlannedTransfer::SingleStream));
    }

    #[test]
    fn zero_total_size_forces_single_stream() {
        let cfg = ConcurrencyConfig::default();
        let plan = plan(&key(), 0, true, &cfg, &[], 0);
        assert!(matches!(plan, PlannedTransfer::SingleStream));
    }

    #[test]
    fn complete_chunk_preserved_when_staging_size_covers_it() {
        let cfg = ConcurrencyConfig { chunk_size_mb: 1, per_file_chunks: 2, ..ConcurrencyConfig::default() };
        let existing = vec![ChunkRow {
            source_uri: key().source_uri,
            dest_path: key().dest_path,
            index: 0,
            offset: 0,
            size: 1024 * 1024,
            status: ChunkStatus::Complete,
            attempts: 1,
            last_error: None,
            sha256: Some("abc".to_string()),
        }];

        let total = 1024 * 1024 * 2;
        let PlannedTransfer::Chunked(chunks) = plan(&key(), total, true, &cfg, &existing, total) else {
            panic!("expected chunked plan");
        };
        assert_eq!(chunks[0].status, ChunkStatus::Complete);
        assert_eq!(chunks[0].sha256.as_deref(), Some("abc"));
    }

    #[test]
    fn complete_chunk_demoted_when_staging_file_too_small() {
        let cfg = ConcurrencyConfig { chunk_size_mb: 1, per_file_chunks: 2, ..ConcurrencyConfig::default() };
        let existing = vec![ChunkRow {
            source_uri: key().source_uri,
            dest_path: key().dest_path,
            index: 0,
            offset: 0,
            size: 1024 * 1024,
            status: ChunkStatus::Complete,
            attempts: 1,
            last_error: None,
            sha256: Some("abc".to_string()),
        }];

        let total = 1024 * 1024 * 2;
        let PlannedTransfer::Chunked(chunks) = plan(&key(), total, true, &cfg, &existing, 10) else {
            panic!("expected chunked plan");
        };
        assert_eq!(chunks[0].status, ChunkStatus::Pending);
        assert!(chunks[0].sha256.is_none());
    }

    proptest! {
        #[test]
        fn p1_chunks_partition_without_gaps_or_overlaps(
            total_size in 1u64..=10u64 * 1024 * 1024 * 1024,
            per_file_chunks in 1usize..=16,
            chunk_size_mb in 1u64..=64,
        ) {
            let sizes = partition_sizes(total_size, chunk_size_mb * 1024 * 1024, per_file_chunks);
            let mut cursor = 0u64;
            for (offset, size) in &sizes {
                prop_assert_eq!(*offset, cursor);
                prop_assert!(*size > 0);
                cursor += size;
            }
            prop_assert_eq!(cursor, total_size);
        }
    }
}
