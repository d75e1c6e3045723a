//! Streaming SHA-256 over ranges and whole files (spec §4.2).
//!
//! Never loads a range into memory: both operations stream through a fixed
//! working buffer and propagate I/O failures as [`Error::Io`].

use std::io::SeekFrom;

use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::{Error, Result};

/// Size of the working buffer used to stream bytes through the hasher.
pub const BUFFER_SIZE: usize = 1024 * 1024;

/// Hash exactly `size` bytes starting at `offset` in `file`, returning the
/// lowercase hex digest. `file`'s cursor is left positioned at `offset + size`.
pub async fn hash_range(file: &mut File, offset: u64, size: u64) -> Result<String> {
    file.seek(SeekFrom::Start(offset)).await.map_err(Error::new_io)?;

    let mut hasher = Sha256::new();
    let mut remaining = size;
    let mut buf = vec![0u8; BUFFER_SIZE.min(size.max(1) as usize)];

    while remaining > 0 {
        let want = (buf.len() as u64).min(remaining) as usize;
        let read = file.read(&mut buf[..want]).await.map_err(Error::new_io)?;
        if read == 0 {
            break; // Short file: caller compares returned digest against expectations.
        }
        hasher.update(&buf[..read]);
        remaining -= read as u64;
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hash the entire file from its current position to EOF, returning the
/// lowercase hex digest. Rewinds to the start before hashing.
pub async fn hash_whole(file: &mut File) -> Result<String> {
    file.seek(SeekFrom::Start(0)).await.map_err(Error::new_io)?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BUFFER_SIZE];

    loop {
        let read = file.read(&mut buf).await.map_err(Error::new_io)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Legacy whole-file digests, consulted only when
/// `validation.accept_md5_sha1_if_provided` is set and a source supplied no
/// SHA-256 (spec §3 supplement).
pub async fn hash_whole_legacy(file: &mut File) -> Result<LegacyDigests> {
    file.seek(SeekFrom::Start(0)).await.map_err(Error::new_io)?;

    let mut md5 = md5::Context::new();
    let mut sha1 = sha1::Sha1::new();
    let mut buf = vec![0u8; BUFFER_SIZE];

    loop {
        let read = file.read(&mut buf).await.map_err(Error::new_io)?;
        if read == 0 {
            break;
        }
        md5.consume(&buf[..read]);
        sha1::Digest::update(&mut sha1, &buf[..read]);
    }

    Ok(LegacyDigests {
        md5: format!("{:x}", md5.compute()),
        sha1: hex::encode(sha1::Digest::finalize(sha1)),
    })
}

#[derive(Debug, Clone)]
pub struct LegacyDigests {
    pub md5: String,
    pub sha1: String,
}

/// Hash an in-memory buffer, used by the repair loop to re-check a chunk's
/// on-disk range without reopening it as an async file.
pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
