//! Positional file I/O shared by chunk workers (spec §4.6 "workers never
//! seek the file's cursor"). Concurrent writers touching disjoint byte
//! ranges of the same file never contend on a seek, only on the underlying
//! filesystem, so this wraps each write in `spawn_blocking` over a cloned
//! `std::fs::File` handle rather than serializing through one async handle.

use std::fs::File;
use std::io;
use std::sync::Arc;

use crate::error::{Error, Result};

#[cfg(unix)]
fn write_at_sync(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_at_sync(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut written = 0usize;
    while written < buf.len() {
        let n = file.seek_write(&buf[written..], offset + written as u64)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "seek_write wrote zero bytes"));
        }
        written += n;
    }
    Ok(())
}

/// Write `buf` at `offset` in `file` without disturbing any other handle's
/// cursor. Runs on the blocking pool since positional I/O isn't async. `file`
/// is shared via `Arc` so concurrent writers touching disjoint ranges never
/// need their own file descriptor.
pub async fn write_at(file: Arc<File>, buf: Vec<u8>, offset: u64) -> Result<()> {
    tokio::task::spawn_blocking(move || write_at_sync(&file, &buf, offset))
        .await
        .map_err(|e| Error::internal(e, "fileio::write_at::join"))?
        .map_err(Error::new_io)
}

#[cfg(unix)]
fn read_at_sync(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_at_sync(file: &File, buf: &mut [u8], offset: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}

/// Read up to `buf.len()` bytes at `offset`, used by the repair loop to
/// re-hash a chunk's range without disturbing any writer's position.
pub async fn read_at(file: Arc<File>, mut buf: Vec<u8>, offset: u64) -> Result<Vec<u8>> {
    tokio::task::spawn_blocking(move || {
        let n = read_at_sync(&file, &mut buf, offset)?;
        buf.truncate(n);
        Ok(buf)
    })
    .await
    .map_err(|e| Error::internal(e, "fileio::read_at::join"))?
    .map_err(Error::new_io)
}
