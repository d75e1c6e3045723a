//! Safetensors header parsing, trailing-byte trim, and optional deep verify
//! (spec §4.9).

use std::collections::HashMap;
use std::io::SeekFrom;

use serde::Deserialize;
use serde_json::Value;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::info;

use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct TensorEntry {
    #[serde(default)]
    data_offsets: Option<[u64; 2]>,
}

/// Mandatory trim (always) and optional deep-verify (gated by
/// `deep_verify`) against the staging file at `path`.
pub async fn trim_and_verify(path: &std::path::Path, deep_verify: bool) -> Result<()> {
    let mut file = File::open(path).await.map_err(Error::new_io)?;
    let on_disk_size = file.metadata().await.map_err(Error::new_io)?.len();

    let header_len = read_header_len(&mut file).await?;
    let header_json = read_header_json(&mut file, header_len).await?;
    let entries = parse_header(&header_json)?;

    let header_end = 8 + header_len;
    let data_size: u64 = entries.values().filter_map(|e| e.data_offsets).map(|[_, end]| end).sum();
    let declared_end = header_end + data_size;

    if on_disk_size > declared_end {
        drop(file);
        let std_path = path.to_path_buf();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let f = std::fs::OpenOptions::new().write(true).open(&std_path)?;
            f.set_len(declared_end)
        })
        .await
        .map_err(|e| Error::internal(e, "format::safetensors::trim::join"))?
        .map_err(Error::new_io)?;
        info!(path = %path.display(), declared_end, on_disk_size, "trimmed trailing bytes from safetensors file");
    } else if on_disk_size < declared_end {
        return Err(Error::VerifyFailed(format!("safetensors file is short: declared {declared_end} bytes, found {on_disk_size}")));
    }

    if deep_verify {
        verify_coverage(&entries, data_size)?;
    }

    Ok(())
}

async fn read_header_len(file: &mut File) -> Result<u64> {
    file.seek(SeekFrom::Start(0)).await.map_err(Error::new_io)?;
    let mut buf = [0u8; 8];
    file.read_exact(&mut buf).await.map_err(Error::new_io)?;
    Ok(u64::from_le_bytes(buf))
}

async fn read_header_json(file: &mut File, header_len: u64) -> Result<String> {
    let mut buf = vec![0u8; header_len as usize];
    file.read_exact(&mut buf).await.map_err(Error::new_io)?;
    String::from_utf8(buf).map_err(|e| Error::VerifyFailed(format!("safetensors header is not valid UTF-8: {e}")))
}

fn parse_header(json: &str) -> Result<HashMap<String, TensorEntry>> {
    let mut deserializer = serde_json::Deserializer::from_str(json);
    let raw: HashMap<String, Value> =
        serde_path_to_error::deserialize(&mut deserializer).map_err(|e| Error::VerifyFailed(format!("invalid safetensors header JSON: {e}")))?;

    let mut out = HashMap::with_capacity(raw.len());
    for (name, value) in raw {
        if name == "__metadata__" {
            continue;
        }
        let entry: TensorEntry = serde_json::from_value(value).map_err(|e| Error::VerifyFailed(format!("invalid tensor entry {name}: {e}")))?;
        out.insert(name, entry);
    }
    Ok(out)
}

/// Deep-verify that tensor data regions, sorted by start offset, exactly
/// tile `[0, data_size)` with no gaps or overlaps.
fn verify_coverage(entries: &HashMap<String, TensorEntry>, data_size: u64) -> Result<()> {
    let mut spans: Vec<[u64; 2]> = entries.values().filter_map(|e| e.data_offsets).collect();
    spans.sort_by_key(|s| s[0]);

    let mut cursor = 0u64;
    for span in &spans {
        if span[0] != cursor {
            return Err(Error::VerifyFailed(format!("safetensors tensor data region has a gap or overlap at offset {}", span[0])));
        }
        cursor = span[1];
    }
    if cursor != data_size {
        return Err(Error::VerifyFailed("safetensors tensor data regions do not cover the declared data size".to_string()));
    }
    Ok(())
}
