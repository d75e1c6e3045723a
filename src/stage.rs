//! Staging path derivation, preallocation, and finalize (spec §4.7).

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::config::{Config, GeneralConfig, ValidationConfig};
use crate::error::{Error, Result};
use crate::format;
use crate::hash;
use crate::path::PathBufExt;
use crate::state::Key;

/// Derive the staging path for `key` given the configured layout. Chunked
/// and single-stream transfers share the same staging file.
pub fn staging_path(config: &Config, key: &Key) -> PathBuf {
    if config.stage_partials {
        let root = config.partials_root.clone().unwrap_or_else(|| config.download_root.clone().joined(".parts"));
        root.joined(crate::state::staging_hash(key)).appended(".part")
    } else {
        key.dest_path.clone().appended(".part")
    }
}

/// Best-effort preallocation to `total_size` for chunked downloads (§4.7
/// "Pre-allocation... is a best-effort optimization"). A failure here never
/// aborts the download; workers still write correctly into an un-preallocated
/// sparse file.
pub async fn preallocate(path: &Path, total_size: u64) {
    if total_size == 0 {
        return;
    }
    if let Some(parent) = path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            warn!(error = %e, path = %path.display(), "could not create staging directory");
            return;
        }
    }
    match tokio::fs::OpenOptions::new().create(true).write(true).open(path).await {
        Ok(file) => {
            if let Err(e) = file.set_len(total_size).await {
                warn!(error = %e, path = %path.display(), "staging preallocation failed, continuing sparse");
            }
        }
        Err(e) => warn!(error = %e, path = %path.display(), "could not open staging file for preallocation"),
    }
}

/// What finalize decided after hashing and format postprocessing.
#[derive(Debug, Clone)]
pub enum FinalizeOutcome {
    /// Published to `dest_path`; sidecar written.
    Complete { actual_sha256: String },
    /// Whole-file hash mismatched `expected_sha256` and no repair has run yet.
    NeedsRepair { actual_sha256: String },
    /// Whole-file hash still mismatched after one repair pass (fatal, §4.8).
    ChecksumMismatch { expected: String, actual: String },
    /// Format postprocessing rejected the file; never published (P7).
    VerifyFailed(String),
}

/// Run the four-step finalize sequence (§4.7) against an already fully
/// transferred staging file. `already_repaired` distinguishes a first-pass
/// mismatch (recoverable, §4.8) from a second one (fatal).
#[allow(clippy::too_many_arguments)]
pub async fn finalize(
    key: &Key,
    staging_path: &Path,
    expected_sha256: Option<&str>,
    expected_md5: Option<&str>,
    expected_sha1: Option<&str>,
    data_root: &Path,
    validation: &ValidationConfig,
    general: &GeneralConfig,
    already_repaired: bool,
) -> Result<FinalizeOutcome> {
    let mut file = tokio::fs::File::open(staging_path).await.map_err(Error::new_io)?;
    let actual = hash::hash_whole(&mut file).await?;
    drop(file);

    match expected_sha256 {
        Some(expected) => {
            if expected != actual {
                if already_repaired {
                    return Ok(FinalizeOutcome::ChecksumMismatch { expected: expected.to_string(), actual });
                }
                return Ok(FinalizeOutcome::NeedsRepair { actual_sha256: actual });
            }
        }
        None if validation.require_sha256 => {
            warn!(dest = %key.dest_path.display(), "sha256 required by policy but none was provided");
            quarantine_or_leave(staging_path, data_root, general).await;
            return Ok(FinalizeOutcome::VerifyFailed("sha256 required but no expected_sha256 was set".to_string()));
        }
        None if validation.accept_md5_sha1_if_provided && (expected_md5.is_some() || expected_sha1.is_some()) => {
            let mut file = tokio::fs::File::open(staging_path).await.map_err(Error::new_io)?;
            let legacy = hash::hash_whole_legacy(&mut file).await?;
            drop(file);
            let md5_ok = expected_md5.is_none_or(|m| m == legacy.md5);
            let sha1_ok = expected_sha1.is_none_or(|s| s == legacy.sha1);
            if !md5_ok || !sha1_ok {
                warn!(dest = %key.dest_path.display(), "legacy md5/sha1 digest mismatch");
                quarantine_or_leave(staging_path, data_root, general).await;
                return Ok(FinalizeOutcome::VerifyFailed("md5/sha1 digest mismatch".to_string()));
            }
        }
        None => {}
    }

    if let Err(e) = format::postprocess(staging_path, validation).await {
        warn!(error = %e, path = %staging_path.display(), "format postprocessing rejected staging file");
        quarantine_or_leave(staging_path, data_root, general).await;
        return Ok(FinalizeOutcome::VerifyFailed(e.to_string()));
    }

    publish(staging_path, &key.dest_path, general.allow_overwrite).await?;
    write_sidecar(&key.dest_path, &actual).await?;

    info!(dest = %key.dest_path.display(), sha256 = %actual, "download finalized");
    Ok(FinalizeOutcome::Complete { actual_sha256: actual })
}

async fn quarantine_or_leave(staging_path: &Path, data_root: &Path, general: &GeneralConfig) {
    if !general.quarantine {
        return;
    }
    let quarantine_dir = data_root.join("quarantine");
    if tokio::fs::create_dir_all(&quarantine_dir).await.is_err() {
        return;
    }
    let Some(name) = staging_path.file_name() else { return };
    let dest = quarantine_dir.join(name);
    if let Err(e) = tokio::fs::rename(staging_path, &dest).await {
        warn!(error = %e, "could not move verify-failed staging file into quarantine");
    }
}

/// Atomic rename `src` -> `dest`, falling back to copy+fsync+unlink when
/// they live on different filesystems (§4.7).
async fn publish(src: &Path, dest: &Path, allow_overwrite: bool) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(Error::new_io)?;
    }

    if !allow_overwrite && tokio::fs::metadata(dest).await.is_ok() {
        return Err(Error::Config(format!("destination already exists and allow_overwrite is false: {}", dest.display())));
    }

    match tokio::fs::rename(src, dest).await {
        Ok(()) => Ok(()),
        Err(e) if is_cross_device(&e) => {
            tokio::fs::copy(src, dest).await.map_err(Error::new_io)?;
            let file = tokio::fs::File::open(dest).await.map_err(Error::new_io)?;
            file.sync_all().await.map_err(Error::new_io)?;
            tokio::fs::remove_file(src).await.map_err(Error::new_io)?;
            Ok(())
        }
        Err(e) => Err(Error::new_io(e)),
    }
}

fn is_cross_device(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::CrossesDevices
}

/// Write `<dest>.sha256` atomically (write-then-rename, §4.7).
async fn write_sidecar(dest: &Path, sha256: &str) -> Result<()> {
    let sidecar = dest.to_path_buf().appended(".sha256");
    let tmp = dest.to_path_buf().appended(".sha256.tmp");
    let body = format!("{sha256}  {}\n", dest.file_name().map(|n| n.to_string_lossy()).unwrap_or_default());
    tokio::fs::write(&tmp, body).await.map_err(Error::new_io)?;
    tokio::fs::rename(&tmp, &sidecar).await.map_err(Error::new_io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GeneralConfig, ValidationConfig};

    fn key(dest: &Path) -> Key {
        Key::new("http://h/x", dest)
    }

    #[tokio::test]
    async fn finalize_publishes_matching_hash_and_writes_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("x.part");
        tokio::fs::write(&staging, b"hello world").await.unwrap();
        let dest = dir.path().join("x.bin");

        let outcome = finalize(
            &key(&dest),
            &staging,
            Some("b94d27b9934d3e08a52e52d7da7dacefbd723eb4f5f1e32c9b6f4f3a8efdaf56"),
            None,
            None,
            dir.path(),
            &ValidationConfig::default(),
            &GeneralConfig::default(),
            false,
        )
        .await
        .unwrap();

        assert!(matches!(outcome, FinalizeOutcome::Complete { .. }));
        assert!(dest.exists());
        assert!(dir.path().join("x.bin.sha256").exists());
    }

    #[tokio::test]
    async fn finalize_reports_needs_repair_on_first_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("x.part");
        tokio::fs::write(&staging, b"hello world").await.unwrap();
        let dest = dir.path().join("x.bin");

        let outcome = finalize(
            &key(&dest),
            &staging,
            Some("deadbeef"),
            None,
            None,
            dir.path(),
            &ValidationConfig::default(),
            &GeneralConfig::default(),
            false,
        )
        .await
        .unwrap();

        assert!(matches!(outcome, FinalizeOutcome::NeedsRepair { .. }));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn finalize_reports_fatal_mismatch_after_repair() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("x.part");
        tokio::fs::write(&staging, b"hello world").await.unwrap();
        let dest = dir.path().join("x.bin");

        let outcome = finalize(
            &key(&dest),
            &staging,
            Some("deadbeef"),
            None,
            None,
            dir.path(),
            &ValidationConfig::default(),
            &GeneralConfig::default(),
            true,
        )
        .await
        .unwrap();

        assert!(matches!(outcome, FinalizeOutcome::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn finalize_refuses_overwrite_when_not_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("x.part");
        tokio::fs::write(&staging, b"hello world").await.unwrap();
        let dest = dir.path().join("x.bin");
        tokio::fs::write(&dest, b"existing").await.unwrap();

        let general = GeneralConfig { allow_overwrite: false, ..GeneralConfig::default() };
        let err =
            finalize(&key(&dest), &staging, None, None, None, dir.path(), &ValidationConfig::default(), &general, false).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn finalize_accepts_matching_md5_when_no_sha256_expected() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("x.part");
        tokio::fs::write(&staging, b"hello world").await.unwrap();
        let dest = dir.path().join("x.bin");

        let outcome = finalize(
            &key(&dest),
            &staging,
            None,
            Some("5eb63bbbe01eeed093cb22bb8f5acdc3"),
            None,
            dir.path(),
            &ValidationConfig::default(),
            &GeneralConfig::default(),
            false,
        )
        .await
        .unwrap();

        assert!(matches!(outcome, FinalizeOutcome::Complete { .. }));
        assert!(dest.exists());
    }

    #[tokio::test]
    async fn finalize_quarantines_on_legacy_digest_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("x.part");
        tokio::fs::write(&staging, b"hello world").await.unwrap();
        let dest = dir.path().join("x.bin");

        let general = GeneralConfig { quarantine: true, ..GeneralConfig::default() };
        let outcome = finalize(
            &key(&dest),
            &staging,
            None,
            None,
            Some("00000000000000000000000000000000000000"),
            dir.path(),
            &ValidationConfig::default(),
            &general,
            false,
        )
        .await
        .unwrap();

        assert!(matches!(outcome, FinalizeOutcome::VerifyFailed(_)));
        assert!(!dest.exists());
        assert!(dir.path().join("quarantine").join("x.part").exists());
    }

    #[tokio::test]
    async fn finalize_rejects_missing_sha256_when_required() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("x.part");
        tokio::fs::write(&staging, b"hello world").await.unwrap();
        let dest = dir.path().join("x.bin");

        let validation = ValidationConfig { require_sha256: true, ..ValidationConfig::default() };
        let outcome = finalize(&key(&dest), &staging, None, None, None, dir.path(), &validation, &GeneralConfig::default(), false).await.unwrap();

        assert!(matches!(outcome, FinalizeOutcome::VerifyFailed(_)));
        assert!(!dest.exists());
    }

    #[test]
    fn staging_path_uses_parts_root_when_configured() {
        let mut config = Config::default();
        config.stage_partials = true;
        config.partials_root = Some(PathBuf::from("/tmp/parts"));
        let key = key(Path::new("/dl/x.bin"));
        let path = staging_path(&config, &key);
        assert_eq!(path.parent().unwrap(), Path::new("/tmp/parts"));
        assert!(path.to_string_lossy().ends_with(".part"));
    }

    #[test]
    fn staging_path_appends_part_to_dest_when_not_staged() {
        let mut config = Config::default();
        config.stage_partials = false;
        let key = key(Path::new("/dl/x.bin"));
        let path = staging_path(&config, &key);
        assert_eq!(path, PathBuf::from("/dl/x.bin.part"));
    }
}
