//! Format-aware finalization steps (spec §4.9).

mod safetensors;

use std::path::Path;

use crate::config::ValidationConfig;
use crate::error::Result;

/// Artifact format tag attached to progress events. Purely informational:
/// detection failure or an unrecognized format never affects any finalize
/// decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactFormat {
    Safetensors,
    Gguf,
}

/// Run mandatory (and, if configured, optional) format checks on the
/// staging file before it is published. A no-op for any file whose basename
/// doesn't end in `.safetensors`.
pub async fn postprocess(path: &Path, validation: &ValidationConfig) -> Result<()> {
    if is_safetensors(path) {
        safetensors::trim_and_verify(path, validation.safetensors_deep_verify_after_download).await?;
    }
    Ok(())
}

fn is_safetensors(path: &Path) -> bool {
    path.file_name().and_then(|n| n.to_str()).is_some_and(|n| n.ends_with(".safetensors"))
}

/// Best-effort magic sniff used only to tag progress events (§4.9 supplement).
/// Never fatal; returns `None` on any I/O error or unrecognized format.
pub async fn sniff(path: &Path) -> Option<ArtifactFormat> {
    if is_safetensors(path) {
        return Some(ArtifactFormat::Safetensors);
    }
    let bytes = tokio::fs::read(path).await.ok()?;
    if bytes.len() >= 4 && bytes[..4] == *b"GGUF" {
        return Some(ArtifactFormat::Gguf);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sniff_recognizes_gguf_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        tokio::fs::write(&path, b"GGUFrest-of-file").await.unwrap();
        assert_eq!(sniff(&path).await, Some(ArtifactFormat::Gguf));
    }

    #[tokio::test]
    async fn sniff_ignores_unrecognized_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin");
        tokio::fs::write(&path, b"not a known format").await.unwrap();
        assert_eq!(sniff(&path).await, None);
    }

    #[tokio::test]
    async fn sniff_tags_by_extension_for_safetensors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.safetensors");
        tokio::fs::write(&path, b"anything").await.unwrap();
        assert_eq!(sniff(&path).await, Some(ArtifactFormat::Safetensors));
    }
}
