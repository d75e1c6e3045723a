//! `repo://owner/repo/path[?rev=…]` resolution (spec §4.3, §6.1).
//!
//! Resolving a repo URI needs no round trip: the direct-download URL is a
//! deterministic function of owner, repo, revision and path, the same way a
//! revisioned file-tree host serves its `resolve/<rev>/<path>` routes.

use url::Url;

use super::cache::CacheEntry;
use crate::config::SourceConfig;
use crate::error::{Error, Result};

const DEFAULT_REVISION: &str = "main";

pub fn can_handle(uri: &str) -> bool {
    uri.starts_with("repo://")
}

/// `Some((owner, repo, path, rev))` if `uri` parses as a well-formed
/// `repo://` URI, `None` otherwise.
fn parse(uri: &str) -> Option<(String, String, String, String)> {
    let rest = uri.strip_prefix("repo://")?;
    let (path_part, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };

    let mut segments = path_part.splitn(3, '/');
    let owner = segments.next()?.to_string();
    let repo = segments.next()?.to_string();
    let path = segments.next()?.to_string();
    if owner.is_empty() || repo.is_empty() || path.is_empty() {
        return None;
    }

    let rev = query
        .and_then(|q| url::form_urlencoded::parse(q.as_bytes()).find(|(k, _)| k == "rev").map(|(_, v)| v.into_owned()))
        .unwrap_or_else(|| DEFAULT_REVISION.to_string());

    Some((owner, repo, path, rev))
}

pub async fn resolve(uri: &str, source: &SourceConfig) -> Result<CacheEntry> {
    let (owner, repo, path, rev) = parse(uri).ok_or(Error::Resolver { status: None })?;

    let url = Url::parse(&format!("{}/{owner}/{repo}/resolve/{rev}/{path}", source.base_url.trim_end_matches('/')))
        .map_err(|e| Error::internal(e, "resolver::repo::parse_url"))?;

    let file_name = path.rsplit('/').next().unwrap_or(&path).to_string();

    Ok(CacheEntry {
        url: url.to_string(),
        model_name: Some(format!("{owner}/{repo}")),
        version_name: Some(rev),
        version_id: None,
        file_name: Some(file_name.clone()),
        file_type: None,
        suggested_filename: Some(super::naming::sanitize(&file_name)),
        available_quantizations: None,
        selected_quantization: None,
        updated_at: chrono::Utc::now(),
    })
}

/// Rewrite a repo host's `/{owner}/{repo}/blob/{rev}/{path}` page URL into
/// its `repo://` equivalent (§6.1 normalization).
pub fn normalize_page_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let segments: Vec<&str> = parsed.path_segments()?.collect();
    let blob_at = segments.iter().position(|s| *s == "blob")?;
    if blob_at < 2 || blob_at + 1 >= segments.len() {
        return None;
    }
    let owner = segments[blob_at - 2];
    let repo = segments[blob_at - 1];
    let rev = segments[blob_at + 1];
    let path = segments[blob_at + 2..].join("/");
    if owner.is_empty() || repo.is_empty() || path.is_empty() {
        return None;
    }
    Some(format!("repo://{owner}/{repo}/{path}?rev={rev}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> SourceConfig {
        SourceConfig { enabled: true, token_env: None, base_url: "https://example-hub.test".to_string(), naming: Default::default() }
    }

    #[tokio::test]
    async fn resolves_with_explicit_revision() {
        let entry = resolve("repo://acme/model/weights.safetensors?rev=v2", &source()).await.unwrap();
        assert_eq!(entry.url, "https://example-hub.test/acme/model/resolve/v2/weights.safetensors");
        assert_eq!(entry.file_name.as_deref(), Some("weights.safetensors"));
    }

    #[tokio::test]
    async fn defaults_revision_to_main() {
        let entry = resolve("repo://acme/model/weights.safetensors", &source()).await.unwrap();
        assert!(entry.url.contains("/resolve/main/"));
    }

    #[test]
    fn rejects_malformed_uri() {
        assert!(parse("repo://acme").is_none());
    }

    #[test]
    fn normalizes_blob_page_url() {
        let normalized = normalize_page_url("https://example-hub.test/acme/model/blob/v2/sub/weights.safetensors").unwrap();
        assert_eq!(normalized, "repo://acme/model/sub/weights.safetensors?rev=v2");
    }
}
