//! Turns source URIs into direct URLs, auth headers and metadata (spec §4.3,
//! §6.1). Resolution is a tagged-variant dispatch (§9 "Resolver variance
//! across sources") over `SourceKind`; new sources are added by extending
//! the variant, not by teaching the engine about source-specific fields.

pub mod cache;
pub mod naming;
pub mod registry;
pub mod repo;

use reqwest::Client;

use crate::config::{Config, SourceConfig};
use crate::error::{Error, Result};
use cache::{CacheEntry, ResolverCache};

/// The product of resolution: a concrete URL, headers, and metadata (spec §3).
#[derive(Debug, Clone)]
pub struct Resolved {
    pub url: String,
    /// `(name, value)` pairs; may include `Authorization`. Never persisted.
    pub headers: Vec<(String, String)>,
    pub model_name: Option<String>,
    pub version_name: Option<String>,
    pub version_id: Option<String>,
    pub file_name: Option<String>,
    pub file_type: Option<String>,
    pub suggested_filename: Option<String>,
    pub available_quantizations: Option<Vec<String>>,
    pub selected_quantization: Option<String>,
}

/// Which resolver variant a URI dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Repo,
    Registry,
    Direct,
}

pub fn classify(uri: &str) -> SourceKind {
    if repo::can_handle(uri) {
        SourceKind::Repo
    } else if registry::can_handle(uri) {
        SourceKind::Registry
    } else {
        SourceKind::Direct
    }
}

/// Rewrite a plain page URL into its `repo://`/`registry://` form if it
/// matches one of the two known host patterns (§6.1); otherwise unchanged.
pub fn normalize(uri: &str) -> String {
    repo::normalize_page_url(uri)
        .or_else(|| registry::normalize_page_url(uri))
        .unwrap_or_else(|| uri.to_string())
}

fn bearer_header(source: &SourceConfig) -> Vec<(String, String)> {
    if !source.enabled {
        return Vec::new();
    }
    match source.token_env.as_deref().and_then(|var| std::env::var(var).ok()) {
        Some(token) if !token.is_empty() => vec![("Authorization".to_string(), format!("Bearer {token}"))],
        _ => Vec::new(),
    }
}

fn entry_to_resolved(entry: CacheEntry, headers: Vec<(String, String)>) -> Resolved {
    Resolved {
        url: entry.url,
        headers,
        model_name: entry.model_name,
        version_name: entry.version_name,
        version_id: entry.version_id,
        file_name: entry.file_name,
        file_type: entry.file_type,
        suggested_filename: entry.suggested_filename,
        available_quantizations: entry.available_quantizations,
        selected_quantization: entry.selected_quantization,
    }
}

/// Resolve `uri` to a [`Resolved`] target, consulting and updating `cache`
/// for `repo://`/`registry://` sources. Plain HTTP(S) URIs resolve to
/// themselves with no caching and no headers.
pub async fn resolve(uri: &str, cfg: &Config, http: &Client, cache: &ResolverCache) -> Result<Resolved> {
    let uri = normalize(uri);

    match classify(&uri) {
        SourceKind::Direct => Ok(Resolved {
            url: uri,
            headers: Vec::new(),
            model_name: None,
            version_name: None,
            version_id: None,
            file_name: None,
            file_type: None,
            suggested_filename: None,
            available_quantizations: None,
            selected_quantization: None,
        }),
        SourceKind::Repo => {
            let source = &cfg.sources.repo;
            if let Some(entry) = cache.get(&uri) {
                return Ok(entry_to_resolved(entry, bearer_header(source)));
            }
            match repo::resolve(&uri, source).await {
                Ok(entry) => {
                    cache.put(&uri, entry.clone())?;
                    Ok(entry_to_resolved(entry, bearer_header(source)))
                }
                Err(e) => {
                    invalidate_on_not_found(&e, &uri, cache)?;
                    Err(e)
                }
            }
        }
        SourceKind::Registry => {
            let source = &cfg.sources.registry;
            if let Some(entry) = cache.get(&uri) {
                return Ok(entry_to_resolved(entry, bearer_header(source)));
            }
            match registry::resolve(&uri, source, http).await {
                Ok(entry) => {
                    cache.put(&uri, entry.clone())?;
                    Ok(entry_to_resolved(entry, bearer_header(source)))
                }
                Err(e) => {
                    invalidate_on_not_found(&e, &uri, cache)?;
                    Err(e)
                }
            }
        }
    }
}

fn invalidate_on_not_found(error: &Error, uri: &str, cache: &ResolverCache) -> Result<()> {
    if matches!(error, Error::Resolver { status: Some(404) }) {
        cache.invalidate(uri)?;
    }
    Ok(())
}
