//! Configuration surface the core engine recognizes (spec §6.5).
//!
//! Parsing these structs out of a YAML (or any other) file is a collaborator
//! concern (§1) — the engine only consumes an already-built [`Config`]. Every
//! struct here derives [`serde::Deserialize`] so a caller's own config layer
//! can populate it directly, and [`Default`] with the values implied by the
//! prose throughout §4.

use std::path::PathBuf;

use serde::Deserialize;

/// Root configuration consumed by [`crate::engine::Engine`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding `state.db` and `resolver-cache.json`.
    pub data_root: PathBuf,
    /// Directory published artifacts are renamed into by default.
    pub download_root: PathBuf,
    /// Directory staging `.part` files live under when `stage_partials` is set.
    pub partials_root: Option<PathBuf>,
    /// Stage to `<partials_root>/<hash>.part` rather than `<dest>.part`.
    pub stage_partials: bool,
    /// Force every download to restart from zero, ignoring any resumable state.
    pub always_no_resume: bool,
    /// Call `recover_running_on_start` automatically when the engine is constructed.
    pub auto_recover_on_start: bool,

    pub network: NetworkConfig,
    pub concurrency: ConcurrencyConfig,
    pub resolver: ResolverConfig,
    pub sources: SourcesConfig,
    pub validation: ValidationConfig,
    pub general: GeneralConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("."),
            download_root: PathBuf::from("."),
            partials_root: None,
            stage_partials: true,
            always_no_resume: false,
            auto_recover_on_start: true,
            network: NetworkConfig::default(),
            concurrency: ConcurrencyConfig::default(),
            resolver: ResolverConfig::default(),
            sources: SourcesConfig::default(),
            validation: ValidationConfig::default(),
            general: GeneralConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub timeout_seconds: u64,
    pub max_redirects: u32,
    pub tls_verify: bool,
    pub user_agent: Option<String>,
    pub retry_on_rate_limit: bool,
    pub rate_limit_max_delay_seconds: u64,
    pub disable_auth_preflight: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            max_redirects: 10,
            tls_verify: true,
            user_agent: None,
            retry_on_rate_limit: true,
            rate_limit_max_delay_seconds: 120,
            disable_auth_preflight: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub global_files: usize,
    pub per_file_chunks: usize,
    pub per_host_requests: usize,
    pub chunk_size_mb: u64,
    pub max_retries: u32,
    pub backoff: BackoffConfig,
    /// Global outgoing byte-rate ceiling metered across all downloads.
    /// `None` means unmetered (spec §4.6 "a global token bucket... meters
    /// outgoing bytes"; the rate itself isn't in the distilled config
    /// surface, so it defaults to unset).
    pub max_bytes_per_second: Option<u32>,
    /// Per-download byte-rate ceiling, metered independently of the global one.
    pub max_bytes_per_second_per_download: Option<u32>,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            global_files: 3,
            per_file_chunks: 4,
            per_host_requests: 4,
            chunk_size_mb: 4,
            max_retries: 5,
            backoff: BackoffConfig::default(),
            max_bytes_per_second: None,
            max_bytes_per_second_per_download: None,
        }
    }
}

impl ConcurrencyConfig {
    pub fn chunk_size_bytes(&self) -> u64 {
        self.chunk_size_mb * 1024 * 1024
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_interval_ms: u64,
    pub multiplier: f64,
    pub max_interval_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { initial_interval_ms: 500, multiplier: 2.0, max_interval_ms: 30_000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    pub cache_ttl_hours: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self { cache_ttl_hours: 24 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub repo: SourceConfig,
    pub registry: SourceConfig,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            repo: SourceConfig {
                enabled: true,
                token_env: Some("HF_TOKEN".to_string()),
                base_url: "https://huggingface.co".to_string(),
                naming: NamingConfig::default(),
            },
            registry: SourceConfig {
                enabled: true,
                token_env: Some("CIVITAI_TOKEN".to_string()),
                base_url: "https://civitai.com".to_string(),
                naming: NamingConfig::default(),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub enabled: bool,
    pub token_env: Option<String>,
    /// Origin the source's URIs resolve against, e.g. `https://huggingface.co`
    /// for `repo://` or `https://civitai.com` for `registry://`.
    pub base_url: String,
    pub naming: NamingConfig,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self { enabled: true, token_env: None, base_url: String::new(), naming: NamingConfig::default() }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct NamingConfig {
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub require_sha256: bool,
    pub accept_md5_sha1_if_provided: bool,
    pub safetensors_deep_verify_after_download: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            require_sha256: false,
            accept_md5_sha1_if_provided: true,
            safetensors_deep_verify_after_download: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub quarantine: bool,
    pub allow_overwrite: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self { quarantine: false, allow_overwrite: false }
    }
}
