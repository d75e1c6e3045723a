//! Shared HTTP(S) client construction, based on async `reqwest` over Tokio.

use std::time::Duration;

use reqwest::{Client, ClientBuilder};

use crate::config::NetworkConfig;

/// The default user agent used when `network.user_agent` is left unset.
pub const DEFAULT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Build a `reqwest::Client` honoring the subset of `network.*` options that
/// apply process-wide: user agent, redirect cap, connect/read timeouts and
/// TLS verification.
pub fn build_client(cfg: &NetworkConfig) -> reqwest::Result<Client> {
    builder(cfg).build()
}

/// Return a client builder pre-configured from `cfg`, left open for callers
/// that need to layer on test-only settings (e.g. pointing at a mock server).
pub fn builder(cfg: &NetworkConfig) -> ClientBuilder {
    let user_agent = cfg.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT);

    let mut builder = Client::builder()
        .user_agent(user_agent)
        .connect_timeout(Duration::from_secs(cfg.timeout_seconds))
        .timeout(Duration::from_secs(cfg.timeout_seconds.saturating_mul(4)))
        .redirect(reqwest::redirect::Policy::limited(cfg.max_redirects as usize));

    if !cfg.tls_verify {
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder
}
