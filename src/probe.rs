//! HEAD / 0-byte range preflight (spec §4.4).

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Method, StatusCode};

use crate::config::NetworkConfig;
use crate::error::{Error, Result};
use crate::resolver::Resolved;

#[derive(Debug, Clone, Default)]
pub struct ProbeResult {
    pub total_size: u64,
    pub supports_range: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub filename: Option<String>,
}

fn header_map(resolved: &Resolved) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for (name, value) in &resolved.headers {
        let name: reqwest::header::HeaderName =
            name.parse().map_err(|e: reqwest::header::InvalidHeaderName| Error::internal(e, "probe::header_name"))?;
        let value = HeaderValue::from_str(value).map_err(|e| Error::internal(e, "probe::header_value"))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

/// Preflight `resolved.url`. When `network.disable_auth_preflight` is set the
/// engine falls back to "unknown size, range unsupported" without a request.
pub async fn probe(http: &Client, resolved: &Resolved, cfg: &NetworkConfig) -> Result<ProbeResult> {
    if cfg.disable_auth_preflight {
        return Ok(ProbeResult::default());
    }

    let headers = header_map(resolved)?;

    let head_response = http
        .request(Method::HEAD, &resolved.url)
        .headers(headers.clone())
        .send()
        .await
        .map_err(|e| Error::new_reqwest(e, "probe::head"))?;

    if head_response.status() == StatusCode::METHOD_NOT_ALLOWED || head_response.status() == StatusCode::NOT_IMPLEMENTED {
        let range_response = http
            .request(Method::GET, &resolved.url)
            .headers(headers)
            .header("Range", "bytes=0-0")
            .send()
            .await
            .map_err(|e| Error::new_reqwest(e, "probe::range_fallback"))?;
        return extract(range_response).await;
    }

    extract(head_response).await
}

async fn extract(response: reqwest::Response) -> Result<ProbeResult> {
    let status = response.status();
    check_auth_and_rate_limit(status, response.headers())?;

    let supports_range_header = response
        .headers()
        .get("accept-ranges")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("bytes"))
        .unwrap_or(false);

    let content_range_total = response
        .headers()
        .get("content-range")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_range_total);

    let content_length = response
        .headers()
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    let total_size = content_range_total.or(content_length).unwrap_or(0);
    let supports_range = supports_range_header || status == StatusCode::PARTIAL_CONTENT;

    let etag = response.headers().get("etag").and_then(|v| v.to_str().ok()).map(str::to_string);
    let last_modified = response.headers().get("last-modified").and_then(|v| v.to_str().ok()).map(str::to_string);
    let filename = response
        .headers()
        .get("content-disposition")
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_disposition_filename);

    Ok(ProbeResult { total_size, supports_range, etag, last_modified, filename })
}

fn check_auth_and_rate_limit(status: StatusCode, headers: &HeaderMap) -> Result<()> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(Error::Auth { status: status.as_u16() });
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = headers.get("retry-after").and_then(|v| v.to_str().ok()).and_then(parse_retry_after);
        return Err(Error::RateLimited { retry_after });
    }
    Ok(())
}

/// Parse the upper bound out of a `Content-Range: bytes {start}-{end}/{total}` header.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let bytes_part = value.strip_prefix("bytes ")?;
    let total = bytes_part.rsplit('/').next()?;
    if total == "*" {
        return None;
    }
    total.parse().ok()
}

/// `Retry-After` may be delay-seconds or an HTTP-date (RFC 9110 §10.2.3).
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    if let Ok(seconds) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let when = chrono::DateTime::parse_from_rfc2822(value.trim()).ok()?;
    let now = chrono::Utc::now();
    (when.with_timezone(&chrono::Utc) - now).to_std().ok()
}

/// Extract a filename from `Content-Disposition`, preferring the RFC 5987
/// `filename*` extended parameter over the plain `filename` parameter.
fn parse_content_disposition_filename(value: &str) -> Option<String> {
    for part in value.split(';') {
        let part = part.trim();
        if let Some(encoded) = part.strip_prefix("filename*=") {
            if let Some(encoded) = encoded.strip_prefix("UTF-8''").or_else(|| encoded.strip_prefix("utf-8''")) {
                if let Ok(decoded) = percent_decode(encoded) {
                    return Some(decoded);
                }
            }
        }
    }
    for part in value.split(';') {
        let part = part.trim();
        if let Some(name) = part.strip_prefix("filename=") {
            return Some(name.trim_matches('"').to_string());
        }
    }
    None
}

fn percent_decode(s: &str) -> std::result::Result<String, std::string::FromUtf8Error> {
    let mut bytes = Vec::with_capacity(s.len());
    let mut chars = s.bytes();
    while let Some(b) = chars.next() {
        if b == b'%' {
            let hi = chars.next();
            let lo = chars.next();
            if let (Some(hi), Some(lo)) = (hi, lo) {
                if let Ok(byte) = u8::from_str_radix(&format!("{}{}", hi as char, lo as char), 16) {
                    bytes.push(byte);
                    continue;
                }
            }
        } else {
            bytes.push(b);
        }
    }
    String::from_utf8(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_retry_after_seconds() {
        assert_eq!(parse_retry_after("2"), Some(Duration::from_secs(2)));
    }

    #[test]
    fn parses_content_range_total() {
        assert_eq!(parse_content_range_total("bytes 0-0/10000000"), Some(10_000_000));
        assert_eq!(parse_content_range_total("bytes 0-0/*"), None);
    }

    #[test]
    fn parses_rfc5987_filename() {
        let header = "attachment; filename=\"plain.bin\"; filename*=UTF-8''vae%5Ffp16.safetensors";
        assert_eq!(parse_content_disposition_filename(header).as_deref(), Some("vae_fp16.safetensors"));
    }

    #[test]
    fn falls_back_to_plain_filename() {
        let header = "attachment; filename=\"plain.bin\"";
        assert_eq!(parse_content_disposition_filename(header).as_deref(), Some("plain.bin"));
    }
}
