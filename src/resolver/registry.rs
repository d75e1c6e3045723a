//! `registry://model/{id}[?version={vid}][&file={substring}]` resolution
//! (spec §4.3, §6.1).

use reqwest::Client;
use serde::Deserialize;

use super::cache::CacheEntry;
use super::naming::{self, Tokens};
use crate::config::SourceConfig;
use crate::error::{Error, Result};

pub fn can_handle(uri: &str) -> bool {
    uri.starts_with("registry://model/")
}

struct Query {
    model_id: String,
    version_id: Option<String>,
    file_substring: Option<String>,
}

fn parse(uri: &str) -> Option<Query> {
    let rest = uri.strip_prefix("registry://model/")?;
    let (model_id, query) = match rest.split_once('?') {
        Some((m, q)) => (m, Some(q)),
        None => (rest, None),
    };
    if model_id.is_empty() {
        return None;
    }

    let mut version_id = None;
    let mut file_substring = None;
    if let Some(query) = query {
        for (k, v) in url::form_urlencoded::parse(query.as_bytes()) {
            match k.as_ref() {
                "version" => version_id = Some(v.into_owned()),
                "file" => file_substring = Some(v.into_owned()),
                _ => {}
            }
        }
    }

    Some(Query { model_id: model_id.to_string(), version_id, file_substring })
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    id: u64,
    name: String,
    #[serde(default, rename = "modelName")]
    model_name: Option<String>,
    files: Vec<RegistryFile>,
}

#[derive(Debug, Deserialize)]
struct ModelResponse {
    name: String,
    #[serde(rename = "modelVersions")]
    model_versions: Vec<VersionResponse>,
}

#[derive(Debug, Clone, Deserialize)]
struct RegistryFile {
    name: String,
    #[serde(default)]
    primary: bool,
    #[serde(default, rename = "type")]
    file_type: Option<String>,
    #[serde(rename = "downloadUrl")]
    download_url: String,
}

/// Select a file from the candidates per §4.3: substring match, else
/// `primary=true`, else `type=Model`, else the first entry.
fn select_file<'a>(files: &'a [RegistryFile], substring: Option<&str>) -> Option<&'a RegistryFile> {
    if let Some(substring) = substring {
        if let Some(found) = files.iter().find(|f| f.name.contains(substring)) {
            return Some(found);
        }
    }
    files
        .iter()
        .find(|f| f.primary)
        .or_else(|| files.iter().find(|f| f.file_type.as_deref() == Some("Model")))
        .or_else(|| files.first())
}

pub async fn resolve(uri: &str, source: &SourceConfig, http: &Client) -> Result<CacheEntry> {
    let query = parse(uri).ok_or(Error::Resolver { status: None })?;
    let base = source.base_url.trim_end_matches('/');

    let (version, model_name_from_listing) = match &query.version_id {
        Some(version_id) => (fetch_version(http, base, version_id).await?, None),
        None => {
            let model = fetch_model(http, base, &query.model_id).await?;
            let version = model.model_versions.into_iter().next().ok_or(Error::Resolver { status: None })?;
            (version, Some(model.name))
        }
    };

    let available_quantizations: Vec<String> = version.files.iter().map(|f| f.name.clone()).collect();
    let selected = select_file(&version.files, query.file_substring.as_deref()).ok_or(Error::Resolver { status: None })?;

    let model_name = version.model_name.clone().or(model_name_from_listing).unwrap_or(query.model_id.clone());
    let tokens = Tokens {
        model_name: Some(model_name.clone()),
        version_name: Some(version.name.clone()),
        version_id: Some(version.id.to_string()),
        file_name: Some(selected.name.clone()),
        file_type: selected.file_type.clone(),
    };

    let expanded = match &source.naming.pattern {
        Some(pattern) => naming::pattern_expand(pattern, &tokens),
        None => naming::default_pattern_expand(&tokens),
    };
    let suggested_filename = naming::slugify(&naming::sanitize(&expanded));

    Ok(CacheEntry {
        url: selected.download_url.clone(),
        model_name: Some(model_name),
        version_name: Some(version.name),
        version_id: Some(version.id.to_string()),
        file_name: Some(selected.name.clone()),
        file_type: selected.file_type.clone(),
        suggested_filename: Some(suggested_filename),
        available_quantizations: Some(available_quantizations),
        selected_quantization: Some(selected.name.clone()),
        updated_at: chrono::Utc::now(),
    })
}

async fn fetch_version(http: &Client, base: &str, version_id: &str) -> Result<VersionResponse> {
    let response = http
        .get(format!("{base}/api/v1/model-versions/{version_id}"))
        .send()
        .await
        .map_err(|e| Error::new_reqwest(e, "resolver::registry::fetch_version"))?;
    deserialize_response(response).await
}

async fn fetch_model(http: &Client, base: &str, model_id: &str) -> Result<ModelResponse> {
    let response = http
        .get(format!("{base}/api/v1/models/{model_id}"))
        .send()
        .await
        .map_err(|e| Error::new_reqwest(e, "resolver::registry::fetch_model"))?;
    deserialize_response(response).await
}

async fn deserialize_response<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        return Err(Error::Resolver { status: Some(status.as_u16()) });
    }
    let bytes = response.bytes().await.map_err(|e| Error::new_reqwest(e, "resolver::registry::body"))?;
    let mut deserializer = serde_json::Deserializer::from_slice(&bytes);
    serde_path_to_error::deserialize(&mut deserializer).map_err(|e| Error::ResolverParse(Box::new(e)))
}

/// Rewrite a registry host's `/models/{id}[?modelVersionId=vid]` page URL
/// into its `registry://` equivalent (§6.1 normalization).
pub fn normalize_page_url(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segments: Vec<&str> = parsed.path_segments()?.collect();
    let models_at = segments.iter().position(|s| *s == "models")?;
    let id = segments.get(models_at + 1)?;
    if id.is_empty() {
        return None;
    }
    let version = parsed.query_pairs().find(|(k, _)| k == "modelVersionId").map(|(_, v)| v.into_owned());
    Some(match version {
        Some(v) => format!("registry://model/{id}?version={v}"),
        None => format!("registry://model/{id}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    fn source(base: &str) -> SourceConfig {
        SourceConfig { enabled: true, token_env: None, base_url: base.to_string(), naming: Default::default() }
    }

    #[tokio::test]
    async fn resolves_by_explicit_version_and_file_substring() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/v1/model-versions/42")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"id":42,"name":"v1","modelName":"DreamSDXL","files":[
                    {"name":"unet_fp16.safetensors","primary":true,"type":"Model","downloadUrl":"https://cdn/unet"},
                    {"name":"vae_fp16.safetensors","primary":false,"type":"VAE","downloadUrl":"https://cdn/vae"}
                ]}"#,
            )
            .create_async()
            .await;

        let http = Client::new();
        let entry = resolve("registry://model/123?version=42&file=vae", &source(&server.url()), &http).await.unwrap();
        assert_eq!(entry.url, "https://cdn/vae");
        assert_eq!(entry.selected_quantization.as_deref(), Some("vae_fp16.safetensors"));
        assert_eq!(entry.available_quantizations.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn falls_back_to_primary_file_when_no_substring_matches() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/api/v1/model-versions/42")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"id":42,"name":"v1","modelName":"DreamSDXL","files":[
                    {"name":"unet_fp16.safetensors","primary":true,"type":"Model","downloadUrl":"https://cdn/unet"}
                ]}"#,
            )
            .create_async()
            .await;

        let http = Client::new();
        let entry = resolve("registry://model/123?version=42", &source(&server.url()), &http).await.unwrap();
        assert_eq!(entry.url, "https://cdn/unet");
    }

    #[tokio::test]
    async fn non_success_status_is_resolver_error_with_status() {
        let mut server = Server::new_async().await;
        let _mock = server.mock("GET", "/api/v1/model-versions/42").with_status(404).create_async().await;

        let http = Client::new();
        let err = resolve("registry://model/123?version=42", &source(&server.url()), &http).await.unwrap_err();
        match err {
            Error::Resolver { status } => assert_eq!(status, Some(404)),
            other => panic!("expected Resolver error, got {other:?}"),
        }
    }

    #[test]
    fn normalizes_models_page_url_with_version() {
        let normalized = normalize_page_url("https://registry.test/models/123?modelVersionId=42").unwrap();
        assert_eq!(normalized, "registry://model/123?version=42");
    }
}
