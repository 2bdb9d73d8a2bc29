//! Docker Hub images.
//!
//! URL forms: `docker:{namespace}/{repo}`, `docker:{repo}` (official
//! `library` image), `https://hub.docker.com/r/{namespace}/{repo}` and
//! `https://hub.docker.com/_/{repo}`.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::config::Config;
use crate::error::{FetchError, ParseError};
use crate::models::{Contributor, HostType, Server};

use super::http_client::HttpClient;
use super::{
    assess, invalid_url, non_blank, optional_str, parse_timestamp, required_str, strip_scheme,
    RawPayload, SourceAdapter,
};

pub struct DockerHubAdapter {
    http: HttpClient,
    api_base: String,
}

impl DockerHubAdapter {
    pub fn new(config: &Config) -> Result<Self, FetchError> {
        Ok(Self::with_client(
            HttpClient::new(&config.http, None)?,
            &config.sources.docker_hub_api,
        ))
    }

    pub fn with_client(http: HttpClient, api_base: &str) -> Self {
        Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }
}

/// `(namespace, repository)` from an image URL.
pub fn parse_image_url(url: &str) -> Result<(String, String), FetchError> {
    let stripped = strip_scheme(url);
    let path = if let Some(rest) = stripped.strip_prefix("docker:") {
        rest.to_string()
    } else if let Some(rest) = stripped.strip_prefix("hub.docker.com/r/") {
        rest.to_string()
    } else if let Some(rest) = stripped.strip_prefix("hub.docker.com/_/") {
        format!("library/{}", rest)
    } else {
        return Err(invalid_url(
            HostType::Docker,
            url,
            "expected docker:{namespace}/{repo} or a hub.docker.com URL",
        ));
    };

    // Image tags are not part of the repository identity.
    let path = path.split(':').next().unwrap_or_default();
    let mut parts = path.split('/').filter(|p| !p.is_empty());
    let (namespace, repo) = match (parts.next(), parts.next()) {
        (Some(repo), None) => ("library", repo),
        (Some(namespace), Some(repo)) => (namespace, repo),
        _ => return Err(invalid_url(HostType::Docker, url, "missing repository name")),
    };

    let valid = |s: &str| {
        s.chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'))
    };
    if !valid(namespace) || !valid(repo) {
        return Err(invalid_url(HostType::Docker, url, "invalid image name"));
    }
    Ok((namespace.to_string(), repo.to_string()))
}

#[async_trait]
impl SourceAdapter for DockerHubAdapter {
    fn host_type(&self) -> HostType {
        HostType::Docker
    }

    fn description(&self) -> &str {
        "Docker Hub repositories"
    }

    async fn fetch(&self, url: &str) -> Result<RawPayload, FetchError> {
        let (namespace, repo) = parse_image_url(url)?;
        let document = self
            .http
            .get_json(&format!(
                "{}/repositories/{}/{}/",
                self.api_base, namespace, repo
            ))
            .await?;

        let mut payload = RawPayload::new(url, HostType::Docker, document);
        payload.readme = optional_str(&payload.document, "full_description");
        payload.fetched_at = Utc::now();
        Ok(payload)
    }

    fn parse(&self, payload: &RawPayload) -> Result<Server, ParseError> {
        parse_payload(payload)
    }
}

pub(crate) fn parse_payload(payload: &RawPayload) -> Result<Server, ParseError> {
    let doc = &payload.document;
    let name = required_str(doc, "name")?;
    let namespace = optional_str(doc, "namespace");

    let display = match namespace.as_deref() {
        Some(ns) if ns != "library" => format!("{}/{}", ns, name),
        _ => name.to_string(),
    };

    let mut server = Server::new(&display, &payload.url, HostType::Docker, payload.fetched_at);
    server.description = optional_str(doc, "description");
    server.stars = doc.get("star_count").and_then(Value::as_i64);
    server.has_readme = non_blank(&payload.readme);
    server.last_activity_at = parse_timestamp(doc.get("last_updated"));
    if let Some(owner) = optional_str(doc, "user").or(namespace) {
        server.contributors = vec![Contributor {
            login: owner,
            contributions: 1,
        }];
    }

    assess(&mut server, &payload.files, None, payload.fetched_at);
    Ok(server)
}
