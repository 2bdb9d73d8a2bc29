//! PyPI packages via the JSON API (`{api}/{name}/json`).
//!
//! PyPI metadata carries no source code, so packages harvested here are
//! classified UNKNOWN until their repository is harvested as well.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::config::Config;
use crate::error::{FetchError, ParseError};
use crate::models::{Contributor, DependencyType, HostType, Server};

use super::http_client::HttpClient;
use super::manifest;
use super::{
    assess, invalid_url, non_blank, optional_str, parse_timestamp, required_str, strip_scheme,
    RawPayload, SourceAdapter,
};

pub struct PypiAdapter {
    http: HttpClient,
    api_base: String,
}

impl PypiAdapter {
    pub fn new(config: &Config) -> Result<Self, FetchError> {
        Ok(Self::with_client(
            HttpClient::new(&config.http, None)?,
            &config.sources.pypi_api,
        ))
    }

    pub fn with_client(http: HttpClient, api_base: &str) -> Self {
        Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }
}

/// Project name from `pypi:{name}` or `https://pypi.org/project/{name}/`.
pub fn parse_project_url(url: &str) -> Result<String, FetchError> {
    let stripped = strip_scheme(url);
    let rest = stripped
        .strip_prefix("pypi:")
        .or_else(|| stripped.strip_prefix("pypi.org/project/"))
        .ok_or_else(|| {
            invalid_url(
                HostType::Pypi,
                url,
                "expected pypi:{name} or pypi.org/project/{name}",
            )
        })?;
    let name = rest.split('/').next().unwrap_or_default();
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(invalid_url(HostType::Pypi, url, "invalid project name"));
    }
    Ok(name.to_string())
}

fn has_license(info: &Value) -> bool {
    if optional_str(info, "license").is_some() || optional_str(info, "license_expression").is_some()
    {
        return true;
    }
    info.get("classifiers")
        .and_then(Value::as_array)
        .is_some_and(|cs| {
            cs.iter()
                .filter_map(Value::as_str)
                .any(|c| c.starts_with("License ::"))
        })
}

/// Newest upload time across the release files of the current version.
fn last_upload(doc: &Value) -> Option<chrono::DateTime<Utc>> {
    doc.get("urls")?
        .as_array()?
        .iter()
        .filter_map(|u| parse_timestamp(u.get("upload_time_iso_8601")))
        .max()
}

#[async_trait]
impl SourceAdapter for PypiAdapter {
    fn host_type(&self) -> HostType {
        HostType::Pypi
    }

    fn description(&self) -> &str {
        "PyPI projects via the JSON API"
    }

    async fn fetch(&self, url: &str) -> Result<RawPayload, FetchError> {
        let name = parse_project_url(url)?;
        let document = self
            .http
            .get_json(&format!("{}/{}/json", self.api_base, name))
            .await?;

        let mut payload = RawPayload::new(url, HostType::Pypi, document);
        payload.readme = payload
            .document
            .get("info")
            .and_then(|info| optional_str(info, "description"));
        payload.fetched_at = Utc::now();
        Ok(payload)
    }

    fn parse(&self, payload: &RawPayload) -> Result<Server, ParseError> {
        parse_payload(payload)
    }
}

pub(crate) fn parse_payload(payload: &RawPayload) -> Result<Server, ParseError> {
    let info = payload
        .document
        .get("info")
        .filter(|i| i.is_object())
        .ok_or_else(|| ParseError::MissingField("info".to_string()))?;
    let name = required_str(info, "name")?;

    let mut server = Server::new(name, &payload.url, HostType::Pypi, payload.fetched_at);
    server.description = optional_str(info, "summary");
    server.has_readme = non_blank(&payload.readme);
    server.has_license = has_license(info);
    server.last_activity_at = last_upload(&payload.document);

    if let Some(requires) = info.get("requires_dist").and_then(Value::as_array) {
        server.dependencies = requires
            .iter()
            .filter_map(Value::as_str)
            .filter_map(|spec| manifest::requirement_to_dependency(spec, DependencyType::Runtime))
            .collect();
    }
    server.has_tests = server
        .dependencies
        .iter()
        .any(|d| d.dependency_type == DependencyType::Dev && d.name.starts_with("pytest"));

    let mut people: Vec<String> = Vec::new();
    for key in ["author", "maintainer"] {
        if let Some(person) = optional_str(info, key) {
            if !people.contains(&person) {
                people.push(person);
            }
        }
    }
    server.contributors = people
        .into_iter()
        .map(|login| Contributor {
            login,
            contributions: 1,
        })
        .collect();

    assess(&mut server, &payload.files, None, payload.fetched_at);
    Ok(server)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RiskLevel;
    use serde_json::json;

    fn document() -> Value {
        json!({
            "info": {
                "name": "mcp-server-fetch",
                "summary": "Fetch web content",
                "description": "# mcp-server-fetch\n\nLong readme",
                "license": "",
                "classifiers": ["License :: OSI Approved :: MIT License"],
                "author": "Acme",
                "maintainer": "Acme",
                "requires_dist": [
                    "httpx<0.28",
                    "markdownify>=0.13.1",
                    "pytest>=8; extra == \"dev\"",
                    "sphinx; extra == \"docs\""
                ]
            },
            "urls": [
                {"upload_time_iso_8601": "2026-02-01T10:00:00.000000Z"},
                {"upload_time_iso_8601": "2026-02-03T10:00:00.000000Z"}
            ]
        })
    }

    #[test]
    fn test_parse_project_url_forms() {
        assert_eq!(parse_project_url("pypi:mcp-server-git").unwrap(), "mcp-server-git");
        assert_eq!(
            parse_project_url("https://pypi.org/project/mcp-server-git/").unwrap(),
            "mcp-server-git"
        );
        assert_eq!(
            parse_project_url("https://pypi.org/project/mcp/1.2.0/").unwrap(),
            "mcp"
        );
        assert!(parse_project_url("pypi:").is_err());
        assert!(parse_project_url("https://npmjs.com/package/x").is_err());
    }

    #[test]
    fn test_parse_info() {
        let mut p = RawPayload::new("pypi:mcp-server-fetch", HostType::Pypi, document());
        p.readme = Some("# readme".to_string());
        let server = parse_payload(&p).unwrap();

        assert_eq!(server.name, "mcp-server-fetch");
        assert_eq!(server.description.as_deref(), Some("Fetch web content"));
        assert!(server.has_license);
        assert!(server.has_readme);
        assert!(server.has_tests);
        let names: Vec<&str> = server.dependencies.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["httpx", "markdownify", "pytest"]);
        assert_eq!(server.contributors.len(), 1);
        assert_eq!(
            server.last_activity_at.unwrap().to_rfc3339(),
            "2026-02-03T10:00:00+00:00"
        );
        assert_eq!(server.risk_level, RiskLevel::Unknown);
        assert!(!server.risk_analyzed);
    }

    #[test]
    fn test_missing_info_is_parse_error() {
        let p = RawPayload::new("pypi:x", HostType::Pypi, json!({"urls": []}));
        assert!(matches!(parse_payload(&p), Err(ParseError::MissingField(f)) if f == "info"));
    }
}
