//! npm registry packages.
//!
//! URL forms: `npm:{name}`, `npm:@scope/name` and
//! `https://www.npmjs.com/package/{name}`. The packument is fetched from
//! `{registry}/{name}` with the scope separator encoded as `%2F`.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::config::Config;
use crate::error::{FetchError, ParseError};
use crate::models::{Contributor, HostType, Server};

use super::http_client::HttpClient;
use super::manifest;
use super::{
    assess, invalid_url, non_blank, optional_str, parse_timestamp, required_str, strip_scheme,
    ManifestFile, RawPayload, SourceAdapter,
};

pub struct NpmAdapter {
    http: HttpClient,
    registry: String,
}

impl NpmAdapter {
    pub fn new(config: &Config) -> Result<Self, FetchError> {
        Ok(Self::with_client(
            HttpClient::new(&config.http, None)?,
            &config.sources.npm_registry,
        ))
    }

    pub fn with_client(http: HttpClient, registry: &str) -> Self {
        Self {
            http,
            registry: registry.trim_end_matches('/').to_string(),
        }
    }
}

/// Package name from an npm URL.
pub fn parse_package_url(url: &str) -> Result<String, FetchError> {
    let stripped = strip_scheme(url);
    let name = stripped
        .strip_prefix("npm:")
        .or_else(|| stripped.strip_prefix("npmjs.com/package/"))
        .ok_or_else(|| invalid_url(HostType::Npm, url, "expected npm:{name} or npmjs.com/package/{name}"))?;

    // Drop a trailing `/v/{version}` segment from web URLs.
    let name = match name.find("/v/") {
        Some(idx) => &name[..idx],
        None => name,
    };

    let valid = if let Some(scoped) = name.strip_prefix('@') {
        let mut parts = scoped.split('/');
        matches!((parts.next(), parts.next(), parts.next()), (Some(s), Some(n), None) if !s.is_empty() && !n.is_empty())
    } else {
        !name.is_empty() && !name.contains('/')
    };
    if !valid || name.chars().any(char::is_whitespace) {
        return Err(invalid_url(HostType::Npm, url, "invalid package name"));
    }
    Ok(name.to_string())
}

fn registry_path(name: &str) -> String {
    name.replace('/', "%2F")
}

/// The document of the `latest` dist-tag, falling back to the newest
/// version by publish time.
fn latest_version(packument: &Value) -> Option<&Value> {
    let versions = packument.get("versions")?.as_object()?;
    if let Some(tag) = packument
        .pointer("/dist-tags/latest")
        .and_then(Value::as_str)
    {
        if let Some(doc) = versions.get(tag) {
            return Some(doc);
        }
    }
    let times = packument.get("time");
    versions
        .iter()
        .max_by_key(|(v, _)| {
            times
                .and_then(|t| t.get(v.as_str()))
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string()
        })
        .map(|(_, doc)| doc)
}

fn has_test_script(version: &Value) -> bool {
    version
        .pointer("/scripts/test")
        .and_then(Value::as_str)
        .is_some_and(|s| !s.contains("no test specified") && !s.trim().is_empty())
}

#[async_trait]
impl SourceAdapter for NpmAdapter {
    fn host_type(&self) -> HostType {
        HostType::Npm
    }

    fn description(&self) -> &str {
        "npm packages via the public registry"
    }

    async fn fetch(&self, url: &str) -> Result<RawPayload, FetchError> {
        let name = parse_package_url(url)?;
        let packument = self
            .http
            .get_json(&format!("{}/{}", self.registry, registry_path(&name)))
            .await?;

        let manifest = latest_version(&packument).and_then(|doc| {
            serde_json::to_string_pretty(doc)
                .ok()
                .map(|content| ManifestFile {
                    name: "package.json".to_string(),
                    content,
                })
        });
        let readme = optional_str(&packument, "readme");

        Ok(RawPayload {
            url: url.to_string(),
            host_type: HostType::Npm,
            document: packument,
            files: Vec::new(),
            manifest,
            readme,
            fetched_at: Utc::now(),
        })
    }

    fn parse(&self, payload: &RawPayload) -> Result<Server, ParseError> {
        parse_payload(payload)
    }
}

pub(crate) fn parse_payload(payload: &RawPayload) -> Result<Server, ParseError> {
    let doc = &payload.document;
    let name = required_str(doc, "name")?;
    let latest = latest_version(doc);

    let mut server = Server::new(name, &payload.url, HostType::Npm, payload.fetched_at);
    server.description = optional_str(doc, "description")
        .or_else(|| latest.and_then(|v| optional_str(v, "description")));
    server.has_readme = non_blank(&payload.readme);
    server.has_license = optional_str(doc, "license")
        .or_else(|| latest.and_then(|v| optional_str(v, "license")))
        .is_some();
    server.last_activity_at = parse_timestamp(doc.pointer("/time/modified"));

    if let Some(version) = latest {
        server.dependencies = manifest::package_json_dependencies(version);
        server.has_tests = has_test_script(version);
        server.tools = manifest::dedup_tools(manifest::tools_from_json(version));
    }

    if let Some(maintainers) = doc.get("maintainers").and_then(Value::as_array) {
        server.contributors = maintainers
            .iter()
            .filter_map(|m| {
                let login = m
                    .get("name")
                    .or_else(|| m.get("email"))
                    .and_then(Value::as_str)?;
                Some(Contributor {
                    login: login.to_string(),
                    contributions: 1,
                })
            })
            .collect();
    }

    assess(
        &mut server,
        &payload.files,
        payload.manifest.as_ref().map(|m| m.content.as_str()),
        payload.fetched_at,
    );
    Ok(server)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DependencyType, RiskLevel};
    use serde_json::json;

    fn packument() -> Value {
        json!({
            "name": "@acme/mcp-files",
            "description": "File tools",
            "license": "MIT",
            "readme": "# mcp-files",
            "dist-tags": {"latest": "1.2.0"},
            "time": {"modified": "2026-01-10T00:00:00.000Z", "1.1.0": "2025-10-01T00:00:00Z", "1.2.0": "2026-01-10T00:00:00Z"},
            "maintainers": [{"name": "alice", "email": "a@example.com"}, {"email": "b@example.com"}],
            "versions": {
                "1.1.0": {"name": "@acme/mcp-files", "version": "1.1.0"},
                "1.2.0": {
                    "name": "@acme/mcp-files",
                    "version": "1.2.0",
                    "scripts": {"test": "vitest run"},
                    "dependencies": {"@modelcontextprotocol/sdk": "^1.0.0"},
                    "devDependencies": {"vitest": "^1.0.0"},
                    "tools": [{"name": "read_file", "description": "Read a file", "inputSchema": {"type": "object"}}]
                }
            }
        })
    }

    fn payload(doc: Value) -> RawPayload {
        let mut p = RawPayload::new("npm:@acme/mcp-files", HostType::Npm, doc);
        p.readme = optional_str(&p.document, "readme");
        p.manifest = latest_version(&p.document).map(|v| ManifestFile {
            name: "package.json".to_string(),
            content: serde_json::to_string_pretty(v).unwrap(),
        });
        p
    }

    #[test]
    fn test_parse_package_url_forms() {
        assert_eq!(parse_package_url("npm:left-pad").unwrap(), "left-pad");
        assert_eq!(parse_package_url("npm:@scope/pkg").unwrap(), "@scope/pkg");
        assert_eq!(
            parse_package_url("https://www.npmjs.com/package/@scope/pkg").unwrap(),
            "@scope/pkg"
        );
        assert_eq!(
            parse_package_url("https://www.npmjs.com/package/left-pad/v/1.3.0").unwrap(),
            "left-pad"
        );
        assert!(parse_package_url("npm:").is_err());
        assert!(parse_package_url("npm:a/b").is_err());
        assert!(parse_package_url("https://pypi.org/project/x").is_err());
    }

    #[test]
    fn test_registry_path_encodes_scope() {
        assert_eq!(registry_path("@scope/pkg"), "@scope%2Fpkg");
        assert_eq!(registry_path("left-pad"), "left-pad");
    }

    #[test]
    fn test_parse_latest_version() {
        let server = parse_payload(&payload(packument())).unwrap();
        assert_eq!(server.name, "@acme/mcp-files");
        assert!(server.has_license);
        assert!(server.has_readme);
        assert!(server.has_tests);
        assert_eq!(server.dependencies.len(), 2);
        assert_eq!(server.dependencies[1].dependency_type, DependencyType::Dev);
        assert_eq!(server.tools.len(), 1);
        assert_eq!(server.contributors.len(), 2);
        assert!(server.risk_analyzed);
        assert_eq!(server.risk_level, RiskLevel::Safe);
        assert!(server.last_activity_at.is_some());
    }

    #[test]
    fn test_latest_falls_back_to_newest_publish() {
        let mut doc = packument();
        doc["dist-tags"] = json!({});
        let latest = latest_version(&doc).unwrap();
        assert_eq!(latest["version"], "1.2.0");
    }

    #[test]
    fn test_default_test_script_is_not_a_test_suite() {
        let v = json!({"scripts": {"test": "echo \"Error: no test specified\" && exit 1"}});
        assert!(!has_test_script(&v));
    }

    #[test]
    fn test_missing_name_is_parse_error() {
        let p = RawPayload::new("npm:x", HostType::Npm, json!({"versions": {}}));
        assert!(matches!(parse_payload(&p), Err(ParseError::MissingField(_))));
    }
}
