//! Self-hosted JSON manifests served over HTTP(S).
//!
//! The document at the URL describes one server:
//!
//! ```json
//! {
//!   "name": "inventory",
//!   "description": "Warehouse lookups",
//!   "repository": "https://git.example.com/inventory",
//!   "license": "Apache-2.0",
//!   "updated_at": "2026-03-01T00:00:00Z",
//!   "readme": "...",
//!   "tools": [{"name": "lookup", "inputSchema": {}}],
//!   "dependencies": {"zod": "^3"},
//!   "devDependencies": {"vitest": "^1"},
//!   "source_files": [{"path": "src/index.ts", "content": "..."}]
//! }
//! ```
//!
//! Embedded `source_files` feed the risk analyzer; the remainder of the
//! document is analyzed as the manifest.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::config::Config;
use crate::error::{FetchError, ParseError};
use crate::models::{Dependency, DependencyType, HostType, Server};
use crate::risk::{looks_like_test_path, SourceFile};

use super::http_client::HttpClient;
use super::manifest;
use super::{
    assess, invalid_url, non_blank, optional_str, parse_timestamp, required_str, ManifestFile,
    RawPayload, SourceAdapter,
};

pub struct HttpManifestAdapter {
    http: HttpClient,
    max_files: usize,
}

impl HttpManifestAdapter {
    pub fn new(config: &Config) -> Result<Self, FetchError> {
        Ok(Self::with_client(
            HttpClient::new(&config.http, None)?,
            config.analysis.max_files,
        ))
    }

    pub fn with_client(http: HttpClient, max_files: usize) -> Self {
        Self { http, max_files }
    }
}

fn check_url(url: &str) -> Result<(), FetchError> {
    let trimmed = url.trim();
    let rest = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .ok_or_else(|| invalid_url(HostType::Http, url, "expected an http(s) URL"))?;
    if rest.is_empty() || rest.starts_with('/') {
        return Err(invalid_url(HostType::Http, url, "missing host"));
    }
    Ok(())
}

/// Split embedded source files from the rest of the document.
fn split_sources(document: &Value, max_files: usize) -> (Vec<SourceFile>, Value) {
    let mut rest = document.clone();
    let files = rest
        .as_object_mut()
        .and_then(|obj| obj.remove("source_files"))
        .and_then(|v| v.as_array().cloned())
        .unwrap_or_default()
        .iter()
        .filter_map(|f| {
            Some(SourceFile {
                path: f.get("path")?.as_str()?.to_string(),
                content: f.get("content")?.as_str()?.to_string(),
            })
        })
        .take(max_files)
        .collect();
    (files, rest)
}

fn map_dependencies(doc: &Value, keys: &[&str], dependency_type: DependencyType) -> Vec<Dependency> {
    let mut deps = Vec::new();
    for key in keys {
        if let Some(map) = doc.get(*key).and_then(Value::as_object) {
            for (name, constraint) in map {
                deps.push(Dependency {
                    name: name.clone(),
                    version_constraint: constraint.as_str().map(str::to_string),
                    dependency_type,
                });
            }
        }
    }
    deps
}

#[async_trait]
impl SourceAdapter for HttpManifestAdapter {
    fn host_type(&self) -> HostType {
        HostType::Http
    }

    fn description(&self) -> &str {
        "JSON server manifests over HTTP(S)"
    }

    async fn fetch(&self, url: &str) -> Result<RawPayload, FetchError> {
        check_url(url)?;
        let document = self.http.get_json(url).await?;
        if !document.is_object() {
            return Err(FetchError::Decode {
                url: url.to_string(),
                reason: "manifest is not a JSON object".to_string(),
            });
        }

        let (files, rest) = split_sources(&document, self.max_files);
        let manifest = serde_json::to_string_pretty(&rest)
            .ok()
            .map(|content| ManifestFile {
                name: "manifest.json".to_string(),
                content,
            });

        let mut payload = RawPayload::new(url, HostType::Http, rest);
        payload.readme = optional_str(&payload.document, "readme");
        payload.files = files;
        payload.manifest = manifest;
        payload.fetched_at = Utc::now();
        Ok(payload)
    }

    fn parse(&self, payload: &RawPayload) -> Result<Server, ParseError> {
        parse_payload(payload)
    }
}

pub(crate) fn parse_payload(payload: &RawPayload) -> Result<Server, ParseError> {
    let doc = &payload.document;
    if !doc.is_object() {
        return Err(ParseError::Malformed(
            "manifest is not a JSON object".to_string(),
        ));
    }
    let name = required_str(doc, "name")?;

    let mut server = Server::new(name, &payload.url, HostType::Http, payload.fetched_at);
    server.description = optional_str(doc, "description");
    server.has_readme = non_blank(&payload.readme);
    server.has_license = optional_str(doc, "license").is_some();
    server.has_tests = payload.files.iter().any(|f| looks_like_test_path(&f.path));
    server.last_activity_at = parse_timestamp(doc.get("updated_at"));

    let mut deps = map_dependencies(doc, &["dependencies"], DependencyType::Runtime);
    deps.extend(map_dependencies(
        doc,
        &["dev_dependencies", "devDependencies"],
        DependencyType::Dev,
    ));
    server.dependencies = deps;

    let mut tools = manifest::tools_from_json(doc);
    tools.extend(manifest::tools_from_source(&payload.files));
    server.tools = manifest::dedup_tools(tools);

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
    use crate::models::RiskLevel;
    use serde_json::json;

    fn document() -> Value {
        json!({
            "name": "inventory",
            "description": "Warehouse lookups",
            "license": "Apache-2.0",
            "updated_at": "2026-03-01T00:00:00Z",
            "readme": "# Inventory",
            "tools": [{"name": "lookup", "description": "Find an item", "inputSchema": {"type": "object"}}],
            "dependencies": {"zod": "^3"},
            "devDependencies": {"vitest": "^1"},
            "source_files": [
                {"path": "src/index.ts", "content": "import { execSync } from 'child_process';\nserver.tool(\"restock\", \"Restock\", {}, h);\n"},
                {"path": "src/index.test.ts", "content": "test('x', () => {});\n"}
            ]
        })
    }

    fn payload(max_files: usize) -> RawPayload {
        let (files, rest) = split_sources(&document(), max_files);
        let mut p = RawPayload::new("https://mcp.example.com/manifest.json", HostType::Http, rest);
        p.readme = optional_str(&p.document, "readme");
        p.manifest = Some(ManifestFile {
            name: "manifest.json".to_string(),
            content: serde_json::to_string_pretty(&p.document).unwrap(),
        });
        p.files = files;
        p
    }

    #[test]
    fn test_check_url() {
        assert!(check_url("https://mcp.example.com/manifest.json").is_ok());
        assert!(check_url("http://localhost:8080/").is_ok());
        assert!(check_url("ftp://example.com/x").is_err());
        assert!(check_url("https:///nohost").is_err());
    }

    #[test]
    fn test_split_sources_caps_file_count() {
        let (files, rest) = split_sources(&document(), 1);
        assert_eq!(files.len(), 1);
        assert!(rest.get("source_files").is_none());
        assert_eq!(rest["name"], "inventory");
    }

    #[test]
    fn test_parse_manifest() {
        let server = parse_payload(&payload(10)).unwrap();
        assert_eq!(server.name, "inventory");
        assert!(server.has_license);
        assert!(server.has_readme);
        assert!(server.has_tests);
        assert_eq!(server.dependencies.len(), 2);
        let tool_names: Vec<&str> = server.tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(tool_names, vec!["lookup", "restock"]);
        assert_eq!(server.risk_level, RiskLevel::High);
    }

    #[test]
    fn test_non_object_is_malformed() {
        let p = RawPayload::new("https://x.example/m.json", HostType::Http, json!([1, 2]));
        assert!(matches!(parse_payload(&p), Err(ParseError::Malformed(_))));
    }
}
