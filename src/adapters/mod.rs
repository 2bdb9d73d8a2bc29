//! Source adapters.
//!
//! Every external source kind implements [`SourceAdapter`], a three-step
//! capability set: `fetch` retrieves raw data over the network, `parse`
//! normalises it into a [`Server`] (running the risk analyzer and the
//! health scorer), and `store` upserts it. The orchestrator picks the
//! adapter for a URL from an [`AdapterRegistry`], a lookup table keyed on
//! [`HostType`].
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │                 AdapterRegistry                  │
//! │  ┌────────┐ ┌─────┐ ┌──────┐ ┌────────┐ ┌──────┐ │
//! │  │ GitHub │ │ npm │ │ PyPI │ │ Docker │ │ HTTP │ │
//! │  └────────┘ └─────┘ └──────┘ └────────┘ └──────┘ │
//! └─────────────────────┬────────────────────────────┘
//!                       ▼
//!        fetch → parse → store (per attempt)
//! ```

pub mod docker;
pub mod github;
pub mod http;
pub mod http_client;
pub mod manifest;
pub mod npm;
pub mod pypi;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::config::Config;
use crate::error::{FetchError, ParseError, PersistenceError};
use crate::health::{self, HealthSignals};
use crate::models::{HostType, Server};
use crate::risk::{self, SourceFile};
use crate::store::CatalogStore;

pub use docker::DockerHubAdapter;
pub use github::GithubAdapter;
pub use http::HttpManifestAdapter;
pub use npm::NpmAdapter;
pub use pypi::PypiAdapter;

/// A manifest file retrieved alongside the main document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestFile {
    /// File name, e.g. `package.json`.
    pub name: String,
    pub content: String,
}

/// Raw data returned by [`SourceAdapter::fetch`].
#[derive(Debug, Clone, PartialEq)]
pub struct RawPayload {
    pub url: String,
    pub host_type: HostType,
    /// Source-specific JSON document(s).
    pub document: Value,
    /// Source files selected for static analysis.
    pub files: Vec<SourceFile>,
    pub manifest: Option<ManifestFile>,
    pub readme: Option<String>,
    /// Used as "now" by the health scorer.
    pub fetched_at: DateTime<Utc>,
}

impl RawPayload {
    pub fn new(url: &str, host_type: HostType, document: Value) -> Self {
        Self {
            url: url.to_string(),
            host_type,
            document,
            files: Vec::new(),
            manifest: None,
            readme: None,
            fetched_at: Utc::now(),
        }
    }
}

/// A harvestable source kind.
///
/// `fetch` must not touch the catalog; `parse` must be a pure function of
/// the payload; `store` is one transaction.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn host_type(&self) -> HostType;

    /// One-line description for logs and `harvester` output.
    fn description(&self) -> &str;

    async fn fetch(&self, url: &str) -> Result<RawPayload, FetchError>;

    fn parse(&self, payload: &RawPayload) -> Result<Server, ParseError>;

    async fn store(
        &self,
        store: &dyn CatalogStore,
        server: &Server,
        now: DateTime<Utc>,
    ) -> Result<Server, PersistenceError> {
        store.upsert_server(server, now).await
    }
}

/// Lookup table from source kind to adapter.
#[derive(Default, Clone)]
pub struct AdapterRegistry {
    adapters: HashMap<HostType, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in adapter configured from `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = Self::new();
        registry.register(Arc::new(
            GithubAdapter::new(config).context("Failed to build GitHub adapter")?,
        ));
        registry.register(Arc::new(
            NpmAdapter::new(config).context("Failed to build npm adapter")?,
        ));
        registry.register(Arc::new(
            PypiAdapter::new(config).context("Failed to build PyPI adapter")?,
        ));
        registry.register(Arc::new(
            DockerHubAdapter::new(config).context("Failed to build Docker Hub adapter")?,
        ));
        registry.register(Arc::new(
            HttpManifestAdapter::new(config).context("Failed to build HTTP adapter")?,
        ));
        Ok(registry)
    }

    /// Register an adapter, replacing any previous one for the same kind.
    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) {
        self.adapters.insert(adapter.host_type(), adapter);
    }

    pub fn get(&self, host_type: HostType) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(&host_type).cloned()
    }

    /// Registered kinds in declaration order.
    pub fn kinds(&self) -> Vec<HostType> {
        HostType::ALL
            .into_iter()
            .filter(|k| self.adapters.contains_key(k))
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Helpers shared by the adapters
// ═══════════════════════════════════════════════════════════════════════

/// Run the risk analyzer and health scorer, then hash the record.
pub(crate) fn assess(
    server: &mut Server,
    files: &[SourceFile],
    manifest: Option<&str>,
    now: DateTime<Utc>,
) {
    let report = risk::analyze(files, manifest);
    server.risk_level = report.level;
    server.risk_findings = report.findings;
    server.risk_analyzed = report.analyzed;
    server.health_score = health::score(&HealthSignals::from_server(server, now));
    server.content_hash = server.compute_content_hash();
}

/// Required non-empty string field.
pub(crate) fn required_str<'a>(doc: &'a Value, key: &str) -> Result<&'a str, ParseError> {
    doc.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ParseError::MissingField(key.to_string()))
}

/// Optional string field; blank strings count as absent.
pub(crate) fn optional_str(doc: &Value, key: &str) -> Option<String> {
    doc.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub(crate) fn parse_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    let s = value?.as_str()?;
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub(crate) fn non_blank(text: &Option<String>) -> bool {
    text.as_deref().is_some_and(|t| !t.trim().is_empty())
}

/// Strip scheme, `www.` and any query or fragment.
pub(crate) fn strip_scheme(url: &str) -> &str {
    let url = url.trim();
    let url = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    let url = url.strip_prefix("www.").unwrap_or(url);
    let end = url.find(['?', '#']).unwrap_or(url.len());
    url[..end].trim_end_matches('/')
}

pub(crate) fn invalid_url(kind: HostType, url: &str, reason: &str) -> FetchError {
    FetchError::InvalidUrl {
        kind,
        url: url.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strip_scheme() {
        assert_eq!(strip_scheme("https://www.github.com/a/b/"), "github.com/a/b");
        assert_eq!(strip_scheme("http://pypi.org/project/x?y=1#z"), "pypi.org/project/x");
        assert_eq!(strip_scheme("npm:left-pad"), "npm:left-pad");
    }

    #[test]
    fn test_field_helpers() {
        let doc = json!({"name": "  demo ", "blank": "   ", "when": "2026-01-02T03:04:05Z"});
        assert_eq!(required_str(&doc, "name").unwrap(), "demo");
        assert!(matches!(
            required_str(&doc, "blank"),
            Err(ParseError::MissingField(f)) if f == "blank"
        ));
        assert_eq!(optional_str(&doc, "blank"), None);
        assert!(parse_timestamp(doc.get("when")).is_some());
        assert!(parse_timestamp(doc.get("name")).is_none());
    }

    #[test]
    fn test_registry_from_config_covers_all_kinds() {
        let config = Config::with_db_path("/tmp/unused.sqlite");
        let registry = AdapterRegistry::from_config(&config).unwrap();
        assert_eq!(registry.kinds(), HostType::ALL.to_vec());
        for kind in HostType::ALL {
            assert_eq!(registry.get(kind).unwrap().host_type(), kind);
        }
    }
}
