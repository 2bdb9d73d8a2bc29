//! GitHub repositories.
//!
//! Accepts `https://github.com/{owner}/{repo}` (with or without `.git` or a
//! trailing path) and `github:{owner}/{repo}`. A fetch issues, in order:
//!
//! | Request | Used for |
//! |---------|----------|
//! | `GET /repos/{o}/{r}` | name, description, stars, forks, issues, license, last push |
//! | `GET /repos/{o}/{r}/readme` | README presence |
//! | `GET /repos/{o}/{r}/contributors` | contributors and bus factor |
//! | `GET /repos/{o}/{r}/git/trees/{branch}?recursive=1` | file listing, test detection |
//! | `GET /repos/{o}/{r}/contents/{path}` | manifest and selected source files |

use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use reqwest::Url;
use serde_json::{json, Value};

use crate::config::{AnalysisConfig, Config};
use crate::error::{FetchError, ParseError};
use crate::models::{Contributor, HostType, Server};
use crate::risk::{looks_like_test_path, SourceFile, SourceSelector};

use super::http_client::HttpClient;
use super::manifest::{self, MANIFEST_FILES};
use super::{
    assess, invalid_url, non_blank, optional_str, parse_timestamp, required_str, strip_scheme,
    ManifestFile, RawPayload, SourceAdapter,
};

pub struct GithubAdapter {
    http: HttpClient,
    api_base: String,
    selector: SourceSelector,
    max_files: usize,
    max_file_bytes: u64,
}

impl GithubAdapter {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let http = HttpClient::new(&config.http, config.sources.resolved_github_token())?;
        Ok(Self::with_client(
            http,
            &config.sources.github_api,
            &config.analysis,
        )?)
    }

    pub fn with_client(
        http: HttpClient,
        api_base: &str,
        analysis: &AnalysisConfig,
    ) -> Result<Self, globset::Error> {
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            selector: SourceSelector::new(&analysis.include_globs, &analysis.exclude_globs)?,
            max_files: analysis.max_files,
            max_file_bytes: analysis.max_file_bytes,
        })
    }

    async fn fetch_file(&self, repo_api: &str, path: &str) -> Result<Option<String>, FetchError> {
        let url = contents_url(repo_api, path)?;
        Ok(self
            .http
            .get_json_optional(&url)
            .await?
            .and_then(|doc| decode_content(&doc)))
    }
}

/// Contents API URL for `path`, each segment percent-encoded.
fn contents_url(repo_api: &str, path: &str) -> Result<String, FetchError> {
    let mut url = Url::parse(&format!("{}/contents", repo_api))
        .map_err(|e| invalid_url(HostType::Github, repo_api, &e.to_string()))?;
    url.path_segments_mut()
        .map_err(|()| invalid_url(HostType::Github, repo_api, "cannot be a base URL"))?
        .extend(path.split('/').filter(|s| !s.is_empty()));
    Ok(url.into())
}

/// `(owner, repo)` from a repository URL.
pub fn parse_repo_url(url: &str) -> Result<(String, String), FetchError> {
    let stripped = strip_scheme(url);
    let path = stripped
        .strip_prefix("github.com/")
        .or_else(|| stripped.strip_prefix("github:"))
        .ok_or_else(|| invalid_url(HostType::Github, url, "not a github.com repository URL"))?;

    let mut parts = path.split('/');
    let owner = parts.next().unwrap_or_default();
    let repo = parts.next().unwrap_or_default().trim_end_matches(".git");

    let valid = |s: &str| {
        !s.is_empty()
            && s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };
    if !valid(owner) || !valid(repo) {
        return Err(invalid_url(
            HostType::Github,
            url,
            "expected github.com/{owner}/{repo}",
        ));
    }
    Ok((owner.to_string(), repo.to_string()))
}

/// Decode a contents API response (`encoding: base64`).
fn decode_content(doc: &Value) -> Option<String> {
    let content = doc.get("content")?.as_str()?;
    match doc.get("encoding").and_then(Value::as_str) {
        Some("base64") => {
            let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(compact)
                .ok()?;
            Some(String::from_utf8_lossy(&bytes).into_owned())
        }
        _ => Some(content.to_string()),
    }
}

/// `(path, size)` of every blob in a recursive tree listing.
fn tree_blobs(tree: &Value) -> Vec<(String, u64)> {
    tree.get("tree")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter(|e| e.get("type").and_then(Value::as_str) == Some("blob"))
                .filter_map(|e| {
                    let path = e.get("path")?.as_str()?.to_string();
                    let size = e.get("size").and_then(Value::as_u64).unwrap_or(0);
                    Some((path, size))
                })
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait]
impl SourceAdapter for GithubAdapter {
    fn host_type(&self) -> HostType {
        HostType::Github
    }

    fn description(&self) -> &str {
        "GitHub repositories via the REST API"
    }

    async fn fetch(&self, url: &str) -> Result<RawPayload, FetchError> {
        let (owner, repo) = parse_repo_url(url)?;
        let repo_api = format!("{}/repos/{}/{}", self.api_base, owner, repo);

        let repo_doc = self.http.get_json(&repo_api).await?;

        let readme = self
            .http
            .get_json_optional(&format!("{}/readme", repo_api))
            .await?
            .and_then(|doc| decode_content(&doc));

        let contributors = self
            .http
            .get_json_optional(&format!("{}/contributors?per_page=100", repo_api))
            .await?
            .unwrap_or_else(|| json!([]));

        let branch = repo_doc
            .get("default_branch")
            .and_then(Value::as_str)
            .unwrap_or("main")
            .to_string();
        let blobs = self
            .http
            .get_json_optional(&format!("{}/git/trees/{}?recursive=1", repo_api, branch))
            .await?
            .map(|tree| tree_blobs(&tree))
            .unwrap_or_default();

        let mut manifest = None;
        for name in MANIFEST_FILES {
            if blobs.iter().any(|(path, _)| path == name) {
                if let Some(content) = self.fetch_file(&repo_api, name).await? {
                    manifest = Some(ManifestFile {
                        name: name.to_string(),
                        content,
                    });
                    break;
                }
            }
        }

        // Shallow files first: entry points usually live near the root.
        let mut candidates: Vec<&(String, u64)> = blobs
            .iter()
            .filter(|(path, size)| *size <= self.max_file_bytes && self.selector.is_match(path))
            .collect();
        candidates.sort_by_key(|(path, _)| (path.matches('/').count(), path.clone()));

        let mut files = Vec::new();
        for (path, _) in candidates.into_iter().take(self.max_files) {
            if let Some(content) = self.fetch_file(&repo_api, path).await? {
                files.push(SourceFile {
                    path: path.clone(),
                    content,
                });
            }
        }

        tracing::debug!(
            url,
            blobs = blobs.len(),
            analyzed_files = files.len(),
            manifest = manifest.as_ref().map(|m| m.name.as_str()),
            "fetched github repository"
        );

        let paths: Vec<&str> = blobs.iter().map(|(p, _)| p.as_str()).collect();
        Ok(RawPayload {
            url: url.to_string(),
            host_type: HostType::Github,
            document: json!({
                "repo": repo_doc,
                "contributors": contributors,
                "tree_paths": paths,
            }),
            files,
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
    let repo = payload
        .document
        .get("repo")
        .filter(|r| r.is_object())
        .ok_or_else(|| ParseError::MissingField("repo".to_string()))?;
    let name = required_str(repo, "name")?;

    let mut server = Server::new(name, &payload.url, HostType::Github, payload.fetched_at);
    server.description = optional_str(repo, "description");
    server.stars = repo.get("stargazers_count").and_then(Value::as_i64);
    server.forks = repo.get("forks_count").and_then(Value::as_i64);
    server.open_issues = repo.get("open_issues_count").and_then(Value::as_i64);
    server.has_license = repo.get("license").is_some_and(|l| !l.is_null());
    server.has_readme = non_blank(&payload.readme);
    server.last_activity_at =
        parse_timestamp(repo.get("pushed_at")).or_else(|| parse_timestamp(repo.get("updated_at")));

    let tree_has_tests = payload
        .document
        .get("tree_paths")
        .and_then(Value::as_array)
        .is_some_and(|paths| {
            paths
                .iter()
                .filter_map(Value::as_str)
                .any(looks_like_test_path)
        });
    server.has_tests = tree_has_tests || payload.files.iter().any(|f| looks_like_test_path(&f.path));

    if let Some(list) = payload.document.get("contributors").and_then(Value::as_array) {
        server.contributors = list
            .iter()
            .filter_map(|c| {
                Some(Contributor {
                    login: c.get("login")?.as_str()?.to_string(),
                    contributions: c.get("contributions").and_then(Value::as_i64).unwrap_or(0),
                })
            })
            .collect();
    }

    let mut tools = Vec::new();
    if let Some(ref m) = payload.manifest {
        match manifest::dependencies_from_manifest(&m.name, &m.content) {
            Ok(deps) => server.dependencies = deps,
            Err(e) => {
                tracing::warn!(url = %payload.url, manifest = %m.name, error = %e, "ignoring unreadable manifest");
            }
        }
        if m.name == "package.json" {
            if let Ok(doc) = serde_json::from_str::<Value>(&m.content) {
                tools.extend(manifest::tools_from_json(&doc));
            }
        }
    }
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
