//! Core data models used throughout the harvester.
//!
//! A [`Server`] is one harvested entry together with the child records it
//! owns ([`Tool`], [`Dependency`], [`Contributor`]). A [`ProcessingLog`] is
//! the per-URL checkpoint the orchestrator uses to make harvesting
//! idempotent.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ═══════════════════════════════════════════════════════════════════════
// Enumerations
// ═══════════════════════════════════════════════════════════════════════

/// Kind of external source an entry was harvested from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostType {
    /// Source-code host (GitHub).
    Github,
    /// npm package registry.
    Npm,
    /// Python package index.
    Pypi,
    /// Docker Hub container registry.
    Docker,
    /// Any other HTTP endpoint serving a JSON manifest.
    Http,
}

impl HostType {
    pub const ALL: [HostType; 5] = [
        HostType::Github,
        HostType::Npm,
        HostType::Pypi,
        HostType::Docker,
        HostType::Http,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HostType::Github => "github",
            HostType::Npm => "npm",
            HostType::Pypi => "pypi",
            HostType::Docker => "docker",
            HostType::Http => "http",
        }
    }
}

impl fmt::Display for HostType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HostType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "github" => Ok(HostType::Github),
            "npm" => Ok(HostType::Npm),
            "pypi" => Ok(HostType::Pypi),
            "docker" => Ok(HostType::Docker),
            "http" => Ok(HostType::Http),
            other => Err(format!(
                "Unknown host type: '{}'. Available: github, npm, pypi, docker, http",
                other
            )),
        }
    }
}

/// Static-analysis risk classification.
///
/// Variants are declared in severity order so the derived `Ord` gives
/// `Unknown < Safe < Moderate < High < Critical`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    #[default]
    Unknown,
    Safe,
    Moderate,
    High,
    Critical,
}

impl RiskLevel {
    pub const ALL: [RiskLevel; 5] = [
        RiskLevel::Unknown,
        RiskLevel::Safe,
        RiskLevel::Moderate,
        RiskLevel::High,
        RiskLevel::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Unknown => "UNKNOWN",
            RiskLevel::Safe => "SAFE",
            RiskLevel::Moderate => "MODERATE",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        }
    }

    /// Re-derive a level from stored findings.
    ///
    /// `analyzed == false` means no code was inspected at all.
    pub fn from_findings(analyzed: bool, findings: &[RiskFinding]) -> RiskLevel {
        if !analyzed {
            return RiskLevel::Unknown;
        }
        findings
            .iter()
            .map(|f| f.category.severity())
            .max()
            .unwrap_or(RiskLevel::Safe)
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "UNKNOWN" => Ok(RiskLevel::Unknown),
            "SAFE" => Ok(RiskLevel::Safe),
            "MODERATE" => Ok(RiskLevel::Moderate),
            "HIGH" => Ok(RiskLevel::High),
            "CRITICAL" => Ok(RiskLevel::Critical),
            other => Err(format!("Unknown risk level: '{}'", other)),
        }
    }
}

/// Category of a dangerous construct found by the risk analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskCategory {
    DynamicEval,
    Subprocess,
    Network,
    FilesystemWrite,
}

impl RiskCategory {
    pub fn severity(&self) -> RiskLevel {
        match self {
            RiskCategory::DynamicEval => RiskLevel::Critical,
            RiskCategory::Subprocess => RiskLevel::High,
            RiskCategory::Network | RiskCategory::FilesystemWrite => RiskLevel::Moderate,
        }
    }
}

/// One matched pattern in one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskFinding {
    pub category: RiskCategory,
    pub pattern: String,
    pub file: String,
    pub line: usize,
}

/// Kind of a declared dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyType {
    Runtime,
    Dev,
    Peer,
}

impl DependencyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyType::Runtime => "runtime",
            DependencyType::Dev => "dev",
            DependencyType::Peer => "peer",
        }
    }
}

impl FromStr for DependencyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "runtime" => Ok(DependencyType::Runtime),
            "dev" => Ok(DependencyType::Dev),
            "peer" => Ok(DependencyType::Peer),
            other => Err(format!("Unknown dependency type: '{}'", other)),
        }
    }
}

/// Status of a [`ProcessingLog`] checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl CheckpointStatus {
    pub const ALL: [CheckpointStatus; 4] = [
        CheckpointStatus::Pending,
        CheckpointStatus::Processing,
        CheckpointStatus::Completed,
        CheckpointStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckpointStatus::Pending => "pending",
            CheckpointStatus::Processing => "processing",
            CheckpointStatus::Completed => "completed",
            CheckpointStatus::Failed => "failed",
        }
    }

    /// Whether a checkpoint may move from `self` to `next`.
    ///
    /// Transitions only go forward; `failed → processing` is a retry and
    /// `completed → processing` requires an explicit forced refresh.
    pub fn can_transition_to(&self, next: CheckpointStatus, forced: bool) -> bool {
        use CheckpointStatus::*;
        match (self, next) {
            (Pending, Processing) => true,
            (Processing, Completed) | (Processing, Failed) => true,
            (Failed, Processing) => true,
            (Completed, Processing) => forced,
            _ => false,
        }
    }
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(CheckpointStatus::Pending),
            "processing" => Ok(CheckpointStatus::Processing),
            "completed" => Ok(CheckpointStatus::Completed),
            "failed" => Ok(CheckpointStatus::Failed),
            other => Err(format!("Unknown checkpoint status: '{}'", other)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Entities
// ═══════════════════════════════════════════════════════════════════════

/// A capability exposed by a server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub description: Option<String>,
    /// Arbitrary nested JSON schema describing the tool's input.
    pub input_schema: serde_json::Value,
}

/// A declared package dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    pub version_constraint: Option<String>,
    pub dependency_type: DependencyType,
}

/// A contributor identity with its contribution weight (e.g. commit count).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contributor {
    pub login: String,
    pub contributions: i64,
}

/// One harvested entry and the child collections it owns.
///
/// `primary_url` is the unique key used for upserts. Child collections are
/// replaced wholesale whenever the server is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub primary_url: String,
    pub host_type: HostType,
    pub description: Option<String>,
    pub health_score: i64,
    pub risk_level: RiskLevel,
    pub risk_findings: Vec<RiskFinding>,
    /// Whether any source code or manifest was inspected.
    pub risk_analyzed: bool,
    pub verified: bool,
    pub stars: Option<i64>,
    pub forks: Option<i64>,
    pub open_issues: Option<i64>,
    pub has_readme: bool,
    pub has_license: bool,
    pub has_tests: bool,
    pub last_activity_at: Option<DateTime<Utc>>,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_harvested_at: Option<DateTime<Utc>>,
    pub tools: Vec<Tool>,
    pub dependencies: Vec<Dependency>,
    pub contributors: Vec<Contributor>,
}

impl Server {
    /// Create an empty server record with a fresh id.
    pub fn new(name: &str, primary_url: &str, host_type: HostType, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            primary_url: primary_url.to_string(),
            host_type,
            description: None,
            health_score: 0,
            risk_level: RiskLevel::Unknown,
            risk_findings: Vec::new(),
            risk_analyzed: false,
            verified: false,
            stars: None,
            forks: None,
            open_issues: None,
            has_readme: false,
            has_license: false,
            has_tests: false,
            last_activity_at: None,
            content_hash: String::new(),
            created_at: now,
            updated_at: now,
            last_harvested_at: None,
            tools: Vec::new(),
            dependencies: Vec::new(),
            contributors: Vec::new(),
        }
    }

    /// SHA-256 over the harvested content, excluding ids and timestamps.
    ///
    /// Two parses of unchanged upstream data yield the same hash, which the
    /// store uses to decide whether `updated_at` advances.
    pub fn compute_content_hash(&self) -> String {
        let content = serde_json::json!({
            "name": self.name,
            "primary_url": self.primary_url,
            "host_type": self.host_type,
            "description": self.description,
            "risk_findings": self.risk_findings,
            "risk_analyzed": self.risk_analyzed,
            "stars": self.stars,
            "forks": self.forks,
            "open_issues": self.open_issues,
            "has_readme": self.has_readme,
            "has_license": self.has_license,
            "has_tests": self.has_tests,
            "last_activity_at": self.last_activity_at.map(|t| t.timestamp()),
            "tools": self.tools,
            "dependencies": self.dependencies,
            "contributors": self.contributors,
        });
        let mut hasher = Sha256::new();
        hasher.update(content.to_string().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Minimum number of top contributors covering half of all contributions.
    pub fn bus_factor(&self) -> usize {
        let mut weights: Vec<i64> = self
            .contributors
            .iter()
            .map(|c| c.contributions.max(0))
            .collect();
        let total: i64 = weights.iter().sum();
        if total == 0 {
            return 0;
        }
        weights.sort_unstable_by(|a, b| b.cmp(a));

        let mut covered = 0i64;
        for (i, w) in weights.iter().enumerate() {
            covered += w;
            if covered * 2 >= total {
                return i + 1;
            }
        }
        weights.len()
    }
}

/// Checkpoint record for one source URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingLog {
    pub url: String,
    pub host_type: HostType,
    pub status: CheckpointStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ═══════════════════════════════════════════════════════════════════════
// Queries and patches
// ═══════════════════════════════════════════════════════════════════════

/// Selection criteria for catalog reads and bulk updates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerFilter {
    pub host_type: Option<HostType>,
    pub risk_level: Option<RiskLevel>,
    pub verified: Option<bool>,
    pub min_health_score: Option<i64>,
    /// Case-insensitive substring match on the name.
    pub name_contains: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl ServerFilter {
    pub fn host_type(host_type: HostType) -> Self {
        Self {
            host_type: Some(host_type),
            ..Default::default()
        }
    }

    /// Row predicate, ignoring `limit` and `offset`.
    pub fn matches(&self, server: &Server) -> bool {
        if let Some(ht) = self.host_type {
            if server.host_type != ht {
                return false;
            }
        }
        if let Some(rl) = self.risk_level {
            if server.risk_level != rl {
                return false;
            }
        }
        if let Some(v) = self.verified {
            if server.verified != v {
                return false;
            }
        }
        if let Some(min) = self.min_health_score {
            if server.health_score < min {
                return false;
            }
        }
        if let Some(ref needle) = self.name_contains {
            if !server
                .name
                .to_lowercase()
                .contains(&needle.to_lowercase())
            {
                return false;
            }
        }
        true
    }
}

/// Partial update of the hand-editable fields of a server.
///
/// Health score and risk level are derived values and are deliberately
/// absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub verified: Option<bool>,
}

impl ServerPatch {
    pub fn verified(verified: bool) -> Self {
        Self {
            verified: Some(verified),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none() && self.verified.is_none()
    }

    /// Apply to a server. Returns `true` if any field changed.
    pub fn apply(&self, server: &mut Server) -> bool {
        let mut changed = false;
        if let Some(ref name) = self.name {
            if &server.name != name {
                server.name = name.clone();
                changed = true;
            }
        }
        if let Some(ref description) = self.description {
            if &server.description != description {
                server.description = description.clone();
                changed = true;
            }
        }
        if let Some(verified) = self.verified {
            if server.verified != verified {
                server.verified = verified;
                changed = true;
            }
        }
        changed
    }
}

/// Aggregate catalog counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CatalogStats {
    pub total_servers: i64,
    pub verified_servers: i64,
    pub average_health_score: f64,
    pub by_host_type: BTreeMap<String, i64>,
    pub by_risk_level: BTreeMap<String, i64>,
    pub total_tools: i64,
    pub total_dependencies: i64,
    pub total_contributors: i64,
    /// Servers with a [`Server::bus_factor`] of exactly 1.
    pub single_maintainer_servers: i64,
    pub checkpoints: BTreeMap<String, i64>,
}

/// Unix seconds for storage.
pub fn to_ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

/// Inverse of [`to_ts`]; out-of-range values map to the epoch.
pub fn from_ts(ts: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(ts, 0).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> Server {
        Server::new("demo", "https://github.com/acme/demo", HostType::Github, Utc::now())
    }

    #[test]
    fn test_risk_level_ordering() {
        assert!(RiskLevel::Unknown < RiskLevel::Safe);
        assert!(RiskLevel::Safe < RiskLevel::Moderate);
        assert!(RiskLevel::Moderate < RiskLevel::High);
        assert!(RiskLevel::High < RiskLevel::Critical);
    }

    #[test]
    fn test_risk_level_from_findings() {
        assert_eq!(RiskLevel::from_findings(false, &[]), RiskLevel::Unknown);
        assert_eq!(RiskLevel::from_findings(true, &[]), RiskLevel::Safe);

        let findings = vec![
            RiskFinding {
                category: RiskCategory::Network,
                pattern: "fetch(".to_string(),
                file: "index.js".to_string(),
                line: 3,
            },
            RiskFinding {
                category: RiskCategory::Subprocess,
                pattern: "child_process".to_string(),
                file: "index.js".to_string(),
                line: 1,
            },
        ];
        assert_eq!(RiskLevel::from_findings(true, &findings), RiskLevel::High);
    }

    #[test]
    fn test_checkpoint_transitions_forward_only() {
        use CheckpointStatus::*;
        assert!(Pending.can_transition_to(Processing, false));
        assert!(Processing.can_transition_to(Completed, false));
        assert!(Processing.can_transition_to(Failed, false));
        assert!(Failed.can_transition_to(Processing, false));
        assert!(!Completed.can_transition_to(Processing, false));
        assert!(Completed.can_transition_to(Processing, true));
        assert!(!Completed.can_transition_to(Pending, true));
        assert!(!Failed.can_transition_to(Completed, false));
        assert!(!Pending.can_transition_to(Completed, false));
    }

    #[test]
    fn test_host_type_roundtrip_names() {
        for ht in HostType::ALL {
            assert_eq!(ht.as_str().parse::<HostType>().unwrap(), ht);
        }
        assert!("gitlab".parse::<HostType>().is_err());
    }

    #[test]
    fn test_bus_factor() {
        let mut s = server();
        assert_eq!(s.bus_factor(), 0);

        s.contributors = vec![
            Contributor { login: "a".into(), contributions: 90 },
            Contributor { login: "b".into(), contributions: 5 },
            Contributor { login: "c".into(), contributions: 5 },
        ];
        assert_eq!(s.bus_factor(), 1);

        s.contributors = vec![
            Contributor { login: "a".into(), contributions: 30 },
            Contributor { login: "b".into(), contributions: 30 },
            Contributor { login: "c".into(), contributions: 30 },
            Contributor { login: "d".into(), contributions: 10 },
        ];
        assert_eq!(s.bus_factor(), 2);
    }

    #[test]
    fn test_content_hash_ignores_timestamps_and_id() {
        let a = server();
        let mut b = a.clone();
        b.id = "other".to_string();
        b.updated_at = from_ts(0);
        b.last_harvested_at = Some(Utc::now());
        assert_eq!(a.compute_content_hash(), b.compute_content_hash());

        b.stars = Some(10);
        assert_ne!(a.compute_content_hash(), b.compute_content_hash());
    }

    #[test]
    fn test_filter_matches() {
        let mut s = server();
        s.verified = true;
        s.health_score = 60;

        assert!(ServerFilter::default().matches(&s));
        assert!(ServerFilter::host_type(HostType::Github).matches(&s));
        assert!(!ServerFilter::host_type(HostType::Npm).matches(&s));
        let f = ServerFilter {
            name_contains: Some("DEM".to_string()),
            min_health_score: Some(50),
            ..Default::default()
        };
        assert!(f.matches(&s));
        let f = ServerFilter {
            min_health_score: Some(61),
            ..Default::default()
        };
        assert!(!f.matches(&s));
    }

    #[test]
    fn test_patch_apply_reports_change() {
        let mut s = server();
        assert!(!ServerPatch::default().apply(&mut s));
        assert!(ServerPatch::verified(true).apply(&mut s));
        assert!(s.verified);
        assert!(!ServerPatch::verified(true).apply(&mut s));
    }
}
