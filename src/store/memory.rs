//! In-memory [`CatalogStore`] implementation for tests.
//!
//! All state sits behind one `std::sync::Mutex`, so every operation is
//! trivially atomic, including the checkpoint claim. Writes can be made to
//! fail for chosen server ids with [`InMemoryStore::fail_writes_for`],
//! which is how bulk-sweep failure isolation is exercised.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::PersistenceError;
use crate::health;
use crate::models::{
    CatalogStats, CheckpointStatus, HostType, ProcessingLog, RiskLevel, Server, ServerFilter,
    ServerPatch,
};

use super::{claim_allowed, CatalogStore, ClaimOutcome, ClaimRequest, StaleEntry};

#[derive(Default)]
struct State {
    servers: HashMap<String, Server>,
    ids_by_url: HashMap<String, String>,
    logs: HashMap<String, ProcessingLog>,
    failing_ids: HashSet<String>,
}

impl State {
    fn check_writable(&self, id: &str) -> Result<(), PersistenceError> {
        if self.failing_ids.contains(id) {
            return Err(PersistenceError::Constraint(format!(
                "write rejected for server {}",
                id
            )));
        }
        Ok(())
    }

    fn sorted_matches(&self, filter: &ServerFilter) -> Vec<&Server> {
        let mut matched: Vec<&Server> = self
            .servers
            .values()
            .filter(|s| filter.matches(s))
            .collect();
        matched.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));

        let offset = filter.offset.unwrap_or(0).max(0) as usize;
        let limit = filter.limit.map_or(usize::MAX, |l| l.max(0) as usize);
        matched.into_iter().skip(offset).take(limit).collect()
    }

    fn stale(&self, cutoff: DateTime<Utc>) -> Vec<StaleEntry> {
        let mut entries: Vec<StaleEntry> = self
            .servers
            .values()
            .filter(|s| s.last_harvested_at.map_or(true, |t| t < cutoff))
            .map(|s| StaleEntry {
                id: s.id.clone(),
                primary_url: s.primary_url.clone(),
                host_type: s.host_type,
            })
            .collect();
        entries.sort_by(|a, b| a.primary_url.cmp(&b.primary_url));
        entries
    }
}

/// In-memory store for tests.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write touching server `id` fail.
    pub fn fail_writes_for(&self, id: &str) {
        self.state().failing_ids.insert(id.to_string());
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CatalogStore for InMemoryStore {
    async fn upsert_server(
        &self,
        server: &Server,
        now: DateTime<Utc>,
    ) -> Result<Server, PersistenceError> {
        let mut state = self.state();

        let mut stored = server.clone();
        stored.content_hash = server.compute_content_hash();
        stored.health_score = health::clamp(server.health_score);
        stored.last_harvested_at = Some(now);

        let existing_id = state.ids_by_url.get(&server.primary_url).cloned();
        match existing_id.and_then(|id| state.servers.get(&id)) {
            Some(existing) => {
                state.check_writable(&existing.id)?;
                stored.id = existing.id.clone();
                stored.created_at = existing.created_at;
                stored.verified = existing.verified;
                stored.updated_at = if existing.content_hash == stored.content_hash {
                    existing.updated_at
                } else {
                    now
                };
            }
            None => {
                state.check_writable(&stored.id)?;
                stored.created_at = now;
                stored.updated_at = now;
            }
        }

        state
            .ids_by_url
            .insert(stored.primary_url.clone(), stored.id.clone());
        state.servers.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn get_server(&self, id: &str) -> Result<Option<Server>, PersistenceError> {
        Ok(self.state().servers.get(id).cloned())
    }

    async fn get_server_by_url(&self, url: &str) -> Result<Option<Server>, PersistenceError> {
        let state = self.state();
        Ok(state
            .ids_by_url
            .get(url)
            .and_then(|id| state.servers.get(id))
            .cloned())
    }

    async fn list_servers(&self, filter: &ServerFilter) -> Result<Vec<Server>, PersistenceError> {
        Ok(self
            .state()
            .sorted_matches(filter)
            .into_iter()
            .cloned()
            .collect())
    }

    async fn list_server_ids(
        &self,
        filter: &ServerFilter,
    ) -> Result<Vec<String>, PersistenceError> {
        Ok(self
            .state()
            .sorted_matches(filter)
            .into_iter()
            .map(|s| s.id.clone())
            .collect())
    }

    async fn update_server(
        &self,
        id: &str,
        patch: &ServerPatch,
        now: DateTime<Utc>,
    ) -> Result<Option<Server>, PersistenceError> {
        let mut state = self.state();
        state.check_writable(id)?;

        let Some(server) = state.servers.get_mut(id) else {
            return Ok(None);
        };
        if patch.apply(server) {
            server.content_hash = server.compute_content_hash();
            server.updated_at = now;
        }
        Ok(Some(server.clone()))
    }

    async fn set_derived(
        &self,
        id: &str,
        health_score: i64,
        risk_level: RiskLevel,
    ) -> Result<bool, PersistenceError> {
        let mut state = self.state();
        state.check_writable(id)?;
        match state.servers.get_mut(id) {
            Some(server) => {
                server.health_score = health::clamp(health_score);
                server.risk_level = risk_level;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_server(&self, id: &str) -> Result<bool, PersistenceError> {
        let mut state = self.state();
        state.check_writable(id)?;
        match state.servers.remove(id) {
            Some(server) => {
                state.ids_by_url.remove(&server.primary_url);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn stale_servers(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<StaleEntry>, PersistenceError> {
        Ok(self.state().stale(cutoff))
    }

    async fn delete_stale_servers(&self, cutoff: DateTime<Utc>) -> Result<u64, PersistenceError> {
        let mut state = self.state();
        let unchanged: Vec<(String, String)> = state
            .servers
            .values()
            .filter(|s| s.updated_at < cutoff)
            .map(|s| (s.id.clone(), s.primary_url.clone()))
            .collect();
        for (id, _) in &unchanged {
            state.check_writable(id)?;
        }
        for (id, url) in &unchanged {
            state.servers.remove(id);
            state.ids_by_url.remove(url);
        }
        Ok(unchanged.len() as u64)
    }

    async fn statistics(&self) -> Result<CatalogStats, PersistenceError> {
        let state = self.state();
        let mut stats = CatalogStats {
            total_servers: state.servers.len() as i64,
            ..Default::default()
        };

        let mut health_sum = 0i64;
        for server in state.servers.values() {
            if server.verified {
                stats.verified_servers += 1;
            }
            health_sum += server.health_score;
            *stats
                .by_host_type
                .entry(server.host_type.as_str().to_string())
                .or_insert(0) += 1;
            *stats
                .by_risk_level
                .entry(server.risk_level.as_str().to_string())
                .or_insert(0) += 1;
            stats.total_tools += server.tools.len() as i64;
            stats.total_dependencies += server.dependencies.len() as i64;
            stats.total_contributors += server.contributors.len() as i64;
            if server.bus_factor() == 1 {
                stats.single_maintainer_servers += 1;
            }
        }
        if stats.total_servers > 0 {
            stats.average_health_score = health_sum as f64 / stats.total_servers as f64;
        }

        let mut checkpoints = BTreeMap::new();
        for log in state.logs.values() {
            *checkpoints.entry(log.status.as_str().to_string()).or_insert(0) += 1;
        }
        stats.checkpoints = checkpoints;

        Ok(stats)
    }

    async fn get_log(&self, url: &str) -> Result<Option<ProcessingLog>, PersistenceError> {
        Ok(self.state().logs.get(url).cloned())
    }

    async fn enqueue(
        &self,
        url: &str,
        host_type: HostType,
        now: DateTime<Utc>,
    ) -> Result<bool, PersistenceError> {
        let mut state = self.state();
        if state.logs.contains_key(url) {
            return Ok(false);
        }
        state.logs.insert(
            url.to_string(),
            ProcessingLog {
                url: url.to_string(),
                host_type,
                status: CheckpointStatus::Pending,
                attempts: 0,
                last_error: None,
                started_at: None,
                completed_at: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(true)
    }

    async fn claim(&self, request: ClaimRequest<'_>) -> Result<ClaimOutcome, PersistenceError> {
        let mut state = self.state();

        let Some(existing) = state.logs.get_mut(request.url) else {
            let log = ProcessingLog {
                url: request.url.to_string(),
                host_type: request.host_type,
                status: CheckpointStatus::Processing,
                attempts: 1,
                last_error: None,
                started_at: Some(request.now),
                completed_at: None,
                created_at: request.now,
                updated_at: request.now,
            };
            state.logs.insert(request.url.to_string(), log.clone());
            return Ok(ClaimOutcome::Claimed(log));
        };

        if claim_allowed(existing, &request) {
            existing.status = CheckpointStatus::Processing;
            existing.host_type = request.host_type;
            existing.attempts += 1;
            existing.started_at = Some(request.now);
            existing.updated_at = request.now;
            Ok(ClaimOutcome::Claimed(existing.clone()))
        } else if existing.status == CheckpointStatus::Completed {
            Ok(ClaimOutcome::Completed(existing.clone()))
        } else {
            Ok(ClaimOutcome::Busy(existing.clone()))
        }
    }

    async fn mark_completed(
        &self,
        url: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ProcessingLog>, PersistenceError> {
        let mut state = self.state();
        match state.logs.get_mut(url) {
            Some(log) if log.status.can_transition_to(CheckpointStatus::Completed, false) => {
                log.status = CheckpointStatus::Completed;
                log.last_error = None;
                log.completed_at = Some(now);
                log.updated_at = now;
                Ok(Some(log.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn mark_failed(
        &self,
        url: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ProcessingLog>, PersistenceError> {
        let mut state = self.state();
        match state.logs.get_mut(url) {
            Some(log) if log.status.can_transition_to(CheckpointStatus::Failed, false) => {
                log.status = CheckpointStatus::Failed;
                log.last_error = Some(error.to_string());
                log.updated_at = now;
                Ok(Some(log.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn list_logs(
        &self,
        status: CheckpointStatus,
        updated_before: Option<DateTime<Utc>>,
        limit: Option<i64>,
    ) -> Result<Vec<ProcessingLog>, PersistenceError> {
        let state = self.state();
        let mut logs: Vec<ProcessingLog> = state
            .logs
            .values()
            .filter(|l| l.status == status)
            .filter(|l| updated_before.map_or(true, |cutoff| l.updated_at < cutoff))
            .cloned()
            .collect();
        logs.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.url.cmp(&b.url)));
        if let Some(limit) = limit {
            logs.truncate(limit.max(0) as usize);
        }
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Contributor, Dependency, DependencyType, Tool};
    use chrono::Duration;

    fn server(url: &str) -> Server {
        let mut s = Server::new("demo", url, HostType::Npm, Utc::now());
        s.tools = vec![Tool {
            name: "search".to_string(),
            description: None,
            input_schema: serde_json::json!({"type": "object"}),
        }];
        s
    }

    #[tokio::test]
    async fn test_upsert_preserves_identity_and_replaces_children() {
        let store = InMemoryStore::new();
        let t0 = Utc::now();
        let first = store.upsert_server(&server("npm:demo"), t0).await.unwrap();
        store
            .update_server(&first.id, &ServerPatch::verified(true), t0)
            .await
            .unwrap();

        let mut again = server("npm:demo");
        again.tools.clear();
        again.dependencies = vec![Dependency {
            name: "zod".to_string(),
            version_constraint: Some("^3".to_string()),
            dependency_type: DependencyType::Runtime,
        }];
        let t1 = t0 + Duration::hours(1);
        let second = store.upsert_server(&again, t1).await.unwrap();

        assert_eq!(second.id, first.id);
        assert_eq!(second.created_at, first.created_at);
        assert!(second.verified);
        assert!(second.tools.is_empty());
        assert_eq!(second.dependencies.len(), 1);
        assert_eq!(second.updated_at, t1);
        assert_eq!(second.last_harvested_at, Some(t1));
    }

    #[tokio::test]
    async fn test_unchanged_content_keeps_updated_at() {
        let store = InMemoryStore::new();
        let t0 = Utc::now();
        let first = store.upsert_server(&server("npm:demo"), t0).await.unwrap();
        let t1 = t0 + Duration::hours(2);
        let second = store.upsert_server(&server("npm:demo"), t1).await.unwrap();
        assert_eq!(second.updated_at, first.updated_at);
        assert_eq!(second.last_harvested_at, Some(t1));
    }

    #[tokio::test]
    async fn test_claim_lifecycle() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let req = |force| ClaimRequest {
            url: "npm:demo",
            host_type: HostType::Npm,
            force,
            now,
            stale_before: now - Duration::minutes(10),
        };

        let ClaimOutcome::Claimed(log) = store.claim(req(false)).await.unwrap() else {
            panic!("expected claim");
        };
        assert_eq!(log.attempts, 1);
        assert!(matches!(store.claim(req(false)).await.unwrap(), ClaimOutcome::Busy(_)));

        store.mark_failed("npm:demo", "boom", now).await.unwrap().unwrap();
        let ClaimOutcome::Claimed(log) = store.claim(req(false)).await.unwrap() else {
            panic!("expected retry claim");
        };
        assert_eq!(log.attempts, 2);
        assert_eq!(log.last_error.as_deref(), Some("boom"));

        let done = store.mark_completed("npm:demo", now).await.unwrap().unwrap();
        assert!(done.last_error.is_none());
        assert!(store.mark_failed("npm:demo", "late", now).await.unwrap().is_none());
        assert!(matches!(
            store.claim(req(false)).await.unwrap(),
            ClaimOutcome::Completed(_)
        ));
        assert!(matches!(store.claim(req(true)).await.unwrap(), ClaimOutcome::Claimed(_)));
    }

    #[tokio::test]
    async fn test_enqueue_only_once() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        assert!(store.enqueue("npm:a", HostType::Npm, now).await.unwrap());
        assert!(!store.enqueue("npm:a", HostType::Npm, now).await.unwrap());
        let pending = store
            .list_logs(CheckpointStatus::Pending, None, None)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 0);
    }

    #[tokio::test]
    async fn test_pending_log_cannot_be_settled() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        store.enqueue("npm:a", HostType::Npm, now).await.unwrap();
        assert!(store.mark_completed("npm:a", now).await.unwrap().is_none());
        assert!(store.mark_failed("npm:a", "boom", now).await.unwrap().is_none());
        assert!(store.mark_completed("npm:missing", now).await.unwrap().is_none());
        let log = store.get_log("npm:a").await.unwrap().unwrap();
        assert_eq!(log.status, CheckpointStatus::Pending);
    }

    #[tokio::test]
    async fn test_statistics_count_single_maintainers() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let mut solo = server("npm:solo");
        solo.contributors = vec![
            Contributor {
                login: "alice".to_string(),
                contributions: 90,
            },
            Contributor {
                login: "bob".to_string(),
                contributions: 10,
            },
        ];
        let mut shared = server("npm:shared");
        shared.contributors = vec![
            Contributor {
                login: "carol".to_string(),
                contributions: 40,
            },
            Contributor {
                login: "dan".to_string(),
                contributions: 35,
            },
            Contributor {
                login: "erin".to_string(),
                contributions: 25,
            },
        ];
        store.upsert_server(&solo, now).await.unwrap();
        store.upsert_server(&shared, now).await.unwrap();
        store.upsert_server(&server("npm:nobody"), now).await.unwrap();

        let stats = store.statistics().await.unwrap();
        assert_eq!(stats.total_contributors, 5);
        assert_eq!(stats.single_maintainer_servers, 1);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let store = InMemoryStore::new();
        let s = store.upsert_server(&server("npm:demo"), Utc::now()).await.unwrap();
        store.fail_writes_for(&s.id);
        assert!(store
            .update_server(&s.id, &ServerPatch::verified(true), Utc::now())
            .await
            .is_err());
    }
}
