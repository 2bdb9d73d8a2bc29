//! Catalog maintenance.
//!
//! [`CatalogUpdater`] is the write-side API over the store: reads, patches,
//! deletes, forced refreshes and the bulk sweeps the scheduler runs.
//!
//! | Operation | Effect |
//! |-----------|--------|
//! | `update` / `bulk_update` | Apply a [`ServerPatch`] (name, description, verified) |
//! | `refresh` / `refresh_server_data` | Forced re-harvest of one server |
//! | `refresh_stale` | Re-harvest servers older than `max_age` and retry old failed checkpoints |
//! | `prune_stale` | Delete servers whose content has not changed within `max_age` |
//! | `recalculate_health_scores` | Re-run the health scorer against stored signals |
//! | `recalculate_risk_levels` | Re-derive risk levels from stored findings |
//!
//! Bulk operations write each row in its own transaction. A failing row is
//! recorded in [`BulkOutcome::failures`] and the sweep moves on.

use std::collections::HashSet;
use std::fmt::Display;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;

use crate::error::{CatalogError, HarvestError};
use crate::harvest::{HarvestMode, HarvestOrchestrator};
use crate::health::{self, HealthSignals};
use crate::models::{
    CatalogStats, CheckpointStatus, HostType, RiskLevel, Server, ServerFilter, ServerPatch,
};
use crate::store::CatalogStore;

/// Result of a bulk sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BulkOutcome {
    /// Rows actually affected.
    pub succeeded: usize,
    pub failures: Vec<RowFailure>,
}

impl BulkOutcome {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn attempted(&self) -> usize {
        self.succeeded + self.failures.len()
    }
}

/// One row that failed during a sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowFailure {
    /// Server id or URL.
    pub key: String,
    pub error: String,
}

impl RowFailure {
    pub fn new(key: impl Into<String>, error: impl Display) -> Self {
        Self {
            key: key.into(),
            error: error.to_string(),
        }
    }
}

pub struct CatalogUpdater {
    store: Arc<dyn CatalogStore>,
    harvester: Arc<HarvestOrchestrator>,
}

impl CatalogUpdater {
    pub fn new(harvester: Arc<HarvestOrchestrator>) -> Self {
        Self {
            store: harvester.store().clone(),
            harvester,
        }
    }

    pub fn harvester(&self) -> &Arc<HarvestOrchestrator> {
        &self.harvester
    }

    // ═══════════════════════════════════════════════════════════════════
    // Reads and single-row writes
    // ═══════════════════════════════════════════════════════════════════

    pub async fn get(&self, id: &str) -> Result<Server, CatalogError> {
        self.store
            .get_server(id)
            .await?
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))
    }

    pub async fn get_by_url(&self, url: &str) -> Result<Option<Server>, CatalogError> {
        Ok(self.store.get_server_by_url(url).await?)
    }

    pub async fn get_servers(&self, filter: &ServerFilter) -> Result<Vec<Server>, CatalogError> {
        Ok(self.store.list_servers(filter).await?)
    }

    pub async fn update(&self, id: &str, patch: &ServerPatch) -> Result<Server, CatalogError> {
        self.store
            .update_server(id, patch, Utc::now())
            .await?
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))
    }

    /// Apply `patch` to every server matching `filter`.
    pub async fn bulk_update(
        &self,
        filter: &ServerFilter,
        patch: &ServerPatch,
    ) -> Result<BulkOutcome, CatalogError> {
        let ids = self.store.list_server_ids(filter).await?;
        let now = Utc::now();
        let mut outcome = BulkOutcome::default();

        for id in ids {
            match self.store.update_server(&id, patch, now).await {
                Ok(Some(_)) => outcome.succeeded += 1,
                // Deleted since the id list was read.
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(server_id = %id, error = %e, "bulk update failed for row");
                    outcome.failures.push(RowFailure::new(id, e));
                }
            }
        }

        tracing::info!(
            succeeded = outcome.succeeded,
            failed = outcome.failures.len(),
            "bulk update finished"
        );
        Ok(outcome)
    }

    /// Delete a server and its children.
    pub async fn delete(&self, id: &str) -> Result<(), CatalogError> {
        if self.store.delete_server(id).await? {
            tracing::info!(server_id = %id, "deleted server");
            Ok(())
        } else {
            Err(CatalogError::NotFound(id.to_string()))
        }
    }

    // ═══════════════════════════════════════════════════════════════════
    // Refresh
    // ═══════════════════════════════════════════════════════════════════

    /// Forced re-harvest of a URL already known to the catalog or the
    /// checkpoint table.
    pub async fn refresh(&self, url: &str) -> Result<Server, CatalogError> {
        let kind = match self.store.get_server_by_url(url).await? {
            Some(server) => server.host_type,
            None => self
                .store
                .get_log(url)
                .await?
                .map(|log| log.host_type)
                .ok_or_else(|| CatalogError::NotFound(url.to_string()))?,
        };
        self.force_harvest(kind, url).await
    }

    /// Forced re-harvest of a stored server.
    pub async fn refresh_server_data(&self, id: &str) -> Result<Server, CatalogError> {
        let server = self.get(id).await?;
        self.force_harvest(server.host_type, &server.primary_url)
            .await
    }

    async fn force_harvest(&self, kind: HostType, url: &str) -> Result<Server, CatalogError> {
        let outcome = self.harvester.harvest(kind, url, HarvestMode::Force).await?;
        Ok(outcome.into_server())
    }

    /// Re-harvest servers last harvested before `now - max_age`, plus
    /// checkpoints that have been `failed` for longer than `max_age`.
    pub async fn refresh_stale(&self, max_age: Duration) -> Result<BulkOutcome, CatalogError> {
        let cutoff = Utc::now() - max_age;

        let mut targets: Vec<(HostType, String)> = self
            .store
            .stale_servers(cutoff)
            .await?
            .into_iter()
            .map(|entry| (entry.host_type, entry.primary_url))
            .collect();
        let mut seen: HashSet<String> = targets.iter().map(|(_, url)| url.clone()).collect();
        for log in self
            .store
            .list_logs(CheckpointStatus::Failed, Some(cutoff), None)
            .await?
        {
            if seen.insert(log.url.clone()) {
                targets.push((log.host_type, log.url));
            }
        }

        if targets.is_empty() {
            tracing::debug!("no stale servers");
            return Ok(BulkOutcome::default());
        }
        tracing::info!(count = targets.len(), %cutoff, "refreshing stale servers");

        let fan_out = self.harvester.config().fan_out.max(1);
        let results: Vec<(String, Result<(), HarvestError>)> =
            stream::iter(targets.into_iter().map(|(kind, url)| async move {
                let result = self
                    .harvester
                    .harvest(kind, &url, HarvestMode::Force)
                    .await
                    .map(|_| ());
                (url, result)
            }))
            .buffer_unordered(fan_out)
            .collect()
            .await;

        let mut outcome = BulkOutcome::default();
        for (url, result) in results {
            match result {
                Ok(()) => outcome.succeeded += 1,
                Err(e) => outcome.failures.push(RowFailure::new(url, e)),
            }
        }
        tracing::info!(
            succeeded = outcome.succeeded,
            failed = outcome.failures.len(),
            "stale refresh finished"
        );
        Ok(outcome)
    }

    /// Delete servers whose `updated_at` is older than `max_age`, children
    /// included. Returns the count.
    pub async fn prune_stale(&self, max_age: Duration) -> Result<u64, CatalogError> {
        let cutoff = Utc::now() - max_age;
        let deleted = self.store.delete_stale_servers(cutoff).await?;
        tracing::info!(deleted, %cutoff, "pruned stale servers");
        Ok(deleted)
    }

    // ═══════════════════════════════════════════════════════════════════
    // Derived values
    // ═══════════════════════════════════════════════════════════════════

    /// Recompute every health score from stored signals as of `now`.
    pub async fn recalculate_health_scores(
        &self,
        now: DateTime<Utc>,
    ) -> Result<BulkOutcome, CatalogError> {
        self.recalculate("health", |server| {
            let score = health::score(&HealthSignals::from_server(server, now));
            (score != server.health_score).then_some((score, server.risk_level))
        })
        .await
    }

    /// Re-derive every risk level from stored findings.
    pub async fn recalculate_risk_levels(&self) -> Result<BulkOutcome, CatalogError> {
        self.recalculate("risk", |server| {
            let level = RiskLevel::from_findings(server.risk_analyzed, &server.risk_findings);
            (level != server.risk_level).then_some((server.health_score, level))
        })
        .await
    }

    /// Walk every server and write the derived pair returned by `derive`.
    /// `None` means the stored values are already correct.
    async fn recalculate<F>(&self, what: &str, derive: F) -> Result<BulkOutcome, CatalogError>
    where
        F: Fn(&Server) -> Option<(i64, RiskLevel)>,
    {
        let ids = self.store.list_server_ids(&ServerFilter::default()).await?;
        let mut outcome = BulkOutcome::default();
        let mut unchanged = 0usize;

        for id in ids {
            let server = match self.store.get_server(&id).await {
                Ok(Some(server)) => server,
                Ok(None) => continue,
                Err(e) => {
                    outcome.failures.push(RowFailure::new(id, e));
                    continue;
                }
            };
            let Some((health_score, risk_level)) = derive(&server) else {
                unchanged += 1;
                continue;
            };
            match self.store.set_derived(&id, health_score, risk_level).await {
                Ok(true) => outcome.succeeded += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(server_id = %id, error = %e, what, "recalculation failed for row");
                    outcome.failures.push(RowFailure::new(id, e));
                }
            }
        }

        tracing::info!(
            what,
            updated = outcome.succeeded,
            unchanged,
            failed = outcome.failures.len(),
            "recalculation finished"
        );
        Ok(outcome)
    }

    pub async fn get_statistics(&self) -> Result<CatalogStats, CatalogError> {
        Ok(self.store.statistics().await?)
    }
}
