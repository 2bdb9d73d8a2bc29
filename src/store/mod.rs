//! Storage abstraction for the catalog.
//!
//! The [`CatalogStore`] trait covers both the entity graph (servers and
//! their children) and the per-URL processing checkpoints. Two backends
//! implement it: [`sqlite::SqliteStore`] for production and
//! [`memory::InMemoryStore`] for tests.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`upsert_server`](CatalogStore::upsert_server) | Insert or update by `primary_url`, replacing children |
//! | [`get_server`](CatalogStore::get_server) | Fetch one server with children |
//! | [`list_servers`](CatalogStore::list_servers) | Filtered read |
//! | [`update_server`](CatalogStore::update_server) | Apply a [`ServerPatch`] |
//! | [`set_derived`](CatalogStore::set_derived) | Overwrite health score and risk level |
//! | [`delete_server`](CatalogStore::delete_server) | Cascade delete |
//! | [`stale_servers`](CatalogStore::stale_servers) | Servers not harvested since a cutoff |
//! | [`delete_stale_servers`](CatalogStore::delete_stale_servers) | Prune servers unchanged since a cutoff |
//! | [`claim`](CatalogStore::claim) | Atomically move a checkpoint to `processing` |
//! | [`mark_completed`](CatalogStore::mark_completed) / [`mark_failed`](CatalogStore::mark_failed) | Finish an attempt |
//!
//! Every mutating call is a single transaction.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::PersistenceError;
use crate::models::{
    CatalogStats, CheckpointStatus, HostType, ProcessingLog, RiskLevel, Server, ServerFilter,
    ServerPatch,
};

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

/// Identity of a server selected by a sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleEntry {
    pub id: String,
    pub primary_url: String,
    pub host_type: HostType,
}

/// Result of [`CatalogStore::claim`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller owns the attempt; `attempts` already incremented.
    Claimed(ProcessingLog),
    /// Another worker holds a live `processing` claim.
    Busy(ProcessingLog),
    /// Already completed and the claim was not forced.
    Completed(ProcessingLog),
}

/// Parameters of a checkpoint claim.
#[derive(Debug, Clone, Copy)]
pub struct ClaimRequest<'a> {
    pub url: &'a str,
    pub host_type: HostType,
    /// Allow `completed → processing`.
    pub force: bool,
    pub now: DateTime<Utc>,
    /// `processing` claims started before this are taken over.
    pub stale_before: DateTime<Utc>,
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    // ── Servers ──────────────────────────────────────────────────────────

    /// Insert or update keyed on `primary_url`.
    ///
    /// On conflict `id`, `created_at` and `verified` are preserved, scalar
    /// fields are overwritten, children are deleted then re-inserted, and
    /// `updated_at` only advances if the content hash changed.
    /// `last_harvested_at` is set to `now` either way.
    async fn upsert_server(
        &self,
        server: &Server,
        now: DateTime<Utc>,
    ) -> Result<Server, PersistenceError>;

    async fn get_server(&self, id: &str) -> Result<Option<Server>, PersistenceError>;

    async fn get_server_by_url(&self, url: &str) -> Result<Option<Server>, PersistenceError>;

    /// Servers matching `filter`, ordered by name then id.
    async fn list_servers(&self, filter: &ServerFilter) -> Result<Vec<Server>, PersistenceError>;

    /// Ids matching `filter`, same order as [`list_servers`](Self::list_servers).
    async fn list_server_ids(&self, filter: &ServerFilter)
        -> Result<Vec<String>, PersistenceError>;

    /// Apply a patch. `updated_at` advances only when a field changed.
    /// Returns `None` when the server does not exist.
    async fn update_server(
        &self,
        id: &str,
        patch: &ServerPatch,
        now: DateTime<Utc>,
    ) -> Result<Option<Server>, PersistenceError>;

    /// Overwrite the derived fields. Returns `false` if the server is gone.
    async fn set_derived(
        &self,
        id: &str,
        health_score: i64,
        risk_level: RiskLevel,
    ) -> Result<bool, PersistenceError>;

    /// Delete a server and its children. Returns `false` if absent.
    async fn delete_server(&self, id: &str) -> Result<bool, PersistenceError>;

    /// Servers whose `last_harvested_at` is older than `cutoff` (or never set).
    async fn stale_servers(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<StaleEntry>, PersistenceError>;

    /// Delete every server whose `updated_at` is older than `cutoff`, in one
    /// transaction. Re-harvests of unchanged content do not advance
    /// `updated_at`, so they do not keep an entry alive. Returns the number
    /// deleted.
    async fn delete_stale_servers(&self, cutoff: DateTime<Utc>) -> Result<u64, PersistenceError>;

    async fn statistics(&self) -> Result<CatalogStats, PersistenceError>;

    // ── Checkpoints ──────────────────────────────────────────────────────

    async fn get_log(&self, url: &str) -> Result<Option<ProcessingLog>, PersistenceError>;

    /// Insert a `pending` row unless one exists. Returns `true` if inserted.
    async fn enqueue(
        &self,
        url: &str,
        host_type: HostType,
        now: DateTime<Utc>,
    ) -> Result<bool, PersistenceError>;

    /// Atomic conditional upsert to `processing`.
    async fn claim(&self, request: ClaimRequest<'_>) -> Result<ClaimOutcome, PersistenceError>;

    /// `processing → completed`. `None` if the row was not `processing`.
    async fn mark_completed(
        &self,
        url: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ProcessingLog>, PersistenceError>;

    /// `processing → failed`. `None` if the row was not `processing`.
    async fn mark_failed(
        &self,
        url: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<ProcessingLog>, PersistenceError>;

    /// Checkpoints in `status`, optionally last updated before `updated_before`,
    /// oldest first.
    async fn list_logs(
        &self,
        status: CheckpointStatus,
        updated_before: Option<DateTime<Utc>>,
        limit: Option<i64>,
    ) -> Result<Vec<ProcessingLog>, PersistenceError>;
}

/// Decide a claim against an existing row. Shared by both backends so they
/// agree on the state machine.
pub(crate) fn claim_allowed(existing: &ProcessingLog, request: &ClaimRequest<'_>) -> bool {
    match existing.status {
        // Taking over an abandoned claim is not a state change.
        CheckpointStatus::Processing => existing
            .started_at
            .map_or(true, |started| started < request.stale_before),
        status => status.can_transition_to(CheckpointStatus::Processing, request.force),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn log(status: CheckpointStatus, started_at: Option<DateTime<Utc>>) -> ProcessingLog {
        let now = Utc::now();
        ProcessingLog {
            url: "u".to_string(),
            host_type: HostType::Npm,
            status,
            attempts: 1,
            last_error: None,
            started_at,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_claim_rules() {
        let now = Utc::now();
        let req = |force| ClaimRequest {
            url: "u",
            host_type: HostType::Npm,
            force,
            now,
            stale_before: now - Duration::minutes(10),
        };

        assert!(claim_allowed(&log(CheckpointStatus::Pending, None), &req(false)));
        assert!(claim_allowed(&log(CheckpointStatus::Failed, None), &req(false)));
        assert!(!claim_allowed(&log(CheckpointStatus::Completed, None), &req(false)));
        assert!(claim_allowed(&log(CheckpointStatus::Completed, None), &req(true)));

        let live = log(CheckpointStatus::Processing, Some(now - Duration::minutes(1)));
        assert!(!claim_allowed(&live, &req(true)));
        let abandoned = log(CheckpointStatus::Processing, Some(now - Duration::hours(1)));
        assert!(claim_allowed(&abandoned, &req(false)));
    }
}
