//! Harvest orchestration.
//!
//! Drives one source URL through `fetch → parse → store` with a
//! checkpoint row ([`ProcessingLog`](crate::models::ProcessingLog)) guarding
//! every attempt:
//!
//! ```text
//!   unseen ──claim──▶ processing ──ok──▶ completed
//!                        │   ▲               │
//!                     error  └──retry──┐     │ force
//!                        ▼             │     ▼
//!                      failed ─────────┘  processing
//! ```
//!
//! The same URL is serialized in-process by a per-URL async mutex and
//! across processes by the atomic claim in the store. Retries go through
//! [`retry_with_backoff`]; each attempt runs under a deadline and every
//! failed attempt leaves a `failed` checkpoint carrying the error text.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::Utc;
use futures::stream::{self, StreamExt};

use crate::adapters::AdapterRegistry;
use crate::catalog::{BulkOutcome, RowFailure};
use crate::config::HarvestConfig;
use crate::error::HarvestError;
use crate::metrics::{MetricsSink, HARVEST_ATTEMPTS, HARVEST_DURATION, HARVEST_OUTCOMES};
use crate::models::{CheckpointStatus, HostType, Server};
use crate::retry::{retry_with_backoff, RetryError, RetryPolicy};
use crate::store::{CatalogStore, ClaimOutcome, ClaimRequest};

/// Whether a completed checkpoint may be harvested again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarvestMode {
    Normal,
    /// Allow `completed → processing`.
    Force,
}

impl HarvestMode {
    fn is_force(self) -> bool {
        self == HarvestMode::Force
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HarvestOutcome {
    /// Fetched, parsed and stored during this call.
    Harvested(Server),
    /// Already completed; returned from the catalog without fetching.
    Skipped(Server),
}

impl HarvestOutcome {
    pub fn server(&self) -> &Server {
        match self {
            HarvestOutcome::Harvested(s) | HarvestOutcome::Skipped(s) => s,
        }
    }

    pub fn into_server(self) -> Server {
        match self {
            HarvestOutcome::Harvested(s) | HarvestOutcome::Skipped(s) => s,
        }
    }

    pub fn is_harvested(&self) -> bool {
        matches!(self, HarvestOutcome::Harvested(_))
    }
}

pub struct HarvestOrchestrator {
    store: Arc<dyn CatalogStore>,
    adapters: AdapterRegistry,
    metrics: Arc<dyn MetricsSink>,
    config: HarvestConfig,
    retry: RetryPolicy,
    url_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl HarvestOrchestrator {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        adapters: AdapterRegistry,
        metrics: Arc<dyn MetricsSink>,
        config: HarvestConfig,
    ) -> Self {
        let retry = config.retry_policy();
        Self {
            store,
            adapters,
            metrics,
            config,
            retry,
            url_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn CatalogStore> {
        &self.store
    }

    pub fn config(&self) -> &HarvestConfig {
        &self.config
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    /// Harvest one URL.
    ///
    /// Returns [`HarvestOutcome::Skipped`] when the checkpoint is already
    /// completed and `mode` is [`HarvestMode::Normal`].
    #[tracing::instrument(skip(self, kind), fields(kind = %kind))]
    pub async fn harvest(
        &self,
        kind: HostType,
        url: &str,
        mode: HarvestMode,
    ) -> Result<HarvestOutcome, HarvestError> {
        let started = Instant::now();
        let lock = self.url_lock(url);
        let result = {
            let _guard = lock.lock().await;
            self.harvest_locked(kind, url, mode).await
        };
        drop(lock);
        self.release_url_lock(url);

        let outcome = match &result {
            Ok(HarvestOutcome::Harvested(_)) => "harvested",
            Ok(HarvestOutcome::Skipped(_)) => "skipped",
            Err(e) => e.kind(),
        };
        self.metrics.increment_counter(
            HARVEST_OUTCOMES,
            &[("kind", kind.as_str()), ("outcome", outcome)],
        );
        self.metrics.record_histogram(
            HARVEST_DURATION,
            started.elapsed().as_secs_f64(),
            &[("kind", kind.as_str())],
        );

        match &result {
            Ok(o) => tracing::info!(outcome, server_id = %o.server().id, "harvest finished"),
            Err(e) => tracing::warn!(outcome, error = %e, "harvest failed"),
        }
        result
    }

    async fn harvest_locked(
        &self,
        kind: HostType,
        url: &str,
        mode: HarvestMode,
    ) -> Result<HarvestOutcome, HarvestError> {
        if !mode.is_force() {
            if let Some(server) = self.completed_server(url).await? {
                tracing::debug!("checkpoint completed, skipping fetch");
                return Ok(HarvestOutcome::Skipped(server));
            }
        }

        match self.claim(kind, url, mode.is_force()).await? {
            ClaimOutcome::Claimed(log) => {
                tracing::debug!(attempts = log.attempts, "claimed checkpoint");
            }
            ClaimOutcome::Busy(_) => {
                return Err(HarvestError::InFlight {
                    url: url.to_string(),
                });
            }
            // Completed row without a server behind it: harvest anyway.
            ClaimOutcome::Completed(_) => match self.claim(kind, url, true).await? {
                ClaimOutcome::Claimed(_) => {}
                _ => {
                    return Err(HarvestError::InFlight {
                        url: url.to_string(),
                    })
                }
            },
        }

        let result = retry_with_backoff(&self.retry, "harvest", move |attempt| async move {
            if attempt > 1 {
                self.reclaim(kind, url).await?;
            }
            self.metrics
                .increment_counter(HARVEST_ATTEMPTS, &[("kind", kind.as_str())]);

            match self.run_attempt(kind, url).await {
                Ok(server) => Ok(server),
                Err(err) => {
                    self.fail_checkpoint(url, &err).await;
                    Err(err)
                }
            }
        })
        .await;

        let server = match result {
            Ok(server) => server,
            Err(RetryError::Aborted { error, .. }) => return Err(error),
            Err(RetryError::Exhausted { attempts, last }) => {
                return Err(HarvestError::ExhaustedRetries {
                    url: url.to_string(),
                    attempts,
                    last_error: last.to_string(),
                });
            }
        };

        if self.store.mark_completed(url, Utc::now()).await?.is_none() {
            let from = self
                .store
                .get_log(url)
                .await?
                .map_or(CheckpointStatus::Pending, |l| l.status);
            return Err(HarvestError::InvalidTransition {
                url: url.to_string(),
                from,
                to: CheckpointStatus::Completed,
            });
        }
        Ok(HarvestOutcome::Harvested(server))
    }

    /// Insert a `pending` checkpoint unless one exists.
    pub async fn enqueue(&self, kind: HostType, url: &str) -> Result<bool, HarvestError> {
        let inserted = self.store.enqueue(url, kind, Utc::now()).await?;
        if inserted {
            tracing::debug!(url, kind = %kind, "enqueued");
        }
        Ok(inserted)
    }

    /// Harvest up to `limit` pending checkpoints, `fan_out` at a time.
    pub async fn harvest_pending(&self, limit: i64) -> Result<BulkOutcome, HarvestError> {
        let pending = self
            .store
            .list_logs(CheckpointStatus::Pending, None, Some(limit))
            .await?;
        if pending.is_empty() {
            return Ok(BulkOutcome::default());
        }
        tracing::info!(count = pending.len(), "harvesting pending queue");

        let results: Vec<(String, Result<HarvestOutcome, HarvestError>)> =
            stream::iter(pending.into_iter().map(|log| async move {
                let result = self
                    .harvest(log.host_type, &log.url, HarvestMode::Normal)
                    .await;
                (log.url, result)
            }))
            .buffer_unordered(self.config.fan_out.max(1))
            .collect()
            .await;

        let mut outcome = BulkOutcome::default();
        for (url, result) in results {
            match result {
                Ok(_) => outcome.succeeded += 1,
                Err(e) => outcome.failures.push(RowFailure::new(url, e)),
            }
        }
        Ok(outcome)
    }

    // ── internals ────────────────────────────────────────────────────────

    async fn completed_server(&self, url: &str) -> Result<Option<Server>, HarvestError> {
        match self.store.get_log(url).await? {
            Some(log) if log.status == CheckpointStatus::Completed => {
                Ok(self.store.get_server_by_url(url).await?)
            }
            _ => Ok(None),
        }
    }

    async fn claim(
        &self,
        kind: HostType,
        url: &str,
        force: bool,
    ) -> Result<ClaimOutcome, HarvestError> {
        let now = Utc::now();
        let stale_secs = self.config.stale_claim_secs.min(i32::MAX as u64) as i64;
        let request = ClaimRequest {
            url,
            host_type: kind,
            force,
            now,
            stale_before: now - chrono::Duration::seconds(stale_secs),
        };
        Ok(self.store.claim(request).await?)
    }

    /// Move a `failed` checkpoint back to `processing` for the next attempt.
    async fn reclaim(&self, kind: HostType, url: &str) -> Result<(), HarvestError> {
        match self.claim(kind, url, false).await? {
            ClaimOutcome::Claimed(_) => Ok(()),
            ClaimOutcome::Busy(_) => Err(HarvestError::InFlight {
                url: url.to_string(),
            }),
            ClaimOutcome::Completed(log) => Err(HarvestError::InvalidTransition {
                url: url.to_string(),
                from: log.status,
                to: CheckpointStatus::Processing,
            }),
        }
    }

    async fn run_attempt(&self, kind: HostType, url: &str) -> Result<Server, HarvestError> {
        let adapter = self
            .adapters
            .get(kind)
            .ok_or(HarvestError::UnsupportedSource(kind))?;
        let deadline = self.config.attempt_timeout();

        let attempt = async {
            let payload = adapter.fetch(url).await?;
            let server = adapter.parse(&payload)?;
            let stored = adapter
                .store(self.store.as_ref(), &server, Utc::now())
                .await?;
            Ok::<Server, HarvestError>(stored)
        };

        match tokio::time::timeout(deadline, attempt).await {
            Ok(result) => result,
            Err(_) => Err(HarvestError::Timeout {
                url: url.to_string(),
                after: deadline,
            }),
        }
    }

    async fn fail_checkpoint(&self, url: &str, err: &HarvestError) {
        match self.store.mark_failed(url, &err.to_string(), Utc::now()).await {
            Ok(Some(_)) => {}
            Ok(None) => tracing::warn!(url, "checkpoint was not processing when the attempt failed"),
            Err(e) => tracing::error!(url, error = %e, "failed to record failed checkpoint"),
        }
    }

    fn locks(&self) -> MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        self.url_locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn url_lock(&self, url: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks().entry(url.to_string()).or_default().clone()
    }

    /// Drop the entry once no caller holds it.
    fn release_url_lock(&self, url: &str) {
        let mut locks = self.locks();
        if locks.get(url).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(url);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::json;

    use crate::adapters::{RawPayload, SourceAdapter};
    use crate::error::{FetchError, ParseError};
    use crate::metrics::InMemoryMetrics;
    use crate::store::InMemoryStore;

    #[derive(Clone, Copy)]
    enum Behaviour {
        Succeed,
        /// Fail with a transient error this many times, then succeed.
        FailTimes(u32),
        AlwaysFail,
        InvalidUrl,
        Hang,
    }

    struct MockAdapter {
        behaviour: Behaviour,
        fetches: AtomicU32,
    }

    impl MockAdapter {
        fn new(behaviour: Behaviour) -> Arc<Self> {
            Arc::new(Self {
                behaviour,
                fetches: AtomicU32::new(0),
            })
        }

        fn fetches(&self) -> u32 {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SourceAdapter for MockAdapter {
        fn host_type(&self) -> HostType {
            HostType::Npm
        }

        fn description(&self) -> &str {
            "mock"
        }

        async fn fetch(&self, url: &str) -> Result<RawPayload, FetchError> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
            let transient = || FetchError::Http {
                status: 503,
                url: url.to_string(),
                body: String::new(),
            };
            match self.behaviour {
                Behaviour::Succeed => {}
                Behaviour::FailTimes(times) if n <= times => return Err(transient()),
                Behaviour::FailTimes(_) => {}
                Behaviour::AlwaysFail => return Err(transient()),
                Behaviour::InvalidUrl => {
                    return Err(FetchError::InvalidUrl {
                        kind: HostType::Npm,
                        url: url.to_string(),
                        reason: "bad".to_string(),
                    })
                }
                Behaviour::Hang => tokio::time::sleep(Duration::from_secs(3600)).await,
            }
            Ok(RawPayload::new(url, HostType::Npm, json!({"name": "mock-server"})))
        }

        fn parse(&self, payload: &RawPayload) -> Result<Server, ParseError> {
            let name = payload
                .document
                .get("name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ParseError::MissingField("name".to_string()))?;
            Ok(Server::new(name, &payload.url, HostType::Npm, payload.fetched_at))
        }
    }

    struct Fixture {
        orchestrator: Arc<HarvestOrchestrator>,
        store: Arc<InMemoryStore>,
        metrics: Arc<InMemoryMetrics>,
        adapter: Arc<MockAdapter>,
    }

    fn fixture(behaviour: Behaviour) -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let metrics = Arc::new(InMemoryMetrics::new());
        let adapter = MockAdapter::new(behaviour);
        let mut registry = AdapterRegistry::new();
        registry.register(adapter.clone());
        let orchestrator = Arc::new(HarvestOrchestrator::new(
            store.clone(),
            registry,
            metrics.clone(),
            HarvestConfig::default(),
        ));
        Fixture {
            orchestrator,
            store,
            metrics,
            adapter,
        }
    }

    const URL: &str = "npm:mock-server";

    #[tokio::test(start_paused = true)]
    async fn test_second_harvest_is_skipped() {
        let f = fixture(Behaviour::Succeed);
        let first = f
            .orchestrator
            .harvest(HostType::Npm, URL, HarvestMode::Normal)
            .await
            .unwrap();
        let second = f
            .orchestrator
            .harvest(HostType::Npm, URL, HarvestMode::Normal)
            .await
            .unwrap();

        assert!(first.is_harvested());
        assert!(!second.is_harvested());
        assert_eq!(first.server().id, second.server().id);
        assert_eq!(f.adapter.fetches(), 1);

        let log = f.store.get_log(URL).await.unwrap().unwrap();
        assert_eq!(log.status, CheckpointStatus::Completed);
        assert_eq!(log.attempts, 1);
        assert!(log.completed_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_refetches() {
        let f = fixture(Behaviour::Succeed);
        f.orchestrator
            .harvest(HostType::Npm, URL, HarvestMode::Normal)
            .await
            .unwrap();
        let again = f
            .orchestrator
            .harvest(HostType::Npm, URL, HarvestMode::Force)
            .await
            .unwrap();
        assert!(again.is_harvested());
        assert_eq!(f.adapter.fetches(), 2);
        assert_eq!(f.store.get_log(URL).await.unwrap().unwrap().attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let f = fixture(Behaviour::FailTimes(2));
        let start = tokio::time::Instant::now();
        let outcome = f
            .orchestrator
            .harvest(HostType::Npm, URL, HarvestMode::Normal)
            .await
            .unwrap();
        assert!(outcome.is_harvested());
        assert_eq!(start.elapsed(), Duration::from_secs(2 + 4));

        let log = f.store.get_log(URL).await.unwrap().unwrap();
        assert_eq!(log.status, CheckpointStatus::Completed);
        assert_eq!(log.attempts, 3);
        assert_eq!(log.last_error, None);
        assert_eq!(f.metrics.counter(HARVEST_ATTEMPTS, &[("kind", "npm")]), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_leave_failed_checkpoint() {
        let f = fixture(Behaviour::AlwaysFail);
        let start = tokio::time::Instant::now();
        let err = f
            .orchestrator
            .harvest(HostType::Npm, URL, HarvestMode::Normal)
            .await
            .unwrap_err();

        match err {
            HarvestError::ExhaustedRetries {
                attempts,
                ref last_error,
                ..
            } => {
                assert_eq!(attempts, 5);
                assert!(last_error.contains("503"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(start.elapsed(), Duration::from_secs(2 + 4 + 8 + 16));

        let log = f.store.get_log(URL).await.unwrap().unwrap();
        assert_eq!(log.status, CheckpointStatus::Failed);
        assert_eq!(log.attempts, 5);
        assert!(log.last_error.is_some());
        assert_eq!(
            f.metrics.counter(
                HARVEST_OUTCOMES,
                &[("kind", "npm"), ("outcome", "exhausted")]
            ),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_url_fails_without_retry() {
        let f = fixture(Behaviour::InvalidUrl);
        let err = f
            .orchestrator
            .harvest(HostType::Npm, URL, HarvestMode::Normal)
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::Fetch(FetchError::InvalidUrl { .. })));
        assert_eq!(f.adapter.fetches(), 1);

        let log = f.store.get_log(URL).await.unwrap().unwrap();
        assert_eq!(log.status, CheckpointStatus::Failed);
        assert_eq!(log.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_source() {
        let f = fixture(Behaviour::Succeed);
        let err = f
            .orchestrator
            .harvest(HostType::Docker, "docker:mcp/x", HarvestMode::Normal)
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::UnsupportedSource(HostType::Docker)));
        let log = f.store.get_log("docker:mcp/x").await.unwrap().unwrap();
        assert_eq!(log.status, CheckpointStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_consumes_retry_budget() {
        let store = Arc::new(InMemoryStore::new());
        let adapter = MockAdapter::new(Behaviour::Hang);
        let mut registry = AdapterRegistry::new();
        registry.register(adapter.clone());
        let config = HarvestConfig {
            max_attempts: 2,
            attempt_timeout_secs: 10,
            ..HarvestConfig::default()
        };
        let orchestrator =
            HarvestOrchestrator::new(store.clone(), registry, Arc::new(InMemoryMetrics::new()), config);

        let err = orchestrator
            .harvest(HostType::Npm, URL, HarvestMode::Normal)
            .await
            .unwrap_err();
        match err {
            HarvestError::ExhaustedRetries {
                attempts,
                last_error,
                ..
            } => {
                assert_eq!(attempts, 2);
                assert!(last_error.contains("timed out"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(adapter.fetches(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_claim_elsewhere_is_in_flight() {
        let f = fixture(Behaviour::Succeed);
        let now = Utc::now();
        f.store
            .claim(ClaimRequest {
                url: URL,
                host_type: HostType::Npm,
                force: false,
                now,
                stale_before: now - chrono::Duration::minutes(10),
            })
            .await
            .unwrap();

        let err = f
            .orchestrator
            .harvest(HostType::Npm, URL, HarvestMode::Normal)
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::InFlight { .. }));
        assert_eq!(f.adapter.fetches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_same_url_fetches_once() {
        let f = fixture(Behaviour::Succeed);
        let a = f.orchestrator.clone();
        let b = f.orchestrator.clone();
        let (ra, rb) = tokio::join!(
            a.harvest(HostType::Npm, URL, HarvestMode::Normal),
            b.harvest(HostType::Npm, URL, HarvestMode::Normal),
        );
        let harvested = [ra.unwrap(), rb.unwrap()]
            .iter()
            .filter(|o| o.is_harvested())
            .count();
        assert_eq!(harvested, 1);
        assert_eq!(f.adapter.fetches(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_harvest_pending_queue() {
        let f = fixture(Behaviour::Succeed);
        for name in ["a", "b", "c"] {
            assert!(f
                .orchestrator
                .enqueue(HostType::Npm, &format!("npm:{name}"))
                .await
                .unwrap());
        }
        assert!(!f.orchestrator.enqueue(HostType::Npm, "npm:a").await.unwrap());

        let outcome = f.orchestrator.harvest_pending(10).await.unwrap();
        assert_eq!(outcome.succeeded, 3);
        assert!(outcome.failures.is_empty());
        assert_eq!(f.adapter.fetches(), 3);
        assert!(f
            .store
            .list_logs(CheckpointStatus::Pending, None, None)
            .await
            .unwrap()
            .is_empty());
    }
}
