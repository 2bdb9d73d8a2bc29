//! Wiring of the long-lived components.
//!
//! ```text
//! Config ─▶ SqlitePool ─▶ SqliteStore ─┐
//!        ─▶ AdapterRegistry ───────────┼─▶ HarvestOrchestrator ─▶ CatalogUpdater
//!        ─▶ MetricsSink ───────────────┘                                │
//!                                                                       ▼
//!                                                                   Scheduler
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use crate::adapters::AdapterRegistry;
use crate::cache::CacheWarmer;
use crate::catalog::CatalogUpdater;
use crate::config::Config;
use crate::db;
use crate::harvest::HarvestOrchestrator;
use crate::metrics::{MetricsSink, TracingMetrics};
use crate::migrate;
use crate::scheduler::{jobs, Scheduler};
use crate::store::SqliteStore;

pub struct App {
    pub config: Config,
    pub pool: SqlitePool,
    pub metrics: Arc<dyn MetricsSink>,
    pub harvester: Arc<HarvestOrchestrator>,
    pub catalog: Arc<CatalogUpdater>,
}

impl App {
    /// Connect, apply pending migrations and build the built-in adapters.
    pub async fn open(config: Config) -> Result<Self> {
        let registry = AdapterRegistry::from_config(&config)?;
        Self::open_with(config, registry, Arc::new(TracingMetrics)).await
    }

    /// Like [`open`](Self::open) with caller-supplied adapters and metrics.
    pub async fn open_with(
        config: Config,
        registry: AdapterRegistry,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self> {
        let pool = db::connect(&config)
            .await
            .with_context(|| format!("Failed to open database {}", config.db.path.display()))?;
        let applied = migrate::apply_pending(&pool).await?;
        if !applied.is_empty() {
            tracing::info!(versions = ?applied, "applied migrations");
        }

        let store = Arc::new(SqliteStore::new(pool.clone()));
        let harvester = Arc::new(HarvestOrchestrator::new(
            store,
            registry,
            metrics.clone(),
            config.harvest.clone(),
        ));
        let catalog = Arc::new(CatalogUpdater::new(harvester.clone()));

        Ok(Self {
            config,
            pool,
            metrics,
            harvester,
            catalog,
        })
    }

    /// Scheduler with the standard jobs registered.
    pub fn scheduler(&self, warmer: Arc<dyn CacheWarmer>) -> Result<Scheduler> {
        let mut scheduler = Scheduler::new(self.metrics.clone());
        jobs::register_standard_jobs(&mut scheduler, &self.config, self.catalog.clone(), warmer)?;
        Ok(scheduler)
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}
