//! The standard maintenance jobs.
//!
//! | Id | Trigger | Work |
//! |----|---------|------|
//! | `content_harvest` | daily at `scheduler.harvest_at` | enqueue seeds, drain the pending queue |
//! | `refresh_stale` | every `scheduler.refresh_interval_mins` | [`CatalogUpdater::refresh_stale`] |
//! | `recalculate_health` | daily at `scheduler.health_at` | [`CatalogUpdater::recalculate_health_scores`] |
//! | `prune_stale` | weekly on `scheduler.prune_weekday` | [`CatalogUpdater::prune_stale`] |
//! | `cache_warmup` | every `scheduler.cache_interval_mins` | statistics into a [`CacheWarmer`] |

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;

use crate::cache::CacheWarmer;
use crate::catalog::{BulkOutcome, CatalogUpdater};
use crate::config::{parse_time_of_day, Config, SeedConfig};

use super::{Job, Scheduler, Trigger};

pub const CONTENT_HARVEST: &str = "content_harvest";
pub const REFRESH_STALE: &str = "refresh_stale";
pub const RECALCULATE_HEALTH: &str = "recalculate_health";
pub const PRUNE_STALE: &str = "prune_stale";
pub const CACHE_WARMUP: &str = "cache_warmup";

fn log_sweep(job: &str, outcome: &BulkOutcome) {
    for failure in &outcome.failures {
        tracing::warn!(job, key = %failure.key, error = %failure.error, "row failed");
    }
    tracing::info!(
        job,
        succeeded = outcome.succeeded,
        failed = outcome.failures.len(),
        "sweep summary"
    );
}

/// Enqueue every seed URL, then harvest pending checkpoints.
pub struct ContentHarvestJob {
    catalog: Arc<CatalogUpdater>,
    seeds: Vec<SeedConfig>,
    batch: i64,
}

impl ContentHarvestJob {
    pub fn new(catalog: Arc<CatalogUpdater>, seeds: Vec<SeedConfig>, batch: i64) -> Self {
        Self {
            catalog,
            seeds,
            batch,
        }
    }
}

#[async_trait]
impl Job for ContentHarvestJob {
    async fn run(&self) -> Result<()> {
        let harvester = self.catalog.harvester();
        let mut enqueued = 0usize;
        for seed in &self.seeds {
            if harvester
                .enqueue(seed.kind, &seed.url)
                .await
                .with_context(|| format!("Failed to enqueue {}", seed.url))?
            {
                enqueued += 1;
            }
        }
        tracing::debug!(seeds = self.seeds.len(), enqueued, "seeds enqueued");

        let outcome = harvester
            .harvest_pending(self.batch)
            .await
            .context("Failed to drain pending queue")?;
        log_sweep(CONTENT_HARVEST, &outcome);
        Ok(())
    }
}

pub struct RefreshStaleJob {
    catalog: Arc<CatalogUpdater>,
    max_age: chrono::Duration,
}

impl RefreshStaleJob {
    pub fn new(catalog: Arc<CatalogUpdater>, max_age: chrono::Duration) -> Self {
        Self { catalog, max_age }
    }
}

#[async_trait]
impl Job for RefreshStaleJob {
    async fn run(&self) -> Result<()> {
        let outcome = self.catalog.refresh_stale(self.max_age).await?;
        log_sweep(REFRESH_STALE, &outcome);
        Ok(())
    }
}

pub struct RecalculateHealthJob {
    catalog: Arc<CatalogUpdater>,
}

impl RecalculateHealthJob {
    pub fn new(catalog: Arc<CatalogUpdater>) -> Self {
        Self { catalog }
    }
}

#[async_trait]
impl Job for RecalculateHealthJob {
    async fn run(&self) -> Result<()> {
        let outcome = self.catalog.recalculate_health_scores(Utc::now()).await?;
        log_sweep(RECALCULATE_HEALTH, &outcome);
        Ok(())
    }
}

pub struct PruneStaleJob {
    catalog: Arc<CatalogUpdater>,
    max_age: chrono::Duration,
}

impl PruneStaleJob {
    pub fn new(catalog: Arc<CatalogUpdater>, max_age: chrono::Duration) -> Self {
        Self { catalog, max_age }
    }
}

#[async_trait]
impl Job for PruneStaleJob {
    async fn run(&self) -> Result<()> {
        self.catalog.prune_stale(self.max_age).await?;
        Ok(())
    }
}

pub struct CacheWarmupJob {
    catalog: Arc<CatalogUpdater>,
    warmer: Arc<dyn CacheWarmer>,
}

impl CacheWarmupJob {
    pub fn new(catalog: Arc<CatalogUpdater>, warmer: Arc<dyn CacheWarmer>) -> Self {
        Self { catalog, warmer }
    }
}

#[async_trait]
impl Job for CacheWarmupJob {
    async fn run(&self) -> Result<()> {
        let stats = self.catalog.get_statistics().await?;
        let total = stats.total_servers;
        self.warmer
            .warm(stats, Utc::now())
            .await
            .context("Failed to warm statistics cache")?;
        tracing::debug!(total_servers = total, "statistics cache warmed");
        Ok(())
    }
}

/// Register the five standard jobs from `config`.
pub fn register_standard_jobs(
    scheduler: &mut Scheduler,
    config: &Config,
    catalog: Arc<CatalogUpdater>,
    warmer: Arc<dyn CacheWarmer>,
) -> Result<()> {
    let sc = &config.scheduler;

    let (hour, minute) = parse_time_of_day(&sc.harvest_at)?;
    scheduler.add_job(
        CONTENT_HARVEST,
        "Harvest seeds and pending queue",
        Trigger::Daily { hour, minute },
        Arc::new(ContentHarvestJob::new(
            catalog.clone(),
            config.seeds.clone(),
            sc.pending_batch,
        )),
    )?;

    scheduler.add_job(
        REFRESH_STALE,
        "Refresh stale servers",
        Trigger::Interval(Duration::from_secs(sc.refresh_interval_mins * 60)),
        Arc::new(RefreshStaleJob::new(
            catalog.clone(),
            chrono::Duration::days(sc.stale_after_days),
        )),
    )?;

    let (hour, minute) = parse_time_of_day(&sc.health_at)?;
    scheduler.add_job(
        RECALCULATE_HEALTH,
        "Recalculate health scores",
        Trigger::Daily { hour, minute },
        Arc::new(RecalculateHealthJob::new(catalog.clone())),
    )?;

    let (hour, minute) = parse_time_of_day(&sc.prune_at)?;
    scheduler.add_job(
        PRUNE_STALE,
        "Prune stale servers",
        Trigger::Weekly {
            weekday: sc.prune_weekday()?,
            hour,
            minute,
        },
        Arc::new(PruneStaleJob::new(
            catalog.clone(),
            chrono::Duration::days(sc.prune_after_days),
        )),
    )?;

    scheduler.add_job(
        CACHE_WARMUP,
        "Warm statistics cache",
        Trigger::Interval(Duration::from_secs(sc.cache_interval_mins * 60)),
        Arc::new(CacheWarmupJob::new(catalog, warmer)),
    )?;

    Ok(())
}
