//! Statistics cache fed by the `cache_warmup` job.
//!
//! The read API that consumes the cache lives outside this crate; it only
//! sees the [`CacheWarmer`] seam. [`StatsCache`] is the in-process
//! implementation the binary uses.

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::models::CatalogStats;

#[async_trait]
pub trait CacheWarmer: Send + Sync {
    /// Replace cached statistics with a freshly computed snapshot.
    async fn warm(&self, stats: CatalogStats, computed_at: DateTime<Utc>) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedStats {
    pub stats: CatalogStats,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct StatsCache {
    entry: RwLock<Option<CachedStats>>,
}

impl StatsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<CachedStats> {
        self.entry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Cached snapshot if it is younger than `max_age` at `now`.
    pub fn get_fresh(&self, max_age: Duration, now: DateTime<Utc>) -> Option<CachedStats> {
        self.get().filter(|c| now - c.computed_at <= max_age)
    }
}

#[async_trait]
impl CacheWarmer for StatsCache {
    async fn warm(&self, stats: CatalogStats, computed_at: DateTime<Utc>) -> anyhow::Result<()> {
        *self.entry.write().unwrap_or_else(PoisonError::into_inner) = Some(CachedStats {
            stats,
            computed_at,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_warm_and_expire() {
        let cache = StatsCache::new();
        assert!(cache.get().is_none());

        let at = Utc::now();
        let stats = CatalogStats {
            total_servers: 7,
            ..Default::default()
        };
        cache.warm(stats, at).await.unwrap();

        assert_eq!(cache.get().unwrap().stats.total_servers, 7);
        assert!(cache.get_fresh(Duration::hours(1), at + Duration::minutes(30)).is_some());
        assert!(cache.get_fresh(Duration::hours(1), at + Duration::hours(2)).is_none());
    }
}
