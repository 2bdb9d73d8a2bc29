//! Catalog statistics for `harvester stats`.
//!
//! Prints the aggregate counts from [`CatalogUpdater::get_statistics`]
//! (servers by source kind and risk level, child totals, checkpoint states)
//! plus the database file size and the most recent harvest.

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::catalog::CatalogUpdater;
use crate::config::Config;
use crate::models::{CatalogStats, CheckpointStatus, HostType, RiskLevel, ServerFilter};

/// Run the stats command against an open catalog.
pub async fn run_stats(config: &Config, catalog: &CatalogUpdater) -> Result<()> {
    let stats = catalog.get_statistics().await?;
    let last_harvest = catalog
        .get_servers(&ServerFilter::default())
        .await?
        .iter()
        .filter_map(|s| s.last_harvested_at)
        .max();

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    let db_path = config.db.path.display().to_string();
    print!(
        "{}",
        render(&stats, &db_path, db_size, last_harvest, Utc::now())
    );
    Ok(())
}

fn render(
    stats: &CatalogStats,
    db_path: &str,
    db_size: u64,
    last_harvest: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> String {
    let mut out = String::new();
    let mut line = |s: String| {
        out.push_str(&s);
        out.push('\n');
    };

    line("Catalog Harvester — Catalog Stats".to_string());
    line("=================================".to_string());
    line(String::new());
    line(format!("  Database:      {}", db_path));
    line(format!("  Size:          {}", format_bytes(db_size)));
    line(format!(
        "  Last harvest:  {}",
        last_harvest.map_or_else(|| "never".to_string(), |t| format_relative(t, now))
    ));
    line(String::new());
    line(format!("  Servers:       {}", stats.total_servers));
    line(format!(
        "  Verified:      {} / {}",
        stats.verified_servers, stats.total_servers
    ));
    line(format!("  Avg health:    {:.1}", stats.average_health_score));
    line(format!("  Tools:         {}", stats.total_tools));
    line(format!("  Dependencies:  {}", stats.total_dependencies));
    line(format!("  Contributors:  {}", stats.total_contributors));
    line(format!("  Bus factor 1:  {}", stats.single_maintainer_servers));

    line(String::new());
    line(format!("  {:<12} {:>8}", "SOURCE", "SERVERS"));
    line(format!("  {}", "-".repeat(21)));
    for kind in HostType::ALL {
        let count = stats.by_host_type.get(kind.as_str()).copied().unwrap_or(0);
        line(format!("  {:<12} {:>8}", kind.as_str(), count));
    }

    line(String::new());
    line(format!("  {:<12} {:>8}", "RISK", "SERVERS"));
    line(format!("  {}", "-".repeat(21)));
    for level in RiskLevel::ALL.iter().rev() {
        let count = stats.by_risk_level.get(level.as_str()).copied().unwrap_or(0);
        line(format!("  {:<12} {:>8}", level.as_str(), count));
    }

    line(String::new());
    line(format!("  {:<12} {:>8}", "CHECKPOINT", "URLS"));
    line(format!("  {}", "-".repeat(21)));
    for status in CheckpointStatus::ALL {
        let count = stats.checkpoints.get(status.as_str()).copied().unwrap_or(0);
        line(format!("  {:<12} {:>8}", status.as_str(), count));
    }
    line(String::new());
    out
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// "3 hours ago" style rendering; older than 30 days prints the date.
fn format_relative(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = (now - at).num_seconds();
    let plural = |n: i64| if n == 1 { "" } else { "s" };

    if delta < 0 {
        at.format("%Y-%m-%d %H:%M").to_string()
    } else if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        format!("{} min{} ago", delta / 60, plural(delta / 60))
    } else if delta < 86400 {
        format!("{} hour{} ago", delta / 3600, plural(delta / 3600))
    } else if delta < 86400 * 30 {
        format!("{} day{} ago", delta / 86400, plural(delta / 86400))
    } else {
        at.format("%Y-%m-%d %H:%M").to_string()
    }
}
