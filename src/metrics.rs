//! Counters and histograms for harvests and scheduled jobs.
//!
//! The harvester only talks to the [`MetricsSink`] trait. [`TracingMetrics`]
//! emits every observation as a structured `tracing` event (target
//! `metrics`), which is what the binary uses. [`InMemoryMetrics`] keeps
//! everything in maps so tests can assert on it.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub const HARVEST_OUTCOMES: &str = "harvest_outcomes_total";
pub const HARVEST_DURATION: &str = "harvest_duration_seconds";
pub const HARVEST_ATTEMPTS: &str = "harvest_attempts_total";
pub const JOB_RUNS: &str = "scheduler_job_runs_total";
pub const JOB_DURATION: &str = "scheduler_job_duration_seconds";

pub type Labels<'a> = &'a [(&'a str, &'a str)];

pub trait MetricsSink: Send + Sync {
    fn increment_counter(&self, name: &str, labels: Labels<'_>);

    fn record_histogram(&self, name: &str, value: f64, labels: Labels<'_>);
}

/// Emits metrics as `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn increment_counter(&self, name: &str, labels: Labels<'_>) {
        tracing::debug!(target: "metrics", metric = name, labels = %render_labels(labels), "counter +1");
    }

    fn record_histogram(&self, name: &str, value: f64, labels: Labels<'_>) {
        tracing::debug!(
            target: "metrics",
            metric = name,
            value,
            labels = %render_labels(labels),
            "histogram observation"
        );
    }
}

/// Keeps observations in memory, keyed by `name{k=v,…}`.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<BTreeMap<String, u64>>,
    histograms: Mutex<BTreeMap<String, Vec<f64>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter value for an exact label set.
    pub fn counter(&self, name: &str, labels: Labels<'_>) -> u64 {
        lock(&self.counters)
            .get(&series_key(name, labels))
            .copied()
            .unwrap_or(0)
    }

    /// Sum of a counter across all label sets.
    pub fn counter_total(&self, name: &str) -> u64 {
        lock(&self.counters)
            .iter()
            .filter(|(key, _)| metric_name(key) == name)
            .map(|(_, v)| *v)
            .sum()
    }

    pub fn observations(&self, name: &str, labels: Labels<'_>) -> Vec<f64> {
        lock(&self.histograms)
            .get(&series_key(name, labels))
            .cloned()
            .unwrap_or_default()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment_counter(&self, name: &str, labels: Labels<'_>) {
        *lock(&self.counters)
            .entry(series_key(name, labels))
            .or_insert(0) += 1;
    }

    fn record_histogram(&self, name: &str, value: f64, labels: Labels<'_>) {
        lock(&self.histograms)
            .entry(series_key(name, labels))
            .or_default()
            .push(value);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn render_labels(labels: Labels<'_>) -> String {
    let mut sorted: Vec<_> = labels.to_vec();
    sorted.sort();
    sorted
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

fn series_key(name: &str, labels: Labels<'_>) -> String {
    format!("{}{{{}}}", name, render_labels(labels))
}

fn metric_name(key: &str) -> &str {
    key.split('{').next().unwrap_or(key)
}
