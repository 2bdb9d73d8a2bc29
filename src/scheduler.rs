//! Background job scheduler.
//!
//! A [`Scheduler`] owns a table of jobs, each with a [`Trigger`]. `start`
//! spawns one driver task per job; `stop` cancels them through a shared
//! [`CancellationToken`] and waits for them to exit.
//!
//! ```text
//! driver loop (per job)
//!   next = trigger.next_after(now)
//!   sleep until next ─── cancelled ──▶ exit
//!   previous run active?  yes ─▶ skip
//!                         no  ─▶ spawn run, record outcome
//! ```
//!
//! The next fire time is always computed from the current time after
//! waking, so a late wake-up never replays missed fires: they collapse into
//! the run about to happen. Job failures (including panics) are recorded
//! in the job state and never stop the scheduler.
//!
//! Waits are taken in chunks of at most [`WAKE_CHECK`], and each chunk
//! re-reads the wall clock. A host suspend or a clock step therefore
//! delays a fire by one chunk at most. Fire times are not persisted: a
//! fire that fell inside a process restart is not replayed.
//!
//! All trigger times are UTC.

pub mod jobs;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveTime, TimeZone, Utc, Weekday};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant as MonoInstant;
use tokio_util::sync::CancellationToken;

use crate::metrics::{MetricsSink, JOB_DURATION, JOB_RUNS};

/// Longest single sleep before the driver re-checks the wall clock.
pub const WAKE_CHECK: Duration = Duration::from_secs(60);

/// When a job fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Interval(Duration),
    Daily { hour: u32, minute: u32 },
    Weekly {
        weekday: Weekday,
        hour: u32,
        minute: u32,
    },
}

impl Trigger {
    /// First fire time strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            Trigger::Interval(every) => {
                now + chrono::Duration::from_std(every).unwrap_or(chrono::Duration::zero())
            }
            Trigger::Daily { hour, minute } => {
                let candidate = at_time_of_day(now, 0, hour, minute);
                if candidate > now {
                    candidate
                } else {
                    candidate + chrono::Duration::days(1)
                }
            }
            Trigger::Weekly {
                weekday,
                hour,
                minute,
            } => {
                let days_ahead = (7 + weekday.num_days_from_monday()
                    - now.weekday().num_days_from_monday())
                    % 7;
                let candidate = at_time_of_day(now, i64::from(days_ahead), hour, minute);
                if candidate > now {
                    candidate
                } else {
                    candidate + chrono::Duration::days(7)
                }
            }
        }
    }
}

/// `hour:minute` UTC on the day `days` after `now`'s date.
fn at_time_of_day(now: DateTime<Utc>, days: i64, hour: u32, minute: u32) -> DateTime<Utc> {
    let midnight = Utc.from_utc_datetime(&now.date_naive().and_time(NaiveTime::MIN));
    midnight
        + chrono::Duration::days(days)
        + chrono::Duration::hours(i64::from(hour))
        + chrono::Duration::minutes(i64::from(minute))
}

/// A unit of scheduled work.
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "error", rename_all = "lowercase")]
pub enum JobOutcome {
    Success,
    Failure(String),
}

impl JobOutcome {
    fn label(&self) -> &'static str {
        match self {
            JobOutcome::Success => "success",
            JobOutcome::Failure(_) => "failure",
        }
    }
}

#[derive(Debug, Default)]
struct JobState {
    next_run_at: Option<DateTime<Utc>>,
    running: bool,
    last_run_at: Option<DateTime<Utc>>,
    last_outcome: Option<JobOutcome>,
    last_duration: Option<Duration>,
    run_count: u64,
    failure_count: u64,
    skipped_count: u64,
}

/// Snapshot returned by [`Scheduler::status`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatus {
    pub id: String,
    pub name: String,
    pub next_run_at: Option<DateTime<Utc>>,
    pub running: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<JobOutcome>,
    pub last_duration: Option<Duration>,
    pub run_count: u64,
    pub failure_count: u64,
    pub skipped_count: u64,
}

struct ScheduledJob {
    id: String,
    name: String,
    trigger: Trigger,
    job: Arc<dyn Job>,
    state: Arc<Mutex<JobState>>,
}

pub struct Scheduler {
    jobs: Vec<ScheduledJob>,
    metrics: Arc<dyn MetricsSink>,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            jobs: Vec::new(),
            metrics,
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Add a job. Ids must be unique.
    pub fn add_job(
        &mut self,
        id: &str,
        name: &str,
        trigger: Trigger,
        job: Arc<dyn Job>,
    ) -> Result<()> {
        if self.jobs.iter().any(|j| j.id == id) {
            anyhow::bail!("duplicate job id: '{}'", id);
        }
        self.jobs.push(ScheduledJob {
            id: id.to_string(),
            name: name.to_string(),
            trigger,
            job,
            state: Arc::new(Mutex::new(JobState::default())),
        });
        Ok(())
    }

    pub fn job_ids(&self) -> Vec<&str> {
        self.jobs.iter().map(|j| j.id.as_str()).collect()
    }

    /// Spawn one driver task per job. Calling `start` twice is a no-op.
    pub fn start(&self) {
        let mut handles = lock(&self.handles);
        if !handles.is_empty() {
            return;
        }
        for job in &self.jobs {
            let runner = JobRunner {
                id: job.id.clone(),
                job: job.job.clone(),
                state: job.state.clone(),
                metrics: self.metrics.clone(),
            };
            // Recorded before spawning so `status` is complete on return.
            let first = job.trigger.next_after(Utc::now());
            lock(&job.state).next_run_at = Some(first);
            handles.push(tokio::spawn(drive(
                runner,
                job.trigger,
                first,
                self.cancel.clone(),
            )));
        }
        tracing::info!(jobs = self.jobs.len(), "scheduler started");
    }

    /// Cancel every driver and wait for them to exit. Runs already in
    /// progress are left to finish on their own.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = lock(&self.handles).drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "scheduler driver ended abnormally");
            }
        }
        tracing::info!("scheduler stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Run a job immediately, outside its trigger. Returns `None` if the id
    /// is unknown or a run is already active.
    pub async fn run_now(&self, id: &str) -> Option<JobOutcome> {
        let job = self.jobs.iter().find(|j| j.id == id)?;
        let runner = JobRunner {
            id: job.id.clone(),
            job: job.job.clone(),
            state: job.state.clone(),
            metrics: self.metrics.clone(),
        };
        if !runner.try_begin() {
            return None;
        }
        Some(runner.execute().await)
    }

    pub fn status(&self) -> Vec<JobStatus> {
        self.jobs
            .iter()
            .map(|job| {
                let state = lock(&job.state);
                JobStatus {
                    id: job.id.clone(),
                    name: job.name.clone(),
                    next_run_at: state.next_run_at,
                    running: state.running,
                    last_run_at: state.last_run_at,
                    last_outcome: state.last_outcome.clone(),
                    last_duration: state.last_duration,
                    run_count: state.run_count,
                    failure_count: state.failure_count,
                    skipped_count: state.skipped_count,
                }
            })
            .collect()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Everything a driver or a manual run needs to execute one job.
#[derive(Clone)]
struct JobRunner {
    id: String,
    job: Arc<dyn Job>,
    state: Arc<Mutex<JobState>>,
    metrics: Arc<dyn MetricsSink>,
}

impl JobRunner {
    /// Mark the job running unless it already is.
    fn try_begin(&self) -> bool {
        let mut state = lock(&self.state);
        if state.running {
            state.skipped_count += 1;
            return false;
        }
        state.running = true;
        state.last_run_at = Some(Utc::now());
        true
    }

    async fn execute(&self) -> JobOutcome {
        let started = Instant::now();
        tracing::info!(job = %self.id, "job started");

        let job = self.job.clone();
        let outcome = match tokio::spawn(async move { job.run().await }).await {
            Ok(Ok(())) => JobOutcome::Success,
            Ok(Err(e)) => JobOutcome::Failure(format!("{:#}", e)),
            Err(e) => JobOutcome::Failure(format!("job task aborted: {}", e)),
        };
        let elapsed = started.elapsed();

        match &outcome {
            JobOutcome::Success => {
                tracing::info!(job = %self.id, duration_ms = elapsed.as_millis() as u64, "job finished")
            }
            JobOutcome::Failure(error) => {
                tracing::error!(job = %self.id, duration_ms = elapsed.as_millis() as u64, error = %error, "job failed")
            }
        }
        self.metrics.increment_counter(
            JOB_RUNS,
            &[("job", self.id.as_str()), ("outcome", outcome.label())],
        );
        self.metrics.record_histogram(
            JOB_DURATION,
            elapsed.as_secs_f64(),
            &[("job", self.id.as_str())],
        );

        let mut state = lock(&self.state);
        state.running = false;
        state.run_count += 1;
        if matches!(outcome, JobOutcome::Failure(_)) {
            state.failure_count += 1;
        }
        state.last_duration = Some(elapsed);
        state.last_outcome = Some(outcome.clone());
        outcome
    }
}

/// Time left until `next`: whichever of the wall clock and the monotonic
/// deadline says is sooner.
fn time_until(
    next: DateTime<Utc>,
    now: DateTime<Utc>,
    deadline: MonoInstant,
    now_mono: MonoInstant,
) -> Duration {
    let wall = (next - now).to_std().unwrap_or(Duration::ZERO);
    wall.min(deadline.saturating_duration_since(now_mono))
}

/// Sleep until `next` in [`WAKE_CHECK`] chunks. Returns `false` if cancelled.
async fn sleep_until_fire(next: DateTime<Utc>, cancel: &CancellationToken) -> bool {
    let deadline =
        MonoInstant::now() + (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    loop {
        let remaining = time_until(next, Utc::now(), deadline, MonoInstant::now());
        if remaining.is_zero() {
            return true;
        }
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(remaining.min(WAKE_CHECK)) => {}
        }
    }
}

async fn drive(
    runner: JobRunner,
    trigger: Trigger,
    first: DateTime<Utc>,
    cancel: CancellationToken,
) {
    let mut next = first;
    loop {
        if !sleep_until_fire(next, &cancel).await {
            break;
        }
        next = trigger.next_after(Utc::now());
        lock(&runner.state).next_run_at = Some(next);

        if !runner.try_begin() {
            tracing::warn!(job = %runner.id, "previous run still active, skipping");
            runner.metrics.increment_counter(
                JOB_RUNS,
                &[("job", runner.id.as_str()), ("outcome", "skipped")],
            );
            continue;
        }

        let run = runner.clone();
        tokio::spawn(async move {
            run.execute().await;
        });
    }
    tracing::debug!(job = %runner.id, "driver exiting");
}
