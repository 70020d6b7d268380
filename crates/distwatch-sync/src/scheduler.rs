//! Minute-resolution job scheduler over 5-field cron patterns.
//!
//! Fields are minute, hour, day-of-month, month and weekday (0 or 7 = Sunday). Each field is
//! `*` or a single number. Ranges, lists and steps are not supported.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Local, NaiveDateTime, Timelike, Utc};
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, info_span, warn, Instrument};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronParseError {
    #[error("pattern {pattern:?} has {found} fields, expected 5")]
    FieldCount { pattern: String, found: usize },
    #[error("{field} field {value:?} is neither '*' nor a number")]
    InvalidField { field: &'static str, value: String },
    #[error("{field} value {value} outside {min}..={max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("job {0} is already registered")]
    DuplicateJob(String),
    #[error("no job named {0}")]
    UnknownJob(String),
    #[error("job {job}: {source}")]
    Cron {
        job: String,
        #[source]
        source: CronParseError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronField {
    Any,
    Exact(u32),
}

impl CronField {
    fn matches(self, value: u32) -> bool {
        match self {
            CronField::Any => true,
            CronField::Exact(v) => v == value,
        }
    }

    fn parse(raw: &str, field: &'static str, min: u32, max: u32) -> Result<Self, CronParseError> {
        if raw == "*" {
            return Ok(CronField::Any);
        }
        let value: u32 = raw.parse().map_err(|_| CronParseError::InvalidField {
            field,
            value: raw.to_string(),
        })?;
        if value < min || value > max {
            return Err(CronParseError::OutOfRange {
                field,
                value,
                min,
                max,
            });
        }
        Ok(CronField::Exact(value))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronPattern {
    source: String,
    minute: CronField,
    hour: CronField,
    day: CronField,
    month: CronField,
    weekday: CronField,
}

impl CronPattern {
    pub fn parse(pattern: &str) -> Result<Self, CronParseError> {
        let fields: Vec<&str> = pattern.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronParseError::FieldCount {
                pattern: pattern.to_string(),
                found: fields.len(),
            });
        }
        let weekday = match CronField::parse(fields[4], "weekday", 0, 7)? {
            CronField::Exact(7) => CronField::Exact(0),
            other => other,
        };
        Ok(Self {
            source: fields.join(" "),
            minute: CronField::parse(fields[0], "minute", 0, 59)?,
            hour: CronField::parse(fields[1], "hour", 0, 23)?,
            day: CronField::parse(fields[2], "day", 1, 31)?,
            month: CronField::parse(fields[3], "month", 1, 12)?,
            weekday,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Seconds are ignored; the pattern matches the whole minute.
    pub fn matches(&self, at: &NaiveDateTime) -> bool {
        self.minute.matches(at.minute())
            && self.hour.matches(at.hour())
            && self.day.matches(at.day())
            && self.month.matches(at.month())
            && self.weekday.matches(at.weekday().num_days_from_sunday())
    }
}

impl FromStr for CronPattern {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Identifies the calendar minute a job last fired in.
pub fn minute_key(at: &NaiveDateTime) -> String {
    at.format("%Y-%m-%d %H:%M").to_string()
}

#[async_trait]
pub trait JobCallback: Send + Sync {
    /// Runs one invocation; the returned line is logged as the job's result.
    async fn run(&self) -> anyhow::Result<String>;
}

struct FnJob<F>(F);

#[async_trait]
impl<F, Fut> JobCallback for FnJob<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<String>> + Send,
{
    async fn run(&self) -> anyhow::Result<String> {
        (self.0)().await
    }
}

/// Wrap an async closure as a job callback.
pub fn job_fn<F, Fut>(f: F) -> Arc<dyn JobCallback>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<String>> + Send + 'static,
{
    Arc::new(FnJob(f))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded(String),
    Failed(String),
    Panicked(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRun {
    pub job: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: JobOutcome,
}

impl JobRun {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, JobOutcome::Succeeded(_))
    }
}

const MANUAL: &str = "manual";

struct ScheduledJob {
    name: String,
    /// `None` for jobs that only run through [`Scheduler::trigger`].
    pattern: Option<CronPattern>,
    callback: Arc<dyn JobCallback>,
    last_run_minute_key: Mutex<Option<String>>,
}

pub struct Scheduler {
    jobs: Vec<ScheduledJob>,
    tick: Duration,
}

impl Scheduler {
    pub fn new(tick: Duration) -> Self {
        Self {
            jobs: Vec::new(),
            tick,
        }
    }

    pub fn register(
        &mut self,
        name: impl Into<String>,
        pattern: &str,
        callback: Arc<dyn JobCallback>,
    ) -> Result<(), SchedulerError> {
        let name = name.into();
        let pattern = CronPattern::parse(pattern).map_err(|source| SchedulerError::Cron {
            job: name.clone(),
            source,
        })?;
        self.push(name, Some(pattern), callback)
    }

    /// Register a job that never fires on a tick and runs only when triggered.
    pub fn register_manual(
        &mut self,
        name: impl Into<String>,
        callback: Arc<dyn JobCallback>,
    ) -> Result<(), SchedulerError> {
        self.push(name.into(), None, callback)
    }

    fn push(
        &mut self,
        name: String,
        pattern: Option<CronPattern>,
        callback: Arc<dyn JobCallback>,
    ) -> Result<(), SchedulerError> {
        if self.jobs.iter().any(|job| job.name == name) {
            return Err(SchedulerError::DuplicateJob(name));
        }
        self.jobs.push(ScheduledJob {
            name,
            pattern,
            callback,
            last_run_minute_key: Mutex::new(None),
        });
        Ok(())
    }

    /// (name, pattern) of every registered job, in registration order. Manual-only jobs show
    /// `manual` as their pattern.
    pub fn jobs(&self) -> Vec<(&str, &str)> {
        self.jobs
            .iter()
            .map(|job| {
                let pattern = job.pattern.as_ref().map_or(MANUAL, CronPattern::as_str);
                (job.name.as_str(), pattern)
            })
            .collect()
    }

    /// Evaluate every job against `now` and run the due ones concurrently. A job fires at most
    /// once per calendar minute.
    pub async fn tick_at(&self, now: NaiveDateTime) -> Vec<JobRun> {
        let key = minute_key(&now);
        let mut due = Vec::new();
        for job in &self.jobs {
            if !job.pattern.as_ref().is_some_and(|p| p.matches(&now)) {
                continue;
            }
            let mut last = job.last_run_minute_key.lock().await;
            if last.as_deref() == Some(key.as_str()) {
                continue;
            }
            *last = Some(key.clone());
            due.push(job);
        }
        join_all(due.into_iter().map(invoke)).await
    }

    /// Run a job now, bypassing its schedule.
    pub async fn trigger(&self, name: &str) -> Result<JobRun, SchedulerError> {
        let job = self
            .jobs
            .iter()
            .find(|job| job.name == name)
            .ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))?;
        info!(job = %job.name, "manual trigger");
        Ok(invoke(job).await)
    }

    /// Poll on the configured tick until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tokio::pin!(shutdown);
        info!(jobs = self.jobs.len(), tick_secs = self.tick.as_secs(), "scheduler started");
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("scheduler stopping");
                    break;
                }
                _ = interval.tick() => {
                    self.tick_at(Local::now().naive_local()).await;
                }
            }
        }
    }
}

/// Each invocation runs on its own task so a panic stays inside that job.
async fn invoke(job: &ScheduledJob) -> JobRun {
    let started_at = Utc::now();
    let callback = job.callback.clone();
    let span = info_span!("scheduled_job", job = %job.name);
    let handle = tokio::spawn(async move { callback.run().await }.instrument(span));
    let outcome = match handle.await {
        Ok(Ok(summary)) => {
            info!(job = %job.name, %summary, "job finished");
            JobOutcome::Succeeded(summary)
        }
        Ok(Err(err)) => {
            warn!(job = %job.name, error = %format!("{err:#}"), "job failed");
            JobOutcome::Failed(format!("{err:#}"))
        }
        Err(join_err) => {
            error!(job = %job.name, error = %join_err, "job panicked");
            JobOutcome::Panicked(join_err.to_string())
        }
    };
    JobRun {
        job: job.name.clone(),
        started_at,
        finished_at: Utc::now(),
        outcome,
    }
}
