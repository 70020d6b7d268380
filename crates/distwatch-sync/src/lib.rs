//! Orchestration of the district dataset refresh and jurisdiction monitoring pipeline.
//!
//! `DistrictWatch` wires the components together over one data directory and exposes the
//! operations callers use; `DistrictWatch::build_scheduler` turns the same operations into
//! the static job table driven by the scheduler loop.

pub mod config;
mod monitor;
mod notify;
mod scheduler;
mod update;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::Utc;
use distwatch_adapters::{PortalHttp, PortalMarkerScraper, SourceFetcher};
use distwatch_core::{DigestPeriod, DistrictDataset, MonitoringResult, MonitoringSummary};
use distwatch_ingest::{ContentValidator, CsvTransformer, ValidationReport};
use distwatch_storage::{
    DatasetRepository, HttpFetcher, JsonRepository, RetrySchedule, StoreError, DATASET_DIR,
};
use serde::Serialize;
use tracing::info;

pub use config::{
    ConfigError, HttpSettings, MonitorConfig, NotifyConfig, RetentionConfig, ScheduleConfig,
    WatchConfig, JOB_CLEANUP, JOB_DAILY_DIGEST, JOB_FORCE_UPDATE, JOB_MONITOR_SWEEP,
    JOB_UPDATE_CHECK, JOB_WEEKLY_DIGEST,
};
pub use monitor::{
    evaluate, fold_outcomes, signature_matches, summarize, tag_density, ChangeMonitor,
    CheckOutcome, ContentNormalizer, DefaultTargetFetcher, MonitorError, SweepReport,
    TargetFetchError, TargetFetcher,
};
pub use notify::{
    classify, cooldown_key, DeliveryChannel, DeliveryError, Digest, DigestReport, DispatchReport,
    LogDelivery, NotificationDispatcher, NotifyError, WebhookDelivery,
};
pub use scheduler::{
    job_fn, minute_key, CronField, CronParseError, CronPattern, JobCallback, JobOutcome, JobRun,
    Scheduler, SchedulerError,
};
pub use update::{
    UpdateFailure, UpdateReport, UpdateStage, UpdateSummary, UpdateTracker, MANUAL_IMPORT,
};

pub const CRATE_NAME: &str = "distwatch-sync";

/// The network and delivery edges of the pipeline.
pub struct Collaborators {
    pub portal: Arc<dyn PortalHttp>,
    pub targets: Arc<dyn TargetFetcher>,
    pub delivery: Arc<dyn DeliveryChannel>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepOutcome {
    pub sweep: SweepReport,
    pub dispatch: DispatchReport,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub datasets_pruned: usize,
    pub cooldowns_pruned: usize,
    pub temp_files_removed: usize,
}

pub struct DistrictWatch {
    config: WatchConfig,
    repo: Arc<JsonRepository>,
    validator: ContentValidator,
    updater: UpdateTracker,
    monitor: ChangeMonitor,
    dispatcher: NotificationDispatcher,
}

impl DistrictWatch {
    /// Build against the real portal, real targets and the configured delivery channel.
    pub fn new(config: WatchConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let portal = HttpFetcher::new(config.http.client_config())
            .context("building portal http client")?;

        // The monitor runs its own timeout and retry loop per target.
        let mut target_http = config.http.client_config();
        target_http.timeout = config.monitor.check_timeout();
        target_http.retry = RetrySchedule::none();
        let targets = DefaultTargetFetcher::new(
            HttpFetcher::new(target_http).context("building target http client")?,
            config.data_dir.clone(),
        );

        let delivery: Arc<dyn DeliveryChannel> = match &config.notify.webhook_url {
            Some(url) => Arc::new(
                WebhookDelivery::new(url.clone(), Duration::from_secs(config.http.timeout_secs))
                    .context("building webhook client")?,
            ),
            None => Arc::new(LogDelivery),
        };

        Self::with_collaborators(
            config,
            Collaborators {
                portal: Arc::new(portal),
                targets: Arc::new(targets),
                delivery,
            },
        )
    }

    pub fn with_collaborators(
        config: WatchConfig,
        collaborators: Collaborators,
    ) -> anyhow::Result<Self> {
        let repo = Arc::new(JsonRepository::new(config.data_dir.clone()));
        let validator = ContentValidator::new(config.validator.clone());

        let source = SourceFetcher::new(
            collaborators.portal.clone(),
            validator.clone(),
            config.portal.clone(),
        )
        .context("compiling portal extraction patterns")?;
        let markers =
            PortalMarkerScraper::new(collaborators.portal, config.portal.landing_url.clone())
                .context("compiling marker patterns")?;
        let updater = UpdateTracker::new(
            Arc::new(markers),
            Arc::new(source),
            validator.clone(),
            CsvTransformer::new(config.transformer.clone()),
            repo.clone(),
            repo.clone(),
        );

        let monitor = ChangeMonitor::new(
            collaborators.targets,
            repo.clone(),
            repo.clone(),
            config.monitor.clone(),
        )
        .context("compiling normalization patterns")?;
        let dispatcher = NotificationDispatcher::new(
            repo.clone(),
            collaborators.delivery,
            config.notify.cooldown_hours,
        );

        Ok(Self {
            config,
            repo,
            validator,
            updater,
            monitor,
            dispatcher,
        })
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    pub fn data_dir(&self) -> &Path {
        self.repo.data_dir()
    }

    pub async fn get_latest_dataset(&self) -> Result<Option<DistrictDataset>, StoreError> {
        Ok(self.repo.latest_dataset().await?.map(|(_, dataset)| dataset))
    }

    pub async fn run_update_check(&self, force: bool) -> Result<UpdateReport, StoreError> {
        self.updater.run(force).await
    }

    pub async fn trigger_force_update(&self) -> Result<UpdateReport, StoreError> {
        self.run_update_check(true).await
    }

    pub fn validate_bytes(&self, bytes: &[u8]) -> ValidationReport {
        self.validator.validate(bytes)
    }

    pub async fn import_dataset_file(&self, path: &Path) -> anyhow::Result<UpdateReport> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let report = self
            .updater
            .import_bytes(&bytes, &path.display().to_string())
            .await?;
        Ok(report)
    }

    pub async fn run_monitor_sweep(&self) -> anyhow::Result<SweepOutcome> {
        let now = Utc::now();
        let sweep = self.monitor.sweep(now).await?;
        let dispatch = self.dispatcher.dispatch(&sweep.results, now).await?;
        Ok(SweepOutcome { sweep, dispatch })
    }

    pub async fn trigger_manual_check(
        &self,
        jurisdiction_key: &str,
    ) -> anyhow::Result<Vec<MonitoringResult>> {
        let now = Utc::now();
        let results = self.monitor.check_jurisdiction(jurisdiction_key, now).await?;
        self.dispatcher.dispatch(&results, now).await?;
        Ok(results)
    }

    pub async fn get_monitoring_summary(&self) -> Result<MonitoringSummary, MonitorError> {
        self.monitor.summary().await
    }

    pub async fn send_digest(&self, period: DigestPeriod) -> Result<DigestReport, NotifyError> {
        self.dispatcher.send_digest(period, Utc::now()).await
    }

    /// Retention for dataset files, expired cooldowns and writer leftovers.
    pub async fn cleanup(&self) -> Result<CleanupReport, StoreError> {
        let datasets_pruned = self
            .repo
            .prune_datasets(self.config.retention.keep_datasets)
            .await?;
        let cooldowns_pruned = self.dispatcher.prune_cooldowns(Utc::now()).await?;
        let store = self.repo.store();
        let temp_files_removed = store.remove_stale_temp_files("").await?
            + store.remove_stale_temp_files(DATASET_DIR).await?;
        let report = CleanupReport {
            datasets_pruned,
            cooldowns_pruned,
            temp_files_removed,
        };
        info!(?report, "cleanup finished");
        Ok(report)
    }

    /// Run one scheduler job by name. The returned line summarizes the run.
    pub async fn run_job(&self, name: &str) -> anyhow::Result<String> {
        match name {
            JOB_UPDATE_CHECK | JOB_FORCE_UPDATE => {
                let report = self.run_update_check(name == JOB_FORCE_UPDATE).await?;
                if !report.is_success() {
                    bail!(report.describe());
                }
                Ok(report.describe())
            }
            JOB_MONITOR_SWEEP => {
                let outcome = self.run_monitor_sweep().await?;
                let summary = &outcome.sweep.summary;
                Ok(format!(
                    "{} checks: {} healthy, {} changed, {} errors, {} unreachable; {} sent, {} queued, {} suppressed",
                    outcome.sweep.results.len(),
                    summary.healthy_count,
                    summary.changed_list.len(),
                    summary.error_list.len(),
                    summary.unreachable_list.len(),
                    outcome.dispatch.immediate_sent,
                    outcome.dispatch.queued,
                    outcome.dispatch.suppressed
                ))
            }
            JOB_DAILY_DIGEST | JOB_WEEKLY_DIGEST => {
                let period = if name == JOB_DAILY_DIGEST {
                    DigestPeriod::Daily
                } else {
                    DigestPeriod::Weekly
                };
                let report = self.send_digest(period).await?;
                Ok(format!(
                    "{} digest delivered {} event(s)",
                    period.as_str(),
                    report.delivered
                ))
            }
            JOB_CLEANUP => {
                let report = self.cleanup().await?;
                Ok(format!(
                    "pruned {} dataset(s), {} cooldown(s), {} temp file(s)",
                    report.datasets_pruned, report.cooldowns_pruned, report.temp_files_removed
                ))
            }
            other => bail!("unknown job {other}"),
        }
    }

    /// The static job table over the configured cron patterns, plus the manual-only
    /// `force_update` job.
    pub fn build_scheduler(self: &Arc<Self>) -> Result<Scheduler, SchedulerError> {
        let mut scheduler = Scheduler::new(self.config.schedule.tick());
        for (name, pattern) in self.config.schedule.jobs() {
            scheduler.register(name, pattern, self.job_callback(name))?;
        }
        scheduler.register_manual(JOB_FORCE_UPDATE, self.job_callback(JOB_FORCE_UPDATE))?;
        Ok(scheduler)
    }

    fn job_callback(self: &Arc<Self>, name: &'static str) -> Arc<dyn JobCallback> {
        let watch = Arc::clone(self);
        job_fn(move || {
            let watch = watch.clone();
            async move { watch.run_job(name).await }
        })
    }
}
