use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use distwatch_adapters::PortalConfig;
use distwatch_ingest::{TransformerConfig, ValidatorConfig};
use distwatch_storage::{HttpClientConfig, RetrySchedule};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scheduler::{CronParseError, CronPattern};

/// Job names of the static scheduler table.
pub const JOB_UPDATE_CHECK: &str = "update_check";
pub const JOB_MONITOR_SWEEP: &str = "monitor_sweep";
pub const JOB_DAILY_DIGEST: &str = "daily_digest";
pub const JOB_WEEKLY_DIGEST: &str = "weekly_digest";
pub const JOB_CLEANUP: &str = "cleanup";
/// Manual-only job: refresh the dataset even when the portal marker is unchanged.
pub const JOB_FORCE_UPDATE: &str = "force_update";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("schedule for job {job}: {source}")]
    Cron {
        job: &'static str,
        #[source]
        source: CronParseError,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub data_dir: PathBuf,
    pub portal: PortalConfig,
    pub validator: ValidatorConfig,
    pub transformer: TransformerConfig,
    pub http: HttpSettings,
    pub monitor: MonitorConfig,
    pub notify: NotifyConfig,
    pub schedule: ScheduleConfig,
    pub retention: RetentionConfig,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            portal: PortalConfig::default(),
            validator: ValidatorConfig::default(),
            transformer: TransformerConfig::default(),
            http: HttpSettings::default(),
            monitor: MonitorConfig::default(),
            notify: NotifyConfig::default(),
            schedule: ScheduleConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSettings {
    pub timeout_secs: u64,
    pub user_agent: String,
    pub max_retries: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            user_agent: "distwatch-bot/0.1".to_string(),
            max_retries: 2,
            base_delay_ms: 250,
            max_delay_ms: 5_000,
            global_concurrency: 16,
            per_host_concurrency: 4,
        }
    }
}

impl HttpSettings {
    pub fn client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.global_concurrency,
            per_host_concurrency: self.per_host_concurrency,
            retry: RetrySchedule {
                max_retries: self.max_retries,
                base_delay: Duration::from_millis(self.base_delay_ms),
                max_delay: Duration::from_millis(self.max_delay_ms),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub workers: usize,
    pub check_timeout_secs: u64,
    /// Extra attempts after the first failed fetch of a target.
    pub retries: usize,
    pub retry_delay_ms: u64,
    pub history_cap: usize,
    /// Relative tag-density difference above which a change counts as structural.
    pub structure_threshold: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            check_timeout_secs: 15,
            retries: 2,
            retry_delay_ms: 500,
            history_cap: distwatch_core::DEFAULT_CHANGE_HISTORY_CAP,
            structure_threshold: 0.2,
        }
    }
}

impl MonitorConfig {
    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }

    pub fn retry_delay(&self, attempt: usize) -> Duration {
        let factor = 1u64 << attempt.min(6);
        Duration::from_millis(self.retry_delay_ms.saturating_mul(factor))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub cooldown_hours: i64,
    pub webhook_url: Option<String>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            cooldown_hours: 24,
            webhook_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub tick_secs: u64,
    pub update_check: String,
    pub monitor_sweep: String,
    pub daily_digest: String,
    pub weekly_digest: String,
    pub cleanup: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            tick_secs: 60,
            update_check: "0 2 * * *".to_string(),
            monitor_sweep: "0 3 * * *".to_string(),
            daily_digest: "0 9 * * *".to_string(),
            weekly_digest: "0 9 * * 1".to_string(),
            cleanup: "0 4 * * 0".to_string(),
        }
    }
}

impl ScheduleConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    /// (job name, cron pattern) for every job of the static table.
    pub fn jobs(&self) -> [(&'static str, &str); 5] {
        [
            (JOB_UPDATE_CHECK, self.update_check.as_str()),
            (JOB_MONITOR_SWEEP, self.monitor_sweep.as_str()),
            (JOB_DAILY_DIGEST, self.daily_digest.as_str()),
            (JOB_WEEKLY_DIGEST, self.weekly_digest.as_str()),
            (JOB_CLEANUP, self.cleanup.as_str()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub keep_datasets: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { keep_datasets: 10 }
    }
}

impl WatchConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Read a YAML file, then overlay `DISTWATCH_*` variables. The environment wins.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    pub fn load_with(
        path: &Path,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut config: Self = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.apply_env(lookup);
        Ok(config)
    }

    /// Overlay `DISTWATCH_*` variables. Unparsable numbers keep the current value.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("DISTWATCH_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(url) = lookup("DISTWATCH_LANDING_URL") {
            self.portal.landing_url = url;
        }
        if let Some(url) = lookup("DISTWATCH_FALLBACK_URL") {
            self.portal.fallback_url = Some(url).filter(|u| !u.is_empty());
        }
        if let Some(flag) = lookup("DISTWATCH_ACCEPT_PARTIAL") {
            self.portal.accept_partial = matches!(flag.as_str(), "1" | "true" | "TRUE" | "True");
        }
        parse_into(&lookup, "DISTWATCH_VALID_THRESHOLD", &mut self.validator.valid_threshold);
        parse_into(&lookup, "DISTWATCH_PARTIAL_THRESHOLD", &mut self.validator.partial_threshold);
        parse_into(&lookup, "DISTWATCH_HTTP_TIMEOUT_SECS", &mut self.http.timeout_secs);
        if let Some(agent) = lookup("DISTWATCH_USER_AGENT") {
            self.http.user_agent = agent;
        }
        parse_into(&lookup, "DISTWATCH_MONITOR_WORKERS", &mut self.monitor.workers);
        parse_into(&lookup, "DISTWATCH_CHECK_TIMEOUT_SECS", &mut self.monitor.check_timeout_secs);
        parse_into(&lookup, "DISTWATCH_COOLDOWN_HOURS", &mut self.notify.cooldown_hours);
        if let Some(url) = lookup("DISTWATCH_WEBHOOK_URL") {
            self.notify.webhook_url = Some(url).filter(|u| !u.is_empty());
        }
        parse_into(&lookup, "DISTWATCH_TICK_SECS", &mut self.schedule.tick_secs);
        parse_into(&lookup, "DISTWATCH_KEEP_DATASETS", &mut self.retention.keep_datasets);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.monitor.workers == 0 {
            return Err(invalid("monitor.workers", "must be at least 1"));
        }
        if self.monitor.check_timeout_secs == 0 {
            return Err(invalid("monitor.check_timeout_secs", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.monitor.structure_threshold) {
            return Err(invalid("monitor.structure_threshold", "must lie within 0..=1"));
        }
        if self.schedule.tick_secs == 0 {
            return Err(invalid("schedule.tick_secs", "must be at least 1"));
        }
        if self.validator.partial_threshold > self.validator.valid_threshold
            || self.validator.valid_threshold > 100
        {
            return Err(invalid(
                "validator thresholds",
                format!(
                    "expected partial <= valid <= 100, got {} / {}",
                    self.validator.partial_threshold, self.validator.valid_threshold
                ),
            ));
        }
        if self.notify.cooldown_hours < 0 {
            return Err(invalid("notify.cooldown_hours", "must not be negative"));
        }
        if self.retention.keep_datasets == 0 {
            return Err(invalid("retention.keep_datasets", "must keep at least one file"));
        }
        for (job, pattern) in self.schedule.jobs() {
            CronPattern::parse(pattern).map_err(|source| ConfigError::Cron { job, source })?;
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn parse_into<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) {
    if let Some(value) = lookup(key).and_then(|v| v.trim().parse().ok()) {
        *slot = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_validate() {
        let config = WatchConfig::default();
        config.validate().unwrap();
        assert_eq!(config.monitor.workers, 5);
        assert_eq!(config.monitor.history_cap, 50);
        assert_eq!(config.notify.cooldown_hours, 24);
        assert_eq!(config.schedule.tick_secs, 60);
        assert_eq!(config.validator.valid_threshold, 60);
    }

    #[test]
    fn env_overrides_apply_and_bad_numbers_are_ignored() {
        let vars: HashMap<&str, &str> = [
            ("DISTWATCH_DATA_DIR", "/var/lib/distwatch"),
            ("DISTWATCH_MONITOR_WORKERS", "8"),
            ("DISTWATCH_COOLDOWN_HOURS", "not-a-number"),
            ("DISTWATCH_ACCEPT_PARTIAL", "true"),
            ("DISTWATCH_FALLBACK_URL", ""),
        ]
        .into_iter()
        .collect();

        let mut config = WatchConfig::default();
        config.apply_env(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/distwatch"));
        assert_eq!(config.monitor.workers, 8);
        assert_eq!(config.notify.cooldown_hours, 24);
        assert!(config.portal.accept_partial);
        assert_eq!(config.portal.fallback_url, None);
    }

    #[test]
    fn yaml_sections_default_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("distwatch.yaml");
        std::fs::write(
            &path,
            "data_dir: /srv/distwatch\nmonitor:\n  workers: 3\nschedule:\n  monitor_sweep: \"30 6 * * *\"\n",
        )
        .unwrap();

        let config = WatchConfig::load_with(&path, |_| None).unwrap();
        assert_eq!(config.monitor.workers, 3);
        assert_eq!(config.monitor.retries, 2);
        assert_eq!(config.schedule.monitor_sweep, "30 6 * * *");
        assert_eq!(config.schedule.update_check, "0 2 * * *");
        config.validate().unwrap();
    }

    #[test]
    fn environment_overrides_the_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("distwatch.yaml");
        std::fs::write(
            &path,
            "data_dir: /srv/distwatch\nmonitor:\n  workers: 3\nnotify:\n  webhook_url: https://hooks.example.org/a\n",
        )
        .unwrap();
        let vars: HashMap<&str, &str> = [
            ("DISTWATCH_DATA_DIR", "/var/lib/distwatch"),
            ("DISTWATCH_WEBHOOK_URL", "https://hooks.example.org/b"),
        ]
        .into_iter()
        .collect();

        let config = WatchConfig::load_with(&path, |key| vars.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/distwatch"));
        assert_eq!(config.notify.webhook_url.as_deref(), Some("https://hooks.example.org/b"));
        assert_eq!(config.monitor.workers, 3);
    }

    #[test]
    fn validate_rejects_nonsense() {
        let mut config = WatchConfig::default();
        config.monitor.workers = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field: "monitor.workers", .. })));

        let mut config = WatchConfig::default();
        config.validator.partial_threshold = 70;
        assert!(config.validate().is_err());

        let mut config = WatchConfig::default();
        config.schedule.cleanup = "0 4 * *".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::Cron { job: JOB_CLEANUP, .. })));
    }
}
