//! Content-drift monitoring of registered jurisdiction pages and documents.

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use distwatch_core::{
    ChangeRecord, ChangeType, LastCheck, MonitorStatus, MonitoringHistoryFile, MonitoringResult,
    MonitoringState, MonitoringSummary, RegisteredTarget, TargetKind,
};
use distwatch_ingest::decode_payload;
use distwatch_storage::{
    sha256_hex, HttpFetcher, MonitoringRepository, StoreError, TargetRegistry,
};
use futures::FutureExt;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::MonitorConfig;

#[derive(Debug, Clone, Error)]
pub enum TargetFetchError {
    /// Transport failure or a server-side status; retried, then reported as unreachable.
    #[error("{0}")]
    Network(String),
    /// The target answered but the answer is unusable; reported as error without retry.
    #[error("{0}")]
    Unusable(String),
}

#[async_trait]
pub trait TargetFetcher: Send + Sync {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>, TargetFetchError>;
}

/// Fetches `http(s)` locations over HTTP and reads everything else from disk, relative to
/// `base_dir`.
pub struct DefaultTargetFetcher {
    http: HttpFetcher,
    base_dir: PathBuf,
}

impl DefaultTargetFetcher {
    pub fn new(http: HttpFetcher, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            http,
            base_dir: base_dir.into(),
        }
    }
}

#[async_trait]
impl TargetFetcher for DefaultTargetFetcher {
    async fn fetch(&self, location: &str) -> Result<Vec<u8>, TargetFetchError> {
        let lower = location.trim().to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            return match self.http.fetch_bytes(location.trim()).await {
                Ok(response) => Ok(response.body),
                Err(err) if err.is_rejection() => Err(TargetFetchError::Unusable(err.to_string())),
                Err(err) => Err(TargetFetchError::Network(err.to_string())),
            };
        }

        let path = self.base_dir.join(Path::new(location.trim()));
        tokio::fs::read(&path).await.map_err(|err| {
            TargetFetchError::Unusable(format!("reading {}: {err}", path.display()))
        })
    }
}

/// Replaces volatile substrings with fixed tokens so a re-rendered page hashes the same.
#[derive(Debug, Clone)]
pub struct ContentNormalizer {
    timestamp: Regex,
    time: Regex,
    date: Regex,
    whitespace: Regex,
}

impl ContentNormalizer {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            timestamp: Regex::new(r"(?i)\b(timestamp|ts)=\d+")?,
            time: Regex::new(r"\b\d{1,2}:\d{2}:\d{2}(?:\.\d+)?\b")?,
            date: Regex::new(r"\b\d{4}[-./]\d{1,2}[-./]\d{1,2}\b")?,
            whitespace: Regex::new(r"\s+")?,
        })
    }

    pub fn normalize(&self, text: &str) -> String {
        let text = self.timestamp.replace_all(text, "${1}=<TS>");
        let text = self.time.replace_all(&text, "<TIME>");
        let text = self.date.replace_all(&text, "<DATE>");
        self.whitespace.replace_all(&text, " ").trim().to_string()
    }

    pub fn content_hash(&self, text: &str) -> String {
        sha256_hex(self.normalize(text).as_bytes())
    }
}

/// Markup tags per thousand bytes of page text.
pub fn tag_density(text: &str) -> f64 {
    let bytes = text.as_bytes();
    if bytes.is_empty() {
        return 0.0;
    }
    let tags = bytes
        .windows(2)
        .filter(|w| w[0] == b'<' && (w[1].is_ascii_alphabetic() || w[1] == b'/'))
        .count();
    tags as f64 * 1000.0 / bytes.len() as f64
}

/// Compare a fresh hash with the stored one. No stored hash is a baseline.
pub fn evaluate(
    previous_hash: Option<&str>,
    current_hash: &str,
    previous_density: Option<f64>,
    current_density: Option<f64>,
    structure_threshold: f64,
) -> (MonitorStatus, ChangeType) {
    match previous_hash {
        None => (MonitorStatus::Ok, ChangeType::Unchanged),
        Some(previous) if previous == current_hash => (MonitorStatus::Ok, ChangeType::Unchanged),
        Some(_) => {
            let structural = match (previous_density, current_density) {
                (Some(before), Some(after)) => {
                    let base = before.max(after);
                    base > 0.0 && (before - after).abs() / base > structure_threshold
                }
                _ => false,
            };
            let change = if structural {
                ChangeType::Structure
            } else {
                ChangeType::Content
            };
            (MonitorStatus::Changed, change)
        }
    }
}

const OLE_COMPOUND: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
const ZIP_LOCAL_HEADER: &[u8] = b"PK\x03\x04";
const PDF_HEADER: &[u8] = b"%PDF";
const PNG_HEADER: &[u8] = b"\x89PNG\r\n\x1a\n";
const JPEG_HEADER: &[u8] = &[0xFF, 0xD8, 0xFF];

fn expected_signature(location: &str) -> Option<&'static [u8]> {
    let lower = location.trim().to_ascii_lowercase();
    let path = lower.split(['?', '#']).next().unwrap_or_default();
    let (_, ext) = path.rsplit_once('.')?;
    match ext {
        "pdf" => Some(PDF_HEADER),
        "hwp" | "xls" | "doc" => Some(OLE_COMPOUND),
        "hwpx" | "xlsx" | "docx" | "zip" => Some(ZIP_LOCAL_HEADER),
        "png" => Some(PNG_HEADER),
        "jpg" | "jpeg" => Some(JPEG_HEADER),
        _ => None,
    }
}

/// True when the bytes start with the magic number the location's extension promises, or
/// when the extension promises none.
pub fn signature_matches(location: &str, bytes: &[u8]) -> bool {
    expected_signature(location).map_or(true, |magic| bytes.starts_with(magic))
}

#[derive(Debug, Clone)]
struct CheckJob {
    jurisdiction_key: String,
    url_type: String,
    location: String,
    previous_hash: Option<String>,
    previous_density: Option<f64>,
}

impl CheckJob {
    fn failed(&self, status: MonitorStatus, message: String, elapsed_ms: u64) -> CheckOutcome {
        CheckOutcome {
            result: MonitoringResult {
                jurisdiction_key: self.jurisdiction_key.clone(),
                url_type: self.url_type.clone(),
                location: self.location.clone(),
                target_kind: TargetKind::classify(&self.location),
                status,
                change_type: ChangeType::Unchanged,
                previous_hash: self.previous_hash.clone(),
                current_hash: None,
                error_message: Some(message),
                response_time_ms: elapsed_ms,
                checked_at: Utc::now(),
            },
            tag_density: None,
        }
    }
}

/// One finished check plus the markup density the next structure comparison needs.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub result: MonitoringResult,
    pub tag_density: Option<f64>,
}

struct Checker {
    fetcher: Arc<dyn TargetFetcher>,
    normalizer: ContentNormalizer,
    config: MonitorConfig,
}

impl Checker {
    async fn check(&self, job: CheckJob) -> CheckOutcome {
        let started = Instant::now();
        let kind = TargetKind::classify(&job.location);
        let fetched = self.fetch_with_retry(&job.location).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let bytes = match fetched {
            Ok(bytes) => bytes,
            Err(TargetFetchError::Network(message)) => {
                warn!(jurisdiction = %job.jurisdiction_key, url_type = %job.url_type, error = %message, "target unreachable");
                return job.failed(MonitorStatus::Unreachable, message, elapsed_ms);
            }
            Err(TargetFetchError::Unusable(message)) => {
                warn!(jurisdiction = %job.jurisdiction_key, url_type = %job.url_type, error = %message, "target unusable");
                return job.failed(MonitorStatus::Error, message, elapsed_ms);
            }
        };

        let (hash, density) = match kind {
            TargetKind::File => {
                if !signature_matches(&job.location, &bytes) {
                    let message = "content does not carry the signature its extension promises".to_string();
                    warn!(jurisdiction = %job.jurisdiction_key, url_type = %job.url_type, "file signature mismatch");
                    return job.failed(MonitorStatus::Error, message, elapsed_ms);
                }
                (sha256_hex(&bytes), None)
            }
            TargetKind::Url => {
                let text = decode_payload(&bytes).text;
                (self.normalizer.content_hash(&text), Some(tag_density(&text)))
            }
        };

        let (status, change_type) = evaluate(
            job.previous_hash.as_deref(),
            &hash,
            job.previous_density,
            density,
            self.config.structure_threshold,
        );
        debug!(
            jurisdiction = %job.jurisdiction_key,
            url_type = %job.url_type,
            status = status.as_str(),
            elapsed_ms,
            "target checked"
        );
        CheckOutcome {
            result: MonitoringResult {
                jurisdiction_key: job.jurisdiction_key,
                url_type: job.url_type,
                location: job.location,
                target_kind: kind,
                status,
                change_type,
                previous_hash: job.previous_hash,
                current_hash: Some(hash),
                error_message: None,
                response_time_ms: elapsed_ms,
                checked_at: Utc::now(),
            },
            tag_density: density,
        }
    }

    async fn fetch_with_retry(&self, location: &str) -> Result<Vec<u8>, TargetFetchError> {
        let timeout = self.config.check_timeout();
        let mut last = TargetFetchError::Network("not attempted".to_string());
        for attempt in 0..=self.config.retries {
            match tokio::time::timeout(timeout, self.fetcher.fetch(location)).await {
                Ok(Ok(bytes)) => return Ok(bytes),
                Ok(Err(err @ TargetFetchError::Unusable(_))) => return Err(err),
                Ok(Err(err)) => last = err,
                Err(_) => {
                    last = TargetFetchError::Network(format!(
                        "timed out after {}s",
                        timeout.as_secs()
                    ))
                }
            }
            if attempt < self.config.retries {
                debug!(location, attempt, error = %last, "retrying target fetch");
                tokio::time::sleep(self.config.retry_delay(attempt)).await;
            }
        }
        Err(last)
    }
}

/// Fold check outcomes into the persisted history. Hashes move forward on every successful
/// fetch; the change ring buffer only grows on `changed`.
pub fn fold_outcomes(
    file: &mut MonitoringHistoryFile,
    outcomes: &[CheckOutcome],
    history_cap: usize,
    now: DateTime<Utc>,
    full_sweep: bool,
) {
    for outcome in outcomes {
        let result = &outcome.result;
        let entry = file
            .jurisdictions
            .entry(result.jurisdiction_key.clone())
            .or_default();
        entry.last_checked_at = Some(result.checked_at);

        if let Some(hash) = &result.current_hash {
            if result.status == MonitorStatus::Changed {
                entry.push_change(
                    ChangeRecord {
                        url_type: result.url_type.clone(),
                        change_type: result.change_type,
                        previous_hash: result.previous_hash.clone(),
                        current_hash: hash.clone(),
                        changed_at: result.checked_at,
                    },
                    history_cap,
                );
            }
            entry
                .url_hashes_by_type
                .insert(result.url_type.clone(), hash.clone());
        }

        let tag_density = outcome
            .tag_density
            .or_else(|| entry.previous_tag_density(&result.url_type));
        entry.last_results.insert(
            result.url_type.clone(),
            LastCheck {
                status: result.status,
                change_type: result.change_type,
                error_message: result.error_message.clone(),
                checked_at: result.checked_at,
                tag_density,
            },
        );
    }
    file.metadata.total_checks += outcomes.len() as u64;
    if full_sweep {
        file.metadata.last_full_check = Some(now);
    }
}

pub fn summarize(results: &[MonitoringResult]) -> MonitoringSummary {
    let mut summary = MonitoringSummary::default();
    for result in results {
        summary.record(
            &result.jurisdiction_key,
            &result.url_type,
            result.status,
            detail(result.status, result.change_type, result.error_message.as_deref()),
        );
    }
    summary
}

fn detail(status: MonitorStatus, change_type: ChangeType, error: Option<&str>) -> Option<String> {
    match status {
        MonitorStatus::Ok => None,
        MonitorStatus::Changed => Some(
            match change_type {
                ChangeType::Structure => "structure",
                _ => "content",
            }
            .to_string(),
        ),
        MonitorStatus::Error | MonitorStatus::Unreachable => error.map(str::to_string),
    }
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no registered jurisdiction {0}")]
    UnknownJurisdiction(String),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub jurisdictions_checked: usize,
    pub jurisdictions_skipped: usize,
    pub results: Vec<MonitoringResult>,
    pub summary: MonitoringSummary,
}

pub struct ChangeMonitor {
    checker: Arc<Checker>,
    history: Arc<dyn MonitoringRepository>,
    registry: Arc<dyn TargetRegistry>,
    workers: usize,
    history_cap: usize,
}

impl ChangeMonitor {
    pub fn new(
        fetcher: Arc<dyn TargetFetcher>,
        history: Arc<dyn MonitoringRepository>,
        registry: Arc<dyn TargetRegistry>,
        config: MonitorConfig,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            workers: config.workers.max(1),
            history_cap: config.history_cap,
            checker: Arc::new(Checker {
                fetcher,
                normalizer: ContentNormalizer::new()?,
                config,
            }),
            history,
            registry,
        })
    }

    /// Check every enabled, due target. Higher priority hints are dispatched first.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, MonitorError> {
        let started_at = Utc::now();
        let targets = self.registry.load_targets().await?;
        let total = targets.len();

        let history = self.history.load_history().await?;
        if !history.metadata.monitoring_enabled {
            info!(targets = total, "monitoring disabled; sweep skipped");
            return Ok(SweepReport {
                started_at,
                finished_at: Utc::now(),
                jurisdictions_checked: 0,
                jurisdictions_skipped: total,
                results: Vec::new(),
                summary: MonitoringSummary::default(),
            });
        }

        let mut due: Vec<RegisteredTarget> = targets
            .into_iter()
            .filter(|t| t.monitoring.is_due(now))
            .collect();
        due.sort_by_key(|t| t.monitoring.priority_hint);

        let span = info_span!("monitor_sweep", due = due.len(), total);
        let results = self
            .check_targets(&due, &history, now, true)
            .instrument(span)
            .await?;
        let summary = summarize(&results);
        info!(
            checked = due.len(),
            skipped = total - due.len(),
            healthy = summary.healthy_count,
            changed = summary.changed_list.len(),
            errors = summary.error_list.len(),
            unreachable = summary.unreachable_list.len(),
            "sweep finished"
        );
        Ok(SweepReport {
            started_at,
            finished_at: Utc::now(),
            jurisdictions_checked: due.len(),
            jurisdictions_skipped: total - due.len(),
            results,
            summary,
        })
    }

    /// Check one jurisdiction now, regardless of its enabled flag and frequency.
    pub async fn check_jurisdiction(
        &self,
        jurisdiction_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<MonitoringResult>, MonitorError> {
        let target = self
            .registry
            .load_targets()
            .await?
            .into_iter()
            .find(|t| t.jurisdiction_key == jurisdiction_key)
            .ok_or_else(|| MonitorError::UnknownJurisdiction(jurisdiction_key.to_string()))?;
        let history = self.history.load_history().await?;
        let span = info_span!("manual_check", jurisdiction = jurisdiction_key);
        self.check_targets(std::slice::from_ref(&target), &history, now, false)
            .instrument(span)
            .await
    }

    /// Summary of the last persisted result of every monitored (jurisdiction, urlType).
    pub async fn summary(&self) -> Result<MonitoringSummary, MonitorError> {
        let history = self.history.load_history().await?;
        let mut summary = MonitoringSummary::default();
        for (key, entry) in &history.jurisdictions {
            for (url_type, last) in &entry.last_results {
                summary.record(
                    key,
                    url_type,
                    last.status,
                    detail(last.status, last.change_type, last.error_message.as_deref()),
                );
            }
        }
        Ok(summary)
    }

    async fn check_targets(
        &self,
        targets: &[RegisteredTarget],
        history: &MonitoringHistoryFile,
        now: DateTime<Utc>,
        full_sweep: bool,
    ) -> Result<Vec<MonitoringResult>, MonitorError> {
        let jobs: Vec<CheckJob> = targets
            .iter()
            .flat_map(|target| {
                let previous = history.jurisdictions.get(&target.jurisdiction_key);
                target.urls_by_type.iter().map(move |(url_type, location)| CheckJob {
                    jurisdiction_key: target.jurisdiction_key.clone(),
                    url_type: url_type.clone(),
                    location: location.clone(),
                    previous_hash: previous
                        .and_then(|h| h.previous_hash(url_type))
                        .map(str::to_string),
                    previous_density: previous.and_then(|h| h.previous_tag_density(url_type)),
                })
            })
            .collect();

        let outcomes = self.run_checks(jobs).await;

        let cap = self.history_cap;
        self.history
            .update_history(&mut |file: &mut MonitoringHistoryFile| {
                fold_outcomes(file, &outcomes, cap, now, full_sweep)
            })
            .await?;

        let updates: Vec<(String, MonitoringState)> = targets
            .iter()
            .map(|target| {
                let mut state = target.monitoring.clone();
                state.last_checked_at = Some(now);
                let failed = outcomes.iter().any(|o| {
                    o.result.jurisdiction_key == target.jurisdiction_key
                        && o.result.status.is_failure()
                });
                state.consecutive_failure_count = if failed {
                    state.consecutive_failure_count.saturating_add(1)
                } else {
                    0
                };
                (target.jurisdiction_key.clone(), state)
            })
            .collect();
        self.registry.update_monitoring(&updates).await?;

        Ok(outcomes.into_iter().map(|o| o.result).collect())
    }

    /// Bounded worker pool. Jobs are dispatched in order; the call returns once every
    /// dispatched check has finished. A panicking check becomes an `error` result.
    async fn run_checks(&self, jobs: Vec<CheckJob>) -> Vec<CheckOutcome> {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut set = JoinSet::new();
        for job in jobs {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore not closed");
            let checker = self.checker.clone();
            set.spawn(async move {
                let _permit = permit;
                let fallback = job.clone();
                match AssertUnwindSafe(checker.check(job)).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        error!(jurisdiction = %fallback.jurisdiction_key, url_type = %fallback.url_type, "check panicked");
                        fallback.failed(MonitorStatus::Error, "check panicked".to_string(), 0)
                    }
                }
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => error!(error = %err, "check task aborted"),
            }
        }
        outcomes.sort_by(|a, b| {
            (&a.result.jurisdiction_key, &a.result.url_type)
                .cmp(&(&b.result.jurisdiction_key, &b.result.url_type))
        });
        outcomes
    }
}
