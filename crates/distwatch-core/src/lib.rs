//! Core domain model for district dataset acquisition and jurisdiction monitoring.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "distwatch-core";

/// Default capacity of the per-jurisdiction change ring buffer.
pub const DEFAULT_CHANGE_HISTORY_CAP: usize = 50;

/// One deduplicated (province, municipality) row of the published dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistrictRecord {
    pub province: Option<String>,
    pub municipality: String,
    pub neighborhood: Option<String>,
    pub administrative_code: Option<String>,
    pub duplicate_count: usize,
}

impl DistrictRecord {
    pub fn group_key(&self) -> (Option<&str>, &str) {
        (self.province.as_deref(), self.municipality.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DongEntry {
    pub neighborhood: String,
    pub code: String,
}

/// province -> municipality -> neighborhoods, each neighborhood list unique by name and sorted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DongHierarchy(BTreeMap<String, BTreeMap<String, Vec<DongEntry>>>);

impl DongHierarchy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a neighborhood, ignoring a repeat of a neighborhood name already present
    /// under the same municipality. Returns whether the entry was added.
    pub fn insert(&mut self, province: &str, municipality: &str, neighborhood: &str, code: &str) -> bool {
        let entries = self
            .0
            .entry(province.to_string())
            .or_default()
            .entry(municipality.to_string())
            .or_default();
        if entries.iter().any(|e| e.neighborhood == neighborhood) {
            return false;
        }
        entries.push(DongEntry {
            neighborhood: neighborhood.to_string(),
            code: code.to_string(),
        });
        true
    }

    /// Sort every neighborhood list. Called once after a full insertion pass.
    pub fn finalize(&mut self) {
        for municipalities in self.0.values_mut() {
            for entries in municipalities.values_mut() {
                entries.sort();
            }
        }
    }

    pub fn provinces(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn municipalities(&self, province: &str) -> Option<&BTreeMap<String, Vec<DongEntry>>> {
        self.0.get(province)
    }

    pub fn neighborhoods(&self, province: &str, municipality: &str) -> Option<&[DongEntry]> {
        self.0
            .get(province)
            .and_then(|m| m.get(municipality))
            .map(Vec::as_slice)
    }

    pub fn neighborhood_count(&self) -> usize {
        self.0
            .values()
            .flat_map(|m| m.values())
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Published output of one successful refresh. Never mutated after it is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistrictDataset {
    pub processed_at: DateTime<Utc>,
    pub original_count: usize,
    pub retired_count: usize,
    pub cleaned_count: usize,
    pub unique_count: usize,
    pub removed_duplicates: usize,
    pub records: Vec<DistrictRecord>,
    pub hierarchy: DongHierarchy,
}

/// Persisted marker deciding whether a refresh is needed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMarker {
    pub last_remote_modification_date: Option<String>,
    pub last_local_update_time: DateTime<Utc>,
    #[serde(default)]
    pub dataset_file: Option<String>,
    #[serde(default)]
    pub strategy_used: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckFrequency {
    #[default]
    Daily,
    Weekly,
    Monthly,
}

impl CheckFrequency {
    pub fn interval(self) -> Duration {
        match self {
            CheckFrequency::Daily => Duration::days(1),
            CheckFrequency::Weekly => Duration::weeks(1),
            CheckFrequency::Monthly => Duration::days(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityHint {
    High,
    #[default]
    Normal,
    Low,
}

/// The `monitoring` sub-record of a registered target; the only part this pipeline writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringState {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_checked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub check_frequency: CheckFrequency,
    #[serde(default)]
    pub priority_hint: PriorityHint,
    #[serde(default)]
    pub consecutive_failure_count: u32,
}

fn default_enabled() -> bool {
    true
}

impl MonitoringState {
    pub fn new(created_at: DateTime<Utc>) -> Self {
        Self {
            enabled: true,
            created_at,
            last_checked_at: None,
            check_frequency: CheckFrequency::default(),
            priority_hint: PriorityHint::default(),
            consecutive_failure_count: 0,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        match self.last_checked_at {
            Some(last) => now - last >= self.check_frequency.interval(),
            None => true,
        }
    }
}

/// A jurisdiction registered by the external registration UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredTarget {
    pub jurisdiction_key: String,
    #[serde(default)]
    pub urls_by_type: BTreeMap<String, String>,
    pub monitoring: MonitoringState,
}

/// Binary file extensions monitored by signature rather than by page text.
pub const FILE_EXTENSIONS: &[&str] = &[
    "pdf", "hwp", "hwpx", "xls", "xlsx", "doc", "docx", "zip", "png", "jpg", "jpeg",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Url,
    File,
}

impl TargetKind {
    /// Web pages are `Url`; local paths and remote documents with a known binary extension are `File`.
    pub fn classify(location: &str) -> Self {
        let trimmed = location.trim();
        let lower = trimmed.to_ascii_lowercase();
        let is_remote = lower.starts_with("http://") || lower.starts_with("https://");
        if !is_remote {
            return TargetKind::File;
        }
        let path = lower.split(['?', '#']).next().unwrap_or_default();
        let has_file_ext = path
            .rsplit_once('.')
            .map(|(_, ext)| FILE_EXTENSIONS.contains(&ext))
            .unwrap_or(false);
        if has_file_ext {
            TargetKind::File
        } else {
            TargetKind::Url
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorStatus {
    Ok,
    Changed,
    Error,
    Unreachable,
}

impl MonitorStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MonitorStatus::Ok => "ok",
            MonitorStatus::Changed => "changed",
            MonitorStatus::Error => "error",
            MonitorStatus::Unreachable => "unreachable",
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, MonitorStatus::Error | MonitorStatus::Unreachable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Content,
    Structure,
    #[serde(rename = "none")]
    Unchanged,
}

/// Outcome of checking one (jurisdiction, urlType) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringResult {
    pub jurisdiction_key: String,
    pub url_type: String,
    pub location: String,
    pub target_kind: TargetKind,
    pub status: MonitorStatus,
    pub change_type: ChangeType,
    pub previous_hash: Option<String>,
    pub current_hash: Option<String>,
    pub error_message: Option<String>,
    pub response_time_ms: u64,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub url_type: String,
    pub change_type: ChangeType,
    pub previous_hash: Option<String>,
    pub current_hash: String,
    pub changed_at: DateTime<Utc>,
}

/// Last observed state of one urlType, kept for summaries and the structure heuristic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastCheck {
    pub status: MonitorStatus,
    pub change_type: ChangeType,
    #[serde(default)]
    pub error_message: Option<String>,
    pub checked_at: DateTime<Utc>,
    #[serde(default)]
    pub tag_density: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringHistory {
    #[serde(default)]
    pub url_hashes_by_type: BTreeMap<String, String>,
    #[serde(default)]
    pub last_checked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub change_history: VecDeque<ChangeRecord>,
    #[serde(default)]
    pub last_results: BTreeMap<String, LastCheck>,
}

impl MonitoringHistory {
    /// Append to the bounded ring buffer, evicting the oldest entries at capacity.
    pub fn push_change(&mut self, record: ChangeRecord, capacity: usize) {
        let capacity = capacity.max(1);
        self.change_history.push_back(record);
        while self.change_history.len() > capacity {
            self.change_history.pop_front();
        }
    }

    pub fn previous_hash(&self, url_type: &str) -> Option<&str> {
        self.url_hashes_by_type.get(url_type).map(String::as_str)
    }

    pub fn previous_tag_density(&self, url_type: &str) -> Option<f64> {
        self.last_results.get(url_type).and_then(|c| c.tag_density)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringMetadata {
    pub last_full_check: Option<DateTime<Utc>>,
    pub total_checks: u64,
    pub monitoring_enabled: bool,
}

impl Default for MonitoringMetadata {
    fn default() -> Self {
        Self {
            last_full_check: None,
            total_checks: 0,
            monitoring_enabled: true,
        }
    }
}

/// Shape of `monitoring_history.json`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MonitoringHistoryFile {
    #[serde(default)]
    pub metadata: MonitoringMetadata,
    #[serde(default)]
    pub jurisdictions: BTreeMap<String, MonitoringHistory>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Critical,
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    pub priority: Priority,
    pub jurisdiction_key: String,
    pub result: MonitoringResult,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestPeriod {
    Daily,
    Weekly,
}

impl DigestPeriod {
    /// Buffers drained by a digest of this period. Critical events only land in a buffer
    /// when their immediate delivery failed.
    pub fn priorities(self) -> &'static [Priority] {
        match self {
            DigestPeriod::Daily => &[Priority::Critical, Priority::High],
            DigestPeriod::Weekly => &[Priority::Medium, Priority::Low],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DigestPeriod::Daily => "daily",
            DigestPeriod::Weekly => "weekly",
        }
    }
}

/// Shape of `notification_queue.json`: digest buffers plus the cooldown ledger.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationQueue {
    #[serde(default)]
    pub pending: BTreeMap<Priority, Vec<NotificationEvent>>,
    /// "jurisdiction|urlType|status" -> last time a notification was raised.
    #[serde(default)]
    pub sent_log: BTreeMap<String, DateTime<Utc>>,
}

impl NotificationQueue {
    pub fn pending_count(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    pub jurisdiction_key: String,
    pub url_type: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringSummary {
    pub healthy_count: usize,
    pub changed_list: Vec<TargetRef>,
    pub error_list: Vec<TargetRef>,
    pub unreachable_list: Vec<TargetRef>,
}

impl MonitoringSummary {
    pub fn record(&mut self, jurisdiction_key: &str, url_type: &str, status: MonitorStatus, detail: Option<String>) {
        let target = TargetRef {
            jurisdiction_key: jurisdiction_key.to_string(),
            url_type: url_type.to_string(),
            detail,
        };
        match status {
            MonitorStatus::Ok => self.healthy_count += 1,
            MonitorStatus::Changed => self.changed_list.push(target),
            MonitorStatus::Error => self.error_list.push(target),
            MonitorStatus::Unreachable => self.unreachable_list.push(target),
        }
    }

    pub fn total(&self) -> usize {
        self.healthy_count + self.changed_list.len() + self.error_list.len() + self.unreachable_list.len()
    }
}
