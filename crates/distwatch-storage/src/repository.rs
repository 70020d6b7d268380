//! Repository seams over the JSON file store.
//!
//! The pipeline only talks to these traits; `JsonRepository` keeps everything as JSON files
//! under one data directory:
//!
//! ```text
//! {data_dir}/
//! ├── datasets/district_data_YYYYMMDD_HHMMSS.json
//! ├── last_update_info.json
//! ├── monitoring_history.json
//! ├── notification_queue.json
//! └── registered_targets.json
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use distwatch_core::{
    ChangeRecord, DistrictDataset, MonitoringHistoryFile, MonitoringState, NotificationQueue,
    RegisteredTarget, UpdateMarker,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::{JsonStore, StoreError};

pub const DATASET_DIR: &str = "datasets";
pub const DATASET_FILE_PREFIX: &str = "district_data_";
pub const MARKER_FILE: &str = "last_update_info.json";
pub const HISTORY_FILE: &str = "monitoring_history.json";
pub const QUEUE_FILE: &str = "notification_queue.json";
pub const TARGETS_FILE: &str = "registered_targets.json";

#[async_trait]
pub trait DatasetRepository: Send + Sync {
    /// Persist a dataset as a new file; existing files are never rewritten.
    async fn save_dataset(&self, dataset: &DistrictDataset) -> Result<PathBuf, StoreError>;
    async fn latest_dataset(&self) -> Result<Option<(PathBuf, DistrictDataset)>, StoreError>;
    async fn list_datasets(&self) -> Result<Vec<PathBuf>, StoreError>;
    /// Delete all but the newest `keep` dataset files. Returns how many were removed.
    async fn prune_datasets(&self, keep: usize) -> Result<usize, StoreError>;
}

#[async_trait]
pub trait MarkerRepository: Send + Sync {
    async fn load_marker(&self) -> Result<Option<UpdateMarker>, StoreError>;
    async fn save_marker(&self, marker: &UpdateMarker) -> Result<(), StoreError>;
}

#[async_trait]
pub trait MonitoringRepository: Send + Sync {
    async fn load_history(&self) -> Result<MonitoringHistoryFile, StoreError>;
    async fn save_history(&self, history: &MonitoringHistoryFile) -> Result<(), StoreError>;
    async fn append_history(
        &self,
        jurisdiction_key: &str,
        record: ChangeRecord,
        capacity: usize,
    ) -> Result<(), StoreError>;
    /// Read-modify-write with writers serialized for the whole closure.
    async fn update_history(
        &self,
        apply: &mut (dyn for<'x> FnMut(&'x mut MonitoringHistoryFile) + Send),
    ) -> Result<MonitoringHistoryFile, StoreError>;
}

#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn load_queue(&self) -> Result<NotificationQueue, StoreError>;
    async fn update_queue(
        &self,
        apply: &mut (dyn for<'x> FnMut(&'x mut NotificationQueue) + Send),
    ) -> Result<NotificationQueue, StoreError>;
}

/// Registration source owned by the external UI. This pipeline only rewrites `monitoring`.
#[async_trait]
pub trait TargetRegistry: Send + Sync {
    async fn load_targets(&self) -> Result<Vec<RegisteredTarget>, StoreError>;
    async fn update_monitoring(
        &self,
        updates: &[(String, MonitoringState)],
    ) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetsFile {
    #[serde(default)]
    pub targets: Vec<RegisteredTarget>,
}

#[derive(Debug, Clone)]
pub struct JsonRepository {
    store: JsonStore,
}

impl JsonRepository {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            store: JsonStore::new(data_dir),
        }
    }

    pub fn store(&self) -> &JsonStore {
        &self.store
    }

    pub fn data_dir(&self) -> &Path {
        self.store.root()
    }

    fn dataset_file_name(dataset: &DistrictDataset, suffix: usize) -> String {
        let stamp = dataset.processed_at.format("%Y%m%d_%H%M%S");
        if suffix == 0 {
            format!("{DATASET_FILE_PREFIX}{stamp}.json")
        } else {
            format!("{DATASET_FILE_PREFIX}{stamp}_{suffix}.json")
        }
    }
}

#[async_trait]
impl DatasetRepository for JsonRepository {
    async fn save_dataset(&self, dataset: &DistrictDataset) -> Result<PathBuf, StoreError> {
        let dir = Path::new(DATASET_DIR);
        let mut suffix = 0usize;
        loop {
            let relative = dir.join(Self::dataset_file_name(dataset, suffix));
            if let Some(path) = self.store.create_json(&relative, dataset).await? {
                info!(
                    path = %path.display(),
                    records = dataset.records.len(),
                    "dataset persisted"
                );
                return Ok(path);
            }
            suffix += 1;
        }
    }

    async fn latest_dataset(&self) -> Result<Option<(PathBuf, DistrictDataset)>, StoreError> {
        let files = self.list_datasets().await?;
        let Some(latest) = files.last() else {
            return Ok(None);
        };
        let relative = latest.strip_prefix(self.store.root()).unwrap_or(latest);
        let dataset: Option<DistrictDataset> = self.store.read_json(relative).await?;
        Ok(dataset.map(|d| (latest.clone(), d)))
    }

    async fn list_datasets(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut files = self
            .store
            .list_files(DATASET_DIR, DATASET_FILE_PREFIX, ".json")
            .await?;
        // Same-second files carry a numeric suffix; order by (stamp, suffix).
        files.sort_by_key(|p| dataset_sort_key(p));
        Ok(files)
    }

    async fn prune_datasets(&self, keep: usize) -> Result<usize, StoreError> {
        let files = self.list_datasets().await?;
        let excess = files.len().saturating_sub(keep.max(1));
        for path in files.iter().take(excess) {
            self.store.remove(path).await?;
            info!(path = %path.display(), "pruned dataset file");
        }
        Ok(excess)
    }
}

fn dataset_sort_key(path: &Path) -> (String, usize) {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = stem.trim_start_matches(DATASET_FILE_PREFIX);
    // stem is YYYYMMDD_HHMMSS or YYYYMMDD_HHMMSS_N
    let mut parts = stem.splitn(3, '_');
    let date = parts.next().unwrap_or_default();
    let time = parts.next().unwrap_or_default();
    let suffix = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    (format!("{date}_{time}"), suffix)
}

#[async_trait]
impl MarkerRepository for JsonRepository {
    async fn load_marker(&self) -> Result<Option<UpdateMarker>, StoreError> {
        self.store.read_json(MARKER_FILE).await
    }

    async fn save_marker(&self, marker: &UpdateMarker) -> Result<(), StoreError> {
        self.store.write_json(MARKER_FILE, marker).await.map(|_| ())
    }
}

#[async_trait]
impl MonitoringRepository for JsonRepository {
    async fn load_history(&self) -> Result<MonitoringHistoryFile, StoreError> {
        Ok(self.store.read_json(HISTORY_FILE).await?.unwrap_or_default())
    }

    async fn save_history(&self, history: &MonitoringHistoryFile) -> Result<(), StoreError> {
        self.store.write_json(HISTORY_FILE, history).await.map(|_| ())
    }

    async fn append_history(
        &self,
        jurisdiction_key: &str,
        record: ChangeRecord,
        capacity: usize,
    ) -> Result<(), StoreError> {
        self.store
            .update_json(HISTORY_FILE, |file: &mut MonitoringHistoryFile| {
                file.jurisdictions
                    .entry(jurisdiction_key.to_string())
                    .or_default()
                    .push_change(record, capacity);
            })
            .await
            .map(|_| ())
    }

    async fn update_history(
        &self,
        apply: &mut (dyn for<'x> FnMut(&'x mut MonitoringHistoryFile) + Send),
    ) -> Result<MonitoringHistoryFile, StoreError> {
        self.store
            .update_json(HISTORY_FILE, |file: &mut MonitoringHistoryFile| apply(file))
            .await
    }
}

#[async_trait]
impl NotificationRepository for JsonRepository {
    async fn load_queue(&self) -> Result<NotificationQueue, StoreError> {
        Ok(self.store.read_json(QUEUE_FILE).await?.unwrap_or_default())
    }

    async fn update_queue(
        &self,
        apply: &mut (dyn for<'x> FnMut(&'x mut NotificationQueue) + Send),
    ) -> Result<NotificationQueue, StoreError> {
        self.store
            .update_json(QUEUE_FILE, |queue: &mut NotificationQueue| apply(queue))
            .await
    }
}

#[async_trait]
impl TargetRegistry for JsonRepository {
    async fn load_targets(&self) -> Result<Vec<RegisteredTarget>, StoreError> {
        let file: Option<TargetsFile> = self.store.read_json(TARGETS_FILE).await?;
        Ok(file.map(|f| f.targets).unwrap_or_default())
    }

    async fn update_monitoring(
        &self,
        updates: &[(String, MonitoringState)],
    ) -> Result<(), StoreError> {
        if updates.is_empty() {
            return Ok(());
        }
        let registered: Option<Value> = self.store.read_json(TARGETS_FILE).await?;
        if registered.is_none() {
            return Ok(());
        }
        let mut patches = Vec::with_capacity(updates.len());
        for (key, state) in updates {
            let value = serde_json::to_value(state).map_err(|source| StoreError::Serialize {
                what: format!("monitoring state of {key}"),
                source,
            })?;
            if let Value::Object(fields) = value {
                patches.push((key.as_str(), fields));
            }
        }

        // Patched as raw JSON so keys owned by the registration UI survive the rewrite.
        self.store
            .update_json(TARGETS_FILE, |file: &mut Value| {
                let Some(targets) = file.get_mut("targets").and_then(Value::as_array_mut) else {
                    return;
                };
                for target in targets.iter_mut().filter_map(Value::as_object_mut) {
                    let Some(key) = target.get("jurisdictionKey").and_then(Value::as_str) else {
                        continue;
                    };
                    let Some((_, fields)) = patches.iter().find(|(k, _)| *k == key) else {
                        continue;
                    };
                    let monitoring = target
                        .entry("monitoring")
                        .or_insert_with(|| Value::Object(Map::new()));
                    if !monitoring.is_object() {
                        *monitoring = Value::Object(Map::new());
                    }
                    if let Some(existing) = monitoring.as_object_mut() {
                        for (name, value) in fields {
                            existing.insert(name.clone(), value.clone());
                        }
                    }
                }
            })
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use distwatch_core::{ChangeType, DongHierarchy};
    use tempfile::tempdir;

    fn dataset_at(ts: DateTime<Utc>, municipality: &str) -> DistrictDataset {
        DistrictDataset {
            processed_at: ts,
            original_count: 1,
            retired_count: 0,
            cleaned_count: 1,
            unique_count: 1,
            removed_duplicates: 0,
            records: vec![distwatch_core::DistrictRecord {
                province: Some("서울특별시".into()),
                municipality: municipality.into(),
                neighborhood: None,
                administrative_code: None,
                duplicate_count: 1,
            }],
            hierarchy: DongHierarchy::new(),
        }
    }

    fn ts(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, day, 2, 0, 0).single().unwrap()
    }

    #[tokio::test]
    async fn datasets_are_new_files_and_latest_wins() {
        let dir = tempdir().unwrap();
        let repo = JsonRepository::new(dir.path());

        repo.save_dataset(&dataset_at(ts(1), "종로구")).await.unwrap();
        repo.save_dataset(&dataset_at(ts(3), "중구")).await.unwrap();
        let same_second = repo.save_dataset(&dataset_at(ts(3), "용산구")).await.unwrap();
        assert!(same_second.to_string_lossy().ends_with("_1.json"));

        let (path, latest) = repo.latest_dataset().await.unwrap().unwrap();
        assert_eq!(path, same_second);
        assert_eq!(latest.records[0].municipality, "용산구");
        assert_eq!(repo.list_datasets().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn prune_keeps_newest_files() {
        let dir = tempdir().unwrap();
        let repo = JsonRepository::new(dir.path());
        for day in 1..=5 {
            repo.save_dataset(&dataset_at(ts(day), "종로구")).await.unwrap();
        }

        let removed = repo.prune_datasets(2).await.unwrap();
        assert_eq!(removed, 3);
        let remaining = repo.list_datasets().await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining[1].to_string_lossy().contains("20260105"));
    }

    #[tokio::test]
    async fn append_history_is_bounded() {
        let dir = tempdir().unwrap();
        let repo = JsonRepository::new(dir.path());
        for i in 0..4 {
            repo.append_history(
                "seoul-jongno",
                ChangeRecord {
                    url_type: "info".into(),
                    change_type: ChangeType::Content,
                    previous_hash: None,
                    current_hash: format!("h{i}"),
                    changed_at: ts(1),
                },
                2,
            )
            .await
            .unwrap();
        }
        let history = repo.load_history().await.unwrap();
        let entries = &history.jurisdictions["seoul-jongno"].change_history;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].current_hash, "h2");
    }

    #[tokio::test]
    async fn update_monitoring_only_touches_monitoring_records() {
        let dir = tempdir().unwrap();
        let repo = JsonRepository::new(dir.path());
        let target = RegisteredTarget {
            jurisdiction_key: "seoul-jongno".into(),
            urls_by_type: [("info".to_string(), "https://example.go.kr/info".to_string())]
                .into_iter()
                .collect(),
            monitoring: MonitoringState::new(ts(1)),
        };
        repo.store()
            .write_json(TARGETS_FILE, &TargetsFile { targets: vec![target.clone()] })
            .await
            .unwrap();

        let mut state = target.monitoring.clone();
        state.consecutive_failure_count = 3;
        state.last_checked_at = Some(ts(2));
        repo.update_monitoring(&[("seoul-jongno".into(), state.clone())])
            .await
            .unwrap();

        let targets = repo.load_targets().await.unwrap();
        assert_eq!(targets[0].monitoring, state);
        assert_eq!(targets[0].urls_by_type, target.urls_by_type);
    }

    #[tokio::test]
    async fn update_monitoring_keeps_keys_owned_by_the_registration_ui() {
        let dir = tempdir().unwrap();
        let repo = JsonRepository::new(dir.path());
        let raw = serde_json::json!({
            "version": 3,
            "targets": [
                {
                    "jurisdictionKey": "seoul-gangnam",
                    "displayName": "강남구",
                    "contactEmail": "waste@gangnam.example.go.kr",
                    "urlsByType": { "info": "https://gangnam.example.go.kr/waste" },
                    "monitoring": {
                        "enabled": true,
                        "createdAt": "2026-01-01T02:00:00Z",
                        "uiNote": "checked by hand in March"
                    }
                },
                {
                    "jurisdictionKey": "seoul-seocho",
                    "displayName": "서초구",
                    "monitoring": { "enabled": false, "createdAt": "2026-01-01T02:00:00Z" }
                }
            ]
        });
        repo.store().write_json(TARGETS_FILE, &raw).await.unwrap();

        let mut state = MonitoringState::new(ts(1));
        state.last_checked_at = Some(ts(2));
        state.consecutive_failure_count = 1;
        repo.update_monitoring(&[("seoul-gangnam".into(), state.clone())])
            .await
            .unwrap();

        let stored: Value = repo.store().read_json(TARGETS_FILE).await.unwrap().unwrap();
        assert_eq!(stored["version"], 3);
        let gangnam = &stored["targets"][0];
        assert_eq!(gangnam["displayName"], "강남구");
        assert_eq!(gangnam["contactEmail"], "waste@gangnam.example.go.kr");
        assert_eq!(gangnam["monitoring"]["uiNote"], "checked by hand in March");
        assert_eq!(gangnam["monitoring"]["consecutiveFailureCount"], 1);
        assert_eq!(stored["targets"][1], raw["targets"][1]);

        let targets = repo.load_targets().await.unwrap();
        assert_eq!(targets[0].monitoring, state);
    }

    #[tokio::test]
    async fn update_monitoring_without_a_registry_file_writes_nothing() {
        let dir = tempdir().unwrap();
        let repo = JsonRepository::new(dir.path());
        repo.update_monitoring(&[("seoul-gangnam".into(), MonitoringState::new(ts(1)))])
            .await
            .unwrap();
        assert!(!dir.path().join(TARGETS_FILE).exists());
        assert!(repo.load_targets().await.unwrap().is_empty());
    }
}
