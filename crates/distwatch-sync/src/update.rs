//! Marker-gated refresh of the published district dataset.

use std::path::PathBuf;
use std::sync::Arc;

use distwatch_adapters::{DatasetSource, FetchDiagnostics, MarkerSource};
use distwatch_core::UpdateMarker;
use distwatch_ingest::{
    ContentValidator, CsvTransformer, TransformDiagnostics, TransformError, ValidationReport,
    Verdict,
};
use distwatch_storage::{DatasetRepository, MarkerRepository, StoreError};
use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

/// Strategy name recorded for datasets an operator imported by hand.
pub const MANUAL_IMPORT: &str = "manual_import";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStage {
    Marker,
    Fetch,
    Validation,
    Transform,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateSummary {
    pub remote_marker: Option<String>,
    pub dataset_file: PathBuf,
    pub strategy_used: String,
    pub source_url: Option<String>,
    pub forced: bool,
    pub unique_count: usize,
    pub removed_duplicates: usize,
    pub neighborhood_count: usize,
    pub validation_score: Option<u8>,
    pub transform: TransformDiagnostics,
}

#[derive(Debug, Clone, Serialize)]
pub struct UpdateFailure {
    pub stage: UpdateStage,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch: Option<FetchDiagnostics>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transform: Option<TransformError>,
}

impl UpdateFailure {
    fn at(stage: UpdateStage, reason: impl Into<String>) -> Self {
        Self {
            stage,
            reason: reason.into(),
            fetch: None,
            validation: None,
            transform: None,
        }
    }
}

/// Outcome of one refresh attempt. A failure leaves the previous dataset and marker in place.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpdateReport {
    AlreadyCurrent { remote_marker: String },
    Updated(UpdateSummary),
    Failed(UpdateFailure),
}

impl UpdateReport {
    pub fn is_success(&self) -> bool {
        !matches!(self, UpdateReport::Failed(_))
    }

    pub fn describe(&self) -> String {
        match self {
            UpdateReport::AlreadyCurrent { remote_marker } => {
                format!("dataset already current (remote marker {remote_marker})")
            }
            UpdateReport::Updated(summary) => format!(
                "dataset refreshed via {}: {} municipalities, {} neighborhoods -> {}",
                summary.strategy_used,
                summary.unique_count,
                summary.neighborhood_count,
                summary.dataset_file.display()
            ),
            UpdateReport::Failed(failure) => {
                format!("refresh failed at {:?} stage: {}", failure.stage, failure.reason)
            }
        }
    }
}

struct Payload<'a> {
    bytes: &'a [u8],
    remote_marker: Option<String>,
    strategy: String,
    source_url: Option<String>,
    forced: bool,
    validation_score: Option<u8>,
    fetch: Option<FetchDiagnostics>,
}

pub struct UpdateTracker {
    markers: Arc<dyn MarkerSource>,
    source: Arc<dyn DatasetSource>,
    validator: ContentValidator,
    transformer: CsvTransformer,
    datasets: Arc<dyn DatasetRepository>,
    marker_store: Arc<dyn MarkerRepository>,
}

impl UpdateTracker {
    pub fn new(
        markers: Arc<dyn MarkerSource>,
        source: Arc<dyn DatasetSource>,
        validator: ContentValidator,
        transformer: CsvTransformer,
        datasets: Arc<dyn DatasetRepository>,
        marker_store: Arc<dyn MarkerRepository>,
    ) -> Self {
        Self {
            markers,
            source,
            validator,
            transformer,
            datasets,
            marker_store,
        }
    }

    /// Refresh when the remote marker differs from the stored one, or unconditionally when
    /// `force` is set. Only persistence failures are errors.
    pub async fn run(&self, force: bool) -> Result<UpdateReport, StoreError> {
        let span = info_span!("update_check", force);
        self.run_inner(force).instrument(span).await
    }

    async fn run_inner(&self, force: bool) -> Result<UpdateReport, StoreError> {
        let previous = self.marker_store.load_marker().await?;

        let remote = match self.markers.remote_marker().await {
            Ok(marker) => Some(marker),
            Err(err) if !force => {
                warn!(error = %err, "remote marker unavailable; refresh aborted");
                return Ok(UpdateReport::Failed(UpdateFailure::at(
                    UpdateStage::Marker,
                    err.to_string(),
                )));
            }
            Err(err) => {
                warn!(error = %err, "remote marker unavailable; forced refresh continues");
                None
            }
        };

        if !force {
            let stored = previous
                .as_ref()
                .and_then(|m| m.last_remote_modification_date.as_deref());
            if let Some(remote) = remote.as_deref().filter(|r| Some(*r) == stored) {
                info!(remote_marker = remote, "dataset already current");
                return Ok(UpdateReport::AlreadyCurrent {
                    remote_marker: remote.to_string(),
                });
            }
        }

        let outcome = self.source.fetch_dataset().await;
        let bytes = match outcome.bytes.as_deref() {
            Some(bytes) if outcome.success => bytes,
            _ => {
                warn!(
                    attempts = outcome.diagnostics.attempts.len(),
                    "every source strategy failed; previous dataset stays published"
                );
                return Ok(UpdateReport::Failed(UpdateFailure {
                    fetch: Some(outcome.diagnostics),
                    ..UpdateFailure::at(UpdateStage::Fetch, "every source strategy failed")
                }));
            }
        };

        // A forced run without a fresh marker keeps the last one it knew.
        let remote_marker =
            remote.or_else(|| previous.and_then(|m| m.last_remote_modification_date));
        self.publish(Payload {
            bytes,
            remote_marker,
            strategy: outcome
                .strategy_used
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            source_url: outcome.source_url.clone(),
            forced: force,
            validation_score: outcome.report.as_ref().map(|r| r.score),
            fetch: Some(outcome.diagnostics.clone()),
        })
        .await
    }

    /// Publish operator-supplied bytes after validating them. The stored remote marker is kept
    /// so the next scheduled check still compares against the portal.
    pub async fn import_bytes(&self, bytes: &[u8], origin: &str) -> Result<UpdateReport, StoreError> {
        let report = self.validator.validate(bytes);
        if report.verdict == Verdict::Invalid {
            warn!(origin, score = report.score, "import rejected by validator");
            return Ok(UpdateReport::Failed(UpdateFailure {
                validation: Some(report.clone()),
                ..UpdateFailure::at(
                    UpdateStage::Validation,
                    format!("validator score {} below threshold", report.score),
                )
            }));
        }
        if report.verdict == Verdict::PartiallyValid {
            warn!(origin, score = report.score, issues = ?report.issues, "importing a partially valid payload");
        }

        let previous = self.marker_store.load_marker().await?;
        self.publish(Payload {
            bytes,
            remote_marker: previous.and_then(|m| m.last_remote_modification_date),
            strategy: MANUAL_IMPORT.to_string(),
            source_url: Some(origin.to_string()),
            forced: true,
            validation_score: Some(report.score),
            fetch: None,
        })
        .await
    }

    async fn publish(&self, payload: Payload<'_>) -> Result<UpdateReport, StoreError> {
        let output = match self.transformer.transform(payload.bytes) {
            Ok(output) => output,
            Err(err) => {
                warn!(error = %err, strategy = %payload.strategy, "transform failed; dataset not written");
                return Ok(UpdateReport::Failed(UpdateFailure {
                    fetch: payload.fetch,
                    transform: Some(err.clone()),
                    ..UpdateFailure::at(UpdateStage::Transform, err.to_string())
                }));
            }
        };

        let dataset = &output.dataset;
        let path = self.datasets.save_dataset(dataset).await?;
        let marker = UpdateMarker {
            last_remote_modification_date: payload.remote_marker.clone(),
            last_local_update_time: dataset.processed_at,
            dataset_file: path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
            strategy_used: Some(payload.strategy.clone()),
        };
        self.marker_store.save_marker(&marker).await?;

        info!(
            strategy = %payload.strategy,
            unique = dataset.unique_count,
            neighborhoods = dataset.hierarchy.neighborhood_count(),
            path = %path.display(),
            "dataset published"
        );
        Ok(UpdateReport::Updated(UpdateSummary {
            remote_marker: payload.remote_marker,
            dataset_file: path,
            strategy_used: payload.strategy,
            source_url: payload.source_url,
            forced: payload.forced,
            unique_count: dataset.unique_count,
            removed_duplicates: dataset.removed_duplicates,
            neighborhood_count: dataset.hierarchy.neighborhood_count(),
            validation_score: payload.validation_score,
            transform: output.diagnostics.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use distwatch_adapters::{FetchOutcome, MarkerError};
    use distwatch_ingest::{TransformerConfig, ValidatorConfig};
    use distwatch_storage::JsonRepository;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    const SAMPLE: &[u8] = include_bytes!("../../../fixtures/district_codes_sample.csv");

    struct FixedMarker(Option<&'static str>);

    #[async_trait]
    impl MarkerSource for FixedMarker {
        async fn remote_marker(&self) -> Result<String, MarkerError> {
            self.0.map(str::to_string).ok_or_else(|| MarkerError::NotFound {
                url: "https://portal.example.org/data".into(),
            })
        }
    }

    struct CountingSource {
        payload: Option<Vec<u8>>,
        calls: AtomicUsize,
    }

    impl CountingSource {
        fn new(payload: Option<&[u8]>) -> Arc<Self> {
            Arc::new(Self {
                payload: payload.map(<[u8]>::to_vec),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DatasetSource for CountingSource {
        async fn fetch_dataset(&self) -> FetchOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            FetchOutcome {
                success: self.payload.is_some(),
                bytes: self.payload.clone(),
                strategy_used: self.payload.as_ref().map(|_| "two_step_download".to_string()),
                source_url: self
                    .payload
                    .as_ref()
                    .map(|_| "https://portal.example.org/download".to_string()),
                report: None,
                diagnostics: FetchDiagnostics::default(),
            }
        }
    }

    fn tracker(
        repo: &Arc<JsonRepository>,
        marker: Option<&'static str>,
        source: Arc<CountingSource>,
    ) -> UpdateTracker {
        UpdateTracker::new(
            Arc::new(FixedMarker(marker)),
            source,
            ContentValidator::new(ValidatorConfig::default()),
            CsvTransformer::new(TransformerConfig::default()),
            repo.clone(),
            repo.clone(),
        )
    }

    async fn seed_marker(repo: &JsonRepository, remote: &str) {
        repo.save_marker(&UpdateMarker {
            last_remote_modification_date: Some(remote.to_string()),
            last_local_update_time: Utc::now(),
            dataset_file: None,
            strategy_used: None,
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn equal_markers_skip_the_fetch() {
        let dir = tempdir().unwrap();
        let repo = Arc::new(JsonRepository::new(dir.path()));
        seed_marker(&repo, "2024-01-01").await;
        let source = CountingSource::new(Some(SAMPLE));

        let report = tracker(&repo, Some("2024-01-01"), source.clone())
            .run(false)
            .await
            .unwrap();
        assert!(matches!(report, UpdateReport::AlreadyCurrent { ref remote_marker } if remote_marker == "2024-01-01"));
        assert_eq!(source.calls(), 0);
        assert!(repo.list_datasets().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn force_runs_the_whole_chain_even_when_current() {
        let dir = tempdir().unwrap();
        let repo = Arc::new(JsonRepository::new(dir.path()));
        seed_marker(&repo, "2024-01-01").await;
        let source = CountingSource::new(Some(SAMPLE));

        let report = tracker(&repo, Some("2024-01-01"), source.clone())
            .run(true)
            .await
            .unwrap();
        let UpdateReport::Updated(summary) = report else {
            panic!("expected an update");
        };
        assert!(summary.forced);
        assert_eq!(source.calls(), 1);
        assert_eq!(repo.list_datasets().await.unwrap(), vec![summary.dataset_file.clone()]);

        let marker = repo.load_marker().await.unwrap().unwrap();
        assert_eq!(marker.strategy_used.as_deref(), Some("two_step_download"));
        assert_eq!(marker.last_remote_modification_date.as_deref(), Some("2024-01-01"));
    }

    #[tokio::test]
    async fn newer_remote_marker_refreshes_and_is_recorded() {
        let dir = tempdir().unwrap();
        let repo = Arc::new(JsonRepository::new(dir.path()));
        seed_marker(&repo, "2024-01-01").await;

        let report = tracker(&repo, Some("2024-03-15"), CountingSource::new(Some(SAMPLE)))
            .run(false)
            .await
            .unwrap();
        assert!(matches!(report, UpdateReport::Updated(_)));
        let marker = repo.load_marker().await.unwrap().unwrap();
        assert_eq!(marker.last_remote_modification_date.as_deref(), Some("2024-03-15"));
    }

    #[tokio::test]
    async fn marker_failure_aborts_unless_forced() {
        let dir = tempdir().unwrap();
        let repo = Arc::new(JsonRepository::new(dir.path()));
        seed_marker(&repo, "2024-01-01").await;

        let source = CountingSource::new(Some(SAMPLE));
        let report = tracker(&repo, None, source.clone()).run(false).await.unwrap();
        assert!(matches!(report, UpdateReport::Failed(ref f) if f.stage == UpdateStage::Marker));
        assert_eq!(source.calls(), 0);

        let report = tracker(&repo, None, source.clone()).run(true).await.unwrap();
        assert!(report.is_success());
        let marker = repo.load_marker().await.unwrap().unwrap();
        assert_eq!(marker.last_remote_modification_date.as_deref(), Some("2024-01-01"));
    }

    #[tokio::test]
    async fn exhausted_sources_and_bad_csv_leave_previous_state() {
        let dir = tempdir().unwrap();
        let repo = Arc::new(JsonRepository::new(dir.path()));
        seed_marker(&repo, "2024-01-01").await;

        let report = tracker(&repo, Some("2024-02-01"), CountingSource::new(None))
            .run(false)
            .await
            .unwrap();
        assert!(matches!(report, UpdateReport::Failed(ref f) if f.stage == UpdateStage::Fetch && f.fetch.is_some()));

        let two_columns = "시도명,시군구명\n서울특별시,종로구\n서울특별시,중구\n".as_bytes();
        let report = tracker(&repo, Some("2024-02-01"), CountingSource::new(Some(two_columns)))
            .run(false)
            .await
            .unwrap();
        assert!(matches!(report, UpdateReport::Failed(ref f) if f.stage == UpdateStage::Transform && f.transform.is_some()));

        assert!(repo.list_datasets().await.unwrap().is_empty());
        let marker = repo.load_marker().await.unwrap().unwrap();
        assert_eq!(marker.last_remote_modification_date.as_deref(), Some("2024-01-01"));
    }

    #[tokio::test]
    async fn manual_import_keeps_the_remote_marker() {
        let dir = tempdir().unwrap();
        let repo = Arc::new(JsonRepository::new(dir.path()));
        seed_marker(&repo, "2024-01-01").await;
        let tracker = tracker(&repo, Some("2024-05-01"), CountingSource::new(None));

        let rejected = tracker
            .import_bytes(b"<html><body>login required</body></html>", "upload.csv")
            .await
            .unwrap();
        assert!(matches!(rejected, UpdateReport::Failed(ref f) if f.stage == UpdateStage::Validation));

        let report = tracker.import_bytes(SAMPLE, "upload.csv").await.unwrap();
        let UpdateReport::Updated(summary) = report else {
            panic!("expected import to publish");
        };
        assert_eq!(summary.strategy_used, MANUAL_IMPORT);
        let marker = repo.load_marker().await.unwrap().unwrap();
        assert_eq!(marker.last_remote_modification_date.as_deref(), Some("2024-01-01"));
        assert_eq!(marker.strategy_used.as_deref(), Some(MANUAL_IMPORT));
    }
}
