use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use distwatch_adapters::{
    MarkerSource, PortalConfig, PortalHttp, PortalMarkerScraper, PortalResponse, SourceFetcher,
    StrategyFailure,
};
use distwatch_ingest::{ContentValidator, ValidatorConfig};
use distwatch_storage::FetchError;

const LANDING: &str = "https://portal.example.org/data/15063424/fileData.do";
const META: &str = "https://portal.example.org/tcs/dss/selectFileDataDownload.do";
const DOWNLOAD: &str = "https://portal.example.org/cmm/cmm/fileDownload.do";
const MIRROR: &str = "https://mirror.example.org/district.csv";
const FALLBACK: &str = "https://fallback.example.org/district.csv";

fn fixture(rel: &str) -> Vec<u8> {
    let path: PathBuf = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../../fixtures")
        .join(rel);
    std::fs::read(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

/// Routes by URL prefix; unknown URLs answer 404.
#[derive(Default)]
struct FakePortal {
    routes: Vec<(String, PortalResponse)>,
    calls: Mutex<Vec<String>>,
}

impl FakePortal {
    fn route(mut self, prefix: &str, content_type: &str, body: Vec<u8>) -> Self {
        self.routes.push((
            prefix.to_string(),
            PortalResponse {
                status: 200,
                final_url: prefix.to_string(),
                content_type: Some(content_type.to_string()),
                body,
            },
        ));
        self
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PortalHttp for FakePortal {
    async fn get(&self, url: &str) -> Result<PortalResponse, FetchError> {
        self.calls.lock().unwrap().push(url.to_string());
        self.routes
            .iter()
            .find(|(prefix, _)| url.starts_with(prefix.as_str()))
            .map(|(_, response)| {
                let mut response = response.clone();
                response.final_url = url.to_string();
                response
            })
            .ok_or_else(|| FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            })
    }
}

fn config() -> PortalConfig {
    PortalConfig {
        landing_url: LANDING.to_string(),
        file_meta_url: META.to_string(),
        file_download_url: DOWNLOAD.to_string(),
        known_endpoints: vec![MIRROR.to_string()],
        fallback_url: Some(FALLBACK.to_string()),
        ..PortalConfig::default()
    }
}

fn fetcher(portal: FakePortal) -> (Arc<FakePortal>, SourceFetcher) {
    let portal = Arc::new(portal);
    let fetcher = SourceFetcher::new(
        portal.clone(),
        ContentValidator::new(ValidatorConfig::default()),
        config(),
    )
    .expect("patterns compile");
    (portal, fetcher)
}

#[tokio::test]
async fn two_step_download_wins_on_a_healthy_portal() {
    let (portal, fetcher) = fetcher(
        FakePortal::default()
            .route(LANDING, "text/html", fixture("portal/landing.html"))
            .route(META, "application/json", fixture("portal/file_meta.json"))
            .route(DOWNLOAD, "application/octet-stream", fixture("district_codes_sample.csv")),
    );

    let outcome = fetcher.run().await;
    assert!(outcome.success);
    assert_eq!(outcome.strategy_used.as_deref(), Some("two_step_download"));
    assert_eq!(outcome.diagnostics.extraction_confidence(), Some(90));
    assert!(outcome.report.expect("report").is_valid);

    let calls = portal.calls();
    assert_eq!(calls.len(), 3);
    assert!(calls[1].contains("publicDataPk=15063424"));
    assert!(calls[2].contains("atchFileId=FILE_000000002870421"));
}

#[tokio::test]
async fn html_error_page_with_status_200_moves_on_to_the_next_strategy() {
    let (_, fetcher) = fetcher(
        FakePortal::default()
            .route(LANDING, "text/html", fixture("portal/landing.html"))
            .route(META, "application/json", fixture("portal/file_meta.json"))
            .route(DOWNLOAD, "application/octet-stream", fixture("portal/error_page.html"))
            .route(MIRROR, "text/csv", fixture("district_codes_sample.csv")),
    );

    let outcome = fetcher.run().await;
    assert!(outcome.success);
    assert_eq!(outcome.strategy_used.as_deref(), Some("known_endpoints"));

    let attempts = &outcome.diagnostics.attempts;
    assert_eq!(attempts.len(), 3);
    assert!(matches!(
        attempts[0].failure,
        Some(StrategyFailure::HtmlPayload { .. })
    ));
    // the landing page links to the same broken download
    assert!(matches!(
        attempts[1].failure,
        Some(StrategyFailure::HtmlPayload { .. })
    ));
    assert!(attempts[2].succeeded);
}

#[tokio::test]
async fn exhausted_chain_reports_every_strategy() {
    let (_, fetcher) = fetcher(
        FakePortal::default()
            .route(LANDING, "text/html", fixture("portal/landing.html"))
            .route(MIRROR, "text/csv", b"just some prose, nothing tabular here".to_vec()),
    );

    let outcome = fetcher.run().await;
    assert!(!outcome.success);
    assert!(outcome.bytes.is_none());
    let names: Vec<&str> = outcome
        .diagnostics
        .attempts
        .iter()
        .map(|a| a.strategy.as_str())
        .collect();
    assert_eq!(
        names,
        vec!["two_step_download", "link_scan", "known_endpoints", "fallback_url"]
    );
    assert!(matches!(
        outcome.diagnostics.attempts[2].failure,
        Some(StrategyFailure::Rejected { .. })
    ));
    assert!(matches!(
        outcome.diagnostics.attempts[3].failure,
        Some(StrategyFailure::Network { .. })
    ));
    assert_eq!(outcome.diagnostics.extraction_confidence(), Some(90));
}

#[tokio::test]
async fn unreachable_landing_page_still_tries_static_urls() {
    let (_, fetcher) = fetcher(
        FakePortal::default().route(FALLBACK, "text/csv", fixture("district_codes_sample.csv")),
    );

    let outcome = fetcher.run().await;
    assert!(outcome.success);
    assert_eq!(outcome.strategy_used.as_deref(), Some("fallback_url"));
    assert!(outcome.diagnostics.landing_error.is_some());
    assert!(matches!(
        outcome.diagnostics.attempts[0].failure,
        Some(StrategyFailure::Network { .. })
    ));
}

#[tokio::test]
async fn marker_scraper_reads_the_modification_date() {
    let portal = Arc::new(
        FakePortal::default().route(LANDING, "text/html", fixture("portal/landing.html")),
    );
    let scraper = PortalMarkerScraper::new(portal, LANDING).expect("patterns compile");
    assert_eq!(scraper.remote_marker().await.expect("marker"), "2024-01-05");

    let empty = PortalMarkerScraper::new(Arc::new(FakePortal::default()), LANDING)
        .expect("patterns compile");
    assert!(empty.remote_marker().await.is_err());
}
