//! Portal-facing adapters: the dataset source strategy chain and the remote marker scraper.

mod extract;
mod marker;
mod strategy;

use async_trait::async_trait;
use distwatch_storage::{FetchError, HttpFetcher};
use serde::{Deserialize, Serialize};

pub use extract::{
    file_download_url, file_meta_url, scan_download_links, DownloadParams, ExtractionSource,
    FileHandle, ParamExtraction, PortalPatterns,
};
pub use marker::{page_text, MarkerError, MarkerPatterns, MarkerSource, PortalMarkerScraper};
pub use strategy::{
    Accepted, CandidateAttempt, DatasetSource, FallbackUrl, FetchDiagnostics, FetchOutcome,
    KnownEndpoints, LandingPage, LinkScan, SourceFetcher, SourceStrategy, StrategyAttempt,
    StrategyContext, StrategyFailure, TwoStepDownload,
};

pub const CRATE_NAME: &str = "distwatch-adapters";

/// Dataset page of the national legal-district code file on the public data portal.
pub const DEFAULT_LANDING_URL: &str = "https://www.data.go.kr/data/15063424/fileData.do";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    pub landing_url: String,
    /// First request of the two-step download; answers with an attachment handle.
    pub file_meta_url: String,
    /// Second request; streams the file for a handle.
    pub file_download_url: String,
    pub known_endpoints: Vec<String>,
    pub fallback_url: Option<String>,
    pub min_extraction_confidence: u8,
    pub accept_partial: bool,
    pub max_link_candidates: usize,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            landing_url: DEFAULT_LANDING_URL.to_string(),
            file_meta_url: "https://www.data.go.kr/tcs/dss/selectFileDataDownload.do".to_string(),
            file_download_url: "https://www.data.go.kr/cmm/cmm/fileDownload.do".to_string(),
            known_endpoints: vec![
                "https://www.data.go.kr/tcs/dss/selectFileDataDownload.do?publicDataPk=15063424&fileDetailSn=1".to_string(),
                "https://www.data.go.kr/catalog/15063424/fileData.csv".to_string(),
            ],
            fallback_url: Some(
                "https://www.code.go.kr/etc/codeFullDown.do?codeseId=00002".to_string(),
            ),
            min_extraction_confidence: 50,
            accept_partial: false,
            max_link_candidates: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortalResponse {
    pub status: u16,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// The only way adapters reach the network.
#[async_trait]
pub trait PortalHttp: Send + Sync {
    async fn get(&self, url: &str) -> Result<PortalResponse, FetchError>;
}

#[async_trait]
impl PortalHttp for HttpFetcher {
    async fn get(&self, url: &str) -> Result<PortalResponse, FetchError> {
        let response = self.fetch_bytes(url).await?;
        Ok(PortalResponse {
            status: response.status,
            final_url: response.final_url,
            content_type: response.content_type,
            body: response.body,
        })
    }
}
