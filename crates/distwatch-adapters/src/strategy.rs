//! The ordered strategy chain that turns the portal into validated CSV bytes.

use std::sync::Arc;

use async_trait::async_trait;
use distwatch_ingest::{
    decode_payload, looks_like_markup, ContentValidator, MarkupKind, ValidationReport, Verdict,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};

use crate::extract::{
    file_download_url, file_meta_url, scan_download_links, FileHandle, ParamExtraction,
    PortalPatterns,
};
use crate::{PortalConfig, PortalHttp};

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "failure", rename_all = "snake_case")]
pub enum StrategyFailure {
    #[error("{url} returned {kind:?} markup instead of data")]
    HtmlPayload { url: String, kind: MarkupKind },
    #[error("{url} rejected by validator (score {score}): {}", .issues.join("; "))]
    Rejected {
        url: String,
        score: u8,
        verdict: Verdict,
        issues: Vec<String>,
    },
    #[error("fetching {url}: {message}")]
    Network { url: String, message: String },
    #[error("download parameters unusable (confidence {confidence}): {reason}")]
    ExtractionUnusable { confidence: u8, reason: String },
    #[error("no candidates: {reason}")]
    NoCandidates { reason: String },
}

/// One URL tried inside a strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateAttempt {
    pub url: String,
    pub status: Option<u16>,
    pub bytes: usize,
    pub score: Option<u8>,
    pub verdict: Option<Verdict>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyAttempt {
    pub strategy: String,
    pub succeeded: bool,
    pub failure: Option<StrategyFailure>,
    pub candidates: Vec<CandidateAttempt>,
    pub extraction_confidence: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FetchDiagnostics {
    pub landing_url: String,
    pub landing_error: Option<String>,
    pub attempts: Vec<StrategyAttempt>,
}

impl FetchDiagnostics {
    pub fn extraction_confidence(&self) -> Option<u8> {
        self.attempts.iter().find_map(|a| a.extraction_confidence)
    }
}

/// Result of one run of the chain. Exhaustion is a value, not an error.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    pub success: bool,
    pub bytes: Option<Vec<u8>>,
    pub strategy_used: Option<String>,
    pub source_url: Option<String>,
    pub report: Option<ValidationReport>,
    pub diagnostics: FetchDiagnostics,
}

/// A payload the validator accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct Accepted {
    pub url: String,
    pub bytes: Vec<u8>,
    pub report: ValidationReport,
}

#[derive(Debug, Clone)]
pub struct LandingPage {
    pub url: String,
    pub html: String,
}

/// What a strategy sees: shared collaborators plus its own attempt log.
pub struct StrategyContext<'a> {
    pub http: &'a dyn PortalHttp,
    pub validator: &'a ContentValidator,
    pub config: &'a PortalConfig,
    pub landing: Result<&'a LandingPage, &'a str>,
    pub candidates: Vec<CandidateAttempt>,
    pub extraction_confidence: Option<u8>,
}

impl<'a> StrategyContext<'a> {
    fn landing(&self) -> Result<&'a LandingPage, StrategyFailure> {
        self.landing.map_err(|message| StrategyFailure::Network {
            url: self.config.landing_url.clone(),
            message: message.to_string(),
        })
    }

    /// GET `url`, refuse markup, and run the validator.
    pub async fn download_candidate(&mut self, url: &str) -> Result<Accepted, StrategyFailure> {
        let mut attempt = CandidateAttempt {
            url: url.to_string(),
            status: None,
            bytes: 0,
            score: None,
            verdict: None,
            error: None,
        };
        let result = self.check_candidate(url, &mut attempt).await;
        if let Err(failure) = &result {
            attempt.error = Some(failure.to_string());
        }
        self.candidates.push(attempt);
        result
    }

    async fn check_candidate(
        &self,
        url: &str,
        attempt: &mut CandidateAttempt,
    ) -> Result<Accepted, StrategyFailure> {
        let response = self
            .http
            .get(url)
            .await
            .map_err(|err| StrategyFailure::Network {
                url: url.to_string(),
                message: err.to_string(),
            })?;
        attempt.status = Some(response.status);
        attempt.bytes = response.body.len();
        if !(200..300).contains(&response.status) {
            return Err(StrategyFailure::Network {
                url: url.to_string(),
                message: format!("http status {}", response.status),
            });
        }
        if let Some(kind) = looks_like_markup(&response.body, response.content_type.as_deref()) {
            return Err(StrategyFailure::HtmlPayload {
                url: url.to_string(),
                kind,
            });
        }

        let report = self.validator.validate(&response.body);
        attempt.score = Some(report.score);
        attempt.verdict = Some(report.verdict);
        let accepted = match report.verdict {
            Verdict::Valid => true,
            Verdict::PartiallyValid => self.config.accept_partial,
            Verdict::Invalid => false,
        };
        if !accepted {
            return Err(StrategyFailure::Rejected {
                url: url.to_string(),
                score: report.score,
                verdict: report.verdict,
                issues: report.issues.clone(),
            });
        }
        Ok(Accepted {
            url: response.final_url,
            bytes: response.body,
            report,
        })
    }

    /// Try each URL until one is accepted; the last failure wins otherwise.
    async fn first_accepted(
        &mut self,
        urls: &[String],
        empty_reason: &str,
    ) -> Result<Accepted, StrategyFailure> {
        let mut last = StrategyFailure::NoCandidates {
            reason: empty_reason.to_string(),
        };
        for url in urls {
            match self.download_candidate(url).await {
                Ok(accepted) => return Ok(accepted),
                Err(failure) => last = failure,
            }
        }
        Err(last)
    }
}

#[async_trait]
pub trait SourceStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    async fn attempt(&self, ctx: &mut StrategyContext<'_>) -> Result<Accepted, StrategyFailure>;
}

/// Extract `publicDataPk`-style parameters, resolve a file handle, then download by handle.
pub struct TwoStepDownload {
    patterns: PortalPatterns,
}

impl TwoStepDownload {
    pub fn new(patterns: PortalPatterns) -> Self {
        Self { patterns }
    }
}

#[async_trait]
impl SourceStrategy for TwoStepDownload {
    fn name(&self) -> &'static str {
        "two_step_download"
    }

    async fn attempt(&self, ctx: &mut StrategyContext<'_>) -> Result<Accepted, StrategyFailure> {
        let landing = ctx.landing()?;
        let (params, confidence) = match self.patterns.extract_download_params(&landing.html) {
            ParamExtraction::Found {
                params, confidence, ..
            } => (params, confidence),
            ParamExtraction::NotFound { reason } => {
                ctx.extraction_confidence = Some(0);
                return Err(StrategyFailure::ExtractionUnusable {
                    confidence: 0,
                    reason,
                });
            }
        };
        ctx.extraction_confidence = Some(confidence);
        if confidence < ctx.config.min_extraction_confidence {
            return Err(StrategyFailure::ExtractionUnusable {
                confidence,
                reason: format!(
                    "below the minimum of {}",
                    ctx.config.min_extraction_confidence
                ),
            });
        }

        let meta_url = file_meta_url(&ctx.config.file_meta_url, &params)
            .map_err(|err| StrategyFailure::NoCandidates {
                reason: format!("file meta url: {err}"),
            })?
            .to_string();
        let meta = ctx
            .http
            .get(&meta_url)
            .await
            .map_err(|err| StrategyFailure::Network {
                url: meta_url.clone(),
                message: err.to_string(),
            })?;
        ctx.candidates.push(CandidateAttempt {
            url: meta_url.clone(),
            status: Some(meta.status),
            bytes: meta.body.len(),
            score: None,
            verdict: None,
            error: None,
        });

        let handle = self
            .patterns
            .parse_file_handle(&meta.body, params.file_detail_sn.as_deref())
            .or_else(|| {
                params.atch_file_id.clone().map(|atch_file_id| FileHandle {
                    atch_file_id,
                    file_detail_sn: params.file_detail_sn.clone().unwrap_or_else(|| "1".to_string()),
                })
            })
            .ok_or_else(|| StrategyFailure::ExtractionUnusable {
                confidence,
                reason: format!("{meta_url} returned no file handle"),
            })?;

        let download_url = file_download_url(&ctx.config.file_download_url, &handle)
            .map_err(|err| StrategyFailure::NoCandidates {
                reason: format!("file download url: {err}"),
            })?
            .to_string();
        ctx.download_candidate(&download_url).await
    }
}

/// Anchors on the landing page that look like downloads.
pub struct LinkScan;

#[async_trait]
impl SourceStrategy for LinkScan {
    fn name(&self) -> &'static str {
        "link_scan"
    }

    async fn attempt(&self, ctx: &mut StrategyContext<'_>) -> Result<Accepted, StrategyFailure> {
        let landing = ctx.landing()?;
        let links = scan_download_links(&landing.html, &landing.url, ctx.config.max_link_candidates);
        ctx.first_accepted(&links, "no download-like anchors on the landing page")
            .await
    }
}

pub struct KnownEndpoints;

#[async_trait]
impl SourceStrategy for KnownEndpoints {
    fn name(&self) -> &'static str {
        "known_endpoints"
    }

    async fn attempt(&self, ctx: &mut StrategyContext<'_>) -> Result<Accepted, StrategyFailure> {
        let urls = ctx.config.known_endpoints.clone();
        ctx.first_accepted(&urls, "no known endpoints configured").await
    }
}

pub struct FallbackUrl;

#[async_trait]
impl SourceStrategy for FallbackUrl {
    fn name(&self) -> &'static str {
        "fallback_url"
    }

    async fn attempt(&self, ctx: &mut StrategyContext<'_>) -> Result<Accepted, StrategyFailure> {
        let urls: Vec<String> = ctx.config.fallback_url.iter().cloned().collect();
        ctx.first_accepted(&urls, "no fallback url configured").await
    }
}

/// Anything that can produce the raw dataset bytes.
#[async_trait]
pub trait DatasetSource: Send + Sync {
    async fn fetch_dataset(&self) -> FetchOutcome;
}

/// Runs the strategies in order; the first accepted payload wins.
pub struct SourceFetcher {
    http: Arc<dyn PortalHttp>,
    validator: ContentValidator,
    config: PortalConfig,
    strategies: Vec<Box<dyn SourceStrategy>>,
}

impl SourceFetcher {
    pub fn new(
        http: Arc<dyn PortalHttp>,
        validator: ContentValidator,
        config: PortalConfig,
    ) -> Result<Self, regex::Error> {
        let strategies: Vec<Box<dyn SourceStrategy>> = vec![
            Box::new(TwoStepDownload::new(PortalPatterns::new()?)),
            Box::new(LinkScan),
            Box::new(KnownEndpoints),
            Box::new(FallbackUrl),
        ];
        Ok(Self::with_strategies(http, validator, config, strategies))
    }

    pub fn with_strategies(
        http: Arc<dyn PortalHttp>,
        validator: ContentValidator,
        config: PortalConfig,
        strategies: Vec<Box<dyn SourceStrategy>>,
    ) -> Self {
        Self {
            http,
            validator,
            config,
            strategies,
        }
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    async fn fetch_landing(&self) -> Result<LandingPage, String> {
        let response = self
            .http
            .get(&self.config.landing_url)
            .await
            .map_err(|err| err.to_string())?;
        if !(200..300).contains(&response.status) {
            return Err(format!("http status {}", response.status));
        }
        Ok(LandingPage {
            url: response.final_url,
            html: decode_payload(&response.body).text,
        })
    }

    pub async fn run(&self) -> FetchOutcome {
        let landing = self.fetch_landing().await;
        let mut diagnostics = FetchDiagnostics {
            landing_url: self.config.landing_url.clone(),
            landing_error: landing.as_ref().err().cloned(),
            attempts: Vec::with_capacity(self.strategies.len()),
        };
        if let Some(err) = &diagnostics.landing_error {
            warn!(url = %self.config.landing_url, error = %err, "landing page unavailable");
        }

        for strategy in &self.strategies {
            let mut ctx = StrategyContext {
                http: self.http.as_ref(),
                validator: &self.validator,
                config: &self.config,
                landing: landing.as_ref().map_err(String::as_str),
                candidates: Vec::new(),
                extraction_confidence: None,
            };
            let span = info_span!("source_strategy", strategy = strategy.name());
            let result = strategy.attempt(&mut ctx).instrument(span).await;

            let mut attempt = StrategyAttempt {
                strategy: strategy.name().to_string(),
                succeeded: result.is_ok(),
                failure: None,
                candidates: ctx.candidates,
                extraction_confidence: ctx.extraction_confidence,
            };
            match result {
                Ok(accepted) => {
                    info!(
                        strategy = strategy.name(),
                        url = %accepted.url,
                        score = accepted.report.score,
                        bytes = accepted.bytes.len(),
                        "dataset payload accepted"
                    );
                    diagnostics.attempts.push(attempt);
                    return FetchOutcome {
                        success: true,
                        bytes: Some(accepted.bytes),
                        strategy_used: Some(strategy.name().to_string()),
                        source_url: Some(accepted.url),
                        report: Some(accepted.report),
                        diagnostics,
                    };
                }
                Err(failure) => {
                    warn!(strategy = strategy.name(), %failure, "strategy failed");
                    attempt.failure = Some(failure);
                    diagnostics.attempts.push(attempt);
                }
            }
        }

        warn!(
            tried = diagnostics.attempts.len(),
            "all strategies exhausted; manual import required"
        );
        FetchOutcome {
            success: false,
            bytes: None,
            strategy_used: None,
            source_url: None,
            report: None,
            diagnostics,
        }
    }
}

#[async_trait]
impl DatasetSource for SourceFetcher {
    async fn fetch_dataset(&self) -> FetchOutcome {
        self.run().await
    }
}
