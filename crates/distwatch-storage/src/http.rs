//! HTTP access for the portal and monitored targets.
//!
//! Transient failures are retried on a doubling schedule, honoring `Retry-After` when the server
//! sends one. Anything else returns on the first attempt.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info_span, Instrument};

/// Status codes worth another attempt: server trouble, throttling and request timeouts.
pub fn transient_status(status: u16) -> bool {
    status >= 500 || status == 429 || status == 408
}

/// `Retry-After` in its delta-seconds form. HTTP-date values are ignored.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySchedule {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetrySchedule {
    /// A single attempt; callers running their own retry loop use this.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Pause before retry number `retry` (0-based). A server hint replaces the doubled delay;
    /// both are capped at `max_delay`.
    pub fn wait(&self, retry: usize, server_hint: Option<Duration>) -> Duration {
        let doubled = self
            .base_delay
            .checked_mul(1u32 << retry.min(16))
            .unwrap_or(self.max_delay);
        server_hint.unwrap_or(doubled).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_host_concurrency: usize,
    pub retry: RetrySchedule,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 16,
            per_host_concurrency: 4,
            retry: RetrySchedule::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error for {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    /// True when the failure may clear without anything changing on our side.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Transport { source, .. } => {
                source.is_timeout() || source.is_connect() || source.is_request()
            }
            FetchError::HttpStatus { status, .. } => transient_status(*status),
        }
    }

    /// The target answered, but with a status that will not change on retry.
    pub fn is_rejection(&self) -> bool {
        matches!(self, FetchError::HttpStatus { .. }) && !self.is_transient()
    }
}

/// One global pool plus one pool per host, so a slow portal cannot starve the targets.
#[derive(Debug)]
struct HostLimits {
    global: Arc<Semaphore>,
    per_host: usize,
    hosts: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl HostLimits {
    fn new(global: usize, per_host: usize) -> Self {
        Self {
            global: Arc::new(Semaphore::new(global.max(1))),
            per_host: per_host.max(1),
            hosts: Mutex::new(HashMap::new()),
        }
    }

    async fn acquire(&self, url: &str) -> (OwnedSemaphorePermit, OwnedSemaphorePermit) {
        let host = reqwest::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
            .unwrap_or_default();
        let host_pool = {
            let mut hosts = self.hosts.lock().await;
            hosts
                .entry(host)
                .or_insert_with(|| Arc::new(Semaphore::new(self.per_host)))
                .clone()
        };
        let global = self
            .global
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore not closed");
        let host = host_pool
            .acquire_owned()
            .await
            .expect("semaphore not closed");
        (global, host)
    }
}

type AttemptFailure = (FetchError, Option<Duration>);

/// GET-only client shared by the portal adapters and the target monitor.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limits: HostLimits,
    retry: RetrySchedule,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            limits: HostLimits::new(config.global_concurrency, config.per_host_concurrency),
            retry: config.retry,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let _permits = self.limits.acquire(url).await;
            let mut retry = 0usize;
            loop {
                let (error, hint) = match self.attempt(url).await {
                    Ok(response) => return Ok(response),
                    Err(failure) => failure,
                };
                if !error.is_transient() || retry >= self.retry.max_retries {
                    return Err(error);
                }
                let wait = self.retry.wait(retry, hint);
                debug!(retry, wait_ms = wait.as_millis() as u64, error = %error, "transient failure; retrying");
                tokio::time::sleep(wait).await;
                retry += 1;
            }
        }
        .instrument(span)
        .await
    }

    async fn attempt(&self, url: &str) -> Result<FetchedResponse, AttemptFailure> {
        let transport = |source: reqwest::Error| {
            (
                FetchError::Transport {
                    url: url.to_string(),
                    source,
                },
                None,
            )
        };

        let response = self.client.get(url).send().await.map_err(transport)?;
        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        if !response.status().is_success() {
            let hint = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            return Err((
                FetchError::HttpStatus {
                    status,
                    url: final_url,
                },
                hint,
            ));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await.map_err(transport)?.to_vec();
        debug!(status, bytes = body.len(), "fetched");
        Ok(FetchedResponse {
            status,
            final_url,
            content_type,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_hint_replaces_doubling_but_not_the_cap() {
        let schedule = RetrySchedule {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
        };

        assert_eq!(schedule.wait(0, None), Duration::from_millis(200));
        assert_eq!(schedule.wait(2, None), Duration::from_millis(800));
        assert_eq!(schedule.wait(40, None), Duration::from_secs(2));
        assert_eq!(
            schedule.wait(0, Some(Duration::from_secs(1))),
            Duration::from_secs(1)
        );
        assert_eq!(
            schedule.wait(0, parse_retry_after("3600")),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn retry_after_accepts_only_delta_seconds() {
        assert_eq!(parse_retry_after(" 120 "), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2026 07:28:00 GMT"), None);
    }

    #[test]
    fn maintenance_and_throttling_are_transient_but_missing_pages_are_not() {
        let status = |status| FetchError::HttpStatus {
            status,
            url: "https://portal.example.org/data".into(),
        };

        assert!(status(503).is_transient());
        assert!(status(429).is_transient());
        assert!(status(408).is_transient());
        assert!(status(404).is_rejection());
        assert!(status(403).is_rejection());
        assert!(!status(502).is_rejection());
    }

    #[tokio::test]
    async fn a_busy_host_does_not_block_other_hosts() {
        let limits = HostLimits::new(4, 1);
        let _held = limits.acquire("https://portal.example.org/a").await;

        let other = tokio::time::timeout(
            Duration::from_millis(50),
            limits.acquire("https://Mirror.example.org/b"),
        )
        .await;
        assert!(other.is_ok());

        let same = tokio::time::timeout(
            Duration::from_millis(50),
            limits.acquire("https://PORTAL.example.org/c"),
        )
        .await;
        assert!(same.is_err());
    }
}
