use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use distwatch_ingest::decode_payload;
use regex::Regex;
use scraper::Html;
use thiserror::Error;
use tracing::{debug, warn};

use crate::PortalHttp;

const NEAR_KEYWORDS: [&str; 6] = ["수정", "갱신", "업데이트", "변경", "modified", "updated"];
const NEAR_WINDOW_CHARS: usize = 80;

#[derive(Debug, Error)]
pub enum MarkerError {
    #[error("fetching {url}: {message}")]
    Network { url: String, message: String },
    #[error("no modification date found on {url}")]
    NotFound { url: String },
}

/// Source of the remote "last modified" marker compared against the persisted UpdateMarker.
#[async_trait]
pub trait MarkerSource: Send + Sync {
    async fn remote_marker(&self) -> Result<String, MarkerError>;
}

#[derive(Debug, Clone)]
pub struct MarkerPatterns {
    labeled: Regex,
    bare_date: Regex,
}

impl MarkerPatterns {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            labeled: Regex::new(
                r"(?i)(?:최종\s*수정일|수정일자?|변경일자?|갱신일|last\s*modified|updated)\s*[:：]?\s*(\d{4})\s*[.\-/년]\s*(\d{1,2})\s*[.\-/월]\s*(\d{1,2})",
            )?,
            bare_date: Regex::new(r"(\d{4})\s*[.\-/년]\s*(\d{1,2})\s*[.\-/월]\s*(\d{1,2})")?,
        })
    }

    /// Labeled match first, then any date shortly after a modification keyword.
    /// Returns `YYYY-MM-DD`.
    pub fn find_modification_date(&self, page_text: &str) -> Option<String> {
        for caps in self.labeled.captures_iter(page_text) {
            if let Some(date) = ymd(&caps[1], &caps[2], &caps[3]) {
                return Some(date);
            }
        }

        let lowered = page_text.to_lowercase();
        for keyword in NEAR_KEYWORDS {
            for (idx, _) in lowered.match_indices(keyword) {
                let window: String = lowered[idx..].chars().take(NEAR_WINDOW_CHARS).collect();
                if let Some(date) = self
                    .bare_date
                    .captures(&window)
                    .and_then(|caps| ymd(&caps[1], &caps[2], &caps[3]))
                {
                    return Some(date);
                }
            }
        }
        None
    }
}

fn ymd(year: &str, month: &str, day: &str) -> Option<String> {
    let date = NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, day.parse().ok()?)?;
    Some(date.format("%Y-%m-%d").to_string())
}

/// Flatten the visible text of an HTML page, one space between text nodes.
pub fn page_text(html: &str) -> String {
    let document = Html::parse_document(html);
    document
        .root_element()
        .text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Reads the marker off the dataset landing page.
pub struct PortalMarkerScraper {
    http: Arc<dyn PortalHttp>,
    landing_url: String,
    patterns: MarkerPatterns,
}

impl PortalMarkerScraper {
    pub fn new(http: Arc<dyn PortalHttp>, landing_url: impl Into<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            http,
            landing_url: landing_url.into(),
            patterns: MarkerPatterns::new()?,
        })
    }
}

#[async_trait]
impl MarkerSource for PortalMarkerScraper {
    async fn remote_marker(&self) -> Result<String, MarkerError> {
        let response = self
            .http
            .get(&self.landing_url)
            .await
            .map_err(|err| MarkerError::Network {
                url: self.landing_url.clone(),
                message: err.to_string(),
            })?;
        let html = decode_payload(&response.body).text;
        match self.patterns.find_modification_date(&page_text(&html)) {
            Some(date) => {
                debug!(url = %self.landing_url, %date, "remote marker scraped");
                Ok(date)
            }
            None => {
                warn!(url = %self.landing_url, "landing page carries no modification date");
                Err(MarkerError::NotFound {
                    url: self.landing_url.clone(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns() -> MarkerPatterns {
        MarkerPatterns::new().expect("patterns compile")
    }

    #[test]
    fn labeled_table_cell_wins() {
        let html = "<table><tr><th>등록일</th><td>2019-03-01</td></tr>\
                    <tr><th>수정일</th><td>2024.1.5</td></tr></table>";
        assert_eq!(
            patterns().find_modification_date(&page_text(html)).as_deref(),
            Some("2024-01-05")
        );
    }

    #[test]
    fn korean_date_notation_is_normalized() {
        assert_eq!(
            patterns().find_modification_date("최종 수정일: 2023년 12월 31일").as_deref(),
            Some("2023-12-31")
        );
    }

    #[test]
    fn keyword_proximity_is_the_fallback() {
        let text = "데이터 갱신 주기 연간 (마지막 반영 2024/02/29)";
        assert_eq!(patterns().find_modification_date(text).as_deref(), Some("2024-02-29"));
    }

    #[test]
    fn impossible_dates_and_unlabeled_pages_yield_nothing() {
        assert_eq!(patterns().find_modification_date("수정일 2024-13-40"), None);
        assert_eq!(patterns().find_modification_date("발행 2024-01-01"), None);
    }
}
