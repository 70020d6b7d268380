//! Download-parameter extraction from the portal's dataset landing page.

use regex::Regex;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use url::Url;

const KEY_PK: &str = "publicDataPk";
const KEY_DETAIL_PK: &str = "publicDataDetailPk";
const KEY_FILE_SN: &str = "fileDetailSn";
const KEY_ATCH_FILE: &str = "atchFileId";

const LINK_KEYWORDS: [&str; 4] = ["download", "다운로드", "filedownload", ".csv"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadParams {
    pub public_data_pk: String,
    pub public_data_detail_pk: String,
    pub file_detail_sn: Option<String>,
    pub atch_file_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionSource {
    /// `fn_fileDataDown(...)` call in a script block or event-handler attribute.
    DownloadCall,
    /// `key: value` / `key = value` assignments inside scripts and handlers.
    ScriptAssignment,
    HiddenInput,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ParamExtraction {
    Found {
        params: DownloadParams,
        confidence: u8,
        source: ExtractionSource,
    },
    NotFound {
        reason: String,
    },
}

impl ParamExtraction {
    pub fn confidence(&self) -> u8 {
        match self {
            ParamExtraction::Found { confidence, .. } => *confidence,
            ParamExtraction::NotFound { .. } => 0,
        }
    }
}

/// Opaque handle returned by the first request of the two-step download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHandle {
    pub atch_file_id: String,
    pub file_detail_sn: String,
}

#[derive(Debug, Default, Clone)]
struct PartialParams {
    public_data_pk: Option<String>,
    public_data_detail_pk: Option<String>,
    file_detail_sn: Option<String>,
    atch_file_id: Option<String>,
}

impl PartialParams {
    fn set(&mut self, key: &str, value: Option<String>) {
        let Some(value) = value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()) else {
            return;
        };
        let slot = match key {
            KEY_PK => &mut self.public_data_pk,
            KEY_DETAIL_PK => &mut self.public_data_detail_pk,
            KEY_FILE_SN => &mut self.file_detail_sn,
            KEY_ATCH_FILE => &mut self.atch_file_id,
            _ => return,
        };
        if slot.is_none() {
            *slot = Some(value);
        }
    }

    fn is_empty(&self) -> bool {
        self.public_data_pk.is_none()
            && self.public_data_detail_pk.is_none()
            && self.file_detail_sn.is_none()
            && self.atch_file_id.is_none()
    }

    fn into_params(self) -> Option<DownloadParams> {
        Some(DownloadParams {
            public_data_pk: self.public_data_pk?,
            public_data_detail_pk: self.public_data_detail_pk?,
            file_detail_sn: self.file_detail_sn,
            atch_file_id: self.atch_file_id,
        })
    }
}

/// 0-100: required fields 25 each, file serial 15, attachment id 10, numeric dataset key 15,
/// `uddi:`-shaped detail key 10.
fn score_confidence(p: &PartialParams) -> u8 {
    let mut score = 0u8;
    if let Some(pk) = &p.public_data_pk {
        score += 25;
        if pk.bytes().all(|b| b.is_ascii_digit()) {
            score += 15;
        }
    }
    if let Some(detail) = &p.public_data_detail_pk {
        score += 25;
        if detail.starts_with("uddi:") && detail.len() > "uddi:".len() {
            score += 10;
        }
    }
    if p.file_detail_sn.is_some() {
        score += 15;
    }
    if p.atch_file_id.is_some() {
        score += 10;
    }
    score
}

/// Compiled patterns for the portal's download plumbing.
#[derive(Debug, Clone)]
pub struct PortalPatterns {
    download_call: Regex,
    assignments: Vec<(&'static str, Regex)>,
    handle_fallback: Regex,
}

impl PortalPatterns {
    pub fn new() -> Result<Self, regex::Error> {
        let download_call = Regex::new(
            r#"fn_fileDataDown\(\s*['"]([^'"]*)['"]\s*,\s*['"]([^'"]*)['"](?:\s*,\s*['"]?([^'",)\s]*)['"]?)?"#,
        )?;
        let assignments = [KEY_PK, KEY_DETAIL_PK, KEY_FILE_SN, KEY_ATCH_FILE]
            .into_iter()
            .map(|key| {
                Regex::new(&format!(
                    r#"\b{key}\b['"]?\s*[:=]\s*['"]?([A-Za-z0-9:._\-]+)"#
                ))
                .map(|re| (key, re))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let handle_fallback = Regex::new(
            r#"atchFileId['"]?\s*[:=]\s*['"]?([A-Za-z0-9_\-]+)(?s:.*?)fileDetailSn['"]?\s*[:=]\s*['"]?(\d+)"#,
        )?;
        Ok(Self {
            download_call,
            assignments,
            handle_fallback,
        })
    }

    /// Run every extraction source and keep the most confident complete result.
    pub fn extract_download_params(&self, html: &str) -> ParamExtraction {
        let document = Html::parse_document(html);
        let handler_text = script_and_handler_text(&document);

        let candidates = [
            (ExtractionSource::DownloadCall, self.from_download_call(&handler_text)),
            (ExtractionSource::ScriptAssignment, self.from_assignments(&handler_text)),
            (ExtractionSource::HiddenInput, from_hidden_inputs(&document)),
        ];

        let mut best: Option<(u8, ExtractionSource, DownloadParams)> = None;
        let mut partial_seen = Vec::new();
        for (source, partial) in candidates {
            if partial.is_empty() {
                continue;
            }
            let confidence = score_confidence(&partial);
            match partial.into_params() {
                Some(params) if best.as_ref().map_or(true, |(c, _, _)| confidence > *c) => {
                    best = Some((confidence, source, params));
                }
                Some(_) => {}
                None => partial_seen.push(format!("{source:?} (confidence {confidence})")),
            }
        }

        match best {
            Some((confidence, source, params)) => ParamExtraction::Found {
                params,
                confidence,
                source,
            },
            None if partial_seen.is_empty() => ParamExtraction::NotFound {
                reason: "no download parameters found in scripts, handlers or inputs".to_string(),
            },
            None => ParamExtraction::NotFound {
                reason: format!(
                    "required keys missing; partial matches from {}",
                    partial_seen.join(", ")
                ),
            },
        }
    }

    fn from_download_call(&self, text: &str) -> PartialParams {
        let mut partial = PartialParams::default();
        if let Some(caps) = self.download_call.captures(text) {
            partial.set(KEY_PK, caps.get(1).map(|m| m.as_str().to_string()));
            partial.set(KEY_DETAIL_PK, caps.get(2).map(|m| m.as_str().to_string()));
            partial.set(KEY_FILE_SN, caps.get(3).map(|m| m.as_str().to_string()));
        }
        partial
    }

    fn from_assignments(&self, text: &str) -> PartialParams {
        let mut partial = PartialParams::default();
        for (key, re) in &self.assignments {
            let value = re
                .captures(text)
                .and_then(|caps| caps.get(1))
                .map(|m| m.as_str().to_string());
            partial.set(key, value);
        }
        partial
    }

    /// Parse the first-step response. JSON is preferred; some portal versions answer with a
    /// script snippet, so a regex pass over the raw text follows.
    pub fn parse_file_handle(&self, body: &[u8], default_sn: Option<&str>) -> Option<FileHandle> {
        if let Ok(value) = serde_json::from_slice::<JsonValue>(body) {
            if let Some(atch_file_id) = find_json_string(&value, KEY_ATCH_FILE) {
                let file_detail_sn = find_json_string(&value, KEY_FILE_SN)
                    .or_else(|| default_sn.map(str::to_string))
                    .unwrap_or_else(|| "1".to_string());
                return Some(FileHandle {
                    atch_file_id,
                    file_detail_sn,
                });
            }
        }
        let text = String::from_utf8_lossy(body);
        self.handle_fallback.captures(&text).map(|caps| FileHandle {
            atch_file_id: caps[1].to_string(),
            file_detail_sn: caps[2].to_string(),
        })
    }
}

fn script_and_handler_text(document: &Html) -> String {
    let mut out = String::new();
    if let Ok(sel) = Selector::parse("script") {
        for node in document.select(&sel) {
            out.extend(node.text());
            out.push('\n');
        }
    }
    if let Ok(sel) = Selector::parse("[onclick], a[href^='javascript:']") {
        for node in document.select(&sel) {
            for attr in ["onclick", "href"] {
                if let Some(value) = node.value().attr(attr) {
                    out.push_str(value);
                    out.push('\n');
                }
            }
        }
    }
    out
}

fn from_hidden_inputs(document: &Html) -> PartialParams {
    let mut partial = PartialParams::default();
    for key in [KEY_PK, KEY_DETAIL_PK, KEY_FILE_SN, KEY_ATCH_FILE] {
        let Ok(sel) = Selector::parse(&format!("input[name='{key}'], input[id='{key}']")) else {
            continue;
        };
        let value = document
            .select(&sel)
            .find_map(|n| n.value().attr("value"))
            .map(str::to_string);
        partial.set(key, value);
    }
    partial
}

fn find_json_string(value: &JsonValue, key: &str) -> Option<String> {
    match value {
        JsonValue::Object(map) => {
            if let Some(found) = map.get(key) {
                match found {
                    JsonValue::String(s) if !s.trim().is_empty() => return Some(s.trim().to_string()),
                    JsonValue::Number(n) => return Some(n.to_string()),
                    _ => {}
                }
            }
            map.values().find_map(|v| find_json_string(v, key))
        }
        JsonValue::Array(items) => items.iter().find_map(|v| find_json_string(v, key)),
        _ => None,
    }
}

/// Anchors whose text or href looks like a file download, resolved against `base`.
pub fn scan_download_links(html: &str, base: &str, max: usize) -> Vec<String> {
    let document = Html::parse_document(html);
    let Ok(sel) = Selector::parse("a[href]") else {
        return Vec::new();
    };
    let base = Url::parse(base).ok();

    let mut out: Vec<String> = Vec::new();
    for node in document.select(&sel) {
        let Some(href) = node.value().attr("href").map(str::trim) else {
            continue;
        };
        let lowered_href = href.to_lowercase();
        if href.is_empty() || href.starts_with('#') || lowered_href.starts_with("javascript:") {
            continue;
        }
        let text = node.text().collect::<String>().to_lowercase();
        if !LINK_KEYWORDS
            .iter()
            .any(|k| text.contains(k) || lowered_href.contains(k))
        {
            continue;
        }
        let resolved = match &base {
            Some(base) => base.join(href).map(String::from).ok(),
            None => Url::parse(href).map(String::from).ok(),
        };
        if let Some(url) = resolved {
            if !out.contains(&url) {
                out.push(url);
            }
        }
        if out.len() >= max {
            break;
        }
    }
    out
}

pub fn file_meta_url(base: &str, params: &DownloadParams) -> Result<Url, url::ParseError> {
    let mut query = vec![
        (KEY_PK, params.public_data_pk.as_str()),
        (KEY_DETAIL_PK, params.public_data_detail_pk.as_str()),
    ];
    if let Some(sn) = &params.file_detail_sn {
        query.push((KEY_FILE_SN, sn.as_str()));
    }
    Url::parse_with_params(base, query)
}

pub fn file_download_url(base: &str, handle: &FileHandle) -> Result<Url, url::ParseError> {
    Url::parse_with_params(
        base,
        [
            (KEY_ATCH_FILE, handle.atch_file_id.as_str()),
            (KEY_FILE_SN, handle.file_detail_sn.as_str()),
        ],
    )
}
