//! Scores arbitrary payloads as "looks like the district code CSV" or not.
//!
//! Score breakdown (0-100):
//!
//! | signal | points |
//! |---|---|
//! | delimiter consistency over the sampled lines | up to 30 |
//! | header columns: 2 / 3 or more | 10 / 15 |
//! | non-ASCII header text | 15 |
//! | expected header pattern found | 10 each, capped at 30 |
//! | at least `min_lines` non-empty lines | 10 |

use serde::{Deserialize, Serialize};

use crate::decode::{decode_payload, detect_markup, MarkupKind, TextEncoding};

pub const CANDIDATE_DELIMITERS: [char; 4] = [',', '\t', '|', ';'];

const DELIMITER_POINTS: f64 = 30.0;
const HEADER_POINTS_TWO: u32 = 10;
const HEADER_POINTS_THREE: u32 = 15;
const NON_ASCII_POINTS: u32 = 15;
const PATTERN_POINTS: u32 = 10;
const PATTERN_POINTS_CAP: u32 = 30;
const LINE_POINTS: u32 = 10;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorConfig {
    pub valid_threshold: u8,
    pub partial_threshold: u8,
    pub expected_patterns: Vec<String>,
    pub min_bytes: usize,
    pub sample_lines: usize,
    pub min_lines: usize,
    pub preview_chars: usize,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            valid_threshold: 60,
            partial_threshold: 40,
            expected_patterns: vec!["시도명".into(), "시군구명".into(), "읍면동명".into()],
            min_bytes: 10,
            sample_lines: 10,
            min_lines: 2,
            preview_chars: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Valid,
    PartiallyValid,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidationMetadata {
    pub encoding: Option<TextEncoding>,
    pub markup: Option<MarkupKind>,
    pub best_delimiter: Option<char>,
    pub header_count: usize,
    pub line_count: usize,
    pub found_patterns: Vec<String>,
    pub missing_patterns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub verdict: Verdict,
    pub score: u8,
    pub issues: Vec<String>,
    pub metadata: ValidationMetadata,
    pub content_preview: String,
}

impl ValidationReport {
    fn rejected(issue: impl Into<String>, metadata: ValidationMetadata, preview: String) -> Self {
        Self {
            is_valid: false,
            verdict: Verdict::Invalid,
            score: 0,
            issues: vec![issue.into()],
            metadata,
            content_preview: preview,
        }
    }
}

/// Pure scoring over bytes; holds only its thresholds.
#[derive(Debug, Clone, Default)]
pub struct ContentValidator {
    config: ValidatorConfig,
}

impl ContentValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    pub fn validate(&self, bytes: &[u8]) -> ValidationReport {
        self.validate_with(bytes, &self.config.expected_patterns)
    }

    pub fn validate_with(&self, bytes: &[u8], expected: &[String]) -> ValidationReport {
        if bytes.len() < self.config.min_bytes {
            return ValidationReport::rejected(
                format!(
                    "payload too small: {} bytes (minimum {})",
                    bytes.len(),
                    self.config.min_bytes
                ),
                ValidationMetadata {
                    missing_patterns: expected.to_vec(),
                    ..ValidationMetadata::default()
                },
                String::new(),
            );
        }

        let decoded = decode_payload(bytes);
        let text = decoded.text.trim_start_matches('\u{feff}');
        let preview: String = text.chars().take(self.config.preview_chars).collect();

        let mut metadata = ValidationMetadata {
            encoding: Some(decoded.encoding),
            ..ValidationMetadata::default()
        };

        if let Some(kind) = detect_markup(text) {
            metadata.markup = Some(kind);
            metadata.missing_patterns = expected.to_vec();
            return ValidationReport::rejected(
                format!("payload is {kind:?} markup, not delimited text"),
                metadata,
                preview,
            );
        }

        let lines: Vec<&str> = text
            .lines()
            .map(|l| l.trim_end_matches('\r'))
            .filter(|l| !l.trim().is_empty())
            .collect();
        metadata.line_count = lines.len();
        let sample: Vec<&str> = lines
            .iter()
            .take(self.config.sample_lines.max(1))
            .copied()
            .collect();

        let mut score = 0u32;
        let mut issues = Vec::new();

        let (best_delimiter, consistency) = best_delimiter(&sample);
        metadata.best_delimiter = best_delimiter;
        score += (DELIMITER_POINTS * consistency).round() as u32;
        if best_delimiter.is_none() {
            issues.push("no candidate delimiter appears consistently".to_string());
        } else if consistency < 0.8 {
            issues.push(format!(
                "delimiter counts vary between lines (consistency {:.2})",
                consistency
            ));
        }

        let header = sample.first().copied().unwrap_or_default();
        metadata.header_count = match best_delimiter {
            Some(d) => count_outside_quotes(header, d) + 1,
            None if header.is_empty() => 0,
            None => 1,
        };
        match metadata.header_count {
            n if n >= 3 => score += HEADER_POINTS_THREE,
            2 => {
                score += HEADER_POINTS_TWO;
                issues.push("header has only 2 columns".to_string());
            }
            n => issues.push(format!("header has {n} column(s)")),
        }

        if header.chars().any(|c| !c.is_ascii()) {
            score += NON_ASCII_POINTS;
        }

        for pattern in expected {
            if text.contains(pattern.as_str()) {
                metadata.found_patterns.push(pattern.clone());
            } else {
                metadata.missing_patterns.push(pattern.clone());
            }
        }
        score += (metadata.found_patterns.len() as u32 * PATTERN_POINTS).min(PATTERN_POINTS_CAP);
        if !metadata.missing_patterns.is_empty() {
            issues.push(format!(
                "missing expected patterns: {}",
                metadata.missing_patterns.join(", ")
            ));
        }

        if lines.len() >= self.config.min_lines {
            score += LINE_POINTS;
        } else {
            issues.push(format!(
                "only {} non-empty line(s), expected at least {}",
                lines.len(),
                self.config.min_lines
            ));
        }

        let score = score.min(100) as u8;
        let verdict = if score >= self.config.valid_threshold {
            Verdict::Valid
        } else if score >= self.config.partial_threshold {
            Verdict::PartiallyValid
        } else {
            Verdict::Invalid
        };

        ValidationReport {
            is_valid: verdict == Verdict::Valid,
            verdict,
            score,
            issues,
            metadata,
            content_preview: preview,
        }
    }
}

/// Count `delimiter` occurrences outside double-quoted sections.
pub(crate) fn count_outside_quotes(line: &str, delimiter: char) -> usize {
    let mut in_quotes = false;
    let mut count = 0;
    for ch in line.chars() {
        if ch == '"' {
            in_quotes = !in_quotes;
        } else if ch == delimiter && !in_quotes {
            count += 1;
        }
    }
    count
}

/// 1 - coefficient of variation of per-line delimiter counts, 0 when the delimiter is absent.
fn delimiter_consistency(lines: &[&str], delimiter: char) -> f64 {
    if lines.is_empty() {
        return 0.0;
    }
    let counts: Vec<f64> = lines
        .iter()
        .map(|l| count_outside_quotes(l, delimiter) as f64)
        .collect();
    let n = counts.len() as f64;
    let mean = counts.iter().sum::<f64>() / n;
    if mean < 1.0 {
        return 0.0;
    }
    let variance = counts.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / n;
    (1.0 - variance.sqrt() / mean).clamp(0.0, 1.0)
}

fn best_delimiter(lines: &[&str]) -> (Option<char>, f64) {
    let mut best: (Option<char>, f64) = (None, 0.0);
    for delimiter in CANDIDATE_DELIMITERS {
        let consistency = delimiter_consistency(lines, delimiter);
        if consistency > best.1 {
            best = (Some(delimiter), consistency);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "법정동코드,시도명,시군구명,읍면동명,리명,순위,생성일자,삭제일자,과거법정동코드\n\
1100000000,서울특별시,,,,11,1988-04-23,,\n\
1111000000,서울특별시,종로구,,,11110,1988-04-23,,\n\
1111010100,서울특별시,종로구,청운동,,,1988-04-23,,\n";

    fn validator() -> ContentValidator {
        ContentValidator::new(ValidatorConfig::default())
    }

    #[test]
    fn real_export_scores_as_valid() {
        let report = validator().validate(SAMPLE.as_bytes());
        assert!(report.is_valid, "{report:?}");
        assert_eq!(report.verdict, Verdict::Valid);
        assert_eq!(report.score, 100);
        assert_eq!(report.metadata.best_delimiter, Some(','));
        assert_eq!(report.metadata.header_count, 9);
        assert_eq!(report.metadata.found_patterns.len(), 3);
        assert!(report.metadata.missing_patterns.is_empty());
    }

    #[test]
    fn html_error_page_scores_zero_even_with_keywords() {
        for page in [
            "<html><body>시도명,시군구명,읍면동명</body></html>",
            "<!DOCTYPE html>\n<p>a,b,c</p>\n1,2,3",
            "<HTML>error</HTML> padding padding",
        ] {
            let report = validator().validate(page.as_bytes());
            assert!(!report.is_valid);
            assert_eq!(report.score, 0);
            assert_eq!(report.metadata.markup, Some(MarkupKind::Html));
        }
    }

    #[test]
    fn tiny_payload_is_rejected() {
        let report = validator().validate(b"a,b");
        assert!(!report.is_valid);
        assert_eq!(report.score, 0);
        assert!(report.issues[0].contains("too small"));
    }

    #[test]
    fn two_column_csv_with_expected_keywords_is_valid() {
        let expected = vec!["region".to_string(), "code".to_string()];
        let report = validator().validate_with(b"region,code\nnorth,11\nsouth,22\n", &expected);
        assert!(report.is_valid, "{report:?}");
        assert!(report.score >= 60);
        assert_eq!(report.metadata.header_count, 2);
    }

    #[test]
    fn ascii_table_without_keywords_is_only_partially_valid() {
        let report = validator().validate(b"col1\tcol2\tcol3\n1\t2\t3\n4\t5\t6");
        assert_eq!(report.verdict, Verdict::PartiallyValid);
        assert_eq!(report.metadata.best_delimiter, Some('\t'));
        assert!(!report.issues.is_empty());
        assert_eq!(report.metadata.missing_patterns.len(), 3);
    }

    #[test]
    fn prose_is_invalid() {
        let report = validator().validate(b"this is not a table at all\njust some words\n");
        assert_eq!(report.verdict, Verdict::Invalid);
        assert!(report.metadata.best_delimiter.is_none());
    }

    #[test]
    fn quoted_delimiters_do_not_count() {
        assert_eq!(count_outside_quotes("\"a,b\",c", ','), 1);
    }

    #[test]
    fn thresholds_are_configurable() {
        let strict = ContentValidator::new(ValidatorConfig {
            valid_threshold: 101,
            ..ValidatorConfig::default()
        });
        let report = strict.validate(SAMPLE.as_bytes());
        assert_eq!(report.verdict, Verdict::PartiallyValid);
    }
}
