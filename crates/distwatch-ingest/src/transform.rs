use std::collections::HashMap;
use std::mem::take;

use chrono::Utc;
use distwatch_core::{DistrictDataset, DistrictRecord, DongHierarchy};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::decode::{decode_payload, TextEncoding};
use crate::validator::{count_outside_quotes, CANDIDATE_DELIMITERS};

/// Values the upstream export uses for "no value".
const NULL_TOKENS: [&str; 5] = ["", "nan", "null", "none", "-"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalField {
    AdministrativeCode,
    Province,
    Municipality,
    Neighborhood,
    Village,
    Rank,
    CreatedDate,
    RetiredDate,
    PreviousCode,
}

/// Column order of the national legal-district code export. Mapping is positional.
pub const CANONICAL_SCHEMA: [CanonicalField; 9] = [
    CanonicalField::AdministrativeCode,
    CanonicalField::Province,
    CanonicalField::Municipality,
    CanonicalField::Neighborhood,
    CanonicalField::Village,
    CanonicalField::Rank,
    CanonicalField::CreatedDate,
    CanonicalField::RetiredDate,
    CanonicalField::PreviousCode,
];

impl CanonicalField {
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn caption(self) -> &'static str {
        match self {
            CanonicalField::AdministrativeCode => "법정동코드",
            CanonicalField::Province => "시도명",
            CanonicalField::Municipality => "시군구명",
            CanonicalField::Neighborhood => "읍면동명",
            CanonicalField::Village => "리명",
            CanonicalField::Rank => "순위",
            CanonicalField::CreatedDate => "생성일자",
            CanonicalField::RetiredDate => "삭제일자",
            CanonicalField::PreviousCode => "과거법정동코드",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseOption {
    pub delimiter: char,
    pub quote: char,
}

impl ParseOption {
    pub const CASCADE: [ParseOption; 5] = [
        ParseOption { delimiter: ',', quote: '"' },
        ParseOption { delimiter: '\t', quote: '"' },
        ParseOption { delimiter: ';', quote: '"' },
        ParseOption { delimiter: '|', quote: '"' },
        ParseOption { delimiter: ',', quote: '\'' },
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ParseMethod {
    Structured { delimiter: char, quote: char },
    Manual { delimiter: char },
}

impl From<ParseOption> for ParseMethod {
    fn from(option: ParseOption) -> Self {
        ParseMethod::Structured {
            delimiter: option.delimiter,
            quote: option.quote,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseAttempt {
    pub method: ParseMethod,
    pub columns: usize,
    pub data_rows: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ParseDiagnostics {
    pub sample: String,
    pub attempts: Vec<ParseAttempt>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTable {
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub method: ParseMethod,
    pub diagnostics: ParseDiagnostics,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SchemaDiagnostics {
    pub available_columns: Vec<String>,
    pub expected_columns: Vec<String>,
    pub mapped_fields: Vec<CanonicalField>,
    pub missing_fields: Vec<CanonicalField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformDiagnostics {
    pub encoding: TextEncoding,
    pub method: ParseMethod,
    pub parse: ParseDiagnostics,
    pub schema: SchemaDiagnostics,
    pub blank_municipality_count: usize,
    pub hierarchy_skipped_rows: usize,
}

#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransformError {
    #[error("no parse option produced a table ({} attempts)", .diagnostics.attempts.len())]
    ParseExhausted {
        encoding: TextEncoding,
        diagnostics: ParseDiagnostics,
    },
    #[error("column {missing:?} absent after positional mapping ({} columns available)", .diagnostics.available_columns.len())]
    SchemaMismatch {
        missing: CanonicalField,
        diagnostics: SchemaDiagnostics,
    },
    #[error("payload decoded to empty text ({encoding:?})")]
    Undecodable { encoding: TextEncoding },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformerConfig {
    /// Lines handed to each structured option before committing to a full parse.
    pub sample_lines: usize,
    pub min_columns: usize,
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            sample_lines: 20,
            min_columns: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransformOutput {
    pub dataset: DistrictDataset,
    pub diagnostics: TransformDiagnostics,
}

#[derive(Debug, Clone, Default)]
pub struct CsvTransformer {
    config: TransformerConfig,
}

impl CsvTransformer {
    pub fn new(config: TransformerConfig) -> Self {
        Self { config }
    }

    pub fn transform(&self, bytes: &[u8]) -> Result<TransformOutput, TransformError> {
        let decoded = decode_payload(bytes);
        let encoding = decoded.encoding;
        let text = decoded.text.trim_start_matches('\u{feff}');
        if text.trim().is_empty() {
            return Err(TransformError::Undecodable { encoding });
        }

        let table = parse_cascade(text, &self.config)
            .map_err(|diagnostics| TransformError::ParseExhausted { encoding, diagnostics })?;

        let schema = map_schema(&table.header);
        if !schema.mapped_fields.contains(&CanonicalField::Municipality) {
            return Err(TransformError::SchemaMismatch {
                missing: CanonicalField::Municipality,
                diagnostics: schema,
            });
        }

        let original_count = table.rows.len();
        let mut retired_count = 0;
        let mut blank_municipality_count = 0;
        let mut cleaned = Vec::with_capacity(original_count);
        for row in &table.rows {
            if field(row, CanonicalField::RetiredDate).is_some() {
                retired_count += 1;
                continue;
            }
            let Some(municipality) = field(row, CanonicalField::Municipality) else {
                blank_municipality_count += 1;
                continue;
            };
            cleaned.push(CleanRow {
                code: field(row, CanonicalField::AdministrativeCode),
                province: field(row, CanonicalField::Province),
                municipality,
                neighborhood: field(row, CanonicalField::Neighborhood),
            });
        }

        let mut hierarchy = DongHierarchy::new();
        let mut hierarchy_skipped_rows = 0;
        for row in &cleaned {
            match (&row.province, &row.neighborhood, &row.code) {
                (Some(province), Some(neighborhood), Some(code)) => {
                    hierarchy.insert(province, &row.municipality, neighborhood, code);
                }
                _ => hierarchy_skipped_rows += 1,
            }
        }
        hierarchy.finalize();

        let cleaned_count = cleaned.len();
        let records = deduplicate(cleaned.into_iter().map(CleanRow::into_record));
        let unique_count = records.len();

        info!(
            original_count,
            retired_count,
            cleaned_count,
            unique_count,
            neighborhoods = hierarchy.neighborhood_count(),
            "transformed district export"
        );

        Ok(TransformOutput {
            dataset: DistrictDataset {
                processed_at: Utc::now(),
                original_count,
                retired_count,
                cleaned_count,
                unique_count,
                removed_duplicates: cleaned_count - unique_count,
                records,
                hierarchy,
            },
            diagnostics: TransformDiagnostics {
                encoding,
                method: table.method,
                parse: table.diagnostics,
                schema,
                blank_municipality_count,
                hierarchy_skipped_rows,
            },
        })
    }
}

struct CleanRow {
    code: Option<String>,
    province: Option<String>,
    municipality: String,
    neighborhood: Option<String>,
}

impl CleanRow {
    fn into_record(self) -> DistrictRecord {
        DistrictRecord {
            province: self.province,
            municipality: self.municipality,
            neighborhood: self.neighborhood,
            administrative_code: self.code,
            duplicate_count: 1,
        }
    }
}

/// Collapse records sharing (province, municipality). The first record of each group wins and
/// carries the summed `duplicate_count`, so re-running on the output changes nothing.
pub fn deduplicate<I>(records: I) -> Vec<DistrictRecord>
where
    I: IntoIterator<Item = DistrictRecord>,
{
    let mut index: HashMap<(Option<String>, String), usize> = HashMap::new();
    let mut out: Vec<DistrictRecord> = Vec::new();
    for record in records {
        let key = (record.province.clone(), record.municipality.clone());
        match index.get(&key) {
            Some(&slot) => out[slot].duplicate_count += record.duplicate_count,
            None => {
                index.insert(key, out.len());
                out.push(record);
            }
        }
    }
    out
}

/// Structured options first, then the manual scanner.
pub fn parse_cascade(text: &str, config: &TransformerConfig) -> Result<ParsedTable, ParseDiagnostics> {
    let sample: String = text
        .lines()
        .take(config.sample_lines.max(1))
        .collect::<Vec<_>>()
        .join("\n");
    let mut diagnostics = ParseDiagnostics {
        sample: sample.chars().take(500).collect(),
        attempts: Vec::new(),
    };

    for option in ParseOption::CASCADE {
        match try_structured(text, &sample, option, config.min_columns) {
            Ok(mut rows) => {
                let header = rows.remove(0);
                diagnostics.attempts.push(ParseAttempt {
                    method: option.into(),
                    columns: header.len(),
                    data_rows: rows.len(),
                    error: None,
                });
                debug!(delimiter = ?option.delimiter, rows = rows.len(), "structured parse accepted");
                return Ok(ParsedTable {
                    header,
                    rows,
                    method: option.into(),
                    diagnostics,
                });
            }
            Err((columns, error)) => diagnostics.attempts.push(ParseAttempt {
                method: option.into(),
                columns,
                data_rows: 0,
                error: Some(error),
            }),
        }
    }

    let delimiter = manual_delimiter(text);
    warn!(?delimiter, "structured options exhausted, using manual scanner");
    let mut rows = scan_rows(text, delimiter);
    let method = ParseMethod::Manual { delimiter };
    if rows.len() < 2 {
        diagnostics.attempts.push(ParseAttempt {
            method,
            columns: rows.first().map_or(0, Vec::len),
            data_rows: 0,
            error: Some("manual scanner found no data rows".to_string()),
        });
        return Err(diagnostics);
    }

    let header = rows.remove(0);
    let width = header.len();
    for row in &mut rows {
        row.resize(width, String::new());
    }
    diagnostics.attempts.push(ParseAttempt {
        method,
        columns: width,
        data_rows: rows.len(),
        error: None,
    });
    Ok(ParsedTable {
        header,
        rows,
        method,
        diagnostics,
    })
}

/// Ok holds header plus at least one data row. Err carries the sampled column count.
fn try_structured(
    text: &str,
    sample: &str,
    option: ParseOption,
    min_columns: usize,
) -> Result<Vec<Vec<String>>, (usize, String)> {
    let sampled = read_records(sample, option).map_err(|err| (0, err.to_string()))?;
    let columns = sampled.first().map_or(0, Vec::len);
    if columns < min_columns {
        return Err((columns, format!("sample produced {columns} column(s), need {min_columns}")));
    }
    let rows = read_records(text, option).map_err(|err| (columns, err.to_string()))?;
    if rows.len() < 2 {
        return Err((columns, "no data rows after header".to_string()));
    }
    Ok(rows)
}

fn read_records(text: &str, option: ParseOption) -> Result<Vec<Vec<String>>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(false)
        .delimiter(option.delimiter as u8)
        .quote(option.quote as u8)
        .from_reader(text.as_bytes());
    reader
        .records()
        .map(|record| record.map(|r| r.iter().map(str::to_string).collect()))
        .collect()
}

/// The candidate delimiter occurring most often in the header line.
fn manual_delimiter(text: &str) -> char {
    let header = text.lines().find(|l| !l.trim().is_empty()).unwrap_or_default();
    let mut best = (CANDIDATE_DELIMITERS[0], 0);
    for delimiter in CANDIDATE_DELIMITERS {
        let count = count_outside_quotes(header, delimiter);
        if count > best.1 {
            best = (delimiter, count);
        }
    }
    best.0
}

/// Quote-aware character scanner; tolerates CRLF, doubled quotes and unterminated quotes.
fn scan_rows(text: &str, sep: char) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut field = String::new();
    let mut row = Vec::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    chars.next();
                    field.push('"');
                } else {
                    in_quotes = false;
                }
            }
            '"' if field.is_empty() => in_quotes = true,
            c if c == sep && !in_quotes => row.push(take(&mut field)),
            '\n' | '\r' if !in_quotes => {
                if ch == '\r' && chars.peek() == Some(&'\n') {
                    chars.next();
                }
                row.push(take(&mut field));
                if row.len() == 1 && row[0].trim().is_empty() {
                    row.clear();
                } else {
                    rows.push(take(&mut row));
                }
            }
            _ => field.push(ch),
        }
    }

    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    rows
}

fn map_schema(header: &[String]) -> SchemaDiagnostics {
    let mapped = header.len().min(CANONICAL_SCHEMA.len());
    SchemaDiagnostics {
        available_columns: header.to_vec(),
        expected_columns: CANONICAL_SCHEMA
            .iter()
            .map(|f| f.caption().to_string())
            .collect(),
        mapped_fields: CANONICAL_SCHEMA[..mapped].to_vec(),
        missing_fields: CANONICAL_SCHEMA[mapped..].to_vec(),
    }
}

fn field(row: &[String], column: CanonicalField) -> Option<String> {
    row.get(column.index()).and_then(|raw| normalize_value(raw))
}

/// Trim, map null tokens to None, and undo float rendering of integer codes ("1111010100.0").
fn normalize_value(raw: &str) -> Option<String> {
    let value = raw.trim();
    if NULL_TOKENS.iter().any(|t| value.eq_ignore_ascii_case(t)) {
        return None;
    }
    if let Some(integer) = value.strip_suffix(".0") {
        if !integer.is_empty() && integer.bytes().all(|b| b.is_ascii_digit()) {
            return Some(integer.to_string());
        }
    }
    Some(value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXPORT: &str = "법정동코드,시도명,시군구명,읍면동명,리명,순위,생성일자,삭제일자,과거법정동코드\n\
1100000000,서울특별시,,,,11,1988-04-23,,\n\
1111000000,서울특별시,종로구,,,11110,1988-04-23,,\n\
1111010300,서울특별시,종로구,신교동,,,1988-04-23,,\n\
1111010100,서울특별시,종로구,청운동,,,1988-04-23,,\n\
1111010200,서울특별시,종로구,신교동,,,1988-04-23,,\n\
1111099900,서울특별시,종로구,폐지동,,,1988-04-23,2008-11-01,\n\
1114000000.0,서울특별시,중구,,,11140,1988-04-23,,\n\
1114010100,서울특별시,중구,무교동,,,1988-04-23,,\n";

    fn transform(text: &str) -> Result<TransformOutput, TransformError> {
        CsvTransformer::default().transform(text.as_bytes())
    }

    #[test]
    fn tab_delimited_input_selects_tab_option() {
        let table = parse_cascade("col1\tcol2\tcol3\n1\t2\t3\n4\t5\t6", &TransformerConfig::default())
            .expect("tab table parses");
        assert_eq!(table.method, ParseMethod::Structured { delimiter: '\t', quote: '"' });
        assert_eq!(table.header, vec!["col1", "col2", "col3"]);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.diagnostics.attempts.len(), 2);
        assert!(table.diagnostics.attempts[0].error.is_some());
    }

    #[test]
    fn ragged_rows_fall_back_to_manual_scanner() {
        let table = parse_cascade("a,b,c\n1,2\n3,\"4,x\",5,6\n", &TransformerConfig::default())
            .expect("manual scanner recovers");
        assert_eq!(table.method, ParseMethod::Manual { delimiter: ',' });
        assert_eq!(table.rows, vec![vec!["1", "2", ""], vec!["3", "4,x", "5"]]);
        assert_eq!(table.diagnostics.attempts.len(), ParseOption::CASCADE.len() + 1);
    }

    #[test]
    fn header_only_input_exhausts_the_cascade() {
        let err = transform("a,b,c\n").expect_err("no data rows");
        match err {
            TransformError::ParseExhausted { diagnostics, .. } => {
                assert_eq!(diagnostics.attempts.len(), ParseOption::CASCADE.len() + 1);
                assert_eq!(diagnostics.sample, "a,b,c");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn two_column_export_is_a_schema_mismatch() {
        let err = transform("code,province\n11,seoul\n26,busan\n").expect_err("municipality absent");
        match err {
            TransformError::SchemaMismatch { missing, diagnostics } => {
                assert_eq!(missing, CanonicalField::Municipality);
                assert_eq!(diagnostics.available_columns, vec!["code", "province"]);
                assert!(diagnostics.missing_fields.contains(&CanonicalField::Municipality));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn counts_follow_each_cleaning_stage() {
        let out = transform(EXPORT).expect("export transforms");
        let ds = &out.dataset;
        assert_eq!(ds.original_count, 8);
        assert_eq!(ds.retired_count, 1);
        assert_eq!(out.diagnostics.blank_municipality_count, 1);
        assert_eq!(ds.cleaned_count, 6);
        assert_eq!(ds.unique_count, 2);
        assert_eq!(ds.removed_duplicates, 4);

        let jongno = &ds.records[0];
        assert_eq!(jongno.municipality, "종로구");
        assert_eq!(jongno.duplicate_count, 4);
        assert_eq!(jongno.administrative_code.as_deref(), Some("1111000000"));
        assert_eq!(ds.records[1].administrative_code.as_deref(), Some("1114000000"));
    }

    #[test]
    fn retired_rows_never_reach_the_hierarchy() {
        let out = transform(EXPORT).expect("export transforms");
        let jongno = out
            .dataset
            .hierarchy
            .neighborhoods("서울특별시", "종로구")
            .expect("jongno present");
        assert!(jongno.iter().all(|e| e.neighborhood != "폐지동"));
    }

    #[test]
    fn neighborhood_lists_are_sorted_and_unique() {
        let out = transform(EXPORT).expect("export transforms");
        let jongno = out
            .dataset
            .hierarchy
            .neighborhoods("서울특별시", "종로구")
            .expect("jongno present");
        let names: Vec<&str> = jongno.iter().map(|e| e.neighborhood.as_str()).collect();
        assert_eq!(names, vec!["신교동", "청운동"]);
        // first occurrence of a repeated neighborhood wins
        assert_eq!(jongno[0].code, "1111010300");
    }

    #[test]
    fn dedup_is_idempotent() {
        let out = transform(EXPORT).expect("export transforms");
        let once = out.dataset.records.clone();
        let twice = deduplicate(once.clone());
        assert_eq!(once, twice);
    }

    #[test]
    fn null_tokens_and_float_codes_normalize() {
        assert_eq!(normalize_value("  nan "), None);
        assert_eq!(normalize_value("NULL"), None);
        assert_eq!(normalize_value("4113500000.0"), Some("4113500000".to_string()));
        assert_eq!(normalize_value("1.0.0"), Some("1.0.0".to_string()));
    }

    #[test]
    fn transform_error_serializes_with_kind_tag() {
        let err = transform("a,b,c\n").expect_err("no data rows");
        let json = serde_json::to_value(&err).expect("serializable");
        assert_eq!(json["kind"], "parse_exhausted");
    }
}
