use std::borrow::Cow;

use encoding_rs::{EUC_KR, SHIFT_JIS, WINDOWS_1252};
use serde::{Deserialize, Serialize};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Characters inspected when sniffing for markup.
const MARKUP_SNIFF_CHARS: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TextEncoding {
    Utf8Bom,
    Utf8,
    EucKr,
    ShiftJis,
    Latin1,
}

impl TextEncoding {
    /// Decode attempt order; the last entry never fails.
    pub const ORDER: [TextEncoding; 5] = [
        TextEncoding::Utf8Bom,
        TextEncoding::Utf8,
        TextEncoding::EucKr,
        TextEncoding::ShiftJis,
        TextEncoding::Latin1,
    ];

    pub fn label(self) -> &'static str {
        match self {
            TextEncoding::Utf8Bom => "utf-8-sig",
            TextEncoding::Utf8 => "utf-8",
            TextEncoding::EucKr => "euc-kr",
            TextEncoding::ShiftJis => "shift_jis",
            TextEncoding::Latin1 => "latin-1",
        }
    }

    fn decode(self, bytes: &[u8]) -> Option<String> {
        match self {
            TextEncoding::Utf8Bom => bytes
                .strip_prefix(UTF8_BOM)
                .and_then(|rest| std::str::from_utf8(rest).ok())
                .map(str::to_string),
            TextEncoding::Utf8 => std::str::from_utf8(bytes).ok().map(str::to_string),
            TextEncoding::EucKr => EUC_KR
                .decode_without_bom_handling_and_without_replacement(bytes)
                .map(Cow::into_owned),
            TextEncoding::ShiftJis => SHIFT_JIS
                .decode_without_bom_handling_and_without_replacement(bytes)
                .map(Cow::into_owned),
            TextEncoding::Latin1 => Some(WINDOWS_1252.decode_without_bom_handling(bytes).0.into_owned()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedText {
    pub text: String,
    pub encoding: TextEncoding,
}

/// Decode with the first encoding in [`TextEncoding::ORDER`] that accepts the bytes.
pub fn decode_payload(bytes: &[u8]) -> DecodedText {
    for encoding in TextEncoding::ORDER {
        if let Some(text) = encoding.decode(bytes) {
            return DecodedText { text, encoding };
        }
    }
    // Latin-1 is total, so this is only reached for an empty ORDER.
    DecodedText {
        text: String::from_utf8_lossy(bytes).into_owned(),
        encoding: TextEncoding::Latin1,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkupKind {
    Html,
    Xml,
    Json,
}

/// Detect error pages and API envelopes masquerading as data.
pub fn detect_markup(text: &str) -> Option<MarkupKind> {
    let head: String = text
        .trim_start_matches('\u{feff}')
        .trim_start()
        .chars()
        .take(MARKUP_SNIFF_CHARS)
        .collect::<String>()
        .to_lowercase();

    if head.starts_with('{') || head.starts_with('[') {
        return Some(MarkupKind::Json);
    }
    if head.starts_with("<?xml") {
        return Some(MarkupKind::Xml);
    }
    const HTML_MARKERS: [&str; 6] = ["<!doctype html", "<html", "<head", "<body", "<script", "<meta "];
    if HTML_MARKERS.iter().any(|m| head.contains(m)) {
        return Some(MarkupKind::Html);
    }
    if head.contains("<?xml") {
        return Some(MarkupKind::Xml);
    }
    None
}

/// Byte-level variant used on raw HTTP bodies. The body decides; the content type is only
/// consulted when the body is blank.
pub fn looks_like_markup(bytes: &[u8], content_type: Option<&str>) -> Option<MarkupKind> {
    let head_len = bytes.len().min(MARKUP_SNIFF_CHARS * 2);
    let head = String::from_utf8_lossy(&bytes[..head_len]);
    if !head.trim_start_matches('\u{feff}').trim().is_empty() {
        return detect_markup(&head);
    }
    let ct = content_type?.to_ascii_lowercase();
    if ct.starts_with("text/html") || ct.contains("xhtml") {
        Some(MarkupKind::Html)
    } else if ct.starts_with("application/json") {
        Some(MarkupKind::Json)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_bom_before_plain_utf8() {
        let mut bytes = UTF8_BOM.to_vec();
        bytes.extend_from_slice("시도명,시군구명".as_bytes());
        let decoded = decode_payload(&bytes);
        assert_eq!(decoded.encoding, TextEncoding::Utf8Bom);
        assert_eq!(decoded.text, "시도명,시군구명");
    }

    #[test]
    fn falls_back_to_euc_kr_for_legacy_exports() {
        let (encoded, _, had_errors) = EUC_KR.encode("법정동코드,시도명,시군구명");
        assert!(!had_errors);
        let decoded = decode_payload(&encoded);
        assert_eq!(decoded.encoding, TextEncoding::EucKr);
        assert_eq!(decoded.text, "법정동코드,시도명,시군구명");
    }

    #[test]
    fn markup_detection_is_case_insensitive() {
        assert_eq!(detect_markup("<!DOCTYPE HTML><p>err</p>"), Some(MarkupKind::Html));
        assert_eq!(detect_markup("  <HTML lang=ko>"), Some(MarkupKind::Html));
        assert_eq!(detect_markup("<?xml version=\"1.0\"?><r/>"), Some(MarkupKind::Xml));
        assert_eq!(detect_markup("{\"resultCode\":\"99\"}"), Some(MarkupKind::Json));
        assert_eq!(detect_markup("a,b,c\n1,2,3"), None);
    }

    #[test]
    fn mislabeled_csv_is_judged_by_its_body() {
        let csv = "법정동코드,시도명,시군구명\n1111000000,서울특별시,종로구\n".as_bytes();
        assert_eq!(looks_like_markup(csv, Some("text/html; charset=utf-8")), None);
        assert_eq!(looks_like_markup(csv, Some("application/json")), None);
        assert_eq!(
            looks_like_markup(b"<html><body>maintenance</body></html>", Some("text/csv")),
            Some(MarkupKind::Html)
        );
        assert_eq!(
            looks_like_markup(b"{\"resultCode\":\"99\"}", Some("application/octet-stream")),
            Some(MarkupKind::Json)
        );
    }

    #[test]
    fn blank_body_falls_back_to_the_content_type() {
        assert_eq!(looks_like_markup(b"  \n", Some("text/html")), Some(MarkupKind::Html));
        assert_eq!(looks_like_markup(b"", Some("text/csv")), None);
        assert_eq!(looks_like_markup(b"", None), None);
    }
}
