//! Payload validation and CSV-to-dataset transformation for district code exports.

mod decode;
mod transform;
mod validator;

pub use decode::{decode_payload, detect_markup, looks_like_markup, DecodedText, MarkupKind, TextEncoding};
pub use transform::{
    deduplicate, parse_cascade, CanonicalField, CsvTransformer, ParseAttempt, ParseDiagnostics,
    ParseMethod, ParseOption, ParsedTable, SchemaDiagnostics, TransformDiagnostics,
    TransformError, TransformOutput, TransformerConfig, CANONICAL_SCHEMA,
};
pub use validator::{
    ContentValidator, ValidationMetadata, ValidationReport, ValidatorConfig, Verdict,
    CANDIDATE_DELIMITERS,
};

pub const CRATE_NAME: &str = "distwatch-ingest";
