//! Validation of externally produced review results.
//!
//! The producer contract is strict: unknown top-level keys reject the
//! whole payload, per-finding violations drop the finding, and every
//! decision is recorded as a structured diagnostic keyed by the caller's
//! correlation id. Coercions (whitespace trims, path normalization,
//! numeric strings) are applied rather than rejected, each with its own
//! diagnostic.

use std::collections::HashSet;

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::review::reconcile::{normalize_repo_path, reconcile_changed_file};

/// Newest schema line this consumer understands.
pub const SUPPORTED_SCHEMA_VERSION: &str = "1.0";
/// Prompt line this consumer understands; patch drift is tolerated.
pub const SUPPORTED_PROMPT_VERSION: &str = "1.0.0";

const TOP_LEVEL_REQUIRED_FIELDS: [&str; 3] = ["schema_version", "prompt_version", "findings"];
const TOP_LEVEL_ALLOWED_FIELDS: [&str; 5] = [
    "schema_version",
    "prompt_version",
    "findings",
    "summary",
    "meta",
];

const REQUIRED_FINDING_FIELDS: [&str; 7] =
    ["id", "severity", "category", "title", "file", "line", "message"];
const TRIMMED_STRING_FIELDS: [&str; 6] = ["id", "severity", "category", "title", "file", "message"];
const NUMERIC_FIELDS: [&str; 2] = ["line", "end_line"];

const ALLOWED_SEVERITIES: [&str; 5] = ["critical", "high", "medium", "low", "info"];
const ALLOWED_CATEGORIES: [&str; 7] = [
    "correctness",
    "security",
    "performance",
    "reliability",
    "maintainability",
    "style",
    "test",
];
const ALLOWED_CONFIDENCE: [&str; 3] = ["high", "medium", "low"];

lazy_static! {
    static ref SCHEMA_VERSION_RE: Regex = Regex::new(r"^(\d+)\.(\d+)$").unwrap();
    static ref PROMPT_VERSION_RE: Regex = Regex::new(r"^(\d+)\.(\d+)(?:\.(\d+))?$").unwrap();
}

/// One structured validation decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    pub correlation_id: String,
    pub code: &'static str,
    pub field: String,
    pub reason: &'static str,
    pub action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Collects diagnostics across one validation pass.
#[derive(Debug, Default)]
pub struct DiagnosticRecorder {
    entries: Vec<Diagnostic>,
}

impl DiagnosticRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(
        &mut self,
        correlation_id: &str,
        code: &'static str,
        field: impl Into<String>,
        reason: &'static str,
        action: &'static str,
        details: Option<Value>,
    ) {
        let entry = Diagnostic {
            correlation_id: correlation_id.to_string(),
            code,
            field: field.into(),
            reason,
            action,
            details,
        };
        debug!(
            correlation_id = %entry.correlation_id,
            code = entry.code,
            field = %entry.field,
            action = entry.action,
            "review result diagnostic"
        );
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }
}

/// What survived validation. `rejected` payloads keep an empty findings
/// list; accepted payloads keep the original top-level shape with only
/// the surviving, coerced findings.
#[derive(Debug)]
pub struct ValidationOutcome {
    pub review_result: Value,
    pub diagnostics: Vec<Diagnostic>,
    pub rejected: bool,
}

fn parse_schema_version(text: &str) -> Option<(u64, u64)> {
    let caps = SCHEMA_VERSION_RE.captures(text)?;
    Some((caps[1].parse().ok()?, caps[2].parse().ok()?))
}

fn parse_prompt_version(text: &str) -> Option<(u64, u64, u64)> {
    let caps = PROMPT_VERSION_RE.captures(text)?;
    let patch = match caps.get(3) {
        Some(patch) => patch.as_str().parse().ok()?,
        None => 0,
    };
    Some((caps[1].parse().ok()?, caps[2].parse().ok()?, patch))
}

fn rejected_outcome(recorder: &DiagnosticRecorder) -> ValidationOutcome {
    ValidationOutcome {
        review_result: json!({ "findings": [] }),
        diagnostics: recorder.entries().to_vec(),
        rejected: true,
    }
}

/// Validate one raw review-result payload against the producer contract
/// and reconcile its findings against the caller's change set.
///
/// Top-level contract violations reject the whole payload; per-finding
/// violations drop the finding and continue.
pub fn validate_and_reconcile_review_result(
    raw_payload: &str,
    changed_files: &[String],
    correlation_id: &str,
    recorder: &mut DiagnosticRecorder,
) -> ValidationOutcome {
    let parsed: Value = match serde_json::from_str(raw_payload) {
        Ok(parsed) => parsed,
        Err(err) => {
            recorder.emit(
                correlation_id,
                "invalid_json",
                "payload",
                "json_parse_error",
                "reject",
                Some(json!({ "error": err.to_string() })),
            );
            return rejected_outcome(recorder);
        }
    };

    let Some(object) = parsed.as_object() else {
        recorder.emit(
            correlation_id,
            "schema_mismatch",
            "payload",
            "top_level_not_object",
            "reject",
            None,
        );
        return rejected_outcome(recorder);
    };

    let mut missing: Vec<&str> = TOP_LEVEL_REQUIRED_FIELDS
        .iter()
        .copied()
        .filter(|field| !object.contains_key(*field))
        .collect();
    missing.sort_unstable();
    if !missing.is_empty() {
        recorder.emit(
            correlation_id,
            "missing_required_field",
            "payload",
            "missing_required_top_level_field",
            "reject",
            Some(json!({ "missing": missing })),
        );
        return rejected_outcome(recorder);
    }

    let mut unexpected: Vec<&str> = object
        .keys()
        .map(String::as_str)
        .filter(|key| !TOP_LEVEL_ALLOWED_FIELDS.contains(key))
        .collect();
    unexpected.sort_unstable();
    if !unexpected.is_empty() {
        recorder.emit(
            correlation_id,
            "schema_mismatch",
            "payload",
            "additional_properties_not_allowed",
            "reject",
            Some(json!({ "additional_properties": unexpected })),
        );
        return rejected_outcome(recorder);
    }

    let schema_version = &object["schema_version"];
    let parsed_schema = schema_version.as_str().and_then(parse_schema_version);
    let Some(parsed_schema) = parsed_schema else {
        recorder.emit(
            correlation_id,
            "schema_mismatch",
            "schema_version",
            "invalid_schema_version_format",
            "reject",
            Some(json!({ "value": schema_version, "expected_pattern": "major.minor" })),
        );
        return rejected_outcome(recorder);
    };

    // Accept an equal or newer minor in the same major line.
    let supported_schema = parse_schema_version(SUPPORTED_SCHEMA_VERSION)
        .unwrap_or((1, 0));
    if parsed_schema.0 != supported_schema.0 || parsed_schema.1 < supported_schema.1 {
        recorder.emit(
            correlation_id,
            "incompatible_version",
            "schema_version",
            "unsupported_schema_version",
            "reject",
            Some(json!({ "received": schema_version, "supported": SUPPORTED_SCHEMA_VERSION })),
        );
        return rejected_outcome(recorder);
    }

    let prompt_version = &object["prompt_version"];
    let parsed_prompt = prompt_version.as_str().and_then(parse_prompt_version);
    let Some(parsed_prompt) = parsed_prompt else {
        recorder.emit(
            correlation_id,
            "schema_mismatch",
            "prompt_version",
            "invalid_prompt_version_format",
            "reject",
            Some(json!({ "value": prompt_version, "expected_pattern": "major.minor[.patch]" })),
        );
        return rejected_outcome(recorder);
    };

    // Allow patch drift within the same major/minor.
    let supported_prompt = parse_prompt_version(SUPPORTED_PROMPT_VERSION)
        .unwrap_or((1, 0, 0));
    if (parsed_prompt.0, parsed_prompt.1) != (supported_prompt.0, supported_prompt.1) {
        recorder.emit(
            correlation_id,
            "incompatible_version",
            "prompt_version",
            "unsupported_prompt_version",
            "reject",
            Some(json!({ "received": prompt_version, "supported": SUPPORTED_PROMPT_VERSION })),
        );
        return rejected_outcome(recorder);
    }

    let Some(findings) = object["findings"].as_array() else {
        recorder.emit(
            correlation_id,
            "schema_mismatch",
            "findings",
            "findings_not_array",
            "reject",
            None,
        );
        return rejected_outcome(recorder);
    };

    let changed_set: HashSet<String> = changed_files
        .iter()
        .map(|path| normalize_repo_path(path))
        .collect();

    let mut kept_findings: Vec<Value> = Vec::new();

    for (idx, finding) in findings.iter().enumerate() {
        let Some(finding) = finding.as_object() else {
            recorder.emit(
                correlation_id,
                "schema_mismatch",
                format!("findings[{idx}]"),
                "finding_not_object",
                "drop",
                None,
            );
            continue;
        };

        let mut missing: Vec<&str> = REQUIRED_FINDING_FIELDS
            .iter()
            .copied()
            .filter(|field| !finding.contains_key(*field))
            .collect();
        missing.sort_unstable();
        if !missing.is_empty() {
            recorder.emit(
                correlation_id,
                "missing_required_field",
                format!("findings[{idx}]"),
                "missing_required_finding_field",
                "drop",
                Some(json!({ "missing": missing })),
            );
            continue;
        }

        let mut coerced: Map<String, Value> = finding.clone();

        for field_name in TRIMMED_STRING_FIELDS {
            if let Some(Value::String(value)) = coerced.get(field_name) {
                let trimmed = value.trim();
                if trimmed != value.as_str() {
                    recorder.emit(
                        correlation_id,
                        "coercion_applied",
                        field_name,
                        "trim_whitespace",
                        "coerce",
                        Some(json!({ "old": value, "new": trimmed, "finding_index": idx })),
                    );
                    let trimmed = trimmed.to_string();
                    coerced.insert(field_name.to_string(), Value::String(trimmed));
                }
            }
        }

        if let Some(Value::String(file)) = coerced.get("file") {
            let normalized = normalize_repo_path(file);
            if normalized != *file {
                recorder.emit(
                    correlation_id,
                    "coercion_applied",
                    "file",
                    "normalize_path",
                    "coerce",
                    Some(json!({ "old": file, "new": normalized, "finding_index": idx })),
                );
                coerced.insert("file".to_string(), Value::String(normalized));
            }
        }

        for numeric_field in NUMERIC_FIELDS {
            if let Some(Value::String(value)) = coerced.get(numeric_field) {
                if !value.is_empty() && value.chars().all(|c| c.is_ascii_digit()) {
                    if let Ok(number) = value.parse::<i64>() {
                        recorder.emit(
                            correlation_id,
                            "coercion_applied",
                            numeric_field,
                            "numeric_string_to_int",
                            "coerce",
                            Some(json!({ "old": value, "new": number, "finding_index": idx })),
                        );
                        coerced.insert(numeric_field.to_string(), json!(number));
                    }
                }
            }
        }

        let severity = coerced.get("severity").cloned().unwrap_or(Value::Null);
        if !severity
            .as_str()
            .map_or(false, |value| ALLOWED_SEVERITIES.contains(&value))
        {
            recorder.emit(
                correlation_id,
                "invalid_enum_value",
                "severity",
                "unsupported_severity",
                "drop",
                Some(json!({ "finding_index": idx, "value": severity })),
            );
            continue;
        }

        let category = coerced.get("category").cloned().unwrap_or(Value::Null);
        if !category
            .as_str()
            .map_or(false, |value| ALLOWED_CATEGORIES.contains(&value))
        {
            recorder.emit(
                correlation_id,
                "invalid_enum_value",
                "category",
                "unsupported_category",
                "drop",
                Some(json!({ "finding_index": idx, "value": category })),
            );
            continue;
        }

        let confidence = coerced.get("confidence").cloned().unwrap_or(Value::Null);
        if !confidence.is_null()
            && !confidence
                .as_str()
                .map_or(false, |value| ALLOWED_CONFIDENCE.contains(&value))
        {
            recorder.emit(
                correlation_id,
                "invalid_enum_value",
                "confidence",
                "unsupported_confidence",
                "drop",
                Some(json!({ "finding_index": idx, "value": confidence })),
            );
            continue;
        }

        let line_value = coerced.get("line").cloned().unwrap_or(Value::Null);
        let line = line_value.as_i64();
        if !line.map_or(false, |line| line >= 1) {
            recorder.emit(
                correlation_id,
                "invalid_line_range",
                "line",
                "line_must_be_positive_int",
                "drop",
                Some(json!({ "finding_index": idx, "value": line_value })),
            );
            continue;
        }
        let line = line.unwrap_or(1);

        let end_line_value = coerced.get("end_line").cloned().unwrap_or(Value::Null);
        if !end_line_value.is_null()
            && !end_line_value.as_i64().map_or(false, |end| end >= line)
        {
            recorder.emit(
                correlation_id,
                "invalid_line_range",
                "end_line",
                "end_line_must_be_int_and_gte_line",
                "drop",
                Some(json!({ "finding_index": idx, "line": line, "end_line": end_line_value })),
            );
            continue;
        }

        let file = coerced
            .get("file")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if !reconcile_changed_file(&file, &changed_set) {
            recorder.emit(
                correlation_id,
                "file_not_in_changed_files",
                "file",
                "unmatched_changed_file",
                "drop",
                Some(json!({ "finding_index": idx, "file": file })),
            );
            continue;
        }

        kept_findings.push(Value::Object(coerced));
    }

    if kept_findings.is_empty() {
        recorder.emit(
            correlation_id,
            "all_findings_dropped",
            "findings",
            "no_valid_findings_after_validation",
            "warn",
            None,
        );
    }

    let mut result = object.clone();
    result.insert("findings".to_string(), Value::Array(kept_findings));

    ValidationOutcome {
        review_result: Value::Object(result),
        diagnostics: recorder.entries().to_vec(),
        rejected: false,
    }
}
