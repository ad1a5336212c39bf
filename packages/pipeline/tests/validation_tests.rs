//! Contract tests for review-result validation and reconciliation.

use pipeline_core::review::{validate_and_reconcile_review_result, DiagnosticRecorder};
use serde_json::{json, Value};

fn changed_files() -> Vec<String> {
    vec!["src/main.rs".to_string(), "src/lib.rs".to_string()]
}

fn finding(file: &str, line: i64) -> Value {
    json!({
        "id": "F1",
        "severity": "high",
        "category": "correctness",
        "title": "Possible overflow",
        "file": file,
        "line": line,
        "message": "check the bounds"
    })
}

fn payload_with_findings(findings: Vec<Value>) -> String {
    json!({
        "schema_version": "1.0",
        "prompt_version": "1.0.0",
        "findings": findings
    })
    .to_string()
}

fn validate(raw: &str) -> pipeline_core::review::ValidationOutcome {
    let mut recorder = DiagnosticRecorder::new();
    validate_and_reconcile_review_result(raw, &changed_files(), "corr-1", &mut recorder)
}

#[test]
fn well_formed_payloads_keep_their_findings() {
    let outcome = validate(&payload_with_findings(vec![finding("src/main.rs", 10)]));

    assert!(!outcome.rejected);
    let findings = outcome.review_result["findings"].as_array().unwrap();
    assert_eq!(findings.len(), 1);
    assert!(outcome.diagnostics.is_empty());
}

#[test]
fn malformed_json_rejects_the_payload() {
    let outcome = validate("{not json");
    assert!(outcome.rejected);
    assert_eq!(outcome.diagnostics.len(), 1);
    assert_eq!(outcome.diagnostics[0].code, "invalid_json");
    assert_eq!(outcome.diagnostics[0].action, "reject");
    assert_eq!(outcome.review_result, json!({"findings": []}));
}

#[test]
fn non_object_payloads_reject() {
    let outcome = validate("[1, 2, 3]");
    assert!(outcome.rejected);
    assert_eq!(outcome.diagnostics[0].code, "schema_mismatch");
    assert_eq!(outcome.diagnostics[0].reason, "top_level_not_object");
}

#[test]
fn missing_required_top_level_fields_reject() {
    let outcome = validate(&json!({"schema_version": "1.0"}).to_string());
    assert!(outcome.rejected);
    let diagnostic = &outcome.diagnostics[0];
    assert_eq!(diagnostic.code, "missing_required_field");
    assert_eq!(
        diagnostic.details.as_ref().unwrap()["missing"],
        json!(["findings", "prompt_version"])
    );
}

#[test]
fn unexpected_top_level_fields_reject() {
    let raw = json!({
        "schema_version": "1.0",
        "prompt_version": "1.0.0",
        "findings": [],
        "extra": true
    })
    .to_string();
    let outcome = validate(&raw);
    assert!(outcome.rejected);
    let diagnostic = &outcome.diagnostics[0];
    assert_eq!(diagnostic.code, "schema_mismatch");
    assert_eq!(diagnostic.reason, "additional_properties_not_allowed");
    assert_eq!(
        diagnostic.details.as_ref().unwrap()["additional_properties"],
        json!(["extra"])
    );
}

#[test]
fn newer_schema_major_rejects_as_incompatible() {
    let raw = json!({
        "schema_version": "2.0",
        "prompt_version": "1.0.0",
        "findings": []
    })
    .to_string();
    let outcome = validate(&raw);
    assert!(outcome.rejected);
    assert_eq!(outcome.diagnostics[0].code, "incompatible_version");
    assert_eq!(outcome.diagnostics[0].field, "schema_version");
}

#[test]
fn older_schema_minor_rejects_but_newer_minor_is_accepted() {
    let newer_minor = json!({
        "schema_version": "1.2",
        "prompt_version": "1.0.9",
        "findings": []
    })
    .to_string();
    let outcome = validate(&newer_minor);
    assert!(!outcome.rejected, "newer minor with patch drift is fine");

    let older_minor = json!({
        "schema_version": "0.9",
        "prompt_version": "1.0.0",
        "findings": []
    })
    .to_string();
    assert!(validate(&older_minor).rejected);
}

#[test]
fn prompt_minor_drift_rejects_as_incompatible() {
    let raw = json!({
        "schema_version": "1.0",
        "prompt_version": "1.1.0",
        "findings": []
    })
    .to_string();
    let outcome = validate(&raw);
    assert!(outcome.rejected);
    assert_eq!(outcome.diagnostics[0].code, "incompatible_version");
    assert_eq!(outcome.diagnostics[0].field, "prompt_version");
}

#[test]
fn malformed_versions_reject_as_schema_mismatch() {
    let raw = json!({
        "schema_version": "1.0.0",
        "prompt_version": "1.0.0",
        "findings": []
    })
    .to_string();
    let outcome = validate(&raw);
    assert!(outcome.rejected);
    assert_eq!(outcome.diagnostics[0].code, "schema_mismatch");
    assert_eq!(outcome.diagnostics[0].reason, "invalid_schema_version_format");
}

#[test]
fn string_fields_are_trimmed_with_a_diagnostic() {
    let mut noisy = finding("src/main.rs", 5);
    noisy["title"] = json!("  Possible overflow  ");
    let outcome = validate(&payload_with_findings(vec![noisy]));

    assert!(!outcome.rejected);
    let coercions: Vec<_> = outcome
        .diagnostics
        .iter()
        .filter(|d| d.code == "coercion_applied")
        .collect();
    assert_eq!(coercions.len(), 1);
    assert_eq!(coercions[0].field, "title");
    assert_eq!(coercions[0].reason, "trim_whitespace");
    let details = coercions[0].details.as_ref().unwrap();
    assert_eq!(details["old"], json!("  Possible overflow  "));
    assert_eq!(details["new"], json!("Possible overflow"));
    assert_eq!(details["finding_index"], json!(0));

    let kept = &outcome.review_result["findings"][0];
    assert_eq!(kept["title"], json!("Possible overflow"));
}

#[test]
fn paths_are_normalized_before_reconciliation() {
    let outcome = validate(&payload_with_findings(vec![finding("./src\\main.rs", 5)]));

    assert!(!outcome.rejected);
    let kept = outcome.review_result["findings"].as_array().unwrap();
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0]["file"], json!("src/main.rs"));
    assert!(outcome
        .diagnostics
        .iter()
        .any(|d| d.code == "coercion_applied" && d.reason == "normalize_path"));
}

#[test]
fn numeric_string_lines_are_coerced_to_integers() {
    let mut stringy = finding("src/main.rs", 1);
    stringy["line"] = json!("12");
    stringy["end_line"] = json!("15");
    let outcome = validate(&payload_with_findings(vec![stringy]));

    assert!(!outcome.rejected);
    let kept = &outcome.review_result["findings"][0];
    assert_eq!(kept["line"], json!(12));
    assert_eq!(kept["end_line"], json!(15));
    assert_eq!(
        outcome
            .diagnostics
            .iter()
            .filter(|d| d.reason == "numeric_string_to_int")
            .count(),
        2
    );
}

#[test]
fn zero_or_negative_lines_drop_the_finding() {
    let outcome = validate(&payload_with_findings(vec![finding("src/main.rs", 0)]));
    assert!(!outcome.rejected);
    assert!(outcome.review_result["findings"].as_array().unwrap().is_empty());
    assert!(outcome
        .diagnostics
        .iter()
        .any(|d| d.code == "invalid_line_range" && d.field == "line"));
    assert!(outcome
        .diagnostics
        .iter()
        .any(|d| d.code == "all_findings_dropped" && d.action == "warn"));
}

#[test]
fn end_line_before_line_drops_the_finding() {
    let mut inverted = finding("src/main.rs", 10);
    inverted["end_line"] = json!(5);
    let outcome = validate(&payload_with_findings(vec![inverted]));
    assert!(outcome.review_result["findings"].as_array().unwrap().is_empty());
    assert!(outcome
        .diagnostics
        .iter()
        .any(|d| d.code == "invalid_line_range" && d.field == "end_line"));
}

#[test]
fn findings_outside_the_change_set_are_dropped() {
    let outcome = validate(&payload_with_findings(vec![finding("src/other.rs", 3)]));
    assert!(outcome.review_result["findings"].as_array().unwrap().is_empty());
    let dropped = outcome
        .diagnostics
        .iter()
        .find(|d| d.code == "file_not_in_changed_files")
        .unwrap();
    assert_eq!(dropped.details.as_ref().unwrap()["file"], json!("src/other.rs"));
}

#[test]
fn enum_violations_drop_the_finding() {
    let mut bad_severity = finding("src/main.rs", 1);
    bad_severity["severity"] = json!("catastrophic");
    let mut bad_category = finding("src/main.rs", 2);
    bad_category["category"] = json!("vibes");
    let mut bad_confidence = finding("src/main.rs", 3);
    bad_confidence["confidence"] = json!("certain");
    let good = finding("src/lib.rs", 4);

    let outcome = validate(&payload_with_findings(vec![
        bad_severity,
        bad_category,
        bad_confidence,
        good,
    ]));

    assert!(!outcome.rejected);
    let kept = outcome.review_result["findings"].as_array().unwrap();
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0]["file"], json!("src/lib.rs"));
    assert_eq!(
        outcome
            .diagnostics
            .iter()
            .filter(|d| d.code == "invalid_enum_value")
            .count(),
        3
    );
}

#[test]
fn non_object_and_incomplete_findings_are_dropped() {
    let incomplete = json!({"id": "F1", "severity": "low"});
    let outcome = validate(&payload_with_findings(vec![json!("nope"), incomplete]));

    assert!(!outcome.rejected);
    assert!(outcome.review_result["findings"].as_array().unwrap().is_empty());
    assert!(outcome
        .diagnostics
        .iter()
        .any(|d| d.reason == "finding_not_object" && d.field == "findings[0]"));
    let missing = outcome
        .diagnostics
        .iter()
        .find(|d| d.code == "missing_required_field" && d.field == "findings[1]")
        .unwrap();
    assert_eq!(
        missing.details.as_ref().unwrap()["missing"],
        json!(["category", "file", "line", "message", "title"])
    );
}

#[test]
fn unknown_finding_keys_are_preserved_on_kept_findings() {
    let mut extra = finding("src/main.rs", 2);
    extra["fix_suggestion"] = json!("clamp the index");
    let outcome = validate(&payload_with_findings(vec![extra]));

    let kept = &outcome.review_result["findings"][0];
    assert_eq!(kept["fix_suggestion"], json!("clamp the index"));
}

#[test]
fn accepted_payloads_keep_their_top_level_shape() {
    let raw = json!({
        "schema_version": "1.0",
        "prompt_version": "1.0.0",
        "summary": "looks fine",
        "findings": [finding("src/main.rs", 2)]
    })
    .to_string();
    let outcome = validate(&raw);
    assert_eq!(outcome.review_result["summary"], json!("looks fine"));
    assert_eq!(outcome.review_result["schema_version"], json!("1.0"));
}
