//! External review-result contract enforcement.

pub mod reconcile;
pub mod validation;

pub use reconcile::{normalize_repo_path, reconcile_changed_file};
pub use validation::{
    validate_and_reconcile_review_result, Diagnostic, DiagnosticRecorder, ValidationOutcome,
    SUPPORTED_PROMPT_VERSION, SUPPORTED_SCHEMA_VERSION,
};
