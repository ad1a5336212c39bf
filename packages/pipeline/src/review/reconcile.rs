//! Path reconciliation between review findings and fetched change sets.

use std::collections::HashSet;

/// Normalize a producer-emitted path for comparison: trim whitespace,
/// forward slashes, no leading `./`.
pub fn normalize_repo_path(path: &str) -> String {
    let normalized = path.trim().replace('\\', "/");
    normalized
        .strip_prefix("./")
        .map(str::to_string)
        .unwrap_or(normalized)
}

/// Whether `path` names a file in the change set, after normalizing both
/// sides.
pub fn reconcile_changed_file(path: &str, changed_files: &HashSet<String>) -> bool {
    let normalized = normalize_repo_path(path);
    changed_files
        .iter()
        .any(|item| normalize_repo_path(item) == normalized)
}
