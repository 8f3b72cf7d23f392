//! Conflict classification over captured command output.
//!
//! A case-insensitive substring scan against a fixed signature list. Extend
//! the list to recognise new messages; keep the matching strategy as is so
//! the check stays auditable.

/// Substrings that mark integration output as conflicted.
pub const CONFLICT_SIGNATURES: &[&str] = &[
    "conflict",
    "merge conflict",
    "automatic merge failed",
    "resolve conflicts",
    "fix conflicts",
    "failed to merge",
    "CONFLICT (content)",
    "both modified",
    "both added",
    "added by us",
    "added by them",
    "deleted by us",
    "deleted by them",
];

/// Signatures found in `output`, in list order.
pub fn matched_signatures(output: &str) -> Vec<&'static str> {
    let haystack = output.to_lowercase();
    CONFLICT_SIGNATURES
        .iter()
        .copied()
        .filter(|sig| haystack.contains(&sig.to_lowercase()))
        .collect()
}

/// Whether the combined stdout and stderr of an integration command reports
/// a conflict.
pub fn detect_conflict(combined_output: &str) -> bool {
    !matched_signatures(combined_output).is_empty()
}

/// Paths named by `CONFLICT (...)` lines, first-seen order, no duplicates.
///
/// Handles the `Merge conflict in <path>` form and the
/// `<path> deleted in <rev> and modified in <rev>` form.
pub fn parse_conflict_paths(output: &str) -> Vec<String> {
    let mut paths = Vec::new();
    for line in output.lines().map(str::trim) {
        if !line.starts_with("CONFLICT (") {
            continue;
        }
        let path = if let Some((_, rest)) = line.split_once("Merge conflict in ") {
            Some(rest.trim())
        } else {
            line.split_once("): ")
                .and_then(|(_, rest)| rest.split_once(" deleted in "))
                .map(|(path, _)| path.trim())
        };
        if let Some(path) = path.filter(|p| !p.is_empty()) {
            push_unique(&mut paths, path);
        }
    }
    paths
}

/// Merge path lists keeping first-seen order.
pub fn merge_paths<'a>(
    first: impl IntoIterator<Item = &'a str>,
    second: impl IntoIterator<Item = &'a str>,
) -> Vec<String> {
    let mut paths = Vec::new();
    for path in first.into_iter().chain(second).map(str::trim) {
        if !path.is_empty() {
            push_unique(&mut paths, path);
        }
    }
    paths
}

fn push_unique(paths: &mut Vec<String>, path: &str) {
    if !paths.iter().any(|p| p == path) {
        paths.push(path.to_string());
    }
}
