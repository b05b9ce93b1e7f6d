//! Bounds on how much issue and file data is forwarded to the generative service.

use std::collections::HashMap;

use crate::state::{AuditReport, Issue};

/// Select at most `limit` issues, highest severity first.
///
/// Ties keep their original relative order. When nothing has to be dropped
/// the input is returned unchanged, which makes the selection idempotent.
pub fn select_issue_subset(issues: &[Issue], limit: usize) -> Vec<Issue> {
    if limit >= issues.len() {
        return issues.to_vec();
    }
    let mut ranked: Vec<&Issue> = issues.iter().collect();
    // `sort_by` is stable, so equal severities stay in input order.
    ranked.sort_by(|a, b| b.severity.cmp(&a.severity));
    ranked.into_iter().take(limit).cloned().collect()
}

/// Select at most `limit` files, ranked by the weight of the issues they carry.
///
/// Weight is the sum of severity weights of a file's issues; ties fall back to
/// the raw issue count and then to the original position.
pub fn select_file_subset(
    candidate_files: &[String],
    audit_report: &AuditReport,
    limit: usize,
) -> Vec<String> {
    let mut tally: HashMap<&str, (u32, usize)> = HashMap::new();
    for issue in &audit_report.issues {
        let entry = tally.entry(issue.location.file.as_str()).or_default();
        entry.0 += issue.severity.weight();
        entry.1 += 1;
    }

    let mut ranked: Vec<(usize, &String)> = candidate_files.iter().enumerate().collect();
    ranked.sort_by(|(ia, a), (ib, b)| {
        let (wa, ca) = tally.get(a.as_str()).copied().unwrap_or_default();
        let (wb, cb) = tally.get(b.as_str()).copied().unwrap_or_default();
        wb.cmp(&wa).then(cb.cmp(&ca)).then(ia.cmp(ib))
    });
    ranked
        .into_iter()
        .take(limit)
        .map(|(_, file)| file.clone())
        .collect()
}

/// Issues located in one of `files`, in their original order.
pub fn issues_for_files(issues: &[Issue], files: &[String]) -> Vec<Issue> {
    issues
        .iter()
        .filter(|issue| files.iter().any(|f| *f == issue.location.file))
        .cloned()
        .collect()
}

/// Keep the first `max_lines` lines of a file body, noting how many were cut.
pub fn truncate_lines(content: &str, max_lines: usize) -> String {
    let total = content.lines().count();
    if total <= max_lines {
        return content.to_string();
    }
    let mut kept = content.lines().take(max_lines).collect::<Vec<_>>().join("\n");
    kept.push_str(&format!("\n... [truncated {} lines]", total - max_lines));
    kept
}
