//! Terminal-state reporting to the upstream tracker.
//!
//! Success moves the issue to `Done` with the `executed` label and a
//! summary comment; failure moves it to `Canceled` with the `failed` label
//! and a diagnostic comment. The state update must succeed before label and
//! comment are attempted; those two then run concurrently and partial
//! failures are logged, never propagated.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::providers::{CommitInfo, ProviderKind};
use crate::tracker::{TrackerClient, TrackerError};
use crate::IssueId;

/// Maximum diagnostic detail carried into a failure comment.
const MAX_STACK_CHARS: usize = 1500;
const TRUNCATION_SENTINEL: &str = "...(truncated)";

/// Everything the success comment reports.
#[derive(Debug)]
pub struct SuccessReport<'a> {
    pub issue: &'a IssueId,
    pub duration: Duration,
    pub provider: ProviderKind,
    pub commits: &'a [CommitInfo],
    pub files_touched: &'a [String],
    pub worktree_path: Option<&'a Path>,
}

/// Everything the failure comment reports.
#[derive(Debug)]
pub struct FailureReport<'a> {
    pub issue: &'a IssueId,
    pub error: &'a str,
    pub detail: Option<&'a str>,
    pub worktree_path: Option<&'a Path>,
}

/// Maps terminal session states to tracker side effects.
pub struct Reporter {
    tracker: Arc<dyn TrackerClient>,
}

impl Reporter {
    pub fn new(tracker: Arc<dyn TrackerClient>) -> Self {
        Self { tracker }
    }

    /// Report a successful execution.
    pub async fn report_success(&self, report: SuccessReport<'_>) -> Result<(), TrackerError> {
        self.tracker.update_state(report.issue, "Done").await?;

        let body = render_success_comment(&report);
        let (label, comment) = tokio::join!(
            self.tracker.add_label(report.issue, "executed"),
            self.tracker.post_comment(report.issue, &body),
        );
        log_side_effects(report.issue, label, comment);

        info!(issue = %report.issue, "success reported to tracker");
        Ok(())
    }

    /// Report a failed execution.
    pub async fn report_failure(&self, report: FailureReport<'_>) -> Result<(), TrackerError> {
        self.tracker.update_state(report.issue, "Canceled").await?;

        let body = render_failure_comment(&report);
        let (label, comment) = tokio::join!(
            self.tracker.add_label(report.issue, "failed"),
            self.tracker.post_comment(report.issue, &body),
        );
        log_side_effects(report.issue, label, comment);

        info!(issue = %report.issue, "failure reported to tracker");
        Ok(())
    }
}

fn log_side_effects(
    issue: &IssueId,
    label: Result<(), TrackerError>,
    comment: Result<(), TrackerError>,
) {
    if let Err(e) = label {
        warn!(issue = %issue, error = %e, "label update failed");
    }
    if let Err(e) = comment {
        warn!(issue = %issue, error = %e, "comment post failed");
    }
}

// ============================================================================
// Comment bodies
// ============================================================================

fn render_success_comment(report: &SuccessReport<'_>) -> String {
    let mut body = format!(
        "Execution completed in {}.\n\nProvider: {}\n",
        format_duration(report.duration),
        report.provider.display_name(),
    );

    if !report.commits.is_empty() {
        body.push_str("\nCommits:\n");
        for commit in report.commits {
            body.push_str(&format!("- `{}` {}\n", commit.short_sha(), commit.message));
        }
    }

    if !report.files_touched.is_empty() {
        body.push_str("\nModified files:\n");
        for file in report.files_touched {
            body.push_str(&format!("- `{file}`\n"));
        }
    }

    if let Some(path) = report.worktree_path {
        body.push_str(&format!("\nWorktree: `{}`\n", path.display()));
    }

    body
}

fn render_failure_comment(report: &FailureReport<'_>) -> String {
    let mut body = format!("Execution failed: {}\n", report.error);

    if let Some(detail) = report.detail {
        body.push_str("\n```\n");
        body.push_str(&truncate_detail(detail));
        body.push_str("\n```\n");
    }

    if let Some(path) = report.worktree_path {
        body.push_str(&format!(
            "\nThe worktree was retained for inspection: `{}`\n",
            path.display()
        ));
    }

    body
}

/// `Hh Mm Ss` rendering, e.g. `0h 4m 33s`.
fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    format!("{}h {}m {}s", total / 3600, (total % 3600) / 60, total % 60)
}

fn truncate_detail(detail: &str) -> String {
    if detail.chars().count() <= MAX_STACK_CHARS {
        return detail.to_string();
    }

    let truncated: String = detail.chars().take(MAX_STACK_CHARS).collect();
    format!("{truncated}{TRUNCATION_SENTINEL}")
}

#[cfg(test)]
#[path = "reporter_tests.rs"]
mod tests;
