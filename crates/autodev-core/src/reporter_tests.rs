//! Tests for the reporter.

use super::*;
use crate::tracker::IssueQuery;
use crate::{IssueDescriptor, Timestamp};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Mutex;

/// Recording tracker double with per-operation failure switches.
#[derive(Default)]
struct RecordingTracker {
    fail_state: bool,
    fail_label: bool,
    fail_comment: bool,
    states: Mutex<Vec<(IssueId, String)>>,
    labels: Mutex<Vec<(IssueId, String)>>,
    comments: Mutex<Vec<(IssueId, String)>>,
}

impl RecordingTracker {
    fn failing() -> TrackerError {
        TrackerError::Http {
            status: Some(500),
            message: "tracker down".to_string(),
        }
    }
}

#[async_trait]
impl TrackerClient for RecordingTracker {
    async fn update_state(&self, issue: &IssueId, state: &str) -> Result<(), TrackerError> {
        if self.fail_state {
            return Err(Self::failing());
        }
        self.states
            .lock()
            .unwrap()
            .push((issue.clone(), state.to_string()));
        Ok(())
    }

    async fn add_label(&self, issue: &IssueId, label: &str) -> Result<(), TrackerError> {
        if self.fail_label {
            return Err(Self::failing());
        }
        self.labels
            .lock()
            .unwrap()
            .push((issue.clone(), label.to_string()));
        Ok(())
    }

    async fn post_comment(&self, issue: &IssueId, body: &str) -> Result<(), TrackerError> {
        if self.fail_comment {
            return Err(Self::failing());
        }
        self.comments
            .lock()
            .unwrap()
            .push((issue.clone(), body.to_string()));
        Ok(())
    }

    async fn search_issues(
        &self,
        _query: &IssueQuery,
    ) -> Result<Vec<IssueDescriptor>, TrackerError> {
        Ok(Vec::new())
    }
}

fn abc7() -> IssueId {
    IssueId::new("ABC-7").unwrap()
}

fn commit() -> CommitInfo {
    CommitInfo {
        sha: "0123456789abcdef".to_string(),
        message: "ABC-7: fix the retry".to_string(),
        author: None,
        date: Some(Timestamp::now()),
    }
}

#[tokio::test]
async fn success_sets_state_label_and_comment() {
    let tracker = Arc::new(RecordingTracker::default());
    let reporter = Reporter::new(tracker.clone());
    let issue = abc7();
    let commits = vec![commit()];
    let files = vec!["src/retry.rs".to_string()];
    let worktree = PathBuf::from("/data/worktrees/ABC-7");

    reporter
        .report_success(SuccessReport {
            issue: &issue,
            duration: Duration::from_secs(273),
            provider: ProviderKind::Anthropic,
            commits: &commits,
            files_touched: &files,
            worktree_path: Some(&worktree),
        })
        .await
        .unwrap();

    assert_eq!(
        tracker.states.lock().unwrap().as_slice(),
        &[(issue.clone(), "Done".to_string())]
    );
    assert_eq!(
        tracker.labels.lock().unwrap().as_slice(),
        &[(issue.clone(), "executed".to_string())]
    );

    let comments = tracker.comments.lock().unwrap();
    let body = &comments[0].1;
    assert!(body.contains("0h 4m 33s"));
    assert!(body.contains("Anthropic"));
    assert!(body.contains("`0123456`"));
    assert!(body.contains("src/retry.rs"));
    assert!(body.contains("/data/worktrees/ABC-7"));
}

#[tokio::test]
async fn failure_sets_canceled_with_truncated_detail() {
    let tracker = Arc::new(RecordingTracker::default());
    let reporter = Reporter::new(tracker.clone());
    let issue = abc7();
    let long_stack = "at frame\n".repeat(400);

    reporter
        .report_failure(FailureReport {
            issue: &issue,
            error: "VerificationFailed: no qualifying commit",
            detail: Some(&long_stack),
            worktree_path: Some(Path::new("/data/worktrees/ABC-7")),
        })
        .await
        .unwrap();

    assert_eq!(
        tracker.states.lock().unwrap().as_slice(),
        &[(issue.clone(), "Canceled".to_string())]
    );
    assert_eq!(
        tracker.labels.lock().unwrap().as_slice(),
        &[(issue.clone(), "failed".to_string())]
    );

    let comments = tracker.comments.lock().unwrap();
    let body = &comments[0].1;
    assert!(body.contains("VerificationFailed"));
    assert!(body.contains("...(truncated)"));
    assert!(body.contains("retained for inspection"));
    // The embedded detail is capped.
    assert!(body.len() < long_stack.len());
}

#[tokio::test]
async fn state_failure_aborts_before_label_and_comment() {
    let tracker = Arc::new(RecordingTracker {
        fail_state: true,
        ..Default::default()
    });
    let reporter = Reporter::new(tracker.clone());
    let issue = abc7();

    let result = reporter
        .report_success(SuccessReport {
            issue: &issue,
            duration: Duration::from_secs(1),
            provider: ProviderKind::OpenAi,
            commits: &[],
            files_touched: &[],
            worktree_path: None,
        })
        .await;

    assert!(result.is_err());
    assert!(tracker.labels.lock().unwrap().is_empty());
    assert!(tracker.comments.lock().unwrap().is_empty());
}

#[tokio::test]
async fn label_failure_does_not_block_comment() {
    let tracker = Arc::new(RecordingTracker {
        fail_label: true,
        ..Default::default()
    });
    let reporter = Reporter::new(tracker.clone());
    let issue = abc7();

    reporter
        .report_failure(FailureReport {
            issue: &issue,
            error: "boom",
            detail: None,
            worktree_path: None,
        })
        .await
        .unwrap();

    // Comment still lands despite the label failure.
    assert_eq!(tracker.comments.lock().unwrap().len(), 1);
}

#[test]
fn duration_formatting() {
    assert_eq!(format_duration(Duration::from_secs(0)), "0h 0m 0s");
    assert_eq!(format_duration(Duration::from_secs(273)), "0h 4m 33s");
    assert_eq!(format_duration(Duration::from_secs(3723)), "1h 2m 3s");
}

#[test]
fn short_detail_is_not_truncated() {
    assert_eq!(truncate_detail("short"), "short");
}
