//! Upstream issue tracker abstraction.
//!
//! The tracker's REST surface is out of scope; components talk to it
//! through [`TrackerClient`] and the service's composition root injects the
//! concrete client. The shared [`RateLimitBudget`] lets the poller and the
//! reporter observe the same saturation state.

use async_trait::async_trait;
use std::sync::Mutex;

use crate::{IssueDescriptor, IssueId, Timestamp};

/// Query for the poller's reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IssueQuery {
    /// Labels an issue must carry (any of)
    pub labels: Vec<String>,

    /// Workflow state names an issue must be in (any of)
    pub states: Vec<String>,
}

/// Tracker interaction failures.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    #[error("Tracker rate limit exceeded, resets at {reset_at}")]
    RateLimited { reset_at: Timestamp },

    #[error("Tracker request failed{}: {message}", status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Http { status: Option<u16>, message: String },

    #[error("Tracker rejected the request: {message}")]
    Rejected { message: String },
}

impl TrackerError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }
}

/// The tracker operations the orchestration plane needs.
#[async_trait]
pub trait TrackerClient: Send + Sync {
    /// Move the issue to a workflow state by name.
    async fn update_state(&self, issue: &IssueId, state: &str) -> Result<(), TrackerError>;

    /// Attach a label by name.
    async fn add_label(&self, issue: &IssueId, label: &str) -> Result<(), TrackerError>;

    /// Post a markdown comment.
    async fn post_comment(&self, issue: &IssueId, body: &str) -> Result<(), TrackerError>;

    /// Issues matching the query, for reconciliation.
    async fn search_issues(&self, query: &IssueQuery)
        -> Result<Vec<IssueDescriptor>, TrackerError>;
}

// ============================================================================
// Rate-limit budget
// ============================================================================

/// Shared view of the tracker's remaining request budget.
///
/// Consumers record observations from response headers; the poller refuses
/// to run a cycle while the budget is saturated.
#[derive(Debug)]
pub struct RateLimitBudget {
    inner: Mutex<BudgetInner>,
}

#[derive(Debug)]
struct BudgetInner {
    remaining: Option<u64>,
    reset_at: Option<Timestamp>,
    floor: u64,
}

impl RateLimitBudget {
    /// A budget that trips when fewer than `floor` requests remain.
    pub fn with_floor(floor: u64) -> Self {
        Self {
            inner: Mutex::new(BudgetInner {
                remaining: None,
                reset_at: None,
                floor,
            }),
        }
    }

    /// Record an observation from tracker response headers.
    pub fn record(&self, remaining: u64, reset_at: Option<Timestamp>) {
        let mut inner = self.inner.lock().expect("budget poisoned");
        inner.remaining = Some(remaining);
        inner.reset_at = reset_at;
    }

    /// Whether the tracker budget is too low to start new work at `now`.
    pub fn is_saturated(&self, now: Timestamp) -> bool {
        let inner = self.inner.lock().expect("budget poisoned");
        match (inner.remaining, inner.reset_at) {
            (Some(remaining), Some(reset_at)) => remaining < inner.floor && now < reset_at,
            (Some(remaining), None) => remaining < inner.floor,
            _ => false,
        }
    }
}

impl Default for RateLimitBudget {
    fn default() -> Self {
        Self::with_floor(10)
    }
}

#[cfg(test)]
#[path = "tracker_tests.rs"]
mod tests;
