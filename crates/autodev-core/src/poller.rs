//! # Poller
//!
//! Periodic reconciliation against the upstream tracker: issues matching
//! the configured labels and states that somehow never reached us through
//! the webhook are picked up here.
//!
//! The first cycle runs a full interval after startup. A cycle is skipped
//! while the shared rate-limit budget is saturated; general failures double
//! the interval up to the maximum, a tracker rate-limit pauses until the
//! server-indicated reset plus a one-minute buffer. Issues are processed in
//! bounded batches with a shutdown check between batches.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, warn};

use crate::clock::Clock;
use crate::orchestrator::Orchestrator;
use crate::session::{SessionManager, SessionRecord};
use crate::tracker::{IssueQuery, RateLimitBudget, TrackerClient, TrackerError};
use crate::{AutodevResult, IssueDescriptor, Timestamp};

/// Buffer added on top of the server-indicated rate-limit reset.
const RATE_LIMIT_BUFFER: Duration = Duration::from_secs(60);

/// Poller tuning.
#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Base poll interval
    pub interval: Duration,

    /// Ceiling for the backoff-doubled interval
    pub max_interval: Duration,

    /// Labels the reconciliation query matches
    pub labels: Vec<String>,

    /// Workflow states the reconciliation query matches
    pub states: Vec<String>,

    /// Issues processed concurrently within one batch
    pub concurrency: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30 * 60),
            max_interval: Duration::from_secs(60 * 60),
            labels: vec!["auto".to_string()],
            states: vec!["Todo".to_string()],
            concurrency: 5,
        }
    }
}

/// Result of one reconciliation cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Cycle ran; `processed` issues reached a terminal state
    Completed { processed: usize },

    /// Budget saturated or backoff active; nothing queried
    Skipped,

    /// Tracker said to come back later
    RateLimited { resume_at: Timestamp },

    /// Query or processing infrastructure failed
    Failed { message: String },
}

/// Processes one issue end to end; the orchestrator in production.
#[async_trait]
pub trait IssueProcessor: Send + Sync {
    async fn process_issue(&self, issue: &IssueDescriptor) -> AutodevResult<SessionRecord>;
}

#[async_trait]
impl IssueProcessor for Orchestrator {
    async fn process_issue(&self, issue: &IssueDescriptor) -> AutodevResult<SessionRecord> {
        Orchestrator::process_issue(self, issue).await
    }
}

/// Background reconciliation loop.
pub struct Poller {
    clock: Arc<dyn Clock>,
    tracker: Arc<dyn TrackerClient>,
    sessions: Arc<SessionManager>,
    processor: Arc<dyn IssueProcessor>,
    budget: Arc<RateLimitBudget>,
    config: PollerConfig,
}

impl Poller {
    pub fn new(
        clock: Arc<dyn Clock>,
        tracker: Arc<dyn TrackerClient>,
        sessions: Arc<SessionManager>,
        processor: Arc<dyn IssueProcessor>,
        budget: Arc<RateLimitBudget>,
        config: PollerConfig,
    ) -> Self {
        Self {
            clock,
            tracker,
            sessions,
            processor,
            budget,
            config,
        }
    }

    /// Run cycles until the shutdown signal flips. The first cycle starts
    /// one full interval after spawn.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = self.config.interval;

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("poller stopping");
                            break;
                        }
                    }
                    _ = self.clock.sleep(interval) => {
                        let outcome = self.run_cycle(&shutdown).await;
                        interval = next_interval(interval, &outcome, &self.config);

                        if let CycleOutcome::RateLimited { resume_at } = outcome {
                            let pause = resume_at
                                .duration_since(self.clock.now())
                                .saturating_add(RATE_LIMIT_BUFFER);
                            warn!(pause_secs = pause.as_secs(), "tracker rate limited, pausing poller");
                            self.clock.sleep(pause).await;
                        }
                    }
                }
            }
        })
    }

    /// One reconciliation pass.
    pub async fn run_cycle(&self, shutdown: &watch::Receiver<bool>) -> CycleOutcome {
        if self.budget.is_saturated(self.clock.now()) {
            info!("tracker budget saturated, skipping poll cycle");
            return CycleOutcome::Skipped;
        }

        let query = IssueQuery {
            labels: self.config.labels.clone(),
            states: self.config.states.clone(),
        };

        let issues = match self.tracker.search_issues(&query).await {
            Ok(issues) => issues,
            Err(TrackerError::RateLimited { reset_at }) => {
                return CycleOutcome::RateLimited { resume_at: reset_at };
            }
            Err(e) => {
                warn!(error = %e, "reconciliation query failed");
                return CycleOutcome::Failed {
                    message: e.to_string(),
                };
            }
        };

        // Issues already being worked on are not re-admitted.
        let mut pending = Vec::new();
        for issue in issues {
            if self.sessions.has_live_session(&issue.identifier).await {
                continue;
            }
            pending.push(issue);
        }

        info!(count = pending.len(), "reconciliation found issues to process");

        let mut processed = 0;
        for batch in pending.chunks(self.config.concurrency.max(1)) {
            if *shutdown.borrow() {
                info!("shutdown requested, aborting between batches");
                break;
            }

            let mut tasks: JoinSet<bool> = JoinSet::new();
            for issue in batch {
                let processor = Arc::clone(&self.processor);
                let issue = issue.clone();
                tasks.spawn(async move { processor.process_issue(&issue).await.is_ok() });
            }

            while let Some(result) = tasks.join_next().await {
                if matches!(result, Ok(true)) {
                    processed += 1;
                }
            }
        }

        CycleOutcome::Completed { processed }
    }
}

/// Backoff policy: success resets to the base interval, failure doubles up
/// to the maximum, skip leaves the cadence untouched.
fn next_interval(current: Duration, outcome: &CycleOutcome, config: &PollerConfig) -> Duration {
    match outcome {
        CycleOutcome::Completed { .. } => config.interval,
        CycleOutcome::RateLimited { .. } => config.interval,
        CycleOutcome::Skipped => current,
        CycleOutcome::Failed { .. } => (current * 2).min(config.max_interval),
    }
}

#[cfg(test)]
#[path = "poller_tests.rs"]
mod tests;
