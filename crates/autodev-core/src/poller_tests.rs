//! Tests for the reconciliation poller.

use super::*;
use crate::clock::ManualClock;
use crate::session::{CleanupPolicy, NewSession, SessionState};
use crate::store::StateStore;
use crate::{IssueId, SessionId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use tempfile::TempDir;

fn issue(identifier: &str) -> IssueDescriptor {
    IssueDescriptor {
        id: format!("internal-{identifier}"),
        identifier: IssueId::new(identifier).unwrap(),
        title: "task".to_string(),
        description: None,
        labels: vec!["auto".to_string()],
        project: None,
        team: None,
        state: Some("Todo".to_string()),
    }
}

/// Tracker stub with a scripted search result.
struct StubTracker {
    result: StdMutex<Option<Result<Vec<IssueDescriptor>, TrackerError>>>,
}

impl StubTracker {
    fn returning(issues: Vec<IssueDescriptor>) -> Arc<Self> {
        Arc::new(Self {
            result: StdMutex::new(Some(Ok(issues))),
        })
    }

    fn rate_limited(reset_at: Timestamp) -> Arc<Self> {
        Arc::new(Self {
            result: StdMutex::new(Some(Err(TrackerError::RateLimited { reset_at }))),
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            result: StdMutex::new(Some(Err(TrackerError::Http {
                status: Some(500),
                message: "tracker down".to_string(),
            }))),
        })
    }
}

#[async_trait]
impl TrackerClient for StubTracker {
    async fn update_state(&self, _: &IssueId, _: &str) -> Result<(), TrackerError> {
        Ok(())
    }

    async fn add_label(&self, _: &IssueId, _: &str) -> Result<(), TrackerError> {
        Ok(())
    }

    async fn post_comment(&self, _: &IssueId, _: &str) -> Result<(), TrackerError> {
        Ok(())
    }

    async fn search_issues(
        &self,
        _query: &IssueQuery,
    ) -> Result<Vec<IssueDescriptor>, TrackerError> {
        self.result
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

/// Processor stub counting invocations and observing batch concurrency.
struct CountingProcessor {
    processed: StdMutex<Vec<IssueId>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl CountingProcessor {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            processed: StdMutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl IssueProcessor for CountingProcessor {
    async fn process_issue(&self, issue: &IssueDescriptor) -> AutodevResult<SessionRecord> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(20)).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.processed.lock().unwrap().push(issue.identifier.clone());

        let now = Timestamp::now();
        Ok(SessionRecord {
            session_id: SessionId::for_issue(&issue.identifier),
            issue_id: issue.identifier.clone(),
            repository: "api".to_string(),
            worktree_path: None,
            state: SessionState::Done,
            process_id: None,
            final_commit: None,
            completion_reason: Some("verified".to_string()),
            error: None,
            cleanup_policy: CleanupPolicy::RetainSession,
            created_at: now,
            updated_at: now,
            completed_at: Some(now),
        })
    }
}

struct Fixture {
    _dir: TempDir,
    sessions: Arc<SessionManager>,
    clock: ManualClock,
}

async fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let store = StateStore::open(dir.path().join("state")).await.unwrap();
    let clock = ManualClock::new();
    let sessions = Arc::new(
        SessionManager::load(store, Arc::new(clock.clone()))
            .await
            .unwrap(),
    );
    Fixture {
        _dir: dir,
        sessions,
        clock,
    }
}

fn poller_with(
    f: &Fixture,
    tracker: Arc<StubTracker>,
    processor: Arc<CountingProcessor>,
    budget: Arc<RateLimitBudget>,
    config: PollerConfig,
) -> Poller {
    Poller::new(
        Arc::new(f.clock.clone()),
        tracker,
        Arc::clone(&f.sessions),
        processor,
        budget,
        config,
    )
}

fn no_shutdown() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    std::mem::forget(tx);
    rx
}

#[tokio::test]
async fn cycle_processes_pending_issues() {
    let f = fixture().await;
    let processor = CountingProcessor::new();
    let poller = poller_with(
        &f,
        StubTracker::returning(vec![issue("ABC-1"), issue("ABC-2")]),
        Arc::clone(&processor),
        Arc::new(RateLimitBudget::default()),
        PollerConfig::default(),
    );

    let outcome = poller.run_cycle(&no_shutdown()).await;

    assert_eq!(outcome, CycleOutcome::Completed { processed: 2 });
    assert_eq!(processor.processed.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn issues_with_live_sessions_are_dropped() {
    let f = fixture().await;
    f.sessions
        .create_session(NewSession {
            issue_id: IssueId::new("ABC-1").unwrap(),
            repository: "api".to_string(),
            worktree_path: None,
            cleanup_policy: CleanupPolicy::RetainSession,
        })
        .await
        .unwrap();

    let processor = CountingProcessor::new();
    let poller = poller_with(
        &f,
        StubTracker::returning(vec![issue("ABC-1"), issue("ABC-2")]),
        Arc::clone(&processor),
        Arc::new(RateLimitBudget::default()),
        PollerConfig::default(),
    );

    let outcome = poller.run_cycle(&no_shutdown()).await;

    assert_eq!(outcome, CycleOutcome::Completed { processed: 1 });
    let processed = processor.processed.lock().unwrap();
    assert_eq!(processed.as_slice(), &[IssueId::new("ABC-2").unwrap()]);
}

#[tokio::test]
async fn batches_respect_the_concurrency_limit() {
    let f = fixture().await;
    let issues: Vec<IssueDescriptor> = (1..=12).map(|n| issue(&format!("ABC-{n}"))).collect();
    let processor = CountingProcessor::new();
    let config = PollerConfig {
        concurrency: 5,
        ..Default::default()
    };
    let poller = poller_with(
        &f,
        StubTracker::returning(issues),
        Arc::clone(&processor),
        Arc::new(RateLimitBudget::default()),
        config,
    );

    let outcome = poller.run_cycle(&no_shutdown()).await;

    assert_eq!(outcome, CycleOutcome::Completed { processed: 12 });
    assert!(processor.max_in_flight.load(Ordering::SeqCst) <= 5);
}

#[tokio::test]
async fn saturated_budget_skips_the_cycle() {
    let f = fixture().await;
    let budget = Arc::new(RateLimitBudget::with_floor(10));
    budget.record(1, Some(f.clock.now().add_seconds(600)));

    let processor = CountingProcessor::new();
    let poller = poller_with(
        &f,
        StubTracker::returning(vec![issue("ABC-1")]),
        Arc::clone(&processor),
        budget,
        PollerConfig::default(),
    );

    let outcome = poller.run_cycle(&no_shutdown()).await;

    assert_eq!(outcome, CycleOutcome::Skipped);
    assert!(processor.processed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn rate_limited_query_reports_resume_time() {
    let f = fixture().await;
    let reset_at = f.clock.now().add_seconds(300);
    let processor = CountingProcessor::new();
    let poller = poller_with(
        &f,
        StubTracker::rate_limited(reset_at),
        Arc::clone(&processor),
        Arc::new(RateLimitBudget::default()),
        PollerConfig::default(),
    );

    let outcome = poller.run_cycle(&no_shutdown()).await;

    assert_eq!(outcome, CycleOutcome::RateLimited { resume_at: reset_at });
}

#[tokio::test]
async fn query_failure_reports_failed() {
    let f = fixture().await;
    let processor = CountingProcessor::new();
    let poller = poller_with(
        &f,
        StubTracker::failing(),
        Arc::clone(&processor),
        Arc::new(RateLimitBudget::default()),
        PollerConfig::default(),
    );

    let outcome = poller.run_cycle(&no_shutdown()).await;
    assert!(matches!(outcome, CycleOutcome::Failed { .. }));
}

#[tokio::test]
async fn shutdown_between_batches_stops_processing() {
    let f = fixture().await;
    let issues: Vec<IssueDescriptor> = (1..=10).map(|n| issue(&format!("ABC-{n}"))).collect();
    let processor = CountingProcessor::new();
    let poller = poller_with(
        &f,
        StubTracker::returning(issues),
        Arc::clone(&processor),
        Arc::new(RateLimitBudget::default()),
        PollerConfig {
            concurrency: 5,
            ..Default::default()
        },
    );

    let (tx, rx) = watch::channel(true);
    let outcome = poller.run_cycle(&rx).await;
    drop(tx);

    // Shutdown was already signalled, so no batch ran.
    assert_eq!(outcome, CycleOutcome::Completed { processed: 0 });
    assert!(processor.processed.lock().unwrap().is_empty());
}

mod backoff {
    use super::*;

    fn config() -> PollerConfig {
        PollerConfig {
            interval: Duration::from_secs(1800),
            max_interval: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    #[test]
    fn success_resets_to_base() {
        let next = next_interval(
            Duration::from_secs(3600),
            &CycleOutcome::Completed { processed: 1 },
            &config(),
        );
        assert_eq!(next, Duration::from_secs(1800));
    }

    #[test]
    fn failure_doubles_up_to_max() {
        let config = config();
        let doubled = next_interval(
            Duration::from_secs(1800),
            &CycleOutcome::Failed {
                message: "x".to_string(),
            },
            &config,
        );
        assert_eq!(doubled, Duration::from_secs(3600));

        let capped = next_interval(
            doubled,
            &CycleOutcome::Failed {
                message: "x".to_string(),
            },
            &config,
        );
        assert_eq!(capped, Duration::from_secs(3600));
    }

    #[test]
    fn skip_keeps_the_current_cadence() {
        let next = next_interval(Duration::from_secs(2400), &CycleOutcome::Skipped, &config());
        assert_eq!(next, Duration::from_secs(2400));
    }
}
