//! # Orchestrator
//!
//! The end-to-end pipeline for one issue: route, acquire the per-issue
//! status lock, open a session, materialize a worktree, drive the agent
//! executor with retry and provider failover, verify the produced commits,
//! report the outcome, and clean up.
//!
//! Operations for one issue id are serialized end-to-end by the status
//! lock; distinct issues run concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::directives::OverrideDirective;
use crate::providers::{
    AgentExecutor, ExecutionContext, ExecutionResult, ExecutorError, HttpAgentExecutor,
    ProviderConfig, ProviderKind, ProviderRouter,
};
use crate::reporter::{FailureReport, Reporter, SuccessReport};
use crate::retry::{with_retry, RetryConfig, RetryContext};
use crate::routing::{Route, RoutingEngine};
use crate::session::{CleanupPolicy, NewSession, SessionManager, SessionRecord};
use crate::worktree::{WorktreeInfo, WorktreeManager};
use crate::{AutodevError, AutodevResult, IssueDescriptor, IssueId, SessionId};

// ============================================================================
// Configuration
// ============================================================================

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Distinct providers tried before giving up
    pub max_provider_attempts: u32,

    /// Deadline for one execution request
    pub execution_timeout: Duration,

    /// Retry behavior for one provider
    pub retry: RetryConfig,

    /// Cleanup policy stamped onto new sessions
    pub cleanup_policy: CleanupPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_provider_attempts: 3,
            execution_timeout: Duration::from_secs(300),
            retry: RetryConfig::default(),
            cleanup_policy: CleanupPolicy::ArchiveSession,
        }
    }
}

/// Builds an executor for a selected provider; tests substitute scripted
/// executors.
pub trait ExecutorFactory: Send + Sync {
    fn executor_for(&self, provider: &ProviderConfig) -> Arc<dyn AgentExecutor>;
}

/// Production factory backing every provider with the HTTP executor.
pub struct HttpExecutorFactory;

impl ExecutorFactory for HttpExecutorFactory {
    fn executor_for(&self, provider: &ProviderConfig) -> Arc<dyn AgentExecutor> {
        Arc::new(HttpAgentExecutor::new(provider.clone()))
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Drives one issue through the full execution pipeline.
pub struct Orchestrator {
    clock: Arc<dyn Clock>,
    routing: Arc<RoutingEngine>,
    router: Arc<ProviderRouter>,
    worktrees: Arc<WorktreeManager>,
    sessions: Arc<SessionManager>,
    reporter: Arc<Reporter>,
    executors: Arc<dyn ExecutorFactory>,
    config: OrchestratorConfig,
    status_locks: Mutex<HashMap<IssueId, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        clock: Arc<dyn Clock>,
        routing: Arc<RoutingEngine>,
        router: Arc<ProviderRouter>,
        worktrees: Arc<WorktreeManager>,
        sessions: Arc<SessionManager>,
        reporter: Arc<Reporter>,
        executors: Arc<dyn ExecutorFactory>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            clock,
            routing,
            router,
            worktrees,
            sessions,
            reporter,
            executors,
            config,
            status_locks: Mutex::new(HashMap::new()),
        }
    }

    /// The session manager, shared with ingress for deduplication.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Process one issue to a terminal session state.
    pub async fn process_issue(&self, issue: &IssueDescriptor) -> AutodevResult<SessionRecord> {
        let route = self.routing.route(issue).await?;
        let directive = issue
            .description
            .as_deref()
            .map(OverrideDirective::parse)
            .unwrap_or_default();

        let lock = self.status_lock(&issue.identifier).await;
        let _guard = lock.lock().await;

        let session = self
            .sessions
            .create_session(NewSession {
                issue_id: issue.identifier.clone(),
                repository: route.repository.id.clone(),
                worktree_path: None,
                cleanup_policy: self.config.cleanup_policy,
            })
            .await?;
        let session_id = session.session_id.clone();
        let started = self.clock.now();

        info!(issue = %issue.identifier, repository = %route.repository.id, "processing issue");

        let worktree = match self
            .worktrees
            .create(
                &issue.identifier,
                &route.repository.path,
                &route.repository.base_branch,
                route.worktree_mode,
                None,
            )
            .await
        {
            Ok(worktree) => worktree,
            Err(e) => {
                return self
                    .finish_failure(issue, &session_id, None, AutodevError::from(e))
                    .await;
            }
        };

        let _ = self
            .sessions
            .set_worktree(&session_id, worktree.path.clone())
            .await;
        let _ = self.sessions.track_process(&session_id, None).await;

        match self
            .execute_with_failover(issue, &route, &directive, &session_id, &worktree)
            .await
        {
            Ok(result) => {
                if let Err(e) = self.verify(&issue.identifier, &result, &worktree).await {
                    return self.finish_failure(issue, &session_id, Some(&worktree), e).await;
                }

                let final_commit = result
                    .commits
                    .iter()
                    .rev()
                    .find(|c| c.message.contains(issue.identifier.as_str()))
                    .map(|c| c.sha.clone());
                let record = self
                    .sessions
                    .complete(&session_id, "verified", final_commit)
                    .await?;

                let duration = self.clock.now().duration_since(started);
                if let Err(e) = self
                    .reporter
                    .report_success(SuccessReport {
                        issue: &issue.identifier,
                        duration,
                        provider: result.provider,
                        commits: &result.commits,
                        files_touched: &result.files_touched,
                        worktree_path: Some(&worktree.path),
                    })
                    .await
                {
                    warn!(issue = %issue.identifier, error = %e, "success report failed");
                }

                if let Err(e) = self.worktrees.cleanup(&issue.identifier, true).await {
                    warn!(issue = %issue.identifier, error = %e, "worktree cleanup failed");
                }
                if let Err(e) = self.sessions.apply_cleanup_policy(&session_id).await {
                    warn!(issue = %issue.identifier, error = %e, "session cleanup failed");
                }

                info!(issue = %issue.identifier, "issue completed");
                Ok(record)
            }
            Err(e) => self.finish_failure(issue, &session_id, Some(&worktree), e).await,
        }
    }

    /// Try providers in rank order, each wrapped in the retry engine, until
    /// one produces a result or the attempt budget is spent.
    async fn execute_with_failover(
        &self,
        issue: &IssueDescriptor,
        route: &Route,
        directive: &OverrideDirective,
        session_id: &SessionId,
        worktree: &WorktreeInfo,
    ) -> AutodevResult<ExecutionResult> {
        let prompt = build_prompt(issue);
        let exec_context = ExecutionContext {
            issue_id: issue.identifier.clone(),
            session_id: session_id.clone(),
            worktree_path: worktree.path.clone(),
            timeout: self.config.execution_timeout,
        };

        let preferred = directive.provider.or(route.provider);
        let mut tried: Vec<ProviderKind> = Vec::new();
        let mut last_error: Option<AutodevError> = None;

        for attempt in 0..self.config.max_provider_attempts {
            let provider = match self.pick_provider(attempt, preferred, &tried).await {
                Ok(provider) => provider,
                Err(e) => return Err(last_error.unwrap_or(e)),
            };
            let kind = provider.kind;

            let executor = self.executors.executor_for(&provider);
            let breakers = Arc::clone(self.router.breakers());
            let retry_context =
                RetryContext::new("execute").with_provider(kind.as_str());

            let outcome = with_retry(
                self.clock.as_ref(),
                &self.config.retry,
                &retry_context,
                Some(self.router.as_ref() as &dyn crate::retry::HealthRefresh),
                |_| {
                    let executor = Arc::clone(&executor);
                    let breakers = Arc::clone(&breakers);
                    let prompt = prompt.clone();
                    let exec_context = exec_context.clone();
                    let model = directive.model.clone();
                    async move {
                        match executor.execute(&prompt, &exec_context, model.as_deref()).await {
                            Ok(result) => {
                                if let Err(e) = breakers.record_success(kind).await {
                                    warn!(provider = %kind, error = %e, "breaker persistence failed");
                                }
                                Ok(result)
                            }
                            Err(err) => {
                                if let Err(e) = breakers.record_failure(kind).await {
                                    warn!(provider = %kind, error = %e, "breaker persistence failed");
                                }
                                Err(err)
                            }
                        }
                    }
                },
            )
            .await;

            match outcome.result {
                Ok(result) => return Ok(result),
                Err(err) => {
                    let fatal = matches!(err, ExecutorError::SessionFailed { .. });
                    let mapped = map_executor_error(kind, err);
                    if fatal {
                        // Non-retryable failures surface immediately; another
                        // provider would hit the same wall.
                        return Err(mapped);
                    }

                    warn!(
                        issue = %issue.identifier,
                        provider = %kind,
                        attempts = outcome.attempts,
                        error = %mapped,
                        "provider failed, switching"
                    );
                    tried.push(kind);
                    last_error = Some(mapped);

                    // Linear pause between provider switches.
                    self.clock
                        .sleep(Duration::from_secs(1) * (attempt + 1))
                        .await;
                }
            }
        }

        Err(last_error.unwrap_or(AutodevError::NoHealthyProviders))
    }

    /// Provider for this attempt: the override when its breaker permits,
    /// otherwise the router's ranking minus already-failed providers.
    async fn pick_provider(
        &self,
        attempt: u32,
        preferred: Option<ProviderKind>,
        tried: &[ProviderKind],
    ) -> AutodevResult<ProviderConfig> {
        if attempt == 0 {
            if let Some(kind) = preferred {
                if let Some(config) = self.router.provider_config(kind).await {
                    let admitted = self
                        .router
                        .breakers()
                        .allow_request(kind)
                        .await
                        .map_err(AutodevError::Persistence)?;
                    if admitted {
                        return Ok(config);
                    }
                    warn!(provider = %kind, "override provider breaker-blocked, falling back to router");
                }
            }
        }

        self.router.select_provider_excluding(tried).await
    }

    /// A result qualifies when at least one commit references the issue id
    /// and the working copy is clean afterwards.
    async fn verify(
        &self,
        issue: &IssueId,
        result: &ExecutionResult,
        worktree: &WorktreeInfo,
    ) -> AutodevResult<()> {
        let references_issue = result
            .commits
            .iter()
            .any(|c| c.message.contains(issue.as_str()));
        if !references_issue {
            return Err(AutodevError::VerificationFailed {
                message: format!("no commit message references {issue}"),
            });
        }

        let clean = self.worktrees.is_clean(&worktree.path).await?;
        if !clean {
            return Err(AutodevError::VerificationFailed {
                message: "working copy has uncommitted changes after execution".to_string(),
            });
        }

        Ok(())
    }

    /// Terminalize a failed pipeline: session to ERROR, failure report,
    /// worktree retained.
    async fn finish_failure(
        &self,
        issue: &IssueDescriptor,
        session_id: &SessionId,
        worktree: Option<&WorktreeInfo>,
        error: AutodevError,
    ) -> AutodevResult<SessionRecord> {
        warn!(
            issue = %issue.identifier,
            error_type = error.error_type(),
            error = %error,
            "issue failed"
        );

        if let Err(e) = self.sessions.fail(session_id, error.to_string()).await {
            warn!(issue = %issue.identifier, error = %e, "failed to persist session error state");
        }

        let detail = format!("{error:#?}");
        if let Err(e) = self
            .reporter
            .report_failure(FailureReport {
                issue: &issue.identifier,
                error: &error.to_string(),
                detail: Some(&detail),
                worktree_path: worktree.map(|w| w.path.as_path()),
            })
            .await
        {
            warn!(issue = %issue.identifier, error = %e, "failure report failed");
        }

        if let Err(e) = self.worktrees.cleanup(&issue.identifier, false).await {
            warn!(issue = %issue.identifier, error = %e, "worktree cleanup failed");
        }

        Err(error)
    }

    async fn status_lock(&self, issue: &IssueId) -> Arc<Mutex<()>> {
        let mut locks = self.status_locks.lock().await;
        Arc::clone(
            locks
                .entry(issue.clone())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

/// The prompt is the issue content verbatim; prompt authoring is out of
/// scope.
fn build_prompt(issue: &IssueDescriptor) -> String {
    match &issue.description {
        Some(description) => format!("{}\n\n{}", issue.title, description),
        None => issue.title.clone(),
    }
}

fn map_executor_error(kind: ProviderKind, err: ExecutorError) -> AutodevError {
    match err {
        ExecutorError::Timeout { elapsed_ms } => AutodevError::Timeout {
            operation: "execute".to_string(),
            elapsed_ms,
        },
        ExecutorError::ProviderUnavailable { message, .. } => AutodevError::ProviderUnavailable {
            provider: kind.as_str().to_string(),
            message,
        },
        ExecutorError::SessionFailed { message } => AutodevError::SessionFailed { message },
        ExecutorError::Unknown { message } => AutodevError::SessionFailed { message },
    }
}

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;
