//! # Autodev Core
//!
//! Core orchestration logic for the Autodev autonomous coding-agent service.
//!
//! This crate contains the execution plane: routing issues to repositories,
//! selecting an execution provider behind health checks and circuit breakers,
//! materializing isolated git worktrees, driving the agent, verifying the
//! produced commits, and reporting the outcome to the upstream tracker.
//!
//! ## Architecture
//!
//! The core follows clean architecture principles:
//! - Business logic depends only on trait abstractions
//! - Infrastructure implementations are injected at runtime
//! - The clock, the HTTP client, and the tracker client are all replaceable
//!   in tests
//!
//! ## Usage
//!
//! ```rust
//! use autodev_core::{IssueId, Timestamp};
//!
//! let issue = IssueId::new("ABC-123").unwrap();
//! assert_eq!(issue.project_key(), "ABC");
//! let now = Timestamp::now();
//! assert!(now.add_seconds(60) > now);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

// Re-export commonly used types
pub use uuid::Uuid;

/// Standard result type for autodev operations
pub type AutodevResult<T> = Result<T, AutodevError>;

// ============================================================================
// Domain Identifier Types
// ============================================================================

/// Tracker-assigned issue identifier, e.g. `ABC-123`.
///
/// The identifier doubles as the key for sessions, worktrees, and routing
/// caches, so validation is strict: a project key of ASCII letters/digits, a
/// single hyphen, then the issue number.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IssueId(String);

impl IssueId {
    /// Create a new issue identifier with validation.
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();

        if value.is_empty() {
            return Err(ValidationError::Required {
                field: "issue_id".to_string(),
            });
        }

        if value.len() > 64 {
            return Err(ValidationError::TooLong {
                field: "issue_id".to_string(),
                max_length: 64,
            });
        }

        let mut parts = value.splitn(2, '-');
        let key = parts.next().unwrap_or_default();
        let number = parts.next().unwrap_or_default();

        let key_ok = !key.is_empty()
            && key.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
            && key.chars().all(|c| c.is_ascii_alphanumeric());
        let number_ok = !number.is_empty() && number.chars().all(|c| c.is_ascii_digit());

        if !key_ok || !number_ok {
            return Err(ValidationError::InvalidFormat {
                field: "issue_id".to_string(),
                message: "expected <PROJECT>-<NUMBER>, e.g. ABC-123".to_string(),
            });
        }

        Ok(Self(value))
    }

    /// Get string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The project key portion of the identifier (`ABC` in `ABC-123`).
    pub fn project_key(&self) -> &str {
        self.0.split('-').next().unwrap_or(&self.0)
    }

    /// The identifier as a directory name. Validation guarantees it is
    /// filesystem-safe (ASCII alphanumerics and one hyphen).
    pub fn as_path_component(&self) -> &str {
        &self.0
    }

    /// Deterministic branch name for branch-per-issue worktrees.
    pub fn branch_name(&self) -> String {
        format!("autodev/{}", self.0.to_ascii_lowercase())
    }
}

impl fmt::Display for IssueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for IssueId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Identifier for one execution attempt, derived from the issue identifier.
///
/// Sessions are keyed one-to-one with issues: at most one non-terminal
/// session exists per issue at any instant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Derive the session identifier for an issue.
    pub fn for_issue(issue: &IssueId) -> Self {
        Self(issue.as_str().to_string())
    }

    /// Get string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier for tracing one webhook/poll admission across the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Generate new correlation ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Issue Descriptor
// ============================================================================

/// An issue as handed to the orchestrator by ingress or poller.
///
/// Immutable for the duration of one execution. The description may carry
/// override directives (see the `directives` module); labels drive both
/// routing and admission policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueDescriptor {
    /// Tracker-internal opaque id (distinct from the human identifier)
    pub id: String,

    /// Human-readable identifier, e.g. `ABC-123`
    pub identifier: IssueId,

    /// Issue title
    pub title: String,

    /// Issue description; may contain override directives
    #[serde(default)]
    pub description: Option<String>,

    /// Label names attached to the issue
    #[serde(default)]
    pub labels: Vec<String>,

    /// Project name, when the tracker provides one
    #[serde(default)]
    pub project: Option<String>,

    /// Team name, when the tracker provides one
    #[serde(default)]
    pub team: Option<String>,

    /// Workflow state name (e.g. `Todo`, `In Progress`)
    #[serde(default)]
    pub state: Option<String>,
}

impl IssueDescriptor {
    /// Whether the issue carries a label with the given name (case-insensitive).
    pub fn has_label(&self, name: &str) -> bool {
        self.labels.iter().any(|l| l.eq_ignore_ascii_case(name))
    }
}

// ============================================================================
// Time Types
// ============================================================================

/// UTC timestamp persisted with all durable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current moment
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Wrap an existing chrono datetime.
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Parse timestamp from RFC3339 string
    pub fn from_rfc3339(s: &str) -> Result<Self, ParseError> {
        let dt = DateTime::parse_from_rfc3339(s)
            .map_err(|_| ParseError::InvalidFormat {
                expected: "RFC3339 datetime".to_string(),
                actual: s.to_string(),
            })?
            .with_timezone(&Utc);
        Ok(Self(dt))
    }

    /// Convert to RFC3339 string
    pub fn to_rfc3339(&self) -> String {
        self.0.to_rfc3339()
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Add seconds to timestamp
    pub fn add_seconds(&self, seconds: u64) -> Self {
        Self(self.0 + chrono::Duration::seconds(seconds as i64))
    }

    /// Add a std duration to the timestamp.
    pub fn add_duration(&self, duration: Duration) -> Self {
        let chrono_duration = chrono::Duration::from_std(duration).unwrap_or_default();
        Self(self.0 + chrono_duration)
    }

    /// Duration elapsed from `other` to `self`; zero when `other` is later.
    pub fn duration_since(&self, other: Self) -> Duration {
        self.0
            .signed_duration_since(other.0)
            .to_std()
            .unwrap_or_default()
    }

    /// Unix epoch seconds, used in archive file names.
    pub fn epoch_seconds(&self) -> i64 {
        self.0.timestamp()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// High-level error categorization for retry and alerting decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Temporary failures that should be retried
    Transient,
    /// Permanent failures that won't succeed on retry
    Permanent,
    /// Security-related failures requiring immediate attention
    Security,
    /// Configuration errors preventing startup
    Configuration,
}

/// Error type for input validation failures
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
pub enum ValidationError {
    #[error("Field '{field}' is required")]
    Required { field: String },

    #[error("Field '{field}' has invalid format: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Field '{field}' exceeds maximum length of {max_length}")]
    TooLong { field: String, max_length: usize },
}

/// Error type for string parsing failures
#[derive(Debug, Clone, thiserror::Error)]
pub enum ParseError {
    #[error("Invalid format: expected {expected}, got '{actual}'")]
    InvalidFormat { expected: String, actual: String },
}

/// Top-level error type for autodev operations.
///
/// Each variant corresponds to one tag in the error taxonomy surfaced in
/// logs and, selectively, HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum AutodevError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Authentication failed: {message}")]
    Auth { message: String },

    #[error("No repository route matched issue {issue}")]
    NoMatch { issue: IssueId },

    #[error("No healthy providers available")]
    NoHealthyProviders,

    #[error("Provider {provider} unavailable: {message}")]
    ProviderUnavailable { provider: String, message: String },

    #[error("Operation '{operation}' timed out after {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Session failed: {message}")]
    SessionFailed { message: String },

    #[error("Verification failed: {message}")]
    VerificationFailed { message: String },

    #[error("Worktree error: {0}")]
    Worktree(#[from] worktree::WorktreeError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] store::PersistenceError),

    #[error("Rate limited until {reset_at}")]
    RateLimited { reset_at: Timestamp },
}

impl From<session::SessionError> for AutodevError {
    fn from(err: session::SessionError) -> Self {
        match err {
            session::SessionError::Persistence(e) => Self::Persistence(e),
            other => Self::SessionFailed {
                message: other.to_string(),
            },
        }
    }
}

impl AutodevError {
    /// Check if the error is transient and should be retried.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::ProviderUnavailable { .. } => true,
            Self::Timeout { .. } => true,
            Self::RateLimited { .. } => true,
            Self::NoHealthyProviders => true,
            Self::Validation(_) => false,
            Self::Auth { .. } => false,
            Self::NoMatch { .. } => false,
            Self::SessionFailed { .. } => false,
            Self::VerificationFailed { .. } => false,
            Self::Worktree(_) => false,
            Self::Persistence(_) => false,
        }
    }

    /// Stable tag for the `errorType` field of structured log lines.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Validation(_) => "ValidationError",
            Self::Auth { .. } => "AuthError",
            Self::NoMatch { .. } => "NoMatch",
            Self::NoHealthyProviders => "NoHealthyProviders",
            Self::ProviderUnavailable { .. } => "ProviderUnavailable",
            Self::Timeout { .. } => "Timeout",
            Self::SessionFailed { .. } => "SessionFailed",
            Self::VerificationFailed { .. } => "VerificationFailed",
            Self::Worktree(_) => "WorktreeError",
            Self::Persistence(_) => "PersistenceError",
            Self::RateLimited { .. } => "RateLimited",
        }
    }

    /// Get error category for monitoring and alerting
    pub fn error_category(&self) -> ErrorCategory {
        match self {
            Self::Auth { .. } => ErrorCategory::Security,
            Self::Validation(_) | Self::NoMatch { .. } => ErrorCategory::Permanent,
            Self::VerificationFailed { .. } | Self::SessionFailed { .. } => ErrorCategory::Permanent,
            Self::Worktree(_) => ErrorCategory::Permanent,
            _ => ErrorCategory::Transient,
        }
    }
}

// ============================================================================
// Module declarations
// ============================================================================

/// Injectable time source used by all timeouts and backoffs
pub mod clock;

/// Persistent key-value store of per-entity JSON documents
pub mod store;

/// Retry engine with error classification and exponential backoff
pub mod retry;

/// Per-provider three-state circuit breaker with persistence
pub mod circuit_breaker;

/// Execution providers: kinds, health, routing, tokens, executor
pub mod providers;

/// Worktree lifecycle manager
pub mod worktree;

/// Session state machine with persistence
pub mod session;

/// Issue-to-repository routing engine
pub mod routing;

/// Override directive parsing from issue descriptions
pub mod directives;

/// Upstream tracker abstraction
pub mod tracker;

/// Terminal-state reporting to the upstream tracker
pub mod reporter;

/// The execution pipeline
pub mod orchestrator;

/// Background reconciliation poller
pub mod poller;

// Re-export key types for convenience
pub use circuit_breaker::{CircuitBreakerConfig, CircuitState, ProviderBreakers};
pub use clock::{Clock, ManualClock, SystemClock};
pub use directives::OverrideDirective;
pub use orchestrator::{ExecutorFactory, HttpExecutorFactory, Orchestrator, OrchestratorConfig};
pub use poller::{Poller, PollerConfig};
pub use retry::{with_retry, ErrorClass, RetryConfig, RetryContext, RetryOutcome};
pub use providers::{
    AgentExecutor, ExecutionContext, ExecutionResult, ExecutorError, HealthMonitor, ProviderConfig,
    ProviderHealth, ProviderKind, ProviderRouter, TokenManager,
};
pub use reporter::Reporter;
pub use routing::{RepositoryConfig, Route, RoutingEngine, WorktreeMode};
pub use session::{CleanupPolicy, SessionManager, SessionRecord, SessionState};
pub use store::StateStore;
pub use tracker::{TrackerClient, TrackerError};
pub use worktree::{WorktreeInfo, WorktreeManager};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
