//! # Execution Providers
//!
//! Everything about the remote model-backed execution services: the
//! provider enumeration and per-provider configuration, health probing and
//! the periodic health monitor, the priority router, OAuth token
//! management, and the agent executor that drives a provider to produce
//! commits.

mod executor;
mod health;
mod kind;
mod router;
mod tokens;

pub use executor::{
    AgentExecutor, CommitInfo, ExecutionContext, ExecutionResult, ExecutorError,
    HttpAgentExecutor, ProbeResult, RateLimitSnapshot,
};
pub use health::{HealthMonitor, HealthMonitorConfig, HealthProbe, ProviderHealth};
pub use kind::{ProviderConfig, ProviderKind};
pub use router::ProviderRouter;
pub use tokens::{
    HttpTokenRefresher, OAuthToken, RefreshedToken, TokenManager, TokenRefreshError, TokenRefresher,
};
