//! # Routing Engine
//!
//! Matches an issue to a target repository, an optional preferred provider,
//! the admission mode, and the worktree mode.
//!
//! Matching precedence: labels, then project name (case-insensitive
//! substring), then team, then a `[repo=X]` tag in the description.
//! Pre-built lookup maps keep the label path proportional to the issue's
//! label count. Route results are cached per issue and the cache is
//! invalidated atomically on configuration reload, so a stale repository
//! path is never executed.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::providers::ProviderKind;
use crate::{AutodevError, IssueDescriptor, IssueId, ParseError};

// ============================================================================
// Modes and configuration
// ============================================================================

/// How the working copy for an issue is materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorktreeMode {
    /// Wipe any existing copy, check out head of the base branch
    Fresh,
    /// Reuse a clean existing copy; fail busy when dirty
    Reuse,
    /// Pin the copy to a branch derived from the issue id
    BranchPerIssue,
}

impl Default for WorktreeMode {
    fn default() -> Self {
        Self::Fresh
    }
}

impl std::str::FromStr for WorktreeMode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fresh" => Ok(Self::Fresh),
            "reuse" => Ok(Self::Reuse),
            "branch-per-issue" | "branch_per_issue" => Ok(Self::BranchPerIssue),
            _ => Err(ParseError::InvalidFormat {
                expected: "fresh, reuse, or branch-per-issue".to_string(),
                actual: s.to_string(),
            }),
        }
    }
}

/// One routable repository from configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    /// Stable id referenced by `[repo=X]` tags
    pub id: String,

    /// Local clone the worktrees are created from
    pub path: PathBuf,

    /// Branch new worktrees start from
    #[serde(default = "default_base_branch")]
    pub base_branch: String,

    /// Labels that route to this repository
    #[serde(default)]
    pub labels: Vec<String>,

    /// Project names that route here (substring match)
    #[serde(default)]
    pub projects: Vec<String>,

    /// Team names that route here
    #[serde(default)]
    pub teams: Vec<String>,

    /// Preferred provider, overriding router priority
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderKind>,

    /// Worktree mode override for this repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_mode: Option<WorktreeMode>,
}

fn default_base_branch() -> String {
    "main".to_string()
}

/// Labels deciding auto versus deferred execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelRules {
    #[serde(default = "default_auto_labels")]
    pub auto_execute: Vec<String>,

    #[serde(default)]
    pub manual_execute: Vec<String>,
}

fn default_auto_labels() -> Vec<String> {
    vec!["auto".to_string()]
}

impl Default for LabelRules {
    fn default() -> Self {
        Self {
            auto_execute: default_auto_labels(),
            manual_execute: Vec::new(),
        }
    }
}

/// The computed route for one issue.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub repository: RepositoryConfig,

    /// Provider preference from the repository config, if any
    pub provider: Option<ProviderKind>,

    /// Whether the issue should execute without operator approval
    pub execute_now: bool,

    pub worktree_mode: WorktreeMode,
}

// ============================================================================
// Engine
// ============================================================================

struct EngineInner {
    repositories: Vec<RepositoryConfig>,
    by_label: HashMap<String, usize>,
    by_team: HashMap<String, usize>,
    by_id: HashMap<String, usize>,
    label_rules: LabelRules,
    default_mode: WorktreeMode,
}

impl EngineInner {
    fn build(
        repositories: Vec<RepositoryConfig>,
        label_rules: LabelRules,
        default_mode: WorktreeMode,
    ) -> Self {
        let mut by_label = HashMap::new();
        let mut by_team = HashMap::new();
        let mut by_id = HashMap::new();

        for (index, repo) in repositories.iter().enumerate() {
            for label in &repo.labels {
                by_label.insert(label.to_lowercase(), index);
            }
            for team in &repo.teams {
                by_team.insert(team.to_lowercase(), index);
            }
            by_id.insert(repo.id.to_lowercase(), index);
        }

        Self {
            repositories,
            by_label,
            by_team,
            by_id,
            label_rules,
            default_mode,
        }
    }

    fn match_repository(&self, issue: &IssueDescriptor) -> Option<usize> {
        // Labels win.
        for label in &issue.labels {
            if let Some(&index) = self.by_label.get(&label.to_lowercase()) {
                return Some(index);
            }
        }

        // Project name, case-insensitive substring in either direction.
        if let Some(project) = &issue.project {
            let project = project.to_lowercase();
            for (index, repo) in self.repositories.iter().enumerate() {
                for candidate in &repo.projects {
                    let candidate = candidate.to_lowercase();
                    if project.contains(&candidate) || candidate.contains(&project) {
                        return Some(index);
                    }
                }
            }
        }

        // Team.
        if let Some(team) = &issue.team {
            if let Some(&index) = self.by_team.get(&team.to_lowercase()) {
                return Some(index);
            }
        }

        // Explicit `[repo=X]` tag in the description.
        if let Some(description) = &issue.description {
            if let Some(tag) = extract_repo_tag(description) {
                if let Some(&index) = self.by_id.get(&tag.to_lowercase()) {
                    return Some(index);
                }
            }
        }

        None
    }
}

/// Issue-to-repository routing with a reload-invalidated cache.
pub struct RoutingEngine {
    inner: RwLock<EngineInner>,
    cache: Mutex<HashMap<(String, IssueId), Route>>,
}

impl RoutingEngine {
    pub fn new(
        repositories: Vec<RepositoryConfig>,
        label_rules: LabelRules,
        default_mode: WorktreeMode,
    ) -> Self {
        Self {
            inner: RwLock::new(EngineInner::build(repositories, label_rules, default_mode)),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Compute (or return the cached) route for `issue`.
    pub async fn route(&self, issue: &IssueDescriptor) -> Result<Route, AutodevError> {
        let cache_key = (issue.id.clone(), issue.identifier.clone());

        if let Some(route) = self.cache.lock().await.get(&cache_key) {
            return Ok(route.clone());
        }

        let inner = self.inner.read().await;
        let index = inner
            .match_repository(issue)
            .ok_or_else(|| AutodevError::NoMatch {
                issue: issue.identifier.clone(),
            })?;

        let repository = inner.repositories[index].clone();
        let execute_now = issue
            .labels
            .iter()
            .any(|l| inner.label_rules.auto_execute.iter().any(|a| a.eq_ignore_ascii_case(l)));
        let route = Route {
            provider: repository.provider,
            worktree_mode: repository.worktree_mode.unwrap_or(inner.default_mode),
            execute_now,
            repository,
        };
        drop(inner);

        debug!(
            issue = %issue.identifier,
            repository = %route.repository.id,
            execute_now = route.execute_now,
            "route computed"
        );

        self.cache.lock().await.insert(cache_key, route.clone());
        Ok(route)
    }

    /// Replace configuration and invalidate the route cache atomically.
    pub async fn reload(
        &self,
        repositories: Vec<RepositoryConfig>,
        label_rules: LabelRules,
        default_mode: WorktreeMode,
    ) {
        let mut inner = self.inner.write().await;
        *inner = EngineInner::build(repositories, label_rules, default_mode);
        self.cache.lock().await.clear();
    }

    /// Number of cached routes, exposed for tests and diagnostics.
    pub async fn cached_routes(&self) -> usize {
        self.cache.lock().await.len()
    }
}

/// Pull the value out of a `[repo=X]` tag, if the description carries one.
fn extract_repo_tag(description: &str) -> Option<String> {
    let start = description.find("[repo=")?;
    let rest = &description[start + "[repo=".len()..];
    let end = rest.find(']')?;
    let value = rest[..end].trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
#[path = "routing_tests.rs"]
mod tests;
