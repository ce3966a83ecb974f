//! Agent executor: drives one provider to produce code changes.
//!
//! The executor sends a single chat-completion request carrying a fixed
//! tool catalog (`git_commit`, `write_file`, `edit_file`) and folds the
//! response's tool calls into a structured result: commits made and paths
//! touched. It never interprets tool arguments beyond that.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, warn};

use super::kind::{ProviderConfig, ProviderKind};
use crate::retry::{classify_status, hint_from_message, ErrorClass, RetryClassify};
use crate::{IssueId, SessionId, Timestamp};

// ============================================================================
// Request / result types
// ============================================================================

/// Context for one execution attempt.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub issue_id: IssueId,
    pub session_id: SessionId,
    pub worktree_path: PathBuf,
    pub timeout: Duration,
}

/// A commit reported by the agent through the `git_commit` tool.
#[derive(Debug, Clone, PartialEq, serde::Serialize, Deserialize)]
pub struct CommitInfo {
    pub sha: String,
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<Timestamp>,
}

impl CommitInfo {
    /// First seven characters of the sha, for comment bodies.
    pub fn short_sha(&self) -> &str {
        if self.sha.len() > 7 {
            &self.sha[..7]
        } else {
            &self.sha
        }
    }
}

/// Structured outcome of one execution attempt.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Assistant text content, verbatim
    pub output: String,

    /// Paths touched via `write_file` / `edit_file`
    pub files_touched: Vec<String>,

    /// Commits recorded via `git_commit`
    pub commits: Vec<CommitInfo>,

    /// Wall-clock duration of the request
    pub duration: Duration,

    /// Provider that produced the result
    pub provider: ProviderKind,
}

/// Rate-limit observations from the most recent provider response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitSnapshot {
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset_at: Option<Timestamp>,
    pub retry_after: Option<Duration>,
}

impl RateLimitSnapshot {
    /// Parse the `x-ratelimit-*` family and `Retry-After` from response
    /// headers. Absent headers leave fields unset.
    pub fn from_headers(headers: &reqwest::header::HeaderMap) -> Self {
        let parse_u64 = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
        };

        let reset_at = parse_u64("x-ratelimit-reset")
            .and_then(|epoch| chrono::DateTime::from_timestamp(epoch as i64, 0))
            .map(Timestamp::from_datetime);

        Self {
            limit: parse_u64("x-ratelimit-limit"),
            remaining: parse_u64("x-ratelimit-remaining"),
            reset_at,
            retry_after: parse_u64("retry-after").map(Duration::from_secs),
        }
    }
}

/// Health probe result from a 1-token request.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub healthy: bool,
    pub latency: Duration,
    pub error: Option<String>,
}

// ============================================================================
// Errors
// ============================================================================

/// Executor failures, classified for the retry engine.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("Execution timed out after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Provider unavailable{}: {message}", status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    ProviderUnavailable {
        status: Option<u16>,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Session failed: {message}")]
    SessionFailed { message: String },

    #[error("Unknown executor error: {message}")]
    Unknown { message: String },
}

impl RetryClassify for ExecutorError {
    fn error_class(&self) -> ErrorClass {
        match self {
            Self::Timeout { .. } => ErrorClass::Retryable,
            Self::ProviderUnavailable { .. } => ErrorClass::Retryable,
            Self::SessionFailed { .. } => ErrorClass::NonRetryable,
            Self::Unknown { .. } => ErrorClass::Unknown,
        }
    }

    /// Prefer the structured `Retry-After` capture; otherwise scan the
    /// rendered message for a numeric hint.
    fn retry_hint(&self) -> Option<Duration> {
        match self {
            Self::ProviderUnavailable {
                retry_after: Some(hint),
                ..
            } => Some(*hint),
            other => hint_from_message(&other.to_string()),
        }
    }
}

// ============================================================================
// Contract
// ============================================================================

/// Driver for one execution provider.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Send `prompt` to the provider and collect the structured result.
    async fn execute(
        &self,
        prompt: &str,
        context: &ExecutionContext,
        model: Option<&str>,
    ) -> Result<ExecutionResult, ExecutorError>;

    /// 1-token liveness probe.
    async fn health_check(&self) -> ProbeResult;

    /// Rate-limit headers captured on the most recent response.
    fn rate_limits(&self) -> Option<RateLimitSnapshot>;
}

// ============================================================================
// HTTP implementation
// ============================================================================

/// Executor backed by an OpenAI-compatible chat completions API.
pub struct HttpAgentExecutor {
    client: reqwest::Client,
    provider: ProviderConfig,
    rate_limits: std::sync::Mutex<Option<RateLimitSnapshot>>,
}

impl HttpAgentExecutor {
    pub fn new(provider: ProviderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            provider,
            rate_limits: std::sync::Mutex::new(None),
        }
    }

    /// Which provider this executor drives.
    pub fn provider_kind(&self) -> ProviderKind {
        self.provider.kind
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.provider.endpoint().trim_end_matches('/'))
    }

    fn model_for(&self, requested: Option<&str>) -> String {
        requested
            .map(str::to_string)
            .or_else(|| self.provider.model.clone())
            .unwrap_or_else(|| default_model(self.provider.kind).to_string())
    }

    fn apply_credential(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.provider.kind {
            ProviderKind::Anthropic => request.header("x-api-key", &self.provider.credential),
            ProviderKind::OpenAi | ProviderKind::Ollama => request.header(
                "Authorization",
                format!("Bearer {}", self.provider.credential),
            ),
        }
    }

    fn capture_rate_limits(&self, headers: &reqwest::header::HeaderMap) {
        let snapshot = RateLimitSnapshot::from_headers(headers);
        *self.rate_limits.lock().expect("rate limit slot poisoned") = Some(snapshot);
    }

    fn build_system_prompt(context: &ExecutionContext) -> String {
        format!(
            "You are an autonomous coding agent working on issue {issue}.\n\
             The repository working copy is checked out at {path}.\n\
             Make the changes the issue requires, then record every commit \
             with the git_commit tool and every file you create or modify \
             with the write_file or edit_file tools. Commit messages must \
             reference {issue}.",
            issue = context.issue_id,
            path = context.worktree_path.display(),
        )
    }

    fn tool_catalog() -> serde_json::Value {
        json!([
            {
                "type": "function",
                "function": {
                    "name": "git_commit",
                    "description": "Record a commit made in the working copy",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "sha": { "type": "string" },
                            "message": { "type": "string" },
                            "author": { "type": "string" }
                        },
                        "required": ["sha", "message"]
                    }
                }
            },
            {
                "type": "function",
                "function": {
                    "name": "write_file",
                    "description": "Record a file created in the working copy",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "path": { "type": "string" },
                            "content": { "type": "string" }
                        },
                        "required": ["path"]
                    }
                }
            },
            {
                "type": "function",
                "function": {
                    "name": "edit_file",
                    "description": "Record a file modified in the working copy",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "path": { "type": "string" },
                            "patch": { "type": "string" }
                        },
                        "required": ["path"]
                    }
                }
            }
        ])
    }

    fn error_for_status(
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    ) -> ExecutorError {
        match classify_status(status) {
            ErrorClass::Retryable => ExecutorError::ProviderUnavailable {
                status: Some(status),
                message,
                retry_after,
            },
            ErrorClass::NonRetryable => ExecutorError::SessionFailed {
                message: format!("HTTP {status}: {message}"),
            },
            ErrorClass::Unknown => ExecutorError::Unknown {
                message: format!("HTTP {status}: {message}"),
            },
        }
    }
}

#[async_trait]
impl AgentExecutor for HttpAgentExecutor {
    async fn execute(
        &self,
        prompt: &str,
        context: &ExecutionContext,
        model: Option<&str>,
    ) -> Result<ExecutionResult, ExecutorError> {
        let started = std::time::Instant::now();

        let body = json!({
            "model": self.model_for(model),
            "messages": [
                { "role": "system", "content": Self::build_system_prompt(context) },
                { "role": "user", "content": prompt },
            ],
            "tools": Self::tool_catalog(),
        });

        debug!(
            issue = %context.issue_id,
            provider = %self.provider.kind,
            timeout_ms = context.timeout.as_millis() as u64,
            "sending execution request"
        );

        let request = self
            .client
            .post(self.completions_url())
            .timeout(context.timeout)
            .json(&body);

        let response = match self.apply_credential(request).send().await {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return Err(ExecutorError::Timeout {
                    elapsed_ms: started.elapsed().as_millis() as u64,
                });
            }
            Err(e) => {
                return Err(ExecutorError::ProviderUnavailable {
                    status: None,
                    message: e.to_string(),
                    retry_after: None,
                });
            }
        };

        self.capture_rate_limits(response.headers());
        let retry_after = RateLimitSnapshot::from_headers(response.headers()).retry_after;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!(provider = %self.provider.kind, status = status.as_u16(), "execution request failed");
            return Err(Self::error_for_status(status.as_u16(), message, retry_after));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| ExecutorError::SessionFailed {
            message: format!("unparseable provider response: {e}"),
        })?;

        let message = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| ExecutorError::SessionFailed {
                message: "provider response contained no choices".to_string(),
            })?;

        let mut commits = Vec::new();
        let mut files_touched = Vec::new();

        for call in message.tool_calls.unwrap_or_default() {
            match call.function.name.as_str() {
                "git_commit" => match serde_json::from_str::<CommitArgs>(&call.function.arguments) {
                    Ok(args) => commits.push(CommitInfo {
                        sha: args.sha,
                        message: args.message,
                        author: args.author,
                        date: args.date.and_then(|d| Timestamp::from_rfc3339(&d).ok()),
                    }),
                    Err(e) => warn!(error = %e, "malformed git_commit arguments ignored"),
                },
                "write_file" | "edit_file" => {
                    match serde_json::from_str::<FileArgs>(&call.function.arguments) {
                        Ok(args) => files_touched.push(args.path),
                        Err(e) => warn!(error = %e, "malformed file tool arguments ignored"),
                    }
                }
                other => debug!(tool = other, "unrecognized tool call ignored"),
            }
        }

        Ok(ExecutionResult {
            output: message.content.unwrap_or_default(),
            files_touched,
            commits,
            duration: started.elapsed(),
            provider: self.provider.kind,
        })
    }

    async fn health_check(&self) -> ProbeResult {
        let started = std::time::Instant::now();

        let body = json!({
            "model": self.model_for(None),
            "messages": [{ "role": "user", "content": "ping" }],
            "max_tokens": 1,
        });

        let request = self
            .client
            .post(self.completions_url())
            .timeout(Duration::from_secs(5))
            .json(&body);

        match self.apply_credential(request).send().await {
            Ok(response) => {
                self.capture_rate_limits(response.headers());
                let latency = started.elapsed();
                if response.status().is_success() {
                    ProbeResult {
                        healthy: true,
                        latency,
                        error: None,
                    }
                } else {
                    ProbeResult {
                        healthy: false,
                        latency,
                        error: Some(format!("HTTP {}", response.status().as_u16())),
                    }
                }
            }
            Err(e) => ProbeResult {
                healthy: false,
                latency: started.elapsed(),
                error: Some(e.to_string()),
            },
        }
    }

    fn rate_limits(&self) -> Option<RateLimitSnapshot> {
        self.rate_limits
            .lock()
            .expect("rate limit slot poisoned")
            .clone()
    }
}

fn default_model(kind: ProviderKind) -> &'static str {
    match kind {
        ProviderKind::Anthropic => "claude-3-5-sonnet-latest",
        ProviderKind::OpenAi => "gpt-4o",
        ProviderKind::Ollama => "llama3",
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    function: ToolFunction,
}

#[derive(Debug, Deserialize)]
struct ToolFunction {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct CommitArgs {
    sha: String,
    message: String,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FileArgs {
    path: String,
}

#[cfg(test)]
#[path = "executor_tests.rs"]
mod tests;
