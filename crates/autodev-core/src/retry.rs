//! # Retry Engine
//!
//! Classifies errors and runs a retryable operation with exponential
//! backoff, honoring server-supplied hints.
//!
//! The engine never throws past its boundary: callers receive a
//! [`RetryOutcome`] record and branch on it. Classification happens through
//! the [`RetryClassify`] trait so the string-matching fallback stays out of
//! the hot path for errors that already know their class.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::clock::Clock;

/// Classification of an error for retry purposes.
///
/// `Unknown` is treated as non-retryable: retrying an unclassified failure
/// risks duplicate side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    NonRetryable,
    Unknown,
}

/// Implemented by error types the retry engine can run against.
pub trait RetryClassify: std::fmt::Display {
    /// Classify the error.
    fn error_class(&self) -> ErrorClass;

    /// Server-supplied wait hint, when the error carries one
    /// (a `Retry-After` header value or a numeric match in the message).
    ///
    /// The default looks for a numeric match in the rendered message;
    /// implementors that capture a structured `Retry-After` value override
    /// this and may still fall back to [`hint_from_message`].
    fn retry_hint(&self) -> Option<Duration> {
        hint_from_message(&self.to_string())
    }
}

/// Hook invoked when retries are exhausted against a provider, so the next
/// caller re-probes instead of trusting a stale health cache.
#[async_trait]
pub trait HealthRefresh: Send + Sync {
    async fn force_health_refresh(&self);
}

// ============================================================================
// Configuration
// ============================================================================

/// Retry configuration.
///
/// Delay before attempt `n + 1` is `min(max_delay, base_delay * multiplier^n)`
/// unless the error carries a server hint, which wins (capped at `max_delay`).
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the initial attempt
    pub max_retries: u32,

    /// Initial delay before the first retry
    pub base_delay: Duration,

    /// Cap on any single delay
    pub max_delay: Duration,

    /// Exponential growth factor
    pub multiplier: f64,

    /// Additional engine-specific message tags treated as retryable
    pub extra_retryable_tags: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            extra_retryable_tags: Vec::new(),
        }
    }
}

impl RetryConfig {
    /// Backoff delay before retry number `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(base.min(self.max_delay.as_secs_f64()))
    }

    /// Cap a server-supplied hint at the configured maximum.
    pub fn cap_hint(&self, hint: Duration) -> Duration {
        hint.min(self.max_delay)
    }
}

/// Identifies the operation (and optionally the provider) for logs and the
/// exhaustion hook.
#[derive(Debug, Clone, Default)]
pub struct RetryContext {
    pub operation: String,
    pub provider: Option<String>,
}

impl RetryContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            provider: None,
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }
}

// ============================================================================
// Outcome Record
// ============================================================================

/// Result record returned by [`with_retry`].
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// Final result: the data, or the last error observed
    pub result: Result<T, E>,

    /// Total attempts made (initial attempt included)
    pub attempts: u32,

    /// Whether any retry happened
    pub was_retried: bool,

    /// Wall-clock duration across all attempts and sleeps
    pub total_duration: Duration,

    /// The delay slept before each retry, in order
    pub delays: Vec<Duration>,
}

impl<T, E> RetryOutcome<T, E> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

// ============================================================================
// Engine
// ============================================================================

/// Run `operation` up to `1 + max_retries` times with exponential backoff.
///
/// The closure receives the 0-based attempt number. Non-retryable and
/// unknown-class errors abort immediately. On final exhaustion with a
/// provider in the context, the optional `router` hook is poked so the next
/// caller re-probes provider health.
pub async fn with_retry<T, E, F, Fut>(
    clock: &dyn Clock,
    config: &RetryConfig,
    context: &RetryContext,
    router: Option<&dyn HealthRefresh>,
    mut operation: F,
) -> RetryOutcome<T, E>
where
    E: RetryClassify,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let started = clock.now();
    let mut delays = Vec::new();
    let mut attempt: u32 = 0;

    loop {
        match operation(attempt).await {
            Ok(data) => {
                return RetryOutcome {
                    result: Ok(data),
                    attempts: attempt + 1,
                    was_retried: attempt > 0,
                    total_duration: clock.now().duration_since(started),
                    delays,
                };
            }
            Err(err) => {
                let class = effective_class(&err, &config.extra_retryable_tags);
                let exhausted = attempt >= config.max_retries;

                if class != ErrorClass::Retryable || exhausted {
                    if exhausted && class == ErrorClass::Retryable {
                        warn!(
                            operation = %context.operation,
                            provider = context.provider.as_deref(),
                            attempts = attempt + 1,
                            error = %err,
                            "retries exhausted"
                        );
                        if context.provider.is_some() {
                            if let Some(router) = router {
                                router.force_health_refresh().await;
                            }
                        }
                    } else {
                        debug!(
                            operation = %context.operation,
                            error = %err,
                            "non-retryable error, aborting"
                        );
                    }

                    return RetryOutcome {
                        result: Err(err),
                        attempts: attempt + 1,
                        was_retried: attempt > 0,
                        total_duration: clock.now().duration_since(started),
                        delays,
                    };
                }

                let delay = match err.retry_hint() {
                    Some(hint) => config.cap_hint(hint),
                    None => config.delay_for_attempt(attempt),
                };

                debug!(
                    operation = %context.operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retrying after backoff"
                );

                delays.push(delay);
                clock.sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

fn effective_class<E: RetryClassify>(err: &E, extra_tags: &[String]) -> ErrorClass {
    match err.error_class() {
        ErrorClass::Unknown => {
            // Fall back to message inspection for errors that carry no class
            // of their own, then stay conservative.
            match classify_message(&err.to_string(), extra_tags) {
                ErrorClass::Unknown => ErrorClass::NonRetryable,
                class => class,
            }
        }
        class => class,
    }
}

// ============================================================================
// Classification helpers
// ============================================================================

const NON_RETRYABLE_PHRASES: &[&str] = &[
    "verification failed",
    "merge conflict",
    "invalid api key",
    "prompt too long",
    "failed to create session",
    "failed to send prompt",
];

const RETRYABLE_PHRASES: &[&str] = &[
    "rate limit",
    "timed out",
    "timeout",
    "connection reset",
    "connection refused",
    "connection closed",
    "dns error",
    "temporary failure in name resolution",
];

/// Classify an HTTP status code.
pub fn classify_status(status: u16) -> ErrorClass {
    match status {
        400 | 401 | 403 => ErrorClass::NonRetryable,
        408 | 429 | 500 | 502 | 503 | 504 => ErrorClass::Retryable,
        _ => ErrorClass::Unknown,
    }
}

/// Classify an error message by phrase matching.
///
/// Non-retryable phrases win over retryable ones: a message mentioning both
/// a merge conflict and a timeout must not be replayed.
pub fn classify_message(message: &str, extra_tags: &[String]) -> ErrorClass {
    let lower = message.to_lowercase();

    if NON_RETRYABLE_PHRASES.iter().any(|p| lower.contains(p)) {
        return ErrorClass::NonRetryable;
    }

    if RETRYABLE_PHRASES.iter().any(|p| lower.contains(p)) {
        return ErrorClass::Retryable;
    }

    if extra_tags
        .iter()
        .any(|t| !t.is_empty() && lower.contains(&t.to_lowercase()))
    {
        return ErrorClass::Retryable;
    }

    ErrorClass::Unknown
}

/// Extract a numeric retry hint (in seconds) from an error message, e.g.
/// `"rate limited, retry after 2"` or a relayed `Retry-After: 2` header.
pub fn hint_from_message(message: &str) -> Option<Duration> {
    let lower = message.to_lowercase();
    let idx = lower.find("retry after").map(|i| i + "retry after".len())
        .or_else(|| lower.find("retry-after").map(|i| i + "retry-after".len()))?;

    let rest = &lower[idx..];
    let digits: String = rest
        .chars()
        .skip_while(|c| *c == ':' || c.is_whitespace())
        .take_while(|c| c.is_ascii_digit())
        .collect();

    digits.parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
