//! # Circuit Breaker
//!
//! Per-provider three-state admission controller, persisted across restarts.
//!
//! A breaker in CLOSED passes requests and counts consecutive failures;
//! reaching the failure threshold opens it for the sleep window. Crossing
//! `next_retry_at` promotes OPEN to HALF_OPEN, which admits a bounded number
//! of concurrent trials: one failure re-opens, one success closes.
//!
//! All breakers share a single JSON document (`providers/state.json`).
//! Reads happen on construction; every transition writes through under a
//! global mutex, so the persisted state always equals the in-memory state
//! once a transition returns.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::Timestamp;

mod breaker;

pub use breaker::ProviderBreakers;

// ============================================================================
// State
// ============================================================================

/// Circuit state for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Circuit breaker tuning parameters.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the circuit
    pub failure_threshold: u32,

    /// How long an open circuit blocks admission
    pub sleep_window: Duration,

    /// Concurrent trial budget in half-open
    pub half_open_max_trials: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            sleep_window: Duration::from_secs(60),
            half_open_max_trials: 2,
        }
    }
}

// ============================================================================
// Persisted record
// ============================================================================

/// Durable state for one provider's breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitRecord {
    pub state: CircuitState,

    /// Consecutive failures in the current window
    pub consecutive_failures: u32,

    /// Total successes since the last open
    pub successes: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<Timestamp>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<Timestamp>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<Timestamp>,
}

impl Default for CircuitRecord {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            successes: 0,
            last_failure_at: None,
            opened_at: None,
            next_retry_at: None,
        }
    }
}
