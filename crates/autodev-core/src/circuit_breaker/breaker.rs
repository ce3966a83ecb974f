//! Breaker registry covering every configured provider.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{CircuitBreakerConfig, CircuitRecord, CircuitState};
use crate::clock::Clock;
use crate::providers::ProviderKind;
use crate::store::{PersistenceError, StateStore};

/// Store key holding every provider's circuit state.
const STATE_KEY: &str = "providers/state.json";

/// All circuit breakers, backed by one persisted document.
///
/// Updates for one provider are totally ordered behind the registry mutex,
/// and the document is written before the mutex is released, so the
/// persisted state equals the in-memory state after every transition. The
/// half-open trial counter is runtime-only and intentionally not persisted.
pub struct ProviderBreakers {
    store: StateStore,
    clock: Arc<dyn Clock>,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

struct Inner {
    records: HashMap<ProviderKind, CircuitRecord>,
    half_open_in_flight: HashMap<ProviderKind, u32>,
}

impl ProviderBreakers {
    /// Load breaker state from disk, recovering whatever a previous process
    /// persisted.
    pub async fn load(
        store: StateStore,
        clock: Arc<dyn Clock>,
        config: CircuitBreakerConfig,
    ) -> Result<Self, PersistenceError> {
        let records: HashMap<ProviderKind, CircuitRecord> =
            store.read_json(STATE_KEY).await?.unwrap_or_default();

        if !records.is_empty() {
            info!(providers = records.len(), "recovered circuit breaker state");
        }

        Ok(Self {
            store,
            clock,
            config,
            inner: Mutex::new(Inner {
                records,
                half_open_in_flight: HashMap::new(),
            }),
        })
    }

    /// Whether a request to `provider` may proceed.
    ///
    /// An OPEN circuit whose sleep window has elapsed atomically promotes to
    /// HALF_OPEN; the caller that observed the promotion consumes the first
    /// trial slot.
    pub async fn allow_request(&self, provider: ProviderKind) -> Result<bool, PersistenceError> {
        let mut inner = self.inner.lock().await;
        let record = inner.records.entry(provider).or_default();

        match record.state {
            CircuitState::Closed => Ok(true),
            CircuitState::Open => {
                let now = self.clock.now();
                let due = record.next_retry_at.is_some_and(|at| now >= at);
                if !due {
                    return Ok(false);
                }

                record.state = CircuitState::HalfOpen;
                record.consecutive_failures = 0;
                record.next_retry_at = None;
                info!(provider = %provider, "circuit half-open, admitting trial");

                inner.half_open_in_flight.insert(provider, 1);
                self.store.write_json(STATE_KEY, &inner.records).await?;
                Ok(true)
            }
            CircuitState::HalfOpen => {
                let budget = self.config.half_open_max_trials;
                let in_flight = inner.half_open_in_flight.entry(provider).or_insert(0);
                if *in_flight >= budget {
                    return Ok(false);
                }
                *in_flight += 1;
                Ok(true)
            }
        }
    }

    /// Record a successful request against `provider`.
    ///
    /// A success during a half-open trial closes the circuit.
    pub async fn record_success(&self, provider: ProviderKind) -> Result<(), PersistenceError> {
        let mut inner = self.inner.lock().await;
        let record = inner.records.entry(provider).or_default();

        record.successes += 1;
        record.consecutive_failures = 0;

        if record.state == CircuitState::HalfOpen {
            record.state = CircuitState::Closed;
            record.opened_at = None;
            record.next_retry_at = None;
            info!(provider = %provider, "circuit closed after successful trial");
        }

        release_trial(&mut inner, provider);
        self.store.write_json(STATE_KEY, &inner.records).await
    }

    /// Record a failed request against `provider`.
    ///
    /// Reaching the failure threshold in CLOSED, or any failure in
    /// HALF_OPEN, opens the circuit and re-arms the sleep window.
    pub async fn record_failure(&self, provider: ProviderKind) -> Result<(), PersistenceError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        let threshold = self.config.failure_threshold;
        let record = inner.records.entry(provider).or_default();

        record.consecutive_failures += 1;
        record.last_failure_at = Some(now);

        let trip = match record.state {
            CircuitState::Closed => record.consecutive_failures >= threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if trip {
            record.state = CircuitState::Open;
            record.opened_at = Some(now);
            record.next_retry_at = Some(now.add_duration(self.config.sleep_window));
            warn!(
                provider = %provider,
                consecutive_failures = record.consecutive_failures,
                "circuit opened"
            );
        }

        release_trial(&mut inner, provider);
        self.store.write_json(STATE_KEY, &inner.records).await
    }

    /// Current state for one provider.
    pub async fn state(&self, provider: ProviderKind) -> CircuitState {
        let inner = self.inner.lock().await;
        inner
            .records
            .get(&provider)
            .map(|r| r.state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Snapshot of one provider's persisted record.
    pub async fn record(&self, provider: ProviderKind) -> CircuitRecord {
        let inner = self.inner.lock().await;
        inner.records.get(&provider).cloned().unwrap_or_default()
    }

    /// Snapshot of every provider's record, for health reporting.
    pub async fn snapshot(&self) -> HashMap<ProviderKind, CircuitRecord> {
        self.inner.lock().await.records.clone()
    }
}

fn release_trial(inner: &mut Inner, provider: ProviderKind) {
    if let Some(in_flight) = inner.half_open_in_flight.get_mut(&provider) {
        *in_flight = in_flight.saturating_sub(1);
    }
}

#[cfg(test)]
#[path = "breaker_tests.rs"]
mod tests;
