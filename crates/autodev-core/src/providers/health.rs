//! Provider health probing and the periodic health monitor.
//!
//! A probe is a minimal authenticated request to the provider's base
//! endpoint: anything below 500 counts as alive, auth rejections are
//! reported as credential problems. The monitor sweeps all enabled
//! providers on a cadence and mutates a durable status file for external
//! consumers; a provider is only marked unhealthy there after three
//! consecutive failed probes.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::kind::{ProviderConfig, ProviderKind};
use super::router::ProviderRouter;
use crate::clock::Clock;
use crate::store::{PersistenceError, StateStore};
use crate::Timestamp;

/// Store key for the monitor's durable output.
const STATUS_KEY: &str = "providers/status.json";

/// Cached health for one provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub healthy: bool,
    pub last_check: Timestamp,

    /// Probe round-trip in milliseconds, when the probe got a response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    #[serde(default)]
    pub consecutive_errors: u32,
}

// ============================================================================
// Probe
// ============================================================================

/// Liveness probe against a provider's base endpoint.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    client: reqwest::Client,
    timeout: Duration,
}

impl HealthProbe {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(5))
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    /// Probe one provider and report the observation.
    pub async fn probe(&self, provider: &ProviderConfig, clock: &dyn Clock) -> ProviderHealth {
        let started = std::time::Instant::now();
        let request = self
            .client
            .head(provider.endpoint())
            .timeout(self.timeout);
        let request = apply_credential(request, provider);

        let checked_at = clock.now();
        match request.send().await {
            Ok(response) => {
                let latency = started.elapsed();
                let status = response.status().as_u16();
                match status {
                    401 | 403 => ProviderHealth {
                        healthy: false,
                        last_check: checked_at,
                        latency_ms: Some(latency.as_millis() as u64),
                        last_error: Some("Invalid API key".to_string()),
                        consecutive_errors: 0,
                    },
                    s if s < 500 => ProviderHealth {
                        healthy: true,
                        last_check: checked_at,
                        latency_ms: Some(latency.as_millis() as u64),
                        last_error: None,
                        consecutive_errors: 0,
                    },
                    s => ProviderHealth {
                        healthy: false,
                        last_check: checked_at,
                        latency_ms: Some(latency.as_millis() as u64),
                        last_error: Some(format!("HTTP {s}")),
                        consecutive_errors: 0,
                    },
                }
            }
            Err(e) => ProviderHealth {
                healthy: false,
                last_check: checked_at,
                latency_ms: None,
                last_error: Some(e.to_string()),
                consecutive_errors: 0,
            },
        }
    }
}

impl Default for HealthProbe {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_credential(
    request: reqwest::RequestBuilder,
    provider: &ProviderConfig,
) -> reqwest::RequestBuilder {
    match provider.kind {
        ProviderKind::Anthropic => request.header("x-api-key", &provider.credential),
        ProviderKind::OpenAi | ProviderKind::Ollama => {
            request.header("Authorization", format!("Bearer {}", provider.credential))
        }
    }
}

// ============================================================================
// Monitor
// ============================================================================

/// Health monitor tuning.
#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    /// Sweep cadence
    pub interval: Duration,

    /// Consecutive failed probes before a provider is reported unhealthy
    pub unhealthy_after: u32,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            unhealthy_after: 3,
        }
    }
}

/// Durable output of the monitor, one entry per enabled provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthStatusFile {
    pub updated_at: Option<Timestamp>,
    pub providers: BTreeMap<String, ProviderHealth>,
}

/// Independent periodic sweep over all enabled providers.
///
/// Runs besides the router's on-demand health cache; its output is the
/// `providers/status.json` document external tooling reads.
pub struct HealthMonitor {
    store: StateStore,
    clock: Arc<dyn Clock>,
    probe: HealthProbe,
    router: Arc<ProviderRouter>,
    config: HealthMonitorConfig,
    consecutive: Mutex<HashMap<ProviderKind, u32>>,
}

impl HealthMonitor {
    pub fn new(
        store: StateStore,
        clock: Arc<dyn Clock>,
        router: Arc<ProviderRouter>,
        config: HealthMonitorConfig,
    ) -> Self {
        Self {
            store,
            clock,
            probe: HealthProbe::new(),
            router,
            config,
            consecutive: Mutex::new(HashMap::new()),
        }
    }

    /// Run sweeps until the shutdown signal flips.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            debug!("health monitor stopping");
                            break;
                        }
                    }
                    _ = self.clock.sleep(self.config.interval) => {
                        if let Err(e) = self.run_sweep().await {
                            warn!(error = %e, "health sweep failed to persist");
                        }
                    }
                }
            }
        })
    }

    /// One probe pass over every enabled provider, folded into the durable
    /// status file.
    pub async fn run_sweep(&self) -> Result<(), PersistenceError> {
        let providers = self.router.enabled_providers().await;
        let mut counters = self.consecutive.lock().await;
        let mut entries = BTreeMap::new();

        for provider in &providers {
            let mut health = self.probe.probe(provider, self.clock.as_ref()).await;

            let counter = counters.entry(provider.kind).or_insert(0);
            if health.healthy {
                *counter = 0;
            } else {
                *counter += 1;
            }
            health.consecutive_errors = *counter;

            debug!(
                provider = %provider.kind,
                probe_ok = health.healthy,
                consecutive = *counter,
                "health sweep probe"
            );

            // External consumers only see unhealthy after repeated failures;
            // one flaky probe must not flap the status file.
            health.healthy = *counter < self.config.unhealthy_after;

            entries.insert(provider.kind.as_str().to_string(), health);
        }

        let file = HealthStatusFile {
            updated_at: Some(self.clock.now()),
            providers: entries,
        };
        self.store.write_json(STATUS_KEY, &file).await
    }
}

#[cfg(test)]
#[path = "health_tests.rs"]
mod tests;
