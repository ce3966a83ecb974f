//! Provider selection behind health checks and circuit breakers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::health::{HealthProbe, ProviderHealth};
use super::kind::{ProviderConfig, ProviderKind};
use crate::circuit_breaker::ProviderBreakers;
use crate::clock::Clock;
use crate::retry::HealthRefresh;
use crate::{AutodevError, Timestamp};

/// How long a health refresh stays fresh.
const HEALTH_CACHE_TTL: Duration = Duration::from_secs(30);

/// Ranks enabled providers and selects the first healthy one whose circuit
/// breaker permits a request.
///
/// The health cache is refreshed concurrently for all providers when cold
/// or expired; `force_health_refresh` is write-through, so readers after it
/// always observe the fresh result.
pub struct ProviderRouter {
    clock: Arc<dyn Clock>,
    probe: HealthProbe,
    breakers: Arc<ProviderBreakers>,
    cache_ttl: Duration,
    inner: RwLock<RouterInner>,
}

struct RouterInner {
    providers: Vec<ProviderConfig>,
    health: HashMap<ProviderKind, ProviderHealth>,
    refreshed_at: Option<Timestamp>,
}

impl ProviderRouter {
    pub fn new(
        providers: Vec<ProviderConfig>,
        breakers: Arc<ProviderBreakers>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::with_probe(providers, breakers, clock, HealthProbe::new())
    }

    /// Construct with a custom probe (tests shorten the timeout).
    pub fn with_probe(
        mut providers: Vec<ProviderConfig>,
        breakers: Arc<ProviderBreakers>,
        clock: Arc<dyn Clock>,
        probe: HealthProbe,
    ) -> Self {
        providers.retain(|p| p.enabled);
        providers.sort_by_key(|p| p.priority);

        Self {
            clock,
            probe,
            breakers,
            cache_ttl: HEALTH_CACHE_TTL,
            inner: RwLock::new(RouterInner {
                providers,
                health: HashMap::new(),
                refreshed_at: None,
            }),
        }
    }

    /// Select the provider to execute with.
    ///
    /// Providers are consulted in priority order; the first that is healthy
    /// and admitted by its breaker wins. Fails with `NoHealthyProviders`
    /// when none qualifies.
    pub async fn select_provider(&self) -> Result<ProviderConfig, AutodevError> {
        self.select_provider_excluding(&[]).await
    }

    /// Like [`Self::select_provider`], skipping providers the caller has
    /// already failed against in this pipeline run.
    pub async fn select_provider_excluding(
        &self,
        exclude: &[ProviderKind],
    ) -> Result<ProviderConfig, AutodevError> {
        self.ensure_fresh_health().await;

        let inner = self.inner.read().await;
        for provider in &inner.providers {
            if exclude.contains(&provider.kind) {
                continue;
            }
            let healthy = inner
                .health
                .get(&provider.kind)
                .map(|h| h.healthy)
                .unwrap_or(false);
            if !healthy {
                debug!(provider = %provider.kind, "skipping unhealthy provider");
                continue;
            }

            let admitted = self
                .breakers
                .allow_request(provider.kind)
                .await
                .map_err(AutodevError::Persistence)?;
            if !admitted {
                debug!(provider = %provider.kind, "skipping breaker-blocked provider");
                continue;
            }

            return Ok(provider.clone());
        }

        warn!("no healthy providers available");
        Err(AutodevError::NoHealthyProviders)
    }

    /// Look up the configuration for one provider kind, if enabled.
    pub async fn provider_config(&self, kind: ProviderKind) -> Option<ProviderConfig> {
        let inner = self.inner.read().await;
        inner.providers.iter().find(|p| p.kind == kind).cloned()
    }

    /// All enabled providers in priority order.
    pub async fn enabled_providers(&self) -> Vec<ProviderConfig> {
        self.inner.read().await.providers.clone()
    }

    /// Current health cache contents.
    pub async fn health_snapshot(&self) -> HashMap<ProviderKind, ProviderHealth> {
        self.inner.read().await.health.clone()
    }

    /// The shared breaker registry.
    pub fn breakers(&self) -> &Arc<ProviderBreakers> {
        &self.breakers
    }

    /// Replace the provider set after a configuration reload, then refresh
    /// health for the new set.
    pub async fn reload_providers(&self, mut providers: Vec<ProviderConfig>) {
        providers.retain(|p| p.enabled);
        providers.sort_by_key(|p| p.priority);

        {
            let mut inner = self.inner.write().await;
            inner.providers = providers;
            inner.health.clear();
            inner.refreshed_at = None;
        }
        info!("provider configuration reloaded");
        self.refresh_all().await;
    }

    /// Refresh the health cache when cold or past its TTL.
    pub async fn ensure_fresh_health(&self) {
        let stale = {
            let inner = self.inner.read().await;
            match inner.refreshed_at {
                None => true,
                Some(at) => self.clock.now().duration_since(at) >= self.cache_ttl,
            }
        };

        if stale {
            self.refresh_all().await;
        }
    }

    /// Probe every enabled provider concurrently and replace the cache.
    async fn refresh_all(&self) {
        let providers = self.enabled_providers().await;

        let mut probes: JoinSet<(ProviderKind, ProviderHealth)> = JoinSet::new();
        for provider in providers {
            let probe = self.probe.clone();
            let clock = Arc::clone(&self.clock);
            probes.spawn(async move {
                let health = probe.probe(&provider, clock.as_ref()).await;
                (provider.kind, health)
            });
        }

        let mut health = HashMap::new();
        while let Some(result) = probes.join_next().await {
            if let Ok((kind, probe_result)) = result {
                health.insert(kind, probe_result);
            }
        }

        let mut inner = self.inner.write().await;
        inner.health = health;
        inner.refreshed_at = Some(self.clock.now());
    }
}

#[async_trait::async_trait]
impl HealthRefresh for ProviderRouter {
    /// Drop the cache and re-probe immediately.
    async fn force_health_refresh(&self) {
        {
            let mut inner = self.inner.write().await;
            inner.health.clear();
            inner.refreshed_at = None;
        }
        self.refresh_all().await;
    }
}

#[cfg(test)]
#[path = "router_tests.rs"]
mod tests;
