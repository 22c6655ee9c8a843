//! Per-provider health bookkeeping fed by the router.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::warn;

/// Provider health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone)]
pub struct HealthPolicy {
    /// Consecutive channel failures before a provider is taken out of routing.
    pub failure_threshold: u32,
    /// How long an unhealthy provider is skipped before a probe is allowed.
    pub cooldown: Duration,
    /// Success rate under which a provider reports `Degraded`.
    pub degraded_success_rate: f64,
    pub min_samples: u64,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            degraded_success_rate: 0.85,
            min_samples: 10,
        }
    }
}

impl HealthPolicy {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            failure_threshold: std::env::var("PROVIDER_FAILURE_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.failure_threshold),
            cooldown: std::env::var("PROVIDER_COOLDOWN_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.cooldown),
            ..defaults
        }
    }
}

/// One health observation recorded after each provider call.
#[derive(Debug, Clone)]
pub struct HealthSample {
    pub ok: bool,
    pub latency: Duration,
    pub failure_reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProviderMetrics {
    pub provider: String,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_requests: u64,
    pub consecutive_failures: u32,
    pub last_latency: Option<Duration>,
    pub last_failure_reason: Option<String>,
    pub last_request_at: Option<Instant>,
    pub last_failure_at: Option<Instant>,
}

impl ProviderMetrics {
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            success_count: 0,
            failure_count: 0,
            total_requests: 0,
            consecutive_failures: 0,
            last_latency: None,
            last_failure_reason: None,
            last_request_at: None,
            last_failure_at: None,
        }
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 1.0;
        }
        self.success_count as f64 / self.total_requests as f64
    }

    pub fn record(&mut self, sample: &HealthSample, now: Instant) {
        self.total_requests += 1;
        self.last_latency = Some(sample.latency);
        self.last_request_at = Some(now);

        if sample.ok {
            self.success_count += 1;
            self.consecutive_failures = 0;
        } else {
            self.failure_count += 1;
            self.consecutive_failures += 1;
            self.last_failure_at = Some(now);
            self.last_failure_reason = sample.failure_reason.clone();
        }
    }

    pub fn health(&self, policy: &HealthPolicy, now: Instant) -> ProviderHealth {
        if self.consecutive_failures >= policy.failure_threshold {
            let cooling = self
                .last_failure_at
                .map(|at| now.duration_since(at) < policy.cooldown)
                .unwrap_or(false);
            if cooling {
                return ProviderHealth::Unhealthy;
            }
        }

        if self.total_requests >= policy.min_samples
            && self.success_rate() < policy.degraded_success_rate
        {
            return ProviderHealth::Degraded;
        }

        ProviderHealth::Healthy
    }
}

/// Point-in-time view of one provider, as exposed on the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealthReport {
    pub provider: String,
    pub status: ProviderHealth,
    pub success_rate: f64,
    pub total_requests: u64,
    pub consecutive_failures: u32,
    pub last_latency_ms: Option<u128>,
    pub last_failure_reason: Option<String>,
}

impl ProviderHealthReport {
    /// A configured provider that has not been called yet.
    pub fn unobserved(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            status: ProviderHealth::Healthy,
            success_rate: 1.0,
            total_requests: 0,
            consecutive_failures: 0,
            last_latency_ms: None,
            last_failure_reason: None,
        }
    }
}

#[derive(Clone)]
pub struct ProviderHealthRegistry {
    metrics: Arc<RwLock<HashMap<String, ProviderMetrics>>>,
    policy: HealthPolicy,
}

impl ProviderHealthRegistry {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            metrics: Arc::new(RwLock::new(HashMap::new())),
            policy,
        }
    }

    pub async fn record(&self, provider: &str, sample: HealthSample) {
        let mut metrics = self.metrics.write().await;
        let entry = metrics
            .entry(provider.to_string())
            .or_insert_with(|| ProviderMetrics::new(provider));
        let before = entry.health(&self.policy, Instant::now());
        entry.record(&sample, Instant::now());
        let after = entry.health(&self.policy, Instant::now());

        if before != ProviderHealth::Unhealthy && after == ProviderHealth::Unhealthy {
            warn!(
                provider = %provider,
                consecutive_failures = entry.consecutive_failures,
                reason = ?entry.last_failure_reason,
                "provider marked unhealthy"
            );
        }
    }

    pub async fn health(&self, provider: &str) -> ProviderHealth {
        self.metrics
            .read()
            .await
            .get(provider)
            .map(|m| m.health(&self.policy, Instant::now()))
            .unwrap_or(ProviderHealth::Healthy)
    }

    pub async fn snapshot(&self) -> Vec<ProviderMetrics> {
        let mut all: Vec<ProviderMetrics> = self.metrics.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.provider.cmp(&b.provider));
        all
    }

    pub async fn report(&self) -> Vec<ProviderHealthReport> {
        let now = Instant::now();
        self.snapshot()
            .await
            .into_iter()
            .map(|m| ProviderHealthReport {
                status: m.health(&self.policy, now),
                success_rate: m.success_rate(),
                total_requests: m.total_requests,
                consecutive_failures: m.consecutive_failures,
                last_latency_ms: m.last_latency.map(|d| d.as_millis()),
                last_failure_reason: m.last_failure_reason.clone(),
                provider: m.provider,
            })
            .collect()
    }
}

impl Default for ProviderHealthRegistry {
    fn default() -> Self {
        Self::new(HealthPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(reason: &str) -> HealthSample {
        HealthSample {
            ok: false,
            latency: Duration::from_millis(40),
            failure_reason: Some(reason.to_string()),
        }
    }

    fn success() -> HealthSample {
        HealthSample {
            ok: true,
            latency: Duration::from_millis(25),
            failure_reason: None,
        }
    }

    #[test]
    fn consecutive_failures_make_provider_unhealthy_until_cooldown() {
        let policy = HealthPolicy {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
            ..Default::default()
        };
        let mut metrics = ProviderMetrics::new("digiflazz");
        let start = Instant::now();

        for _ in 0..3 {
            metrics.record(&failure("timeout"), start);
        }

        assert_eq!(metrics.health(&policy, start), ProviderHealth::Unhealthy);
        assert_eq!(
            metrics.health(&policy, start + Duration::from_secs(31)),
            ProviderHealth::Healthy
        );
        assert_eq!(metrics.last_failure_reason.as_deref(), Some("timeout"));
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let policy = HealthPolicy::default();
        let mut metrics = ProviderMetrics::new("digiflazz");
        let now = Instant::now();

        for _ in 0..4 {
            metrics.record(&failure("rc 01"), now);
        }
        metrics.record(&success(), now);

        assert_eq!(metrics.consecutive_failures, 0);
        assert_eq!(metrics.total_requests, 5);
        assert_eq!(metrics.last_latency, Some(Duration::from_millis(25)));
    }

    #[test]
    fn low_success_rate_reports_degraded() {
        let policy = HealthPolicy::default();
        let mut metrics = ProviderMetrics::new("h2h");
        let now = Instant::now();

        for i in 0..10 {
            if i % 3 == 0 {
                metrics.record(&failure("rc 91"), now);
            } else {
                metrics.record(&success(), now);
            }
        }

        assert_eq!(metrics.health(&policy, now), ProviderHealth::Degraded);
    }

    #[tokio::test]
    async fn registry_defaults_unknown_providers_to_healthy() {
        let registry = ProviderHealthRegistry::default();
        assert_eq!(registry.health("nobody").await, ProviderHealth::Healthy);

        registry.record("digiflazz", success()).await;
        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].success_count, 1);

        let report = registry.report().await;
        assert_eq!(report[0].provider, "digiflazz");
        assert_eq!(report[0].status, ProviderHealth::Healthy);
        assert_eq!(report[0].last_latency_ms, Some(25));
    }
}
