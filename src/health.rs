//! Health check module
//! Provides health status for the gateway, its stores and its providers

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{error, info};

use crate::payments::health::{ProviderHealth, ProviderHealthReport};
use crate::services::provider_router::ProviderRouter;

/// Health status response
#[derive(Debug, Serialize, Clone)]
pub struct HealthStatus {
    pub status: HealthState,
    pub checks: HashMap<String, ComponentHealth>,
    pub providers: Vec<ProviderHealthReport>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Overall health state
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Individual component health status
#[derive(Debug, Serialize, Clone)]
pub struct ComponentHealth {
    pub status: ComponentState,
    pub response_time_ms: Option<u128>,
    pub details: Option<String>,
}

/// Component state
#[derive(Debug, Serialize, Clone)]
pub enum ComponentState {
    Up,
    Down,
    Warning,
}

impl HealthStatus {
    pub fn new() -> Self {
        Self {
            status: HealthState::Healthy,
            checks: HashMap::new(),
            providers: Vec::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self.status, HealthState::Healthy)
    }
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ComponentHealth {
    pub fn up(response_time_ms: Option<u128>) -> Self {
        Self {
            status: ComponentState::Up,
            response_time_ms,
            details: None,
        }
    }

    pub fn down(details: Option<String>) -> Self {
        Self {
            status: ComponentState::Down,
            response_time_ms: None,
            details,
        }
    }

    pub fn warning(response_time_ms: Option<u128>, details: Option<String>) -> Self {
        Self {
            status: ComponentState::Warning,
            response_time_ms,
            details,
        }
    }
}

/// Health checker for the application. Stores that are not configured
/// (in-memory mode) are reported as up with a note.
#[derive(Clone)]
pub struct HealthChecker {
    #[cfg(feature = "database")]
    db_pool: Option<sqlx::PgPool>,
    #[cfg(feature = "cache")]
    cache: Option<crate::cache::RedisPool>,
    router: Arc<ProviderRouter>,
}

impl HealthChecker {
    pub fn new(router: Arc<ProviderRouter>) -> Self {
        Self {
            #[cfg(feature = "database")]
            db_pool: None,
            #[cfg(feature = "cache")]
            cache: None,
            router,
        }
    }

    #[cfg(feature = "database")]
    pub fn with_database(mut self, pool: sqlx::PgPool) -> Self {
        self.db_pool = Some(pool);
        self
    }

    #[cfg(feature = "cache")]
    pub fn with_cache(mut self, pool: crate::cache::RedisPool) -> Self {
        self.cache = Some(pool);
        self
    }

    /// Perform comprehensive health check
    pub async fn check_health(&self) -> HealthStatus {
        let mut health_status = HealthStatus::new();
        let mut overall_healthy = true;

        #[cfg(feature = "database")]
        let database = match &self.db_pool {
            Some(pool) => Some(
                timed("database", Duration::from_secs(5), check_database_health(pool)).await,
            ),
            None => None,
        };
        #[cfg(not(feature = "database"))]
        let database: Option<ComponentHealth> = None;

        #[cfg(feature = "cache")]
        let cache = match &self.cache {
            Some(pool) => {
                Some(timed("cache", Duration::from_secs(5), check_cache_health(pool)).await)
            }
            None => None,
        };
        #[cfg(not(feature = "cache"))]
        let cache: Option<ComponentHealth> = None;

        for (name, component) in [("database", database), ("cache", cache)] {
            let component = component.unwrap_or_else(|| ComponentHealth {
                status: ComponentState::Up,
                response_time_ms: None,
                details: Some("in-memory".to_string()),
            });
            if matches!(component.status, ComponentState::Down) {
                overall_healthy = false;
            }
            health_status.checks.insert(name.to_string(), component);
        }

        let mut providers = self.router.health().report().await;
        for adapter in self.router.adapters() {
            if !providers.iter().any(|p| p.provider == adapter.code()) {
                providers.push(ProviderHealthReport::unobserved(adapter.code()));
            }
        }
        providers.sort_by(|a, b| a.provider.cmp(&b.provider));
        health_status.providers = providers;
        let adapters = self.router.adapters().count();
        let unhealthy = health_status
            .providers
            .iter()
            .filter(|p| p.status == ProviderHealth::Unhealthy)
            .count();
        let degraded = health_status
            .providers
            .iter()
            .any(|p| p.status != ProviderHealth::Healthy);

        health_status.checks.insert(
            "providers".to_string(),
            if adapters == 0 {
                ComponentHealth::down(Some("no provider adapters configured".to_string()))
            } else if unhealthy >= adapters {
                ComponentHealth::down(Some("all providers unhealthy".to_string()))
            } else if degraded {
                ComponentHealth::warning(None, Some(format!("{} unhealthy", unhealthy)))
            } else {
                ComponentHealth::up(None)
            },
        );
        if adapters == 0 || unhealthy >= adapters {
            overall_healthy = false;
        }

        // Set overall status
        health_status.status = if !overall_healthy {
            HealthState::Unhealthy
        } else if degraded {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        };

        health_status
    }
}

#[allow(dead_code)]
async fn timed<F>(name: &str, limit: Duration, check: F) -> ComponentHealth
where
    F: std::future::Future<Output = Result<u128, Box<dyn std::error::Error + Send + Sync>>>,
{
    match timeout(limit, check).await {
        Ok(Ok(response_time)) => {
            info!("{} health check: OK ({}ms)", name, response_time);
            ComponentHealth::up(Some(response_time))
        }
        Ok(Err(e)) => {
            error!("{} health check failed: {}", name, e);
            ComponentHealth::down(Some(e.to_string()))
        }
        Err(_) => {
            error!("{} health check timed out", name);
            ComponentHealth::down(Some("Timeout".to_string()))
        }
    }
}

#[cfg(feature = "database")]
pub async fn check_database_health(
    pool: &sqlx::PgPool,
) -> Result<u128, Box<dyn std::error::Error + Send + Sync>> {
    let start = Instant::now();
    sqlx::query("SELECT 1").fetch_one(pool).await?;
    Ok(start.elapsed().as_millis())
}

#[cfg(feature = "cache")]
pub async fn check_cache_health(
    pool: &crate::cache::RedisPool,
) -> Result<u128, Box<dyn std::error::Error + Send + Sync>> {
    let start = Instant::now();
    crate::cache::health_check(pool).await?;
    Ok(start.elapsed().as_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_status_creation() {
        let health_status = HealthStatus::new();
        assert!(matches!(health_status.status, HealthState::Healthy));
        assert!(health_status.checks.is_empty());
        assert!(health_status.timestamp <= chrono::Utc::now());
    }

    #[test]
    fn test_component_health_states() {
        let up_health = ComponentHealth::up(Some(100));
        assert!(matches!(up_health.status, ComponentState::Up));
        assert_eq!(up_health.response_time_ms, Some(100));

        let down_health = ComponentHealth::down(Some("Test error".to_string()));
        assert!(matches!(down_health.status, ComponentState::Down));
        assert_eq!(down_health.details, Some("Test error".to_string()));

        let warning_health = ComponentHealth::warning(Some(500), Some("Slow response".to_string()));
        assert!(matches!(warning_health.status, ComponentState::Warning));
        assert_eq!(warning_health.response_time_ms, Some(500));
    }
}
