//! Short-lived cache holding bill inquiries until the matching payment arrives.
//!
//! Redis (through a `bb8` pool) backs production; the in-memory cache is used
//! when external services are skipped and in tests.

pub mod error;
pub mod inquiry;
pub mod keys;

pub use error::{CacheError, CacheResult};

#[cfg(feature = "cache")]
pub use self::pool::*;

#[cfg(feature = "cache")]
mod pool {
    use super::error::CacheError;
    use bb8::Pool;
    use bb8_redis::RedisConnectionManager;
    use std::time::Duration;
    use tracing::{error, info, warn};

    pub type RedisPool = Pool<RedisConnectionManager>;

    #[derive(Debug, Clone)]
    pub struct CacheConfig {
        pub redis_url: String,
        pub max_connections: u32,
        pub min_idle: u32,
        pub connection_timeout: Duration,
        pub max_lifetime: Duration,
        pub idle_timeout: Duration,
    }

    impl Default for CacheConfig {
        fn default() -> Self {
            Self {
                redis_url: "redis://127.0.0.1:6379".to_string(),
                max_connections: 20,
                min_idle: 2,
                connection_timeout: Duration::from_secs(5),
                max_lifetime: Duration::from_secs(300),
                idle_timeout: Duration::from_secs(60),
            }
        }
    }

    /// Builds the pool. A failed PING is logged but not fatal; inquiries
    /// then fail individually until Redis comes back.
    pub async fn init_cache_pool(config: CacheConfig) -> Result<RedisPool, CacheError> {
        info!(
            max_connections = config.max_connections,
            "initializing redis cache pool"
        );

        let manager = RedisConnectionManager::new(config.redis_url.as_str()).map_err(|e| {
            error!(error = %e, "failed to create redis connection manager");
            CacheError::ConnectionError(e.to_string())
        })?;

        let pool = Pool::builder()
            .max_size(config.max_connections)
            .min_idle(config.min_idle)
            .connection_timeout(config.connection_timeout)
            .max_lifetime(config.max_lifetime)
            .idle_timeout(config.idle_timeout)
            .test_on_check_out(false)
            .build(manager)
            .await
            .map_err(|e| {
                error!(error = %e, "failed to build redis pool");
                CacheError::ConnectionError(e.to_string())
            })?;

        if let Err(e) = health_check(&pool).await {
            warn!(error = %e, "initial redis connection test failed, continuing");
        }

        info!("redis cache pool initialized");
        Ok(pool)
    }

    pub async fn health_check(pool: &RedisPool) -> Result<(), CacheError> {
        let mut conn = pool.get().await?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
        Ok(())
    }
}
