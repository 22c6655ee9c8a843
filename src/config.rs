//! Application configuration module
//! Loads environment variables (with `.env` support), validates them and
//! hands each subsystem its own settings struct.

use std::env;

use crate::payments::factory::AdapterFactoryConfig;
use crate::payments::health::HealthPolicy;
use crate::services::callback::CallbackConfig;
use crate::services::provider_router::RouterConfig;
use crate::services::transaction_engine::EngineConfig;
use crate::workers::{
    ProviderCallbackSweepConfig, RetrySweepConfig, StatusCheckConfig, WebhookRetryConfig,
};

/// Main application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    /// `None` when external services are skipped; stores run in memory.
    pub database: Option<DatabaseConfig>,
    pub cache: Option<CacheConfig>,
    pub logging: LoggingConfig,
    pub providers: AdapterFactoryConfig,
    pub health_policy: HealthPolicy,
    pub router: RouterConfig,
    pub engine: EngineConfig,
    pub callback: CallbackConfig,
    pub workers: WorkerConfig,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub skip_externals: bool,
    /// Seconds to wait for in-flight webhooks after the listener closes.
    pub shutdown_grace: u64,
}

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connection_timeout: u64,   // seconds
    pub idle_timeout: Option<u64>, // seconds
}

/// Redis settings for the inquiry cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub redis_url: String,
    pub max_connections: u32,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Plain,
}

/// The four reconciliation loops
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub retry_sweep: RetrySweepConfig,
    pub status_check: StatusCheckConfig,
    pub provider_callbacks: ProviderCallbackSweepConfig,
    pub webhook_retry: WebhookRetryConfig,
}

impl AppConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if it exists
        let _ = dotenv::dotenv().ok();

        let server = ServerConfig::from_env()?;
        let (database, cache) = if server.skip_externals {
            (None, None)
        } else {
            (
                Some(DatabaseConfig::from_env()?),
                Some(CacheConfig::from_env()?),
            )
        };

        Ok(AppConfig {
            server,
            database,
            cache,
            logging: LoggingConfig::from_env()?,
            providers: AdapterFactoryConfig::from_env(),
            health_policy: HealthPolicy::from_env(),
            router: RouterConfig::from_env(),
            engine: EngineConfig::from_env(),
            callback: CallbackConfig::from_env(),
            workers: WorkerConfig::from_env(),
        })
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        if let Some(database) = &self.database {
            database.validate()?;
        }
        if let Some(cache) = &self.cache {
            cache.validate()?;
        }
        self.logging.validate()?;

        if self.providers.enabled_providers.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "ENABLED_PROVIDERS must name at least one provider".to_string(),
            ));
        }
        if self.engine.prefixes.prepaid.is_empty()
            || self.engine.prefixes.inquiry.is_empty()
            || self.engine.prefixes.payment.is_empty()
        {
            return Err(ConfigError::ValidationFailed(
                "transaction id prefixes cannot be empty".to_string(),
            ));
        }
        if !(-12..=14).contains(&self.engine.business_utc_offset_hours) {
            return Err(ConfigError::InvalidValue(
                "BUSINESS_UTC_OFFSET_HOURS".to_string(),
            ));
        }
        if self.callback.max_in_flight == 0 {
            return Err(ConfigError::InvalidValue(
                "CALLBACK_MAX_IN_FLIGHT".to_string(),
            ));
        }
        self.workers.validate()?;

        Ok(())
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(ServerConfig {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8000".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("SERVER_PORT".to_string()))?,
            skip_externals: env::var("SKIP_EXTERNALS")
                .unwrap_or_else(|_| "false".to_string())
                .to_lowercase()
                == "true",
            shutdown_grace: env::var("SHUTDOWN_GRACE_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("SHUTDOWN_GRACE_SECS".to_string()))?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidValue("SERVER_PORT cannot be 0".to_string()));
        }

        if self.host.is_empty() {
            return Err(ConfigError::InvalidValue("SERVER_HOST cannot be empty".to_string()));
        }

        Ok(())
    }
}

impl DatabaseConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(DatabaseConfig {
            url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::MissingVariable("DATABASE_URL".to_string()))?,
            max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()))?,
            min_connections: env::var("DB_MIN_CONNECTIONS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_MIN_CONNECTIONS".to_string()))?,
            connection_timeout: env::var("DB_CONNECTION_TIMEOUT")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("DB_CONNECTION_TIMEOUT".to_string()))?,
            idle_timeout: env::var("DB_IDLE_TIMEOUT")
                .ok()
                .and_then(|val| val.parse().ok()),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::InvalidValue("DATABASE_URL".to_string()));
        }

        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("DB_MAX_CONNECTIONS".to_string()));
        }

        if self.min_connections > self.max_connections {
            return Err(ConfigError::InvalidValue(
                "DB_MIN_CONNECTIONS must be <= DB_MAX_CONNECTIONS".to_string(),
            ));
        }

        Ok(())
    }
}

impl CacheConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(CacheConfig {
            redis_url: env::var("REDIS_URL")
                .map_err(|_| ConfigError::MissingVariable("REDIS_URL".to_string()))?,
            max_connections: env::var("CACHE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()
                .map_err(|_| ConfigError::InvalidValue("CACHE_MAX_CONNECTIONS".to_string()))?,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::InvalidValue("REDIS_URL".to_string()));
        }

        if !self.redis_url.starts_with("redis://") && !self.redis_url.starts_with("rediss://") {
            return Err(ConfigError::InvalidValue(
                "REDIS_URL must start with redis:// or rediss://".to_string(),
            ));
        }

        Ok(())
    }

    #[cfg(feature = "cache")]
    pub fn pool_config(&self) -> crate::cache::CacheConfig {
        crate::cache::CacheConfig {
            redis_url: self.redis_url.clone(),
            max_connections: self.max_connections,
            ..Default::default()
        }
    }
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()),
            format: match env::var("LOG_FORMAT")
                .unwrap_or_else(|_| "plain".to_string())
                .to_lowercase()
                .as_str()
            {
                "json" => LogFormat::Json,
                _ => LogFormat::Plain,
            },
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];
        if !valid_levels.contains(&self.level.to_uppercase().as_str()) {
            return Err(ConfigError::InvalidValue("LOG_LEVEL".to_string()));
        }

        Ok(())
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        Self {
            retry_sweep: RetrySweepConfig::from_env(),
            status_check: StatusCheckConfig::from_env(),
            provider_callbacks: ProviderCallbackSweepConfig::from_env(),
            webhook_retry: WebhookRetryConfig::from_env(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("RETRY_SWEEP_INTERVAL_SECS", self.retry_sweep.interval),
            ("STATUS_CHECK_INTERVAL_SECS", self.status_check.interval),
            (
                "PROVIDER_CALLBACK_INTERVAL_SECS",
                self.provider_callbacks.interval,
            ),
            ("WEBHOOK_RETRY_INTERVAL_SECS", self.webhook_retry.interval),
        ];
        for (name, interval) in intervals {
            if interval.is_zero() {
                return Err(ConfigError::InvalidValue(name.to_string()));
            }
        }

        if self.retry_sweep.batch_size <= 0 {
            return Err(ConfigError::InvalidValue("WORKER_BATCH_SIZE".to_string()));
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    #[error("Invalid value for configuration: {0}")]
    InvalidValue(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}
