use ppob_gateway::api::{self, ApiState};
use ppob_gateway::cache::inquiry::{InquiryCache, MemoryInquiryCache};
use ppob_gateway::config::AppConfig;
use ppob_gateway::database::memory::MemoryStore;
use ppob_gateway::database::Stores;
use ppob_gateway::health::HealthChecker;
use ppob_gateway::logging::init_tracing_with;
use ppob_gateway::middleware::logging::{request_logging_middleware, UuidRequestId};
use ppob_gateway::payments::factory::AdapterFactory;
use ppob_gateway::payments::health::ProviderHealthRegistry;
use ppob_gateway::services::callback::{CallbackDispatcher, CallbackService, HttpCallbackTransport};
use ppob_gateway::services::{ProviderCallbackService, ProviderRouter, TransactionEngine};
use ppob_gateway::workers::{
    ProviderCallbackSweepWorker, RetrySweepWorker, StatusCheckWorker, WebhookRetryWorker,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tracing::{error, info, warn};

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

async fn shutdown_signal_with_notify(shutdown_tx: watch::Sender<bool>) {
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    init_tracing_with(config.logging.format);
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = std::env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
        skip_externals = config.server.skip_externals,
        "Starting PPOB gateway"
    );

    // Stores
    #[cfg(feature = "database")]
    let mut db_pool = None;
    let stores = match &config.database {
        #[cfg(feature = "database")]
        Some(database) => {
            info!("Initializing database connection pool...");
            let pool = ppob_gateway::database::init_pool_from_config(database)
                .await
                .map_err(|e| {
                    error!("Failed to initialize database pool: {}", e);
                    e
                })?;
            db_pool = Some(pool.clone());
            Stores::postgres(pool)
        }
        _ => {
            info!("Using in-memory stores (SKIP_EXTERNALS=true)");
            Stores::memory(Arc::new(MemoryStore::new()))
        }
    };

    // Inquiry cache
    #[cfg(feature = "cache")]
    let mut cache_pool = None;
    let inquiries: Arc<dyn InquiryCache> = match &config.cache {
        #[cfg(feature = "cache")]
        Some(cache) => {
            info!("Initializing Redis inquiry cache...");
            let pool = ppob_gateway::cache::init_cache_pool(cache.pool_config())
                .await
                .map_err(|e| {
                    error!("Failed to initialize cache pool: {}", e);
                    e
                })?;
            cache_pool = Some(pool.clone());
            Arc::new(ppob_gateway::cache::inquiry::RedisInquiryCache::new(pool))
        }
        _ => {
            info!("Using in-memory inquiry cache");
            Arc::new(MemoryInquiryCache::new())
        }
    };

    // Providers and routing
    let adapters = AdapterFactory::new(config.providers.clone()).build_all();
    if adapters.is_empty() {
        warn!("No provider adapters available; every transaction will be parked");
    }
    let router = Arc::new(ProviderRouter::new(
        adapters,
        stores.catalog.clone(),
        ProviderHealthRegistry::new(config.health_policy.clone()),
        config.router.clone(),
        config.engine.business_offset(),
    ));

    // Client webhooks
    let transport = Arc::new(HttpCallbackTransport::new(config.callback.timeout)?);
    let callback_service = Arc::new(CallbackService::new(
        stores.transactions.clone(),
        stores.callback_logs.clone(),
        stores.catalog.clone(),
        transport,
        config.callback.clone(),
    ));
    let dispatcher = CallbackDispatcher::new(callback_service.clone());

    let engine = Arc::new(TransactionEngine::new(
        &stores,
        router.clone(),
        inquiries,
        dispatcher.clone(),
        config.engine.clone(),
    ));
    let provider_callbacks = Arc::new(ProviderCallbackService::new(
        router.clone(),
        stores.provider_callbacks.clone(),
        stores.transactions.clone(),
        engine.clone(),
        config.callback.claim_lease,
    ));

    let health_checker = HealthChecker::new(router.clone());
    #[cfg(feature = "database")]
    let health_checker = match db_pool {
        Some(pool) => health_checker.with_database(pool),
        None => health_checker,
    };
    #[cfg(feature = "cache")]
    let health_checker = match cache_pool {
        Some(pool) => health_checker.with_cache(pool),
        None => health_checker,
    };

    // Workers
    let (worker_shutdown_tx, worker_shutdown_rx) = watch::channel(false);
    let mut worker_handles: Vec<(&'static str, JoinHandle<()>)> = Vec::new();
    let workers = &config.workers;

    if workers.retry_sweep.enabled {
        let worker = RetrySweepWorker::new(
            engine.clone(),
            stores.transactions.clone(),
            workers.retry_sweep.clone(),
        );
        worker_handles.push((
            "retry sweep",
            tokio::spawn(worker.run(worker_shutdown_rx.clone())),
        ));
    } else {
        info!("Retry sweep worker disabled (RETRY_SWEEP_ENABLED=false)");
    }

    if workers.status_check.enabled {
        let worker = StatusCheckWorker::new(
            engine.clone(),
            stores.transactions.clone(),
            workers.status_check.clone(),
        );
        worker_handles.push((
            "status check",
            tokio::spawn(worker.run(worker_shutdown_rx.clone())),
        ));
    } else {
        info!("Status check worker disabled (STATUS_CHECK_ENABLED=false)");
    }

    if workers.provider_callbacks.enabled {
        let worker = ProviderCallbackSweepWorker::new(
            provider_callbacks.clone(),
            workers.provider_callbacks.clone(),
        );
        worker_handles.push((
            "provider callback",
            tokio::spawn(worker.run(worker_shutdown_rx.clone())),
        ));
    } else {
        info!("Provider callback worker disabled (PROVIDER_CALLBACK_ENABLED=false)");
    }

    if workers.webhook_retry.enabled {
        let worker =
            WebhookRetryWorker::new(callback_service.clone(), workers.webhook_retry.clone());
        worker_handles.push((
            "webhook retry",
            tokio::spawn(worker.run(worker_shutdown_rx.clone())),
        ));
    } else {
        info!("Webhook retry worker disabled (WEBHOOK_RETRY_ENABLED=false)");
    }

    // HTTP
    let app = api::router(ApiState {
        engine,
        catalog: stores.catalog.clone(),
        provider_callbacks,
        health: health_checker,
    })
    .layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
            .layer(axum::middleware::from_fn(request_logging_middleware))
            .layer(PropagateRequestIdLayer::x_request_id()),
    );

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to address {}: {}", addr, e);
        e
    })?;

    info!(address = %addr, "Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_with_notify(worker_shutdown_tx.clone()))
        .await?;

    let _ = worker_shutdown_tx.send(true);
    let grace = Duration::from_secs(config.server.shutdown_grace);
    for (name, handle) in worker_handles {
        if tokio::time::timeout(grace, handle).await.is_err() {
            error!(worker = name, "Timed out waiting for worker shutdown");
        }
    }

    let in_flight = dispatcher.in_flight().await;
    if in_flight > 0 {
        info!(in_flight, "Waiting for in-flight webhooks");
    }
    if tokio::time::timeout(grace, dispatcher.drain()).await.is_err() {
        warn!("Webhook drain timed out; undelivered callbacks stay queued for retry");
    }

    info!("Server shutdown complete");

    Ok(())
}
