use anyhow::Result;
use calendar_dispatch::adapter::GoogleCalendarClient;
use calendar_dispatch::audit::TracingAuditSink;
use calendar_dispatch::config::Config;
use calendar_dispatch::config_validator::ConfigValidator;
use calendar_dispatch::dispatcher::Dispatcher;
use calendar_dispatch::handlers::AppState;
use calendar_dispatch::server::Server;
use calendar_dispatch::store::{IdempotencyStore, MemoryStore, RedisStore};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Load configuration from environment
    let config = Config::from_env()
        .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("calendar_dispatch={},tower_http=debug", config.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    ConfigValidator::validate(&config)
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    let dispatch_config = config.dispatch_config()?;

    tracing::info!("Starting calendar dispatch service");
    tracing::info!(
        "Configuration: bind_addr={}, store={}, queue_capacity={}, workers={}",
        config.bind_addr,
        if config.uses_redis() { "redis" } else { "memory" },
        dispatch_config.queue_capacity,
        dispatch_config.worker_count
    );

    let store: Arc<dyn IdempotencyStore> = if config.uses_redis() {
        Arc::new(
            RedisStore::connect(&config.redis_url)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to open idempotency store: {}", e))?,
        )
    } else {
        tracing::warn!("REDIS_URL not set, idempotency records are kept in memory");
        Arc::new(MemoryStore::new())
    };

    if config.calendar_access_token.is_none() {
        tracing::warn!("CALENDAR_ACCESS_TOKEN not set, calendar calls will be unauthenticated");
    }
    let adapter = GoogleCalendarClient::new(
        &config.calendar_api_base,
        config.calendar_access_token.clone(),
        dispatch_config.call_timeout,
    )?;

    let dispatcher = Dispatcher::start(
        dispatch_config.clone(),
        store,
        Arc::new(adapter),
        Arc::new(TracingAuditSink),
    )?;

    let state = Arc::new(AppState {
        router: dispatcher.router(),
        health: dispatcher.health_checker(),
        config: dispatch_config,
    });

    let served = Server::new(state, config.bind_addr).run().await;

    let cancelled = dispatcher.shutdown().await;
    tracing::info!(cancelled, "Dispatcher stopped");

    served.map_err(|e| anyhow::anyhow!("Server error: {}", e))?;
    Ok(())
}
