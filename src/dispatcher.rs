//! Wiring of the dispatch pipeline.

use crate::adapter::AdapterClient;
use crate::audit::AuditSink;
use crate::config::DispatchConfig;
use crate::error::{DispatchError, DispatchResult};
use crate::health::HealthChecker;
use crate::idempotency::IdempotencyCache;
use crate::job::CancelRegistry;
use crate::rate_limiter::QuotaLimiter;
use crate::retry::RetryPolicy;
use crate::router::CommandRouter;
use crate::store::IdempotencyStore;
use crate::worker::{PoolContext, PoolStats, WorkerPool};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// A running pipeline: router, bounded queue, worker pool and sweeper.
pub struct Dispatcher {
    router: CommandRouter,
    pool: WorkerPool,
    quota: QuotaLimiter,
    config: DispatchConfig,
    sweeper: Option<(watch::Sender<bool>, JoinHandle<()>)>,
}

impl Dispatcher {
    /// Build the pipeline and spawn its workers. Must be called inside a
    /// tokio runtime.
    pub fn start(
        config: DispatchConfig,
        store: Arc<dyn IdempotencyStore>,
        adapter: Arc<dyn AdapterClient>,
        audit: Arc<dyn AuditSink>,
    ) -> DispatchResult<Self> {
        if config.queue_capacity == 0 {
            return Err(DispatchError::ConfigurationError(
                "Queue capacity must be greater than 0".to_string(),
            ));
        }

        let cache = Arc::new(IdempotencyCache::new(
            store,
            config.idempotency_ttl,
            config.wait_poll_interval,
        ));
        let quota = QuotaLimiter::new(config.quota.clone());
        let cancels = CancelRegistry::new();
        let (sender, receiver) = mpsc::channel(config.queue_capacity);

        let pool = WorkerPool::spawn(
            config.worker_count,
            receiver,
            PoolContext {
                cache: Arc::clone(&cache),
                quota: quota.clone(),
                adapter,
                audit,
                policy: RetryPolicy::new(config.retry.clone()),
                call_timeout: config.call_timeout,
                sender: sender.clone(),
                cancels: cancels.clone(),
            },
        );

        let sweeper = config.sweep_interval.map(|interval| {
            let (stop, stop_rx) = watch::channel(false);
            let handle = Arc::clone(&cache).spawn_sweeper(interval, stop_rx);
            (stop, handle)
        });

        tracing::info!(
            backend = cache.backend(),
            queue_capacity = config.queue_capacity,
            workers = config.worker_count,
            "Dispatcher started"
        );

        Ok(Self {
            router: CommandRouter::new(cache, sender, cancels),
            pool,
            quota,
            config,
            sweeper,
        })
    }

    pub fn router(&self) -> CommandRouter {
        self.router.clone()
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        self.pool.stats()
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn health_checker(&self) -> HealthChecker {
        HealthChecker::new(
            self.router.clone(),
            self.quota.clone(),
            self.pool.stats(),
            self.pool.worker_count(),
        )
    }

    /// Stop accepting work and settle everything still queued as cancelled.
    pub async fn shutdown(self) -> usize {
        if let Some((stop, handle)) = self.sweeper {
            stop.send_replace(true);
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Sweeper task panicked");
            }
        }
        self.pool.shutdown().await
    }
}
