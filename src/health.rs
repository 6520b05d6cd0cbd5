use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use crate::rate_limiter::QuotaLimiter;
use crate::router::CommandRouter;
use crate::token_bucket::BucketSnapshot;
use crate::worker::{PoolStats, StatsSnapshot};

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub uptime_seconds: u64,
    pub queue: QueueStatus,
    pub dependencies: DependencyStatus,
    pub quota: HashMap<String, BucketSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueueStatus {
    pub depth: usize,
    pub capacity: usize,
    pub workers: usize,
    pub stats: StatsSnapshot,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DependencyStatus {
    pub idempotency_store: ServiceStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub backend: String,
    pub status: String,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

static START_TIME: std::sync::LazyLock<SystemTime> = std::sync::LazyLock::new(SystemTime::now);

#[derive(Clone)]
pub struct HealthChecker {
    router: CommandRouter,
    quota: QuotaLimiter,
    stats: Arc<PoolStats>,
    worker_count: usize,
}

impl HealthChecker {
    pub fn new(
        router: CommandRouter,
        quota: QuotaLimiter,
        stats: Arc<PoolStats>,
        worker_count: usize,
    ) -> Self {
        // pin the uptime origin to when the service came up
        std::sync::LazyLock::force(&START_TIME);
        Self {
            router,
            quota,
            stats,
            worker_count,
        }
    }

    pub async fn check_health(&self) -> HealthStatus {
        let now = SystemTime::now();
        let uptime = now.duration_since(*START_TIME).unwrap_or_default().as_secs();

        let store_status = self.check_store().await;
        let overall_status = if store_status.status == "healthy" {
            "healthy"
        } else {
            "unhealthy"
        };

        let quota = self.quota.snapshot().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to read quota buckets");
            HashMap::new()
        });

        HealthStatus {
            status: overall_status.to_string(),
            timestamp: now
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: uptime,
            queue: QueueStatus {
                depth: self.router.queue_depth(),
                capacity: self.router.capacity(),
                workers: self.worker_count,
                stats: self.stats.snapshot(),
            },
            dependencies: DependencyStatus {
                idempotency_store: store_status,
            },
            quota,
        }
    }

    async fn check_store(&self) -> ServiceStatus {
        let cache = self.router.cache();
        let start = Instant::now();
        let result = cache.ping().await;
        let response_time_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(()) => ServiceStatus {
                backend: cache.backend().to_string(),
                status: "healthy".to_string(),
                response_time_ms,
                error: None,
            },
            Err(e) => ServiceStatus {
                backend: cache.backend().to_string(),
                status: "unavailable".to_string(),
                response_time_ms,
                error: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::IdempotencyCache;
    use crate::job::CancelRegistry;
    use crate::quota_config::QuotaConfig;
    use crate::store::MemoryStore;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_health_reports_queue_and_store() {
        let (sender, _receiver) = mpsc::channel(8);
        let cache = Arc::new(IdempotencyCache::new(
            Arc::new(MemoryStore::new()),
            Duration::from_secs(60),
            Duration::from_millis(10),
        ));
        let router = CommandRouter::new(cache, sender, CancelRegistry::new());
        let quota = QuotaLimiter::new(QuotaConfig::default());
        quota.try_acquire("primary").unwrap();

        let checker = HealthChecker::new(router, quota, Arc::new(PoolStats::default()), 3);
        let health = checker.check_health().await;

        assert_eq!(health.status, "healthy");
        assert_eq!(health.dependencies.idempotency_store.backend, "memory");
        assert_eq!(health.queue.capacity, 8);
        assert_eq!(health.queue.depth, 0);
        assert_eq!(health.queue.workers, 3);
        assert!(health.quota.contains_key("primary"));
    }
}
