use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{DispatchError, DispatchResult};
use crate::quota_config::QuotaConfig;
use crate::token_bucket::{BucketSnapshot, QuotaBucket};

/// Shortest sleep between acquisition attempts.
const MIN_WAIT: Duration = Duration::from_millis(1);

/// Quota limiter holding one token bucket per resource group.
///
/// Buckets are created lazily from the group's rule on first use. All
/// bucket updates happen under a single lock so concurrent workers never
/// observe or produce a negative token count.
#[derive(Clone)]
pub struct QuotaLimiter {
    config: Arc<QuotaConfig>,
    buckets: Arc<Mutex<HashMap<String, QuotaBucket>>>,
}

impl QuotaLimiter {
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            config: Arc::new(config),
            buckets: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Take one token for `group` without waiting.
    pub fn try_acquire(&self, group: &str) -> DispatchResult<bool> {
        Ok(self.acquire_or_wait_time(group)?.is_none())
    }

    /// Take one token for `group`, sleeping in proportion to the deficit
    /// until one is available.
    pub async fn acquire(&self, group: &str) -> DispatchResult<()> {
        loop {
            match self.acquire_or_wait_time(group)? {
                None => return Ok(()),
                Some(wait) => {
                    let wait = wait.max(MIN_WAIT);
                    tracing::debug!(group = %group, wait_ms = wait.as_millis() as u64, "Quota exhausted, deferring");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    fn acquire_or_wait_time(&self, group: &str) -> DispatchResult<Option<Duration>> {
        let mut buckets = self.buckets.lock().map_err(|_| {
            DispatchError::Internal("Failed to acquire lock on quota buckets".to_string())
        })?;

        let bucket = buckets.entry(group.to_string()).or_insert_with(|| {
            let rule = self.config.get_rule(group);
            QuotaBucket::new(rule.capacity, rule.refill_rate)
        });

        if bucket.try_acquire() {
            Ok(None)
        } else {
            Ok(Some(bucket.time_until_available(1).unwrap_or(MIN_WAIT)))
        }
    }

    /// Current state of every bucket touched so far.
    pub fn snapshot(&self) -> DispatchResult<HashMap<String, BucketSnapshot>> {
        let mut buckets = self.buckets.lock().map_err(|_| {
            DispatchError::Internal("Failed to acquire lock on quota buckets".to_string())
        })?;

        Ok(buckets
            .iter_mut()
            .map(|(group, bucket)| (group.clone(), bucket.snapshot()))
            .collect())
    }

    pub fn config(&self) -> &QuotaConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quota_config::QuotaRule;
    use tokio::time::Instant;

    fn limiter(capacity: u32, rate: f64) -> QuotaLimiter {
        let mut config = QuotaConfig::default();
        config.set_rule("primary", QuotaRule::new(capacity, rate));
        QuotaLimiter::new(config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_groups_are_independent() {
        let limiter = limiter(1, 1.0);
        assert!(limiter.try_acquire("primary").unwrap());
        assert!(!limiter.try_acquire("primary").unwrap());
        // default rule has capacity 10
        assert!(limiter.try_acquire("other").unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let limiter = limiter(1, 2.0);
        let start = Instant::now();

        limiter.acquire("primary").await.unwrap();
        limiter.acquire("primary").await.unwrap();
        limiter.acquire("primary").await.unwrap();

        // two refills at 2 tokens/s
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(1000), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1100), "{:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquire_never_overdraws() {
        let limiter = limiter(3, 1.0);
        let mut handles = Vec::new();
        for _ in 0..6 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire("primary").await.unwrap();
                Instant::now()
            }));
        }

        let start = Instant::now();
        let mut finished = Vec::new();
        for handle in handles {
            finished.push(handle.await.unwrap().duration_since(start));
        }
        finished.sort();

        // three immediately from the burst, the rest one per second
        assert!(finished[2] < Duration::from_millis(10));
        assert!(finished[5] >= Duration::from_secs(3));

        let snapshot = limiter.snapshot().unwrap();
        assert!(snapshot["primary"].tokens >= 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_saturates_at_capacity() {
        let limiter = limiter(4, 2.0);
        limiter.acquire("primary").await.unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;

        let snapshot = limiter.snapshot().unwrap();
        assert_eq!(snapshot["primary"].tokens, 4.0);
        assert_eq!(snapshot["primary"].capacity, 4);
    }
}
