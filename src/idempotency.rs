//! Idempotency cache: the single admission point that keeps a logical
//! operation from executing more than once.
//!
//! A key moves `Reserved -> Completed | Failed` exactly once. Records expire
//! after the configured TTL; expiry is checked lazily on access by the
//! backing store, and [`IdempotencyCache::spawn_sweeper`] can additionally
//! evict expired records on a timer.
//!
//! A reservation belongs to the job that made it. Only that job may renew
//! or settle it, so a job whose reservation expired and was taken over by a
//! newer job can never overwrite the newer job's result.

use crate::error::{DispatchError, DispatchResult};
use crate::key_generator::IdempotencyKey;
use crate::store::IdempotencyStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Reserved,
    Completed,
    Failed,
}

impl RecordState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RecordState::Reserved)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordState::Reserved => "reserved",
            RecordState::Completed => "completed",
            RecordState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "reserved" => Some(RecordState::Reserved),
            "completed" => Some(RecordState::Completed),
            "failed" => Some(RecordState::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Rejected by the external API.
    Fatal,
    /// Transient failures outlasted the retry budget.
    Exhausted,
    /// Cancelled by the caller or by shutdown.
    Cancelled,
    /// Anomaly inside the dispatcher itself.
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    pub kind: FailureKind,
    pub detail: String,
}

impl ErrorDescriptor {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// Terminal payload written when a reservation is settled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "value", rename_all = "snake_case")]
pub enum Outcome {
    Completed(Value),
    Failed(ErrorDescriptor),
}

impl Outcome {
    pub fn state(&self) -> RecordState {
        match self {
            Outcome::Completed(_) => RecordState::Completed,
            Outcome::Failed(_) => RecordState::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: IdempotencyKey,
    pub state: RecordState,
    /// Job that holds the reservation.
    #[serde(default)]
    pub owner: Option<Uuid>,
    pub result: Option<Value>,
    pub error: Option<ErrorDescriptor>,
    pub created_at: SystemTime,
    pub expires_at: SystemTime,
}

impl IdempotencyRecord {
    pub fn reserved(key: IdempotencyKey, owner: Uuid, ttl: Duration) -> Self {
        let created_at = SystemTime::now();
        Self {
            key,
            state: RecordState::Reserved,
            owner: Some(owner),
            result: None,
            error: None,
            created_at,
            expires_at: created_at + ttl,
        }
    }

    pub fn is_expired_at(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }

    pub fn is_owned_by(&self, owner: Uuid) -> bool {
        self.owner == Some(owner)
    }

    /// Apply a terminal outcome. Returns `false`, leaving the record
    /// untouched, if it was already terminal.
    pub fn settle(&mut self, outcome: Outcome) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = outcome.state();
        match outcome {
            Outcome::Completed(value) => self.result = Some(value),
            Outcome::Failed(error) => self.error = Some(error),
        }
        true
    }

    pub fn outcome(&self) -> Option<Outcome> {
        match self.state {
            RecordState::Reserved => None,
            RecordState::Completed => {
                Some(Outcome::Completed(self.result.clone().unwrap_or(Value::Null)))
            }
            RecordState::Failed => Some(Outcome::Failed(self.error.clone().unwrap_or_else(
                || ErrorDescriptor::new(FailureKind::Internal, "failure detail missing"),
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reservation {
    Acquired,
    AlreadyReserved(IdempotencyRecord),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Applied,
    AlreadyTerminal,
    Missing,
    /// The record now belongs to a different job.
    Superseded,
}

pub struct IdempotencyCache {
    store: Arc<dyn IdempotencyStore>,
    ttl: Duration,
    poll_interval: Duration,
    settled: watch::Sender<u64>,
}

impl IdempotencyCache {
    pub fn new(store: Arc<dyn IdempotencyStore>, ttl: Duration, poll_interval: Duration) -> Self {
        let (settled, _) = watch::channel(0);
        Self {
            store,
            ttl,
            poll_interval,
            settled,
        }
    }

    /// Reserve `key` on behalf of job `owner`.
    pub async fn reserve(&self, key: &IdempotencyKey, owner: Uuid) -> DispatchResult<Reservation> {
        self.store.reserve(key, owner, self.ttl).await
    }

    /// Keep `owner`'s reservation alive for `horizon` plus the TTL from now.
    /// Returns `false` when the reservation is no longer held by `owner`.
    pub async fn renew(
        &self,
        key: &IdempotencyKey,
        owner: Uuid,
        horizon: Duration,
    ) -> DispatchResult<bool> {
        let ttl = horizon.saturating_add(self.ttl);
        let renewed = self.store.renew(key, owner, ttl).await?;
        if !renewed {
            tracing::warn!(key = %key, job_id = %owner, "Reservation no longer held by job");
        }
        Ok(renewed)
    }

    pub async fn complete(
        &self,
        key: &IdempotencyKey,
        owner: Uuid,
        result: Value,
    ) -> DispatchResult<Settlement> {
        self.settle(key, owner, Outcome::Completed(result)).await
    }

    pub async fn fail(
        &self,
        key: &IdempotencyKey,
        owner: Uuid,
        error: ErrorDescriptor,
    ) -> DispatchResult<Settlement> {
        self.settle(key, owner, Outcome::Failed(error)).await
    }

    async fn settle(
        &self,
        key: &IdempotencyKey,
        owner: Uuid,
        outcome: Outcome,
    ) -> DispatchResult<Settlement> {
        let state = outcome.state();
        let settlement = self.store.settle(key, owner, outcome).await?;

        match settlement {
            Settlement::Applied => {
                tracing::debug!(key = %key, state = state.as_str(), "Settled idempotency record");
                self.settled.send_modify(|generation| *generation += 1);
            }
            Settlement::AlreadyTerminal => {
                tracing::warn!(key = %key, state = state.as_str(), "Idempotency record already terminal, ignoring settlement");
            }
            Settlement::Missing => {
                tracing::error!(key = %key, state = state.as_str(), "Idempotency record missing on settlement");
            }
            Settlement::Superseded => {
                tracing::error!(key = %key, job_id = %owner, state = state.as_str(), "Idempotency record taken over by another job");
            }
        }
        Ok(settlement)
    }

    pub async fn lookup(&self, key: &IdempotencyKey) -> DispatchResult<Option<IdempotencyRecord>> {
        self.store.lookup(key).await
    }

    /// Resolve once the record for `key` is terminal.
    ///
    /// Settlements made through this cache wake waiters immediately;
    /// settlements by other processes sharing the store are noticed by
    /// polling.
    pub async fn wait_terminal(&self, key: &IdempotencyKey) -> DispatchResult<IdempotencyRecord> {
        let mut settled = self.settled.subscribe();
        loop {
            match self.store.lookup(key).await? {
                None => return Err(DispatchError::UnknownKey(key.to_string())),
                Some(record) if record.state.is_terminal() => return Ok(record),
                Some(_) => {}
            }
            let _ = tokio::time::timeout(self.poll_interval, settled.changed()).await;
        }
    }

    pub async fn sweep(&self) -> DispatchResult<usize> {
        self.store.sweep_expired().await
    }

    /// Periodically evict expired records until `shutdown` flips to true.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => match self.sweep().await {
                        Ok(0) => {}
                        Ok(evicted) => tracing::debug!(evicted, "Swept expired idempotency records"),
                        Err(e) => tracing::warn!(error = %e, "Idempotency sweep failed"),
                    },
                    _ = async { let _ = shutdown.wait_for(|stop| *stop).await; } => break,
                }
            }
        })
    }

    pub async fn ping(&self) -> DispatchResult<()> {
        self.store.ping().await
    }

    pub fn backend(&self) -> &'static str {
        self.store.backend()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn key(name: &str) -> IdempotencyKey {
        IdempotencyKey::parse(&format!("idem:{}", name)).unwrap()
    }

    fn cache() -> Arc<IdempotencyCache> {
        Arc::new(IdempotencyCache::new(
            Arc::new(MemoryStore::new()),
            Duration::from_secs(60),
            Duration::from_millis(50),
        ))
    }

    #[tokio::test]
    async fn test_reserve_then_complete() {
        let cache = cache();
        let k = key("a");
        let owner = Uuid::new_v4();
        assert_eq!(cache.reserve(&k, owner).await.unwrap(), Reservation::Acquired);

        let record = cache.lookup(&k).await.unwrap().unwrap();
        assert_eq!(record.state, RecordState::Reserved);

        assert_eq!(
            cache.complete(&k, owner, json!({"deleted": true})).await.unwrap(),
            Settlement::Applied
        );
        let record = cache.lookup(&k).await.unwrap().unwrap();
        assert_eq!(record.state, RecordState::Completed);
        assert_eq!(record.result, Some(json!({"deleted": true})));
    }

    #[tokio::test]
    async fn test_settlement_is_idempotent() {
        let cache = cache();
        let k = key("b");
        let owner = Uuid::new_v4();
        cache.reserve(&k, owner).await.unwrap();
        cache.complete(&k, owner, json!(1)).await.unwrap();

        assert_eq!(
            cache.complete(&k, owner, json!(2)).await.unwrap(),
            Settlement::AlreadyTerminal
        );
        assert_eq!(
            cache
                .fail(&k, owner, ErrorDescriptor::new(FailureKind::Fatal, "late"))
                .await
                .unwrap(),
            Settlement::AlreadyTerminal
        );

        let record = cache.lookup(&k).await.unwrap().unwrap();
        assert_eq!(record.state, RecordState::Completed);
        assert_eq!(record.result, Some(json!(1)));
        assert_eq!(record.error, None);
    }

    #[tokio::test]
    async fn test_settle_missing_key_is_noop() {
        let cache = cache();
        let k = key("never-reserved");
        assert_eq!(
            cache.complete(&k, Uuid::new_v4(), json!(null)).await.unwrap(),
            Settlement::Missing
        );
        assert!(cache.lookup(&k).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wait_terminal_wakes_on_settlement() {
        let cache = cache();
        let k = key("c");
        let owner = Uuid::new_v4();
        cache.reserve(&k, owner).await.unwrap();

        let waiter = {
            let cache = cache.clone();
            let k = k.clone();
            tokio::spawn(async move { cache.wait_terminal(&k).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        cache
            .fail(&k, owner, ErrorDescriptor::new(FailureKind::Fatal, "not found"))
            .await
            .unwrap();

        let record = waiter.await.unwrap().unwrap();
        assert_eq!(record.state, RecordState::Failed);
        assert_eq!(record.error.unwrap().detail, "not found");
    }

    #[tokio::test]
    async fn test_wait_terminal_unknown_key() {
        let cache = cache();
        let result = cache.wait_terminal(&key("ghost")).await;
        assert!(matches!(result, Err(DispatchError::UnknownKey(_))));
    }

    #[test]
    fn test_record_outcome() {
        let mut record = IdempotencyRecord::reserved(key("d"), Uuid::new_v4(), Duration::from_secs(1));
        assert_eq!(record.outcome(), None);
        assert!(record.settle(Outcome::Completed(json!({"event_id": "e1"}))));
        assert!(!record.settle(Outcome::Failed(ErrorDescriptor::new(
            FailureKind::Cancelled,
            "too late"
        ))));
        assert_eq!(
            record.outcome(),
            Some(Outcome::Completed(json!({"event_id": "e1"})))
        );
    }

    #[tokio::test]
    async fn test_only_owner_settles() {
        let cache = cache();
        let k = key("fenced");
        let owner = Uuid::new_v4();
        cache.reserve(&k, owner).await.unwrap();

        let intruder = Uuid::new_v4();
        assert_eq!(
            cache.complete(&k, intruder, json!("stale")).await.unwrap(),
            Settlement::Superseded
        );
        assert!(!cache.renew(&k, intruder, Duration::ZERO).await.unwrap());

        let record = cache.lookup(&k).await.unwrap().unwrap();
        assert_eq!(record.state, RecordState::Reserved);
        assert!(record.is_owned_by(owner));

        assert_eq!(
            cache.complete(&k, owner, json!("fresh")).await.unwrap(),
            Settlement::Applied
        );
    }

    #[tokio::test]
    async fn test_renew_outlives_ttl() {
        let cache = Arc::new(IdempotencyCache::new(
            Arc::new(MemoryStore::new()),
            Duration::from_millis(30),
            Duration::from_millis(10),
        ));
        let k = key("long-running");
        let owner = Uuid::new_v4();
        cache.reserve(&k, owner).await.unwrap();

        assert!(cache.renew(&k, owner, Duration::from_secs(60)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(60)).await;

        match cache.reserve(&k, Uuid::new_v4()).await.unwrap() {
            Reservation::AlreadyReserved(record) => assert!(record.is_owned_by(owner)),
            Reservation::Acquired => panic!("renewed reservation must not be taken over"),
        }
        assert_eq!(
            cache.complete(&k, owner, json!(true)).await.unwrap(),
            Settlement::Applied
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_sweeper_evicts_and_stops() {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(IdempotencyCache::new(
            store.clone(),
            Duration::from_millis(10),
            Duration::from_millis(10),
        ));
        cache.reserve(&key("stale"), Uuid::new_v4()).await.unwrap();

        let (stop, stop_rx) = watch::channel(false);
        let sweeper = cache.clone().spawn_sweeper(Duration::from_millis(20), stop_rx);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(store.is_empty());

        stop.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), sweeper)
            .await
            .unwrap()
            .unwrap();
    }
}
