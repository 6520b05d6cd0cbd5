//! Backing stores for the idempotency cache.
//!
//! Any store works as long as `reserve` is an atomic check-and-set and
//! `settle` only ever moves a `Reserved` record, held by the settling job,
//! to a terminal state.

pub mod memory;
pub mod redis;

use crate::error::DispatchResult;
use crate::idempotency::{IdempotencyRecord, Outcome, Reservation, Settlement};
use crate::key_generator::IdempotencyKey;
use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Create a `Reserved` record owned by `owner` unless a live record
    /// exists, in which case that record is returned unchanged.
    async fn reserve(
        &self,
        key: &IdempotencyKey,
        owner: Uuid,
        ttl: Duration,
    ) -> DispatchResult<Reservation>;

    /// Push the expiry of `owner`'s live reservation to `ttl` from now.
    /// Returns `false` if the record is gone, terminal, or held by another job.
    async fn renew(&self, key: &IdempotencyKey, owner: Uuid, ttl: Duration) -> DispatchResult<bool>;

    /// Move `owner`'s `Reserved` record to the outcome's terminal state.
    async fn settle(
        &self,
        key: &IdempotencyKey,
        owner: Uuid,
        outcome: Outcome,
    ) -> DispatchResult<Settlement>;

    async fn lookup(&self, key: &IdempotencyKey) -> DispatchResult<Option<IdempotencyRecord>>;

    /// Evict expired records, returning how many were removed.
    async fn sweep_expired(&self) -> DispatchResult<usize>;

    async fn ping(&self) -> DispatchResult<()>;

    fn backend(&self) -> &'static str;
}
