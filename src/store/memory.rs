use super::IdempotencyStore;
use crate::error::{DispatchError, DispatchResult};
use crate::idempotency::{IdempotencyRecord, Outcome, Reservation, Settlement};
use crate::key_generator::IdempotencyKey;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// In-process store. Every operation runs under one mutex, which makes
/// `reserve` a true check-and-set.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<IdempotencyKey, IdempotencyRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> DispatchResult<MutexGuard<'_, HashMap<IdempotencyKey, IdempotencyRecord>>> {
        self.records.lock().map_err(|_| {
            DispatchError::Store("Failed to acquire lock on idempotency records".to_string())
        })
    }

    pub fn len(&self) -> usize {
        self.records().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl IdempotencyStore for MemoryStore {
    async fn reserve(
        &self,
        key: &IdempotencyKey,
        owner: Uuid,
        ttl: Duration,
    ) -> DispatchResult<Reservation> {
        let now = SystemTime::now();
        let mut records = self.records()?;

        if let Some(existing) = records.get(key) {
            if !existing.is_expired_at(now) {
                return Ok(Reservation::AlreadyReserved(existing.clone()));
            }
            tracing::debug!(key = %key, "Replacing expired idempotency record");
        }

        records.insert(key.clone(), IdempotencyRecord::reserved(key.clone(), owner, ttl));
        Ok(Reservation::Acquired)
    }

    async fn renew(&self, key: &IdempotencyKey, owner: Uuid, ttl: Duration) -> DispatchResult<bool> {
        let now = SystemTime::now();
        let mut records = self.records()?;

        match records.get_mut(key) {
            Some(record)
                if !record.is_expired_at(now)
                    && !record.state.is_terminal()
                    && record.is_owned_by(owner) =>
            {
                record.expires_at = now.checked_add(ttl).unwrap_or(record.expires_at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn settle(
        &self,
        key: &IdempotencyKey,
        owner: Uuid,
        outcome: Outcome,
    ) -> DispatchResult<Settlement> {
        let now = SystemTime::now();
        let mut records = self.records()?;

        let Some(record) = records.get_mut(key) else {
            return Ok(Settlement::Missing);
        };
        if record.is_expired_at(now) {
            records.remove(key);
            return Ok(Settlement::Missing);
        }
        if !record.is_owned_by(owner) {
            return Ok(Settlement::Superseded);
        }

        if record.settle(outcome) {
            Ok(Settlement::Applied)
        } else {
            Ok(Settlement::AlreadyTerminal)
        }
    }

    async fn lookup(&self, key: &IdempotencyKey) -> DispatchResult<Option<IdempotencyRecord>> {
        let now = SystemTime::now();
        let mut records = self.records()?;

        match records.get(key) {
            Some(record) if !record.is_expired_at(now) => return Ok(Some(record.clone())),
            Some(_) => {}
            None => return Ok(None),
        }
        records.remove(key);
        Ok(None)
    }

    async fn sweep_expired(&self) -> DispatchResult<usize> {
        let now = SystemTime::now();
        let mut records = self.records()?;

        let initial_count = records.len();
        records.retain(|_, record| !record.is_expired_at(now));
        Ok(initial_count - records.len())
    }

    async fn ping(&self) -> DispatchResult<()> {
        self.records().map(|_| ())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}
