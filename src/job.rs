use crate::error::{DispatchError, DispatchResult};
use crate::key_generator::IdempotencyKey;
use crate::tool::ToolCall;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    InFlight,
    Succeeded,
    Failed,
    Cancelled,
}

/// One admitted tool call travelling through the queue.
///
/// A job is owned by exactly one holder at a time: the queue, a worker, or
/// the timer task that re-enqueues it after a backoff.
#[derive(Debug)]
pub struct Job {
    pub id: Uuid,
    pub call: ToolCall,
    pub key: IdempotencyKey,
    pub attempt_count: u32,
    pub next_eligible_time: Instant,
    pub status: JobStatus,
    pub retry_delays: Vec<Duration>,
    pub before_state: Option<serde_json::Value>,
    pub cancel: CancelToken,
}

impl Job {
    pub fn new(call: ToolCall, key: IdempotencyKey, cancel: CancelToken) -> Self {
        Self::with_id(Uuid::new_v4(), call, key, cancel)
    }

    pub fn with_id(id: Uuid, call: ToolCall, key: IdempotencyKey, cancel: CancelToken) -> Self {
        Self {
            id,
            call,
            key,
            attempt_count: 0,
            next_eligible_time: Instant::now(),
            status: JobStatus::Queued,
            retry_delays: Vec::new(),
            before_state: None,
            cancel,
        }
    }

    pub fn begin_attempt(&mut self) {
        self.status = JobStatus::InFlight;
        self.attempt_count += 1;
    }

    /// Make the job eligible again after `delay`. Fails, leaving the job
    /// untouched, if the delay does not fit on the clock.
    pub fn schedule_retry(&mut self, delay: Duration) -> DispatchResult<()> {
        let eligible_at = Instant::now().checked_add(delay).ok_or_else(|| {
            DispatchError::Internal(format!("retry delay of {:?} overflows the clock", delay))
        })?;
        self.retry_delays.push(delay);
        self.next_eligible_time = eligible_at;
        self.status = JobStatus::Queued;
        Ok(())
    }

    pub fn is_eligible_at(&self, now: Instant) -> bool {
        now >= self.next_eligible_time
    }
}

/// Receiving half of a cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    receiver: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves if the
    /// registry entry was dropped without cancelling.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        let closed = receiver.wait_for(|cancelled| *cancelled).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    }
}

/// Cancellation handles for jobs that have not settled yet, by key.
#[derive(Clone, Default)]
pub struct CancelRegistry {
    entries: Arc<Mutex<HashMap<IdempotencyKey, (Uuid, watch::Sender<bool>)>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: &IdempotencyKey, job_id: Uuid) -> DispatchResult<CancelToken> {
        let (sender, receiver) = watch::channel(false);
        self.entries()?.insert(key.clone(), (job_id, sender));
        Ok(CancelToken { receiver })
    }

    /// Request cancellation. Returns `false` if no live job holds the key.
    pub fn cancel(&self, key: &IdempotencyKey) -> DispatchResult<bool> {
        let entries = self.entries()?;
        match entries.get(key) {
            Some((_, sender)) => {
                sender.send_replace(true);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drop the entry for `key` if it still belongs to `job_id`.
    pub fn remove(&self, key: &IdempotencyKey, job_id: Uuid) -> DispatchResult<()> {
        let mut entries = self.entries()?;
        if entries.get(key).is_some_and(|(id, _)| *id == job_id) {
            entries.remove(key);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(
        &self,
    ) -> DispatchResult<std::sync::MutexGuard<'_, HashMap<IdempotencyKey, (Uuid, watch::Sender<bool>)>>>
    {
        self.entries.lock().map_err(|_| {
            DispatchError::Internal("Failed to acquire lock on cancel registry".to_string())
        })
    }
}
