//! Admission of tool calls into the pipeline.
//!
//! The router is the only producer of new jobs. A call becomes a job only
//! when its idempotency key is freshly reserved; duplicates attach to the
//! existing record instead, and a full queue rejects the call outright.

use crate::error::{DispatchError, DispatchResult};
use crate::idempotency::{
    ErrorDescriptor, FailureKind, IdempotencyCache, IdempotencyRecord, RecordState, Reservation,
};
use crate::job::{CancelRegistry, Job};
use crate::key_generator::{IdempotencyKey, KeyGenerator};
use crate::tool::ToolCall;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

/// How a submission was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleOrigin {
    /// A new job was created.
    Enqueued,
    /// Another execution of the same key is still running.
    InFlight,
    /// The key already has a terminal result.
    Cached,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum CallStatus {
    Pending,
    Succeeded(Value),
    Failed(ErrorDescriptor),
}

impl CallStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CallStatus::Pending)
    }
}

impl From<&IdempotencyRecord> for CallStatus {
    fn from(record: &IdempotencyRecord) -> Self {
        match record.state {
            RecordState::Reserved => CallStatus::Pending,
            RecordState::Completed => {
                CallStatus::Succeeded(record.result.clone().unwrap_or(Value::Null))
            }
            RecordState::Failed => CallStatus::Failed(record.error.clone().unwrap_or_else(|| {
                ErrorDescriptor::new(FailureKind::Internal, "failure detail missing")
            })),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobHandle {
    pub key: IdempotencyKey,
    /// Set only when this submission created the job.
    pub job_id: Option<Uuid>,
    pub origin: HandleOrigin,
    /// Terminal result, when the submission was answered from the cache.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached: Option<CallStatus>,
}

#[derive(Clone)]
pub struct CommandRouter {
    cache: Arc<IdempotencyCache>,
    sender: mpsc::Sender<Job>,
    cancels: CancelRegistry,
}

impl CommandRouter {
    pub fn new(
        cache: Arc<IdempotencyCache>,
        sender: mpsc::Sender<Job>,
        cancels: CancelRegistry,
    ) -> Self {
        Self {
            cache,
            sender,
            cancels,
        }
    }

    /// Admit a call.
    ///
    /// A queue slot is claimed before the key is reserved, so a call
    /// rejected for backpressure never leaves a reservation behind.
    pub async fn submit(&self, call: ToolCall) -> DispatchResult<JobHandle> {
        let key = KeyGenerator::key_for(&call)?;

        let permit = match self.sender.try_reserve() {
            Ok(permit) => permit,
            Err(TrySendError::Full(())) => {
                // duplicates can still attach while the queue is saturated
                if let Some(record) = self.cache.lookup(&key).await? {
                    return Ok(attach(key, &record));
                }
                tracing::warn!(key = %key, capacity = self.capacity(), "Queue full, rejecting call");
                return Err(DispatchError::QueueFull {
                    capacity: self.capacity(),
                });
            }
            Err(TrySendError::Closed(())) => return Err(DispatchError::ShuttingDown),
        };

        let job_id = Uuid::new_v4();
        match self.cache.reserve(&key, job_id).await? {
            Reservation::Acquired => {
                let cancel = match self.cancels.register(&key, job_id) {
                    Ok(cancel) => cancel,
                    Err(e) => {
                        self.cache
                            .fail(
                                &key,
                                job_id,
                                ErrorDescriptor::new(FailureKind::Internal, e.to_string()),
                            )
                            .await?;
                        return Err(e);
                    }
                };

                tracing::info!(
                    job_id = %job_id,
                    key = %key,
                    tool = %call.tool_name(),
                    "Call enqueued"
                );
                permit.send(Job::with_id(job_id, call, key.clone(), cancel));

                Ok(JobHandle {
                    key,
                    job_id: Some(job_id),
                    origin: HandleOrigin::Enqueued,
                    cached: None,
                })
            }
            Reservation::AlreadyReserved(record) => Ok(attach(key, &record)),
        }
    }

    pub async fn status(&self, handle: &JobHandle) -> DispatchResult<CallStatus> {
        self.status_of(&handle.key).await
    }

    pub async fn status_of(&self, key: &IdempotencyKey) -> DispatchResult<CallStatus> {
        match self.cache.lookup(key).await? {
            Some(record) => Ok(CallStatus::from(&record)),
            None => Err(DispatchError::UnknownKey(key.to_string())),
        }
    }

    /// Resolve once the call behind `handle` has a terminal result.
    pub async fn wait(&self, handle: &JobHandle) -> DispatchResult<CallStatus> {
        if let Some(cached) = &handle.cached {
            return Ok(cached.clone());
        }
        self.wait_for(&handle.key).await
    }

    pub async fn wait_for(&self, key: &IdempotencyKey) -> DispatchResult<CallStatus> {
        let record = self.cache.wait_terminal(key).await?;
        Ok(CallStatus::from(&record))
    }

    pub async fn cancel(&self, handle: &JobHandle) -> DispatchResult<bool> {
        self.cancel_key(&handle.key).await
    }

    /// Request cancellation of the job holding `key`. Returns `false` when
    /// the key is known but no local job can be cancelled, e.g. because it
    /// already settled.
    pub async fn cancel_key(&self, key: &IdempotencyKey) -> DispatchResult<bool> {
        if self.cancels.cancel(key)? {
            tracing::info!(key = %key, "Cancellation requested");
            return Ok(true);
        }
        match self.cache.lookup(key).await? {
            Some(_) => Ok(false),
            None => Err(DispatchError::UnknownKey(key.to_string())),
        }
    }

    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }

    pub fn queue_depth(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn cache(&self) -> &Arc<IdempotencyCache> {
        &self.cache
    }
}

fn attach(key: IdempotencyKey, record: &IdempotencyRecord) -> JobHandle {
    let status = CallStatus::from(record);
    if status.is_terminal() {
        tracing::debug!(key = %key, "Returning cached result");
        JobHandle {
            key,
            job_id: None,
            origin: HandleOrigin::Cached,
            cached: Some(status),
        }
    } else {
        tracing::debug!(key = %key, "Attaching to in-flight execution");
        JobHandle {
            key,
            job_id: None,
            origin: HandleOrigin::InFlight,
            cached: None,
        }
    }
}
