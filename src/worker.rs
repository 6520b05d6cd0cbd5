//! Fixed-size worker pool draining the job queue.
//!
//! Each worker takes one job at a time, waits for its quota token, calls the
//! adapter under a deadline and then either settles the job or hands it to a
//! timer task that re-enqueues it once its backoff has elapsed. A job is
//! owned by exactly one of the queue, a worker, or a timer task, so no two
//! workers ever execute the same job.

use crate::adapter::{AdapterClient, AdapterError};
use crate::audit::{AuditEvent, AuditOutcome, AuditSink};
use crate::idempotency::{ErrorDescriptor, FailureKind, IdempotencyCache, Outcome, Settlement};
use crate::job::{CancelRegistry, CancelToken, Job, JobStatus};
use crate::rate_limiter::QuotaLimiter;
use crate::retry::{RetryDecision, RetryPolicy};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

/// Collaborators shared by every worker.
pub struct PoolContext {
    pub cache: Arc<IdempotencyCache>,
    pub quota: QuotaLimiter,
    pub adapter: Arc<dyn AdapterClient>,
    pub audit: Arc<dyn AuditSink>,
    pub policy: RetryPolicy,
    pub call_timeout: Duration,
    /// Used to put jobs back on the queue after a backoff.
    pub sender: mpsc::Sender<Job>,
    pub cancels: CancelRegistry,
}

#[derive(Debug, Default)]
pub struct PoolStats {
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    cancelled: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub cancelled: u64,
}

impl PoolStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

pub struct WorkerPool {
    worker: Arc<Worker>,
    receiver: Arc<Mutex<mpsc::Receiver<Job>>>,
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl WorkerPool {
    pub fn spawn(worker_count: usize, receiver: mpsc::Receiver<Job>, context: PoolContext) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let worker = Arc::new(Worker {
            ctx: context,
            stats: Arc::new(PoolStats::default()),
            shutdown: shutdown_rx,
            retry_timers: std::sync::Mutex::new(Vec::new()),
        });
        let receiver = Arc::new(Mutex::new(receiver));

        let handles = (0..worker_count)
            .map(|worker_id| {
                let worker = Arc::clone(&worker);
                let receiver = Arc::clone(&receiver);
                tokio::spawn(async move { worker.run(worker_id, receiver).await })
            })
            .collect();

        tracing::info!(workers = worker_count, "Worker pool started");

        Self {
            worker,
            receiver,
            handles,
            shutdown,
        }
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.worker.stats)
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Stop all workers and settle every job that has not run yet as
    /// cancelled. Calls already in flight are allowed to finish. Returns the
    /// number of queued jobs that were cancelled.
    pub async fn shutdown(self) -> usize {
        tracing::info!("Shutting down worker pool");
        self.shutdown.send_replace(true);

        for handle in self.handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Worker task panicked");
            }
        }

        let timers = match self.worker.retry_timers.lock() {
            Ok(mut timers) => std::mem::take(&mut *timers),
            Err(_) => {
                tracing::error!("Failed to acquire lock on retry timers");
                Vec::new()
            }
        };
        for timer in timers {
            if let Err(e) = timer.await {
                tracing::error!(error = %e, "Retry timer panicked");
            }
        }

        let mut receiver = self.receiver.lock().await;
        receiver.close();
        let mut drained = 0;
        while let Some(job) = receiver.recv().await {
            self.worker
                .finish(job, Outcome::Failed(shut_down()), None)
                .await;
            drained += 1;
        }

        tracing::info!(drained, "Worker pool stopped");
        drained
    }
}

fn shut_down() -> ErrorDescriptor {
    ErrorDescriptor::new(FailureKind::Cancelled, "dispatcher shut down")
}

struct Worker {
    ctx: PoolContext,
    stats: Arc<PoolStats>,
    shutdown: watch::Receiver<bool>,
    retry_timers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    async fn run(self: Arc<Self>, worker_id: usize, receiver: Arc<Mutex<mpsc::Receiver<Job>>>) {
        tracing::debug!(worker_id, "Worker started");
        let mut shutdown = self.shutdown.clone();

        loop {
            let next = tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => None,
                job = dequeue(&receiver) => job,
            };
            match next {
                Some(job) => self.process(job).await,
                None => break,
            }
        }

        tracing::debug!(worker_id, "Worker stopped");
    }

    async fn process(self: &Arc<Self>, mut job: Job) {
        if job.cancel.is_cancelled() {
            let cancelled = ErrorDescriptor::new(FailureKind::Cancelled, "cancelled by caller");
            return self.finish(job, Outcome::Failed(cancelled), None).await;
        }

        tracing::debug!(
            job_id = %job.id,
            key = %job.key,
            tool = %job.call.tool_name(),
            attempt = job.attempt_count + 1,
            "Processing job"
        );

        let eligible_at = job.next_eligible_time;
        if let Err(failure) = self
            .interruptible(&job.cancel, tokio::time::sleep_until(eligible_at))
            .await
        {
            return self.finish(job, Outcome::Failed(failure), None).await;
        }

        let group = job.call.request().resource_group().to_string();

        // The snapshot read is an API call of its own and is charged to the
        // same group.
        if job.attempt_count == 0 && job.call.request().mutates_existing() {
            if let Err(failure) = self.acquire_quota(&job.cancel, &group).await {
                return self.finish(job, Outcome::Failed(failure), None).await;
            }
            let snapshot = self.ctx.adapter.snapshot(&job.call);
            job.before_state = tokio::time::timeout(self.ctx.call_timeout, snapshot)
                .await
                .ok()
                .flatten();
        }

        if let Err(failure) = self.acquire_quota(&job.cancel, &group).await {
            return self.finish(job, Outcome::Failed(failure), None).await;
        }

        if let Err(failure) = self.hold_reservation(&job, self.ctx.call_timeout).await {
            return self.finish(job, Outcome::Failed(failure), None).await;
        }

        job.begin_attempt();
        let timeout = self.ctx.call_timeout;
        let result = match tokio::time::timeout(timeout, self.ctx.adapter.execute(&job.call)).await {
            Ok(result) => result,
            Err(_) => Err(AdapterError::deadline_exceeded(timeout)),
        };

        match result {
            Ok(output) => {
                let after_state = Some(output.clone());
                self.finish(job, Outcome::Completed(output), after_state)
                    .await
            }
            Err(error) => self.handle_failure(job, error).await,
        }
    }

    async fn handle_failure(self: &Arc<Self>, mut job: Job, error: AdapterError) {
        match self.ctx.policy.decide(&error, job.attempt_count) {
            RetryDecision::Retry(delay) => {
                if let Err(failure) = self.hold_reservation(&job, delay).await {
                    return self.finish(job, Outcome::Failed(failure), None).await;
                }
                if let Err(e) = job.schedule_retry(delay) {
                    let failure = ErrorDescriptor::new(
                        FailureKind::Exhausted,
                        format!("{} ({})", error.detail, e),
                    );
                    return self.finish(job, Outcome::Failed(failure), None).await;
                }
                self.stats.retried.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    job_id = %job.id,
                    key = %job.key,
                    attempt = job.attempt_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %error.detail,
                    "Transient failure, scheduling retry"
                );
                self.requeue(job);
            }
            RetryDecision::Terminal => {
                let kind = if error.is_transient() {
                    FailureKind::Exhausted
                } else {
                    FailureKind::Fatal
                };
                let failure = ErrorDescriptor::new(kind, error.detail);
                self.finish(job, Outcome::Failed(failure), None).await
            }
        }
    }

    /// Hand the job to a timer task that puts it back on the queue once it
    /// is eligible again.
    fn requeue(self: &Arc<Self>, job: Job) {
        let worker = Arc::clone(self);
        let timer = tokio::spawn(async move {
            let cancel = job.cancel.clone();
            let eligible_at = job.next_eligible_time;

            if let Err(failure) = worker
                .interruptible(&cancel, tokio::time::sleep_until(eligible_at))
                .await
            {
                return worker.finish(job, Outcome::Failed(failure), None).await;
            }

            match worker
                .interruptible(&cancel, worker.ctx.sender.reserve())
                .await
            {
                Ok(Ok(permit)) => permit.send(job),
                Ok(Err(_)) => worker.finish(job, Outcome::Failed(shut_down()), None).await,
                Err(failure) => worker.finish(job, Outcome::Failed(failure), None).await,
            }
        });

        match self.retry_timers.lock() {
            Ok(mut timers) => {
                timers.retain(|timer| !timer.is_finished());
                timers.push(timer);
            }
            Err(_) => tracing::error!("Failed to acquire lock on retry timers"),
        }
    }

    /// Extend the job's reservation so it cannot expire during the next
    /// `horizon`. A job that no longer holds its key must not run again.
    async fn hold_reservation(&self, job: &Job, horizon: Duration) -> Result<(), ErrorDescriptor> {
        match self.ctx.cache.renew(&job.key, job.id, horizon).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(ErrorDescriptor::new(
                FailureKind::Internal,
                "idempotency reservation expired or was taken over",
            )),
            Err(e) => Err(ErrorDescriptor::new(
                FailureKind::Internal,
                format!("failed to renew idempotency reservation: {}", e),
            )),
        }
    }

    async fn acquire_quota(&self, cancel: &CancelToken, group: &str) -> Result<(), ErrorDescriptor> {
        match self.interruptible(cancel, self.ctx.quota.acquire(group)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ErrorDescriptor::new(FailureKind::Internal, e.to_string())),
            Err(failure) => Err(failure),
        }
    }

    /// Run `future` unless the job is cancelled or the pool shuts down first.
    async fn interruptible<F: Future>(
        &self,
        cancel: &CancelToken,
        future: F,
    ) -> Result<F::Output, ErrorDescriptor> {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ErrorDescriptor::new(FailureKind::Cancelled, "cancelled by caller")),
            _ = stopped(&mut shutdown) => Err(shut_down()),
            output = future => Ok(output),
        }
    }

    /// Record the job's terminal outcome in the cache and the audit trail.
    ///
    /// If the cache refuses the settlement the job still terminates, as an
    /// internal failure, so a misbehaving store never takes a worker down.
    async fn finish(&self, mut job: Job, outcome: Outcome, after_state: Option<Value>) {
        let settlement = match &outcome {
            Outcome::Completed(result) => {
                self.ctx.cache.complete(&job.key, job.id, result.clone()).await
            }
            Outcome::Failed(error) => self.ctx.cache.fail(&job.key, job.id, error.clone()).await,
        };

        let outcome = match settlement {
            Ok(Settlement::Applied) => outcome,
            Ok(anomaly) => {
                tracing::error!(job_id = %job.id, key = %job.key, settlement = ?anomaly, "Could not record job outcome");
                Outcome::Failed(ErrorDescriptor::new(
                    FailureKind::Internal,
                    format!("idempotency record rejected settlement: {:?}", anomaly),
                ))
            }
            Err(e) => {
                tracing::error!(job_id = %job.id, key = %job.key, error = %e, "Could not record job outcome");
                Outcome::Failed(ErrorDescriptor::new(
                    FailureKind::Internal,
                    format!("failed to record outcome: {}", e),
                ))
            }
        };

        let (status, audit_outcome, after_state) = match outcome {
            Outcome::Completed(_) => {
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
                (JobStatus::Succeeded, AuditOutcome::Succeeded, after_state)
            }
            Outcome::Failed(error) if error.kind == FailureKind::Cancelled => {
                self.stats.cancelled.fetch_add(1, Ordering::Relaxed);
                (JobStatus::Cancelled, AuditOutcome::Failed(error), None)
            }
            Outcome::Failed(error) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                (JobStatus::Failed, AuditOutcome::Failed(error), None)
            }
        };
        job.status = status;

        match &audit_outcome {
            AuditOutcome::Succeeded => tracing::info!(
                job_id = %job.id,
                key = %job.key,
                attempts = job.attempt_count,
                "Job succeeded"
            ),
            AuditOutcome::Failed(error) => tracing::warn!(
                job_id = %job.id,
                key = %job.key,
                attempts = job.attempt_count,
                status = ?job.status,
                error = %error.detail,
                "Job failed"
            ),
        }

        let event = AuditEvent::new(
            job.id,
            job.key.clone(),
            &job.call,
            audit_outcome,
            job.before_state.take(),
            after_state,
        )
        .with_attempts(job.attempt_count, &job.retry_delays);
        self.ctx.audit.record(event);

        if let Err(e) = self.ctx.cancels.remove(&job.key, job.id) {
            tracing::warn!(key = %job.key, error = %e, "Failed to release cancel handle");
        }
    }
}

/// Resolves once the pool is told to shut down.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn dequeue(receiver: &Mutex<mpsc::Receiver<Job>>) -> Option<Job> {
    receiver.lock().await.recv().await
}
