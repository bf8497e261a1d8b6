//! Queue runtime: worker pool over a priority-ordered ready queue
//!
//! Jobs are executed by a fixed pool of worker tasks pulling the
//! highest-priority ready envelope (lower numeric class first, FIFO
//! within a class). Retryable failures re-enter the queue with
//! exponential backoff until the attempt budget is exhausted; terminal
//! events are emitted exactly once per job. Durable job state lives in
//! the job store row written by the pipeline; the registry here holds
//! the in-flight view the status API serves.

use crate::tts::policy::backoff_delay;
use chrono::{DateTime, Utc};
use revoice_common::{Error, EventBus, JobEnvelope, JobState, Result, RetargetEvent, Settings};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub worker_concurrency: usize,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub retain_completed: Duration,
    pub retain_failed: Duration,
}

impl QueueConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            worker_concurrency: settings.queue_worker_concurrency,
            max_attempts: settings.queue_max_attempts,
            backoff_base: Duration::from_secs(1),
            retain_completed: Duration::from_secs(settings.retain_completed_secs),
            retain_failed: Duration::from_secs(settings.retain_failed_secs),
        }
    }
}

/// Everything a job execution receives from the runtime
pub struct JobContext {
    pub job_id: Uuid,
    pub envelope: JobEnvelope,
    /// 1-based attempt counter
    pub attempt: u32,
    pub cancel: CancellationToken,
    pub progress: ProgressHandle,
}

type ExecFn =
    dyn Fn(JobContext) -> futures::future::BoxFuture<'static, Result<String>> + Send + Sync;

/// Executor seam: the production pipeline, or an injected function for
/// tests and tooling
#[derive(Clone)]
pub enum JobExecutor {
    Pipeline(Arc<crate::pipeline::JobPipeline>),
    Func(Arc<ExecFn>),
}

impl JobExecutor {
    pub fn func<F>(f: F) -> Self
    where
        F: Fn(JobContext) -> futures::future::BoxFuture<'static, Result<String>>
            + Send
            + Sync
            + 'static,
    {
        JobExecutor::Func(Arc::new(f))
    }

    async fn run(&self, ctx: JobContext) -> Result<String> {
        match self {
            JobExecutor::Pipeline(pipeline) => pipeline.run(ctx).await,
            JobExecutor::Func(f) => f(ctx).await,
        }
    }
}

/// Write handle for pipeline progress updates
#[derive(Clone)]
pub struct ProgressHandle {
    inner: Arc<RuntimeInner>,
    job_id: Uuid,
}

impl ProgressHandle {
    /// Record progress, clamped monotonic, and publish a progress event
    pub fn update(&self, percent: u8, operation: &str) {
        self.inner.update_progress(self.job_id, percent, operation);
    }
}

/// Point-in-time view of one job, served by the status API
#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshot {
    pub job_id: Uuid,
    pub state: JobState,
    pub progress: u8,
    pub operation: String,
    pub result_url: Option<String>,
    pub failure_reason: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    /// Envelope view with the transcript elided
    pub data: serde_json::Value,
    pub title: String,
    pub estimated_remaining_secs: Option<u64>,
}

struct JobRecord {
    envelope: JobEnvelope,
    state: JobState,
    progress: u8,
    operation: String,
    result_url: Option<String>,
    failure_reason: Option<String>,
    enqueued_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    attempts: u32,
    terminal_emitted: bool,
    cancel: CancellationToken,
}

impl JobRecord {
    fn snapshot(&self, job_id: Uuid) -> JobSnapshot {
        JobSnapshot {
            job_id,
            state: self.state,
            progress: self.progress,
            operation: self.operation.clone(),
            result_url: self.result_url.clone(),
            failure_reason: self.failure_reason.clone(),
            enqueued_at: self.enqueued_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            attempts: self.attempts,
            data: self.envelope.public_data(),
            title: self.envelope.title(),
            estimated_remaining_secs: estimate_remaining(
                self.state,
                self.progress,
                self.started_at,
            ),
        }
    }
}

/// Linear extrapolation from elapsed time and progress
fn estimate_remaining(state: JobState, progress: u8, started_at: Option<DateTime<Utc>>) -> Option<u64> {
    if state != JobState::Processing || progress == 0 || progress >= 100 {
        return None;
    }
    let started = started_at?;
    let elapsed = (Utc::now() - started).num_seconds().max(0) as u64;
    Some(elapsed * (100 - progress as u64) / progress as u64)
}

struct QueueState {
    /// min-ordering via Reverse: (priority class, enqueue sequence)
    ready: BinaryHeap<Reverse<(u32, u64, Uuid)>>,
    jobs: HashMap<Uuid, JobRecord>,
    seq: u64,
}

struct RuntimeInner {
    cfg: QueueConfig,
    events: EventBus,
    state: Mutex<QueueState>,
    notify: Notify,
    shutdown: CancellationToken,
}

pub struct QueueRuntime {
    inner: Arc<RuntimeInner>,
    executor: JobExecutor,
}

impl QueueRuntime {
    pub fn new(cfg: QueueConfig, events: EventBus, executor: JobExecutor) -> Arc<Self> {
        Arc::new(Self {
            inner: Arc::new(RuntimeInner {
                cfg,
                events,
                state: Mutex::new(QueueState {
                    ready: BinaryHeap::new(),
                    jobs: HashMap::new(),
                    seq: 0,
                }),
                notify: Notify::new(),
                shutdown: CancellationToken::new(),
            }),
            executor,
        })
    }

    /// Spawn the worker pool and the retention sweep
    pub fn start(&self) {
        for worker_id in 0..self.inner.cfg.worker_concurrency {
            let inner = Arc::clone(&self.inner);
            let executor = self.executor.clone();
            tokio::spawn(async move {
                worker_loop(inner, executor, worker_id).await;
            });
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            retention_loop(inner).await;
        });
        info!(
            workers = self.inner.cfg.worker_concurrency,
            "Queue runtime started"
        );
    }

    /// Place an envelope on the ready queue.
    ///
    /// The job id is the transcreation id; re-enqueueing while a previous
    /// run of the same transcreation is still active is rejected.
    pub fn enqueue(&self, envelope: JobEnvelope) -> Result<Uuid> {
        let job_id = envelope.transcreation_id;
        let priority = envelope.priority;
        {
            let mut state = self.inner.state.lock().expect("queue lock poisoned");
            if let Some(existing) = state.jobs.get(&job_id) {
                if !existing.state.is_terminal() {
                    return Err(Error::PreconditionFailed(format!(
                        "job {job_id} is already {}",
                        existing.state
                    )));
                }
            }
            let seq = state.seq;
            state.seq += 1;
            state.jobs.insert(
                job_id,
                JobRecord {
                    envelope,
                    state: JobState::Queued,
                    progress: 0,
                    operation: "queued".to_string(),
                    result_url: None,
                    failure_reason: None,
                    enqueued_at: Utc::now(),
                    started_at: None,
                    finished_at: None,
                    attempts: 0,
                    terminal_emitted: false,
                    cancel: CancellationToken::new(),
                },
            );
            state.ready.push(Reverse((priority, seq, job_id)));
        }

        self.inner.events.emit_lossy(RetargetEvent::JobQueued {
            job_id,
            priority,
            timestamp: Utc::now(),
        });
        self.inner.notify.notify_one();
        debug!(%job_id, priority, "Job enqueued");
        Ok(job_id)
    }

    /// Snapshot of one job, if it is still retained
    pub fn get(&self, job_id: Uuid) -> Option<JobSnapshot> {
        let state = self.inner.state.lock().expect("queue lock poisoned");
        state.jobs.get(&job_id).map(|r| r.snapshot(job_id))
    }

    /// Request cancellation. Queued jobs terminalize immediately;
    /// processing jobs abort at their next checkpoint.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        let queued = {
            let mut state = self.inner.state.lock().expect("queue lock poisoned");
            match state.jobs.get_mut(&job_id) {
                None => return false,
                Some(record) if record.state.is_terminal() => return false,
                Some(record) => {
                    record.cancel.cancel();
                    record.state == JobState::Queued
                }
            }
        };
        if queued {
            self.inner.fail_job(job_id, Error::Cancelled.reason_code());
        }
        info!(%job_id, "Cancellation requested");
        true
    }

    /// Stop accepting work and wake all idle workers
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.notify.notify_waiters();
    }

}

async fn worker_loop(inner: Arc<RuntimeInner>, executor: JobExecutor, worker_id: usize) {
    debug!(worker_id, "Worker started");
    loop {
        if inner.shutdown.is_cancelled() {
            break;
        }
        match inner.pop_ready() {
            Some(job_id) => run_job(&inner, &executor, job_id).await,
            None => {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = inner.notify.notified() => {}
                }
            }
        }
    }
    debug!(worker_id, "Worker stopped");
}

async fn run_job(inner: &Arc<RuntimeInner>, executor: &JobExecutor, job_id: Uuid) {
    let (envelope, attempt, cancel) = {
        let state = inner.state.lock().expect("queue lock poisoned");
        let Some(record) = state.jobs.get(&job_id) else {
            return;
        };
        (record.envelope.clone(), record.attempts, record.cancel.clone())
    };

    inner.events.emit_lossy(RetargetEvent::JobStarted {
        job_id,
        attempt,
        timestamp: Utc::now(),
    });
    info!(%job_id, attempt, "Job started");

    let ctx = JobContext {
        job_id,
        envelope,
        attempt,
        cancel: cancel.clone(),
        progress: ProgressHandle {
            inner: Arc::clone(inner),
            job_id,
        },
    };

    match executor.run(ctx).await {
        Ok(result_url) => inner.complete_job(job_id, result_url),
        Err(e) => {
            let may_retry = e.is_retryable()
                && attempt < inner.cfg.max_attempts
                && !cancel.is_cancelled()
                && !inner.shutdown.is_cancelled();
            if may_retry {
                let delay = backoff_delay(attempt, inner.cfg.backoff_base, None);
                warn!(
                    %job_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Job attempt failed, retrying: {e}"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        inner.fail_job(job_id, Error::Cancelled.reason_code());
                    }
                    _ = inner.shutdown.cancelled() => {
                        inner.fail_job(job_id, e.reason_code());
                    }
                    _ = tokio::time::sleep(delay) => {
                        inner.requeue(job_id);
                    }
                }
            } else {
                warn!(%job_id, attempt, "Job failed terminally: {e}");
                inner.fail_job(job_id, e.reason_code());
            }
        }
    }
}

impl RuntimeInner {
    /// Pop the highest-priority ready job and mark it processing.
    /// Cancelled-while-queued entries terminalize here instead of
    /// running.
    fn pop_ready(&self) -> Option<Uuid> {
        let mut cancelled = Vec::new();
        let picked = {
            let mut state = self.state.lock().expect("queue lock poisoned");
            let mut picked = None;
            while let Some(Reverse((_, _, job_id))) = state.ready.pop() {
                let Some(record) = state.jobs.get_mut(&job_id) else {
                    continue; // pruned by retention
                };
                if record.state != JobState::Queued {
                    continue; // stale heap entry
                }
                if record.cancel.is_cancelled() {
                    cancelled.push(job_id);
                    continue;
                }
                record.state = JobState::Processing;
                record.attempts += 1;
                record.started_at = Some(Utc::now());
                record.operation = "starting".to_string();
                picked = Some(job_id);
                break;
            }
            picked
        };
        for job_id in cancelled {
            self.fail_job(job_id, Error::Cancelled.reason_code());
        }
        picked
    }

    fn requeue(&self, job_id: Uuid) {
        {
            let mut state = self.state.lock().expect("queue lock poisoned");
            let seq = state.seq;
            let Some(record) = state.jobs.get_mut(&job_id) else {
                return;
            };
            record.state = JobState::Queued;
            record.operation = "retry queued".to_string();
            let priority = record.envelope.priority;
            state.seq += 1;
            state.ready.push(Reverse((priority, seq, job_id)));
        }
        self.notify.notify_one();
    }

    fn update_progress(&self, job_id: Uuid, percent: u8, operation: &str) {
        let clamped = {
            let mut state = self.state.lock().expect("queue lock poisoned");
            let Some(record) = state.jobs.get_mut(&job_id) else {
                return;
            };
            // monotonic: a stage computing a lower value is clamped up
            let clamped = percent.min(100).max(record.progress);
            record.progress = clamped;
            record.operation = operation.to_string();
            clamped
        };
        self.events.emit_lossy(RetargetEvent::JobProgress {
            job_id,
            percent: clamped,
            operation: operation.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn complete_job(&self, job_id: Uuid, result_url: String) {
        let emit = {
            let mut state = self.state.lock().expect("queue lock poisoned");
            let Some(record) = state.jobs.get_mut(&job_id) else {
                return;
            };
            record.state = JobState::Completed;
            record.progress = 100;
            record.operation = "completed".to_string();
            record.result_url = Some(result_url.clone());
            record.finished_at = Some(Utc::now());
            let emit = !record.terminal_emitted;
            record.terminal_emitted = true;
            emit
        };
        if emit {
            self.events.emit_lossy(RetargetEvent::JobCompleted {
                job_id,
                result_url,
                timestamp: Utc::now(),
            });
            info!(%job_id, "Job completed");
        }
    }

    fn fail_job(&self, job_id: Uuid, reason: &str) {
        let emit = {
            let mut state = self.state.lock().expect("queue lock poisoned");
            let Some(record) = state.jobs.get_mut(&job_id) else {
                return;
            };
            record.state = JobState::Failed;
            record.operation = "failed".to_string();
            record.failure_reason = Some(reason.to_string());
            record.finished_at = Some(Utc::now());
            let emit = !record.terminal_emitted;
            record.terminal_emitted = true;
            emit
        };
        if emit {
            self.events.emit_lossy(RetargetEvent::JobFailed {
                job_id,
                reason: reason.to_string(),
                timestamp: Utc::now(),
            });
            info!(%job_id, reason, "Job failed");
        }
    }

    /// Drop terminal jobs older than their retention window
    fn prune(&self) {
        let now = Utc::now();
        let mut state = self.state.lock().expect("queue lock poisoned");
        let retain_completed = self.cfg.retain_completed;
        let retain_failed = self.cfg.retain_failed;
        state.jobs.retain(|job_id, record| {
            let keep = match (record.state, record.finished_at) {
                (JobState::Completed, Some(finished)) => {
                    (now - finished).to_std().unwrap_or_default() < retain_completed
                }
                (JobState::Failed, Some(finished)) => {
                    (now - finished).to_std().unwrap_or_default() < retain_failed
                }
                _ => true,
            };
            if !keep {
                debug!(%job_id, "Pruned retained job");
            }
            keep
        });
    }
}

async fn retention_loop(inner: Arc<RuntimeInner>) {
    let mut tick = tokio::time::interval(Duration::from_secs(60));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = tick.tick() => inner.prune(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_heap_orders_by_priority_then_sequence() {
        let mut heap: BinaryHeap<Reverse<(u32, u64, Uuid)>> = BinaryHeap::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let c = Uuid::new_v4();
        heap.push(Reverse((100, 0, a)));
        heap.push(Reverse((0, 1, b)));
        heap.push(Reverse((100, 2, c)));

        assert_eq!(heap.pop().unwrap().0 .2, b); // highest priority class
        assert_eq!(heap.pop().unwrap().0 .2, a); // FIFO within class
        assert_eq!(heap.pop().unwrap().0 .2, c);
    }

    #[test]
    fn remaining_time_is_linear_extrapolation() {
        let started = Some(Utc::now() - chrono::Duration::seconds(30));
        // 30s elapsed at 50% -> ~30s remaining
        let est = estimate_remaining(JobState::Processing, 50, started).unwrap();
        assert!((29..=31).contains(&est), "estimate was {est}");

        assert_eq!(estimate_remaining(JobState::Processing, 0, started), None);
        assert_eq!(estimate_remaining(JobState::Completed, 50, started), None);
        assert_eq!(estimate_remaining(JobState::Processing, 100, started), None);
    }
}
