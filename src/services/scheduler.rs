//! Bounded-concurrency background job scheduler.
//!
//! Jobs are tokio tasks gated by a semaphore with one permit per worker slot.
//! A job stays `Pending` until it holds a permit, so at most
//! `max_concurrency` jobs are `Running` at any instant and the rest queue up.
//! All job state lives in a single mutex-protected table; callers only ever
//! get copies of it through [`JobView`].
//!
//! Timeouts are detected lazily: a `Running` job whose elapsed time exceeds
//! its timeout is moved to `TimedOut` the next time its status is read.

use chrono::Utc;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::models::job::{JobCounts, JobId, JobStatus, JobView};

/// Default number of worker slots.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Handle given to a job's work function.
///
/// Lets long-running work report progress and notice cancellation (or a
/// detected timeout) between units of work.
#[derive(Clone)]
pub struct JobContext {
    id: JobId,
    cancelled: Arc<AtomicBool>,
    sink: Arc<dyn ProgressSink>,
}

impl JobContext {
    /// A context that is not attached to any scheduler. Progress is dropped.
    pub fn detached() -> Self {
        Self {
            id: JobId::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
            sink: Arc::new(DiscardProgress),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Report progress (0-100) for this job.
    pub fn set_progress(&self, pct: u8) -> Result<(), SchedulerError> {
        self.sink.report(self.id, pct)
    }
}

trait ProgressSink: Send + Sync {
    fn report(&self, id: JobId, pct: u8) -> Result<(), SchedulerError>;
}

struct DiscardProgress;

impl ProgressSink for DiscardProgress {
    fn report(&self, _id: JobId, pct: u8) -> Result<(), SchedulerError> {
        validate_progress(pct)
    }
}

struct JobRecord<T> {
    status: JobStatus,
    progress: u8,
    result: Option<T>,
    error: Option<String>,
    created_at: chrono::DateTime<Utc>,
    started_at: Option<chrono::DateTime<Utc>>,
    completed_at: Option<chrono::DateTime<Utc>>,
    /// Monotonic start, for timeout checks
    started: Option<Instant>,
    /// Monotonic end, for cleanup
    finished: Option<Instant>,
    timeout: Duration,
    cancelled: Arc<AtomicBool>,
    abort: Option<AbortHandle>,
}

impl<T: Clone> JobRecord<T> {
    fn new(timeout: Duration, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            status: JobStatus::Pending,
            progress: 0,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            started: None,
            finished: None,
            timeout,
            cancelled,
            abort: None,
        }
    }

    fn view(&self, id: JobId) -> JobView<T> {
        JobView {
            id,
            status: self.status,
            progress: self.progress,
            result: self.result.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            timeout: self.timeout,
        }
    }

    fn is_overdue(&self) -> Option<Duration> {
        if self.status != JobStatus::Running {
            return None;
        }
        let elapsed = self.started?.elapsed();
        (elapsed > self.timeout).then_some(elapsed)
    }

    /// Move into a terminal state. Callers check the current state first.
    fn finish(&mut self, status: JobStatus, result: Option<T>, error: Option<String>) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.result = result;
        self.error = error;
        self.completed_at = Some(Utc::now());
        self.finished = Some(Instant::now());
    }

    /// Raise the cancellation flag and abort the work task at its next await point.
    fn stop_work(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(abort) = self.abort.take() {
            abort.abort();
        }
    }
}

struct Lifecycle {
    accepting: bool,
    handles: Vec<JoinHandle<()>>,
}

struct Inner<T> {
    jobs: Mutex<HashMap<JobId, JobRecord<T>>>,
    slots: Arc<Semaphore>,
    lifecycle: Mutex<Lifecycle>,
    max_concurrency: usize,
}

impl<T> Inner<T> {
    fn table(&self) -> MutexGuard<'_, HashMap<JobId, JobRecord<T>>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Send + 'static> ProgressSink for Inner<T> {
    fn report(&self, id: JobId, pct: u8) -> Result<(), SchedulerError> {
        validate_progress(pct)?;
        if let Some(record) = self.table().get_mut(&id) {
            if !record.status.is_terminal() {
                record.progress = pct;
            }
        }
        Ok(())
    }
}

impl<T: Clone + Send + 'static> Inner<T> {
    /// Claim a job for execution. Returns false if it was cancelled while queued.
    fn start(&self, id: JobId) -> bool {
        let mut jobs = self.table();
        let Some(record) = jobs.get_mut(&id) else {
            return false;
        };
        if record.status != JobStatus::Pending {
            return false;
        }
        record.status = JobStatus::Running;
        record.started_at = Some(Utc::now());
        record.started = Some(Instant::now());
        true
    }

    /// Remember how to abort the running work. Aborts immediately if the job
    /// was cancelled between `start` and the task being spawned.
    fn attach(&self, id: JobId, abort: AbortHandle) {
        let mut jobs = self.table();
        match jobs.get_mut(&id) {
            Some(record) if record.status == JobStatus::Running => record.abort = Some(abort),
            _ => abort.abort(),
        }
    }

    fn settle(&self, id: JobId, outcome: Result<T, String>) {
        let mut jobs = self.table();
        let Some(record) = jobs.get_mut(&id) else {
            debug!(job_id = %id, "Job record gone before result arrived");
            return;
        };
        if record.status != JobStatus::Running {
            debug!(job_id = %id, status = %record.status, "Discarding result of finished job");
            return;
        }

        record.abort = None;
        let duration = record.started.map(|s| s.elapsed()).unwrap_or_default();
        metrics::histogram!("job_duration_seconds").record(duration.as_secs_f64());

        match outcome {
            Ok(value) => {
                record.progress = 100;
                record.finish(JobStatus::Completed, Some(value), None);
                metrics::counter!("jobs_completed_total").increment(1);
                info!(job_id = %id, duration_ms = duration.as_millis() as u64, "Job completed successfully");
            }
            Err(message) => {
                error!(job_id = %id, error = %message, "Job failed");
                record.finish(JobStatus::Failed, None, Some(message));
                metrics::counter!("jobs_failed_total").increment(1);
            }
        }
    }
}

/// Runs submitted work on a fixed number of worker slots and tracks its lifecycle.
pub struct TaskScheduler<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for TaskScheduler<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Clone + Send + 'static> Default for TaskScheduler<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENCY)
    }
}

impl<T: Clone + Send + 'static> TaskScheduler<T> {
    /// Create a scheduler with `max_concurrency` worker slots (at least one).
    pub fn new(max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        Self {
            inner: Arc::new(Inner {
                jobs: Mutex::new(HashMap::new()),
                slots: Arc::new(Semaphore::new(max_concurrency)),
                lifecycle: Mutex::new(Lifecycle {
                    accepting: true,
                    handles: Vec::new(),
                }),
                max_concurrency,
            }),
        }
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.max_concurrency
    }

    /// Queue `work` and return its id immediately.
    ///
    /// Must be called from within a tokio runtime. Errors and panics from the
    /// work are recorded on the job, never propagated to the caller.
    pub fn submit<F, Fut, E>(&self, timeout: Duration, work: F) -> Result<JobId, SchedulerError>
    where
        F: FnOnce(JobContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        if timeout.is_zero() {
            return Err(SchedulerError::InvalidArgument(
                "timeout must be greater than zero".to_string(),
            ));
        }

        let mut lifecycle = self.inner.lifecycle();
        if !lifecycle.accepting {
            return Err(SchedulerError::ShuttingDown);
        }

        let id = JobId::new();
        let cancelled = Arc::new(AtomicBool::new(false));
        self.inner
            .table()
            .insert(id, JobRecord::new(timeout, Arc::clone(&cancelled)));

        let sink: Arc<dyn ProgressSink> = self.inner.clone();
        let ctx = JobContext {
            id,
            cancelled,
            sink,
        };
        let handle = tokio::spawn(run_job(Arc::clone(&self.inner), id, ctx, work));

        lifecycle.handles.retain(|h| !h.is_finished());
        lifecycle.handles.push(handle);
        drop(lifecycle);

        metrics::counter!("jobs_submitted_total").increment(1);
        info!(job_id = %id, timeout_secs = timeout.as_secs_f64(), "Job submitted");
        Ok(id)
    }

    /// Snapshot of a job. Moves an overdue `Running` job to `TimedOut`.
    pub fn status(&self, id: JobId) -> Result<JobView<T>, SchedulerError> {
        let mut jobs = self.inner.table();
        let record = jobs.get_mut(&id).ok_or(SchedulerError::NotFound(id))?;

        if let Some(elapsed) = record.is_overdue() {
            record.finish(
                JobStatus::TimedOut,
                None,
                Some(format!("Job timed out after {:.0} seconds", elapsed.as_secs_f64())),
            );
            record.stop_work();
            metrics::counter!("jobs_timed_out_total").increment(1);
            warn!(job_id = %id, elapsed_ms = elapsed.as_millis() as u64, "Job timed out");
        }

        Ok(record.view(id))
    }

    /// Set progress on a live job. Unknown and finished jobs are ignored.
    pub fn update_progress(&self, id: JobId, pct: u8) -> Result<(), SchedulerError> {
        self.inner.report(id, pct)
    }

    /// Cancel a pending or running job.
    ///
    /// Returns `Ok(false)` if the job had already finished. A pending job
    /// never runs once cancelled; running work is stopped at its next await
    /// point or when it checks [`JobContext::is_cancelled`].
    pub fn cancel(&self, id: JobId) -> Result<bool, SchedulerError> {
        let mut jobs = self.inner.table();
        let record = jobs.get_mut(&id).ok_or(SchedulerError::NotFound(id))?;
        if record.status.is_terminal() {
            return Ok(false);
        }

        let was = record.status;
        record.finish(
            JobStatus::Cancelled,
            None,
            Some("Job cancelled by user".to_string()),
        );
        record.stop_work();
        metrics::counter!("jobs_cancelled_total").increment(1);
        info!(job_id = %id, previous = %was, "Job cancelled");
        Ok(true)
    }

    /// Drop finished jobs that reached their terminal state at least `older_than` ago.
    pub fn cleanup(&self, older_than: Duration) -> usize {
        let mut jobs = self.inner.table();
        let before = jobs.len();
        jobs.retain(|_, record| match record.finished {
            Some(finished) if record.status.is_terminal() => finished.elapsed() < older_than,
            _ => true,
        });
        let removed = before - jobs.len();
        drop(jobs);

        if removed > 0 {
            info!(removed, "Cleaned up old jobs");
        }
        removed
    }

    /// Tally of jobs per status.
    pub fn counts(&self) -> JobCounts {
        let jobs = self.inner.table();
        let mut counts = JobCounts::default();
        for record in jobs.values() {
            counts.record(record.status);
        }
        counts
    }

    /// Poll `status` until the job reaches a terminal state.
    pub async fn wait(&self, id: JobId, poll_interval: Duration) -> Result<JobView<T>, SchedulerError> {
        loop {
            let view = self.status(id)?;
            if view.status.is_terminal() {
                return Ok(view);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Stop accepting jobs and wait for everything already submitted to finish.
    pub async fn shutdown(&self) {
        let handles = {
            let mut lifecycle = self.inner.lifecycle();
            lifecycle.accepting = false;
            std::mem::take(&mut lifecycle.handles)
        };

        info!(in_flight = handles.len(), "Scheduler shutting down, waiting for jobs");
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Job runner ended abnormally");
            }
        }
        info!("Job scheduler shutdown complete");
    }

    pub fn is_accepting(&self) -> bool {
        self.inner.lifecycle().accepting
    }
}

async fn run_job<T, F, Fut, E>(inner: Arc<Inner<T>>, id: JobId, ctx: JobContext, work: F)
where
    T: Clone + Send + 'static,
    F: FnOnce(JobContext) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    // The semaphore is never closed.
    let Ok(_permit) = Arc::clone(&inner.slots).acquire_owned().await else {
        inner.settle(id, Err("Worker pool closed".to_string()));
        return;
    };

    if !inner.start(id) {
        debug!(job_id = %id, "Skipping job cancelled while queued");
        return;
    }
    debug!(job_id = %id, "Job started");

    let task = tokio::spawn(async move { work(ctx).await.map_err(|e| e.to_string()) });
    inner.attach(id, task.abort_handle());

    match task.await {
        Ok(outcome) => inner.settle(id, outcome),
        Err(e) if e.is_cancelled() => {
            debug!(job_id = %id, "Job work aborted");
        }
        Err(e) => inner.settle(id, Err(panic_message(e))),
    }
}

fn panic_message(err: JoinError) -> String {
    let payload = err.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("Job panicked: {detail}")
}

fn validate_progress(pct: u8) -> Result<(), SchedulerError> {
    if pct > 100 {
        return Err(SchedulerError::InvalidArgument(format!(
            "progress must be between 0 and 100, got {pct}"
        )));
    }
    Ok(())
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Scheduler is shutting down")]
    ShuttingDown,
}
