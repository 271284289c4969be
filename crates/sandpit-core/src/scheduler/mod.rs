//! Submission scheduler
//!
//! Moves stored submissions through `Queued -> Processing -> terminal`. Jobs
//! run on a [`TaskQueue`]; every job ends with a terminal write, even when the
//! orchestrator fails or panics, and a job that has started cannot be
//! cancelled.

pub mod queue;


use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::errors::SandpitError;
use crate::executor::{ExecutionResult, Orchestrator};
use crate::language::LanguageRegistry;
use crate::notifier::Notifier;
use crate::status::Status;
use crate::submission::{Submission, SubmissionStore};

pub use queue::{JobId, TaskQueue, WorkerQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Scheduled,
    Processing,
    Succeeded,
    Failed,
    Cancelled,
    NotFound,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatistics {
    /// Waiting to start.
    pub enqueued: u64,
    pub processing: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Jobs ever accepted, including inline executions.
    pub total: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Scheduled,
    Processing,
}

#[derive(Debug, Clone, Copy)]
struct TrackedJob {
    /// `None` for inline executions, which have no queue entry.
    id: Option<JobId>,
    state: JobState,
}

#[derive(Default)]
struct Counters {
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    total: AtomicU64,
}

pub struct Scheduler {
    queue: Arc<dyn TaskQueue>,
    store: Arc<dyn SubmissionStore>,
    orchestrator: Arc<Orchestrator>,
    registry: Arc<dyn LanguageRegistry>,
    notifier: Option<Arc<dyn Notifier>>,
    workers: usize,
    jobs: Mutex<HashMap<String, TrackedJob>>,
    counters: Counters,
}

impl Scheduler {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        store: Arc<dyn SubmissionStore>,
        orchestrator: Arc<Orchestrator>,
        registry: Arc<dyn LanguageRegistry>,
        notifier: Option<Arc<dyn Notifier>>,
        workers: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            store,
            orchestrator,
            registry,
            notifier,
            workers,
            jobs: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        })
    }

    pub async fn start(&self) {
        self.queue.start(self.workers).await;
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Queue a submission to run in the background.
    ///
    /// A full queue is reported in the returned result (internal error,
    /// retryable) and leaves the submission queued but unscheduled.
    pub async fn schedule_async(self: &Arc<Self>, token: &str) -> Result<ExecutionResult, SandpitError> {
        self.schedule(token, None).await
    }

    /// Like [`schedule_async`](Self::schedule_async), but the job does not
    /// start before `delay` has passed.
    pub async fn schedule_delayed(
        self: &Arc<Self>,
        token: &str,
        delay: Duration,
    ) -> Result<ExecutionResult, SandpitError> {
        self.schedule(token, Some(Instant::now() + delay)).await
    }

    async fn schedule(
        self: &Arc<Self>,
        token: &str,
        at: Option<Instant>,
    ) -> Result<ExecutionResult, SandpitError> {
        let mut submission = self.load(token).await?;
        if submission.is_terminal() {
            return Err(SandpitError::validation(format!(
                "submission {} already finished with {}",
                token, submission.status
            )));
        }

        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(token) {
            return Err(SandpitError::validation(format!(
                "submission {} is already scheduled",
                token
            )));
        }

        // Recorded before the job exists so a fast worker's writes win.
        submission.mark_queued();
        self.store.save(&submission).await?;

        let job = {
            let this = Arc::clone(self);
            let token = token.to_string();
            async move { this.run_job(token).await }.boxed()
        };
        let enqueued = match at {
            Some(at) => self.queue.schedule_at(at, job).await,
            None => self.queue.enqueue(job).await,
        };

        let id = match enqueued {
            Ok(id) => id,
            Err(e) => {
                log::warn!("Could not schedule submission {}: {}", token, e);
                return Ok(if e.is_retryable() {
                    ExecutionResult::unavailable(&e)
                } else {
                    ExecutionResult::internal_error(e.to_string())
                });
            }
        };
        jobs.insert(
            token.to_string(),
            TrackedJob {
                id: Some(id),
                state: JobState::Scheduled,
            },
        );
        drop(jobs);
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        log::debug!("Submission {} scheduled as job {}", token, id);

        Ok(ExecutionResult::with_status(Status::Queued))
    }

    /// Run a submission inline and return its result.
    ///
    /// A job still waiting in the queue is taken over; one that already
    /// started is rejected. Finished submissions return their stored result.
    pub async fn execute_sync(&self, token: &str) -> Result<ExecutionResult, SandpitError> {
        let submission = self.load(token).await?;
        if submission.is_terminal() {
            return stored_result(&submission);
        }

        {
            let mut jobs = self.jobs.lock().await;
            if let Some(job) = jobs.get(token).copied() {
                let taken = match (job.state, job.id) {
                    (JobState::Scheduled, Some(id)) => self.queue.delete(id).await,
                    _ => false,
                };
                if !taken {
                    return Err(SandpitError::validation(format!(
                        "submission {} is already being processed",
                        token
                    )));
                }
                log::debug!("Submission {} taken over from the queue", token);
            } else {
                self.counters.total.fetch_add(1, Ordering::Relaxed);
            }
            jobs.insert(
                token.to_string(),
                TrackedJob {
                    id: None,
                    state: JobState::Processing,
                },
            );
        }

        let finished = self.run_guarded(token).await;
        self.jobs.lock().await.remove(token);

        match finished {
            Some(submission) => stored_result(&submission),
            None => stored_result(&self.load(token).await?),
        }
    }

    /// Cancel a job that has not started. Returns false for unknown tokens
    /// and for jobs a worker already picked up.
    pub async fn cancel(&self, token: &str) -> bool {
        {
            let mut jobs = self.jobs.lock().await;
            let Some(job) = jobs.get(token).copied() else {
                return false;
            };
            let Some(id) = job.id.filter(|_| job.state == JobState::Scheduled) else {
                return false;
            };
            if !self.queue.delete(id).await {
                return false;
            }
            jobs.remove(token);
        }
        self.counters.cancelled.fetch_add(1, Ordering::Relaxed);

        match self.store.load(token).await {
            Ok(Some(mut submission)) => {
                submission.mark_cancelled();
                if let Err(e) = self.store.save(&submission).await {
                    log::warn!("Could not record cancellation of {}: {}", token, e);
                }
            }
            Ok(None) => log::warn!("Cancelled job for unknown submission {}", token),
            Err(e) => log::warn!("Could not load cancelled submission {}: {}", token, e),
        }
        log::info!("Submission {} cancelled", token);
        true
    }

    pub async fn job_status(&self, token: &str) -> JobStatus {
        if let Some(job) = self.jobs.lock().await.get(token) {
            return match job.state {
                JobState::Scheduled => JobStatus::Scheduled,
                JobState::Processing => JobStatus::Processing,
            };
        }
        match self.store.load(token).await {
            Ok(Some(s)) if s.status == Status::InternalError => JobStatus::Failed,
            Ok(Some(s)) if s.is_terminal() => JobStatus::Succeeded,
            Ok(Some(s)) if s.is_cancelled() => JobStatus::Cancelled,
            // Stored but never scheduled, or scheduling failed.
            Ok(Some(_)) => JobStatus::NotFound,
            Ok(None) => JobStatus::NotFound,
            Err(e) => {
                log::warn!("Could not load submission {}: {}", token, e);
                JobStatus::NotFound
            }
        }
    }

    pub async fn statistics(&self) -> QueueStatistics {
        let (enqueued, processing) = {
            let jobs = self.jobs.lock().await;
            let processing = jobs
                .values()
                .filter(|j| j.state == JobState::Processing)
                .count() as u64;
            (jobs.len() as u64 - processing, processing)
        };
        QueueStatistics {
            enqueued,
            processing,
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            total: self.counters.total.load(Ordering::Relaxed),
        }
    }

    /// Re-schedule stored submissions that never reached a terminal status,
    /// e.g. after a restart. Cancelled submissions stay cancelled.
    pub async fn recover(self: &Arc<Self>) -> Result<usize, SandpitError> {
        let pending = self.store.pending().await?;
        let mut recovered = 0;
        for submission in pending {
            if submission.is_cancelled() || self.jobs.lock().await.contains_key(&submission.token) {
                continue;
            }
            let result = self.schedule_async(&submission.token).await?;
            if result.status == Status::Queued {
                recovered += 1;
            } else {
                log::warn!(
                    "Stopping recovery at {}: {}",
                    submission.token,
                    result.message.unwrap_or_default()
                );
                break;
            }
        }
        if recovered > 0 {
            log::info!("Recovered {} pending submissions", recovered);
        }
        Ok(recovered)
    }

    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
        self.jobs.lock().await.clear();
    }

    async fn run_job(self: Arc<Self>, token: String) {
        if let Some(job) = self.jobs.lock().await.get_mut(&token) {
            job.state = JobState::Processing;
        }
        self.run_guarded(&token).await;
        self.jobs.lock().await.remove(&token);
    }

    /// Process a submission and return it as finally stored. Errors and
    /// panics become an internal-error terminal write.
    async fn run_guarded(&self, token: &str) -> Option<Submission> {
        let outcome = AssertUnwindSafe(self.process(token)).catch_unwind().await;
        let message = match outcome {
            Ok(Ok(finished)) => return finished,
            Ok(Err(e)) => {
                log::error!("Submission {} failed: {}", token, e);
                e.to_string()
            }
            Err(_) => {
                log::error!("Submission {} panicked during execution", token);
                "execution panicked".to_string()
            }
        };

        match self.store.load(token).await {
            Ok(Some(mut submission)) if !submission.is_terminal() => {
                submission.complete(ExecutionResult::internal_error(message));
                self.finish(&submission).await;
                Some(submission)
            }
            Ok(other) => other,
            Err(e) => {
                log::error!("Could not record failure of {}: {}", token, e);
                None
            }
        }
    }

    async fn process(&self, token: &str) -> Result<Option<Submission>, SandpitError> {
        let Some(mut submission) = self.store.load(token).await? else {
            log::warn!("Job for unknown submission {}", token);
            return Ok(None);
        };
        if submission.is_terminal() {
            log::debug!("Skipping submission {}: already {}", token, submission.status);
            return Ok(Some(submission));
        }

        submission.mark_processing();
        if !self.store.save(&submission).await? {
            // Another run finished it first.
            return Ok(self.store.load(token).await?);
        }

        let language = self.registry.resolve(submission.language_id)?;
        let request = submission.execution_request(language);
        let result = self.orchestrator.execute(&request).await;

        submission.complete(result);
        self.finish(&submission).await;
        Ok(Some(submission))
    }

    /// Write a terminal submission and send its callback if this write was
    /// the one that finished it.
    async fn finish(&self, submission: &Submission) {
        let written = match self.store.save(submission).await {
            Ok(written) => written,
            Err(e) => {
                log::error!("Could not store result of {}: {}", submission.token, e);
                return;
            }
        };
        if !written {
            log::debug!("Submission {} was already finished", submission.token);
            return;
        }

        if submission.status == Status::InternalError {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
        }

        if let (Some(notifier), Some(_)) = (&self.notifier, &submission.callback_url) {
            let notifier = Arc::clone(notifier);
            let submission = submission.clone();
            tokio::spawn(async move {
                if let Err(e) = notifier.notify(&submission).await {
                    log::warn!("Callback for {} not delivered: {}", submission.token, e);
                }
            });
        }
    }

    async fn load(&self, token: &str) -> Result<Submission, SandpitError> {
        self.store
            .load(token)
            .await?
            .ok_or_else(|| SandpitError::NotFound(format!("submission {}", token)))
    }
}

fn stored_result(submission: &Submission) -> Result<ExecutionResult, SandpitError> {
    submission.result.clone().ok_or_else(|| {
        SandpitError::internal(format!(
            "submission {} is {} without a result",
            submission.token, submission.status
        ))
    })
}
