//! Task queue with a fixed set of workers
//!
//! Jobs are parked in a map until a worker claims them. Claiming and deleting
//! both remove the job from that map under one lock, so a job is either
//! cancelled or run, never both.

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::errors::SandpitError;

pub type JobId = u64;
pub type Job = BoxFuture<'static, ()>;

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Begin executing jobs on `workers` concurrent workers.
    async fn start(&self, workers: usize);

    async fn enqueue(&self, job: Job) -> Result<JobId, SandpitError>;

    /// Like `enqueue`, but the job is not eligible to run before `at`.
    async fn schedule_at(&self, at: Instant, job: Job) -> Result<JobId, SandpitError>;

    /// Remove a job that has not started. Returns false once it was claimed.
    async fn delete(&self, id: JobId) -> bool;

    async fn shutdown(&self);
}

struct Shared {
    jobs: Mutex<HashMap<JobId, Job>>,
    cancel: CancellationToken,
}

pub struct WorkerQueue {
    shared: Arc<Shared>,
    sender: mpsc::Sender<JobId>,
    receiver: Arc<Mutex<mpsc::Receiver<JobId>>>,
    next_id: AtomicU64,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                jobs: Mutex::new(HashMap::new()),
                cancel: CancellationToken::new(),
            }),
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            next_id: AtomicU64::new(1),
            workers: Mutex::new(Vec::new()),
        }
    }

    async fn work(worker: usize, shared: Arc<Shared>, receiver: Arc<Mutex<mpsc::Receiver<JobId>>>) {
        loop {
            let next = tokio::select! {
                _ = shared.cancel.cancelled() => None,
                id = async { receiver.lock().await.recv().await } => id,
            };
            let Some(id) = next else {
                log::debug!("Scheduler worker {} stopping", worker);
                return;
            };

            let job = shared.jobs.lock().await.remove(&id);
            match job {
                Some(job) => job.await,
                None => log::debug!("Job {} was cancelled before it started", id),
            }
        }
    }

    fn next_id(&self) -> JobId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn pending(&self) -> usize {
        self.shared.jobs.lock().await.len()
    }
}

#[async_trait]
impl TaskQueue for WorkerQueue {
    /// Jobs enqueued before this wait in the channel.
    async fn start(&self, count: usize) {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return;
        }
        for worker in 0..count.max(1) {
            let shared = Arc::clone(&self.shared);
            let receiver = Arc::clone(&self.receiver);
            workers.push(tokio::spawn(async move {
                Self::work(worker, shared, receiver).await;
            }));
        }
        log::info!("Started {} scheduler workers", workers.len());
    }

    async fn enqueue(&self, job: Job) -> Result<JobId, SandpitError> {
        let id = self.next_id();
        self.shared.jobs.lock().await.insert(id, job);
        if self.sender.try_send(id).is_err() {
            self.shared.jobs.lock().await.remove(&id);
            return Err(SandpitError::QueueFull);
        }
        Ok(id)
    }

    async fn schedule_at(&self, at: Instant, job: Job) -> Result<JobId, SandpitError> {
        if self.shared.cancel.is_cancelled() {
            return Err(SandpitError::internal("scheduler is shut down"));
        }
        let id = self.next_id();
        self.shared.jobs.lock().await.insert(id, job);

        let sender = self.sender.clone();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            tokio::select! {
                _ = shared.cancel.cancelled() => {}
                _ = tokio::time::sleep_until(at.into()) => {
                    // Skip jobs deleted while waiting.
                    if shared.jobs.lock().await.contains_key(&id) && sender.send(id).await.is_err() {
                        shared.jobs.lock().await.remove(&id);
                    }
                }
            }
        });
        Ok(id)
    }

    async fn delete(&self, id: JobId) -> bool {
        self.shared.jobs.lock().await.remove(&id).is_some()
    }

    async fn shutdown(&self) {
        self.shared.cancel.cancel();
        let workers: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }
        let dropped = {
            let mut jobs = self.shared.jobs.lock().await;
            let count = jobs.len();
            jobs.clear();
            count
        };
        if dropped > 0 {
            log::warn!("Scheduler shut down with {} jobs still pending", dropped);
        }
    }
}
