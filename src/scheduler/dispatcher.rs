use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{ReachError, Result};
use crate::registry::{blocking, RouterLocks, TagAllocator};
use crate::scheduler::job::{Job, JobKind, JobStatus};
use crate::scheduler::queue::{JobQueue, RunningSnapshot};
use crate::verdict::JobReport;

/// How a job run ended.
#[derive(Debug)]
pub struct JobOutcome {
    pub result: Result<JobReport>,
    /// Cleanup left something behind for reconciliation.
    pub lingering_artifacts: bool,
}

impl JobOutcome {
    pub fn completed(report: JobReport, lingering_artifacts: bool) -> Self {
        Self {
            result: Ok(report),
            lingering_artifacts,
        }
    }

    pub fn failed(error: ReachError, lingering_artifacts: bool) -> Self {
        Self {
            result: Err(error),
            lingering_artifacts,
        }
    }
}

/// Runs one dispatched job to completion, including its cleanup.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: Job, cancel: CancellationToken) -> JobOutcome;
}

#[derive(Debug, Clone)]
struct RunningJob {
    kind: JobKind,
    routers: Vec<String>,
    tag: Option<u8>,
    started: Instant,
    cancel: CancellationToken,
}

/// Pops ready jobs off the queue and runs each as its own task.
///
/// There is no global lock around running jobs: the running table is only
/// held long enough to insert or remove an entry, and router-level exclusion
/// is left entirely to [`RouterLocks`].
pub struct Dispatcher {
    queue: Arc<RwLock<JobQueue>>,
    running: Mutex<HashMap<Uuid, RunningJob>>,
    tags: Arc<TagAllocator>,
    locks: Arc<RouterLocks>,
    runner: Arc<dyn JobRunner>,
    config: SchedulerConfig,
    wake: Notify,
    finished: watch::Sender<u64>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("running", &self.running.lock().len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        queue: Arc<RwLock<JobQueue>>,
        tags: Arc<TagAllocator>,
        locks: Arc<RouterLocks>,
        runner: Arc<dyn JobRunner>,
        config: SchedulerConfig,
    ) -> Self {
        let (finished, _rx) = watch::channel(0);
        Self {
            queue,
            running: Mutex::new(HashMap::new()),
            tags,
            locks,
            runner,
            config,
            wake: Notify::new(),
            finished,
        }
    }

    /// Ask the loop for a dispatch pass, e.g. after a submission.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Receiver that changes every time a job finishes.
    pub fn subscribe_finished(&self) -> watch::Receiver<u64> {
        self.finished.subscribe()
    }

    pub fn running_jobs(&self) -> Vec<Uuid> {
        self.running.lock().keys().copied().collect()
    }

    pub fn running_count(&self) -> usize {
        self.running.lock().len()
    }

    /// Cancel a queued or running job. Returns false if it already finished.
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        {
            let mut queue = self.queue.write().await;
            if queue.cancel_queued(&job_id) {
                tracing::info!(job_id = %job_id, "Queued job cancelled");
                return Ok(true);
            }
            if queue.get_job(&job_id).is_none() {
                return Err(ReachError::JobNotFound(job_id));
            }
        }
        match self.running.lock().get(&job_id) {
            Some(running) => {
                running.cancel.cancel();
                tracing::info!(job_id = %job_id, "Cancellation requested for running job");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Dispatch loop. Runs a pass on every wake-up and on a safety tick, and
    /// on shutdown cancels running jobs and waits for their cleanup.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(Duration::from_millis(self.config.dispatch_interval_ms));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.wake.notified() => {}
                _ = tick.tick() => {}
            }
            if let Err(e) = self.dispatch_pass().await {
                tracing::error!(error = %e, "Dispatch pass failed");
            }
        }

        self.drain().await;
    }

    /// Cancel every running job and wait until all of them have finished.
    pub async fn drain(&self) {
        let mut finished = self.subscribe_finished();
        let tokens: Vec<CancellationToken> = self
            .running
            .lock()
            .values()
            .map(|r| r.cancel.clone())
            .collect();
        if tokens.is_empty() {
            return;
        }
        tracing::info!(running = tokens.len(), "Draining running jobs");
        tokens.iter().for_each(CancellationToken::cancel);
        while self.running_count() > 0 {
            if finished.changed().await.is_err() {
                break;
            }
        }
        tracing::info!("All running jobs finished");
    }

    async fn snapshot(&self) -> Result<RunningSnapshot> {
        let (running, mut exclusive_routers) = {
            let table = self.running.lock();
            let routers: HashSet<String> = table
                .values()
                .filter(|r| r.kind == JobKind::Detailed)
                .flat_map(|r| r.routers.iter().cloned())
                .collect();
            (table.len(), routers)
        };
        exclusive_routers.extend(self.locks.locks()?.into_iter().map(|l| l.router));
        let mut tags_available = self.tags.available()?;
        if tags_available == 0 {
            // leaked tags only come back through a sweep
            blocking(&self.tags, |tags| tags.reconcile()).await?;
            tags_available = self.tags.available()?;
        }
        Ok(RunningSnapshot {
            running,
            max_concurrent: self.config.max_concurrent_jobs,
            tags_available,
            exclusive_routers,
        })
    }

    /// One scheduling pass. Returns the number of jobs started.
    ///
    /// Jobs leave the queue and enter the running table under one queue
    /// write lock, so [`cancel`](Self::cancel) always finds a job in one
    /// place or the other.
    pub async fn dispatch_pass(self: &Arc<Self>) -> Result<usize> {
        let snapshot = self.snapshot().await?;
        let mut starting = Vec::new();
        {
            let mut queue = self.queue.write().await;
            let ready = queue.dequeue_ready(&snapshot);
            let mut requeue = Vec::new();
            for mut job in ready {
                if job.kind == JobKind::Quick {
                    // another process may have taken the tag the snapshot counted
                    let job_id = job.id;
                    match blocking(&self.tags, move |tags| tags.allocate(job_id)).await {
                        Ok(Some(tag)) => {
                            job.tag = Some(tag);
                            queue.set_tag(&job.id, tag);
                        }
                        Ok(None) => {
                            tracing::debug!(job_id = %job.id, "Tag pool exhausted, job stays queued");
                            requeue.push(job.id);
                            continue;
                        }
                        Err(e) => {
                            tracing::error!(job_id = %job.id, error = %e, "Tag allocation failed");
                            queue.fail(&job.id, JobStatus::Failed, e.to_string(), false);
                            continue;
                        }
                    }
                }
                let cancel = self.register(&job);
                starting.push((job, cancel));
            }
            for id in requeue.iter().rev() {
                queue.requeue_front(id);
            }
        }

        let started = starting.len();
        for (job, cancel) in starting {
            self.spawn_job(job, cancel);
        }
        Ok(started)
    }

    fn register(&self, job: &Job) -> CancellationToken {
        let cancel = CancellationToken::new();
        self.running.lock().insert(
            job.id,
            RunningJob {
                kind: job.kind,
                routers: job.routers.clone(),
                tag: job.tag,
                started: Instant::now(),
                cancel: cancel.clone(),
            },
        );
        cancel
    }

    fn spawn_job(self: &Arc<Self>, job: Job, cancel: CancellationToken) {
        tracing::info!(
            job_id = %job.id,
            kind = %job.kind,
            tag = ?job.tag,
            routers = ?job.routers,
            "Job dispatched"
        );

        let dispatcher = Arc::clone(self);
        tokio::spawn(async move {
            let job_id = job.id;
            let outcome = dispatcher.runner.run(job, cancel).await;
            dispatcher.finish(job_id, outcome).await;
        });
    }

    async fn finish(&self, job_id: Uuid, outcome: JobOutcome) {
        let entry = self.running.lock().remove(&job_id);
        let Some(entry) = entry else {
            tracing::warn!(job_id = %job_id, "Finished job missing from running table");
            return;
        };
        if entry.tag.is_some() {
            if let Err(e) = blocking(&self.tags, move |tags| tags.release(job_id)).await {
                tracing::warn!(job_id = %job_id, error = %e, "Tag release failed, reconciliation will reclaim it");
            }
        }

        let elapsed_ms = entry.started.elapsed().as_millis() as u64;
        let lingering = outcome.lingering_artifacts;
        {
            let mut queue = self.queue.write().await;
            match outcome.result {
                Ok(report) => {
                    tracing::info!(job_id = %job_id, elapsed_ms, lingering, "Job completed");
                    queue.complete(&job_id, report, lingering);
                }
                Err(ReachError::Cancelled) => {
                    tracing::info!(job_id = %job_id, elapsed_ms, lingering, "Job cancelled");
                    queue.fail(&job_id, JobStatus::Cancelled, ReachError::Cancelled.to_string(), lingering);
                }
                Err(e @ ReachError::ConsistencyViolation { .. }) => {
                    tracing::error!(job_id = %job_id, error = %e, "Counter invariant violated, job failed");
                    queue.fail(&job_id, JobStatus::Failed, e.to_string(), lingering);
                }
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, elapsed_ms, lingering, "Job failed");
                    queue.fail(&job_id, JobStatus::Failed, e.to_string(), lingering);
                }
            }
        }

        self.finished.send_modify(|n| *n = n.wrapping_add(1));
        self.wake();
    }
}
