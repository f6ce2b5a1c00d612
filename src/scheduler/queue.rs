use std::collections::{HashMap, HashSet, VecDeque};

use chrono::Utc;
use uuid::Uuid;

use crate::error::{ReachError, Result};
use crate::scheduler::job::{Job, JobKind, JobStatus};
use crate::verdict::JobReport;

const DEFAULT_MAX_JOBS: usize = 10_000;

/// What the dispatcher knows about running work when it asks for jobs.
#[derive(Debug, Clone, Default)]
pub struct RunningSnapshot {
    pub running: usize,
    pub max_concurrent: usize,
    /// Tags the allocator could hand out now.
    pub tags_available: usize,
    /// Routers held exclusively, by running detailed jobs or by other
    /// processes' locks.
    pub exclusive_routers: HashSet<String>,
}

/// FIFO intake with selective dequeue, plus the status of every job it has
/// seen until [`cleanup_finished_jobs`](JobQueue::cleanup_finished_jobs).
#[derive(Debug)]
pub struct JobQueue {
    jobs: HashMap<Uuid, Job>,
    pending: VecDeque<Uuid>,
    max_jobs: usize,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            pending: VecDeque::new(),
            max_jobs,
        }
    }

    /// Queue a job. Returns how many queued jobs are ahead of it.
    ///
    /// Capacity bounds unfinished jobs. Once the table is full of finished
    /// ones, the oldest of those are forgotten to make room.
    pub fn enqueue(&mut self, mut job: Job) -> Result<usize> {
        if self.is_full() {
            return Err(ReachError::QueueFull);
        }
        if self.jobs.len() >= self.max_jobs {
            self.evict_finished(self.jobs.len() + 1 - self.max_jobs);
        }
        job.status = JobStatus::Queued;
        let position = self.pending.len();
        self.pending.push_back(job.id);
        self.jobs.insert(job.id, job);
        Ok(position)
    }

    /// Pop, in FIFO order, every queued job that may start now.
    ///
    /// A quick job needs a free tag. A detailed job needs all of its routers
    /// to be free of exclusive holders; when it cannot start, its routers
    /// stay reserved for the rest of the scan so a later detailed job on the
    /// same routers cannot overtake it. Quick jobs are never held back by
    /// router locks here; they wait for release themselves.
    pub fn dequeue_ready(&mut self, snapshot: &RunningSnapshot) -> Vec<Job> {
        let mut slots = snapshot.max_concurrent.saturating_sub(snapshot.running);
        let mut tags = snapshot.tags_available;
        let mut reserved = snapshot.exclusive_routers.clone();
        let mut ready: Vec<Uuid> = Vec::new();

        for id in &self.pending {
            if slots == 0 {
                break;
            }
            let Some(job) = self.jobs.get(id) else { continue };
            match job.kind {
                JobKind::Quick => {
                    if tags == 0 {
                        continue;
                    }
                    tags -= 1;
                }
                JobKind::Detailed => {
                    let blocked = job.routers.iter().any(|r| reserved.contains(r));
                    reserved.extend(job.routers.iter().cloned());
                    if blocked {
                        continue;
                    }
                }
            }
            slots -= 1;
            ready.push(*id);
        }

        self.pending.retain(|id| !ready.contains(id));
        let now = Utc::now();
        ready
            .iter()
            .filter_map(|id| {
                let job = self.jobs.get_mut(id)?;
                job.status = JobStatus::Running;
                job.started_at = Some(now);
                Some(job.clone())
            })
            .collect()
    }

    /// Put a dispatched job back at the head of the queue, e.g. when its tag
    /// allocation lost a race with another process.
    pub fn requeue_front(&mut self, job_id: &Uuid) -> bool {
        let Some(job) = self.jobs.get_mut(job_id) else {
            return false;
        };
        job.status = JobStatus::Queued;
        job.tag = None;
        job.started_at = None;
        if !self.pending.contains(job_id) {
            self.pending.push_front(*job_id);
        }
        true
    }

    pub fn set_tag(&mut self, job_id: &Uuid, tag: u8) -> bool {
        match self.jobs.get_mut(job_id) {
            Some(job) => {
                job.tag = Some(tag);
                true
            }
            None => false,
        }
    }

    /// Cancel a job that has not started. Returns false if it is not queued.
    pub fn cancel_queued(&mut self, job_id: &Uuid) -> bool {
        let Some(job) = self.jobs.get_mut(job_id) else {
            return false;
        };
        if job.status != JobStatus::Queued {
            return false;
        }
        job.status = JobStatus::Cancelled;
        job.completed_at = Some(Utc::now());
        self.pending.retain(|id| id != job_id);
        true
    }

    pub fn complete(&mut self, job_id: &Uuid, report: JobReport, lingering_artifacts: bool) -> bool {
        let Some(job) = self.jobs.get_mut(job_id) else {
            return false;
        };
        job.status = JobStatus::Completed;
        job.report = Some(report);
        job.lingering_artifacts = lingering_artifacts;
        job.completed_at = Some(Utc::now());
        true
    }

    pub fn fail(&mut self, job_id: &Uuid, status: JobStatus, error: String, lingering_artifacts: bool) -> bool {
        let Some(job) = self.jobs.get_mut(job_id) else {
            return false;
        };
        job.status = status;
        job.error = Some(error);
        job.lingering_artifacts = lingering_artifacts;
        job.completed_at = Some(Utc::now());
        true
    }

    pub fn get_job(&self, id: &Uuid) -> Option<&Job> {
        self.jobs.get(id)
    }

    /// Jobs ahead of `id`, if it is queued.
    pub fn position(&self, id: &Uuid) -> Option<usize> {
        self.pending.iter().position(|p| p == id)
    }

    /// Queued jobs in FIFO order.
    pub fn pending_jobs(&self) -> Vec<&Job> {
        self.pending.iter().filter_map(|id| self.jobs.get(id)).collect()
    }

    /// Get all jobs sorted chronologically by creation time
    pub fn all_jobs(&self) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Remove terminal jobs. Returns the number of jobs removed.
    pub fn cleanup_finished_jobs(&mut self) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|_, job| !job.status.is_terminal());
        before - self.jobs.len()
    }

    fn evict_finished(&mut self, count: usize) {
        let mut finished: Vec<(chrono::DateTime<Utc>, Uuid)> = self
            .jobs
            .values()
            .filter(|j| j.status.is_terminal())
            .map(|j| (j.completed_at.unwrap_or(j.created_at), j.id))
            .collect();
        finished.sort();
        for (_, id) in finished.into_iter().take(count) {
            self.jobs.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Jobs that are queued or running.
    pub fn active_len(&self) -> usize {
        self.jobs.values().filter(|j| !j.status.is_terminal()).count()
    }

    pub fn is_full(&self) -> bool {
        self.active_len() >= self.max_jobs
    }
}
