use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ReachConfig;
use crate::error::{ReachError, Result};
use crate::net::Backends;
use crate::registry::{LeaseRegistry, Liveness, ProcessLiveness, RouterLocks, TagAllocator};
use crate::scheduler::{Dispatcher, Job, JobQueue, JobRequest, JobStatusView};
use crate::worker::{JobExecutor, Reconciler, SharedHosts, WorkerContext};

/// Wires the registries, queue, dispatcher and workers together and exposes
/// the job API.
pub struct Coordinator {
    pub config: ReachConfig,
    backends: Backends,
    queue: Arc<RwLock<JobQueue>>,
    tags: Arc<TagAllocator>,
    locks: Arc<RouterLocks>,
    hosts: SharedHosts,
    dispatcher: Arc<Dispatcher>,
    reconciler: Reconciler,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("state_dir", &self.config.state_dir)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    pub fn open(config: ReachConfig, backends: Backends) -> Result<Self> {
        Self::open_with_liveness(config, backends, Arc::new(ProcessLiveness))
    }

    /// Open with a custom owner liveness probe for the registries.
    pub fn open_with_liveness(config: ReachConfig, backends: Backends, liveness: Arc<dyn Liveness>) -> Result<Self> {
        let dir = &config.state_dir;
        let tags = Arc::new(TagAllocator::open(dir, config.tags.clone())?.with_liveness(liveness.clone()));
        let leases = Arc::new(LeaseRegistry::open(dir, &config.registry)?.with_liveness(liveness.clone()));
        let locks = Arc::new(RouterLocks::open(dir, &config.registry)?.with_liveness(liveness));
        let hosts = SharedHosts::new(leases, backends.hosts.clone());

        let executor = JobExecutor::new(WorkerContext {
            backends: backends.clone(),
            locks: locks.clone(),
            hosts: hosts.clone(),
            probe: config.probe.clone(),
        });
        let queue = Arc::new(RwLock::new(JobQueue::with_capacity(config.scheduler.queue_capacity)));
        let dispatcher = Arc::new(Dispatcher::new(
            queue.clone(),
            tags.clone(),
            locks.clone(),
            Arc::new(executor),
            config.scheduler.clone(),
        ));
        let reconciler = Reconciler::new(
            config.registry.reconcile_interval_secs,
            tags.clone(),
            locks.clone(),
            hosts.clone(),
        );

        tracing::info!(
            state_dir = %dir.display(),
            tags = ?config.tags.range(),
            max_concurrent = config.scheduler.max_concurrent_jobs,
            degraded_waiters = locks.is_degraded(),
            "Coordinator ready"
        );

        Ok(Self {
            config,
            backends,
            queue,
            tags,
            locks,
            hosts,
            dispatcher,
            reconciler,
        })
    }

    pub fn tags(&self) -> &Arc<TagAllocator> {
        &self.tags
    }

    pub fn leases(&self) -> &Arc<LeaseRegistry> {
        self.hosts.leases()
    }

    pub fn hosts(&self) -> &SharedHosts {
        &self.hosts
    }

    pub fn locks(&self) -> &Arc<RouterLocks> {
        &self.locks
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Validate and queue a job. Routers are resolved from the topology when
    /// the request does not name them.
    pub async fn submit_job(&self, request: JobRequest) -> Result<Uuid> {
        let routers = match &request.routers {
            Some(routers) => routers.clone(),
            None => {
                self.backends
                    .topology
                    .resolve_path(request.source, request.destination)
                    .await?
            }
        };
        let job = Job::new(request, routers)?;
        let job_id = job.id;
        let kind = job.kind;
        let position = self.queue.write().await.enqueue(job)?;
        tracing::info!(job_id = %job_id, kind = %kind, position, "Job queued");

        self.dispatcher.wake();
        Ok(job_id)
    }

    pub async fn job_status(&self, job_id: Uuid) -> Result<JobStatusView> {
        let queue = self.queue.read().await;
        let job = queue.get_job(&job_id).ok_or(ReachError::JobNotFound(job_id))?;
        Ok(JobStatusView {
            id: job.id,
            kind: job.kind,
            status: job.status,
            position: queue.position(&job_id),
            tag: job.tag,
            report: job.report.clone(),
            error: job.error.clone(),
            lingering_artifacts: job.lingering_artifacts,
        })
    }

    /// Cancel a queued or running job. Returns false if it already finished.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<bool> {
        self.dispatcher.cancel(job_id).await
    }

    /// Wait until `job_id` reaches a terminal status, or `timeout` elapses.
    pub async fn wait_for(&self, job_id: Uuid, timeout: Duration) -> Result<JobStatusView> {
        let mut finished = self.dispatcher.subscribe_finished();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let status = self.job_status(job_id).await?;
            if status.status.is_terminal() {
                return Ok(status);
            }
            match tokio::time::timeout_at(deadline, finished.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return Err(ReachError::Internal("dispatcher stopped".to_string())),
                Err(_) => return Ok(status),
            }
        }
    }

    /// Drop finished jobs from the status table. Returns how many went.
    pub async fn cleanup_finished_jobs(&self) -> usize {
        self.queue.write().await.cleanup_finished_jobs()
    }

    /// Run the dispatcher and reconciler until `shutdown` fires, then wait
    /// for running jobs to finish their cleanup.
    pub async fn run(&self, shutdown: CancellationToken) {
        let reconciler = self.reconciler.clone();
        let reconcile_shutdown = shutdown.clone();
        let reconcile_task = tokio::spawn(async move {
            reconciler.run(reconcile_shutdown).await;
        });

        self.dispatcher.clone().run(shutdown).await;

        if let Err(e) = reconcile_task.await {
            tracing::warn!(error = %e, "Reconciler task ended abnormally");
        }
        tracing::info!("Coordinator stopped");
    }
}
