use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::ProbeConfig;
use crate::error::{ReachError, Result};
use crate::net::Backends;
use crate::registry::RouterLocks;
use crate::scheduler::{Job, JobKind, JobOutcome, JobRunner};
use crate::worker::hosts::SharedHosts;
use crate::worker::{detailed, quick};

/// What a running job may touch.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub backends: Backends,
    pub locks: Arc<RouterLocks>,
    pub hosts: SharedHosts,
    pub probe: ProbeConfig,
}

impl WorkerContext {
    /// Probe count for a service: lossy transports get a few packets.
    pub fn probe_count(&self, lossy: bool) -> u32 {
        if lossy {
            self.probe.lossy_probe_count.max(1)
        } else {
            1
        }
    }
}

/// Fails with [`ReachError::Cancelled`] once `cancel` has fired. Checked
/// between phases; calls already in flight are never interrupted.
pub(crate) fn checkpoint(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(ReachError::Cancelled)
    } else {
        Ok(())
    }
}

/// Runs dispatched jobs on the quick or detailed path.
#[derive(Debug, Clone)]
pub struct JobExecutor {
    ctx: Arc<WorkerContext>,
}

impl JobExecutor {
    pub fn new(ctx: WorkerContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    pub fn context(&self) -> &WorkerContext {
        &self.ctx
    }

    pub async fn execute(&self, job: &Job, cancel: &CancellationToken) -> JobOutcome {
        tracing::info!(
            job_id = %job.id,
            kind = %job.kind,
            source = %job.source,
            destination = %job.destination,
            services = job.services.len(),
            "Executing job"
        );
        match job.kind {
            JobKind::Quick => quick::run(&self.ctx, job, cancel).await,
            JobKind::Detailed => detailed::run(&self.ctx, job, cancel).await,
        }
    }
}

#[async_trait]
impl JobRunner for JobExecutor {
    async fn run(&self, job: Job, cancel: CancellationToken) -> JobOutcome {
        self.execute(&job, &cancel).await
    }
}
