use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::registry::{blocking, RouterLocks, TagAllocator};
use crate::worker::hosts::SharedHosts;

/// What one reconciliation pass removed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub tags_reclaimed: usize,
    pub leases_removed: usize,
    pub locks_reclaimed: usize,
    pub orphans_removed: usize,
    pub teardown_failures: usize,
}

impl ReconcileSummary {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Periodically sweeps all three registries for entries whose owner died
/// or expired, and tears down shared resources left without a lease.
#[derive(Debug, Clone)]
pub struct Reconciler {
    interval: Duration,
    tags: Arc<TagAllocator>,
    locks: Arc<RouterLocks>,
    hosts: SharedHosts,
}

impl Reconciler {
    pub fn new(interval_secs: u64, tags: Arc<TagAllocator>, locks: Arc<RouterLocks>, hosts: SharedHosts) -> Self {
        Self {
            interval: Duration::from_secs(interval_secs.max(1)),
            tags,
            locks,
            hosts,
        }
    }

    pub async fn run_once(&self) -> Result<ReconcileSummary> {
        let tags = blocking(&self.tags, |tags| tags.reconcile()).await?;
        let locks = blocking(&self.locks, |locks| locks.reconcile()).await?;
        let leases = blocking(self.hosts.leases(), |leases| leases.reconcile()).await?;
        let failures = self.hosts.teardown_orphans(&leases.orphaned).await;

        Ok(ReconcileSummary {
            tags_reclaimed: tags.len(),
            leases_removed: leases.leases_removed,
            locks_reclaimed: locks.len(),
            orphans_removed: leases.orphaned.len().saturating_sub(failures),
            teardown_failures: failures,
        })
    }

    /// Run passes on the interval until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }
            match self.run_once().await {
                Ok(summary) if summary.is_empty() => {}
                Ok(summary) => tracing::info!(?summary, "Reconciliation pass"),
                Err(e) => tracing::warn!(error = %e, "Reconciliation pass failed"),
            }
        }
    }
}
