use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::TagPoolConfig;
use crate::error::{ReachError, Result};
use crate::registry::store::RecordStore;
use crate::registry::{Liveness, ProcessLiveness};

const RECORD_NAME: &str = "tags";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagAllocation {
    pub tag: u8,
    pub job_id: Uuid,
    pub owner_pid: u32,
    pub allocated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TagTable {
    allocations: BTreeMap<u8, TagAllocation>,
}

impl TagTable {
    fn tag_of(&self, job_id: &Uuid) -> Option<u8> {
        self.allocations
            .values()
            .find(|a| a.job_id == *job_id)
            .map(|a| a.tag)
    }

    /// Drop allocations of dead owners or older than `stale_after`.
    fn sweep(&mut self, liveness: &dyn Liveness, stale_after: Duration, now: DateTime<Utc>) -> Vec<TagAllocation> {
        let mut reclaimed = Vec::new();
        self.allocations.retain(|_, a| {
            let keep = liveness.is_alive(a.owner_pid) && now - a.allocated_at <= stale_after;
            if !keep {
                reclaimed.push(a.clone());
            }
            keep
        });
        reclaimed
    }
}

/// Hands out packet-isolation tags from a fixed range.
///
/// The pool size bounds quick-job parallelism. Every allocation attempt
/// first sweeps allocations whose owner died or which outlived the stale
/// timeout, so tags leaked by crashed jobs come back without operator action.
#[derive(Debug)]
pub struct TagAllocator {
    store: RecordStore<TagTable>,
    config: TagPoolConfig,
    owner_pid: u32,
    liveness: Arc<dyn Liveness>,
}

impl TagAllocator {
    pub fn open(state_dir: impl AsRef<Path>, config: TagPoolConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store: RecordStore::open(state_dir, RECORD_NAME)?,
            config,
            owner_pid: std::process::id(),
            liveness: Arc::new(ProcessLiveness),
        })
    }

    pub fn with_liveness(mut self, liveness: Arc<dyn Liveness>) -> Self {
        self.liveness = liveness;
        self
    }

    /// Record allocations under a different owner pid.
    pub fn with_owner_pid(mut self, pid: u32) -> Self {
        self.owner_pid = pid;
        self
    }

    pub fn pool_size(&self) -> usize {
        self.config.pool_size()
    }

    fn stale_after(&self) -> Duration {
        Duration::seconds(self.config.stale_after_secs as i64)
    }

    /// Allocate a tag for `job_id`, or `None` if the pool is exhausted.
    ///
    /// A job that already holds a tag gets the same tag back.
    pub fn allocate(&self, job_id: Uuid) -> Result<Option<u8>> {
        let now = Utc::now();
        let stale_after = self.stale_after();
        let (reclaimed, tag) = self.store.update(|table| {
            let reclaimed = table.sweep(self.liveness.as_ref(), stale_after, now);
            if let Some(tag) = table.tag_of(&job_id) {
                return (reclaimed, Some(tag));
            }
            let free = self
                .config
                .range()
                .find(|t| !table.allocations.contains_key(t));
            if let Some(tag) = free {
                table.allocations.insert(
                    tag,
                    TagAllocation {
                        tag,
                        job_id,
                        owner_pid: self.owner_pid,
                        allocated_at: now,
                    },
                );
            }
            (reclaimed, free)
        })?;

        for stale in &reclaimed {
            tracing::warn!(
                tag = stale.tag,
                job_id = %stale.job_id,
                owner_pid = stale.owner_pid,
                "Reclaimed leaked tag"
            );
        }
        match tag {
            Some(tag) => tracing::debug!(job_id = %job_id, tag, "Tag allocated"),
            None => tracing::debug!(job_id = %job_id, "Tag pool exhausted"),
        }
        Ok(tag)
    }

    /// Like [`allocate`](Self::allocate) but reports exhaustion as
    /// [`ReachError::ResourceExhausted`].
    pub fn try_allocate(&self, job_id: Uuid) -> Result<u8> {
        self.allocate(job_id)?.ok_or(ReachError::ResourceExhausted {
            min: self.config.min,
            max: self.config.max,
        })
    }

    /// Release the tag held by `job_id`. Returns false if it held none.
    pub fn release(&self, job_id: Uuid) -> Result<bool> {
        let released = self.store.update(|table| {
            let tag = table.tag_of(&job_id)?;
            table.allocations.remove(&tag)
        })?;
        if let Some(ref a) = released {
            tracing::debug!(job_id = %job_id, tag = a.tag, "Tag released");
        }
        Ok(released.is_some())
    }

    pub fn tag_for(&self, job_id: Uuid) -> Result<Option<u8>> {
        Ok(self.store.load()?.tag_of(&job_id))
    }

    /// Number of tags that an allocation attempt could hand out right now,
    /// not counting allocations a sweep would reclaim.
    pub fn available(&self) -> Result<usize> {
        let table = self.store.load()?;
        let used = self
            .config
            .range()
            .filter(|t| table.allocations.contains_key(t))
            .count();
        Ok(self.pool_size().saturating_sub(used))
    }

    pub fn allocations(&self) -> Result<Vec<TagAllocation>> {
        Ok(self.store.load()?.allocations.into_values().collect())
    }

    /// Sweep dead or expired allocations. Returns what was reclaimed.
    pub fn reconcile(&self) -> Result<Vec<TagAllocation>> {
        let now = Utc::now();
        let stale_after = self.stale_after();
        let reclaimed = self
            .store
            .update(|table| table.sweep(self.liveness.as_ref(), stale_after, now))?;
        for stale in &reclaimed {
            tracing::warn!(tag = stale.tag, job_id = %stale.job_id, "Reconciliation reclaimed tag");
        }
        Ok(reclaimed)
    }
}
