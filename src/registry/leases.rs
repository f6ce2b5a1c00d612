use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::RegistryConfig;
use crate::error::Result;
use crate::registry::store::RecordStore;
use crate::registry::{Liveness, ProcessLiveness};
use crate::scheduler::JobKind;

const RECORD_NAME: &str = "leases";

/// A shared resource that jobs reference-count.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LeaseKey {
    /// Shared transient host namespace, by name.
    Host(String),
    /// Static neighbor (ARP) entry on a router.
    Neighbor { router: String, address: IpAddr },
}

impl LeaseKey {
    pub fn host(name: impl Into<String>) -> Self {
        LeaseKey::Host(name.into())
    }

    pub fn neighbor(router: impl Into<String>, address: IpAddr) -> Self {
        LeaseKey::Neighbor {
            router: router.into(),
            address,
        }
    }

    fn neighbor_key(router: &str, address: &IpAddr) -> String {
        format!("{router}/{address}")
    }
}

impl std::fmt::Display for LeaseKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaseKey::Host(name) => write!(f, "host {}", name),
            LeaseKey::Neighbor { router, address } => write!(f, "neighbor {} on {}", address, router),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub job_id: Uuid,
    pub owner_pid: u32,
    pub kind: JobKind,
    pub tag: Option<u8>,
    pub allocated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// Router the resource is physically attached to.
    pub router: String,
    pub leases: Vec<Lease>,
}

impl LeaseRecord {
    pub fn ref_count(&self) -> usize {
        self.leases.len()
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LeaseTable {
    hosts: BTreeMap<String, LeaseRecord>,
    neighbors: BTreeMap<String, NeighborRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NeighborRecord {
    address: IpAddr,
    #[serde(flatten)]
    record: LeaseRecord,
}

impl LeaseTable {
    fn get(&self, key: &LeaseKey) -> Option<&LeaseRecord> {
        match key {
            LeaseKey::Host(name) => self.hosts.get(name),
            LeaseKey::Neighbor { router, address } => self
                .neighbors
                .get(&LeaseKey::neighbor_key(router, address))
                .map(|n| &n.record),
        }
    }

    fn get_mut(&mut self, key: &LeaseKey) -> Option<&mut LeaseRecord> {
        match key {
            LeaseKey::Host(name) => self.hosts.get_mut(name),
            LeaseKey::Neighbor { router, address } => self
                .neighbors
                .get_mut(&LeaseKey::neighbor_key(router, address))
                .map(|n| &mut n.record),
        }
    }

    fn entry(&mut self, key: &LeaseKey, router: &str) -> &mut LeaseRecord {
        let empty = || LeaseRecord {
            router: router.to_string(),
            leases: Vec::new(),
        };
        match key {
            LeaseKey::Host(name) => self.hosts.entry(name.clone()).or_insert_with(empty),
            LeaseKey::Neighbor { router, address } => {
                &mut self
                    .neighbors
                    .entry(LeaseKey::neighbor_key(router, address))
                    .or_insert_with(|| NeighborRecord {
                        address: *address,
                        record: empty(),
                    })
                    .record
            }
        }
    }

    fn remove(&mut self, key: &LeaseKey) {
        match key {
            LeaseKey::Host(name) => {
                self.hosts.remove(name);
            }
            LeaseKey::Neighbor { router, address } => {
                self.neighbors.remove(&LeaseKey::neighbor_key(router, address));
            }
        }
    }

    fn keys(&self) -> Vec<LeaseKey> {
        let hosts = self.hosts.keys().map(|h| LeaseKey::Host(h.clone()));
        let neighbors = self
            .neighbors
            .values()
            .map(|n| LeaseKey::neighbor(n.record.router.clone(), n.address));
        hosts.chain(neighbors).collect()
    }

    /// Remove `job_id`'s lease on `key`. The record disappears when the
    /// count reaches zero.
    fn release(&mut self, job_id: &Uuid, key: &LeaseKey) -> LeaseRelease {
        let Some(record) = self.get_mut(key) else {
            return LeaseRelease {
                ref_count: 0,
                should_destroy: false,
            };
        };
        let before = record.leases.len();
        record.leases.retain(|l| l.job_id != *job_id);
        let removed = record.leases.len() < before;
        let ref_count = record.leases.len();
        if ref_count == 0 {
            self.remove(key);
        }
        LeaseRelease {
            ref_count,
            should_destroy: removed && ref_count == 0,
        }
    }
}

/// Outcome of dropping one lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseRelease {
    pub ref_count: usize,
    /// True only for the caller whose release took the count to zero. That
    /// caller, and nobody else, tears down the physical resource.
    pub should_destroy: bool,
}

/// Resources whose last lease was removed by reconciliation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub leases_removed: usize,
    pub orphaned: Vec<(LeaseKey, String)>,
}

/// Reference counts for shared transient hosts and neighbor bindings.
///
/// Physical creation precedes [`acquire_lease`](Self::acquire_lease);
/// physical destruction follows a [`release_lease`](Self::release_lease)
/// that returned `should_destroy`. The registry never touches the resource
/// itself.
#[derive(Debug)]
pub struct LeaseRegistry {
    store: RecordStore<LeaseTable>,
    timeout: Duration,
    owner_pid: u32,
    liveness: Arc<dyn Liveness>,
}

impl LeaseRegistry {
    pub fn open(state_dir: impl AsRef<Path>, config: &RegistryConfig) -> Result<Self> {
        Ok(Self {
            store: RecordStore::open(state_dir, RECORD_NAME)?,
            timeout: Duration::seconds(config.lease_timeout_secs as i64),
            owner_pid: std::process::id(),
            liveness: Arc::new(ProcessLiveness),
        })
    }

    pub fn with_liveness(mut self, liveness: Arc<dyn Liveness>) -> Self {
        self.liveness = liveness;
        self
    }

    pub fn with_owner_pid(mut self, pid: u32) -> Self {
        self.owner_pid = pid;
        self
    }

    /// Add a lease for `job_id` on `key` and return the new reference count.
    ///
    /// Acquiring twice for the same job does not add a second reference.
    pub fn acquire_lease(
        &self,
        job_id: Uuid,
        key: &LeaseKey,
        router: &str,
        kind: JobKind,
        tag: Option<u8>,
    ) -> Result<usize> {
        let owner_pid = self.owner_pid;
        let count = self.store.update(|table| {
            let record = table.entry(key, router);
            if !record.leases.iter().any(|l| l.job_id == job_id) {
                record.leases.push(Lease {
                    job_id,
                    owner_pid,
                    kind,
                    tag,
                    allocated_at: Utc::now(),
                });
            }
            record.ref_count()
        })?;
        tracing::debug!(job_id = %job_id, resource = %key, ref_count = count, "Lease acquired");
        Ok(count)
    }

    pub fn release_lease(&self, job_id: Uuid, key: &LeaseKey) -> Result<LeaseRelease> {
        let outcome = self.store.update(|table| table.release(&job_id, key))?;
        tracing::debug!(
            job_id = %job_id,
            resource = %key,
            ref_count = outcome.ref_count,
            should_destroy = outcome.should_destroy,
            "Lease released"
        );
        Ok(outcome)
    }

    /// Drop every lease `job_id` holds, returning one release per resource.
    pub fn release_all_for_job(&self, job_id: Uuid) -> Result<Vec<(LeaseKey, String, LeaseRelease)>> {
        self.store.update(|table| {
            let mut released = Vec::new();
            for key in table.keys() {
                let Some(record) = table.get(&key) else { continue };
                if !record.leases.iter().any(|l| l.job_id == job_id) {
                    continue;
                }
                let router = record.router.clone();
                let outcome = table.release(&job_id, &key);
                released.push((key, router, outcome));
            }
            released
        })
    }

    /// Resources `job_id` currently holds a lease on.
    pub fn keys_for_job(&self, job_id: Uuid) -> Result<Vec<LeaseKey>> {
        let table = self.store.load()?;
        Ok(table
            .keys()
            .into_iter()
            .filter(|k| {
                table
                    .get(k)
                    .is_some_and(|r| r.leases.iter().any(|l| l.job_id == job_id))
            })
            .collect())
    }

    pub fn lease_count(&self, key: &LeaseKey) -> Result<usize> {
        Ok(self
            .store
            .load()?
            .get(key)
            .map(LeaseRecord::ref_count)
            .unwrap_or(0))
    }

    pub fn record(&self, key: &LeaseKey) -> Result<Option<LeaseRecord>> {
        Ok(self.store.load()?.get(key).cloned())
    }

    pub fn records(&self) -> Result<Vec<(LeaseKey, LeaseRecord)>> {
        let table = self.store.load()?;
        Ok(table
            .keys()
            .into_iter()
            .filter_map(|k| table.get(&k).cloned().map(|r| (k, r)))
            .collect())
    }

    /// Drop leases of dead owners and leases older than the timeout.
    ///
    /// Resources whose count fell to zero are listed in the report together
    /// with their router; the caller owns their teardown.
    pub fn reconcile(&self) -> Result<ReconcileReport> {
        let now = Utc::now();
        let timeout = self.timeout;
        let liveness = self.liveness.clone();
        let report = self.store.update(|table| {
            let mut report = ReconcileReport::default();
            for key in table.keys() {
                let Some(record) = table.get_mut(&key) else { continue };
                let before = record.leases.len();
                record
                    .leases
                    .retain(|l| liveness.is_alive(l.owner_pid) && now - l.allocated_at <= timeout);
                let removed = before - record.leases.len();
                if removed == 0 {
                    continue;
                }
                report.leases_removed += removed;
                if record.leases.is_empty() {
                    let router = record.router.clone();
                    table.remove(&key);
                    report.orphaned.push((key, router));
                }
            }
            report
        })?;
        if report.leases_removed > 0 {
            tracing::warn!(
                removed = report.leases_removed,
                orphaned = report.orphaned.len(),
                "Reconciliation dropped stale leases"
            );
        }
        Ok(report)
    }
}
