use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::Result;
use crate::net::{HostProvisioner, HostSpec};
use crate::registry::{blocking, LeaseKey, LeaseRegistry};
use crate::scheduler::JobKind;

/// Lifecycle of shared transient hosts and neighbor bindings.
///
/// Creation always precedes the lease and destruction only follows a release
/// that brought the count to zero. Within this process, create-and-lease and
/// release-and-destroy on the same resource are serialized so a teardown can
/// never run between another job's creation and its lease.
#[derive(Clone)]
pub struct SharedHosts {
    leases: Arc<LeaseRegistry>,
    provisioner: Arc<dyn HostProvisioner>,
    guards: Arc<Mutex<HashMap<LeaseKey, Arc<tokio::sync::Mutex<()>>>>>,
}

impl std::fmt::Debug for SharedHosts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedHosts")
            .field("leases", &self.leases)
            .finish_non_exhaustive()
    }
}

impl SharedHosts {
    pub fn new(leases: Arc<LeaseRegistry>, provisioner: Arc<dyn HostProvisioner>) -> Self {
        Self {
            leases,
            provisioner,
            guards: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn leases(&self) -> &Arc<LeaseRegistry> {
        &self.leases
    }

    fn guard(&self, key: &LeaseKey) -> Arc<tokio::sync::Mutex<()>> {
        self.guards.lock().entry(key.clone()).or_default().clone()
    }

    /// Drop the per-key guard once nobody else holds or waits on it.
    fn forget_guard(&self, key: &LeaseKey, guard: Arc<tokio::sync::Mutex<()>>) {
        let mut guards = self.guards.lock();
        // one reference in the map, one here
        if Arc::strong_count(&guard) <= 2 {
            guards.remove(key);
        }
    }

    /// Ensure `host` exists and take a lease on it for `job_id`.
    pub async fn acquire_host(&self, job_id: Uuid, kind: JobKind, tag: Option<u8>, host: &HostSpec) -> Result<usize> {
        let key = LeaseKey::host(&host.name);
        let guard = self.guard(&key);
        let result = {
            let _held = guard.lock().await;
            match self.provisioner.create_host(host).await {
                Ok(()) => {
                    let (key, router) = (key.clone(), host.router.clone());
                    blocking(&self.leases, move |leases| {
                        leases.acquire_lease(job_id, &key, &router, kind, tag)
                    })
                    .await
                }
                Err(e) => Err(e),
            }
        };
        self.forget_guard(&key, guard);
        let count = result?;
        tracing::debug!(job_id = %job_id, host = %host.name, ref_count = count, "Shared host leased");
        Ok(count)
    }

    /// Ensure a neighbor entry for `address` exists on `router` and lease it.
    pub async fn acquire_neighbor(
        &self,
        job_id: Uuid,
        kind: JobKind,
        tag: Option<u8>,
        router: &str,
        address: IpAddr,
    ) -> Result<usize> {
        let key = LeaseKey::neighbor(router, address);
        let guard = self.guard(&key);
        let result = {
            let _held = guard.lock().await;
            match self.provisioner.add_neighbor(router, address).await {
                Ok(()) => {
                    let (key, router) = (key.clone(), router.to_string());
                    blocking(&self.leases, move |leases| {
                        leases.acquire_lease(job_id, &key, &router, kind, tag)
                    })
                    .await
                }
                Err(e) => Err(e),
            }
        };
        self.forget_guard(&key, guard);
        result
    }

    /// Drop `job_id`'s lease on `key` and tear the resource down if it was
    /// the last one. A failed teardown is returned after the lease is gone.
    pub async fn release(&self, job_id: Uuid, key: &LeaseKey) -> Result<()> {
        let guard = self.guard(key);
        let result = {
            let _held = guard.lock().await;
            let owned = key.clone();
            match blocking(&self.leases, move |leases| leases.release_lease(job_id, &owned)).await {
                Ok(outcome) if outcome.should_destroy => self.destroy(key).await,
                Ok(_) => Ok(()),
                Err(e) => Err(e),
            }
        };
        self.forget_guard(key, guard);
        result
    }

    /// Release everything `job_id` leased, one resource at a time. Returns
    /// how many teardowns failed.
    pub async fn release_all_for_job(&self, job_id: Uuid) -> Result<usize> {
        let mut failed = 0;
        for key in self.leases.keys_for_job(job_id)? {
            if let Err(e) = self.release(job_id, &key).await {
                tracing::warn!(job_id = %job_id, resource = %key, error = %e, "Teardown failed, resource left for a later job");
                failed += 1;
            }
        }
        Ok(failed)
    }

    /// Tear down resources whose last lease was dropped by reconciliation.
    /// Returns how many teardowns failed.
    pub async fn teardown_orphans(&self, orphaned: &[(LeaseKey, String)]) -> usize {
        let mut failed = 0;
        for (key, router) in orphaned {
            let guard = self.guard(key);
            {
                let _held = guard.lock().await;
                match self.leases.lease_count(key) {
                    Ok(0) => match self.destroy(key).await {
                        Ok(()) => tracing::info!(resource = %key, router = %router, "Orphaned resource removed"),
                        Err(e) => {
                            tracing::warn!(resource = %key, router = %router, error = %e, "Orphan teardown failed");
                            failed += 1;
                        }
                    },
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(resource = %key, error = %e, "Could not re-check lease before teardown");
                        failed += 1;
                    }
                }
            }
            self.forget_guard(key, guard);
        }
        failed
    }

    async fn destroy(&self, key: &LeaseKey) -> Result<()> {
        match key {
            LeaseKey::Host(name) => self.provisioner.remove_host(name).await,
            LeaseKey::Neighbor { router, address } => {
                self.provisioner.remove_neighbor(router, *address).await
            }
        }
    }
}
