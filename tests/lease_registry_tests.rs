
use std::sync::Arc;

use reachlab::config::RegistryConfig;
use reachlab::registry::{LeaseKey, LeaseRegistry};
use reachlab::scheduler::JobKind;
use test_harness::{addr, FakeLiveness};
use uuid::Uuid;

fn open(dir: &tempfile::TempDir) -> LeaseRegistry {
    LeaseRegistry::open(dir.path(), &RegistryConfig::default()).unwrap()
}

/// N acquires then N releases from distinct jobs end at zero, and exactly
/// one release is told to destroy the resource.
#[test]
fn test_n_acquires_n_releases_destroy_once() {
    let dir = tempfile::tempdir().unwrap();
    let registry = open(&dir);
    let key = LeaseKey::host("src-shared");
    let jobs: Vec<Uuid> = (0..8).map(|_| Uuid::new_v4()).collect();

    for (i, job) in jobs.iter().enumerate() {
        let count = registry
            .acquire_lease(*job, &key, "r1", JobKind::Quick, Some(32 + i as u8))
            .unwrap();
        assert_eq!(count, i + 1);
    }
    assert_eq!(registry.lease_count(&key).unwrap(), jobs.len());

    let mut destroy = 0;
    for job in &jobs {
        let outcome = registry.release_lease(*job, &key).unwrap();
        if outcome.should_destroy {
            destroy += 1;
            assert_eq!(outcome.ref_count, 0);
        }
    }
    assert_eq!(destroy, 1);
    assert_eq!(registry.lease_count(&key).unwrap(), 0);
    assert!(registry.record(&key).unwrap().is_none());
}

#[test]
fn test_concurrent_acquire_release_across_instances() {
    let dir = tempfile::tempdir().unwrap();
    let key = LeaseKey::host("src-shared");

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let path = dir.path().to_path_buf();
            let key = key.clone();
            std::thread::spawn(move || {
                let registry = LeaseRegistry::open(&path, &RegistryConfig::default()).unwrap();
                let job = Uuid::new_v4();
                registry.acquire_lease(job, &key, "r1", JobKind::Quick, None).unwrap();
                registry.release_lease(job, &key).unwrap().should_destroy
            })
        })
        .collect();
    let destroys = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|d| *d)
        .count();

    // every interleaving ends at zero; each drop to zero destroys once
    assert!(destroys >= 1);
    assert_eq!(open(&dir).lease_count(&key).unwrap(), 0);
}

#[test]
fn test_double_acquire_counts_once() {
    let dir = tempfile::tempdir().unwrap();
    let registry = open(&dir);
    let key = LeaseKey::host("h");
    let job = Uuid::new_v4();

    assert_eq!(registry.acquire_lease(job, &key, "r1", JobKind::Detailed, None).unwrap(), 1);
    assert_eq!(registry.acquire_lease(job, &key, "r1", JobKind::Detailed, None).unwrap(), 1);
    assert!(registry.release_lease(job, &key).unwrap().should_destroy);
}

#[test]
fn test_release_without_lease_never_destroys() {
    let dir = tempfile::tempdir().unwrap();
    let registry = open(&dir);
    let key = LeaseKey::host("h");
    let owner = Uuid::new_v4();
    registry.acquire_lease(owner, &key, "r1", JobKind::Quick, Some(32)).unwrap();

    let stranger = registry.release_lease(Uuid::new_v4(), &key).unwrap();
    assert!(!stranger.should_destroy);
    assert_eq!(stranger.ref_count, 1);

    let missing = registry.release_lease(owner, &LeaseKey::host("other")).unwrap();
    assert!(!missing.should_destroy);
}

#[test]
fn test_neighbor_bindings_are_keyed_by_router_and_address() {
    let dir = tempfile::tempdir().unwrap();
    let registry = open(&dir);
    let on_r1 = LeaseKey::neighbor("r1", addr("10.0.0.5"));
    let on_r2 = LeaseKey::neighbor("r2", addr("10.0.0.5"));
    let job = Uuid::new_v4();

    registry.acquire_lease(job, &on_r1, "r1", JobKind::Quick, Some(32)).unwrap();
    registry.acquire_lease(job, &on_r2, "r2", JobKind::Quick, Some(32)).unwrap();
    assert_eq!(registry.lease_count(&on_r1).unwrap(), 1);
    assert_eq!(registry.lease_count(&on_r2).unwrap(), 1);

    let released = registry.release_all_for_job(job).unwrap();
    assert_eq!(released.len(), 2);
    assert!(released.iter().all(|(_, _, r)| r.should_destroy));
    assert!(registry.records().unwrap().is_empty());
}

/// Reconciliation drops dead owners' leases and reports resources left
/// with no lease at all.
#[test]
fn test_reconcile_reports_orphans() {
    let dir = tempfile::tempdir().unwrap();
    let liveness = Arc::new(FakeLiveness::default());
    let crashed = open(&dir).with_owner_pid(5151).with_liveness(liveness.clone());
    let alive = open(&dir).with_liveness(liveness.clone());

    let shared = LeaseKey::host("shared");
    let lonely = LeaseKey::host("lonely");
    crashed.acquire_lease(Uuid::new_v4(), &shared, "r1", JobKind::Quick, Some(32)).unwrap();
    crashed.acquire_lease(Uuid::new_v4(), &lonely, "r2", JobKind::Quick, Some(33)).unwrap();
    alive.acquire_lease(Uuid::new_v4(), &shared, "r1", JobKind::Quick, Some(34)).unwrap();

    liveness.kill(5151);
    let report = alive.reconcile().unwrap();
    assert_eq!(report.leases_removed, 2);
    assert_eq!(report.orphaned, vec![(lonely.clone(), "r2".to_string())]);
    assert_eq!(alive.lease_count(&shared).unwrap(), 1);
    assert_eq!(alive.lease_count(&lonely).unwrap(), 0);
}
