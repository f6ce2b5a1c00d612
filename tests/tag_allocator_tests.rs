
use std::collections::HashSet;
use std::sync::Arc;

use reachlab::config::TagPoolConfig;
use reachlab::error::ReachError;
use reachlab::registry::TagAllocator;
use test_harness::FakeLiveness;
use uuid::Uuid;

fn pool(min: u8, max: u8) -> TagPoolConfig {
    TagPoolConfig {
        min,
        max,
        stale_after_secs: 3600,
    }
}

/// Allocating pool_size + 1 tags at once, each from its own allocator
/// instance as separate processes would, yields exactly pool_size tags.
#[test]
fn test_pool_plus_one_concurrent_allocations() {
    let dir = tempfile::tempdir().unwrap();
    let config = TagPoolConfig::default();
    let pool_size = config.pool_size();

    let handles: Vec<_> = (0..pool_size + 1)
        .map(|_| {
            let path = dir.path().to_path_buf();
            let config = config.clone();
            std::thread::spawn(move || {
                let allocator = TagAllocator::open(&path, config).unwrap();
                allocator.try_allocate(Uuid::new_v4())
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let tags: HashSet<u8> = results.iter().filter_map(|r| r.as_ref().ok().copied()).collect();
    let exhausted = results
        .iter()
        .filter(|r| matches!(r, Err(ReachError::ResourceExhausted { .. })))
        .count();

    assert_eq!(tags.len(), pool_size, "every success must get a distinct tag");
    assert_eq!(exhausted, 1);
    assert!(tags.iter().all(|t| (32..=63).contains(t)));
}

#[test]
fn test_allocate_is_idempotent_per_job() {
    let dir = tempfile::tempdir().unwrap();
    let allocator = TagAllocator::open(dir.path(), pool(32, 33)).unwrap();
    let job = Uuid::new_v4();

    let first = allocator.allocate(job).unwrap();
    let second = allocator.allocate(job).unwrap();
    assert_eq!(first, Some(32));
    assert_eq!(first, second);
    assert_eq!(allocator.available().unwrap(), 1);
}

#[test]
fn test_exhausted_pool_returns_none_and_release_frees() {
    let dir = tempfile::tempdir().unwrap();
    let allocator = TagAllocator::open(dir.path(), pool(40, 41)).unwrap();
    let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

    assert_eq!(allocator.allocate(a).unwrap(), Some(40));
    assert_eq!(allocator.allocate(b).unwrap(), Some(41));
    assert_eq!(allocator.allocate(c).unwrap(), None);

    assert!(allocator.release(a).unwrap());
    assert!(!allocator.release(a).unwrap(), "second release is a no-op");
    assert_eq!(allocator.allocate(c).unwrap(), Some(40));
    assert_eq!(allocator.tag_for(c).unwrap(), Some(40));
}

/// A crashed owner's tags come back on the next allocation attempt.
#[test]
fn test_dead_owner_tag_is_reclaimed() {
    let dir = tempfile::tempdir().unwrap();
    let liveness = Arc::new(FakeLiveness::default());

    let crashed = TagAllocator::open(dir.path(), pool(32, 32))
        .unwrap()
        .with_owner_pid(4242)
        .with_liveness(liveness.clone());
    assert_eq!(crashed.allocate(Uuid::new_v4()).unwrap(), Some(32));

    let survivor = TagAllocator::open(dir.path(), pool(32, 32))
        .unwrap()
        .with_liveness(liveness.clone());
    assert_eq!(survivor.allocate(Uuid::new_v4()).unwrap(), None);

    liveness.kill(4242);
    let job = Uuid::new_v4();
    assert_eq!(survivor.allocate(job).unwrap(), Some(32));
    let owners: Vec<_> = survivor.allocations().unwrap().into_iter().map(|a| a.job_id).collect();
    assert_eq!(owners, vec![job]);
}

#[test]
fn test_expired_allocation_is_reclaimed_by_reconcile() {
    let dir = tempfile::tempdir().unwrap();
    let allocator = TagAllocator::open(
        dir.path(),
        TagPoolConfig {
            min: 32,
            max: 35,
            stale_after_secs: 0,
        },
    )
    .unwrap();
    allocator.allocate(Uuid::new_v4()).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(20));

    let reclaimed = allocator.reconcile().unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(allocator.available().unwrap(), 4);
}

/// Tags ride in the six-bit DSCP field, so a pool reaching past 63 would
/// alias tags that are supposed to be distinct.
#[test]
fn test_open_rejects_pool_outside_dscp() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        TagAllocator::open(dir.path(), pool(64, 65)),
        Err(ReachError::InvalidConfig(_))
    ));
    assert!(matches!(
        TagAllocator::open(dir.path(), pool(40, 39)),
        Err(ReachError::InvalidConfig(_))
    ));
    assert!(TagAllocator::open(dir.path(), pool(0, 63)).is_ok());
}

/// An allocation stuck behind another process's record lock leaves the
/// async runtime free to run other work.
#[tokio::test]
async fn test_contended_allocation_does_not_stall_runtime() {
    use fs2::FileExt;

    let dir = tempfile::tempdir().unwrap();
    let allocator = Arc::new(TagAllocator::open(dir.path(), pool(32, 33)).unwrap());
    let foreign = std::fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(dir.path().join("tags.lock"))
        .unwrap();
    foreign.lock_exclusive().unwrap();

    let job = Uuid::new_v4();
    let pending = tokio::spawn({
        let allocator = allocator.clone();
        async move { reachlab::registry::blocking(&allocator, move |a| a.allocate(job)).await }
    });
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!pending.is_finished());

    foreign.unlock().unwrap();
    assert_eq!(pending.await.unwrap().unwrap(), Some(32));
}
