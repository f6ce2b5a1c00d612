
use std::time::Duration;

use reachlab::coordinator::Coordinator;
use reachlab::error::ReachError;
use reachlab::net::rules::RuleAction;
use reachlab::net::{Backends, Service};
use reachlab::registry::TagAllocator;
use reachlab::scheduler::{JobKind, JobRequest, JobStatus};
use reachlab::verdict::{JobReport, Verdict};
use test_harness::{addr, detailed, line_network, quick, test_config, TestLab, DST, SRC};
use uuid::Uuid;

#[tokio::test]
async fn test_submit_resolves_path_from_topology() {
    let lab = TestLab::start(line_network()).await;

    let status = lab.run_job(quick(vec![Service::icmp()])).await;
    let report = status.report.unwrap();
    let routers: Vec<&str> = report.rows().iter().map(|(r, _, _)| *r).collect();
    assert_eq!(routers, vec!["r1", "r2", "r3"]);
    lab.stop().await;
}

#[tokio::test]
async fn test_explicit_routers_override_topology() {
    let lab = TestLab::start(line_network()).await;

    let status = lab.run_job(quick(vec![Service::tcp(80)]).with_routers(["r2"])).await;
    assert_eq!(status.status, JobStatus::Completed);
    assert_eq!(status.report.unwrap().rows().len(), 1);
    lab.stop().await;
}

#[tokio::test]
async fn test_invalid_submissions_are_rejected() {
    let lab = TestLab::start(line_network()).await;

    let empty = lab.coordinator.submit_job(quick(vec![])).await;
    assert!(matches!(empty, Err(ReachError::InvalidJob(_))));

    let unroutable = JobRequest::new(JobKind::Quick, addr(SRC), addr("192.0.2.1"), vec![Service::tcp(80)]);
    let result = lab.coordinator.submit_job(unroutable).await;
    assert!(matches!(result, Err(ReachError::InvalidJob(_))));
    lab.stop().await;
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let lab = TestLab::start(line_network()).await;
    let id = Uuid::new_v4();

    assert!(matches!(
        lab.coordinator.job_status(id).await,
        Err(ReachError::JobNotFound(_))
    ));
    assert!(matches!(
        lab.coordinator.cancel_job(id).await,
        Err(ReachError::JobNotFound(_))
    ));
    lab.stop().await;
}

#[tokio::test]
async fn test_detailed_job_through_coordinator() {
    let net = line_network();
    net.add_forward_rule("r3", "deny-ssh", Some(Service::tcp(22)), RuleAction::Reject);
    let lab = TestLab::start(net).await;

    let status = lab.run_job(detailed(vec![Service::tcp(22)])).await;
    assert_eq!(status.status, JobStatus::Completed, "{:?}", status.error);
    let Some(JobReport::Detailed { measurements }) = status.report else {
        panic!("expected detailed report");
    };
    assert_eq!(measurements[2].dominant_rule.as_deref(), Some("deny-ssh"));
    assert_eq!(measurements[2].verdict, Verdict::Blocked);
    assert!(lab.coordinator.locks().locks().unwrap().is_empty());
    assert!(!lab.net.has_neighbor("r3", addr(DST)));
    lab.stop().await;
}

/// A detailed job whose routers another process holds stays queued until
/// they are released.
#[tokio::test]
async fn test_detailed_job_queues_behind_foreign_lock() {
    let lab = TestLab::start(line_network()).await;
    let holder = Uuid::new_v4();
    assert!(lab
        .coordinator
        .locks()
        .try_acquire_all(&["r2".to_string()], holder)
        .unwrap());

    let id = lab.coordinator.submit_job(detailed(vec![Service::tcp(80)])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    let status = lab.coordinator.job_status(id).await.unwrap();
    assert_eq!(status.status, JobStatus::Queued);
    assert_eq!(status.position, Some(0));

    lab.coordinator.locks().release("r2", holder).unwrap();
    assert_eq!(lab.wait(id).await.status, JobStatus::Completed);
    lab.stop().await;
}

#[tokio::test]
async fn test_cancel_queued_job() {
    let lab = TestLab::start(line_network()).await;
    let holder = Uuid::new_v4();
    assert!(lab
        .coordinator
        .locks()
        .try_acquire_all(&["r1".to_string()], holder)
        .unwrap());

    let id = lab.coordinator.submit_job(detailed(vec![Service::tcp(80)])).await.unwrap();
    assert!(lab.coordinator.cancel_job(id).await.unwrap());
    let status = lab.wait(id).await;
    assert_eq!(status.status, JobStatus::Cancelled);
    assert!(!lab.coordinator.cancel_job(id).await.unwrap());
    assert_eq!(lab.net.host_creations(), 0);
    lab.stop().await;
}

/// Cancelling a quick job stuck waiting on a router still runs its cleanup.
#[tokio::test]
async fn test_cancel_running_job_cleans_up() {
    let lab = TestLab::start(line_network()).await;
    assert!(lab
        .coordinator
        .locks()
        .try_acquire_all(&["r3".to_string()], Uuid::new_v4())
        .unwrap());

    let id = lab.coordinator.submit_job(quick(vec![Service::tcp(80)])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(lab.coordinator.job_status(id).await.unwrap().status, JobStatus::Running);
    assert!(lab.coordinator.cancel_job(id).await.unwrap());

    // cancellation is checked between phases, so the wait runs to its timeout
    let status = lab.wait(id).await;
    assert!(status.status.is_terminal());
    assert_eq!(lab.residual_rules(), 0);
    assert!(lab.coordinator.tags().allocations().unwrap().is_empty());
    lab.stop().await;
}

#[tokio::test]
async fn test_cleanup_finished_jobs() {
    let lab = TestLab::start(line_network()).await;
    let id = lab.coordinator.submit_job(quick(vec![Service::tcp(80)])).await.unwrap();
    lab.wait(id).await;

    assert_eq!(lab.coordinator.cleanup_finished_jobs().await, 1);
    assert!(matches!(
        lab.coordinator.job_status(id).await,
        Err(ReachError::JobNotFound(_))
    ));
    lab.stop().await;
}

/// Concurrency above the tag pool size queues the excess until tags free up.
#[tokio::test]
async fn test_small_tag_pool_serializes_quick_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir).with_tag_range(50, 50);
    let lab = TestLab::start_with(dir, config, line_network());

    let mut ids = Vec::new();
    for port in [80, 81, 82] {
        ids.push(lab.coordinator.submit_job(quick(vec![Service::tcp(port)])).await.unwrap());
    }
    for id in ids {
        let status = lab.wait(id).await;
        assert_eq!(status.status, JobStatus::Completed);
        assert_eq!(status.tag, Some(50));
    }
    assert_eq!(lab.residual_rules(), 0);
    lab.stop().await;
}

/// A tag leaked by a dead process comes back on a reconciliation pass.
#[tokio::test]
async fn test_reconciler_reclaims_leaked_tag() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let coordinator = Coordinator::open(config.clone(), Backends::uniform(line_network())).unwrap();
    // u32::MAX never names a live process
    let crashed = TagAllocator::open(dir.path(), config.tags.clone())
        .unwrap()
        .with_owner_pid(u32::MAX);
    crashed.allocate(Uuid::new_v4()).unwrap();

    let summary = coordinator.reconciler().run_once().await.unwrap();
    assert_eq!(summary.tags_reclaimed, 1);
    assert!(coordinator.tags().allocations().unwrap().is_empty());
}
