
use std::time::Duration;

use reachlab::net::rules::CountingRule;
use reachlab::net::{HostSpec, PacketFilter, Service};
use reachlab::scheduler::JobStatus;
use reachlab::verdict::{JobReport, Verdict};
use test_harness::{addr, line_network, quick, TestLab, ROUTERS, SRC};
use uuid::Uuid;

fn verdicts(report: &JobReport, service: Service) -> Vec<Verdict> {
    ROUTERS
        .iter()
        .map(|r| report.verdict(r, &service).expect("missing row"))
        .collect()
}

/// Open path: every router forwards every probe.
#[tokio::test]
async fn test_open_path_is_reachable_everywhere() {
    let lab = TestLab::start(line_network()).await;

    let status = lab.run_job(quick(vec![Service::tcp(80), Service::tcp(443)])).await;
    assert_eq!(status.status, JobStatus::Completed, "{:?}", status.error);
    let report = status.report.unwrap();
    assert_eq!(report.rows().len(), 6);
    for service in [Service::tcp(80), Service::tcp(443)] {
        assert_eq!(verdicts(&report, service), vec![Verdict::Reachable; 3]);
    }
    assert!(!status.lingering_artifacts);
    assert_eq!(lab.residual_rules(), 0);
    lab.stop().await;
}

/// A drop on r2 shows up as blocked there, and routers past it never see
/// the probe.
#[tokio::test]
async fn test_blocked_router_and_unknown_beyond() {
    let net = line_network();
    net.block("r2", Service::tcp(22));
    let lab = TestLab::start(net).await;

    let status = lab.run_job(quick(vec![Service::tcp(22), Service::tcp(80)])).await;
    assert_eq!(status.status, JobStatus::Completed);
    let report = status.report.unwrap();
    assert_eq!(
        verdicts(&report, Service::tcp(22)),
        vec![Verdict::Reachable, Verdict::Blocked, Verdict::Unknown]
    );
    assert_eq!(verdicts(&report, Service::tcp(80)), vec![Verdict::Reachable; 3]);
    lab.stop().await;
}

#[tokio::test]
async fn test_lossy_service_sends_several_probes() {
    let lab = TestLab::start(line_network()).await;

    let status = lab.run_job(quick(vec![Service::udp(53)])).await;
    let Some(JobReport::Quick { verdicts, .. }) = status.report else {
        panic!("expected quick report, got {status:?}");
    };
    for v in &verdicts {
        assert_eq!((v.pre_delta, v.post_delta), (3, 3));
        assert_eq!(v.verdict, Verdict::Reachable);
    }
    lab.stop().await;
}

/// Two quick jobs on the same routers at the same time each count only
/// their own probes.
#[tokio::test]
async fn test_concurrent_quick_jobs_are_isolated() {
    let lab = TestLab::start(line_network()).await;

    let a = lab.coordinator.submit_job(quick(vec![Service::tcp(80)])).await.unwrap();
    let b = lab.coordinator.submit_job(quick(vec![Service::tcp(80)])).await.unwrap();
    let (a, b) = tokio::join!(lab.wait(a), lab.wait(b));

    assert_ne!(a.tag, b.tag);
    for status in [a, b] {
        assert_eq!(status.status, JobStatus::Completed);
        let Some(JobReport::Quick { verdicts, .. }) = status.report else {
            panic!("expected quick report");
        };
        assert_eq!(verdicts.len(), 3);
        for v in verdicts {
            assert_eq!((v.pre_delta, v.post_delta), (1, 1), "cross-talk on {}", v.router);
        }
    }
    assert_eq!(lab.residual_rules(), 0);
    assert_eq!(lab.coordinator.tags().allocations().unwrap().len(), 0);
    lab.stop().await;
}

#[tokio::test]
async fn test_many_concurrent_quick_jobs_leave_nothing_behind() {
    let lab = TestLab::start(line_network()).await;

    let mut ids = Vec::new();
    for port in 1000..1010 {
        ids.push(lab.coordinator.submit_job(quick(vec![Service::tcp(port)])).await.unwrap());
    }
    for id in ids {
        assert_eq!(lab.wait(id).await.status, JobStatus::Completed);
    }
    assert_eq!(lab.residual_rules(), 0);
    lab.stop().await;
}

/// Rules a crashed job left under a tag are removed by the next job that
/// receives that tag, and do not distort its counts.
#[tokio::test]
async fn test_stale_rules_under_reused_tag_are_cleared() {
    let net = line_network();
    let crashed_job = Uuid::new_v4();
    for router in ROUTERS {
        net.install_rules(router, &CountingRule::pair(32, crashed_job, Service::tcp(80)))
            .await
            .unwrap();
    }
    assert_eq!(net.rules_with_tag("r1", 32), 2);
    let lab = TestLab::start(net).await;

    let status = lab.run_job(quick(vec![Service::tcp(80)])).await;
    assert_eq!(status.tag, Some(32));
    assert_eq!(status.status, JobStatus::Completed);
    let Some(JobReport::Quick { verdicts, .. }) = status.report else {
        panic!("expected quick report");
    };
    assert!(verdicts.iter().all(|v| v.pre_delta == 1 && v.post_delta == 1));
    assert_eq!(lab.residual_rules(), 0);
    lab.stop().await;
}

/// Egress counting without ingress fails the job loudly and still cleans up.
#[tokio::test]
async fn test_consistency_violation_fails_job() {
    let net = line_network();
    net.skew_counters("r2");
    let lab = TestLab::start(net).await;

    let status = lab.run_job(quick(vec![Service::tcp(80)])).await;
    assert_eq!(status.status, JobStatus::Failed);
    let error = status.error.unwrap();
    assert!(error.contains("consistency violation"), "{error}");
    assert!(error.contains("r2"), "{error}");
    assert!(status.report.is_none());
    assert_eq!(lab.residual_rules(), 0);
    assert!(lab.coordinator.tags().allocations().unwrap().is_empty());
    lab.stop().await;
}

/// More egress than ingress is just as broken as egress alone.
#[tokio::test]
async fn test_egress_above_ingress_fails_job() {
    let net = line_network();
    net.double_egress_counters("r1");
    let lab = TestLab::start(net).await;

    let status = lab.run_job(quick(vec![Service::tcp(80)])).await;
    assert_eq!(status.status, JobStatus::Failed);
    let error = status.error.unwrap();
    assert!(error.contains("consistency violation on router r1"), "{error}");
    assert!(error.contains("ingress delta 1, egress delta 2"), "{error}");
    assert_eq!(lab.residual_rules(), 0);
    lab.stop().await;
}

#[tokio::test]
async fn test_install_failure_cleans_installed_rules() {
    let net = line_network();
    net.fail_installs("r3");
    let lab = TestLab::start(net).await;

    let status = lab.run_job(quick(vec![Service::tcp(80)])).await;
    assert_eq!(status.status, JobStatus::Failed);
    assert!(status.error.unwrap().contains("rule install rejected"));
    assert_eq!(lab.residual_rules(), 0);
    lab.stop().await;
}

/// Rules that cannot be removed are reported, not silently left behind.
#[tokio::test]
async fn test_failed_rule_removal_flags_lingering_artifacts() {
    let net = line_network();
    net.fail_deletes("r2");
    let lab = TestLab::start(net).await;

    let status = lab.run_job(quick(vec![Service::tcp(80)])).await;
    assert_eq!(status.status, JobStatus::Completed, "{:?}", status.error);
    assert!(status.lingering_artifacts);
    assert_eq!(lab.net.counting_rules("r2").len(), 2);
    assert!(lab.net.counting_rules("r1").is_empty());
    lab.stop().await;
}

/// Jobs sharing a source host reference-count it: created once, removed
/// once the last job is done.
#[tokio::test]
async fn test_shared_source_host_lifecycle() {
    let lab = TestLab::start(line_network()).await;
    let host = HostSpec {
        name: "src-shared".to_string(),
        address: addr(SRC),
        router: "r1".to_string(),
    };

    let a = lab
        .coordinator
        .submit_job(quick(vec![Service::tcp(80)]).with_source_host(host.clone()))
        .await
        .unwrap();
    let b = lab
        .coordinator
        .submit_job(quick(vec![Service::tcp(443)]).with_source_host(host.clone()))
        .await
        .unwrap();
    let (a, b) = tokio::join!(lab.wait(a), lab.wait(b));
    assert_eq!(a.status, JobStatus::Completed);
    assert_eq!(b.status, JobStatus::Completed);

    assert!(!lab.net.host_exists("src-shared"));
    assert!(!lab.net.has_neighbor("r1", addr(SRC)));
    assert_eq!(lab.net.host_creations(), lab.net.host_removals());
    assert!(lab.coordinator.leases().records().unwrap().is_empty());
    lab.stop().await;
}

/// Quick jobs wait for a detailed holder to release a router instead of
/// probing through it.
#[tokio::test]
async fn test_quick_job_waits_for_exclusive_holder() {
    let lab = TestLab::start(line_network()).await;
    let holder = Uuid::new_v4();
    assert!(lab
        .coordinator
        .locks()
        .try_acquire_all(&["r2".to_string()], holder)
        .unwrap());

    let id = lab.coordinator.submit_job(quick(vec![Service::tcp(80)])).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(lab.coordinator.job_status(id).await.unwrap().status, JobStatus::Running);
    assert_eq!(lab.net.probes_sent(), 0);

    lab.coordinator.locks().release("r2", holder).unwrap();
    assert_eq!(lab.wait(id).await.status, JobStatus::Completed);
    lab.stop().await;
}

#[tokio::test]
async fn test_quick_job_wait_times_out() {
    let lab = TestLab::start(line_network()).await;
    assert!(lab
        .coordinator
        .locks()
        .try_acquire_all(&["r3".to_string()], Uuid::new_v4())
        .unwrap());

    let status = lab.run_job(quick(vec![Service::tcp(80)])).await;
    assert_eq!(status.status, JobStatus::Failed);
    assert!(status.error.unwrap().contains("router r3"));
    assert_eq!(lab.net.probes_sent(), 0);
    assert_eq!(lab.residual_rules(), 0);
    lab.stop().await;
}
