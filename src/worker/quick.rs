//! Tag-isolated verdict run: `prepare → install → probe → collect`, then
//! cleanup whatever happened.
//!
//! Every rule a quick job installs matches only packets marked with its tag,
//! so any number of quick jobs may share a router. They never lock routers;
//! they only wait for detailed jobs holding one to finish.

use futures::future::{join_all, try_join_all};
use tokio_util::sync::CancellationToken;

use crate::error::{ReachError, Result};
use crate::net::rules::{CountingRule, Hook, RuleCounter, RuleSelector};
use crate::net::{Probe, Service};
use crate::scheduler::{Job, JobOutcome};
use crate::verdict::{classify, JobReport, ServiceVerdict};
use crate::worker::executor::{checkpoint, WorkerContext};

pub async fn run(ctx: &WorkerContext, job: &Job, cancel: &CancellationToken) -> JobOutcome {
    let Some(tag) = job.tag else {
        return JobOutcome::failed(
            ReachError::Internal(format!("quick job {} dispatched without a tag", job.id)),
            false,
        );
    };

    let result = phases(ctx, job, tag, cancel).await;
    let lingering = cleanup(ctx, job, tag).await;
    match result {
        Ok(verdicts) => JobOutcome::completed(JobReport::Quick { tag, verdicts }, lingering),
        Err(e) => JobOutcome::failed(e, lingering),
    }
}

async fn phases(ctx: &WorkerContext, job: &Job, tag: u8, cancel: &CancellationToken) -> Result<Vec<ServiceVerdict>> {
    checkpoint(cancel)?;
    prepare(ctx, job, tag).await?;
    checkpoint(cancel)?;
    install(ctx, job, tag).await?;
    checkpoint(cancel)?;
    probe(ctx, job, tag).await?;
    checkpoint(cancel)?;
    collect(ctx, job, tag).await
}

/// Wait out exclusive holders, clear rules a crashed job left under this
/// tag, and bring up the shared source host.
async fn prepare(ctx: &WorkerContext, job: &Job, tag: u8) -> Result<()> {
    let timeout = ctx.probe.wait_timeout();
    try_join_all(job.routers.iter().map(|router| async move {
        if !ctx.locks.wait_until_free(router, timeout).await? {
            return Err(ReachError::WaitTimeout {
                router: router.clone(),
                waited_ms: timeout.as_millis() as u64,
            });
        }
        let stale = ctx
            .backends
            .filter
            .delete_rules(router, &RuleSelector::tag(tag))
            .await?;
        if stale > 0 {
            tracing::warn!(job_id = %job.id, router = %router, tag, removed = stale, "Removed stale tagged rules");
        }
        Ok(())
    }))
    .await?;

    if let Some(host) = &job.source_host {
        ctx.hosts.acquire_host(job.id, job.kind, Some(tag), host).await?;
        ctx.hosts
            .acquire_neighbor(job.id, job.kind, Some(tag), &host.router, host.address)
            .await?;
    }
    Ok(())
}

/// One install per router holding the ingress and egress rule of every
/// service, so a router either counts all services or none.
async fn install(ctx: &WorkerContext, job: &Job, tag: u8) -> Result<()> {
    let rules: Vec<CountingRule> = job
        .services
        .iter()
        .flat_map(|s| CountingRule::pair(tag, job.id, *s))
        .collect();
    try_join_all(
        job.routers
            .iter()
            .map(|router| ctx.backends.filter.install_rules(router, &rules)),
    )
    .await?;
    tracing::debug!(job_id = %job.id, tag, rules = rules.len(), routers = job.routers.len(), "Counting rules installed");
    Ok(())
}

async fn probe(ctx: &WorkerContext, job: &Job, tag: u8) -> Result<()> {
    let origin = match &job.source_host {
        Some(host) => host.name.clone(),
        None => job.routers[0].clone(),
    };
    let probes: Vec<Probe> = job
        .services
        .iter()
        .map(|service| Probe {
            origin: origin.clone(),
            source: job.source,
            destination: job.destination,
            service: *service,
            tag: Some(tag),
            count: ctx.probe_count(service.protocol.is_lossy()),
        })
        .collect();
    try_join_all(probes.iter().map(|p| ctx.backends.filter.send_probe(p))).await?;
    tokio::time::sleep(ctx.probe.settle()).await;
    Ok(())
}

/// Read each router's counters once. The rules were installed fresh by this
/// job, so the readings are the deltas.
async fn collect(ctx: &WorkerContext, job: &Job, tag: u8) -> Result<Vec<ServiceVerdict>> {
    let selector = RuleSelector::job(tag, job.id);
    let readings = try_join_all(job.routers.iter().map(|router| {
        let selector = &selector;
        async move {
            let counters = ctx.backends.filter.read_counters(router, selector).await?;
            Ok::<_, ReachError>((router, counters))
        }
    }))
    .await?;

    let mut verdicts = Vec::with_capacity(job.routers.len() * job.services.len());
    for (router, counters) in readings {
        for service in &job.services {
            let pre_delta = packets(&counters, Hook::PreRouting, service, router)?;
            let post_delta = packets(&counters, Hook::PostRouting, service, router)?;
            let verdict = classify(pre_delta, post_delta, router, service)?;
            tracing::info!(
                job_id = %job.id,
                router = %router,
                service = %service,
                pre_delta,
                post_delta,
                verdict = %verdict,
                "Verdict"
            );
            verdicts.push(ServiceVerdict {
                router: router.clone(),
                service: *service,
                verdict,
                pre_delta,
                post_delta,
            });
        }
    }
    Ok(verdicts)
}

fn packets(counters: &[RuleCounter], hook: Hook, service: &Service, router: &str) -> Result<u64> {
    counters
        .iter()
        .filter_map(|c| c.counting.as_ref().map(|rule| (rule, c.packets)))
        .find(|(rule, _)| rule.hook == hook && rule.service == *service)
        .map(|(_, packets)| packets)
        .ok_or_else(|| {
            ReachError::Provisioning(format!(
                "{} counting rule for {service} missing on {router}",
                hook.chain()
            ))
        })
}

/// Remove exactly this job's rules and drop its leases. Never fails; returns
/// true when something could not be removed.
async fn cleanup(ctx: &WorkerContext, job: &Job, tag: u8) -> bool {
    let selector = RuleSelector::job(tag, job.id);
    let results = join_all(
        job.routers
            .iter()
            .map(|router| ctx.backends.filter.delete_rules(router, &selector)),
    )
    .await;

    let mut lingering = false;
    for (router, result) in job.routers.iter().zip(results) {
        if let Err(e) = result {
            tracing::warn!(job_id = %job.id, router = %router, tag, error = %e, "Rule cleanup failed");
            lingering = true;
        }
    }

    match ctx.hosts.release_all_for_job(job.id).await {
        Ok(0) => {}
        Ok(failed) => {
            tracing::warn!(job_id = %job.id, failed, "Shared resource teardown incomplete");
            lingering = true;
        }
        Err(e) => {
            tracing::warn!(job_id = %job.id, error = %e, "Lease release failed");
            lingering = true;
        }
    }
    lingering
}
