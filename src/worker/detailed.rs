//! Exclusive-lock measurement of the full forward chain.
//!
//! A detailed job reads every forward rule's counters, so any foreign
//! traffic on a router during the window would corrupt it. The whole router
//! set is locked atomically before anything is touched; each router is
//! released as soon as its services are measured, except the router the
//! ephemeral destination host hangs off, which stays locked until that host
//! is gone.

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ReachError, Result};
use crate::net::rules::RuleSelector;
use crate::net::{HostSpec, Probe, Service};
use crate::registry::blocking;
use crate::scheduler::{Job, JobOutcome};
use crate::verdict::{JobReport, ServiceMeasurement};
use crate::worker::executor::{checkpoint, WorkerContext};

/// Resources the job created itself and must remove.
#[derive(Debug, Default)]
struct Ephemeral {
    host: Option<HostSpec>,
    services: Vec<Service>,
    /// Routers still locked by this job.
    held: Vec<String>,
}

pub async fn run(ctx: &WorkerContext, job: &Job, cancel: &CancellationToken) -> JobOutcome {
    let job_id = job.id;
    let timeout = ctx.probe.lock_timeout();
    let acquired = ctx
        .locks
        .acquire_all_or_cancel(&job.routers, job.id, timeout, cancel)
        .await;
    match acquired {
        Ok(true) => {}
        Ok(false) => {
            return JobOutcome::failed(
                ReachError::LockTimeout {
                    routers: job.routers.clone(),
                    waited_ms: timeout.as_millis() as u64,
                },
                false,
            )
        }
        Err(e) => {
            // acquisition is all-or-nothing, but a store error could land
            // after the write; make sure nothing is left
            let lingering = blocking(&ctx.locks, move |locks| locks.release_all_for_job(job_id))
                .await
                .is_err();
            return JobOutcome::failed(e, lingering);
        }
    }

    let mut ephemeral = Ephemeral {
        held: job.routers.clone(),
        ..Default::default()
    };
    let result = measure(ctx, job, cancel, &mut ephemeral).await;
    let lingering = teardown(ctx, job, ephemeral).await;
    match result {
        Ok(measurements) => JobOutcome::completed(JobReport::Detailed { measurements }, lingering),
        Err(e) => JobOutcome::failed(e, lingering),
    }
}

fn destination_host(job: &Job) -> HostSpec {
    job.destination_host.clone().unwrap_or_else(|| HostSpec {
        name: ephemeral_name(job.id),
        address: job.destination,
        router: job.routers[job.routers.len() - 1].clone(),
    })
}

/// Namespace names are limited in length; eight hex digits is plenty for
/// hosts that live as long as one job.
fn ephemeral_name(job_id: Uuid) -> String {
    let simple = job_id.simple().to_string();
    format!("rl-dst-{}", &simple[..8])
}

async fn measure(
    ctx: &WorkerContext,
    job: &Job,
    cancel: &CancellationToken,
    ephemeral: &mut Ephemeral,
) -> Result<Vec<ServiceMeasurement>> {
    checkpoint(cancel)?;

    let destination = destination_host(job);
    ctx.backends.hosts.create_host(&destination).await?;
    ephemeral.host = Some(destination.clone());
    for service in &job.services {
        ctx.backends
            .hosts
            .create_ephemeral_service(&destination.name, service)
            .await?;
        ephemeral.services.push(*service);
    }
    ctx.hosts
        .acquire_neighbor(job.id, job.kind, None, &destination.router, destination.address)
        .await?;
    if let Some(source) = &job.source_host {
        ctx.hosts.acquire_host(job.id, job.kind, None, source).await?;
        ctx.hosts
            .acquire_neighbor(job.id, job.kind, None, &source.router, source.address)
            .await?;
    }
    tracing::info!(job_id = %job.id, destination = %destination.name, "Ephemeral destination ready");

    let origin = match &job.source_host {
        Some(host) => host.name.clone(),
        None => job.routers[0].clone(),
    };
    let mut measurements = Vec::with_capacity(job.routers.len() * job.services.len());
    for router in &job.routers {
        for service in &job.services {
            checkpoint(cancel)?;
            let m = measure_service(ctx, job, router, &origin, *service).await?;
            tracing::info!(
                job_id = %job.id,
                router = %router,
                service = %service,
                dominant_rule = ?m.dominant_rule,
                verdict = %m.verdict,
                "Measured"
            );
            measurements.push(m);
        }

        if ctx.probe.early_release && *router != destination.router {
            let (name, job_id) = (router.clone(), job.id);
            if blocking(&ctx.locks, move |locks| locks.release(&name, job_id)).await? {
                ephemeral.held.retain(|r| r != router);
            }
        }
    }
    Ok(measurements)
}

async fn measure_service(
    ctx: &WorkerContext,
    job: &Job,
    router: &str,
    origin: &str,
    service: Service,
) -> Result<ServiceMeasurement> {
    let filter = &ctx.backends.filter;
    let selector = RuleSelector::forward_chain();

    let baseline = filter.read_counters(router, &selector).await?;
    filter
        .send_probe(&Probe {
            origin: origin.to_string(),
            source: job.source,
            destination: job.destination,
            service,
            tag: None,
            count: ctx.probe_count(service.protocol.is_lossy()),
        })
        .await?;
    tokio::time::sleep(ctx.probe.settle()).await;
    let after = filter.read_counters(router, &selector).await?;

    let m = ServiceMeasurement::from_readings(router, service, &baseline, &after);
    tracing::debug!(job_id = %job.id, router, service = %service, deltas = ?m.deltas, "Forward chain deltas");
    Ok(m)
}

/// Stop services and remove the ephemeral host while its router is still
/// locked, then drop leases and the remaining locks. Returns true when
/// something was left behind.
async fn teardown(ctx: &WorkerContext, job: &Job, ephemeral: Ephemeral) -> bool {
    let mut lingering = false;

    if let Some(host) = &ephemeral.host {
        for service in &ephemeral.services {
            if let Err(e) = ctx.backends.hosts.stop_service(&host.name, service).await {
                tracing::warn!(job_id = %job.id, host = %host.name, service = %service, error = %e, "Failed to stop service");
                lingering = true;
            }
        }
        if let Err(e) = ctx.backends.hosts.remove_host(&host.name).await {
            tracing::warn!(job_id = %job.id, host = %host.name, error = %e, "Failed to remove ephemeral host");
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

    let (held, job_id) = (ephemeral.held, job.id);
    if let Err(e) = blocking(&ctx.locks, move |locks| locks.release_all(&held, job_id)).await {
        tracing::warn!(job_id = %job.id, error = %e, "Router lock release failed");
        lingering = true;
    }
    // backstop for locks an interrupted early release left behind
    if let Err(e) = blocking(&ctx.locks, move |locks| locks.release_all_for_job(job_id)).await {
        tracing::warn!(job_id = %job.id, error = %e, "Router lock release failed");
        lingering = true;
    }
    lingering
}
