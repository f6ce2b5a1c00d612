use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use reachlab::config::ReachConfig;
use reachlab::coordinator::Coordinator;
use reachlab::net::shell::ShellBackend;
use reachlab::net::{Backends, HostSpec, Service};
use reachlab::scheduler::{JobKind, JobRequest, JobStatusView};
use reachlab::shutdown::install_shutdown_handler;
use reachlab::verdict::JobReport;

#[derive(Parser, Debug)]
#[command(name = "reachlab")]
#[command(version)]
#[command(about = "Packet-counter reachability tests against shared router namespaces")]
#[command(propagate_version = true)]
struct Args {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Parser, Debug)]
struct GlobalArgs {
    /// Directory holding the shared tag, lease and lock records
    #[arg(long, global = true, default_value = "/dev/shm/reachlab")]
    state_dir: PathBuf,

    /// Output format
    #[arg(long, short = 'o', global = true, default_value = "table")]
    output: OutputFormat,

    /// Host provisioning tool
    #[arg(long, global = true, default_value = "reachlab-host")]
    host_tool: PathBuf,

    /// Path computation tool
    #[arg(long, global = true, default_value = "reachlab-trace")]
    trace_tool: PathBuf,

    /// Run namespace and filter commands through `sudo -n`
    #[arg(long, global = true)]
    sudo: bool,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run one job and wait for its result
    Run(RunArgs),

    /// Tag allocations
    Tags {
        #[command(subcommand)]
        command: RegistryCommands,
    },

    /// Shared host and neighbor leases
    Leases {
        #[command(subcommand)]
        command: RegistryCommands,
    },

    /// Exclusive router locks
    Locks {
        #[command(subcommand)]
        command: LockCommands,
    },
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KindArg {
    Quick,
    Detailed,
}

impl From<KindArg> for JobKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Quick => JobKind::Quick,
            KindArg::Detailed => JobKind::Detailed,
        }
    }
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[arg(long, default_value = "quick")]
    kind: KindArg,

    #[arg(long)]
    source: IpAddr,

    #[arg(long)]
    destination: IpAddr,

    /// Service to test, e.g. "80/tcp", "53/udp", "icmp" (repeatable)
    #[arg(long = "service", short = 's', required = true, value_delimiter = ',')]
    services: Vec<Service>,

    /// Routers to test, in path order. Resolved from the topology if omitted
    #[arg(long = "router", short = 'r', value_delimiter = ',')]
    routers: Vec<String>,

    /// Shared source host to probe from, as NAME@ROUTER
    #[arg(long, value_parser = parse_host)]
    source_host: Option<(String, String)>,

    /// Owner recorded with the job
    #[arg(long, default_value = "cli")]
    owner: String,

    /// Give up waiting for the result after this many seconds
    #[arg(long, default_value = "600")]
    timeout_secs: u64,

    /// Lowest tag value in the pool
    #[arg(long, default_value = "32", value_parser = clap::value_parser!(u8).range(0..=63))]
    tag_min: u8,

    /// Highest tag value in the pool
    #[arg(long, default_value = "63", value_parser = clap::value_parser!(u8).range(0..=63))]
    tag_max: u8,
}

#[derive(clap::Subcommand, Debug)]
enum RegistryCommands {
    /// Show current entries
    List,
    /// Drop entries of dead or expired owners
    Reconcile,
}

#[derive(clap::Subcommand, Debug)]
enum LockCommands {
    /// Show current lock holders
    List,
    /// Reclaim locks of dead or expired holders
    Reconcile,
    /// Release a lock held by a specific job
    Release { router: String, job_id: Uuid },
}

fn parse_host(s: &str) -> Result<(String, String), String> {
    match s.split_once('@') {
        Some((name, router)) if !name.is_empty() && !router.is_empty() => {
            Ok((name.to_string(), router.to_string()))
        }
        _ => Err(format!("expected NAME@ROUTER, got {s:?}")),
    }
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct LeaseOutput {
    resource: String,
    router: String,
    ref_count: usize,
    jobs: Vec<Uuid>,
}

#[derive(Serialize)]
struct ReconcileOutput {
    removed: usize,
    orphaned: Vec<String>,
}

// =============================================================================
// Handlers
// =============================================================================

fn open_coordinator(global: &GlobalArgs, config: ReachConfig) -> Result<Coordinator, Box<dyn std::error::Error>> {
    let mut backend = ShellBackend::new(&global.host_tool, &global.trace_tool);
    backend.sudo = global.sudo;
    Ok(Coordinator::open(config, Backends::uniform(Arc::new(backend)))?)
}

async fn handle_run(global: &GlobalArgs, args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = install_shutdown_handler()?;
    let config = ReachConfig::new(&global.state_dir).with_tag_range(args.tag_min, args.tag_max);
    let coordinator = Arc::new(open_coordinator(global, config)?);

    let run_shutdown = shutdown.child_token();
    let runner = coordinator.clone();
    let run_handle = tokio::spawn({
        let token = run_shutdown.clone();
        async move { runner.run(token).await }
    });

    let mut request = JobRequest::new(args.kind.into(), args.source, args.destination, args.services)
        .with_owner(args.owner);
    if !args.routers.is_empty() {
        request = request.with_routers(args.routers);
    }
    if let Some((name, router)) = args.source_host {
        request = request.with_source_host(HostSpec {
            name,
            address: args.source,
            router,
        });
    }
    let job_id = coordinator.submit_job(request).await?;

    let timeout = Duration::from_secs(args.timeout_secs);
    let status = tokio::select! {
        status = coordinator.wait_for(job_id, timeout) => status?,
        _ = shutdown.cancelled() => {
            coordinator.cancel_job(job_id).await?;
            // cleanup still has to finish
            coordinator.wait_for(job_id, Duration::from_secs(60)).await?
        }
    };
    if !status.status.is_terminal() {
        coordinator.cancel_job(job_id).await?;
    }

    run_shutdown.cancel();
    run_handle.await?;

    print_status(&status, &global.output)?;
    Ok(())
}

fn print_status(status: &JobStatusView, output_format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match output_format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(status)?);
        }
        OutputFormat::Table => {
            println!("Job ID:     {}", status.id);
            println!("Kind:       {}", status.kind);
            println!("Status:     {}", status.status);
            if let Some(tag) = status.tag {
                println!("Tag:        {}", tag);
            }
            if status.lingering_artifacts {
                println!("Lingering:  yes (left for reconciliation)");
            }
            if let Some(error) = &status.error {
                println!("Error:");
                for line in error.lines() {
                    println!("  {}", line);
                }
            }
            if let Some(report) = &status.report {
                println!();
                print_report(report);
            }
        }
    }
    Ok(())
}

fn print_report(report: &JobReport) {
    match report {
        JobReport::Quick { verdicts, .. } => {
            println!("{:<16} {:<10} {:<11} {:>6} {:>6}", "ROUTER", "SERVICE", "VERDICT", "PRE", "POST");
            println!("{}", "-".repeat(53));
            for v in verdicts {
                println!(
                    "{:<16} {:<10} {:<11} {:>6} {:>6}",
                    v.router,
                    v.service.to_string(),
                    v.verdict.to_string(),
                    v.pre_delta,
                    v.post_delta
                );
            }
        }
        JobReport::Detailed { measurements } => {
            println!("{:<16} {:<10} {:<11} RULE", "ROUTER", "SERVICE", "VERDICT");
            println!("{}", "-".repeat(60));
            for m in measurements {
                println!(
                    "{:<16} {:<10} {:<11} {}",
                    m.router,
                    m.service.to_string(),
                    m.verdict.to_string(),
                    m.dominant_rule.as_deref().unwrap_or("-")
                );
            }
        }
    }
}

async fn handle_tags(
    coordinator: &Coordinator,
    command: RegistryCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let allocations = match command {
        RegistryCommands::List => coordinator.tags().allocations()?,
        RegistryCommands::Reconcile => coordinator.tags().reconcile()?,
    };

    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&allocations)?),
        OutputFormat::Table => {
            if allocations.is_empty() {
                println!("No tags allocated.");
                return Ok(());
            }
            println!("{:<5} {:<38} {:<8} ALLOCATED", "TAG", "JOB ID", "PID");
            println!("{}", "-".repeat(78));
            for a in &allocations {
                println!("{:<5} {:<38} {:<8} {}", a.tag, a.job_id, a.owner_pid, a.allocated_at.to_rfc3339());
            }
        }
    }
    Ok(())
}

async fn handle_leases(
    coordinator: &Coordinator,
    command: RegistryCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        RegistryCommands::List => {
            let records: Vec<LeaseOutput> = coordinator
                .leases()
                .records()?
                .into_iter()
                .map(|(key, record)| LeaseOutput {
                    resource: key.to_string(),
                    ref_count: record.ref_count(),
                    jobs: record.leases.iter().map(|l| l.job_id).collect(),
                    router: record.router,
                })
                .collect();
            match output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
                OutputFormat::Table => {
                    if records.is_empty() {
                        println!("No leases held.");
                        return Ok(());
                    }
                    println!("{:<40} {:<16} REFS", "RESOURCE", "ROUTER");
                    println!("{}", "-".repeat(62));
                    for r in &records {
                        println!("{:<40} {:<16} {}", r.resource, r.router, r.ref_count);
                    }
                }
            }
        }
        RegistryCommands::Reconcile => {
            let report = coordinator.leases().reconcile()?;
            let failed = coordinator.hosts().teardown_orphans(&report.orphaned).await;
            let output = ReconcileOutput {
                removed: report.leases_removed,
                orphaned: report.orphaned.iter().map(|(k, _)| k.to_string()).collect(),
            };
            match output_format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
                OutputFormat::Table => {
                    println!("Leases removed:    {}", output.removed);
                    println!("Resources removed: {}", output.orphaned.len().saturating_sub(failed));
                    for resource in &output.orphaned {
                        println!("  {}", resource);
                    }
                    if failed > 0 {
                        println!("Teardown failures: {}", failed);
                    }
                }
            }
        }
    }
    Ok(())
}

async fn handle_locks(
    coordinator: &Coordinator,
    command: LockCommands,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let locks = match command {
        LockCommands::List => coordinator.locks().locks()?,
        LockCommands::Reconcile => coordinator.locks().reconcile()?,
        LockCommands::Release { router, job_id } => {
            let released = coordinator.locks().release(&router, job_id)?;
            match output_format {
                OutputFormat::Json => println!("{}", serde_json::json!({ "router": router, "released": released })),
                OutputFormat::Table if released => println!("Released lock on {}", router),
                OutputFormat::Table => println!("Lock on {} is not held by {}", router, job_id),
            }
            return Ok(());
        }
    };

    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&locks)?),
        OutputFormat::Table => {
            if locks.is_empty() {
                println!("No router locks held.");
                return Ok(());
            }
            println!("{:<16} {:<38} {:<8} ACQUIRED", "ROUTER", "HELD BY", "PID");
            println!("{}", "-".repeat(90));
            for l in &locks {
                println!("{:<16} {:<38} {:<8} {}", l.router, l.held_by, l.owner_pid, l.acquired_at.to_rfc3339());
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let global = args.global;
    match args.command {
        Commands::Run(run_args) => {
            handle_run(&global, run_args).await?;
        }
        Commands::Tags { command } => {
            let coordinator = open_coordinator(&global, ReachConfig::new(&global.state_dir))?;
            handle_tags(&coordinator, command, &global.output).await?;
        }
        Commands::Leases { command } => {
            let coordinator = open_coordinator(&global, ReachConfig::new(&global.state_dir))?;
            handle_leases(&coordinator, command, &global.output).await?;
        }
        Commands::Locks { command } => {
            let coordinator = open_coordinator(&global, ReachConfig::new(&global.state_dir))?;
            handle_locks(&coordinator, command, &global.output).await?;
        }
    }

    Ok(())
}
