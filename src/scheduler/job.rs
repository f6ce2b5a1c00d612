use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ReachError, Result};
use crate::net::{HostSpec, Service};
use crate::verdict::JobReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobKind {
    /// Tag-isolated verdict run; shares routers with other quick jobs.
    Quick,
    /// Full counter measurement; needs exclusive router locks.
    Detailed,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Quick => write!(f, "quick"),
            JobKind::Detailed => write!(f, "detailed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What a caller submits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRequest {
    pub kind: JobKind,
    pub owner: String,
    pub source: IpAddr,
    pub destination: IpAddr,
    pub services: Vec<Service>,
    /// Routers to test. Resolved from the topology when absent.
    pub routers: Option<Vec<String>>,
    /// Shared host to emit probes from. Quick jobs without one probe from
    /// the first router on the path.
    pub source_host: Option<HostSpec>,
    /// Host standing in for the destination. Created exclusively for
    /// detailed jobs; ignored by quick jobs.
    pub destination_host: Option<HostSpec>,
}

impl JobRequest {
    pub fn new(kind: JobKind, source: IpAddr, destination: IpAddr, services: Vec<Service>) -> Self {
        Self {
            kind,
            owner: String::new(),
            source,
            destination,
            services,
            routers: None,
            source_host: None,
            destination_host: None,
        }
    }

    pub fn with_routers<S: Into<String>>(mut self, routers: impl IntoIterator<Item = S>) -> Self {
        self.routers = Some(routers.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn with_source_host(mut self, host: HostSpec) -> Self {
        self.source_host = Some(host);
        self
    }

    pub fn with_destination_host(mut self, host: HostSpec) -> Self {
        self.destination_host = Some(host);
        self
    }
}

/// A queued or running job. Everything but the scheduler-assigned tag and
/// the status fields is fixed at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub owner: String,
    pub source: IpAddr,
    pub destination: IpAddr,
    pub routers: Vec<String>,
    pub services: Vec<Service>,
    pub source_host: Option<HostSpec>,
    pub destination_host: Option<HostSpec>,
    pub created_at: DateTime<Utc>,

    pub tag: Option<u8>,
    pub status: JobStatus,
    pub report: Option<JobReport>,
    pub error: Option<String>,
    /// Cleanup could not remove everything; reconciliation will.
    pub lingering_artifacts: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Build a job from a request whose router set is already known.
    pub fn new(request: JobRequest, routers: Vec<String>) -> Result<Self> {
        let mut unique: Vec<String> = Vec::with_capacity(routers.len());
        for router in routers {
            if !unique.contains(&router) {
                unique.push(router);
            }
        }
        if unique.is_empty() {
            return Err(ReachError::InvalidJob("router set is empty".to_string()));
        }
        let mut services: Vec<Service> = Vec::with_capacity(request.services.len());
        for service in request.services {
            if !services.contains(&service) {
                services.push(service);
            }
        }
        if services.is_empty() {
            return Err(ReachError::InvalidJob("service list is empty".to_string()));
        }

        Ok(Self {
            id: Uuid::new_v4(),
            kind: request.kind,
            owner: request.owner,
            source: request.source,
            destination: request.destination,
            routers: unique,
            services,
            source_host: request.source_host,
            destination_host: request.destination_host,
            created_at: Utc::now(),
            tag: None,
            status: JobStatus::Queued,
            report: None,
            error: None,
            lingering_artifacts: false,
            started_at: None,
            completed_at: None,
        })
    }

    pub fn touches(&self, router: &str) -> bool {
        self.routers.iter().any(|r| r == router)
    }
}

/// Snapshot of a job for callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusView {
    pub id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    /// Jobs ahead of this one, while queued.
    pub position: Option<usize>,
    pub tag: Option<u8>,
    pub report: Option<JobReport>,
    pub error: Option<String>,
    pub lingering_artifacts: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(kind: JobKind) -> JobRequest {
        JobRequest::new(
            kind,
            "10.0.0.1".parse().unwrap(),
            "10.0.1.1".parse().unwrap(),
            vec![Service::tcp(80)],
        )
    }

    #[test]
    fn routers_are_deduplicated_in_path_order() {
        let job = Job::new(
            request(JobKind::Quick),
            vec!["r2".into(), "r1".into(), "r2".into()],
        )
        .unwrap();
        assert_eq!(job.routers, vec!["r2".to_string(), "r1".to_string()]);
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.tag.is_none());
    }

    #[test]
    fn empty_router_set_is_rejected() {
        let err = Job::new(request(JobKind::Detailed), vec![]).unwrap_err();
        assert!(matches!(err, ReachError::InvalidJob(_)));
    }

    #[test]
    fn empty_service_list_is_rejected() {
        let mut req = request(JobKind::Quick);
        req.services.clear();
        assert!(Job::new(req, vec!["r1".into()]).is_err());
    }
}
