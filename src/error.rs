use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ReachError {
    #[error("No tag available in pool {min}..={max}")]
    ResourceExhausted { min: u8, max: u8 },

    #[error("Timed out after {waited_ms}ms acquiring router locks {routers:?}")]
    LockTimeout { routers: Vec<String>, waited_ms: u64 },

    #[error("Timed out after {waited_ms}ms waiting for router {router} to be released")]
    WaitTimeout { router: String, waited_ms: u64 },

    #[error(
        "Counter consistency violation on router {router} for {service}: \
         ingress delta {pre}, egress delta {post}"
    )]
    ConsistencyViolation {
        router: String,
        service: String,
        pre: u64,
        post: u64,
    },

    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job queue at capacity")]
    QueueFull,

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Job cancelled")]
    Cancelled,

    #[error("State store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("State record serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReachError {
    /// Errors that leave the job eligible to run again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReachError::ResourceExhausted { .. }
                | ReachError::LockTimeout { .. }
                | ReachError::WaitTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ReachError>;
