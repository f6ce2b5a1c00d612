pub mod dispatcher;
pub mod job;
pub mod queue;

pub use dispatcher::{Dispatcher, JobOutcome, JobRunner};
pub use job::{Job, JobKind, JobRequest, JobStatus, JobStatusView};
pub use queue::{JobQueue, RunningSnapshot};
