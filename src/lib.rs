pub mod config;
pub mod coordinator;
pub mod error;
pub mod net;
pub mod registry;
pub mod scheduler;
pub mod shutdown;
pub mod verdict;
pub mod worker;

pub use coordinator::Coordinator;
pub use error::{ReachError, Result};
