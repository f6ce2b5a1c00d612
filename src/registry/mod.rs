//! Shared, crash-tolerant registries for kernel resources.
//!
//! Every registry is a single small JSON record in the state directory,
//! mutated only through its own acquire/release/reconcile operations:
//!
//! - [`TagAllocator`]: packet-isolation tags for quick jobs
//! - [`LeaseRegistry`]: reference counts for shared hosts and neighbor bindings
//! - [`RouterLocks`]: exclusive router ownership for detailed jobs
//!
//! Reconciliation drops entries whose owning process is gone or whose age
//! exceeds a timeout. It is the only path that removes state without an
//! explicit release.

pub mod leases;
pub mod locks;
pub mod store;
pub mod tags;

pub use leases::{LeaseKey, LeaseRegistry, LeaseRelease};
pub use locks::RouterLocks;
pub use store::RecordStore;
pub use tags::TagAllocator;

use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::error::{ReachError, Result};

/// Run a registry mutation on the blocking pool.
///
/// Record updates wait on an exclusive `flock` and fsync the new snapshot,
/// so async code calls them through here.
pub async fn blocking<T, R, F>(registry: &Arc<T>, op: F) -> Result<R>
where
    T: Send + Sync + 'static,
    R: Send + 'static,
    F: FnOnce(&T) -> Result<R> + Send + 'static,
{
    let registry = Arc::clone(registry);
    tokio::task::spawn_blocking(move || op(&registry))
        .await
        .map_err(|e| ReachError::Internal(format!("registry task failed: {e}")))?
}

/// Decides whether the process that created a registry entry still exists.
pub trait Liveness: Send + Sync + std::fmt::Debug {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probes the kernel with a null signal.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLiveness;

impl Liveness for ProcessLiveness {
    fn is_alive(&self, pid: u32) -> bool {
        // pid 0 and anything that wraps negative would address process groups
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        assert!(ProcessLiveness.is_alive(std::process::id()));
    }

    #[test]
    fn invalid_pids_are_dead() {
        assert!(!ProcessLiveness.is_alive(0));
        assert!(!ProcessLiveness.is_alive(u32::MAX));
    }
}
