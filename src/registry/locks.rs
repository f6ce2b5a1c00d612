use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::RegistryConfig;
use crate::error::{ReachError, Result};
use crate::registry::store::RecordStore;
use crate::registry::{blocking, Liveness, ProcessLiveness};

const RECORD_NAME: &str = "router_locks";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterLock {
    pub router: String,
    pub held_by: Uuid,
    pub owner_pid: u32,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LockTable {
    locks: BTreeMap<String, RouterLock>,
}

impl LockTable {
    fn sweep(&mut self, liveness: &dyn Liveness, timeout: Duration, now: DateTime<Utc>) -> Vec<RouterLock> {
        let mut reclaimed = Vec::new();
        self.locks.retain(|_, l| {
            let keep = liveness.is_alive(l.owner_pid) && now - l.acquired_at <= timeout;
            if !keep {
                reclaimed.push(l.clone());
            }
            keep
        });
        reclaimed
    }

    fn release(&mut self, router: &str, job_id: &Uuid) -> bool {
        match self.locks.get(router) {
            Some(l) if l.held_by == *job_id => {
                self.locks.remove(router);
                true
            }
            _ => false,
        }
    }
}

/// Exclusive per-router ownership for detailed jobs, plus a non-polling wait
/// for everyone else.
///
/// The whole lock table is one record, so [`acquire_all`](Self::acquire_all)
/// checks and takes every requested router in a single atomic update: a job
/// either holds its entire set or none of it. Waiters block on a change
/// generation that is bumped by local releases and, through inotify, by
/// writes from other processes.
#[derive(Debug)]
pub struct RouterLocks {
    store: RecordStore<LockTable>,
    timeout: Duration,
    owner_pid: u32,
    liveness: Arc<dyn Liveness>,
    changes: Arc<watch::Sender<u64>>,
    /// Set when filesystem notifications are unavailable.
    degraded: Option<String>,
    stale_check: StdDuration,
    degraded_recheck: StdDuration,
}

impl RouterLocks {
    pub fn open(state_dir: impl AsRef<Path>, config: &RegistryConfig) -> Result<Self> {
        let state_dir = state_dir.as_ref();
        let store: RecordStore<LockTable> = RecordStore::open(state_dir, RECORD_NAME)?;
        let (tx, _rx) = watch::channel(0u64);
        let changes = Arc::new(tx);

        let file_name = store
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        let degraded = match spawn_change_watcher(state_dir, file_name, Arc::downgrade(&changes)) {
            Ok(()) => None,
            Err(reason) => {
                tracing::warn!(
                    reason = %reason,
                    recheck_ms = config.degraded_recheck_ms,
                    "Router lock watcher unavailable, waiters fall back to bounded re-checks"
                );
                Some(reason)
            }
        };

        Ok(Self {
            store,
            timeout: Duration::seconds(config.lock_timeout_secs as i64),
            owner_pid: std::process::id(),
            liveness: Arc::new(ProcessLiveness),
            changes,
            degraded,
            stale_check: StdDuration::from_millis(config.stale_check_interval_ms),
            degraded_recheck: StdDuration::from_millis(config.degraded_recheck_ms),
        })
    }

    pub fn with_liveness(mut self, liveness: Arc<dyn Liveness>) -> Self {
        self.liveness = liveness;
        self
    }

    pub fn with_owner_pid(mut self, pid: u32) -> Self {
        self.owner_pid = pid;
        self
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.is_some()
    }

    fn notify(&self) {
        self.changes.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// Take every router in `routers` for `job_id`, or none of them.
    ///
    /// Locks already held by `job_id` count as available.
    pub fn try_acquire_all(&self, routers: &[String], job_id: Uuid) -> Result<bool> {
        let wanted = sorted_set(routers);
        let now = Utc::now();
        let owner_pid = self.owner_pid;
        let (reclaimed, acquired) = self.store.update(|table| {
            let reclaimed = table.sweep(self.liveness.as_ref(), self.timeout, now);
            let busy = wanted
                .iter()
                .any(|r| table.locks.get(r).is_some_and(|l| l.held_by != job_id));
            if busy {
                return (reclaimed, false);
            }
            for router in &wanted {
                table.locks.entry(router.clone()).or_insert_with(|| RouterLock {
                    router: router.clone(),
                    held_by: job_id,
                    owner_pid,
                    acquired_at: now,
                });
            }
            (reclaimed, true)
        })?;
        self.log_reclaimed(&reclaimed);
        Ok(acquired)
    }

    /// Block until every router in `routers` is held by `job_id` or
    /// `timeout` elapses. On timeout no lock from the set is held.
    pub async fn acquire_all(self: &Arc<Self>, routers: &[String], job_id: Uuid, timeout: StdDuration) -> Result<bool> {
        self.acquire_all_or_cancel(routers, job_id, timeout, &CancellationToken::new())
            .await
    }

    /// Like [`acquire_all`](Self::acquire_all), but gives up with
    /// [`ReachError::Cancelled`] when `cancel` fires while waiting. An
    /// acquisition attempt already under way always completes first, so a
    /// cancelled call holds nothing.
    pub async fn acquire_all_or_cancel(
        self: &Arc<Self>,
        routers: &[String],
        job_id: Uuid,
        timeout: StdDuration,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut rx = self.changes.subscribe();
        loop {
            rx.borrow_and_update();
            let wanted = routers.to_vec();
            if blocking(self, move |locks| locks.try_acquire_all(&wanted, job_id)).await? {
                tracing::info!(job_id = %job_id, routers = ?sorted_set(routers), "Router locks acquired");
                return Ok(true);
            }
            if !self.wait_for_change(&mut rx, deadline, cancel).await? {
                tracing::warn!(job_id = %job_id, routers = ?routers, "Timed out acquiring router locks");
                return Ok(false);
            }
        }
    }

    /// Return once `router` has no exclusive holder, or false on timeout.
    pub async fn wait_until_free(self: &Arc<Self>, router: &str, timeout: StdDuration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let mut rx = self.changes.subscribe();
        loop {
            rx.borrow_and_update();
            let Some(holder) = self.holder(router)? else {
                return Ok(true);
            };
            tracing::debug!(router, held_by = %holder.held_by, "Waiting for router lock release");
            if !self.wait_for_change(&mut rx, deadline, &CancellationToken::new()).await? {
                return Ok(false);
            }
        }
    }

    /// Sleep until the lock table may have changed. Returns false once the
    /// deadline has passed.
    async fn wait_for_change(
        self: &Arc<Self>,
        rx: &mut watch::Receiver<u64>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let recheck = if self.is_degraded() {
            self.degraded_recheck
        } else {
            self.stale_check
        };
        let wake_at = deadline.min(Instant::now() + recheck);

        let notified = tokio::select! {
            changed = rx.changed() => changed.is_ok(),
            _ = tokio::time::sleep_until(wake_at) => false,
            _ = cancel.cancelled() => return Err(ReachError::Cancelled),
        };
        if Instant::now() >= deadline {
            return Ok(false);
        }
        if !notified {
            // No event: holders may have died without releasing
            blocking(self, |locks| locks.reconcile()).await?;
        }
        Ok(true)
    }

    /// Release one router lock, if `job_id` holds it.
    pub fn release(&self, router: &str, job_id: Uuid) -> Result<bool> {
        let released = self.store.update(|table| table.release(router, &job_id))?;
        if released {
            tracing::debug!(router, job_id = %job_id, "Router lock released");
            self.notify();
        }
        Ok(released)
    }

    /// Release every lock in `routers` held by `job_id` and wake all waiters.
    pub fn release_all(&self, routers: &[String], job_id: Uuid) -> Result<usize> {
        let wanted = sorted_set(routers);
        let released = self
            .store
            .update(|table| wanted.iter().filter(|r| table.release(r, &job_id)).count())?;
        if released > 0 {
            tracing::info!(job_id = %job_id, released, "Router locks released");
            self.notify();
        }
        Ok(released)
    }

    /// Release whatever `job_id` still holds. Used by cleanup paths that do
    /// not know which routers were already released early.
    pub fn release_all_for_job(&self, job_id: Uuid) -> Result<Vec<String>> {
        let released = self.store.update(|table| {
            let held: Vec<String> = table
                .locks
                .values()
                .filter(|l| l.held_by == job_id)
                .map(|l| l.router.clone())
                .collect();
            for router in &held {
                table.locks.remove(router);
            }
            held
        })?;
        if !released.is_empty() {
            self.notify();
        }
        Ok(released)
    }

    pub fn holder(&self, router: &str) -> Result<Option<RouterLock>> {
        Ok(self.store.load()?.locks.get(router).cloned())
    }

    pub fn locks(&self) -> Result<Vec<RouterLock>> {
        Ok(self.store.load()?.locks.into_values().collect())
    }

    /// Reclaim locks whose holder process died or which outlived the timeout.
    pub fn reconcile(&self) -> Result<Vec<RouterLock>> {
        let now = Utc::now();
        let reclaimed = self
            .store
            .update(|table| table.sweep(self.liveness.as_ref(), self.timeout, now))?;
        self.log_reclaimed(&reclaimed);
        Ok(reclaimed)
    }

    fn log_reclaimed(&self, reclaimed: &[RouterLock]) {
        for lock in reclaimed {
            tracing::warn!(
                router = %lock.router,
                held_by = %lock.held_by,
                owner_pid = lock.owner_pid,
                "Reclaimed stale router lock"
            );
        }
        if !reclaimed.is_empty() {
            self.notify();
        }
    }
}

/// Deterministic acquisition order: sorted, without duplicates.
fn sorted_set(routers: &[String]) -> Vec<String> {
    let mut set = routers.to_vec();
    set.sort();
    set.dedup();
    set
}

/// Name of the thread forwarding lock record changes to waiters.
pub const WATCHER_THREAD: &str = "rl-lock-watch";

/// How long the watcher blocks before re-checking that its owner is alive.
#[cfg(target_os = "linux")]
const WATCHER_POLL_MS: u16 = 200;

#[cfg(target_os = "linux")]
fn spawn_change_watcher(
    dir: &Path,
    file_name: std::ffi::OsString,
    changes: Weak<watch::Sender<u64>>,
) -> std::result::Result<(), String> {
    use std::os::fd::AsFd;

    use nix::errno::Errno;
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
    use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};

    let mask = AddWatchFlags::IN_CLOSE_WRITE | AddWatchFlags::IN_MOVED_TO | AddWatchFlags::IN_DELETE;
    let inotify =
        Inotify::init(InitFlags::IN_CLOEXEC).map_err(|error| format!("inotify init failed: {error}"))?;
    inotify
        .add_watch(dir, mask)
        .map_err(|error| format!("inotify add watch failed: {error}"))?;

    std::thread::Builder::new()
        .name(WATCHER_THREAD.to_string())
        .spawn(move || loop {
            // Owner dropped: nobody left to wake
            if changes.strong_count() == 0 {
                return;
            }
            let mut fds = [PollFd::new(inotify.as_fd(), PollFlags::POLLIN)];
            match poll(&mut fds, PollTimeout::from(WATCHER_POLL_MS)) {
                Ok(0) | Err(Errno::EINTR) => continue,
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(error = %error, "Router lock watcher stopped");
                    return;
                }
            }
            let events = match inotify.read_events() {
                Ok(events) => events,
                Err(error) => {
                    tracing::warn!(error = %error, "Router lock watcher stopped");
                    return;
                }
            };
            // Owner dropped: nobody left to wake
            let Some(changes) = changes.upgrade() else {
                return;
            };
            let relevant = events.iter().any(|e| {
                e.mask.contains(AddWatchFlags::IN_Q_OVERFLOW)
                    || e.name.as_deref() == Some(file_name.as_os_str())
            });
            if relevant {
                changes.send_modify(|generation| *generation = generation.wrapping_add(1));
            }
            if events.iter().any(|e| e.mask.contains(AddWatchFlags::IN_IGNORED)) {
                // state directory removed
                return;
            }
        })
        .map_err(|error| format!("cannot spawn lock watcher thread: {error}"))?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn spawn_change_watcher(
    _dir: &Path,
    _file_name: std::ffi::OsString,
    _changes: Weak<watch::Sender<u64>>,
) -> std::result::Result<(), String> {
    Err("filesystem notifications unavailable on this platform".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sorted_set_orders_and_dedups() {
        let routers = vec!["r3".to_string(), "r1".to_string(), "r3".to_string()];
        assert_eq!(sorted_set(&routers), vec!["r1".to_string(), "r3".to_string()]);
    }

    #[test]
    fn releasing_foreign_lock_is_noop() {
        let mut table = LockTable::default();
        let owner = Uuid::new_v4();
        table.locks.insert(
            "r1".to_string(),
            RouterLock {
                router: "r1".to_string(),
                held_by: owner,
                owner_pid: 1,
                acquired_at: Utc::now(),
            },
        );
        assert!(!table.release("r1", &Uuid::new_v4()));
        assert!(table.release("r1", &owner));
        assert!(table.locks.is_empty());
    }
}
