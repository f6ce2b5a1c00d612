use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ReachError, Result};

/// Largest value the six-bit DSCP field can carry.
pub const MAX_TAG: u8 = 63;

/// Tag pool used to isolate concurrent quick jobs.
///
/// Each value is carried in the DSCP field of probe packets, so the range
/// must stay within 0..=63.
#[derive(Debug, Clone)]
pub struct TagPoolConfig {
    pub min: u8,
    pub max: u8,
    /// Allocations older than this are reclaimed even if the owner is alive.
    pub stale_after_secs: u64,
}

impl Default for TagPoolConfig {
    fn default() -> Self {
        Self {
            min: 32,
            max: 63,
            stale_after_secs: 3600,
        }
    }
}

impl TagPoolConfig {
    pub fn range(&self) -> RangeInclusive<u8> {
        self.min..=self.max
    }

    pub fn pool_size(&self) -> usize {
        if self.max < self.min {
            0
        } else {
            (self.max - self.min) as usize + 1
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max > MAX_TAG {
            return Err(ReachError::InvalidConfig(format!(
                "tag {} does not fit in DSCP (max {MAX_TAG})",
                self.max
            )));
        }
        if self.min > self.max {
            return Err(ReachError::InvalidConfig(format!(
                "empty tag range {}..={}",
                self.min, self.max
            )));
        }
        Ok(())
    }
}

/// Lease and router-lock registry settings.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Leases older than this are dropped by reconciliation.
    pub lease_timeout_secs: u64,
    /// Router locks older than this are reclaimed by reconciliation.
    pub lock_timeout_secs: u64,
    /// How often a blocked waiter re-runs lock reconciliation, so locks of
    /// crashed holders are reclaimed while someone is waiting on them.
    pub stale_check_interval_ms: u64,
    /// Re-check interval used only when filesystem notifications are
    /// unavailable.
    pub degraded_recheck_ms: u64,
    /// Interval of the background reconciliation ticker.
    pub reconcile_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            lease_timeout_secs: 3600,
            lock_timeout_secs: 3600,
            stale_check_interval_ms: 5000,
            degraded_recheck_ms: 250,
            reconcile_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent_jobs: usize,
    pub queue_capacity: usize,
    /// Dispatch loop wakes at least this often, to pick up tags released by
    /// other processes.
    pub dispatch_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 32,
            queue_capacity: 10_000,
            dispatch_interval_ms: 500,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// How long a quick job waits for an exclusively locked router.
    pub wait_timeout_ms: u64,
    /// How long a detailed job waits to lock its whole router set.
    pub lock_timeout_ms: u64,
    /// Packets sent per service over lossy transports (UDP).
    pub lossy_probe_count: u32,
    /// Delay between the last probe and reading counters.
    pub settle_ms: u64,
    /// Release each router lock as soon as its measurements finish instead
    /// of holding the whole set until the job ends.
    pub early_release: bool,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: 30_000,
            lock_timeout_ms: 60_000,
            lossy_probe_count: 3,
            settle_ms: 200,
            early_release: true,
        }
    }
}

impl ProbeConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

#[derive(Debug, Clone)]
pub struct ReachConfig {
    /// Directory holding the shared registry records. Should live on a
    /// tmpfs so state survives the process but not a reboot.
    pub state_dir: PathBuf,
    pub tags: TagPoolConfig,
    pub registry: RegistryConfig,
    pub scheduler: SchedulerConfig,
    pub probe: ProbeConfig,
}

impl Default for ReachConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/dev/shm/reachlab"),
            tags: TagPoolConfig::default(),
            registry: RegistryConfig::default(),
            scheduler: SchedulerConfig::default(),
            probe: ProbeConfig::default(),
        }
    }
}

impl ReachConfig {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            ..Default::default()
        }
    }

    pub fn with_tag_range(mut self, min: u8, max: u8) -> Self {
        self.tags.min = min;
        self.tags.max = max;
        self
    }

    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.scheduler.max_concurrent_jobs = max;
        self
    }

    pub fn with_probe(mut self, probe: ProbeConfig) -> Self {
        self.probe = probe;
        self
    }
}
