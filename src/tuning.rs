use std::time::Duration;

use serde::Deserialize;

/// Operator tuning knobs. Every suspension in the kernel carries a fallback
/// deadline taken from here, and every transient API failure is retried
/// under the budget below.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Tuning {
    /// Worker threads hosting fibers. Zero means "use the CPU count".
    pub engine_workers: usize,

    /// How long to wait for a pod to reach the Ready condition.
    pub readiness_wait_seconds: u64,
    /// How long to wait for a pod deletion to be observed by the watcher.
    pub deletion_wait_seconds: u64,
    /// How long a single delete-and-recreate cycle of a rolled server may
    /// take before the roll is abandoned.
    pub roll_cycle_seconds: u64,
    /// Delay before re-checking a cluster's unavailability budget.
    pub unavailable_recheck_seconds: u64,

    /// Attempts for a transient API failure before it is promoted to a
    /// fiber failure.
    pub api_retry_limit: u32,
    pub api_retry_base_millis: u64,
    pub api_retry_max_millis: u64,

    /// Cadence of the full-relist tick that resubmits idle domains.
    pub relist_interval_seconds: u64,

    /// Probe timings stamped onto pods outside the content hash.
    pub readiness_probe_initial_delay_seconds: i32,
    pub readiness_probe_period_seconds: i32,
    pub readiness_probe_timeout_seconds: i32,
    pub liveness_probe_initial_delay_seconds: i32,
    pub liveness_probe_period_seconds: i32,
    pub liveness_probe_timeout_seconds: i32,
}

impl Default for Tuning {
    fn default() -> Self {
        Tuning {
            engine_workers: 0,
            readiness_wait_seconds: 300,
            deletion_wait_seconds: 120,
            roll_cycle_seconds: 420,
            unavailable_recheck_seconds: 5,
            api_retry_limit: 5,
            api_retry_base_millis: 250,
            api_retry_max_millis: 10_000,
            relist_interval_seconds: 300,
            readiness_probe_initial_delay_seconds: 30,
            readiness_probe_period_seconds: 5,
            readiness_probe_timeout_seconds: 5,
            liveness_probe_initial_delay_seconds: 30,
            liveness_probe_period_seconds: 45,
            liveness_probe_timeout_seconds: 5,
        }
    }
}

impl Tuning {
    pub fn worker_count(&self) -> usize {
        if self.engine_workers > 0 {
            self.engine_workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2)
        }
    }

    pub fn readiness_wait(&self) -> Duration {
        Duration::from_secs(self.readiness_wait_seconds)
    }

    pub fn deletion_wait(&self) -> Duration {
        Duration::from_secs(self.deletion_wait_seconds)
    }

    pub fn roll_cycle_wait(&self) -> Duration {
        Duration::from_secs(self.roll_cycle_seconds)
    }

    pub fn unavailable_recheck(&self) -> Duration {
        Duration::from_secs(self.unavailable_recheck_seconds)
    }

    pub fn relist_interval(&self) -> Duration {
        Duration::from_secs(self.relist_interval_seconds)
    }
}
