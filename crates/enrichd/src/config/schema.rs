use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::registry::TaskDefinition;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    pub worker: WorkerConfig,
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub processor: ProcessorConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    /// Number of jobs returned by the `status` action.
    #[serde(default = "default_status_limit")]
    pub status_limit: u32,
    /// Tasks planned by the `test` action. Empty means the first two by priority.
    #[serde(default)]
    pub smoke_test_tasks: Vec<String>,
}

fn default_status_limit() -> u32 {
    20
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub base_url: String,
    /// Environment variable holding a bearer token for worker calls.
    #[serde(default)]
    pub token_env: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl WorkerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

/// Polling cadence while waiting for a worker to finish a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    #[serde(default = "default_first_poll_ms")]
    pub first_poll_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_completion_timeout_ms")]
    pub completion_timeout_ms: u64,
}

fn default_first_poll_ms() -> u64 {
    10_000
}

fn default_poll_interval_ms() -> u64 {
    15_000
}

fn default_completion_timeout_ms() -> u64 {
    600_000
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            first_poll_ms: default_first_poll_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            completion_timeout_ms: default_completion_timeout_ms(),
        }
    }
}

impl DispatcherConfig {
    pub fn first_poll(&self) -> Duration {
        Duration::from_millis(self.first_poll_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Run the continuous processor as a detached task. When false, requests
    /// that launch processing dispatch one batch per job inline instead.
    #[serde(default = "default_true")]
    pub background: bool,
    #[serde(default = "default_cycle_sleep_ms")]
    pub cycle_sleep_ms: u64,
    #[serde(default = "default_watchdog_interval_ms")]
    pub watchdog_interval_ms: u64,
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
}

fn default_cycle_sleep_ms() -> u64 {
    3_000
}

fn default_watchdog_interval_ms() -> u64 {
    300_000
}

fn default_max_consecutive_errors() -> u32 {
    10
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            background: true,
            cycle_sleep_ms: default_cycle_sleep_ms(),
            watchdog_interval_ms: default_watchdog_interval_ms(),
            max_consecutive_errors: default_max_consecutive_errors(),
        }
    }
}

impl ProcessorConfig {
    pub fn cycle_sleep(&self) -> Duration {
        Duration::from_millis(self.cycle_sleep_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_interval_ms)
    }
}

/// Age after which a processing batch counts as stuck.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Used by the sweep inside the continuous processor.
    #[serde(default = "default_scheduled_threshold_ms")]
    pub scheduled_threshold_ms: u64,
    /// Used by the `recover` and `continue` actions.
    #[serde(default = "default_manual_threshold_ms")]
    pub manual_threshold_ms: u64,
}

fn default_scheduled_threshold_ms() -> u64 {
    15 * 60 * 1000
}

fn default_manual_threshold_ms() -> u64 {
    10 * 60 * 1000
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            scheduled_threshold_ms: default_scheduled_threshold_ms(),
            manual_threshold_ms: default_manual_threshold_ms(),
        }
    }
}

impl WatchdogConfig {
    pub fn scheduled_threshold(&self) -> Duration {
        Duration::from_millis(self.scheduled_threshold_ms)
    }

    pub fn manual_threshold(&self) -> Duration {
        Duration::from_millis(self.manual_threshold_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlannerConfig {
    /// Aborted or failed jobs older than this are marked completed before planning.
    #[serde(default = "default_stale_job_horizon_ms")]
    pub stale_job_horizon_ms: u64,
}

fn default_stale_job_horizon_ms() -> u64 {
    60 * 60 * 1000
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            stale_job_horizon_ms: default_stale_job_horizon_ms(),
        }
    }
}

impl PlannerConfig {
    pub fn stale_job_horizon(&self) -> Duration {
        Duration::from_millis(self.stale_job_horizon_ms)
    }
}
