//! Job and batch data model.
//!
//! A [`Job`] is one run of a task definition against the records of its
//! source collection that have not been enriched yet. It owns a contiguous
//! range of [`Batch`]es, numbered `0..total_batches`, all created up front.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::TaskDefinition;

// ─── Status enums ───────────────────────────────────────────────────────────

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Aborted,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Aborted
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "aborted" => Ok(JobStatus::Aborted),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Lifecycle status of a batch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BatchStatus::Pending),
            "processing" => Ok(BatchStatus::Processing),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            other => Err(format!("unknown batch status '{}'", other)),
        }
    }
}

// ─── Timestamps ─────────────────────────────────────────────────────────────

/// Formats a timestamp as fixed-width RFC 3339 (`2026-01-01T00:00:00.000Z`).
///
/// The fixed width keeps text comparisons in SQL consistent with time order.
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}

/// The instant `age` ago, never earlier than the Unix epoch so that it still
/// formats as a fixed-width timestamp.
pub fn cutoff(age: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .map_or(DateTime::<Utc>::UNIX_EPOCH, |t| t.max(DateTime::<Utc>::UNIX_EPOCH))
}

// ─── Job ────────────────────────────────────────────────────────────────────

/// Snapshot of the task definition a job was planned from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobMetadata {
    pub task_name: String,
    pub worker: String,
    pub source: String,
    pub target: String,
    pub batch_size: u32,
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrichment_version: Option<String>,
}

impl JobMetadata {
    /// The task definition as it was when the job was planned. Dispatch uses
    /// this rather than the live registry.
    pub fn to_task(&self) -> TaskDefinition {
        TaskDefinition {
            name: self.task_name.clone(),
            worker: self.worker.clone(),
            source: self.source.clone(),
            target: self.target.clone(),
            batch_size: self.batch_size,
            priority: self.priority,
            enrichment_version: self.enrichment_version.clone(),
        }
    }
}

impl From<&TaskDefinition> for JobMetadata {
    fn from(task: &TaskDefinition) -> Self {
        Self {
            task_name: task.name.clone(),
            worker: task.worker.clone(),
            source: task.source.clone(),
            target: task.target.clone(),
            batch_size: task.batch_size,
            priority: task.priority,
            enrichment_version: task.enrichment_version.clone(),
        }
    }
}

/// A persisted job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_type: String,
    pub status: JobStatus,
    pub total_batches: u32,
    pub completed_batches: u32,
    pub failed_batches: u32,
    pub current_batch: u32,
    pub progress_percentage: u32,
    pub metadata: JobMetadata,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Creates a new pending job for a task.
    pub fn new(task: &TaskDefinition, total_batches: u32) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_type: job_type_for(task),
            status: JobStatus::Pending,
            total_batches,
            completed_batches: 0,
            failed_batches: 0,
            current_batch: 0,
            progress_percentage: 0,
            metadata: JobMetadata::from(task),
            error_message: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        }
    }
}

/// Job type string for a task. Jobs of the same type compete for the same work.
pub fn job_type_for(task: &TaskDefinition) -> String {
    format!("enrichment:{}", task.name)
}

/// `round(100 * completed / total)`, with an empty job counting as done.
pub fn progress_percentage(completed: u32, total: u32) -> u32 {
    if total == 0 {
        return 100;
    }
    ((completed as f64 * 100.0) / total as f64).round() as u32
}

/// Upper bound on the batches the planner creates for a single job.
pub const MAX_BATCHES_PER_JOB: u32 = 100_000;

/// Number of batches needed to cover `unenriched` records.
pub fn batch_count(unenriched: u64, batch_size: u32) -> u64 {
    if batch_size == 0 {
        return 0;
    }
    unenriched.div_ceil(batch_size as u64)
}

/// Item counts per batch: `batch_size` each, the last one takes the remainder.
///
/// Callers check [`batch_count`] against [`MAX_BATCHES_PER_JOB`] first.
pub fn batch_sizes(unenriched: u64, batch_size: u32) -> Vec<u32> {
    let mut remaining = unenriched;
    let capacity = batch_count(unenriched, batch_size).min(MAX_BATCHES_PER_JOB as u64);
    let mut sizes = Vec::with_capacity(capacity as usize);
    while remaining > 0 && batch_size > 0 {
        let size = remaining.min(batch_size as u64);
        sizes.push(size as u32);
        remaining -= size;
    }
    sizes
}

// ─── Batch ──────────────────────────────────────────────────────────────────

/// A persisted batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    pub id: String,
    pub job_id: String,
    pub batch_number: u32,
    pub total_items: u32,
    pub items_processed: u32,
    pub status: BatchStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub data: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl Batch {
    pub fn new(job_id: &str, batch_number: u32, total_items: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            batch_number,
            total_items,
            items_processed: 0,
            status: BatchStatus::Pending,
            started_at: None,
            completed_at: None,
            error_message: None,
            data: None,
            created_at: Utc::now(),
        }
    }

    /// Record offset handed to the worker for this batch.
    pub fn start_from(&self, batch_size: u32) -> u64 {
        self.batch_number as u64 * batch_size as u64
    }
}

/// Aggregate batch counts for one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchCounts {
    pub pending: u32,
    pub processing: u32,
    pub completed: u32,
    pub failed: u32,
}

impl BatchCounts {
    pub fn total(&self) -> u32 {
        self.pending + self.processing + self.completed + self.failed
    }

    /// Pending or processing batches remain.
    pub fn has_open_work(&self) -> bool {
        self.pending > 0 || self.processing > 0
    }
}
