//! Batch repository: operations on the `batch_progress` table.
//!
//! Every state change here is a single conditional statement. A batch only
//! moves `pending → processing` through [`claim_next`], and only moves out of
//! `processing` if it is still `processing` when the statement runs, so two
//! dispatchers sharing a database can never both own the same batch.

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{get_json, get_opt_timestamp, get_parsed, get_timestamp, Database, DatabaseError};
use crate::model::{format_timestamp, Batch, BatchCounts, BatchStatus};

impl Batch {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            batch_number: row.get("batch_number")?,
            total_items: row.get("total_items")?,
            items_processed: row.get("items_processed")?,
            status: get_parsed(row, "status")?,
            started_at: get_opt_timestamp(row, "started_at")?,
            completed_at: get_opt_timestamp(row, "completed_at")?,
            error_message: row.get("error_message")?,
            data: get_json(row, "data")?,
            created_at: get_timestamp(row, "created_at")?,
        })
    }
}

/// Final result a worker reports for its batch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchOutcome {
    Completed,
    Failed,
}

/// Worker-side report written onto a batch that is still processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub job_id: String,
    pub batch_number: u32,
    pub outcome: BatchOutcome,
    #[serde(default)]
    pub items_processed: Option<u32>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

/// A batch returned to `pending` by the watchdog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReclaimedBatch {
    pub batch_id: String,
    pub job_id: String,
    pub batch_number: u32,
}

fn now() -> String {
    format_timestamp(Utc::now())
}

pub(crate) fn insert_row(conn: &Connection, batch: &Batch) -> Result<(), DatabaseError> {
    let data = batch
        .data
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| DatabaseError::Corrupt {
            column: "data".to_string(),
            reason: e.to_string(),
        })?;

    conn.execute(
        "INSERT INTO batch_progress (id, job_id, batch_number, total_items, items_processed,
         status, started_at, completed_at, error_message, data, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            batch.id,
            batch.job_id,
            batch.batch_number,
            batch.total_items,
            batch.items_processed,
            batch.status.as_str(),
            batch.started_at.map(format_timestamp),
            batch.completed_at.map(format_timestamp),
            batch.error_message,
            data,
            format_timestamp(batch.created_at),
        ],
    )?;
    Ok(())
}

pub fn find_by_id(db: &Database, id: &str) -> Result<Option<Batch>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT * FROM batch_progress WHERE id = ?1",
                params![id],
                Batch::from_row,
            )
            .optional()?)
    })
}

pub fn find_by_number(
    db: &Database,
    job_id: &str,
    batch_number: u32,
) -> Result<Option<Batch>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT * FROM batch_progress WHERE job_id = ?1 AND batch_number = ?2",
                params![job_id, batch_number],
                Batch::from_row,
            )
            .optional()?)
    })
}

/// All batches of a job in batch-number order.
pub fn list_for_job(db: &Database, job_id: &str) -> Result<Vec<Batch>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn
            .prepare("SELECT * FROM batch_progress WHERE job_id = ?1 ORDER BY batch_number ASC")?;
        let rows = stmt
            .query_map(params![job_id], Batch::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Atomically claims the lowest-numbered pending batch of a job.
pub fn claim_next(db: &Database, job_id: &str) -> Result<Option<Batch>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "UPDATE batch_progress SET status = 'processing', started_at = ?2,
                 completed_at = NULL
                 WHERE id = (
                     SELECT id FROM batch_progress
                     WHERE job_id = ?1 AND status = 'pending'
                     ORDER BY batch_number ASC LIMIT 1
                 ) AND status = 'pending'
                 RETURNING *",
                params![job_id, now()],
                Batch::from_row,
            )
            .optional()?)
    })
}

/// Resets processing batches of a job that have no start time.
///
/// Compatibility shim for rows written by writers that do not use
/// [`claim_next`]; a claim made here always sets `started_at`.
pub fn release_ghost_locks(
    db: &Database,
    job_id: &str,
    message: &str,
) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn.execute(
            "UPDATE batch_progress SET status = 'pending', error_message = ?2
             WHERE job_id = ?1 AND status = 'processing' AND started_at IS NULL",
            params![job_id, message],
        )?)
    })
}

/// Hands a claimed batch back to the queue, for claims made on a job that
/// turned out to be aborted.
pub fn release_claim(db: &Database, batch_id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE batch_progress SET status = 'pending', started_at = NULL
             WHERE id = ?1 AND status = 'processing'",
            params![batch_id],
        )?;
        Ok(changed > 0)
    })
}

/// Batch counts by status for one job.
pub fn counts_for_job(db: &Database, job_id: &str) -> Result<BatchCounts, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM batch_progress WHERE job_id = ?1 GROUP BY status",
        )?;
        let mut counts = BatchCounts::default();
        let rows = stmt.query_map(params![job_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, u32>(1)?))
        })?;
        for row in rows {
            let (status, n) = row?;
            match status.parse::<BatchStatus>() {
                Ok(BatchStatus::Pending) => counts.pending = n,
                Ok(BatchStatus::Processing) => counts.processing = n,
                Ok(BatchStatus::Completed) => counts.completed = n,
                Ok(BatchStatus::Failed) => counts.failed = n,
                Err(reason) => {
                    return Err(DatabaseError::Corrupt {
                        column: "status".to_string(),
                        reason,
                    })
                }
            }
        }
        Ok(counts)
    })
}

/// True if the job has at least one pending batch.
pub fn has_pending(db: &Database, job_id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM batch_progress WHERE job_id = ?1 AND status = 'pending')",
            params![job_id],
            |r| r.get(0),
        )?;
        Ok(exists)
    })
}

/// Open-work counts across the given jobs. Only pending and processing jobs
/// count; batches left behind by terminal jobs are never dispatched.
pub fn open_counts(db: &Database, job_ids: &[String]) -> Result<BatchCounts, DatabaseError> {
    if job_ids.is_empty() {
        return Ok(BatchCounts::default());
    }
    db.with_conn(|conn| {
        let placeholders = (1..=job_ids.len())
            .map(|i| format!("?{}", i))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT
                 COALESCE(SUM(CASE WHEN b.status = 'pending' THEN 1 ELSE 0 END), 0),
                 COALESCE(SUM(CASE WHEN b.status = 'processing' THEN 1 ELSE 0 END), 0)
             FROM batch_progress b
             JOIN batch_jobs j ON j.id = b.job_id
             WHERE b.job_id IN ({}) AND j.status IN ('pending', 'processing')
               AND b.status IN ('pending', 'processing')",
            placeholders
        );
        let (pending, processing): (u32, u32) =
            conn.query_row(&sql, params_from_iter(job_ids.iter()), |r| {
                Ok((r.get(0)?, r.get(1)?))
            })?;
        Ok(BatchCounts {
            pending,
            processing,
            ..Default::default()
        })
    })
}

/// Moves a processing batch to failed. Returns false if it was no longer processing.
pub fn fail_if_processing(db: &Database, batch_id: &str, error: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE batch_progress SET status = 'failed', error_message = ?2, completed_at = ?3
             WHERE id = ?1 AND status = 'processing'",
            params![batch_id, error, now()],
        )?;
        Ok(changed > 0)
    })
}

/// Records a worker's result on a batch that is still processing.
pub fn report_result(db: &Database, report: &BatchReport) -> Result<Option<Batch>, DatabaseError> {
    let data = report
        .data
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| DatabaseError::Corrupt {
            column: "data".to_string(),
            reason: e.to_string(),
        })?;
    let status = match report.outcome {
        BatchOutcome::Completed => BatchStatus::Completed,
        BatchOutcome::Failed => BatchStatus::Failed,
    };

    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "UPDATE batch_progress SET status = ?3,
                 items_processed = COALESCE(?4, items_processed),
                 error_message = ?5, data = COALESCE(?6, data), completed_at = ?7
                 WHERE job_id = ?1 AND batch_number = ?2 AND status = 'processing'
                 RETURNING *",
                params![
                    report.job_id,
                    report.batch_number,
                    status.as_str(),
                    report.items_processed,
                    report.error,
                    data,
                    now()
                ],
                Batch::from_row,
            )
            .optional()?)
    })
}

/// Resets batches processing since before `cutoff` to pending.
pub fn reclaim_stuck(
    db: &Database,
    cutoff: DateTime<Utc>,
    message: &str,
) -> Result<Vec<ReclaimedBatch>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "UPDATE batch_progress SET status = 'pending', started_at = NULL, error_message = ?2
             WHERE status = 'processing' AND started_at IS NOT NULL AND started_at < ?1
             RETURNING id, job_id, batch_number",
        )?;
        let rows = stmt
            .query_map(params![format_timestamp(cutoff), message], |r| {
                Ok(ReclaimedBatch {
                    batch_id: r.get(0)?,
                    job_id: r.get(1)?,
                    batch_number: r.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Deletes every batch row.
pub fn delete_all(conn: &Connection) -> Result<usize, DatabaseError> {
    Ok(conn.execute("DELETE FROM batch_progress", [])?)
}
