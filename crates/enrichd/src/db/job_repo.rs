//! Job repository: operations on the `batch_jobs` table.

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use super::{get_json, get_opt_timestamp, get_parsed, get_timestamp, Database, DatabaseError};
use crate::model::{format_timestamp, Batch, BatchCounts, Job, JobMetadata, JobStatus};

impl Job {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let metadata: Option<JobMetadata> = get_json(row, "metadata")?;
        let metadata = metadata.ok_or_else(|| {
            rusqlite::Error::InvalidColumnType(
                0,
                "metadata".to_string(),
                rusqlite::types::Type::Null,
            )
        })?;

        Ok(Self {
            id: row.get("id")?,
            job_type: row.get("job_type")?,
            status: get_parsed(row, "status")?,
            total_batches: row.get("total_batches")?,
            completed_batches: row.get("completed_batches")?,
            failed_batches: row.get("failed_batches")?,
            current_batch: row.get("current_batch")?,
            progress_percentage: row.get("progress_percentage")?,
            metadata,
            error_message: row.get("error_message")?,
            created_at: get_timestamp(row, "created_at")?,
            started_at: get_opt_timestamp(row, "started_at")?,
            completed_at: get_opt_timestamp(row, "completed_at")?,
            updated_at: get_timestamp(row, "updated_at")?,
        })
    }
}

fn now() -> String {
    format_timestamp(Utc::now())
}

fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn insert_row(conn: &Connection, job: &Job) -> Result<(), DatabaseError> {
    let metadata = serde_json::to_string(&job.metadata).map_err(|e| DatabaseError::Corrupt {
        column: "metadata".to_string(),
        reason: e.to_string(),
    })?;

    conn.execute(
        "INSERT INTO batch_jobs (id, job_type, status, total_batches, completed_batches,
         failed_batches, current_batch, progress_percentage, metadata, error_message,
         created_at, started_at, completed_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            job.id,
            job.job_type,
            job.status.as_str(),
            job.total_batches,
            job.completed_batches,
            job.failed_batches,
            job.current_batch,
            job.progress_percentage,
            metadata,
            job.error_message,
            format_timestamp(job.created_at),
            job.started_at.map(format_timestamp),
            job.completed_at.map(format_timestamp),
            format_timestamp(job.updated_at),
        ],
    )?;
    Ok(())
}

/// Inserts a job row.
pub fn insert(db: &Database, job: &Job) -> Result<(), DatabaseError> {
    db.with_conn(|conn| insert_row(conn, job))
}

/// Inserts a job together with all of its batches in one transaction.
pub fn insert_with_batches(db: &Database, job: &Job, batches: &[Batch]) -> Result<(), DatabaseError> {
    db.with_transaction(|tx| {
        insert_row(tx, job)?;
        for batch in batches {
            super::batch_repo::insert_row(tx, batch)?;
        }
        Ok(())
    })
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<Job>, DatabaseError> {
    db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT * FROM batch_jobs WHERE id = ?1",
                params![id],
                Job::from_row,
            )
            .optional()?)
    })
}

/// Most recently created jobs first.
pub fn list_recent(db: &Database, limit: u32) -> Result<Vec<Job>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT * FROM batch_jobs ORDER BY created_at DESC, id LIMIT ?1")?;
        let rows = stmt
            .query_map(params![limit], Job::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Jobs in any of the given statuses, oldest first.
pub fn list_by_status(db: &Database, statuses: &[JobStatus]) -> Result<Vec<Job>, DatabaseError> {
    if statuses.is_empty() {
        return Ok(Vec::new());
    }
    db.with_conn(|conn| {
        let sql = format!(
            "SELECT * FROM batch_jobs WHERE status IN ({}) ORDER BY created_at ASC, id",
            placeholders(1, statuses.len())
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(statuses.iter().map(|s| s.as_str())), Job::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Counts jobs with the given status.
pub fn count_by_status(db: &Database, status: JobStatus) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM batch_jobs WHERE status = ?1",
            params![status.as_str()],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Marks an open job as processing the given batch. Terminal jobs are left alone.
pub fn mark_processing(
    db: &Database,
    id: &str,
    current_batch: u32,
) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let ts = now();
        let changed = conn.execute(
            "UPDATE batch_jobs SET status = 'processing', current_batch = ?2,
             started_at = COALESCE(started_at, ?3), updated_at = ?3
             WHERE id = ?1 AND status IN ('pending', 'processing')",
            params![id, current_batch, ts],
        )?;
        Ok(changed > 0)
    })
}

/// Persists batch counts and the derived progress percentage.
pub fn update_progress(
    db: &Database,
    id: &str,
    counts: &BatchCounts,
    progress_percentage: u32,
    error_message: Option<&str>,
) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE batch_jobs SET completed_batches = ?2, failed_batches = ?3,
             progress_percentage = ?4, error_message = COALESCE(?5, error_message),
             updated_at = ?6
             WHERE id = ?1",
            params![
                id,
                counts.completed,
                counts.failed,
                progress_percentage,
                error_message,
                now()
            ],
        )?;
        Ok(())
    })
}

/// Marks an open job completed with progress 100.
pub fn mark_completed(db: &Database, id: &str, counts: &BatchCounts) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let ts = now();
        let changed = conn.execute(
            "UPDATE batch_jobs SET status = 'completed', completed_batches = ?2,
             failed_batches = ?3, progress_percentage = 100, completed_at = ?4, updated_at = ?4
             WHERE id = ?1 AND status IN ('pending', 'processing')",
            params![id, counts.completed, counts.failed, ts],
        )?;
        Ok(changed > 0)
    })
}

/// Marks the given jobs aborted, recording the reason. Returns rows changed.
pub fn abort(db: &Database, ids: &[String], reason: &str) -> Result<usize, DatabaseError> {
    if ids.is_empty() {
        return Ok(0);
    }
    db.with_conn(|conn| {
        let sql = format!(
            "UPDATE batch_jobs SET status = 'aborted', error_message = ?1,
             completed_at = ?2, updated_at = ?2
             WHERE id IN ({}) AND status IN ('pending', 'processing')",
            placeholders(3, ids.len())
        );
        let ts = now();
        let mut values: Vec<&dyn rusqlite::ToSql> = vec![&reason, &ts];
        values.extend(ids.iter().map(|id| id as &dyn rusqlite::ToSql));
        Ok(conn.execute(&sql, values.as_slice())?)
    })
}

/// Resets the given open jobs to pending so they get picked up again.
/// Completed, failed and aborted jobs keep their status.
pub fn reset_to_pending(db: &Database, ids: &[String]) -> Result<usize, DatabaseError> {
    if ids.is_empty() {
        return Ok(0);
    }
    db.with_conn(|conn| {
        let sql = format!(
            "UPDATE batch_jobs SET status = 'pending', completed_at = NULL, updated_at = ?1
             WHERE id IN ({}) AND status IN ('pending', 'processing')",
            placeholders(2, ids.len())
        );
        let ts = now();
        let mut values: Vec<&dyn rusqlite::ToSql> = vec![&ts];
        values.extend(ids.iter().map(|id| id as &dyn rusqlite::ToSql));
        Ok(conn.execute(&sql, values.as_slice())?)
    })
}

/// Marks aborted or failed jobs created before `cutoff` as completed.
pub fn complete_stale_failures(db: &Database, cutoff: DateTime<Utc>) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let ts = now();
        Ok(conn.execute(
            "UPDATE batch_jobs SET status = 'completed', completed_at = COALESCE(completed_at, ?2),
             updated_at = ?2
             WHERE status IN ('aborted', 'failed') AND created_at < ?1",
            params![format_timestamp(cutoff), ts],
        )?)
    })
}

/// Deletes every job row. Batches must be deleted first.
pub fn delete_all(conn: &Connection) -> Result<usize, DatabaseError> {
    Ok(conn.execute("DELETE FROM batch_jobs", [])?)
}
