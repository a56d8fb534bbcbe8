//! Administrative operations on the job store.

use std::collections::HashMap;

use serde::Serialize;

use crate::db::{batch_repo, job_repo, Database, DatabaseError};
use crate::model::{Job, JobStatus};

const OPEN: [JobStatus; 2] = [JobStatus::Pending, JobStatus::Processing];

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct AbortReport {
    pub aborted: usize,
    #[serde(rename = "jobIds")]
    pub job_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct PurgeReport {
    pub batches_deleted: usize,
    pub jobs_deleted: usize,
}

/// Keeps the newest open job of every job type and aborts the others.
pub fn abort_duplicates(db: &Database) -> Result<AbortReport, DatabaseError> {
    let open = job_repo::list_by_status(db, &OPEN)?;

    let mut by_type: HashMap<&str, Vec<&Job>> = HashMap::new();
    for job in &open {
        by_type.entry(job.job_type.as_str()).or_default().push(job);
    }

    let mut report = AbortReport::default();
    for (job_type, mut jobs) in by_type {
        if jobs.len() < 2 {
            continue;
        }
        jobs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        let keep = jobs[0];
        let superseded: Vec<String> = jobs[1..].iter().map(|j| j.id.clone()).collect();
        let reason = format!("Aborted: superseded by newer job {}", keep.id);
        let aborted = job_repo::abort(db, &superseded, &reason)?;

        log::warn!(
            "Aborted {} duplicate job(s) of type {}, keeping {}",
            aborted,
            job_type,
            keep.id
        );
        report.aborted += aborted;
        report.job_ids.extend(superseded);
    }

    Ok(report)
}

/// Aborts every open job planned at `priority`.
pub fn abort_phase(db: &Database, priority: i32) -> Result<AbortReport, DatabaseError> {
    let ids: Vec<String> = job_repo::list_by_status(db, &OPEN)?
        .into_iter()
        .filter(|j| j.metadata.priority == priority)
        .map(|j| j.id)
        .collect();

    let aborted = job_repo::abort(db, &ids, &format!("Aborted: restart of phase {}", priority))?;
    if aborted > 0 {
        log::info!("Aborted {} job(s) of phase {} for restart", aborted, priority);
    }

    Ok(AbortReport {
        aborted,
        job_ids: ids,
    })
}

/// Deletes all batches, then all jobs.
pub fn purge(db: &Database) -> Result<PurgeReport, DatabaseError> {
    let report = db.with_transaction(|tx| {
        let batches_deleted = batch_repo::delete_all(tx)?;
        let jobs_deleted = job_repo::delete_all(tx)?;
        Ok(PurgeReport {
            batches_deleted,
            jobs_deleted,
        })
    })?;

    log::warn!(
        "Purged {} job(s) and {} batch(es)",
        report.jobs_deleted,
        report.batches_deleted
    );
    Ok(report)
}
