//! Watchdog: returns batches stuck in `processing` to the queue.

use std::time::Duration;

use serde::Serialize;

use crate::broadcast::{BatchEvent, BatchPhase, BatchProgressBroadcaster};
use crate::db::{batch_repo, job_repo, Database, DatabaseError};
use crate::model::cutoff;

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct RecoveryReport {
    pub recovered_batches: usize,
    /// Distinct jobs owning a recovered batch, in first-seen order.
    pub affected_jobs: Vec<String>,
}

#[derive(Clone)]
pub struct Watchdog {
    db: Database,
    broadcaster: Option<BatchProgressBroadcaster>,
}

impl Watchdog {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            broadcaster: None,
        }
    }

    pub fn with_broadcaster(mut self, broadcaster: BatchProgressBroadcaster) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    /// Resets every batch processing for longer than `threshold` to pending,
    /// and every open job owning one of them to pending. Terminal jobs keep
    /// their status.
    pub fn sweep(&self, threshold: Duration) -> Result<RecoveryReport, DatabaseError> {
        let minutes = threshold.as_secs() / 60;
        let message = format!(
            "Reset by watchdog: processing for more than {} minute(s)",
            minutes
        );
        let reclaimed = batch_repo::reclaim_stuck(&self.db, cutoff(threshold), &message)?;

        let mut affected_jobs: Vec<String> = Vec::new();
        for batch in &reclaimed {
            if !affected_jobs.contains(&batch.job_id) {
                affected_jobs.push(batch.job_id.clone());
            }
            if let Some(broadcaster) = &self.broadcaster {
                broadcaster.send(BatchEvent::new(
                    &batch.job_id,
                    Some(batch.batch_number),
                    BatchPhase::Reclaimed,
                    &message,
                ));
            }
        }

        if reclaimed.is_empty() {
            log::debug!("Watchdog found no stuck batches");
        } else {
            let reset = job_repo::reset_to_pending(&self.db, &affected_jobs)?;
            log::warn!(
                "Watchdog recovered {} stuck batch(es) across {} job(s), {} job(s) reset to pending",
                reclaimed.len(),
                affected_jobs.len(),
                reset
            );
        }

        Ok(RecoveryReport {
            recovered_batches: reclaimed.len(),
            affected_jobs,
        })
    }
}
