//! Batch dispatcher: advances one job by exactly one batch.

use std::sync::Arc;

use serde::Serialize;
use tokio::time::{sleep, Instant};

use crate::broadcast::{BatchEvent, BatchPhase, BatchProgressBroadcaster};
use crate::config::DispatcherConfig;
use crate::db::{batch_repo, job_repo, Database, DatabaseError};
use crate::model::{progress_percentage, Batch, BatchCounts, BatchStatus};
use crate::registry::TaskDefinition;
use crate::retry::RetryPolicy;
use crate::worker::{WorkerInvoker, WorkerRequest};

const GHOST_LOCK_MESSAGE: &str = "Reset: batch was processing without a start time (ghost lock)";

/// Result of one dispatch call.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// The worker marked the batch completed.
    Completed { batch_number: u32 },
    /// The worker marked the batch failed.
    WorkerFailed { batch_number: u32, error: String },
    /// The batch did not finish in time and was forced to failed.
    TimedOut { batch_number: u32 },
    /// The worker never accepted the batch.
    InvocationFailed { batch_number: u32, error: String },
    /// The watchdog returned the batch to pending while we waited.
    Reclaimed { batch_number: u32 },
    /// No pending or processing batches were left; the job is now completed.
    JobCompleted,
    /// No pending batch, but another dispatcher still holds one.
    InFlight,
    /// The job is missing or aborted.
    Skipped,
}

impl DispatchOutcome {
    /// Batch claimed by this call, if any.
    pub fn batch_number(&self) -> Option<u32> {
        match self {
            DispatchOutcome::Completed { batch_number }
            | DispatchOutcome::WorkerFailed { batch_number, .. }
            | DispatchOutcome::TimedOut { batch_number }
            | DispatchOutcome::InvocationFailed { batch_number, .. }
            | DispatchOutcome::Reclaimed { batch_number } => Some(*batch_number),
            DispatchOutcome::JobCompleted | DispatchOutcome::InFlight | DispatchOutcome::Skipped => {
                None
            }
        }
    }

    /// True if the batch this call dispatched ended up failed.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            DispatchOutcome::WorkerFailed { .. }
                | DispatchOutcome::TimedOut { .. }
                | DispatchOutcome::InvocationFailed { .. }
        )
    }
}

pub struct BatchDispatcher {
    db: Database,
    invoker: Arc<dyn WorkerInvoker>,
    retry: RetryPolicy,
    polling: DispatcherConfig,
    broadcaster: Option<BatchProgressBroadcaster>,
}

impl BatchDispatcher {
    pub fn new(
        db: Database,
        invoker: Arc<dyn WorkerInvoker>,
        retry: RetryPolicy,
        polling: DispatcherConfig,
    ) -> Self {
        Self {
            db,
            invoker,
            retry,
            polling,
            broadcaster: None,
        }
    }

    pub fn with_broadcaster(mut self, broadcaster: BatchProgressBroadcaster) -> Self {
        self.broadcaster = Some(broadcaster);
        self
    }

    fn emit(&self, event: BatchEvent) {
        if let Some(broadcaster) = &self.broadcaster {
            broadcaster.send(event);
        }
    }

    /// Claims the next pending batch of `job_id`, runs it on the task's
    /// worker and waits for the worker to report back.
    ///
    /// Only store errors are returned; worker and timeout failures are
    /// recorded on the batch and reported through the outcome.
    #[tracing::instrument(name = "dispatcher.dispatch", skip(self, task), fields(task = %task.name))]
    pub async fn dispatch_next(
        &self,
        job_id: &str,
        task: &TaskDefinition,
    ) -> Result<DispatchOutcome, DatabaseError> {
        match job_repo::find_by_id(&self.db, job_id)? {
            None => {
                log::warn!("Job {} no longer exists", job_id);
                return Ok(DispatchOutcome::Skipped);
            }
            Some(job) if job.status.is_terminal() => {
                log::debug!("Job {} is {}, not dispatching", job_id, job.status);
                return Ok(DispatchOutcome::Skipped);
            }
            Some(_) => {}
        }

        let released = batch_repo::release_ghost_locks(&self.db, job_id, GHOST_LOCK_MESSAGE)?;
        if released > 0 {
            log::warn!("Released {} ghost-locked batch(es) of job {}", released, job_id);
            self.emit(BatchEvent::new(
                job_id,
                None,
                BatchPhase::GhostReleased,
                &format!("{} ghost-locked batch(es) reset to pending", released),
            ));
        }

        let Some(batch) = batch_repo::claim_next(&self.db, job_id)? else {
            return self.finish_if_drained(job_id);
        };

        if !job_repo::mark_processing(&self.db, job_id, batch.batch_number)? {
            // Aborted or completed between the status check and the claim
            batch_repo::release_claim(&self.db, &batch.id)?;
            return Ok(DispatchOutcome::Skipped);
        }

        log::info!(
            "Dispatching batch {} of job {} ({} items) to worker {}",
            batch.batch_number,
            job_id,
            batch.total_items,
            task.worker
        );
        self.emit(BatchEvent::new(
            job_id,
            Some(batch.batch_number),
            BatchPhase::Claimed,
            "Batch claimed",
        ));

        let request = WorkerRequest {
            batch_size: task.batch_size,
            start_from: batch.start_from(task.batch_size),
            job_id: job_id.to_string(),
        };
        let label = format!(
            "Worker {} for batch {} of job {}",
            task.worker, batch.batch_number, job_id
        );
        let invoker = &self.invoker;
        let worker = task.worker.as_str();
        let request = &request;
        let invocation = self
            .retry
            .run(&label, |_| async move {
                invoker
                    .invoke(worker, request)
                    .await
                    .and_then(|response| response.into_result())
            })
            .await;

        if let Err(e) = invocation {
            let error = e.to_string();
            batch_repo::fail_if_processing(&self.db, &batch.id, &error)?;
            self.refresh_progress(job_id, Some(&error))?;
            self.emit(BatchEvent::failed(
                job_id,
                batch.batch_number,
                BatchPhase::Failed,
                &error,
            ));
            return Ok(DispatchOutcome::InvocationFailed {
                batch_number: batch.batch_number,
                error,
            });
        }

        self.emit(BatchEvent::new(
            job_id,
            Some(batch.batch_number),
            BatchPhase::Invoked,
            "Worker accepted batch",
        ));

        let outcome = self.await_batch(&batch).await?;
        let error = match &outcome {
            DispatchOutcome::WorkerFailed { error, .. } => Some(error.clone()),
            DispatchOutcome::TimedOut { .. } => Some(timeout_message(&self.polling)),
            _ => None,
        };
        self.refresh_progress(job_id, error.as_deref())?;

        match &outcome {
            DispatchOutcome::Completed { batch_number } => {
                log::info!("Batch {} of job {} completed", batch_number, job_id);
                self.emit(BatchEvent::new(
                    job_id,
                    Some(*batch_number),
                    BatchPhase::Completed,
                    "Batch completed",
                ));
            }
            DispatchOutcome::WorkerFailed { batch_number, error } => {
                log::warn!("Batch {} of job {} failed: {}", batch_number, job_id, error);
                self.emit(BatchEvent::failed(job_id, *batch_number, BatchPhase::Failed, error));
            }
            DispatchOutcome::TimedOut { batch_number } => {
                log::warn!("Batch {} of job {} timed out", batch_number, job_id);
                self.emit(BatchEvent::failed(
                    job_id,
                    *batch_number,
                    BatchPhase::TimedOut,
                    &timeout_message(&self.polling),
                ));
            }
            _ => {}
        }

        Ok(outcome)
    }

    /// Completion detection, re-derived from batch state on every call.
    fn finish_if_drained(&self, job_id: &str) -> Result<DispatchOutcome, DatabaseError> {
        let counts = batch_repo::counts_for_job(&self.db, job_id)?;
        if counts.has_open_work() {
            return Ok(DispatchOutcome::InFlight);
        }

        if job_repo::mark_completed(&self.db, job_id, &counts)? {
            log::info!(
                "Job {} completed: {} batch(es) completed, {} failed",
                job_id,
                counts.completed,
                counts.failed
            );
            self.emit(BatchEvent::new(
                job_id,
                None,
                BatchPhase::JobCompleted,
                "No pending or processing batches left",
            ));
            Ok(DispatchOutcome::JobCompleted)
        } else {
            Ok(DispatchOutcome::Skipped)
        }
    }

    /// Polls the batch until it leaves `processing` or the completion
    /// timeout expires, then forces it to failed.
    async fn await_batch(&self, batch: &Batch) -> Result<DispatchOutcome, DatabaseError> {
        let deadline = Instant::now() + self.polling.completion_timeout();
        let mut wait = self.polling.first_poll();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            sleep(wait.min(remaining)).await;

            if let Some(outcome) = self.observe(batch)? {
                return Ok(outcome);
            }
            if Instant::now() >= deadline {
                break;
            }
            wait = self.polling.poll_interval();
        }

        let message = timeout_message(&self.polling);
        if batch_repo::fail_if_processing(&self.db, &batch.id, &message)? {
            return Ok(DispatchOutcome::TimedOut {
                batch_number: batch.batch_number,
            });
        }

        // Finished between the last poll and the forced failure
        Ok(self.observe(batch)?.unwrap_or(DispatchOutcome::Reclaimed {
            batch_number: batch.batch_number,
        }))
    }

    /// Maps the stored batch state to an outcome, or `None` while still processing.
    fn observe(&self, batch: &Batch) -> Result<Option<DispatchOutcome>, DatabaseError> {
        let batch_number = batch.batch_number;
        let current = batch_repo::find_by_id(&self.db, &batch.id)?;
        Ok(match current.map(|b| (b.status, b.error_message)) {
            Some((BatchStatus::Processing, _)) => None,
            Some((BatchStatus::Completed, _)) => Some(DispatchOutcome::Completed { batch_number }),
            Some((BatchStatus::Failed, error)) => Some(DispatchOutcome::WorkerFailed {
                batch_number,
                error: error.unwrap_or_else(|| "worker reported failure".to_string()),
            }),
            Some((BatchStatus::Pending, _)) | None => {
                Some(DispatchOutcome::Reclaimed { batch_number })
            }
        })
    }

    /// Recomputes the job's batch counters and progress from its batches.
    pub fn refresh_progress(
        &self,
        job_id: &str,
        error: Option<&str>,
    ) -> Result<BatchCounts, DatabaseError> {
        let counts = batch_repo::counts_for_job(&self.db, job_id)?;
        let progress = progress_percentage(counts.completed, counts.total());
        job_repo::update_progress(&self.db, job_id, &counts, progress, error)?;
        Ok(counts)
    }
}

fn timeout_message(polling: &DispatcherConfig) -> String {
    format!(
        "Timeout: batch did not finish within {}s",
        polling.completion_timeout().as_secs()
    )
}
