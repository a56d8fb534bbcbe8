//! Continuous processor: a long-lived loop that advances a fixed set of jobs
//! one batch per job per cycle until none of them has open work left.
//!
//! Each launch returns a [`ProcessorHandle`] owned by the caller. Stopping is
//! cooperative: the loop checks the stop signal between dispatches and wakes
//! up from its inter-cycle sleep when it changes. A dispatch already waiting
//! on a worker is allowed to finish.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

use crate::config::ProcessorConfig;
use crate::db::{batch_repo, job_repo, Database, DatabaseError};
use crate::error::OrchestratorError;
use crate::orchestrator::dispatcher::{BatchDispatcher, DispatchOutcome};
use crate::orchestrator::watchdog::Watchdog;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorState {
    Running,
    /// Nothing left to claim but batches are still in flight, or a stop was
    /// requested and the current cycle is finishing.
    Draining,
    Terminated,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorExit {
    /// No owned job has pending or processing batches.
    Drained,
    Stopped,
    /// The open-work query kept failing.
    StoreErrors,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProcessorSummary {
    pub cycles: u64,
    pub dispatches: u64,
    pub recovered_batches: usize,
    pub exit: ProcessorExit,
}

/// Result of dispatching one job outside the loop.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDispatch {
    pub job_id: String,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<DispatchOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Snapshot of a launched processor.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorInfo {
    pub id: String,
    pub job_ids: Vec<String>,
    pub state: ProcessorState,
}

pub struct ProcessorHandle {
    id: String,
    job_ids: Vec<String>,
    state: watch::Receiver<ProcessorState>,
    stop: watch::Sender<bool>,
    task: JoinHandle<ProcessorSummary>,
}

impl ProcessorHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn job_ids(&self) -> &[String] {
        &self.job_ids
    }

    pub fn state(&self) -> ProcessorState {
        *self.state.borrow()
    }

    /// Receiver that observes state changes until the loop exits.
    pub fn watch_state(&self) -> watch::Receiver<ProcessorState> {
        self.state.clone()
    }

    pub fn info(&self) -> ProcessorInfo {
        ProcessorInfo {
            id: self.id.clone(),
            job_ids: self.job_ids.clone(),
            state: self.state(),
        }
    }

    /// Asks the loop to stop after the current dispatch.
    pub fn stop(&self) {
        // The loop may already have exited
        let _ = self.stop.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the loop to exit.
    pub async fn join(self) -> Result<ProcessorSummary, OrchestratorError> {
        self.task
            .await
            .map_err(|e| OrchestratorError::Processor(e.to_string()))
    }
}

pub struct ContinuousProcessor {
    db: Database,
    dispatcher: Arc<BatchDispatcher>,
    watchdog: Watchdog,
    config: ProcessorConfig,
    scheduled_threshold: Duration,
}

impl ContinuousProcessor {
    pub fn new(
        db: Database,
        dispatcher: Arc<BatchDispatcher>,
        watchdog: Watchdog,
        config: ProcessorConfig,
        scheduled_threshold: Duration,
    ) -> Self {
        Self {
            db,
            dispatcher,
            watchdog,
            config,
            scheduled_threshold,
        }
    }

    /// Spawns the loop for `job_ids` on the current tokio runtime.
    pub fn launch(self: &Arc<Self>, job_ids: Vec<String>) -> ProcessorHandle {
        let id = uuid::Uuid::new_v4().to_string();
        let (stop_tx, stop_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(ProcessorState::Running);

        log::info!("Launching processor {} for {} job(s)", id, job_ids.len());

        let processor = Arc::clone(self);
        let owned = job_ids.clone();
        let processor_id = id.clone();
        let span = tracing::info_span!("processor", id = %id);
        let task = tokio::spawn(
            async move {
                processor
                    .run(&processor_id, &owned, stop_rx, state_tx)
                    .await
            }
            .instrument(span),
        );

        ProcessorHandle {
            id,
            job_ids,
            state: state_rx,
            stop: stop_tx,
            task,
        }
    }

    async fn run(
        &self,
        id: &str,
        job_ids: &[String],
        mut stop: watch::Receiver<bool>,
        state: watch::Sender<ProcessorState>,
    ) -> ProcessorSummary {
        let mut summary = ProcessorSummary {
            cycles: 0,
            dispatches: 0,
            recovered_batches: 0,
            exit: ProcessorExit::Drained,
        };
        let mut finished: HashSet<String> = HashSet::new();
        let mut consecutive_errors = 0u32;
        let mut last_sweep = Instant::now();

        loop {
            if *stop.borrow() {
                let _ = state.send(ProcessorState::Draining);
                summary.exit = ProcessorExit::Stopped;
                break;
            }

            if last_sweep.elapsed() >= self.config.watchdog_interval() {
                last_sweep = Instant::now();
                match self.watchdog.sweep(self.scheduled_threshold) {
                    Ok(report) => summary.recovered_batches += report.recovered_batches,
                    Err(e) => log::error!("Processor {} watchdog sweep failed: {}", id, e),
                }
            }

            let active: Vec<String> = job_ids
                .iter()
                .filter(|j| !finished.contains(*j))
                .cloned()
                .collect();
            match batch_repo::open_counts(&self.db, &active) {
                Ok(counts) => {
                    consecutive_errors = 0;
                    if !counts.has_open_work() {
                        self.finalize(job_ids, &finished).await;
                        break;
                    }
                    let next = if counts.pending == 0 {
                        ProcessorState::Draining
                    } else {
                        ProcessorState::Running
                    };
                    let _ = state.send(next);

                    for job_id in job_ids {
                        if *stop.borrow() {
                            break;
                        }
                        self.advance(id, job_id, &mut finished, &mut summary).await;
                    }
                }
                Err(e) => {
                    consecutive_errors += 1;
                    log::error!(
                        "Processor {} could not read open work ({}/{}): {}",
                        id,
                        consecutive_errors,
                        self.config.max_consecutive_errors,
                        e
                    );
                    if consecutive_errors >= self.config.max_consecutive_errors {
                        summary.exit = ProcessorExit::StoreErrors;
                        break;
                    }
                }
            }

            summary.cycles += 1;

            tokio::select! {
                _ = tokio::time::sleep(self.config.cycle_sleep()) => {},
                Ok(()) = stop.changed() => {},
            }
        }

        let _ = state.send(ProcessorState::Terminated);
        log::info!(
            "Processor {} terminated ({:?}) after {} cycle(s), {} dispatch(es)",
            id,
            summary.exit,
            summary.cycles,
            summary.dispatches
        );
        summary
    }

    /// Dispatches one batch of `job_id` if it has one pending, or lets the
    /// dispatcher complete it once it has no open work.
    async fn advance(
        &self,
        id: &str,
        job_id: &str,
        finished: &mut HashSet<String>,
        summary: &mut ProcessorSummary,
    ) {
        if finished.contains(job_id) {
            return;
        }
        let counts = match batch_repo::counts_for_job(&self.db, job_id) {
            Ok(counts) => counts,
            Err(e) => {
                log::error!("Processor {} could not read job {}: {}", id, job_id, e);
                return;
            }
        };
        if counts.pending == 0 && counts.processing > 0 {
            return;
        }

        match self.dispatch_job(job_id).await {
            Ok(outcome) => {
                if outcome.batch_number().is_some() {
                    summary.dispatches += 1;
                }
                if matches!(outcome, DispatchOutcome::JobCompleted | DispatchOutcome::Skipped) {
                    finished.insert(job_id.to_string());
                }
            }
            Err(e) => log::error!("Processor {} dispatch for job {} failed: {}", id, job_id, e),
        }
    }

    /// Lets the dispatcher record completion for jobs drained since their last dispatch.
    async fn finalize(&self, job_ids: &[String], finished: &HashSet<String>) {
        for job_id in job_ids.iter().filter(|j| !finished.contains(*j)) {
            if let Err(e) = self.dispatch_job(job_id).await {
                log::error!("Could not finalize job {}: {}", job_id, e);
            }
        }
    }

    /// Advances a job by one batch, using the task snapshot it was planned
    /// from so that batch offsets match the planned layout.
    pub async fn dispatch_job(&self, job_id: &str) -> Result<DispatchOutcome, DatabaseError> {
        let Some(job) = job_repo::find_by_id(&self.db, job_id)? else {
            return Ok(DispatchOutcome::Skipped);
        };
        let task = job.metadata.to_task();
        self.dispatcher.dispatch_next(job_id, &task).await
    }

    /// One dispatch per job, in order. Errors are reported per job.
    pub async fn dispatch_round(&self, job_ids: &[String]) -> Vec<JobDispatch> {
        let mut results = Vec::with_capacity(job_ids.len());
        for job_id in job_ids {
            let result = match self.dispatch_job(job_id).await {
                Ok(outcome) => JobDispatch {
                    job_id: job_id.clone(),
                    outcome: Some(outcome),
                    error: None,
                },
                Err(e) => {
                    log::error!("Dispatch for job {} failed: {}", job_id, e);
                    JobDispatch {
                        job_id: job_id.clone(),
                        outcome: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            results.push(result);
        }
        results
    }
}
