//! Control surface: one entry point per operator action.
//!
//! Every action answers with a JSON body `{success, ...}` and an HTTP status.
//! The same [`Orchestrator`] backs the CLI subcommands and the HTTP server.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::broadcast::BatchProgressBroadcaster;
use crate::config::Config;
use crate::db::batch_repo::{self, BatchReport};
use crate::db::{job_repo, CollectionCounter, Database, SqliteCollectionCounter};
use crate::error::{EnrichError, OrchestratorError};
use crate::model::{Batch, Job, JobStatus};
use crate::orchestrator::{
    admin, AbortReport, BatchDispatcher, ContinuousProcessor, JobDispatch, JobPlanner,
    ProcessorHandle, ProcessorInfo, ProcessorState, ProcessorSummary, PurgeReport,
    RecoveryReport, TaskPlan, Watchdog,
};
use crate::registry::{TaskFilter, TaskRegistry};
use crate::worker::{HttpWorkerInvoker, WorkerInvoker};

/// Number of tasks the `test` action plans when none are configured.
const DEFAULT_SMOKE_TEST_TASKS: usize = 2;

/// An operator request, tagged by `action`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlRequest {
    Start {
        #[serde(default)]
        phase: Option<i32>,
        #[serde(default, rename = "taskName")]
        task_name: Option<String>,
    },
    Status,
    Continue,
    Recover,
    AbortDuplicates,
    Restart {
        phase: i32,
    },
    ClearAll,
    Test,
}

/// Response wrapper for control actions.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

/// HTTP status plus JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlReply {
    pub status: u16,
    pub body: Value,
}

impl ControlReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    fn from_result<T: Serialize>(result: Result<T, OrchestratorError>) -> Self {
        match result {
            Ok(data) => match serde_json::to_value(ApiResponse::ok(data)) {
                Ok(body) => Self { status: 200, body },
                Err(e) => Self::error(500, &e.to_string()),
            },
            Err(e) => {
                let status = if e.is_client_error() { 400 } else { 500 };
                if status == 500 {
                    log::error!("Control action failed: {}", e);
                }
                Self::error(status, &e.to_string())
            }
        }
    }

    fn error(status: u16, message: &str) -> Self {
        Self {
            status,
            body: serde_json::json!({ "success": false, "error": message }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StartResult {
    pub tasks: Vec<TaskPlan>,
    #[serde(rename = "jobIds")]
    pub job_ids: Vec<String>,
    /// True when a background processor was launched for the new jobs.
    pub worker_active: bool,
    #[serde(rename = "processorId", skip_serializing_if = "Option::is_none")]
    pub processor_id: Option<String>,
    /// Inline dispatches, when running without a background processor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dispatches: Option<Vec<JobDispatch>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestartResult {
    pub aborted: usize,
    #[serde(flatten)]
    pub start: StartResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobView {
    #[serde(flatten)]
    pub job: Job,
    pub batches: Vec<Batch>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResult {
    pub jobs: Vec<JobView>,
    pub processors: Vec<ProcessorInfo>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContinueResult {
    pub recovered_batches: usize,
    pub affected_jobs: Vec<String>,
    pub dispatches: Vec<JobDispatch>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearResult {
    #[serde(flatten)]
    pub purged: PurgeReport,
    pub processors_stopped: usize,
}

pub struct Orchestrator {
    db: Database,
    config: Config,
    registry: Arc<TaskRegistry>,
    planner: JobPlanner,
    watchdog: Watchdog,
    processor: Arc<ContinuousProcessor>,
    broadcaster: BatchProgressBroadcaster,
    processors: Mutex<Vec<ProcessorHandle>>,
}

impl Orchestrator {
    pub fn new(
        db: Database,
        config: Config,
        invoker: Arc<dyn WorkerInvoker>,
        counter: Arc<dyn CollectionCounter>,
    ) -> Result<Self, EnrichError> {
        let registry = Arc::new(TaskRegistry::new(config.tasks.clone())?);
        let broadcaster = BatchProgressBroadcaster::default();

        let planner = JobPlanner::new(
            db.clone(),
            Arc::clone(&registry),
            counter,
            config.planner.stale_job_horizon(),
        );
        let dispatcher = Arc::new(
            BatchDispatcher::new(
                db.clone(),
                invoker,
                config.retry.policy(),
                config.dispatcher.clone(),
            )
            .with_broadcaster(broadcaster.clone()),
        );
        let watchdog = Watchdog::new(db.clone()).with_broadcaster(broadcaster.clone());
        let processor = Arc::new(ContinuousProcessor::new(
            db.clone(),
            dispatcher,
            watchdog.clone(),
            config.processor.clone(),
            config.watchdog.scheduled_threshold(),
        ));

        log::info!("Orchestrator ready with {} task(s)", registry.len());

        Ok(Self {
            db,
            config,
            registry,
            planner,
            watchdog,
            processor,
            broadcaster,
            processors: Mutex::new(Vec::new()),
        })
    }

    /// Builds an orchestrator that calls workers over HTTP and counts
    /// collections in the same database as the job store.
    pub fn from_config(db: Database, config: Config) -> Result<Self, EnrichError> {
        let invoker = Arc::new(HttpWorkerInvoker::from_config(&config.worker)?);
        let counter = Arc::new(SqliteCollectionCounter::new(db.clone()));
        Self::new(db, config, invoker, counter)
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn broadcaster(&self) -> &BatchProgressBroadcaster {
        &self.broadcaster
    }

    /// Runs one control action.
    pub async fn handle(&self, request: ControlRequest) -> ControlReply {
        log::debug!("Control request: {:?}", request);
        match request {
            ControlRequest::Start { phase, task_name } => {
                ControlReply::from_result(self.start(phase, task_name).await)
            }
            ControlRequest::Status => ControlReply::from_result(self.status().await),
            ControlRequest::Continue => ControlReply::from_result(self.continue_jobs().await),
            ControlRequest::Recover => ControlReply::from_result(self.recover()),
            ControlRequest::AbortDuplicates => ControlReply::from_result(self.abort_duplicates()),
            ControlRequest::Restart { phase } => {
                ControlReply::from_result(self.restart(phase).await)
            }
            ControlRequest::ClearAll => ControlReply::from_result(self.clear_all().await),
            ControlRequest::Test => ControlReply::from_result(self.smoke_test().await),
        }
    }

    /// Records a worker's result for a batch that is still processing.
    pub fn report_batch(&self, report: &BatchReport) -> Result<Batch, OrchestratorError> {
        batch_repo::report_result(&self.db, report)?.ok_or_else(|| {
            OrchestratorError::InvalidRequest(format!(
                "batch {} of job {} is not processing",
                report.batch_number, report.job_id
            ))
        })
    }

    pub fn handle_report(&self, report: &BatchReport) -> ControlReply {
        ControlReply::from_result(self.report_batch(report))
    }

    pub async fn start(
        &self,
        phase: Option<i32>,
        task_name: Option<String>,
    ) -> Result<StartResult, OrchestratorError> {
        let filter = match (phase, task_name) {
            (Some(_), Some(_)) => {
                return Err(OrchestratorError::InvalidRequest(
                    "phase and taskName are mutually exclusive".to_string(),
                ))
            }
            (None, Some(name)) => TaskFilter::Named(name),
            (Some(phase), None) => TaskFilter::Phase(phase),
            (None, None) => TaskFilter::All,
        };
        self.plan_and_launch(&filter).await
    }

    pub async fn status(&self) -> Result<StatusResult, OrchestratorError> {
        let jobs = job_repo::list_recent(&self.db, self.config.status_limit)?
            .into_iter()
            .map(|job| -> Result<JobView, OrchestratorError> {
                let batches = batch_repo::list_for_job(&self.db, &job.id)?;
                Ok(JobView { job, batches })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let processors = self
            .processors
            .lock()
            .await
            .iter()
            .map(ProcessorHandle::info)
            .collect();

        Ok(StatusResult { jobs, processors })
    }

    /// Watchdog sweep, then one dispatch for every open job.
    pub async fn continue_jobs(&self) -> Result<ContinueResult, OrchestratorError> {
        let recovery = self
            .watchdog
            .sweep(self.config.watchdog.scheduled_threshold())?;

        let open: Vec<String> =
            job_repo::list_by_status(&self.db, &[JobStatus::Pending, JobStatus::Processing])?
                .into_iter()
                .map(|j| j.id)
                .collect();
        let dispatches = self.processor.dispatch_round(&open).await;

        Ok(ContinueResult {
            recovered_batches: recovery.recovered_batches,
            affected_jobs: recovery.affected_jobs,
            dispatches,
        })
    }

    pub fn recover(&self) -> Result<RecoveryReport, OrchestratorError> {
        Ok(self.watchdog.sweep(self.config.watchdog.manual_threshold())?)
    }

    pub fn abort_duplicates(&self) -> Result<AbortReport, OrchestratorError> {
        Ok(admin::abort_duplicates(&self.db)?)
    }

    /// Aborts the open jobs of a phase and plans it again.
    pub async fn restart(&self, phase: i32) -> Result<RestartResult, OrchestratorError> {
        let aborted = admin::abort_phase(&self.db, phase)?;
        let start = self.plan_and_launch(&TaskFilter::Phase(phase)).await?;
        Ok(RestartResult {
            aborted: aborted.aborted,
            start,
        })
    }

    /// Stops every processor launched here, then deletes all jobs and batches.
    pub async fn clear_all(&self) -> Result<ClearResult, OrchestratorError> {
        let handles = std::mem::take(&mut *self.processors.lock().await);
        for handle in &handles {
            handle.stop();
        }
        let purged = admin::purge(&self.db)?;
        Ok(ClearResult {
            purged,
            processors_stopped: handles.len(),
        })
    }

    /// Plans a small subset of tasks to exercise the pipeline end to end.
    pub async fn smoke_test(&self) -> Result<StartResult, OrchestratorError> {
        let names: Vec<String> = if self.config.smoke_test_tasks.is_empty() {
            self.registry
                .all()
                .iter()
                .take(DEFAULT_SMOKE_TEST_TASKS)
                .map(|t| t.name.clone())
                .collect()
        } else {
            self.config.smoke_test_tasks.clone()
        };
        if names.is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "no tasks configured".to_string(),
            ));
        }
        log::info!("Smoke test with task(s): {}", names.join(", "));
        self.plan_and_launch(&TaskFilter::Names(names)).await
    }

    /// Waits for every launched processor to exit, then forgets them.
    ///
    /// Handles stay registered while waiting so that [`stop_all`](Self::stop_all)
    /// still reaches them.
    pub async fn wait_for_processors(&self) -> Vec<Result<ProcessorSummary, OrchestratorError>> {
        let watchers: Vec<_> = self
            .processors
            .lock()
            .await
            .iter()
            .map(ProcessorHandle::watch_state)
            .collect();
        for mut state in watchers {
            // Errors once the loop has dropped its sender, which also means it exited
            let _ = state.wait_for(|s| *s == ProcessorState::Terminated).await;
        }

        let handles = std::mem::take(&mut *self.processors.lock().await);
        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            summaries.push(handle.join().await);
        }
        summaries
    }

    /// Asks every launched processor to stop, without waiting.
    pub async fn stop_all(&self) {
        for handle in self.processors.lock().await.iter() {
            handle.stop();
        }
    }

    async fn plan_and_launch(&self, filter: &TaskFilter) -> Result<StartResult, OrchestratorError> {
        let plan = self.planner.plan(filter)?;
        let mut result = StartResult {
            tasks: plan.tasks,
            job_ids: plan.job_ids,
            worker_active: false,
            processor_id: None,
            dispatches: None,
        };
        if result.job_ids.is_empty() {
            log::info!("Nothing to enrich");
            return Ok(result);
        }

        if self.config.processor.background {
            let handle = self.processor.launch(result.job_ids.clone());
            result.processor_id = Some(handle.id().to_string());
            result.worker_active = true;

            let mut processors = self.processors.lock().await;
            processors.retain(|h| !h.is_finished());
            processors.push(handle);
        } else {
            log::warn!(
                "Background processing disabled, dispatching one batch per job inline"
            );
            result.dispatches = Some(self.processor.dispatch_round(&result.job_ids).await);
        }

        Ok(result)
    }
}
